//! Market entity: outcomes, liquidity, exposure vector and lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::PricingError;
use super::lmsr::LmsrModel;
use super::trade::MarketId;

/// Lifecycle status of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    /// Accepting trades.
    Open,
    /// Trading halted, awaiting settlement.
    Closed,
    /// Winner declared and holders paid out.
    Settled,
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Settled => write!(f, "settled"),
        }
    }
}

/// A multi-outcome prediction market priced by LMSR.
///
/// `outcomes` and `b` never change after creation. `q` changes only
/// through committed trades, one index at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    /// Opaque market identifier.
    pub id: MarketId,
    /// Human-readable question.
    pub question: String,
    /// Ordered outcome labels (N >= 2).
    pub outcomes: Vec<String>,
    /// LMSR liquidity parameter.
    pub b: f64,
    /// Cumulative net shares issued per outcome.
    pub q: Vec<f64>,
    pub status: MarketStatus,
    /// Set once, at settlement.
    pub winning_outcome: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl Market {
    /// Create an open market with a zero exposure vector.
    ///
    /// # Errors
    /// Rejects fewer than two outcomes, blank labels and invalid `b`.
    pub fn new(
        id: impl Into<MarketId>,
        question: impl Into<String>,
        outcomes: Vec<String>,
        b: f64,
    ) -> Result<Self, PricingError> {
        if outcomes.len() < 2 || outcomes.iter().any(|o| o.trim().is_empty()) {
            return Err(PricingError::EmptyOutcomes);
        }
        LmsrModel::new(b)?;

        let n = outcomes.len();
        Ok(Self {
            id: id.into(),
            question: question.into(),
            outcomes,
            b,
            q: vec![0.0; n],
            status: MarketStatus::Open,
            winning_outcome: None,
            created_at: Utc::now(),
        })
    }

    pub fn outcome_count(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_open(&self) -> bool {
        self.status == MarketStatus::Open
    }

    /// Pricing model bound to this market's liquidity.
    pub fn model(&self) -> Result<LmsrModel, PricingError> {
        LmsrModel::new(self.b)
    }

    /// Current implied probabilities.
    pub fn probabilities(&self) -> Result<Vec<f64>, PricingError> {
        self.model()?.probabilities(&self.q)
    }
}
