//! Core trading domain types.
//!
//! Defines trade requests, the immutable ledger record and the results
//! handed back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::Position;

// ────────────────────────────────────────────
// Identifiers
// ────────────────────────────────────────────

/// Opaque market identifier.
pub type MarketId = String;

/// Opaque user identifier, issued by the external identity provider.
pub type UserId = String;

// ────────────────────────────────────────────
// Requests
// ────────────────────────────────────────────

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Side implied by a signed share delta.
    pub fn of(shares_delta: f64) -> Self {
        if shares_delta < 0.0 { Self::Sell } else { Self::Buy }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// A request to move `shares_delta` shares of one outcome.
///
/// Positive deltas buy, negative deltas sell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub market_id: MarketId,
    pub user_id: UserId,
    pub outcome_index: usize,
    pub shares_delta: f64,
}

impl TradeRequest {
    pub fn new(
        market_id: impl Into<MarketId>,
        user_id: impl Into<UserId>,
        outcome_index: usize,
        shares_delta: f64,
    ) -> Self {
        Self {
            market_id: market_id.into(),
            user_id: user_id.into(),
            outcome_index,
            shares_delta,
        }
    }

    /// Build a request from an unsigned share count and a direction.
    pub fn with_side(
        market_id: impl Into<MarketId>,
        user_id: impl Into<UserId>,
        outcome_index: usize,
        shares: f64,
        side: TradeSide,
    ) -> Self {
        let delta = match side {
            TradeSide::Buy => shares,
            TradeSide::Sell => -shares,
        };
        Self::new(market_id, user_id, outcome_index, delta)
    }

    pub fn side(&self) -> TradeSide {
        TradeSide::of(self.shares_delta)
    }
}

// ────────────────────────────────────────────
// Ledger
// ────────────────────────────────────────────

/// A committed trade. Written exactly once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub market_id: MarketId,
    pub user_id: UserId,
    pub outcome_index: usize,
    /// Signed: positive = buy, negative = sell.
    pub shares_delta: f64,
    /// Signed: positive = debit, negative = credit.
    pub cost: f64,
    pub probabilities_before: Vec<f64>,
    pub probabilities_after: Vec<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    pub fn side(&self) -> TradeSide {
        TradeSide::of(self.shares_delta)
    }
}

/// What a successful trade hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub trade: Trade,
    /// Market probabilities after the commit.
    pub probabilities: Vec<f64>,
    /// User balance after the commit.
    pub balance: f64,
    /// User position in this market after the commit.
    pub position: Position,
}

/// Non-binding cost preview for a prospective trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub market_id: MarketId,
    pub outcome_index: usize,
    pub shares_delta: f64,
    pub cost: f64,
    /// Average price per share (|cost / shares|).
    pub average_price: f64,
    pub probabilities_before: Vec<f64>,
    pub probabilities_after: Vec<f64>,
}
