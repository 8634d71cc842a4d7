//! Typed errors for pricing, trading, settlement and storage.
//!
//! Every rejected trade carries a specific reason so callers can tell
//! "add funds" apart from "market closed" apart from "try again".

use thiserror::Error;

use super::market::MarketStatus;
use super::trade::MarketId;

/// Invalid inputs to the pricing engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PricingError {
    #[error("liquidity parameter b must be positive and finite, got {0}")]
    InvalidLiquidity(f64),

    #[error("exposure vector must not be empty")]
    EmptyOutcomes,

    #[error("outcome index {index} out of range for {outcomes} outcomes")]
    InvalidOutcome { index: usize, outcomes: usize },

    #[error("exposure {exposure} overflows at liquidity {b}")]
    ExposureOverflow { exposure: f64, b: f64 },
}

/// Storage port failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A compare-and-swap commit lost against a concurrent writer.
    #[error("version conflict on {entity} {id}: expected {expected}, found {found}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("market {0} already exists")]
    MarketExists(MarketId),

    #[error("market {0} not found")]
    MarketNotFound(MarketId),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Reasons a trade request is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradeError {
    /// Market is missing (`status == None`), closed or settled.
    #[error("market {market_id} is not tradable ({})", status_label(.status))]
    MarketNotTradable {
        market_id: MarketId,
        status: Option<MarketStatus>,
    },

    #[error("outcome index {index} out of range for {outcomes} outcomes")]
    InvalidOutcome { index: usize, outcomes: usize },

    #[error("share quantity must be non-zero and finite, got {0}")]
    InvalidQuantity(f64),

    #[error("insufficient shares: requested {requested}, held {held}")]
    InsufficientShares { requested: f64, held: f64 },

    #[error("insufficient balance: cost {cost:.4}, balance {balance:.4}")]
    InsufficientBalance { cost: f64, balance: f64 },

    #[error("concurrent modification on market {market_id} after {attempts} attempts")]
    ConcurrentModificationConflict { market_id: MarketId, attempts: u32 },

    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error(transparent)]
    Store(StoreError),
}

impl TradeError {
    /// Stable machine-readable code, also used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MarketNotTradable { .. } => "market_not_tradable",
            Self::InvalidOutcome { .. } => "invalid_outcome",
            Self::InvalidQuantity(_) => "invalid_quantity",
            Self::InsufficientShares { .. } => "insufficient_shares",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::ConcurrentModificationConflict { .. } => "concurrent_modification_conflict",
            Self::Pricing(_) => "pricing",
            Self::Store(_) => "store",
        }
    }

    /// Whether the caller may reasonably resubmit the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModificationConflict { .. })
    }
}

impl From<StoreError> for TradeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MarketNotFound(market_id) => Self::MarketNotTradable {
                market_id,
                status: None,
            },
            other => Self::Store(other),
        }
    }
}

/// Reasons a settlement or close request is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettlementError {
    #[error("market {0} not found")]
    MarketNotFound(MarketId),

    #[error("market {0} is already settled")]
    AlreadySettled(MarketId),

    #[error("outcome index {index} out of range for {outcomes} outcomes")]
    InvalidOutcome { index: usize, outcomes: usize },

    #[error("concurrent modification on market {market_id} after {attempts} attempts")]
    ConcurrentModificationConflict { market_id: MarketId, attempts: u32 },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SettlementError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MarketNotFound(id) => Self::MarketNotFound(id),
            other => Self::Store(other),
        }
    }
}

fn status_label(status: &Option<MarketStatus>) -> String {
    match status {
        Some(s) => s.to_string(),
        None => "not found".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_error_kinds_are_distinct() {
        let closed = TradeError::MarketNotTradable {
            market_id: "m1".to_string(),
            status: Some(MarketStatus::Closed),
        };
        let funds = TradeError::InsufficientBalance {
            cost: 10.0,
            balance: 1.0,
        };
        let conflict = TradeError::ConcurrentModificationConflict {
            market_id: "m1".to_string(),
            attempts: 3,
        };
        assert_eq!(closed.kind(), "market_not_tradable");
        assert_eq!(funds.kind(), "insufficient_balance");
        assert!(conflict.is_retryable());
        assert!(!funds.is_retryable());
    }

    #[test]
    fn test_missing_market_maps_to_not_tradable() {
        let err: TradeError = StoreError::MarketNotFound("gone".to_string()).into();
        assert_eq!(
            err,
            TradeError::MarketNotTradable {
                market_id: "gone".to_string(),
                status: None,
            }
        );
        assert!(err.to_string().contains("not found"));
    }
}
