//! Domain layer - Core business logic and models.
//!
//! Pure pricing math and the entities it operates on. No I/O here
//! (hexagonal architecture inner ring). All types are serializable and
//! testable in isolation.

pub mod account;
pub mod analytics;
pub mod error;
pub mod lmsr;
pub mod market;
pub mod trade;

// Re-export core types for convenience
pub use account::{Position, UserAccount};
pub use analytics::MarketAnalytics;
pub use error::{PricingError, SettlementError, StoreError, TradeError};
pub use lmsr::LmsrModel;
pub use market::{Market, MarketStatus};
pub use trade::{MarketId, Quote, Trade, TradeRequest, TradeResult, TradeSide, UserId};
