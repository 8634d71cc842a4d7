//! Use Cases Layer - Application Business Logic
//!
//! Orchestrates domain logic with port interfaces to implement the
//! exchange's workflows. Each use case is a self-contained business
//! operation.
//!
//! Use cases:
//! - `TradeExecutor`: Validated, atomic LMSR trades
//! - `Settlement`: Market close and winner payout
//! - `MarketService`: Market, ledger, portfolio and quote reads
//! - `ChangePropagator`: Change feed to live subscriber broadcast
//! - `ExchangeLocks`: Per-market and per-user write serialization
//! - `Exchange`: The above wired over one store and lock set

pub mod change_propagator;
pub mod exchange;
pub mod locks;
pub mod market_service;
pub mod settlement;
pub mod trade_executor;

pub use change_propagator::{ChangePropagator, MarketUpdate, PropagatorHandle, SubscriberHub};
pub use exchange::Exchange;
pub use locks::ExchangeLocks;
pub use market_service::MarketService;
pub use settlement::Settlement;
pub use trade_executor::TradeExecutor;
