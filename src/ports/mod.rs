//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) that the use-case layer requires
//! from the outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `MarketStore`: Versioned documents, CAS commits and the trade ledger
//! - `ChangeFeed`: Ordered, resumable feed of committed market mutations

pub mod change_feed;
pub mod store;
