//! Persistence Adapters - Document Store and Snapshots
//!
//! Implements the `MarketStore` and `ChangeFeed` ports with an
//! in-memory versioned document store, and persists it with atomic
//! JSON snapshots for crash recovery.

pub mod memory;
pub mod snapshot;

pub use memory::{MemoryStore, StoreSnapshot};
pub use snapshot::SnapshotStore;
