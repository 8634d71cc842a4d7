//! Keyed Locks - Per-Market and Per-User Mutual Exclusion
//!
//! In-process serialization for the atomic trade transition. A trade
//! holds its market lock and then its user lock; settlement holds only
//! the market lock. User locks are never held while waiting for a
//! market lock, so the ordering cannot deadlock.
//!
//! These locks only order writers inside one process. Writers in other
//! processes are ordered by the store's compare-and-swap commits.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A lazily populated map of async mutexes keyed by id.
#[derive(Debug, Default)]
pub struct KeyedLocks {
  slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `key`.
  ///
  /// The returned guard is owned, so it can move into a spawned task.
  pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
    let slot = {
      let mut slots = self.slots.lock();
      Arc::clone(slots.entry(key.to_string()).or_default())
    };
    slot.lock_owned().await
  }

  /// Release `guard` and drop the slot for `key` unless another task
  /// still holds it or is queued on it.
  pub fn release(&self, key: &str, guard: OwnedMutexGuard<()>) {
    drop(guard);
    let mut slots = self.slots.lock();
    if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
      slots.remove(key);
    }
  }

  pub fn len(&self) -> usize {
    self.slots.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Lock sets shared by every writer in this process.
#[derive(Debug, Default)]
pub struct ExchangeLocks {
  pub markets: KeyedLocks,
  pub users: KeyedLocks,
}

impl ExchangeLocks {
  pub fn new() -> Self {
    Self::default()
  }
}
