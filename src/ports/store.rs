//! Store Port - Versioned Market/Account Documents and Trade Ledger
//!
//! Defines the storage interface the use cases depend on. Markets and
//! accounts are versioned documents; every write is a compare-and-swap
//! against the version the writer read, so any number of executor
//! instances can share one store without lost updates. The trade ledger
//! is append-only and only grows through `commit_trade`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::error::StoreError;
use crate::domain::{Market, MarketId, Trade, UserAccount, UserId};

/// A stored document together with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
  /// Incremented on every committed write.
  pub version: u64,
  pub value: T,
}

impl<T> Versioned<T> {
  pub fn new(version: u64, value: T) -> Self {
    Self { version, value }
  }
}

/// New market document plus the version it was derived from.
#[derive(Debug, Clone)]
pub struct MarketWrite {
  pub market: Market,
  pub expected_version: u64,
}

/// New account document plus the version it was derived from.
#[derive(Debug, Clone)]
pub struct AccountWrite {
  pub account: UserAccount,
  pub expected_version: u64,
}

/// Everything one trade changes, committed all-or-nothing.
#[derive(Debug, Clone)]
pub struct TradeCommit {
  pub market: MarketWrite,
  pub account: AccountWrite,
  /// Ledger entry appended on success.
  pub trade: Trade,
}

/// A market status change plus any balance changes it causes
/// (settlement payouts), committed all-or-nothing.
#[derive(Debug, Clone)]
pub struct MarketCommit {
  pub market: MarketWrite,
  pub accounts: Vec<AccountWrite>,
}

/// Trait for storage providers.
///
/// Implementations must apply `commit_trade` and `commit_market`
/// atomically: either every document and the ledger entry are written
/// and their versions bumped, or nothing is and
/// `StoreError::VersionConflict` is returned.
#[async_trait]
pub trait MarketStore: Send + Sync + 'static {
  /// Insert a new market at version 1.
  async fn create_market(&self, market: Market) -> Result<Versioned<Market>, StoreError>;

  /// Load a market by id.
  async fn market(&self, market_id: &MarketId) -> Result<Option<Versioned<Market>>, StoreError>;

  /// Load every market.
  async fn markets(&self) -> Result<Vec<Versioned<Market>>, StoreError>;

  /// Load an account by user id.
  async fn account(&self, user_id: &UserId) -> Result<Option<Versioned<UserAccount>>, StoreError>;

  /// Load an account, opening it with `starting_balance` if absent.
  async fn ensure_account(
    &self,
    user_id: &UserId,
    starting_balance: f64,
  ) -> Result<Versioned<UserAccount>, StoreError>;

  /// Accounts holding any shares in the market.
  async fn holders(&self, market_id: &MarketId) -> Result<Vec<Versioned<UserAccount>>, StoreError>;

  /// Atomically write market, account and ledger entry for one trade.
  async fn commit_trade(&self, commit: TradeCommit) -> Result<(), StoreError>;

  /// Atomically write a market document and any account documents.
  async fn commit_market(&self, commit: MarketCommit) -> Result<(), StoreError>;

  /// Ledger for one market in commit order.
  async fn trades(&self, market_id: &MarketId) -> Result<Vec<Trade>, StoreError>;

  /// A user's trades, newest first, optionally restricted to one market.
  async fn user_trades(
    &self,
    user_id: &UserId,
    market_id: Option<&MarketId>,
    limit: usize,
  ) -> Result<Vec<Trade>, StoreError>;

  /// Check if the store is reachable.
  async fn is_healthy(&self) -> bool;
}
