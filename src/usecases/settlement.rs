//! Settlement Use Case - Market Resolution and Payout
//!
//! Settlement flow:
//! 1. Take the market lock (trades on this market wait behind it)
//! 2. Validate the market and the declared winner
//! 3. Credit every holder of the winning outcome one token per share
//! 4. Commit status, winner and all balance changes in one store commit
//!
//! A lost compare-and-swap (a holder traded in another market between
//! read and commit) re-reads holders and retries a bounded number of
//! times. Positions in the settled market are left in place as a record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::adapters::metrics::ExchangeMetrics;
use crate::config::AppConfig;
use crate::domain::account::SHARE_DUST;
use crate::domain::error::{SettlementError, StoreError};
use crate::domain::{MarketId, MarketStatus, UserId};
use crate::ports::store::{AccountWrite, MarketCommit, MarketStore, MarketWrite};

use super::locks::ExchangeLocks;

/// One holder credited at settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
  pub user_id: UserId,
  /// Winning shares held, paid one token each.
  pub amount: f64,
}

/// Result of settling one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
  pub market_id: MarketId,
  pub winning_outcome: usize,
  /// Holders of the winning outcome and what each received.
  pub payouts: Vec<Payout>,
  /// Accounts holding any position in the market.
  pub holders: usize,
  pub total_payout: f64,
  pub settled_at: DateTime<Utc>,
}

/// Settles and closes markets against a `MarketStore`.
pub struct Settlement<S: MarketStore> {
  store: Arc<S>,
  locks: Arc<ExchangeLocks>,
  /// Retries after a version conflict.
  max_retries: u32,
  retry_backoff: Duration,
  metrics: Option<Arc<ExchangeMetrics>>,
}

impl<S: MarketStore> Settlement<S> {
  /// Create a settlement manager sharing the executor's locks.
  pub fn new(store: Arc<S>, locks: Arc<ExchangeLocks>, config: &AppConfig) -> Self {
    Self {
      store,
      locks,
      max_retries: config.executor.max_retries,
      retry_backoff: Duration::from_millis(config.executor.retry_backoff_ms),
      metrics: None,
    }
  }

  /// Record settlement metrics into `metrics`.
  pub fn with_metrics(mut self, metrics: Arc<ExchangeMetrics>) -> Self {
    self.metrics = Some(metrics);
    self
  }

  /// Declare `winning_outcome` and pay out every holder of it.
  ///
  /// Open and closed markets can be settled; a settled market cannot.
  #[instrument(skip(self), fields(market_id = %market_id))]
  pub async fn settle(
    &self,
    market_id: &MarketId,
    winning_outcome: usize,
  ) -> Result<SettlementReport, SettlementError> {
    let market_guard = self.locks.markets.lock(market_id).await;
    let result = self.settle_locked(market_id, winning_outcome).await;
    self.locks.markets.release(market_id, market_guard);
    result
  }

  async fn settle_locked(
    &self,
    market_id: &MarketId,
    winning_outcome: usize,
  ) -> Result<SettlementReport, SettlementError> {
    let mut attempt: u32 = 0;
    let report = loop {
      attempt += 1;
      match self.settle_once(market_id, winning_outcome).await {
        Err(SettlementError::Store(StoreError::VersionConflict { entity, id, .. })) => {
          if attempt > self.max_retries {
            warn!(attempts = attempt, "Settlement gave up after repeated conflicts");
            return Err(SettlementError::ConcurrentModificationConflict {
              market_id: market_id.clone(),
              attempts: attempt,
            });
          }
          debug!(attempt, entity, id = %id, "Settlement conflict, retrying");
          if let Some(m) = &self.metrics {
            m.commit_retries.inc();
          }
          tokio::time::sleep(self.retry_backoff * attempt).await;
        }
        other => break other?,
      }
    };

    info!(
      winning_outcome,
      holders = report.holders,
      paid = report.payouts.len(),
      total_payout = report.total_payout,
      "Market settled"
    );
    if let Some(m) = &self.metrics {
      m.settlements.inc();
      m.payouts.inc_by(report.total_payout);
    }

    Ok(report)
  }

  async fn settle_once(
    &self,
    market_id: &MarketId,
    winning_outcome: usize,
  ) -> Result<SettlementReport, SettlementError> {
    let market = self
      .store
      .market(market_id)
      .await?
      .ok_or_else(|| SettlementError::MarketNotFound(market_id.clone()))?;

    if market.value.status == MarketStatus::Settled {
      return Err(SettlementError::AlreadySettled(market_id.clone()));
    }
    let outcomes = market.value.outcome_count();
    if winning_outcome >= outcomes {
      return Err(SettlementError::InvalidOutcome {
        index: winning_outcome,
        outcomes,
      });
    }

    let holders = self.store.holders(market_id).await?;
    let holder_count = holders.len();

    let mut payouts = Vec::new();
    let mut accounts = Vec::new();
    for holder in holders {
      let amount = holder.value.shares(market_id, winning_outcome);
      if amount <= SHARE_DUST {
        continue;
      }
      let mut account = holder.value;
      account.balance += amount;
      payouts.push(Payout {
        user_id: account.user_id.clone(),
        amount,
      });
      accounts.push(AccountWrite {
        account,
        expected_version: holder.version,
      });
    }

    let mut settled = market.value;
    settled.status = MarketStatus::Settled;
    settled.winning_outcome = Some(winning_outcome);

    self
      .store
      .commit_market(MarketCommit {
        market: MarketWrite {
          market: settled,
          expected_version: market.version,
        },
        accounts,
      })
      .await?;

    let total_payout = payouts.iter().map(|p| p.amount).sum();
    Ok(SettlementReport {
      market_id: market_id.clone(),
      winning_outcome,
      payouts,
      holders: holder_count,
      total_payout,
      settled_at: Utc::now(),
    })
  }

  /// Halt trading on an open market ahead of settlement.
  ///
  /// Closing an already closed market is a no-op.
  #[instrument(skip(self), fields(market_id = %market_id))]
  pub async fn close(&self, market_id: &MarketId) -> Result<(), SettlementError> {
    let market_guard = self.locks.markets.lock(market_id).await;
    let result = self.close_locked(market_id).await;
    self.locks.markets.release(market_id, market_guard);
    result
  }

  async fn close_locked(&self, market_id: &MarketId) -> Result<(), SettlementError> {
    let mut attempt: u32 = 0;
    loop {
      attempt += 1;
      let market = self
        .store
        .market(market_id)
        .await?
        .ok_or_else(|| SettlementError::MarketNotFound(market_id.clone()))?;

      match market.value.status {
        MarketStatus::Settled => return Err(SettlementError::AlreadySettled(market_id.clone())),
        MarketStatus::Closed => return Ok(()),
        MarketStatus::Open => {}
      }

      let mut closed = market.value;
      closed.status = MarketStatus::Closed;
      let commit = MarketCommit {
        market: MarketWrite {
          market: closed,
          expected_version: market.version,
        },
        accounts: Vec::new(),
      };

      match self.store.commit_market(commit).await {
        Ok(()) => {
          info!("Market closed");
          return Ok(());
        }
        Err(StoreError::VersionConflict { .. }) if attempt <= self.max_retries => {
          tokio::time::sleep(self.retry_backoff * attempt).await;
        }
        Err(StoreError::VersionConflict { .. }) => {
          return Err(SettlementError::ConcurrentModificationConflict {
            market_id: market_id.clone(),
            attempts: attempt,
          });
        }
        Err(e) => return Err(e.into()),
      }
    }
  }
}
