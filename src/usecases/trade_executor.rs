//! Trade Executor - Validated, Atomic LMSR Trades
//!
//! Prices a trade against the market's current exposure vector and
//! commits market, account and ledger entry as one unit:
//! - Validating: market open, outcome in range, quantity non-zero
//! - Pricing: LMSR cost against `q` read inside the transition
//! - Committing: compare-and-swap write of market + account + trade
//!
//! Serialization is per market and per user inside this process
//! (keyed locks) and across processes (store version checks). A lost
//! compare-and-swap re-reads fresh state and retries a bounded number
//! of times. The executor never publishes events; committed market
//! changes reach viewers through the change feed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::metrics::ExchangeMetrics;
use crate::config::AppConfig;
use crate::domain::account::SHARE_DUST;
use crate::domain::error::{StoreError, TradeError};
use crate::domain::{MarketId, Trade, TradeRequest, TradeResult, TradeSide, UserAccount, UserId};
use crate::ports::store::{AccountWrite, MarketStore, MarketWrite, TradeCommit, Versioned};

use super::locks::ExchangeLocks;

/// Stages a trade request moves through. Only the terminal outcome
/// (a `TradeResult` or a `TradeError`) is visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TradeStage {
  Validating,
  Pricing,
  Committing,
}

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
  /// Retries after a version conflict.
  pub max_retries: u32,
  /// Base delay between retries; grows linearly per attempt.
  pub retry_backoff: Duration,
  /// Balance granted when a user trades for the first time.
  pub starting_balance: f64,
}

impl Default for ExecutorSettings {
  fn default() -> Self {
    Self {
      max_retries: 3,
      retry_backoff: Duration::from_millis(5),
      starting_balance: 1000.0,
    }
  }
}

impl From<&AppConfig> for ExecutorSettings {
  fn from(config: &AppConfig) -> Self {
    Self {
      max_retries: config.executor.max_retries,
      retry_backoff: Duration::from_millis(config.executor.retry_backoff_ms),
      starting_balance: config.accounts.starting_balance,
    }
  }
}

/// Executes trades against a `MarketStore`.
pub struct TradeExecutor<S: MarketStore> {
  store: Arc<S>,
  locks: Arc<ExchangeLocks>,
  settings: ExecutorSettings,
  metrics: Option<Arc<ExchangeMetrics>>,
}

impl<S: MarketStore> TradeExecutor<S> {
  /// Create an executor from config.
  pub fn new(store: Arc<S>, locks: Arc<ExchangeLocks>, config: &AppConfig) -> Self {
    Self::with_settings(store, locks, ExecutorSettings::from(config))
  }

  /// Create an executor with explicit settings.
  pub fn with_settings(store: Arc<S>, locks: Arc<ExchangeLocks>, settings: ExecutorSettings) -> Self {
    Self {
      store,
      locks,
      settings,
      metrics: None,
    }
  }

  /// Record trade metrics into `metrics`.
  pub fn with_metrics(mut self, metrics: Arc<ExchangeMetrics>) -> Self {
    self.metrics = Some(metrics);
    self
  }

  /// Buy `shares` (> 0) of one outcome.
  pub async fn buy(
    &self,
    market_id: &MarketId,
    user_id: &UserId,
    outcome_index: usize,
    shares: f64,
  ) -> Result<TradeResult, TradeError> {
    self.execute_side(market_id, user_id, outcome_index, shares, TradeSide::Buy).await
  }

  /// Sell `shares` (> 0) of one outcome.
  pub async fn sell(
    &self,
    market_id: &MarketId,
    user_id: &UserId,
    outcome_index: usize,
    shares: f64,
  ) -> Result<TradeResult, TradeError> {
    self.execute_side(market_id, user_id, outcome_index, shares, TradeSide::Sell).await
  }

  async fn execute_side(
    &self,
    market_id: &MarketId,
    user_id: &UserId,
    outcome_index: usize,
    shares: f64,
    side: TradeSide,
  ) -> Result<TradeResult, TradeError> {
    if !(shares.is_finite() && shares > 0.0) {
      return Err(TradeError::InvalidQuantity(shares));
    }
    let request = TradeRequest::with_side(market_id.clone(), user_id.clone(), outcome_index, shares, side);
    self.execute(request).await
  }

  /// Execute one trade request.
  ///
  /// Dropping the returned future before the market and user locks are
  /// acquired cancels the request. After that point the transition runs
  /// on its own task and always reaches a commit or a rejection.
  #[instrument(
    skip(self, request),
    fields(
      market_id = %request.market_id,
      user_id = %request.user_id,
      outcome = request.outcome_index,
      shares = request.shares_delta,
    )
  )]
  pub async fn execute(&self, request: TradeRequest) -> Result<TradeResult, TradeError> {
    let market_guard = self.locks.markets.lock(&request.market_id).await;
    let user_guard = self.locks.users.lock(&request.user_id).await;

    let store = Arc::clone(&self.store);
    let locks = Arc::clone(&self.locks);
    let settings = self.settings.clone();
    let metrics = self.metrics.clone();
    let transition = tokio::spawn(async move {
      let result = run_transition(store.as_ref(), &settings, metrics.as_deref(), &request).await;
      locks.users.release(&request.user_id, user_guard);
      locks.markets.release(&request.market_id, market_guard);
      result
    });

    let result = transition
      .await
      .map_err(|e| TradeError::Store(StoreError::Backend(format!("trade task failed: {e}"))))?;

    match &result {
      Ok(res) => {
        info!(
          trade_id = %res.trade.id,
          side = %res.trade.side(),
          cost = res.trade.cost,
          balance = res.balance,
          "Trade committed"
        );
        if let Some(m) = &self.metrics {
          let side = res.trade.side().to_string();
          m.trades_executed.with_label_values(&[side.as_str()]).inc();
          m.trade_cost
            .with_label_values(&[side.as_str()])
            .observe(res.trade.cost.abs());
        }
      }
      Err(e) => {
        warn!(reason = e.kind(), error = %e, "Trade rejected");
        if let Some(m) = &self.metrics {
          m.trades_rejected.with_label_values(&[e.kind()]).inc();
        }
      }
    }

    result
  }
}

/// Run the transition, retrying lost compare-and-swaps on fresh state.
async fn run_transition<S: MarketStore>(
  store: &S,
  settings: &ExecutorSettings,
  metrics: Option<&ExchangeMetrics>,
  request: &TradeRequest,
) -> Result<TradeResult, TradeError> {
  let mut attempt: u32 = 0;
  loop {
    attempt += 1;
    match attempt_once(store, settings, request).await {
      Err(TradeError::Store(StoreError::VersionConflict { entity, expected, found, .. })) => {
        if attempt > settings.max_retries {
          return Err(TradeError::ConcurrentModificationConflict {
            market_id: request.market_id.clone(),
            attempts: attempt,
          });
        }
        debug!(attempt, entity, expected, found, "Version conflict, retrying on fresh state");
        if let Some(m) = metrics {
          m.commit_retries.inc();
        }
        tokio::time::sleep(settings.retry_backoff * attempt).await;
      }
      other => return other,
    }
  }
}

/// One read-validate-price-commit pass.
async fn attempt_once<S: MarketStore>(
  store: &S,
  settings: &ExecutorSettings,
  request: &TradeRequest,
) -> Result<TradeResult, TradeError> {
  let mut stage = TradeStage::Validating;
  debug!(?stage);

  let market = store
    .market(&request.market_id)
    .await?
    .ok_or_else(|| TradeError::MarketNotTradable {
      market_id: request.market_id.clone(),
      status: None,
    })?;

  if !market.value.is_open() {
    return Err(TradeError::MarketNotTradable {
      market_id: request.market_id.clone(),
      status: Some(market.value.status),
    });
  }

  let outcomes = market.value.outcome_count();
  if request.outcome_index >= outcomes {
    return Err(TradeError::InvalidOutcome {
      index: request.outcome_index,
      outcomes,
    });
  }

  let delta = request.shares_delta;
  if delta == 0.0 || !delta.is_finite() {
    return Err(TradeError::InvalidQuantity(delta));
  }

  // A first trade opens the account, but only through its own commit.
  let account = store
    .account(&request.user_id)
    .await?
    .unwrap_or_else(|| {
      Versioned::new(0, UserAccount::new(request.user_id.clone(), settings.starting_balance))
    });

  if delta < 0.0 {
    let held = account.value.shares(&request.market_id, request.outcome_index);
    if held + SHARE_DUST < -delta {
      return Err(TradeError::InsufficientShares {
        requested: -delta,
        held,
      });
    }
  }

  stage = TradeStage::Pricing;
  debug!(?stage);

  let model = market.value.model()?;
  let probabilities_before = model.probabilities(&market.value.q)?;
  let (cost, q_after) = model.delta_cost(&market.value.q, request.outcome_index, delta)?;

  if delta > 0.0 && cost > account.value.balance {
    return Err(TradeError::InsufficientBalance {
      cost,
      balance: account.value.balance,
    });
  }
  let probabilities_after = model.probabilities(&q_after)?;

  stage = TradeStage::Committing;
  debug!(?stage, cost);

  let mut next_market = market.value.clone();
  next_market.q = q_after;

  let mut next_account = account.value.clone();
  next_account.balance -= cost;
  next_account.apply_shares(&request.market_id, request.outcome_index, delta);

  let trade = Trade {
    id: Uuid::new_v4(),
    market_id: request.market_id.clone(),
    user_id: request.user_id.clone(),
    outcome_index: request.outcome_index,
    shares_delta: delta,
    cost,
    probabilities_before,
    probabilities_after: probabilities_after.clone(),
    timestamp: Utc::now(),
  };

  let balance = next_account.balance;
  let position = next_account.position(&request.market_id);

  store
    .commit_trade(TradeCommit {
      market: MarketWrite {
        market: next_market,
        expected_version: market.version,
      },
      account: AccountWrite {
        account: next_account,
        expected_version: account.version,
      },
      trade: trade.clone(),
    })
    .await?;

  Ok(TradeResult {
    trade,
    probabilities: probabilities_after,
    balance,
    position,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::adapters::persistence::MemoryStore;
  use crate::domain::{Market, MarketStatus};

  const EPS: f64 = 1e-9;

  async fn setup(balance: f64) -> (Arc<MemoryStore>, TradeExecutor<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let market = Market::new("m1", "Yes or no?", vec!["Yes".to_string(), "No".to_string()], 100.0).unwrap();
    store.create_market(market).await.unwrap();
    let settings = ExecutorSettings {
      starting_balance: balance,
      ..ExecutorSettings::default()
    };
    let executor = TradeExecutor::with_settings(Arc::clone(&store), Arc::new(ExchangeLocks::new()), settings);
    (store, executor)
  }

  fn m1() -> MarketId {
    "m1".to_string()
  }

  fn alice() -> UserId {
    "alice".to_string()
  }

  #[tokio::test]
  async fn test_buy_ten_yes_scenario() {
    let (store, executor) = setup(1000.0).await;
    let res = executor.execute(TradeRequest::new("m1", "alice", 0, 10.0)).await.unwrap();

    let expected = 100.0 * ((0.1f64.exp() + 1.0) / 2.0).ln();
    assert!((res.trade.cost - expected).abs() < EPS);
    assert!((res.balance - (1000.0 - expected)).abs() < EPS);
    assert_eq!(res.trade.probabilities_before, vec![0.5, 0.5]);
    assert!((res.probabilities[0] - 0.525).abs() < 1e-3);
    assert_eq!(res.position.get(&0), Some(&10.0));

    let market = store.market(&m1()).await.unwrap().unwrap();
    assert_eq!(market.value.q, vec![10.0, 0.0]);
    assert_eq!(store.trades(&m1()).await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_buy_then_sell_restores_state() {
    let (store, executor) = setup(1000.0).await;
    executor.buy(&m1(), &alice(), 1, 25.0).await.unwrap();
    let res = executor.sell(&m1(), &alice(), 1, 25.0).await.unwrap();

    assert!((res.balance - 1000.0).abs() < 1e-9);
    assert!(res.position.is_empty());
    let market = store.market(&m1()).await.unwrap().unwrap();
    assert!(market.value.q.iter().all(|q| q.abs() < EPS));
  }

  #[tokio::test]
  async fn test_oversell_rejected_without_mutation() {
    let (store, executor) = setup(1000.0).await;
    executor.buy(&m1(), &alice(), 0, 5.0).await.unwrap();
    let before = store.snapshot();

    let err = executor.sell(&m1(), &alice(), 0, 6.0).await.unwrap_err();
    assert_eq!(
      err,
      TradeError::InsufficientShares {
        requested: 6.0,
        held: 5.0
      }
    );
    assert_eq!(store.snapshot(), before);
  }

  #[tokio::test]
  async fn test_overspend_rejected_without_mutation() {
    let (store, executor) = setup(3.0).await;
    let before = store.snapshot();

    let err = executor.buy(&m1(), &alice(), 0, 10.0).await.unwrap_err();
    assert_eq!(err.kind(), "insufficient_balance");
    assert_eq!(store.snapshot(), before);
  }

  #[tokio::test]
  async fn test_first_trade_rejection_opens_no_account() {
    let (store, executor) = setup(3.0).await;
    let before = store.snapshot();

    let err = executor.buy(&m1(), &alice(), 0, 10.0).await.unwrap_err();
    assert_eq!(err.kind(), "insufficient_balance");
    let err = executor.sell(&m1(), &"bob".to_string(), 1, 1.0).await.unwrap_err();
    assert_eq!(err.kind(), "insufficient_shares");

    assert!(store.account(&alice()).await.unwrap().is_none());
    assert!(store.account(&"bob".to_string()).await.unwrap().is_none());
    assert_eq!(store.snapshot(), before);
    assert!(before.accounts.is_empty());
  }

  #[tokio::test]
  async fn test_first_trade_commit_opens_account_at_version_one() {
    let (store, executor) = setup(1000.0).await;
    executor.buy(&m1(), &alice(), 1, 2.0).await.unwrap();

    let account = store.account(&alice()).await.unwrap().unwrap();
    assert_eq!(account.version, 1);
    assert_eq!(account.value.shares("m1", 1), 2.0);
  }

  #[tokio::test]
  async fn test_lock_slots_released_after_trades() {
    let (_store, executor) = setup(1000.0).await;
    let executor = Arc::new(executor);

    let tasks: Vec<_> = (0..8)
      .map(|i| {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
          let user = format!("user{}", i % 3);
          let _ = executor.buy(&m1(), &user, i % 2, 1.0).await;
        })
      })
      .collect();
    for task in tasks {
      task.await.unwrap();
    }
    executor.buy(&m1(), &alice(), 7, 1.0).await.unwrap_err();

    assert!(executor.locks.markets.is_empty());
    assert!(executor.locks.users.is_empty());
  }

  #[tokio::test]
  async fn test_overflowing_trade_rejected_without_mutation() {
    let (store, executor) = setup(1000.0).await;
    let thin = Market::new("thin", "?", vec!["Yes".to_string(), "No".to_string()], 1.0e-300).unwrap();
    store.create_market(thin).await.unwrap();
    let before = store.snapshot();

    let err = executor.buy(&"thin".to_string(), &alice(), 0, 1.0e10).await.unwrap_err();
    assert_eq!(err.kind(), "pricing");
    assert_eq!(store.snapshot(), before);
  }

  #[tokio::test]
  async fn test_closed_market_rejected() {
    let (store, executor) = setup(1000.0).await;
    let current = store.market(&m1()).await.unwrap().unwrap();
    let mut closed = current.value.clone();
    closed.status = MarketStatus::Closed;
    store
      .commit_market(crate::ports::store::MarketCommit {
        market: MarketWrite {
          market: closed,
          expected_version: current.version,
        },
        accounts: vec![],
      })
      .await
      .unwrap();

    let err = executor.buy(&m1(), &alice(), 0, 1.0).await.unwrap_err();
    assert_eq!(
      err,
      TradeError::MarketNotTradable {
        market_id: m1(),
        status: Some(MarketStatus::Closed)
      }
    );
  }

  #[tokio::test]
  async fn test_unknown_market_and_bad_outcome() {
    let (_store, executor) = setup(1000.0).await;
    let err = executor.buy(&"nope".to_string(), &alice(), 0, 1.0).await.unwrap_err();
    assert_eq!(err.kind(), "market_not_tradable");

    let err = executor.buy(&m1(), &alice(), 2, 1.0).await.unwrap_err();
    assert_eq!(err, TradeError::InvalidOutcome { index: 2, outcomes: 2 });
  }

  #[tokio::test]
  async fn test_zero_and_non_finite_quantities_rejected() {
    let (_store, executor) = setup(1000.0).await;
    let err = executor.execute(TradeRequest::new("m1", "alice", 0, 0.0)).await.unwrap_err();
    assert_eq!(err, TradeError::InvalidQuantity(0.0));
    assert!(executor.buy(&m1(), &alice(), 0, -1.0).await.is_err());
    assert!(executor.buy(&m1(), &alice(), 0, f64::INFINITY).await.is_err());
  }

  #[tokio::test]
  async fn test_metrics_record_outcomes() {
    let (_store, executor) = setup(1000.0).await;
    let metrics = Arc::new(ExchangeMetrics::new().unwrap());
    let executor = executor.with_metrics(Arc::clone(&metrics));

    executor.buy(&m1(), &alice(), 0, 1.0).await.unwrap();
    let _ = executor.sell(&m1(), &alice(), 0, 9.0).await;

    assert_eq!(metrics.trades_executed.with_label_values(&["BUY"]).get(), 1);
    assert_eq!(
      metrics.trades_rejected.with_label_values(&["insufficient_shares"]).get(),
      1
    );
  }
}
