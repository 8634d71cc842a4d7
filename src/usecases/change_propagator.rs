//! Change Propagator - Feed-Driven Market Update Broadcast
//!
//! Follows the store's change feed and turns every market mutation a
//! viewer can see (exposure, liquidity, status, outcomes) into a
//! `MarketUpdate` with freshly computed probabilities. Updates go to
//! subscribers of that market and to global subscribers, in feed order.
//!
//! Feed loss is handled by reconnecting with exponential backoff and
//! resuming after the last acknowledged sequence, so nothing is missed
//! or delivered twice. Exhausting the reconnect budget marks the
//! propagator unhealthy and stops it. So does a resume point the feed no
//! longer retains, since replaying from anywhere else would drop updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::metrics::ExchangeMetrics;
use crate::config::AppConfig;
use crate::domain::{MarketId, MarketStatus};
use crate::ports::change_feed::{ChangeFeed, ChangeOperation, FeedError, MarketChange};

/// Event pushed to live viewers after a committed market change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdate {
  pub market_id: MarketId,
  pub probabilities: Vec<f64>,
  pub status: MarketStatus,
  pub q: Vec<f64>,
  /// Feed sequence of the change this update was built from.
  pub sequence: u64,
}

impl MarketUpdate {
  /// Build the update for `change`, or `None` if viewers would not see
  /// a difference.
  pub fn from_change(change: &MarketChange) -> Option<Self> {
    let relevant = match change.operation {
      ChangeOperation::Insert | ChangeOperation::Replace => true,
      ChangeOperation::Update => change
        .updated_fields
        .iter()
        .any(|f| f.is_broadcast_relevant()),
    };
    if !relevant {
      return None;
    }

    let probabilities = match change.market.probabilities() {
      Ok(p) => p,
      Err(e) => {
        warn!(market_id = %change.market.id, error = %e, "Cannot price changed market");
        return None;
      }
    };

    Some(Self {
      market_id: change.market.id.clone(),
      probabilities,
      status: change.market.status,
      q: change.market.q.clone(),
      sequence: change.sequence,
    })
  }
}

#[derive(Default)]
struct Subscribers {
  by_market: HashMap<MarketId, Vec<mpsc::UnboundedSender<MarketUpdate>>>,
  global: Vec<mpsc::UnboundedSender<MarketUpdate>>,
}

impl Subscribers {
  fn count(&self) -> usize {
    self.global.len() + self.by_market.values().map(Vec::len).sum::<usize>()
  }
}

/// Fan-out of market updates to live subscribers.
///
/// Every subscriber has its own unbounded queue, so a slow reader sees
/// every intermediate state and never holds up the others. A subscriber
/// whose receiver is gone is dropped on the next send.
#[derive(Default)]
pub struct SubscriberHub {
  subscribers: Mutex<Subscribers>,
  metrics: Option<Arc<ExchangeMetrics>>,
}

impl SubscriberHub {
  pub fn new() -> Self {
    Self::default()
  }

  /// Report the subscriber count into `metrics`.
  pub fn with_metrics(metrics: Arc<ExchangeMetrics>) -> Self {
    Self {
      subscribers: Mutex::new(Subscribers::default()),
      metrics: Some(metrics),
    }
  }

  /// Receive updates for one market.
  pub fn subscribe_market(&self, market_id: &MarketId) -> mpsc::UnboundedReceiver<MarketUpdate> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut subs = self.subscribers.lock();
    subs.by_market.entry(market_id.clone()).or_default().push(tx);
    self.report(subs.count());
    rx
  }

  /// Receive updates for every market.
  pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<MarketUpdate> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut subs = self.subscribers.lock();
    subs.global.push(tx);
    self.report(subs.count());
    rx
  }

  /// Deliver `update` to market and global subscribers.
  ///
  /// Returns the number of subscribers it reached.
  pub fn publish(&self, update: &MarketUpdate) -> usize {
    let mut subs = self.subscribers.lock();
    let mut delivered = 0;

    let mut drained = false;
    if let Some(list) = subs.by_market.get_mut(&update.market_id) {
      list.retain(|tx| tx.send(update.clone()).is_ok());
      delivered += list.len();
      drained = list.is_empty();
    }
    if drained {
      subs.by_market.remove(&update.market_id);
    }

    subs.global.retain(|tx| tx.send(update.clone()).is_ok());
    delivered += subs.global.len();

    self.report(subs.count());
    delivered
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers.lock().count()
  }

  fn report(&self, count: usize) {
    if let Some(m) = &self.metrics {
      m.subscribers.set(count as i64);
    }
  }
}

/// Propagator failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PropagatorError {
  #[error("change feed unavailable after {attempts} reconnect attempts")]
  FeedUnavailable { attempts: u32 },

  #[error("cannot resume after sequence {requested}: oldest retained change is {oldest}")]
  ResumePointLost { requested: u64, oldest: u64 },
}

/// Reconnect tuning.
#[derive(Debug, Clone)]
pub struct PropagatorSettings {
  pub initial_backoff: Duration,
  pub max_backoff: Duration,
  /// Consecutive connections that fail before delivering a change,
  /// tolerated before giving up.
  pub max_reconnect_attempts: u32,
}

impl From<&AppConfig> for PropagatorSettings {
  fn from(config: &AppConfig) -> Self {
    Self {
      initial_backoff: Duration::from_millis(config.propagator.initial_backoff_ms),
      max_backoff: Duration::from_millis(config.propagator.max_backoff_ms),
      max_reconnect_attempts: config.propagator.max_reconnect_attempts,
    }
  }
}

/// Cheap, cloneable view of a running propagator.
#[derive(Debug, Clone)]
pub struct PropagatorHandle {
  healthy: Arc<AtomicBool>,
  acknowledged: Arc<AtomicU64>,
}

impl PropagatorHandle {
  pub fn is_healthy(&self) -> bool {
    self.healthy.load(Ordering::SeqCst)
  }

  /// Sequence of the last change fully processed (0 before any).
  pub fn last_acknowledged(&self) -> u64 {
    self.acknowledged.load(Ordering::SeqCst)
  }
}

/// Long-lived task bridging the change feed to the subscriber hub.
pub struct ChangePropagator<F: ChangeFeed> {
  feed: Arc<F>,
  hub: Arc<SubscriberHub>,
  settings: PropagatorSettings,
  /// Start strictly after this sequence instead of the live head.
  resume_after: Option<u64>,
  handle: PropagatorHandle,
  metrics: Option<Arc<ExchangeMetrics>>,
}

impl<F: ChangeFeed> ChangePropagator<F> {
  pub fn new(feed: Arc<F>, hub: Arc<SubscriberHub>, settings: PropagatorSettings) -> Self {
    Self {
      feed,
      hub,
      settings,
      resume_after: None,
      handle: PropagatorHandle {
        healthy: Arc::new(AtomicBool::new(true)),
        acknowledged: Arc::new(AtomicU64::new(0)),
      },
      metrics: None,
    }
  }

  /// Replay everything committed after `sequence` before following live.
  pub fn resume_from(mut self, sequence: u64) -> Self {
    self.resume_after = Some(sequence);
    self
  }

  /// Mirror health into an externally owned flag (readiness probe).
  pub fn with_health_flag(mut self, healthy: Arc<AtomicBool>) -> Self {
    healthy.store(self.handle.is_healthy(), Ordering::SeqCst);
    self.handle.healthy = healthy;
    self
  }

  pub fn with_metrics(mut self, metrics: Arc<ExchangeMetrics>) -> Self {
    metrics.propagator_healthy.set(1.0);
    self.metrics = Some(metrics);
    self
  }

  pub fn handle(&self) -> PropagatorHandle {
    self.handle.clone()
  }

  /// Follow the feed until shutdown or until reconnects are exhausted.
  #[instrument(skip(self, shutdown_rx))]
  pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), PropagatorError> {
    let mut cursor = match self.resume_after {
      Some(sequence) => sequence,
      None => self.feed.head().await,
    };
    self.acknowledge(cursor);

    let mut failures: u32 = 0;
    let mut backoff = self.settings.initial_backoff;

    info!(resume_after = cursor, "Change propagator starting");

    loop {
      let connected = tokio::select! {
        _ = shutdown_rx.recv() => break,
        result = self.feed.watch(Some(cursor)) => result,
      };

      let failure = match connected {
        Ok(mut stream) => {
          debug!(resume_after = cursor, "Change feed connected");
          let mut delivering = false;

          loop {
            tokio::select! {
              _ = shutdown_rx.recv() => {
                info!(last_acknowledged = cursor, "Change propagator stopped");
                return Ok(());
              }
              item = stream.next() => match item {
                Some(Ok(change)) => {
                  if !delivering {
                    // The connection is proven only once it carries a change.
                    delivering = true;
                    failures = 0;
                    backoff = self.settings.initial_backoff;
                    self.set_healthy(true);
                  }
                  self.process(&change);
                  cursor = change.sequence;
                  self.acknowledge(cursor);
                }
                Some(Err(e)) => break e,
                None => break FeedError::Disconnected("stream ended".to_string()),
              }
            }
          }
        }
        Err(e) => e,
      };

      if let FeedError::ResumePointLost { requested, oldest } = failure {
        self.set_healthy(false);
        error!(requested, oldest, "Resume point lost, changes after it are gone");
        return Err(PropagatorError::ResumePointLost { requested, oldest });
      }

      failures += 1;
      if let Some(m) = &self.metrics {
        m.feed_reconnects.inc();
      }
      if failures >= self.settings.max_reconnect_attempts {
        self.set_healthy(false);
        error!(attempts = failures, error = %failure, "Change feed unavailable, giving up");
        return Err(PropagatorError::FeedUnavailable { attempts: failures });
      }

      warn!(
        attempt = failures,
        backoff_ms = backoff.as_millis() as u64,
        error = %failure,
        "Change feed lost, reconnecting"
      );
      tokio::select! {
        _ = shutdown_rx.recv() => break,
        _ = tokio::time::sleep(backoff) => {}
      }
      backoff = (backoff * 2).min(self.settings.max_backoff);
    }

    info!(last_acknowledged = cursor, "Change propagator stopped");
    Ok(())
  }

  fn process(&self, change: &MarketChange) {
    let Some(update) = MarketUpdate::from_change(change) else {
      debug!(sequence = change.sequence, fields = ?change.updated_fields, "Change not broadcast");
      return;
    };

    let delivered = self.hub.publish(&update);
    debug!(
      sequence = update.sequence,
      market_id = %update.market_id,
      delivered,
      "Market update broadcast"
    );
    if let Some(m) = &self.metrics {
      m.events_propagated.inc();
    }
  }

  fn acknowledge(&self, sequence: u64) {
    self.handle.acknowledged.store(sequence, Ordering::SeqCst);
  }

  fn set_healthy(&self, healthy: bool) {
    self.handle.healthy.store(healthy, Ordering::SeqCst);
    if let Some(m) = &self.metrics {
      m.propagator_healthy.set(if healthy { 1.0 } else { 0.0 });
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::adapters::persistence::MemoryStore;
  use crate::domain::{Market, TradeRequest};
  use crate::ports::change_feed::{ChangeStream, MarketField};
  use async_trait::async_trait;
  use futures_util::stream;
  use std::sync::atomic::AtomicU32;
  use crate::ports::store::{MarketCommit, MarketStore, MarketWrite};
  use crate::usecases::locks::ExchangeLocks;
  use crate::usecases::trade_executor::TradeExecutor;
  use chrono::Utc;

  fn settings() -> PropagatorSettings {
    PropagatorSettings {
      initial_backoff: Duration::from_millis(1),
      max_backoff: Duration::from_millis(4),
      max_reconnect_attempts: 3,
    }
  }

  /// Feed that accepts every connection and drops it before any change.
  #[derive(Default)]
  struct FlappingFeed {
    connections: AtomicU32,
  }

  #[async_trait]
  impl ChangeFeed for FlappingFeed {
    async fn watch(&self, _resume_after: Option<u64>) -> Result<ChangeStream, FeedError> {
      self.connections.fetch_add(1, Ordering::SeqCst);
      Ok(stream::iter(vec![Err(FeedError::Disconnected("reset by peer".to_string()))]).boxed())
    }

    async fn head(&self) -> u64 {
      0
    }
  }

  fn yes_no(id: &str) -> Market {
    Market::new(id, "?", vec!["Yes".to_string(), "No".to_string()], 100.0).unwrap()
  }

  async fn next(rx: &mut mpsc::UnboundedReceiver<MarketUpdate>) -> MarketUpdate {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
      .await
      .expect("update should arrive")
      .expect("hub should stay open")
  }

  fn change(operation: ChangeOperation, fields: Vec<MarketField>) -> MarketChange {
    MarketChange {
      sequence: 7,
      operation,
      market: yes_no("m1"),
      updated_fields: fields,
      committed_at: Utc::now(),
    }
  }

  #[test]
  fn test_relevance_filter() {
    assert!(MarketUpdate::from_change(&change(ChangeOperation::Insert, vec![])).is_some());
    assert!(MarketUpdate::from_change(&change(ChangeOperation::Replace, vec![])).is_some());
    assert!(MarketUpdate::from_change(&change(ChangeOperation::Update, vec![MarketField::Q])).is_some());
    assert!(
      MarketUpdate::from_change(&change(ChangeOperation::Update, vec![MarketField::Status])).is_some()
    );
    assert!(
      MarketUpdate::from_change(&change(ChangeOperation::Update, vec![MarketField::Question])).is_none()
    );
  }

  #[test]
  fn test_hub_prunes_dead_subscribers() {
    let hub = SubscriberHub::new();
    let mut live = hub.subscribe_market(&"m1".to_string());
    let dead = hub.subscribe_market(&"m1".to_string());
    let mut global = hub.subscribe_all();
    drop(dead);

    let update = MarketUpdate::from_change(&change(ChangeOperation::Insert, vec![])).unwrap();
    assert_eq!(hub.publish(&update), 2);
    assert_eq!(hub.subscriber_count(), 2);
    assert_eq!(live.try_recv().unwrap(), update);
    assert_eq!(global.try_recv().unwrap(), update);
  }

  #[tokio::test]
  async fn test_trades_broadcast_in_commit_order() {
    let store = Arc::new(MemoryStore::new());
    store.create_market(yes_no("m1")).await.unwrap();
    let hub = Arc::new(SubscriberHub::new());
    let mut rx = hub.subscribe_market(&"m1".to_string());

    let propagator = Arc::new(ChangePropagator::new(Arc::clone(&store), Arc::clone(&hub), settings()).resume_from(0));
    let (shutdown_tx, _) = broadcast::channel(1);
    let task = {
      let propagator = Arc::clone(&propagator);
      let shutdown_rx = shutdown_tx.subscribe();
      tokio::spawn(async move { propagator.run(shutdown_rx).await })
    };

    let executor = TradeExecutor::new(
      Arc::clone(&store),
      Arc::new(ExchangeLocks::new()),
      &AppConfig::default(),
    );
    executor.execute(TradeRequest::new("m1", "alice", 0, 10.0)).await.unwrap();

    // Question edits are invisible to viewers.
    let current = store.market(&"m1".to_string()).await.unwrap().unwrap();
    let mut edited = current.value.clone();
    edited.question = "Reworded?".to_string();
    store
      .commit_market(MarketCommit {
        market: MarketWrite {
          market: edited,
          expected_version: current.version,
        },
        accounts: vec![],
      })
      .await
      .unwrap();

    executor.execute(TradeRequest::new("m1", "bob", 1, 5.0)).await.unwrap();

    let insert = next(&mut rx).await;
    assert_eq!((insert.sequence, insert.q.clone()), (1, vec![0.0, 0.0]));
    let first = next(&mut rx).await;
    assert_eq!((first.sequence, first.q.clone()), (2, vec![10.0, 0.0]));
    let second = next(&mut rx).await;
    assert_eq!((second.sequence, second.q.clone()), (4, vec![10.0, 5.0]));

    let probability_sum: f64 = second.probabilities.iter().sum();
    assert!((probability_sum - 1.0).abs() < 1e-12);

    tokio::time::timeout(Duration::from_secs(2), async {
      while propagator.handle().last_acknowledged() < 4 {
        tokio::task::yield_now().await;
      }
    })
    .await
    .unwrap();

    let _ = shutdown_tx.send(());
    assert_eq!(task.await.unwrap(), Ok(()));
  }

  #[tokio::test]
  async fn test_resumes_without_gaps_after_disconnect() {
    let store = Arc::new(MemoryStore::new());
    let hub = Arc::new(SubscriberHub::new());
    let mut rx = hub.subscribe_all();

    let propagator = Arc::new(ChangePropagator::new(Arc::clone(&store), Arc::clone(&hub), settings()).resume_from(0));
    let (shutdown_tx, _) = broadcast::channel(1);
    let task = {
      let propagator = Arc::clone(&propagator);
      let shutdown_rx = shutdown_tx.subscribe();
      tokio::spawn(async move { propagator.run(shutdown_rx).await })
    };

    for i in 0..3 {
      store.create_market(yes_no(&format!("m{i}"))).await.unwrap();
    }
    for expected in 1..=3 {
      assert_eq!(next(&mut rx).await.sequence, expected);
    }

    store.interrupt_feeds();
    for i in 3..6 {
      store.create_market(yes_no(&format!("m{i}"))).await.unwrap();
    }
    for expected in 4..=6 {
      assert_eq!(next(&mut rx).await.sequence, expected);
    }
    assert!(rx.try_recv().is_err());
    assert!(propagator.handle().is_healthy());

    let _ = shutdown_tx.send(());
    task.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_unhealthy_after_exhausting_reconnects() {
    let store = Arc::new(MemoryStore::new());
    store.set_feed_available(false);
    let health = Arc::new(AtomicBool::new(true));
    let metrics = Arc::new(ExchangeMetrics::new().unwrap());

    let propagator = ChangePropagator::new(store, Arc::new(SubscriberHub::new()), settings())
      .with_health_flag(Arc::clone(&health))
      .with_metrics(Arc::clone(&metrics));
    let handle = propagator.handle();

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let result = propagator.run(shutdown_rx).await;

    assert_eq!(result, Err(PropagatorError::FeedUnavailable { attempts: 3 }));
    assert!(!handle.is_healthy());
    assert!(!health.load(Ordering::SeqCst));
    assert_eq!(metrics.feed_reconnects.get(), 3);
    assert_eq!(metrics.propagator_healthy.get(), 0.0);
  }

  #[tokio::test]
  async fn test_flapping_feed_exhausts_reconnect_budget() {
    let feed = Arc::new(FlappingFeed::default());
    let health = Arc::new(AtomicBool::new(true));
    let propagator = ChangePropagator::new(Arc::clone(&feed), Arc::new(SubscriberHub::new()), settings())
      .with_health_flag(Arc::clone(&health));
    let handle = propagator.handle();

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let result = tokio::time::timeout(Duration::from_secs(2), propagator.run(shutdown_rx))
      .await
      .expect("propagator should give up");

    assert_eq!(result, Err(PropagatorError::FeedUnavailable { attempts: 3 }));
    assert_eq!(feed.connections.load(Ordering::SeqCst), 3);
    assert!(!handle.is_healthy());
    assert!(!health.load(Ordering::SeqCst));
  }

  #[tokio::test]
  async fn test_lost_resume_point_stops_propagator() {
    let store = Arc::new(MemoryStore::with_retention(2));
    for i in 0..5 {
      store.create_market(yes_no(&format!("m{i}"))).await.unwrap();
    }
    let hub = Arc::new(SubscriberHub::new());
    let mut rx = hub.subscribe_all();

    let propagator = ChangePropagator::new(store, Arc::clone(&hub), settings()).resume_from(1);
    let handle = propagator.handle();
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let result = propagator.run(shutdown_rx).await;

    assert_eq!(result, Err(PropagatorError::ResumePointLost { requested: 1, oldest: 4 }));
    assert!(!handle.is_healthy());
    assert_eq!(handle.last_acknowledged(), 1);
    assert!(rx.try_recv().is_err());
  }
}
