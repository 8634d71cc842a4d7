//! Exchange - Use Cases Wired Over One Store
//!
//! Bundles the trade executor, settlement, reads and the subscriber hub
//! so they share one store and one lock set. Whatever transport embeds
//! the exchange (HTTP, websocket, RPC) calls through this value; trades
//! and settlement on the same market are serialized only because they
//! share `locks`.

use std::sync::Arc;

use crate::adapters::metrics::ExchangeMetrics;
use crate::config::AppConfig;
use crate::ports::store::MarketStore;

use super::{ExchangeLocks, MarketService, Settlement, SubscriberHub, TradeExecutor};

pub struct Exchange<S: MarketStore> {
  pub executor: TradeExecutor<S>,
  pub settlement: Settlement<S>,
  pub service: MarketService<S>,
  /// Live update fan-out, fed by a `ChangePropagator` on the same store.
  pub hub: Arc<SubscriberHub>,
  locks: Arc<ExchangeLocks>,
}

impl<S: MarketStore> Exchange<S> {
  pub fn new(store: Arc<S>, config: &AppConfig, metrics: Option<Arc<ExchangeMetrics>>) -> Self {
    let locks = Arc::new(ExchangeLocks::new());
    let mut executor = TradeExecutor::new(Arc::clone(&store), Arc::clone(&locks), config);
    let mut settlement = Settlement::new(Arc::clone(&store), Arc::clone(&locks), config);
    let hub = match &metrics {
      Some(m) => {
        executor = executor.with_metrics(Arc::clone(m));
        settlement = settlement.with_metrics(Arc::clone(m));
        SubscriberHub::with_metrics(Arc::clone(m))
      }
      None => SubscriberHub::new(),
    };

    Self {
      executor,
      settlement,
      service: MarketService::new(store),
      hub: Arc::new(hub),
      locks,
    }
  }

  pub fn locks(&self) -> &ExchangeLocks {
    &self.locks
  }
}
