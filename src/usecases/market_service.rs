//! Market Service - Read-Side Queries
//!
//! Market views, ledger history, portfolios, quotes and analytics.
//! Nothing here takes a lock or writes: every read reflects the most
//! recent commit the store has applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::domain::analytics::{self, MarketAnalytics};
use crate::domain::error::TradeError;
use crate::domain::{
  Market, MarketId, MarketStatus, Position, Quote, Trade, UserId,
};
use crate::ports::store::MarketStore;

/// Default page size for per-user trade history.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Public view of one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketView {
  pub id: MarketId,
  pub question: String,
  pub outcomes: Vec<String>,
  pub b: f64,
  pub probabilities: Vec<f64>,
  pub q: Vec<f64>,
  pub status: MarketStatus,
  pub winning_outcome: Option<usize>,
}

impl MarketView {
  fn from_market(market: Market) -> Result<Self, TradeError> {
    let probabilities = market.probabilities()?;
    Ok(Self {
      id: market.id,
      question: market.question,
      outcomes: market.outcomes,
      b: market.b,
      probabilities,
      q: market.q,
      status: market.status,
      winning_outcome: market.winning_outcome,
    })
  }
}

/// A user's balance and holdings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
  pub user_id: UserId,
  pub balance: f64,
  pub positions: BTreeMap<MarketId, Position>,
}

/// Read-only queries over a `MarketStore`.
pub struct MarketService<S: MarketStore> {
  store: Arc<S>,
}

impl<S: MarketStore> MarketService<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self { store }
  }

  async fn load(&self, market_id: &MarketId) -> Result<Market, TradeError> {
    self
      .store
      .market(market_id)
      .await?
      .map(|m| m.value)
      .ok_or_else(|| TradeError::MarketNotTradable {
        market_id: market_id.clone(),
        status: None,
      })
  }

  /// Current state of one market.
  pub async fn market(&self, market_id: &MarketId) -> Result<MarketView, TradeError> {
    MarketView::from_market(self.load(market_id).await?)
  }

  /// All markets, oldest first, optionally filtered by status.
  pub async fn list_markets(
    &self,
    status: Option<MarketStatus>,
  ) -> Result<Vec<MarketView>, TradeError> {
    self
      .store
      .markets()
      .await?
      .into_iter()
      .map(|m| m.value)
      .filter(|m| status.is_none_or(|s| m.status == s))
      .map(MarketView::from_market)
      .collect()
  }

  /// Full ledger of one market in commit order.
  pub async fn history(&self, market_id: &MarketId) -> Result<Vec<Trade>, TradeError> {
    self.load(market_id).await?;
    Ok(self.store.trades(market_id).await?)
  }

  /// A user's trades, newest first.
  pub async fn user_trades(
    &self,
    user_id: &UserId,
    market_id: Option<&MarketId>,
    limit: Option<usize>,
  ) -> Result<Vec<Trade>, TradeError> {
    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(self.store.user_trades(user_id, market_id, limit).await?)
  }

  /// Balance and positions, or `None` for a user who never traded.
  pub async fn portfolio(&self, user_id: &UserId) -> Result<Option<Portfolio>, TradeError> {
    Ok(self.store.account(user_id).await?.map(|a| Portfolio {
      user_id: a.value.user_id,
      balance: a.value.balance,
      positions: a.value.positions,
    }))
  }

  /// Exact LMSR cost of a prospective trade. Does not mutate anything.
  #[instrument(skip(self), fields(market_id = %market_id))]
  pub async fn quote(
    &self,
    market_id: &MarketId,
    outcome_index: usize,
    shares_delta: f64,
  ) -> Result<Quote, TradeError> {
    let market = self.load(market_id).await?;
    let outcomes = market.outcome_count();
    if outcome_index >= outcomes {
      return Err(TradeError::InvalidOutcome {
        index: outcome_index,
        outcomes,
      });
    }
    if shares_delta == 0.0 || !shares_delta.is_finite() {
      return Err(TradeError::InvalidQuantity(shares_delta));
    }

    let model = market.model()?;
    let probabilities_before = model.probabilities(&market.q)?;
    let (cost, q_after) = model.delta_cost(&market.q, outcome_index, shares_delta)?;
    let probabilities_after = model.probabilities(&q_after)?;

    Ok(Quote {
      market_id: market.id,
      outcome_index,
      shares_delta,
      cost,
      average_price: (cost / shares_delta).abs(),
      probabilities_before,
      probabilities_after,
    })
  }

  /// Ledger-derived statistics for one market.
  pub async fn analytics(&self, market_id: &MarketId) -> Result<MarketAnalytics, TradeError> {
    let market = self.load(market_id).await?;
    let trades = self.store.trades(market_id).await?;
    Ok(analytics::compute(&market, &trades, Utc::now())?)
  }
}
