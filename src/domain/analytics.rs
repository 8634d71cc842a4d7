//! Ledger-derived market statistics.
//!
//! Everything here is recomputed from the append-only trade ledger and
//! the current market document; nothing is stored.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::PricingError;
use super::market::Market;
use super::trade::{MarketId, Trade, TradeSide};

/// Width of the "recent activity" window.
pub const RECENT_WINDOW_HOURS: i64 = 24;

/// One outcome singled out by a statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStat {
    pub index: usize,
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAnalytics {
    pub market_id: MarketId,
    /// Outcome with the highest implied probability.
    pub leading_outcome: OutcomeStat,
    /// Outcome with the most net shares outstanding.
    pub most_shares_outcome: OutcomeStat,
    /// Sum of absolute trade costs.
    pub total_volume: f64,
    pub total_trades: usize,
    pub unique_traders: usize,
    /// total_volume / total_trades (0 with no trades).
    pub avg_trade_size: f64,
    /// Trades within the last `RECENT_WINDOW_HOURS`.
    pub recent_activity: usize,
    /// Percentage of trades that were buys (0 with no trades).
    pub buy_ratio_pct: f64,
}

/// Compute analytics for `market` from its ledger, as of `now`.
pub fn compute(
    market: &Market,
    trades: &[Trade],
    now: DateTime<Utc>,
) -> Result<MarketAnalytics, PricingError> {
    let probabilities = market.probabilities()?;
    let leading = argmax(&probabilities);
    let most_shares = argmax(&market.q);

    let total_trades = trades.len();
    let total_volume: f64 = trades.iter().map(|t| t.cost.abs()).sum();
    let unique_traders = trades
        .iter()
        .map(|t| t.user_id.as_str())
        .collect::<HashSet<_>>()
        .len();
    let cutoff = now - Duration::hours(RECENT_WINDOW_HOURS);
    let recent_activity = trades.iter().filter(|t| t.timestamp >= cutoff).count();
    let buys = trades.iter().filter(|t| t.side() == TradeSide::Buy).count();

    let (avg_trade_size, buy_ratio_pct) = if total_trades == 0 {
        (0.0, 0.0)
    } else {
        (
            total_volume / total_trades as f64,
            buys as f64 / total_trades as f64 * 100.0,
        )
    };

    Ok(MarketAnalytics {
        market_id: market.id.clone(),
        leading_outcome: OutcomeStat {
            index: leading,
            label: market.outcomes[leading].clone(),
            value: probabilities[leading],
        },
        most_shares_outcome: OutcomeStat {
            index: most_shares,
            label: market.outcomes[most_shares].clone(),
            value: market.q[most_shares],
        },
        total_volume,
        total_trades,
        unique_traders,
        avg_trade_size,
        recent_activity,
        buy_ratio_pct,
    })
}

/// Index of the largest value; first wins on ties.
fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, v)| {
            if *v > bv { (i, *v) } else { (bi, bv) }
        })
        .0
}
