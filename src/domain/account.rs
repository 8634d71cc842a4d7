//! User token balances and per-outcome share positions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::trade::{MarketId, UserId};

/// Share holdings inside one market, keyed by outcome index.
pub type Position = BTreeMap<usize, f64>;

/// Residual share counts below this are treated as fully closed.
pub const SHARE_DUST: f64 = 1e-9;

/// A user's token balance and share positions across markets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    /// Token balance, never negative.
    pub balance: f64,
    /// market -> (outcome index -> shares held)
    pub positions: BTreeMap<MarketId, Position>,
}

impl UserAccount {
    /// Open an account with a starting token grant.
    pub fn new(user_id: impl Into<UserId>, balance: f64) -> Self {
        Self {
            user_id: user_id.into(),
            balance,
            positions: BTreeMap::new(),
        }
    }

    /// Shares held for one outcome (0 if none).
    pub fn shares(&self, market_id: &str, outcome: usize) -> f64 {
        self.positions
            .get(market_id)
            .and_then(|p| p.get(&outcome))
            .copied()
            .unwrap_or(0.0)
    }

    /// Full position in one market (empty if none).
    pub fn position(&self, market_id: &str) -> Position {
        self.positions.get(market_id).cloned().unwrap_or_default()
    }

    /// Apply a signed share delta, pruning entries that return to zero.
    pub fn apply_shares(&mut self, market_id: &str, outcome: usize, delta: f64) {
        let position = self.positions.entry(market_id.to_string()).or_default();
        let held = position.entry(outcome).or_insert(0.0);
        *held += delta;
        if held.abs() < SHARE_DUST {
            position.remove(&outcome);
        }
        if position.is_empty() {
            self.positions.remove(market_id);
        }
    }

    /// Whether the account holds any shares in the market.
    pub fn holds(&self, market_id: &str) -> bool {
        self.positions
            .get(market_id)
            .is_some_and(|p| p.values().any(|s| *s > SHARE_DUST))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_shares_and_prune() {
        let mut acct = UserAccount::new("alice", 100.0);
        acct.apply_shares("m1", 0, 5.0);
        acct.apply_shares("m1", 1, 2.5);
        assert_eq!(acct.shares("m1", 0), 5.0);
        assert!(acct.holds("m1"));

        acct.apply_shares("m1", 0, -5.0);
        assert_eq!(acct.shares("m1", 0), 0.0);
        assert_eq!(acct.position("m1").len(), 1);

        acct.apply_shares("m1", 1, -2.5);
        assert!(!acct.positions.contains_key("m1"));
        assert!(!acct.holds("m1"));
    }

    #[test]
    fn test_shares_default_zero() {
        let acct = UserAccount::new("bob", 0.0);
        assert_eq!(acct.shares("nope", 3), 0.0);
        assert!(acct.position("nope").is_empty());
    }
}
