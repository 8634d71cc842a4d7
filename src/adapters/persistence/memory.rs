//! In-Memory Store - Versioned Documents, Ledger and Change Log
//!
//! Implements both `MarketStore` and `ChangeFeed` over a single
//! mutex-guarded state. Every commit validates the expected versions,
//! writes all documents, appends the ledger entry and the change-log
//! entry under one lock, then wakes feed cursors through a `watch`
//! channel. Cursors read the change log directly, so a slow cursor
//! never loses entries while they are retained.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::domain::error::StoreError;
use crate::domain::{Market, MarketId, Trade, UserAccount, UserId};
use crate::ports::change_feed::{
    ChangeFeed, ChangeOperation, ChangeStream, FeedError, MarketChange, MarketField,
};
use crate::ports::store::{
    AccountWrite, MarketCommit, MarketStore, MarketWrite, TradeCommit, Versioned,
};

/// Default number of change-log entries kept for resuming cursors.
pub const DEFAULT_CHANGE_RETENTION: usize = 100_000;

/// Serializable image of the whole store, used for crash recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub markets: Vec<Versioned<Market>>,
    pub accounts: Vec<Versioned<UserAccount>>,
    /// Global ledger in commit order.
    pub ledger: Vec<Trade>,
    /// Last change-feed sequence handed out.
    pub head_sequence: u64,
}

/// Wake-up signal for feed cursors.
#[derive(Debug, Clone, Copy, Default)]
struct FeedSignal {
    /// Latest committed sequence.
    head: u64,
    /// Bumped to sever every open cursor.
    epoch: u64,
}

#[derive(Debug, Default)]
struct State {
    markets: HashMap<MarketId, Versioned<Market>>,
    accounts: HashMap<UserId, Versioned<UserAccount>>,
    ledger: Vec<Trade>,
    changes: VecDeque<MarketChange>,
    head_sequence: u64,
}

impl State {
    /// Sequence of the oldest retained change.
    fn oldest_sequence(&self) -> u64 {
        self.changes
            .front()
            .map_or(self.head_sequence + 1, |c| c.sequence)
    }

    fn change_after(&self, after: u64) -> Option<MarketChange> {
        let oldest = self.changes.front()?.sequence;
        let idx = after.checked_add(1)?.checked_sub(oldest)?;
        self.changes.get(idx as usize).cloned()
    }

    fn check_market(&self, write: &MarketWrite) -> Result<&Versioned<Market>, StoreError> {
        let current = self
            .markets
            .get(&write.market.id)
            .ok_or_else(|| StoreError::MarketNotFound(write.market.id.clone()))?;
        if current.version != write.expected_version {
            return Err(StoreError::VersionConflict {
                entity: "market",
                id: write.market.id.clone(),
                expected: write.expected_version,
                found: current.version,
            });
        }
        Ok(current)
    }

    fn check_account(&self, write: &AccountWrite) -> Result<(), StoreError> {
        let found = self
            .accounts
            .get(&write.account.user_id)
            .map_or(0, |a| a.version);
        if found != write.expected_version {
            return Err(StoreError::VersionConflict {
                entity: "account",
                id: write.account.user_id.clone(),
                expected: write.expected_version,
                found,
            });
        }
        Ok(())
    }

    fn write_account(&mut self, write: AccountWrite) {
        let version = write.expected_version + 1;
        self.accounts.insert(
            write.account.user_id.clone(),
            Versioned::new(version, write.account),
        );
    }

    /// Replace the market document and record the change.
    fn write_market(&mut self, write: MarketWrite, retention: usize) -> MarketChange {
        let updated_fields = match self.markets.get(&write.market.id) {
            Some(before) => diff_fields(&before.value, &write.market),
            None => all_fields(),
        };
        let version = write.expected_version + 1;
        self.markets.insert(
            write.market.id.clone(),
            Versioned::new(version, write.market.clone()),
        );
        self.record_change(ChangeOperation::Update, write.market, updated_fields, retention)
    }

    fn record_change(
        &mut self,
        operation: ChangeOperation,
        market: Market,
        updated_fields: Vec<MarketField>,
        retention: usize,
    ) -> MarketChange {
        self.head_sequence += 1;
        let change = MarketChange {
            sequence: self.head_sequence,
            operation,
            market,
            updated_fields,
            committed_at: Utc::now(),
        };
        self.changes.push_back(change.clone());
        while self.changes.len() > retention {
            self.changes.pop_front();
        }
        change
    }
}

struct Shared {
    state: Mutex<State>,
    signal: watch::Sender<FeedSignal>,
    available: AtomicBool,
    retention: usize,
}

/// In-memory implementation of the storage and change-feed ports.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with the default change-log retention.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_CHANGE_RETENTION)
    }

    /// Create an empty store keeping at most `retention` change-log entries.
    pub fn with_retention(retention: usize) -> Self {
        Self::from_state(State::default(), retention)
    }

    /// Rebuild a store from a snapshot.
    ///
    /// The change log starts empty at the snapshot's head sequence.
    pub fn restore(snapshot: StoreSnapshot, retention: usize) -> Self {
        let state = State {
            markets: snapshot
                .markets
                .into_iter()
                .map(|m| (m.value.id.clone(), m))
                .collect(),
            accounts: snapshot
                .accounts
                .into_iter()
                .map(|a| (a.value.user_id.clone(), a))
                .collect(),
            ledger: snapshot.ledger,
            changes: VecDeque::new(),
            head_sequence: snapshot.head_sequence,
        };
        info!(
            markets = state.markets.len(),
            accounts = state.accounts.len(),
            trades = state.ledger.len(),
            head = state.head_sequence,
            "Store restored from snapshot"
        );
        Self::from_state(state, retention)
    }

    fn from_state(state: State, retention: usize) -> Self {
        let (signal, _) = watch::channel(FeedSignal {
            head: state.head_sequence,
            epoch: 0,
        });
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                signal,
                available: AtomicBool::new(true),
                retention: retention.max(1),
            }),
        }
    }

    /// Capture the full store state.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.shared.state.lock();
        let mut markets: Vec<_> = state.markets.values().cloned().collect();
        markets.sort_by(|a, b| a.value.id.cmp(&b.value.id));
        let mut accounts: Vec<_> = state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.value.user_id.cmp(&b.value.user_id));
        StoreSnapshot {
            markets,
            accounts,
            ledger: state.ledger.clone(),
            head_sequence: state.head_sequence,
        }
    }

    /// Sever every open feed cursor, as a dropped connection would.
    pub fn interrupt_feeds(&self) {
        warn!("Severing all change-feed cursors");
        self.shared.signal.send_modify(|s| s.epoch += 1);
    }

    /// Make `watch` fail (or succeed again), as an unreachable backend would.
    pub fn set_feed_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
        if !available {
            self.interrupt_feeds();
        }
    }

    fn notify(&self, head: u64) {
        self.shared.signal.send_modify(|s| s.head = head);
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn create_market(&self, market: Market) -> Result<Versioned<Market>, StoreError> {
        let head = {
            let mut state = self.shared.state.lock();
            if state.markets.contains_key(&market.id) {
                return Err(StoreError::MarketExists(market.id));
            }
            let stored = Versioned::new(1, market.clone());
            state.markets.insert(market.id.clone(), stored);
            let retention = self.shared.retention;
            state.record_change(ChangeOperation::Insert, market.clone(), all_fields(), retention);
            state.head_sequence
        };
        self.notify(head);
        debug!(market_id = %market.id, "Market created");
        Ok(Versioned::new(1, market))
    }

    async fn market(&self, market_id: &MarketId) -> Result<Option<Versioned<Market>>, StoreError> {
        Ok(self.shared.state.lock().markets.get(market_id).cloned())
    }

    async fn markets(&self) -> Result<Vec<Versioned<Market>>, StoreError> {
        let mut markets: Vec<_> = self.shared.state.lock().markets.values().cloned().collect();
        markets.sort_by(|a, b| a.value.created_at.cmp(&b.value.created_at));
        Ok(markets)
    }

    async fn account(&self, user_id: &UserId) -> Result<Option<Versioned<UserAccount>>, StoreError> {
        Ok(self.shared.state.lock().accounts.get(user_id).cloned())
    }

    async fn ensure_account(
        &self,
        user_id: &UserId,
        starting_balance: f64,
    ) -> Result<Versioned<UserAccount>, StoreError> {
        let mut state = self.shared.state.lock();
        let account = state.accounts.entry(user_id.clone()).or_insert_with(|| {
            debug!(user_id = %user_id, balance = starting_balance, "Account opened");
            Versioned::new(1, UserAccount::new(user_id.clone(), starting_balance))
        });
        Ok(account.clone())
    }

    async fn holders(&self, market_id: &MarketId) -> Result<Vec<Versioned<UserAccount>>, StoreError> {
        let state = self.shared.state.lock();
        let mut holders: Vec<_> = state
            .accounts
            .values()
            .filter(|a| a.value.positions.contains_key(market_id))
            .cloned()
            .collect();
        holders.sort_by(|a, b| a.value.user_id.cmp(&b.value.user_id));
        Ok(holders)
    }

    async fn commit_trade(&self, commit: TradeCommit) -> Result<(), StoreError> {
        let head = {
            let mut state = self.shared.state.lock();
            state.check_market(&commit.market)?;
            state.check_account(&commit.account)?;

            let retention = self.shared.retention;
            state.write_account(commit.account);
            state.ledger.push(commit.trade);
            state.write_market(commit.market, retention);
            state.head_sequence
        };
        self.notify(head);
        Ok(())
    }

    async fn commit_market(&self, commit: MarketCommit) -> Result<(), StoreError> {
        let head = {
            let mut state = self.shared.state.lock();
            state.check_market(&commit.market)?;
            for account in &commit.accounts {
                state.check_account(account)?;
            }

            let retention = self.shared.retention;
            for account in commit.accounts {
                state.write_account(account);
            }
            state.write_market(commit.market, retention);
            state.head_sequence
        };
        self.notify(head);
        Ok(())
    }

    async fn trades(&self, market_id: &MarketId) -> Result<Vec<Trade>, StoreError> {
        let state = self.shared.state.lock();
        Ok(state
            .ledger
            .iter()
            .filter(|t| &t.market_id == market_id)
            .cloned()
            .collect())
    }

    async fn user_trades(
        &self,
        user_id: &UserId,
        market_id: Option<&MarketId>,
        limit: usize,
    ) -> Result<Vec<Trade>, StoreError> {
        let state = self.shared.state.lock();
        Ok(state
            .ledger
            .iter()
            .rev()
            .filter(|t| &t.user_id == user_id)
            .filter(|t| market_id.is_none_or(|m| &t.market_id == m))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Cursor state threaded through the feed stream.
struct Cursor {
    shared: Arc<Shared>,
    signal: watch::Receiver<FeedSignal>,
    /// Last sequence handed out.
    position: u64,
    epoch: u64,
    finished: bool,
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    async fn watch(&self, resume_after: Option<u64>) -> Result<ChangeStream, FeedError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(FeedError::Unavailable("store unreachable".to_string()));
        }

        let signal = self.shared.signal.subscribe();
        let epoch = signal.borrow().epoch;
        let position = {
            let state = self.shared.state.lock();
            match resume_after {
                None => state.head_sequence,
                Some(seq) => {
                    let oldest = state.oldest_sequence();
                    if seq + 1 < oldest {
                        return Err(FeedError::ResumePointLost {
                            requested: seq,
                            oldest,
                        });
                    }
                    seq
                }
            }
        };

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            signal,
            position,
            epoch,
            finished: false,
        };

        Ok(stream::unfold(cursor, next_change).boxed())
    }

    async fn head(&self) -> u64 {
        self.shared.state.lock().head_sequence
    }
}

/// Yield the next change for a cursor, waiting for a commit if needed.
async fn next_change(
    mut cursor: Cursor,
) -> Option<(Result<MarketChange, FeedError>, Cursor)> {
    if cursor.finished {
        return None;
    }
    loop {
        if cursor.signal.borrow().epoch != cursor.epoch {
            cursor.finished = true;
            let err = FeedError::Disconnected("cursor severed".to_string());
            return Some((Err(err), cursor));
        }

        let next = {
            let state = cursor.shared.state.lock();
            if cursor.position + 1 < state.oldest_sequence() {
                Err(state.oldest_sequence())
            } else {
                Ok(state.change_after(cursor.position))
            }
        };

        match next {
            Ok(Some(change)) => {
                cursor.position = change.sequence;
                return Some((Ok(change), cursor));
            }
            Ok(None) => {
                if cursor.signal.changed().await.is_err() {
                    cursor.finished = true;
                    let err = FeedError::Disconnected("feed closed".to_string());
                    return Some((Err(err), cursor));
                }
            }
            Err(oldest) => {
                cursor.finished = true;
                let err = FeedError::ResumePointLost {
                    requested: cursor.position,
                    oldest,
                };
                return Some((Err(err), cursor));
            }
        }
    }
}

fn all_fields() -> Vec<MarketField> {
    vec![
        MarketField::Question,
        MarketField::Outcomes,
        MarketField::B,
        MarketField::Q,
        MarketField::Status,
        MarketField::WinningOutcome,
    ]
}

fn diff_fields(before: &Market, after: &Market) -> Vec<MarketField> {
    let mut fields = Vec::new();
    if before.question != after.question {
        fields.push(MarketField::Question);
    }
    if before.outcomes != after.outcomes {
        fields.push(MarketField::Outcomes);
    }
    if before.b != after.b {
        fields.push(MarketField::B);
    }
    if before.q != after.q {
        fields.push(MarketField::Q);
    }
    if before.status != after.status {
        fields.push(MarketField::Status);
    }
    if before.winning_outcome != after.winning_outcome {
        fields.push(MarketField::WinningOutcome);
    }
    fields
}
