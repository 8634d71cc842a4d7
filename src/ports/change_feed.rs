//! Change Feed Port - Durable Ordered Market Mutation Feed
//!
//! Change-data-capture over the market collection. Every committed
//! market mutation appears exactly once, in commit order, tagged with a
//! monotonically increasing sequence number that doubles as a resume
//! token: watching with `resume_after = Some(n)` replays everything
//! committed after `n` and then follows live commits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Market;

/// Kind of mutation recorded in the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
  Insert,
  Update,
  Replace,
}

/// Top-level market fields a change can touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketField {
  Question,
  Outcomes,
  B,
  Q,
  Status,
  WinningOutcome,
}

impl MarketField {
  /// Fields whose change alters what live viewers see.
  pub fn is_broadcast_relevant(self) -> bool {
    matches!(self, Self::Q | Self::B | Self::Status | Self::Outcomes)
  }
}

/// One committed market mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketChange {
  /// Position in the feed (resume token).
  pub sequence: u64,
  pub operation: ChangeOperation,
  /// Full post-image of the market document.
  pub market: Market,
  /// Fields that differ from the pre-image (all fields for inserts).
  pub updated_fields: Vec<MarketField>,
  pub committed_at: DateTime<Utc>,
}

/// Feed failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
  #[error("change feed unavailable: {0}")]
  Unavailable(String),

  #[error("change feed disconnected: {0}")]
  Disconnected(String),

  /// The requested resume point is older than the retained history.
  #[error("resume point {requested} no longer retained (oldest is {oldest})")]
  ResumePointLost { requested: u64, oldest: u64 },
}

/// Stream of changes. Ends (or yields an error) when the feed drops.
pub type ChangeStream = BoxStream<'static, Result<MarketChange, FeedError>>;

/// Trait for change-feed providers.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
  /// Open a feed cursor.
  ///
  /// `None` starts at the current head (live changes only);
  /// `Some(seq)` resumes strictly after `seq`.
  async fn watch(&self, resume_after: Option<u64>) -> Result<ChangeStream, FeedError>;

  /// Sequence of the most recent committed change (0 if none).
  async fn head(&self) -> u64;
}
