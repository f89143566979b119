//! Crawl ledger: the durable record of every item, campaign and run
//!
//! This module handles all persistent crawl state, including:
//! - SQLite database initialization and schema management
//! - Item lifecycle transitions and fetch history
//! - Campaign and run tracking for the scheduler
//! - Rate-state persistence and per-source execution locks

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteLedger;
pub use traits::{Ledger, LedgerError, LedgerResult};

use crate::dedup::{ContentHash, Signature};
use crate::state::{ItemKind, ItemState};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Represents an item in the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub id: i64,
    pub key: String,
    pub source: String,
    pub kind: ItemKind,
    pub state: ItemState,
    pub metadata: serde_json::Value,
    pub discovered_at: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub http_status: Option<u16>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: Option<ContentHash>,
    pub similarity_signature: Option<Signature>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub skip_reason: Option<String>,
    pub duplicate_of: Option<String>,
}

/// What the caller knows about an item when it is first discovered
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    pub kind: ItemKind,
    pub metadata: serde_json::Value,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            kind: ItemKind::Document,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl Discovery {
    pub fn listing() -> Self {
        Self {
            kind: ItemKind::Listing,
            ..Self::default()
        }
    }
}

/// Outcome of a successful fetch, recorded by `mark_fetched`
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRecord {
    pub http_status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: ContentHash,
    pub signature: Signature,
}

/// One immutable row of an item's fetch history
#[derive(Debug, Clone, PartialEq)]
pub struct FetchEvaluation {
    pub item_key: String,
    pub fetched_at: DateTime<Utc>,
    pub http_status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: ContentHash,
}

/// Validators for a conditional request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ConditionalHeaders {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// When an item that was already handled becomes eligible for another fetch
#[derive(Debug, Clone, PartialEq)]
pub struct RecheckPolicy {
    /// Listings are re-fetched once this long has passed since the last check.
    /// `None` disables automatic listing re-checks.
    pub listing_interval: Option<Duration>,

    /// Items left in `fetched` by a run that died before resolving them are fetched again
    pub refetch_stranded: bool,

    /// Failed items become eligible again this long after their last failure.
    /// `None` means failed items are only retried with `force`.
    pub retry_failed_after: Option<Duration>,

    /// Failed items with this many failures are never retried automatically
    pub max_failures: u32,
}

impl Default for RecheckPolicy {
    fn default() -> Self {
        Self {
            listing_interval: Some(Duration::hours(6)),
            refetch_stranded: true,
            retry_failed_after: None,
            max_failures: 3,
        }
    }
}

impl RecheckPolicy {
    /// Decides whether an item may be fetched again without `force`
    pub fn is_eligible(&self, item: &ItemRecord, now: DateTime<Utc>) -> bool {
        match item.state {
            ItemState::Discovered => true,
            ItemState::Fetched => self.refetch_stranded,
            ItemState::Processed | ItemState::Duplicate => {
                item.kind == ItemKind::Listing
                    && match (self.listing_interval, item.last_checked_at) {
                        (Some(interval), Some(checked)) => checked
                            .checked_add_signed(interval)
                            .is_some_and(|due| due <= now),
                        (Some(_), None) => true,
                        (None, _) => false,
                    }
            }
            ItemState::Failed => match self.retry_failed_after {
                Some(delay) => {
                    item.failure_count < self.max_failures
                        && item
                            .updated_at
                            .checked_add_signed(delay)
                            .is_some_and(|due| due <= now)
                }
                None => false,
            },
            ItemState::Skipped => false,
        }
    }
}

/// Tuning knobs for a SQLite-backed ledger
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerOptions {
    /// How long SQLite itself waits on a locked database before reporting busy
    pub busy_timeout: std::time::Duration,

    /// Extra attempts after SQLite reports busy/locked
    pub max_retries: u32,

    /// Delay before the first retry; doubled on each further attempt
    pub retry_base: std::time::Duration,

    pub recheck: RecheckPolicy,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            busy_timeout: std::time::Duration::from_secs(5),
            max_retries: 3,
            retry_base: std::time::Duration::from_millis(50),
            recheck: RecheckPolicy::default(),
        }
    }
}

/// Per-state item counts for one source (or all sources)
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerStatistics {
    pub source: Option<String>,
    pub counts: HashMap<ItemState, u64>,
    pub total: u64,
    /// duplicate / (processed + duplicate), 0 when nothing was resolved
    pub duplicate_rate: f64,
}

impl LedgerStatistics {
    pub fn from_counts(source: Option<String>, counts: HashMap<ItemState, u64>) -> Self {
        let total = counts.values().sum();
        let processed = counts.get(&ItemState::Processed).copied().unwrap_or(0);
        let duplicate = counts.get(&ItemState::Duplicate).copied().unwrap_or(0);
        let resolved = processed + duplicate;
        let duplicate_rate = if resolved > 0 {
            duplicate as f64 / resolved as f64
        } else {
            0.0
        };
        Self {
            source,
            counts,
            total,
            duplicate_rate,
        }
    }

    pub fn count(&self, state: ItemState) -> u64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

/// Represents a collection campaign
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignRecord {
    pub id: i64,
    pub name: String,
    pub status: CampaignStatus,
    pub start_date: DateTime<Utc>,
    pub duration: Duration,
    pub end_date: Option<DateTime<Utc>>,
    pub config_snapshot: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignRecord {
    /// The moment the campaign's planned duration runs out
    ///
    /// Saturates at the latest representable time.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.start_date
            .checked_add_signed(self.duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Status of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Active,
    Completed,
}

impl CampaignStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Represents one run of one source
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: i64,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
