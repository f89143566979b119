//! Ledger trait and error types
//!
//! This module defines the trait interface for ledger backends and
//! associated error types.

use crate::dedup::{ContentHash, Signature};
use crate::ledger::{
    CampaignRecord, ConditionalHeaders, Discovery, FetchEvaluation, FetchRecord, ItemRecord,
    LedgerStatistics, RunRecord, RunStatus,
};
use crate::state::{ItemState, RateSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger unavailable after {attempts} attempts during {operation}: {source}")]
    Unavailable {
        operation: &'static str,
        attempts: u32,
        source: rusqlite::Error,
    },

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: ItemState,
        to: ItemState,
    },

    #[error("Campaign {0} is already active")]
    CampaignAlreadyActive(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl LedgerError {
    /// True when SQLite reported the database as busy or locked
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Trait for ledger backend implementations
///
/// Every method takes `&self`; implementations serialize access internally so a
/// single ledger can be shared as `Arc<dyn Ledger>` between the dedup engine, the
/// scheduler and the run coordinator. Item transitions are atomic: a transition
/// that does not apply to the item's current state fails with
/// [`LedgerError::InvalidTransition`] and changes nothing.
pub trait Ledger: Send + Sync {
    // ===== Items =====

    /// Records an item the first time it is seen
    ///
    /// Returns true if the item was new. Concurrent discovery of the same key
    /// yields exactly one `true`.
    fn discover(&self, key: &str, source: &str, discovery: &Discovery) -> LedgerResult<bool>;

    /// Gets an item by key
    fn get(&self, key: &str) -> LedgerResult<Option<ItemRecord>>;

    /// Decides whether the item should be fetched at `now`
    ///
    /// Unknown keys are fetchable. `force` makes every known item fetchable,
    /// skipped ones included.
    fn should_fetch_at(&self, key: &str, force: bool, now: DateTime<Utc>) -> LedgerResult<bool>;

    /// Decides whether the item should be fetched now
    fn should_fetch(&self, key: &str, force: bool) -> LedgerResult<bool> {
        self.should_fetch_at(key, force, Utc::now())
    }

    /// Validators from the last successful fetch, for a conditional request
    fn conditional_headers(&self, key: &str) -> LedgerResult<ConditionalHeaders>;

    /// Records a completed fetch and moves the item to `fetched`
    ///
    /// Allowed from `discovered`, from any state the recheck policy marks eligible,
    /// and, with `force`, from every state. The fetch is appended
    /// to the item's history.
    fn mark_fetched(&self, key: &str, record: &FetchRecord, force: bool) -> LedgerResult<()>;

    /// Records a 304 answer: the item keeps its state and fingerprints, only the
    /// check time moves forward
    fn mark_not_modified(&self, key: &str) -> LedgerResult<()>;

    /// Moves a fetched item to `processed`
    fn mark_processed(&self, key: &str) -> LedgerResult<()>;

    /// Moves a fetched item to `duplicate`, remembering what it duplicates
    fn mark_duplicate(&self, key: &str, duplicate_of: Option<&str>) -> LedgerResult<()>;

    /// Moves a discovered or fetched item to `failed`
    fn mark_failed(&self, key: &str, error: &str) -> LedgerResult<()>;

    /// Moves a discovered item to `skipped`
    fn mark_skipped(&self, key: &str, reason: &str) -> LedgerResult<()>;

    /// Moves a failed item back to `discovered` so it can be retried
    fn requeue(&self, key: &str) -> LedgerResult<()>;

    /// Fetch history of an item, oldest first
    fn fetch_history(&self, key: &str) -> LedgerResult<Vec<FetchEvaluation>>;

    /// Per-state counts for one source
    fn statistics(&self, source: &str) -> LedgerResult<LedgerStatistics>;

    /// Per-state counts across all sources
    fn statistics_all(&self) -> LedgerResult<LedgerStatistics>;

    /// Every source that has at least one item
    fn sources(&self) -> LedgerResult<Vec<String>>;

    // ===== Fingerprints =====

    /// Finds a fetched or processed item of `source` with this content hash, other than `exclude_key`
    fn find_by_content_hash(
        &self,
        source: &str,
        digest: &ContentHash,
        exclude_key: &str,
    ) -> LedgerResult<Option<String>>;

    /// The stored similarity signature of an item, if it was ever fetched
    fn similarity_signature(&self, key: &str) -> LedgerResult<Option<Signature>>;

    // ===== Campaigns =====

    /// Starts a campaign at `now`; fails if one is already active
    fn start_campaign_at(
        &self,
        name: &str,
        duration: chrono::Duration,
        config_snapshot: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<CampaignRecord>;

    /// Starts a campaign now
    fn start_campaign(
        &self,
        name: &str,
        duration: chrono::Duration,
        config_snapshot: &str,
    ) -> LedgerResult<CampaignRecord> {
        self.start_campaign_at(name, duration, config_snapshot, Utc::now())
    }

    /// The single active campaign, if any
    fn active_campaign(&self) -> LedgerResult<Option<CampaignRecord>>;

    /// True while a campaign is active
    fn is_active_campaign(&self) -> LedgerResult<bool> {
        Ok(self.active_campaign()?.is_some())
    }

    /// Completes the active campaign if its duration has run out by `now`
    ///
    /// Returns true if a campaign was completed by this call.
    fn complete_if_expired_at(&self, now: DateTime<Utc>) -> LedgerResult<bool>;

    /// Completes the active campaign if its duration has run out
    fn complete_if_expired(&self) -> LedgerResult<bool> {
        self.complete_if_expired_at(Utc::now())
    }

    /// Completes the active campaign at `now` regardless of its duration
    ///
    /// Returns true if a campaign was completed by this call.
    fn complete_campaign_at(&self, now: DateTime<Utc>) -> LedgerResult<bool>;

    /// All campaigns, oldest first
    fn campaigns(&self) -> LedgerResult<Vec<CampaignRecord>>;

    // ===== Runs =====

    /// Records the start of a run of `source`
    ///
    /// Runs of the same source still marked running are from processes that died;
    /// they are marked interrupted.
    fn begin_run(&self, source: &str) -> LedgerResult<i64>;

    /// Records the end of a run
    fn finish_run(&self, run_id: i64, status: RunStatus) -> LedgerResult<()>;

    /// The most recent run of a source
    fn latest_run(&self, source: &str) -> LedgerResult<Option<RunRecord>>;

    /// Finish time of the latest completed run of a source
    fn last_successful_run(&self, source: &str) -> LedgerResult<Option<DateTime<Utc>>>;

    // ===== Rate State =====

    /// Loads all persisted rate states
    fn load_rate_states(&self) -> LedgerResult<HashMap<String, RateSnapshot>>;

    /// Upserts rate states; sources not in `states` are left untouched
    fn save_rate_states(&self, states: &HashMap<String, RateSnapshot>) -> LedgerResult<()>;

    // ===== Source Locks =====

    /// Takes the lock for `source` if it is free or its holder's lease expired
    ///
    /// Returns true if the lock is now held with `token`.
    fn try_lock(
        &self,
        source: &str,
        token: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool>;

    /// Pushes the lease of a still-held lock forward
    ///
    /// Returns false if the lock is no longer held with `token`.
    fn extend_lock(
        &self,
        source: &str,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool>;

    /// Releases the lock if it is still held with `token`; no-op otherwise
    fn unlock(&self, source: &str, token: &str) -> LedgerResult<()>;

    /// Expiry of the current lock on `source`, if any row exists
    fn lock_expiry(&self, source: &str) -> LedgerResult<Option<DateTime<Utc>>>;
}
