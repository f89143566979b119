//! SQLite ledger implementation
//!
//! This module provides a SQLite-based implementation of the Ledger trait.

use crate::dedup::{ContentHash, Signature};
use crate::ledger::schema::initialize_schema;
use crate::ledger::traits::{Ledger, LedgerError, LedgerResult};
use crate::ledger::{
    CampaignRecord, CampaignStatus, ConditionalHeaders, Discovery, FetchEvaluation, FetchRecord,
    ItemRecord, LedgerOptions, LedgerStatistics, RunRecord, RunStatus,
};
use crate::state::{ItemKind, ItemState, RateSnapshot};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

const ITEM_COLUMNS: &str = "id, key, source, kind, state, metadata, discovered_at, fetched_at, \
     processed_at, last_checked_at, updated_at, http_status, etag, last_modified, content_hash, \
     similarity_signature, failure_count, last_error, skip_reason, duplicate_of";

const CAMPAIGN_COLUMNS: &str = "id, name, status, start_date, duration_secs, end_date, \
     config_snapshot, created_at, updated_at";

/// SQLite ledger backend
///
/// One connection guarded by a mutex. Every multi-statement operation runs in an
/// immediate transaction, and busy/locked answers from SQLite are retried with
/// exponential backoff before surfacing as [`LedgerError::Unavailable`].
///
/// Every call blocks the calling thread, busy retries included. Each attempt may
/// wait `busy_timeout` inside SQLite, and the retry sleeps add up to
/// `retry_base * (2^max_retries - 1)`. Async callers run it on a multi-threaded
/// runtime or through `spawn_blocking`.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
    options: LedgerOptions,
}

impl SqliteLedger {
    /// Opens (or creates) the ledger database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `options` - Retry and recheck settings
    pub fn open(path: &Path, options: LedgerOptions) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(options.busy_timeout)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;
        debug!("Opened ledger at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    /// Creates an in-memory ledger with default options
    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::open_in_memory_with(LedgerOptions::default())
    }

    /// Creates an in-memory ledger
    pub fn open_in_memory_with(options: LedgerOptions) -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    pub fn options(&self) -> &LedgerOptions {
        &self.options
    }

    /// Runs `f` against the connection, retrying while SQLite reports busy/locked
    fn with_retry<T, F>(&self, operation: &'static str, mut f: F) -> LedgerResult<T>
    where
        F: FnMut(&mut Connection) -> LedgerResult<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = {
                let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
                f(&mut conn)
            };

            match result {
                Err(err) if err.is_busy() => {
                    attempt += 1;
                    if attempt > self.options.max_retries {
                        return match err {
                            LedgerError::Sqlite(source) => Err(LedgerError::Unavailable {
                                operation,
                                attempts: attempt,
                                source,
                            }),
                            other => Err(other),
                        };
                    }
                    let delay = self
                        .options
                        .retry_base
                        .saturating_mul(1u32 << (attempt - 1).min(16));
                    warn!(
                        "Ledger busy during {}, retrying in {:?} (attempt {}/{})",
                        operation, delay, attempt, self.options.max_retries
                    );
                    // Blocks the caller's thread; see the type-level docs
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Runs `f` inside an immediate transaction, with busy retries
    fn transact<T, F>(&self, operation: &'static str, mut f: F) -> LedgerResult<T>
    where
        F: FnMut(&Connection) -> LedgerResult<T>,
    {
        self.with_retry(operation, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn apply_transition(
        &self,
        operation: &'static str,
        key: &str,
        to: ItemState,
        sql: &str,
        detail: Option<&str>,
    ) -> LedgerResult<()> {
        self.transact(operation, |conn| {
            let item = require_item(conn, key)?;
            if !item.state.can_transition_to(to) {
                return Err(invalid_transition(&item, to));
            }
            let now = fmt_ts(Utc::now());
            let changed = conn.execute(
                sql,
                params![to.to_db_string(), now, detail, key, item.state.to_db_string()],
            )?;
            ensure_changed(changed, &item, to)
        })
    }
}

impl Ledger for SqliteLedger {
    // ===== Items =====

    fn discover(&self, key: &str, source: &str, discovery: &Discovery) -> LedgerResult<bool> {
        let now = fmt_ts(Utc::now());
        let metadata = discovery.metadata.to_string();
        let inserted = self.with_retry("discover", |conn| {
            let changed = conn.execute(
                "INSERT INTO items (key, source, kind, state, metadata, discovered_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(key) DO NOTHING",
                params![
                    key,
                    source,
                    discovery.kind.to_db_string(),
                    ItemState::Discovered.to_db_string(),
                    metadata,
                    now
                ],
            )?;
            Ok(changed == 1)
        })?;

        if inserted {
            debug!("Discovered {} ({})", key, source);
        }
        Ok(inserted)
    }

    fn get(&self, key: &str) -> LedgerResult<Option<ItemRecord>> {
        self.with_retry("get", |conn| load_item(conn, key))
    }

    fn should_fetch_at(&self, key: &str, force: bool, now: DateTime<Utc>) -> LedgerResult<bool> {
        let Some(item) = self.get(key)? else {
            return Ok(true);
        };
        Ok(match item.state {
            _ if force => true,
            ItemState::Discovered => true,
            ItemState::Skipped => false,
            _ => self.options.recheck.is_eligible(&item, now),
        })
    }

    fn conditional_headers(&self, key: &str) -> LedgerResult<ConditionalHeaders> {
        Ok(match self.get(key)? {
            Some(item) if item.state.is_resolved() => ConditionalHeaders {
                etag: item.etag,
                last_modified: item.last_modified,
            },
            _ => ConditionalHeaders::default(),
        })
    }

    fn mark_fetched(&self, key: &str, record: &FetchRecord, force: bool) -> LedgerResult<()> {
        let hash = record.content_hash.to_hex();
        let signature = record.signature.to_bytes();

        self.transact("mark_fetched", |conn| {
            let item = require_item(conn, key)?;
            let now = Utc::now();
            let allowed = match item.state {
                _ if force => true,
                ItemState::Discovered => true,
                ItemState::Skipped => false,
                _ => self.options.recheck.is_eligible(&item, now),
            };
            if !allowed {
                return Err(invalid_transition(&item, ItemState::Fetched));
            }

            let ts = fmt_ts(now);
            let changed = conn.execute(
                "UPDATE items SET state = ?1, fetched_at = ?2, last_checked_at = ?2, updated_at = ?2,
                     http_status = ?3, etag = ?4, last_modified = ?5, content_hash = ?6,
                     similarity_signature = ?7, duplicate_of = NULL
                 WHERE key = ?8 AND state = ?9",
                params![
                    ItemState::Fetched.to_db_string(),
                    ts,
                    record.http_status,
                    record.etag,
                    record.last_modified,
                    hash,
                    signature,
                    key,
                    item.state.to_db_string()
                ],
            )?;
            ensure_changed(changed, &item, ItemState::Fetched)?;

            conn.execute(
                "INSERT INTO fetches (item_key, fetched_at, http_status, etag, last_modified, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key,
                    ts,
                    record.http_status,
                    record.etag,
                    record.last_modified,
                    hash
                ],
            )?;
            Ok(())
        })
    }

    fn mark_not_modified(&self, key: &str) -> LedgerResult<()> {
        self.transact("mark_not_modified", |conn| {
            let item = require_item(conn, key)?;
            if !item.state.is_resolved() {
                return Err(invalid_transition(&item, item.state));
            }
            let changed = conn.execute(
                "UPDATE items SET last_checked_at = ?1 WHERE key = ?2 AND state = ?3",
                params![fmt_ts(Utc::now()), key, item.state.to_db_string()],
            )?;
            ensure_changed(changed, &item, item.state)
        })
    }

    fn mark_processed(&self, key: &str) -> LedgerResult<()> {
        self.apply_transition(
            "mark_processed",
            key,
            ItemState::Processed,
            "UPDATE items SET state = ?1, processed_at = ?2, updated_at = ?2, last_error = ?3
             WHERE key = ?4 AND state = ?5",
            None,
        )
    }

    fn mark_duplicate(&self, key: &str, duplicate_of: Option<&str>) -> LedgerResult<()> {
        self.apply_transition(
            "mark_duplicate",
            key,
            ItemState::Duplicate,
            "UPDATE items SET state = ?1, processed_at = ?2, updated_at = ?2, duplicate_of = ?3
             WHERE key = ?4 AND state = ?5",
            duplicate_of,
        )
    }

    fn mark_failed(&self, key: &str, error: &str) -> LedgerResult<()> {
        self.apply_transition(
            "mark_failed",
            key,
            ItemState::Failed,
            "UPDATE items SET state = ?1, updated_at = ?2, last_checked_at = ?2, last_error = ?3,
                 failure_count = failure_count + 1
             WHERE key = ?4 AND state = ?5",
            Some(error),
        )
    }

    fn mark_skipped(&self, key: &str, reason: &str) -> LedgerResult<()> {
        self.apply_transition(
            "mark_skipped",
            key,
            ItemState::Skipped,
            "UPDATE items SET state = ?1, updated_at = ?2, skip_reason = ?3
             WHERE key = ?4 AND state = ?5",
            Some(reason),
        )
    }

    fn requeue(&self, key: &str) -> LedgerResult<()> {
        self.apply_transition(
            "requeue",
            key,
            ItemState::Discovered,
            "UPDATE items SET state = ?1, updated_at = ?2, skip_reason = ?3
             WHERE key = ?4 AND state = ?5",
            None,
        )
    }

    fn fetch_history(&self, key: &str) -> LedgerResult<Vec<FetchEvaluation>> {
        self.with_retry("fetch_history", |conn| {
            let mut stmt = conn.prepare(
                "SELECT item_key, fetched_at, http_status, etag, last_modified, content_hash
                 FROM fetches WHERE item_key = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![key], |row| {
                    Ok(FetchEvaluation {
                        item_key: row.get(0)?,
                        fetched_at: parse_ts(1, row.get(1)?)?,
                        http_status: row.get(2)?,
                        etag: row.get(3)?,
                        last_modified: row.get(4)?,
                        content_hash: parse_hash(5, row.get(5)?)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn statistics(&self, source: &str) -> LedgerResult<LedgerStatistics> {
        let counts = self.with_retry("statistics", |conn| {
            let mut stmt =
                conn.prepare("SELECT state, COUNT(*) FROM items WHERE source = ?1 GROUP BY state")?;
            let rows = stmt
                .query_map(params![source], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(LedgerStatistics::from_counts(
            Some(source.to_string()),
            collect_counts(counts),
        ))
    }

    fn statistics_all(&self) -> LedgerResult<LedgerStatistics> {
        let counts = self.with_retry("statistics_all", |conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM items GROUP BY state")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        Ok(LedgerStatistics::from_counts(None, collect_counts(counts)))
    }

    fn sources(&self) -> LedgerResult<Vec<String>> {
        self.with_retry("sources", |conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT source FROM items ORDER BY source")?;
            let sources = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(sources)
        })
    }

    // ===== Fingerprints =====

    fn find_by_content_hash(
        &self,
        source: &str,
        digest: &ContentHash,
        exclude_key: &str,
    ) -> LedgerResult<Option<String>> {
        let hash = digest.to_hex();
        self.with_retry("find_by_content_hash", |conn| {
            let found = conn
                .query_row(
                    "SELECT key FROM items
                     WHERE source = ?1 AND content_hash = ?2 AND key != ?3 AND state IN (?4, ?5)
                     ORDER BY id LIMIT 1",
                    params![
                        source,
                        hash,
                        exclude_key,
                        ItemState::Fetched.to_db_string(),
                        ItemState::Processed.to_db_string()
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found)
        })
    }

    fn similarity_signature(&self, key: &str) -> LedgerResult<Option<Signature>> {
        let bytes: Option<Vec<u8>> = self.with_retry("similarity_signature", |conn| {
            let bytes = conn
                .query_row(
                    "SELECT similarity_signature FROM items WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, Option<Vec<u8>>>(0),
                )
                .optional()?;
            Ok(bytes.flatten())
        })?;

        match bytes {
            Some(bytes) => Signature::from_bytes(&bytes)
                .map(Some)
                .ok_or_else(|| LedgerError::Serialization(format!("bad similarity signature of {}", key))),
            None => Ok(None),
        }
    }

    // ===== Campaigns =====

    fn start_campaign_at(
        &self,
        name: &str,
        duration: chrono::Duration,
        config_snapshot: &str,
        now: DateTime<Utc>,
    ) -> LedgerResult<CampaignRecord> {
        let campaign = self.transact("start_campaign", |conn| {
            if let Some(active) = load_active_campaign(conn)? {
                return Err(LedgerError::CampaignAlreadyActive(active.id));
            }

            let ts = fmt_ts(now);
            conn.execute(
                "INSERT INTO campaigns (name, status, start_date, duration_secs, config_snapshot, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?3, ?3)",
                params![
                    name,
                    CampaignStatus::Active.to_db_string(),
                    ts,
                    duration.num_seconds(),
                    config_snapshot
                ],
            )?;

            Ok(CampaignRecord {
                id: conn.last_insert_rowid(),
                name: name.to_string(),
                status: CampaignStatus::Active,
                start_date: now,
                duration: chrono::Duration::try_seconds(duration.num_seconds()).unwrap_or(duration),
                end_date: None,
                config_snapshot: config_snapshot.to_string(),
                created_at: now,
                updated_at: now,
            })
        })?;

        debug!("Started campaign {} ({})", campaign.id, campaign.name);
        Ok(campaign)
    }

    fn active_campaign(&self) -> LedgerResult<Option<CampaignRecord>> {
        self.with_retry("active_campaign", |conn| load_active_campaign(conn))
    }

    fn complete_if_expired_at(&self, now: DateTime<Utc>) -> LedgerResult<bool> {
        self.transact("complete_if_expired", |conn| {
            let Some(active) = load_active_campaign(conn)? else {
                return Ok(false);
            };
            if active.expires_at() > now {
                return Ok(false);
            }
            complete_campaign(conn, active.id, active.expires_at(), now)
        })
    }

    fn complete_campaign_at(&self, now: DateTime<Utc>) -> LedgerResult<bool> {
        self.transact("complete_campaign", |conn| {
            let Some(active) = load_active_campaign(conn)? else {
                return Ok(false);
            };
            complete_campaign(conn, active.id, now, now)
        })
    }

    fn campaigns(&self) -> LedgerResult<Vec<CampaignRecord>> {
        self.with_retry("campaigns", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM campaigns ORDER BY id",
                CAMPAIGN_COLUMNS
            ))?;
            let campaigns = stmt
                .query_map([], row_to_campaign)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(campaigns)
        })
    }

    // ===== Runs =====

    fn begin_run(&self, source: &str) -> LedgerResult<i64> {
        self.transact("begin_run", |conn| {
            let now = fmt_ts(Utc::now());
            let interrupted = conn.execute(
                "UPDATE runs SET status = ?1, finished_at = ?2 WHERE source = ?3 AND status = ?4",
                params![
                    RunStatus::Interrupted.to_db_string(),
                    now,
                    source,
                    RunStatus::Running.to_db_string()
                ],
            )?;
            if interrupted > 0 {
                warn!(
                    "Marked {} stale run(s) of {} as interrupted",
                    interrupted, source
                );
            }

            conn.execute(
                "INSERT INTO runs (source, started_at, status) VALUES (?1, ?2, ?3)",
                params![source, now, RunStatus::Running.to_db_string()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn finish_run(&self, run_id: i64, status: RunStatus) -> LedgerResult<()> {
        self.with_retry("finish_run", |conn| {
            let changed = conn.execute(
                "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
                params![status.to_db_string(), fmt_ts(Utc::now()), run_id],
            )?;
            if changed == 0 {
                return Err(LedgerError::NotFound(format!("run {}", run_id)));
            }
            Ok(())
        })
    }

    fn latest_run(&self, source: &str) -> LedgerResult<Option<RunRecord>> {
        self.with_retry("latest_run", |conn| {
            let run = conn
                .query_row(
                    "SELECT id, source, started_at, finished_at, status FROM runs
                     WHERE source = ?1 ORDER BY id DESC LIMIT 1",
                    params![source],
                    |row| {
                        let status: String = row.get(4)?;
                        Ok(RunRecord {
                            id: row.get(0)?,
                            source: row.get(1)?,
                            started_at: parse_ts(2, row.get(2)?)?,
                            finished_at: opt_ts(row, 3)?,
                            status: RunStatus::from_db_string(&status).ok_or_else(|| {
                                conversion_error(4, format!("unknown run status {}", status))
                            })?,
                        })
                    },
                )
                .optional()?;
            Ok(run)
        })
    }

    fn last_successful_run(&self, source: &str) -> LedgerResult<Option<DateTime<Utc>>> {
        self.with_retry("last_successful_run", |conn| {
            let finished: Option<String> = conn
                .query_row(
                    "SELECT finished_at FROM runs
                     WHERE source = ?1 AND status = ?2 AND finished_at IS NOT NULL
                     ORDER BY finished_at DESC LIMIT 1",
                    params![source, RunStatus::Completed.to_db_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(finished.map(|s| parse_ts(0, s)).transpose()?)
        })
    }

    // ===== Rate State =====

    fn load_rate_states(&self) -> LedgerResult<HashMap<String, RateSnapshot>> {
        self.with_retry("load_rate_states", |conn| {
            let mut stmt = conn.prepare(
                "SELECT source, backoff_level, backoff_until, last_request_at, window_started_at, window_count
                 FROM rate_states",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    RateSnapshot {
                        backoff_level: row.get(1)?,
                        backoff_until: opt_ts(row, 2)?,
                        last_request_at: opt_ts(row, 3)?,
                        window_started_at: opt_ts(row, 4)?,
                        window_count: row.get(5)?,
                    },
                ))
            })?;

            let mut states = HashMap::new();
            for row in rows {
                let (source, snapshot) = row?;
                states.insert(source, snapshot);
            }
            Ok(states)
        })
    }

    fn save_rate_states(&self, states: &HashMap<String, RateSnapshot>) -> LedgerResult<()> {
        self.transact("save_rate_states", |conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO rate_states (source, backoff_level, backoff_until, last_request_at, window_started_at, window_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(source) DO UPDATE SET
                     backoff_level = excluded.backoff_level,
                     backoff_until = excluded.backoff_until,
                     last_request_at = excluded.last_request_at,
                     window_started_at = excluded.window_started_at,
                     window_count = excluded.window_count",
            )?;
            for (source, snapshot) in states {
                stmt.execute(params![
                    source,
                    snapshot.backoff_level,
                    snapshot.backoff_until.map(fmt_ts),
                    snapshot.last_request_at.map(fmt_ts),
                    snapshot.window_started_at.map(fmt_ts),
                    snapshot.window_count
                ])?;
            }
            Ok(())
        })
    }

    // ===== Source Locks =====

    fn try_lock(
        &self,
        source: &str,
        token: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let acquired_at = now.timestamp_millis();
        let expires_at = lease_end(acquired_at, ttl);
        self.with_retry("try_lock", |conn| {
            // The upsert only overwrites a row whose lease has run out
            let changed = conn.execute(
                "INSERT INTO source_locks (source, token, holder, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(source) DO UPDATE SET
                     token = excluded.token,
                     holder = excluded.holder,
                     acquired_at = excluded.acquired_at,
                     expires_at = excluded.expires_at
                 WHERE source_locks.expires_at <= excluded.acquired_at",
                params![source, token, holder, acquired_at, expires_at],
            )?;
            Ok(changed == 1)
        })
    }

    fn extend_lock(
        &self,
        source: &str,
        token: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let expires_at = lease_end(now.timestamp_millis(), ttl);
        self.with_retry("extend_lock", |conn| {
            let changed = conn.execute(
                "UPDATE source_locks SET expires_at = ?1 WHERE source = ?2 AND token = ?3",
                params![expires_at, source, token],
            )?;
            Ok(changed == 1)
        })
    }

    fn unlock(&self, source: &str, token: &str) -> LedgerResult<()> {
        self.with_retry("unlock", |conn| {
            conn.execute(
                "DELETE FROM source_locks WHERE source = ?1 AND token = ?2",
                params![source, token],
            )?;
            Ok(())
        })
    }

    fn lock_expiry(&self, source: &str) -> LedgerResult<Option<DateTime<Utc>>> {
        let millis: Option<i64> = self.with_retry("lock_expiry", |conn| {
            let millis = conn
                .query_row(
                    "SELECT expires_at FROM source_locks WHERE source = ?1",
                    params![source],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(millis)
        })?;
        Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }
}

// ===== Row helpers =====

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {}: {}", value, e)))
}

fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|value| parse_ts(idx, value))
        .transpose()
}

fn parse_hash(idx: usize, value: String) -> rusqlite::Result<ContentHash> {
    ContentHash::from_hex(&value)
        .ok_or_else(|| conversion_error(idx, format!("bad content hash {}", value)))
}

fn lease_end(start_millis: i64, ttl: Duration) -> i64 {
    start_millis.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ItemRecord> {
    let kind: String = row.get(3)?;
    let state: String = row.get(4)?;
    let metadata: String = row.get(5)?;

    Ok(ItemRecord {
        id: row.get(0)?,
        key: row.get(1)?,
        source: row.get(2)?,
        kind: ItemKind::from_db_string(&kind)
            .ok_or_else(|| conversion_error(3, format!("unknown item kind {}", kind)))?,
        state: ItemState::from_db_string(&state)
            .ok_or_else(|| conversion_error(4, format!("unknown item state {}", state)))?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| conversion_error(5, format!("bad metadata: {}", e)))?,
        discovered_at: parse_ts(6, row.get(6)?)?,
        fetched_at: opt_ts(row, 7)?,
        processed_at: opt_ts(row, 8)?,
        last_checked_at: opt_ts(row, 9)?,
        updated_at: parse_ts(10, row.get(10)?)?,
        http_status: row.get(11)?,
        etag: row.get(12)?,
        last_modified: row.get(13)?,
        content_hash: row
            .get::<_, Option<String>>(14)?
            .map(|hex| parse_hash(14, hex))
            .transpose()?,
        similarity_signature: row
            .get::<_, Option<Vec<u8>>>(15)?
            .and_then(|bytes| Signature::from_bytes(&bytes)),
        failure_count: row.get(16)?,
        last_error: row.get(17)?,
        skip_reason: row.get(18)?,
        duplicate_of: row.get(19)?,
    })
}

fn row_to_campaign(row: &Row<'_>) -> rusqlite::Result<CampaignRecord> {
    let status: String = row.get(2)?;
    Ok(CampaignRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        status: CampaignStatus::from_db_string(&status)
            .ok_or_else(|| conversion_error(2, format!("unknown campaign status {}", status)))?,
        start_date: parse_ts(3, row.get(3)?)?,
        duration: chrono::Duration::try_seconds(row.get(4)?).unwrap_or(chrono::Duration::MAX),
        end_date: opt_ts(row, 5)?,
        config_snapshot: row.get(6)?,
        created_at: parse_ts(7, row.get(7)?)?,
        updated_at: parse_ts(8, row.get(8)?)?,
    })
}

fn load_item(conn: &Connection, key: &str) -> LedgerResult<Option<ItemRecord>> {
    let item = conn
        .query_row(
            &format!("SELECT {} FROM items WHERE key = ?1", ITEM_COLUMNS),
            params![key],
            row_to_item,
        )
        .optional()?;
    Ok(item)
}

fn require_item(conn: &Connection, key: &str) -> LedgerResult<ItemRecord> {
    load_item(conn, key)?.ok_or_else(|| LedgerError::NotFound(key.to_string()))
}

fn load_active_campaign(conn: &Connection) -> LedgerResult<Option<CampaignRecord>> {
    let campaign = conn
        .query_row(
            &format!(
                "SELECT {} FROM campaigns WHERE status = ?1",
                CAMPAIGN_COLUMNS
            ),
            params![CampaignStatus::Active.to_db_string()],
            row_to_campaign,
        )
        .optional()?;
    Ok(campaign)
}

fn complete_campaign(
    conn: &Connection,
    id: i64,
    end_date: DateTime<Utc>,
    now: DateTime<Utc>,
) -> LedgerResult<bool> {
    let changed = conn.execute(
        "UPDATE campaigns SET status = ?1, end_date = ?2, updated_at = ?3
         WHERE id = ?4 AND status = ?5",
        params![
            CampaignStatus::Completed.to_db_string(),
            fmt_ts(end_date),
            fmt_ts(now),
            id,
            CampaignStatus::Active.to_db_string()
        ],
    )?;
    if changed == 1 {
        debug!("Completed campaign {}", id);
    }
    Ok(changed == 1)
}

fn invalid_transition(item: &ItemRecord, to: ItemState) -> LedgerError {
    LedgerError::InvalidTransition {
        key: item.key.clone(),
        from: item.state,
        to,
    }
}

fn ensure_changed(changed: usize, item: &ItemRecord, to: ItemState) -> LedgerResult<()> {
    if changed == 1 {
        Ok(())
    } else {
        Err(invalid_transition(item, to))
    }
}

fn collect_counts(rows: Vec<(String, i64)>) -> HashMap<ItemState, u64> {
    let mut counts = HashMap::new();
    for (state, count) in rows {
        match ItemState::from_db_string(&state) {
            Some(state) => {
                counts.insert(state, count.max(0) as u64);
            }
            None => warn!("Ignoring unknown item state '{}' in statistics", state),
        }
    }
    counts
}
