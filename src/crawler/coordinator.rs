//! Run coordinator - executes a source run end to end
//!
//! A run holds the source lock for its whole duration and:
//! - Records candidates in the ledger and decides what to fetch
//! - Fetches concurrently under the rate limiter
//! - Deduplicates, filters and emits each fetched document
//! - Checkpoints the index, rate state and lock lease periodically
//!
//! Ledger calls are synchronous and run on the task driving the run, so a busy
//! database stalls that worker thread for up to the ledger's retry budget. Run the
//! coordinator on a multi-threaded runtime (as `tidemark run` does).

use crate::crawler::fetcher::{FetchError, FetchResponse, Fetcher};
use crate::crawler::filter::{FilterChain, FilterOutcome};
use crate::crawler::lock::{default_holder, LockError, LockGuard, LockHandle};
use crate::crawler::processor::ContentProcessor;
use crate::crawler::rate_limiter::RateLimiter;
use crate::crawler::registry::{Candidate, SourceRegistry};
use crate::crawler::scheduler::{CampaignScheduler, DueReason, RunMode};
use crate::dedup::{content_hash, ContentHash, DedupEngine, DedupVerdict, IndexLoad};
use crate::ledger::{ConditionalHeaders, FetchRecord, Ledger, LedgerError, LedgerResult, RunStatus};
use crate::state::ItemState;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Run execution settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Lease length of the source lock; extended at every checkpoint
    pub lock_ttl: Duration,
    /// Maximum number of fetches in flight
    pub concurrency: usize,
    /// Settled items between checkpoints
    pub checkpoint_every: usize,
    /// Recorded as the lock holder
    pub holder: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(900),
            concurrency: 4,
            checkpoint_every: 50,
            holder: default_holder(),
        }
    }
}

/// Why a run did not start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another live run holds the source lock
    AlreadyRunning { expires_at: Option<DateTime<Utc>> },
}

/// Result of `run_source`
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Skipped(SkipReason),
    Completed(RunReport),
    /// The lock was lost mid-run; the run stopped at a checkpoint
    Interrupted(RunReport),
}

impl RunOutcome {
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Skipped(_) => None,
            Self::Completed(report) | Self::Interrupted(report) => Some(report),
        }
    }
}

/// Per-outcome counters of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub source: String,
    pub mode: RunMode,
    pub run_id: i64,
    pub candidates: usize,
    /// Candidates new to the ledger
    pub discovered: usize,
    /// Candidates the ledger already knew
    pub already_known: usize,
    /// Candidates excluded by policy
    pub excluded: usize,
    /// Fetches that returned content
    pub fetched: usize,
    /// Re-checks that found nothing new (304 or identical content)
    pub not_modified: usize,
    /// Documents emitted downstream
    pub processed: usize,
    pub exact_duplicates: usize,
    pub near_duplicates: usize,
    /// Unique documents a filter rejected
    pub filtered: usize,
    pub failed: usize,
    /// Failed re-checks of already resolved items; their state is kept
    pub recheck_failures: usize,
    pub checkpoints: usize,
    /// Documents in the near-duplicate index at the end of the run
    pub indexed_documents: usize,
}

impl RunReport {
    pub fn new(source: &str, mode: RunMode, run_id: i64) -> Self {
        Self {
            source: source.to_string(),
            mode,
            run_id,
            candidates: 0,
            discovered: 0,
            already_known: 0,
            excluded: 0,
            fetched: 0,
            not_modified: 0,
            processed: 0,
            exact_duplicates: 0,
            near_duplicates: 0,
            filtered: 0,
            failed: 0,
            recheck_failures: 0,
            checkpoints: 0,
            indexed_documents: 0,
        }
    }

    pub fn duplicates(&self) -> usize {
        self.exact_duplicates + self.near_duplicates
    }
}

/// Result of one source in `run_due`
#[derive(Debug)]
pub struct SourceRun {
    pub source: String,
    pub reason: DueReason,
    pub result: LedgerResult<RunOutcome>,
}

/// A candidate selected for fetching
struct WorkItem {
    key: String,
    url: String,
    conditional: ConditionalHeaders,
    /// The item was already processed or duplicate; this fetch is a re-check
    recheck: bool,
    previous_hash: Option<ContentHash>,
}

/// Main run coordinator structure
pub struct RunCoordinator {
    ledger: Arc<dyn Ledger>,
    dedup: Arc<DedupEngine>,
    limiter: Arc<RateLimiter>,
    scheduler: CampaignScheduler,
    filters: FilterChain,
    config: RunConfig,
}

impl RunCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        dedup: Arc<DedupEngine>,
        limiter: Arc<RateLimiter>,
        filters: FilterChain,
        config: RunConfig,
    ) -> Self {
        Self {
            scheduler: CampaignScheduler::new(ledger.clone()),
            ledger,
            dedup,
            limiter,
            filters,
            config,
        }
    }

    pub fn scheduler(&self) -> &CampaignScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Takes the lock for `source` without waiting
    pub fn acquire_lock(&self, source: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        LockGuard::acquire(self.ledger.clone(), source, &self.config.holder, ttl)
    }

    /// Releases a lock by handle; a lock no longer held with this token is left alone
    pub fn release_lock(&self, handle: &LockHandle) -> LedgerResult<()> {
        self.ledger.unlock(&handle.source, &handle.token)
    }

    /// Runs every source due at `now`
    ///
    /// A failing source is reported in its `SourceRun` and the remaining sources
    /// still run.
    pub async fn run_due(
        &self,
        now: DateTime<Utc>,
        registry: &dyn SourceRegistry,
        fetcher: &dyn Fetcher,
        processor: &dyn ContentProcessor,
    ) -> LedgerResult<Vec<SourceRun>> {
        let due = self.scheduler.due_sources(now, registry)?;
        tracing::info!("{} sources due", due.len());

        let mut runs = Vec::with_capacity(due.len());
        for source in due {
            tracing::info!("Running {} ({}, {})", source.name, source.mode, source.reason);
            let candidates = registry.candidates(&source.name);
            let result = self
                .run_source(&source.name, source.mode, candidates, fetcher, processor, false)
                .await;
            if let Err(e) = &result {
                tracing::error!("Run of {} aborted: {}", source.name, e);
            }
            runs.push(SourceRun {
                source: source.name,
                reason: source.reason,
                result,
            });
        }
        Ok(runs)
    }

    /// Runs one source over `candidates`
    ///
    /// Returns `Skipped` without touching anything if another run holds the
    /// source lock. A ledger error aborts the run; the run is recorded as failed
    /// and the lock is released.
    pub async fn run_source(
        &self,
        source: &str,
        mode: RunMode,
        candidates: Vec<Candidate>,
        fetcher: &dyn Fetcher,
        processor: &dyn ContentProcessor,
        force: bool,
    ) -> LedgerResult<RunOutcome> {
        let mut guard = match self.acquire_lock(source, self.config.lock_ttl) {
            Ok(guard) => guard,
            Err(LockError::Busy(busy)) => {
                tracing::info!("{}; skipping", busy);
                return Ok(RunOutcome::Skipped(SkipReason::AlreadyRunning {
                    expires_at: busy.expires_at,
                }));
            }
            Err(LockError::Ledger(e)) => return Err(e),
        };

        let run_id = self.ledger.begin_run(source)?;
        tracing::info!(
            "Starting {} run {} of {} ({} candidates)",
            mode,
            run_id,
            source,
            candidates.len()
        );
        let start_time = std::time::Instant::now();

        let mut report = RunReport::new(source, mode, run_id);
        let result = self
            .execute(source, candidates, fetcher, processor, force, &guard, &mut report)
            .await;

        match result {
            Ok(lock_held) => {
                let status = if lock_held {
                    RunStatus::Completed
                } else {
                    RunStatus::Interrupted
                };
                self.ledger.finish_run(run_id, status)?;
                guard.release()?;

                tracing::info!(
                    "Run {} of {} {} in {:.1}s: {} fetched, {} processed, {} duplicates, {} failed",
                    run_id,
                    source,
                    status,
                    start_time.elapsed().as_secs_f64(),
                    report.fetched,
                    report.processed,
                    report.duplicates(),
                    report.failed
                );

                Ok(if lock_held {
                    RunOutcome::Completed(report)
                } else {
                    RunOutcome::Interrupted(report)
                })
            }
            Err(e) => {
                tracing::error!("Run {} of {} failed: {}", run_id, source, e);
                if let Err(finish_error) = self.ledger.finish_run(run_id, RunStatus::Failed) {
                    tracing::warn!("Could not record failure of run {}: {}", run_id, finish_error);
                }
                Err(e)
            }
        }
    }

    /// Body of a run; returns false if the lock was lost
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        source: &str,
        candidates: Vec<Candidate>,
        fetcher: &dyn Fetcher,
        processor: &dyn ContentProcessor,
        force: bool,
        guard: &LockGuard,
        report: &mut RunReport,
    ) -> LedgerResult<bool> {
        match self.dedup.load_index(source) {
            IndexLoad::Loaded { documents } => {
                tracing::debug!("Loaded index of {} ({} documents)", source, documents)
            }
            IndexLoad::Missing => tracing::debug!("No index yet for {}", source),
            IndexLoad::Corrupt(_) | IndexLoad::Incompatible(_) => {}
        }

        let mut rate_states = self.ledger.load_rate_states()?;
        if let Some(snapshot) = rate_states.remove(source) {
            self.limiter
                .restore(&HashMap::from([(source.to_string(), snapshot)]));
        }

        report.candidates = candidates.len();
        let work = self.plan(source, candidates, force, report)?;
        tracing::info!("{}: {} items to fetch", source, work.len());

        let limiter = &self.limiter;
        let mut responses = stream::iter(work.into_iter().map(|item| async move {
            limiter.until_ready(source).await;
            let result = fetcher.fetch(&item.url, &item.conditional).await;
            (item, result)
        }))
        .buffer_unordered(self.config.concurrency.max(1));

        let checkpoint_every = self.config.checkpoint_every.max(1);
        let mut since_checkpoint = 0usize;
        while let Some((item, result)) = responses.next().await {
            self.settle(source, &item, result, processor, force, report)
                .await?;

            since_checkpoint += 1;
            if since_checkpoint >= checkpoint_every {
                since_checkpoint = 0;
                if !self.checkpoint(source, guard, report)? {
                    tracing::warn!("Stopping run of {}: lock lost", source);
                    return Ok(false);
                }
            }
        }

        let lock_held = self.checkpoint(source, guard, report)?;
        report.indexed_documents = self.dedup.indexed_documents(source);
        Ok(lock_held)
    }

    /// Records every candidate and selects the ones to fetch
    fn plan(
        &self,
        source: &str,
        candidates: Vec<Candidate>,
        force: bool,
        report: &mut RunReport,
    ) -> LedgerResult<Vec<WorkItem>> {
        let now = Utc::now();
        let mut seen = HashSet::new();
        let mut work = Vec::new();

        for candidate in candidates {
            if !seen.insert(candidate.key.clone()) {
                continue;
            }
            let key = candidate.key.as_str();

            if self.ledger.discover(key, source, &candidate.discovery())? {
                report.discovered += 1;
            } else {
                report.already_known += 1;
            }

            if let Some(reason) = &candidate.skip_reason {
                let item = self.ledger.get(key)?;
                if item.map(|i| i.state) == Some(ItemState::Discovered) {
                    self.ledger.mark_skipped(key, reason)?;
                }
                report.excluded += 1;
                continue;
            }

            if !self.ledger.should_fetch_at(key, force, now)? {
                tracing::debug!("Not fetching {}", key);
                continue;
            }

            let item = self
                .ledger
                .get(key)?
                .ok_or_else(|| LedgerError::NotFound(key.to_string()))?;
            if item.state == ItemState::Failed {
                self.ledger.requeue(key)?;
            }

            let conditional = if force {
                ConditionalHeaders::default()
            } else {
                self.ledger.conditional_headers(key)?
            };

            work.push(WorkItem {
                key: candidate.key.clone(),
                url: candidate.url.clone(),
                conditional,
                recheck: item.state.is_resolved(),
                previous_hash: item.content_hash,
            });
        }

        Ok(work)
    }

    /// Bookkeeping for one finished fetch
    async fn settle(
        &self,
        source: &str,
        item: &WorkItem,
        result: Result<FetchResponse, FetchError>,
        processor: &dyn ContentProcessor,
        force: bool,
        report: &mut RunReport,
    ) -> LedgerResult<()> {
        let key = item.key.as_str();

        let response = match result {
            Ok(response) => {
                self.limiter.report_success(source);
                response
            }
            Err(e) => {
                self.limiter
                    .report_failure(source, e.classification(), e.retry_after());
                return self.record_failure(item, &e.to_string(), report);
            }
        };

        if response.is_not_modified() {
            if item.recheck {
                tracing::debug!("{} not modified", key);
                self.ledger.mark_not_modified(key)?;
                report.not_modified += 1;
                return Ok(());
            }
            return self.record_failure(item, "not modified without stored validators", report);
        }

        report.fetched += 1;
        let text = match processor.normalize(key, &response.body) {
            Ok(text) => text,
            Err(e) => return self.record_failure(item, &e.to_string(), report),
        };

        let digest = content_hash(&text);
        if item.recheck && item.previous_hash == Some(digest) {
            tracing::debug!("{} unchanged", key);
            self.ledger.mark_not_modified(key)?;
            report.not_modified += 1;
            return Ok(());
        }

        let signature = self.dedup.similarity_signature(&text);
        let record = FetchRecord {
            http_status: response.status,
            etag: response.etag,
            last_modified: response.last_modified,
            content_hash: digest,
            signature: signature.clone(),
        };
        self.ledger.mark_fetched(key, &record, force)?;

        match self.dedup.check(source, key, &digest, &signature)? {
            DedupVerdict::Exact { of } => {
                tracing::debug!("{} is an exact duplicate of {}", key, of);
                self.ledger.mark_duplicate(key, Some(&of))?;
                report.exact_duplicates += 1;
            }
            DedupVerdict::Near { of, similarity } => {
                tracing::debug!(
                    "{} is a near duplicate of {} (similarity {:.2})",
                    key,
                    of,
                    similarity
                );
                self.ledger.mark_duplicate(key, Some(&of))?;
                report.near_duplicates += 1;
            }
            DedupVerdict::Unique => match self.filters.run(&text) {
                FilterOutcome::Rejected { filter, metadata } => {
                    tracing::debug!("{} rejected by {} ({:?})", key, filter, metadata);
                    self.ledger.mark_processed(key)?;
                    self.dedup.add_document(source, key, &digest, &signature);
                    report.filtered += 1;
                }
                FilterOutcome::Passed { .. } => match processor.emit(source, key, &text).await {
                    Ok(()) => {
                        self.ledger.mark_processed(key)?;
                        self.dedup.add_document(source, key, &digest, &signature);
                        report.processed += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to emit {}: {}", key, e);
                        self.ledger.mark_failed(key, &e.to_string())?;
                        report.failed += 1;
                    }
                },
            },
        }

        Ok(())
    }

    /// Records a failed fetch or extraction
    ///
    /// A failed re-check leaves the resolved item as it was.
    fn record_failure(&self, item: &WorkItem, error: &str, report: &mut RunReport) -> LedgerResult<()> {
        if item.recheck {
            tracing::warn!("Re-check of {} failed: {}", item.key, error);
            report.recheck_failures += 1;
        } else {
            tracing::warn!("Failed {}: {}", item.key, error);
            self.ledger.mark_failed(&item.key, error)?;
            report.failed += 1;
        }
        Ok(())
    }

    /// Extends the lock, then saves the index and rate state
    ///
    /// Returns false if the lock was lost; nothing is written in that case, since
    /// the index file now belongs to the new holder.
    fn checkpoint(&self, source: &str, guard: &LockGuard, report: &mut RunReport) -> LedgerResult<bool> {
        if !guard.extend()? {
            return Ok(false);
        }
        if let Err(e) = self.dedup.save_index(source) {
            tracing::warn!("Failed to save index of {}: {}", source, e);
        }
        if let Some(snapshot) = self.limiter.snapshot_source(source) {
            self.ledger
                .save_rate_states(&HashMap::from([(source.to_string(), snapshot)]))?;
        }
        report.checkpoints += 1;
        Ok(true)
    }
}
