//! Crawler module: running sources against the ledger
//!
//! This module contains the execution side of Tidemark, including:
//! - Per-source rate limiting with failure backoff
//! - Per-source execution locks
//! - Campaign and cadence scheduling
//! - Fetching, processing and filtering of candidate items
//! - Overall run coordination

mod coordinator;
mod fetcher;
mod filter;
mod lock;
mod processor;
mod rate_limiter;
mod registry;
mod scheduler;

pub use coordinator::{RunConfig, RunCoordinator, RunOutcome, RunReport, SkipReason, SourceRun};
pub use fetcher::{build_http_client, parse_retry_after, FetchError, FetchResponse, Fetcher, HttpFetcher};
pub use filter::{BlockedPhrases, Filter, FilterChain, FilterOutcome, FilterVerdict, MinWordCount};
pub use lock::{default_holder, LockBusy, LockError, LockGuard, LockHandle};
pub use processor::{extract_visible_text, ContentProcessor, HtmlTextProcessor, ProcessError};
pub use rate_limiter::{BackoffPolicy, FailureClass, RateLimiter, RateLimiterConfig};
pub use registry::{canonical_key, Candidate, ConfigRegistry, SourceRegistry, SourceSpec};
pub use scheduler::{CampaignPhase, CampaignScheduler, DueReason, DueSource, RunMode};
