use serde::Deserialize;
use std::collections::HashMap;

/// Main configuration structure for Tidemark
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub dedup: DedupSection,
    #[serde(rename = "rate-limit", default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub run: RunSection,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub filters: FiltersConfig,
    #[serde(rename = "source", default)]
    pub sources: Vec<SourceEntry>,
}

impl Config {
    /// The `[[source]]` entry named `name`
    pub fn source(&self, name: &str) -> Option<&SourceEntry> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Ledger storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// How long SQLite waits on a locked database (milliseconds)
    #[serde(rename = "busy-timeout-ms", default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Retries after SQLite reports the database busy
    #[serde(rename = "max-retries", default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds), doubled per attempt
    #[serde(rename = "retry-base-ms", default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

/// Deduplication configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DedupSection {
    /// Directory holding one index file per source
    #[serde(rename = "index-dir", default = "default_index_dir")]
    pub index_dir: String,

    /// Estimated Jaccard similarity at which a document counts as a near duplicate
    #[serde(rename = "similarity-threshold", default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Entries of the in-memory content hash cache
    #[serde(rename = "cache-capacity", default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// MinHash signature length
    #[serde(rename = "num-perm", default = "default_num_perm")]
    pub num_perm: usize,

    /// LSH bands; must divide `num-perm`
    #[serde(default = "default_bands")]
    pub bands: usize,

    /// Words per shingle
    #[serde(rename = "shingle-size", default = "default_shingle_size")]
    pub shingle_size: usize,
}

impl Default for DedupSection {
    fn default() -> Self {
        Self {
            index_dir: default_index_dir(),
            similarity_threshold: default_similarity_threshold(),
            cache_capacity: default_cache_capacity(),
            num_perm: default_num_perm(),
            bands: default_bands(),
            shingle_size: default_shingle_size(),
        }
    }
}

/// Request budget of a source
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BudgetConfig {
    #[serde(rename = "requests-per-window", default = "default_requests_per_window")]
    pub requests_per_window: u32,

    #[serde(rename = "window-secs", default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(rename = "min-interval-ms", default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(rename = "requests-per-window", default = "default_requests_per_window")]
    pub requests_per_window: u32,

    #[serde(rename = "window-secs", default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(rename = "min-interval-ms", default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(rename = "base-backoff-ms", default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(rename = "max-backoff-ms", default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(rename = "max-level", default = "default_max_level")]
    pub max_level: u32,

    /// Relative jitter applied to backoff delays (0.2 = ±20 %)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Budgets that replace the default for specific sources
    #[serde(default)]
    pub overrides: HashMap<String, BudgetConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            min_interval_ms: default_min_interval_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_level: default_max_level(),
            jitter: default_jitter(),
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// The budget applied to sources without an override
    pub fn default_budget(&self) -> BudgetConfig {
        BudgetConfig {
            requests_per_window: self.requests_per_window,
            window_secs: self.window_secs,
            min_interval_ms: self.min_interval_ms,
        }
    }
}

/// Bulk collection campaign configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CampaignConfig {
    #[serde(default = "default_campaign_name")]
    pub name: String,

    #[serde(rename = "duration-days", default = "default_duration_days")]
    pub duration_days: u32,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            name: default_campaign_name(),
            duration_days: default_duration_days(),
        }
    }
}

/// Run execution configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    /// Lease length of a source lock
    #[serde(rename = "lock-ttl-secs", default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Maximum number of concurrent fetches within a run
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Items between checkpoints (index save, rate-state save, lock extension)
    #[serde(rename = "checkpoint-every", default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    /// Hours between re-checks of listing items; 0 disables re-checks
    #[serde(rename = "listing-recheck-hours", default = "default_listing_recheck_hours")]
    pub listing_recheck_hours: u64,

    /// Re-fetch items a dead run left in `fetched`
    #[serde(rename = "refetch-stranded", default = "default_true")]
    pub refetch_stranded: bool,

    /// Hours before a failed item is retried automatically; unset means only with `--force`
    #[serde(rename = "retry-failed-after-hours", default)]
    pub retry_failed_after_hours: Option<u64>,

    /// Failed items with this many failures are never retried automatically
    #[serde(rename = "max-failures", default = "default_max_failures")]
    pub max_failures: u32,

    /// Directory accepted documents are written to
    #[serde(rename = "output-dir", default = "default_output_dir")]
    pub output_dir: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            concurrency: default_concurrency(),
            checkpoint_every: default_checkpoint_every(),
            listing_recheck_hours: default_listing_recheck_hours(),
            refetch_stranded: true,
            retry_failed_after_hours: None,
            max_failures: default_max_failures(),
            output_dir: default_output_dir(),
        }
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

/// Content filters applied to unique documents
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiltersConfig {
    /// Minimum number of words a document needs
    #[serde(rename = "min-words", default)]
    pub min_words: Option<usize>,

    /// Documents containing any of these phrases are rejected
    #[serde(rename = "blocked-phrases", default)]
    pub blocked_phrases: Vec<String>,
}

/// A crawl source and its candidate items
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub name: String,

    /// Hours between refresh runs once no campaign is active
    #[serde(rename = "cadence-hours", default = "default_cadence_hours")]
    pub cadence_hours: u64,

    /// Document keys (usually URLs)
    #[serde(default)]
    pub documents: Vec<String>,

    /// Listing keys, re-checked on a schedule
    #[serde(default)]
    pub listings: Vec<String>,

    /// Domain patterns (e.g., "ads.example.com" or "*.example.com") whose items are skipped
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    50
}

fn default_index_dir() -> String {
    "./data/index".to_string()
}

fn default_similarity_threshold() -> f64 {
    0.85
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_num_perm() -> usize {
    128
}

fn default_bands() -> usize {
    32
}

fn default_shingle_size() -> usize {
    3
}

fn default_requests_per_window() -> u32 {
    600
}

fn default_window_secs() -> u64 {
    3_600
}

fn default_min_interval_ms() -> u64 {
    1_000
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_max_level() -> u32 {
    64
}

fn default_jitter() -> f64 {
    0.2
}

fn default_campaign_name() -> String {
    "bulk".to_string()
}

fn default_duration_days() -> u32 {
    6
}

fn default_lock_ttl_secs() -> u64 {
    900
}

fn default_concurrency() -> usize {
    4
}

fn default_checkpoint_every() -> usize {
    50
}

fn default_listing_recheck_hours() -> u64 {
    6
}

fn default_true() -> bool {
    true
}

fn default_max_failures() -> u32 {
    3
}

fn default_output_dir() -> String {
    "./data/out".to_string()
}

fn default_cadence_hours() -> u64 {
    24
}
