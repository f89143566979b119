use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tidemark::config::UserAgentConfig;
use tidemark::crawler::{
    BackoffPolicy, FilterChain, HttpFetcher, RateLimiter, RateLimiterConfig, RunConfig,
    RunCoordinator,
};
use tidemark::dedup::{DedupConfig, DedupEngine};
use tidemark::ledger::{Ledger, LedgerOptions, SqliteLedger};
use tidemark::state::RateBudget;

pub fn open_ledger(path: &Path) -> Arc<dyn Ledger> {
    open_ledger_with(path, LedgerOptions::default())
}

pub fn open_ledger_with(path: &Path, options: LedgerOptions) -> Arc<dyn Ledger> {
    Arc::new(SqliteLedger::open(path, options).expect("Failed to open ledger"))
}

pub fn dedup_config(index_dir: &Path) -> DedupConfig {
    DedupConfig {
        index_dir: index_dir.to_path_buf(),
        ..DedupConfig::default()
    }
}

/// Limiter that never waits between requests and backs off for milliseconds
pub fn fast_limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(RateLimiterConfig {
        default_budget: RateBudget {
            requests_per_window: 10_000,
            window: Duration::from_secs(60),
            min_interval: Duration::ZERO,
        },
        overrides: HashMap::new(),
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(50),
            max_level: 8,
            jitter: 0.0,
        },
    }))
}

pub fn coordinator(ledger: Arc<dyn Ledger>, index_dir: &Path) -> RunCoordinator {
    let dedup = Arc::new(DedupEngine::new(ledger.clone(), dedup_config(index_dir)));
    RunCoordinator::new(
        ledger,
        dedup,
        fast_limiter(),
        FilterChain::new(),
        RunConfig {
            checkpoint_every: 2,
            ..RunConfig::default()
        },
    )
}

pub fn user_agent() -> UserAgentConfig {
    UserAgentConfig {
        crawler_name: "TestBot".to_string(),
        crawler_version: "1.0.0".to_string(),
        contact_url: "https://example.com/contact".to_string(),
        contact_email: "test@example.com".to_string(),
    }
}

pub fn http_fetcher() -> HttpFetcher {
    HttpFetcher::new(&user_agent()).expect("Failed to build HTTP client")
}

/// A page whose visible text is `words` distinct tokens starting at `offset`
pub fn article(offset: usize, words: usize) -> String {
    let text = (offset..offset + words)
        .map(|i| format!("word{}", i))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "<html><head><title>t</title><script>var x = 1;</script></head><body><p>{}</p></body></html>",
        text
    )
}
