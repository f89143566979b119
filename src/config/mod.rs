//! Configuration module for Tidemark
//!
//! This module handles loading, parsing, and validating TOML configuration files,
//! and turns the parsed sections into the settings of each component.
//!
//! # Example
//!
//! ```no_run
//! use tidemark::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("tidemark.toml")).unwrap();
//! println!("Ledger lives at {}", config.ledger.database_path);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    BudgetConfig, CampaignConfig, Config, DedupSection, FiltersConfig, LedgerConfig,
    RateLimitConfig, RunSection, SourceEntry, UserAgentConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::{validate, MAX_CAMPAIGN_DAYS, MAX_INTERVAL_HOURS};

use crate::crawler::{
    default_holder, BackoffPolicy, BlockedPhrases, FilterChain, MinWordCount, RateLimiterConfig,
    RunConfig,
};
use crate::dedup::{DedupConfig, DEFAULT_SEED};
use crate::ledger::{LedgerOptions, RecheckPolicy};
use crate::state::RateBudget;
use crate::{ConfigError, ConfigResult};
use std::path::PathBuf;
use std::time::Duration;

impl BudgetConfig {
    pub fn to_budget(&self) -> RateBudget {
        RateBudget {
            requests_per_window: self.requests_per_window,
            window: Duration::from_secs(self.window_secs),
            min_interval: Duration::from_millis(self.min_interval_ms),
        }
    }
}

/// Hour count as a chrono interval, rejecting values chrono cannot hold
fn hours(field: &str, value: u64) -> ConfigResult<chrono::Duration> {
    i64::try_from(value)
        .ok()
        .filter(|_| value <= MAX_INTERVAL_HOURS)
        .and_then(chrono::Duration::try_hours)
        .ok_or_else(|| {
            ConfigError::Validation(format!(
                "{} must be <= {}, got {}",
                field, MAX_INTERVAL_HOURS, value
            ))
        })
}

impl Config {
    pub fn ledger_options(&self) -> ConfigResult<LedgerOptions> {
        let run = &self.run;
        let listing_interval = match run.listing_recheck_hours {
            0 => None,
            value => Some(hours("listing-recheck-hours", value)?),
        };
        let retry_failed_after = run
            .retry_failed_after_hours
            .map(|value| hours("retry-failed-after-hours", value))
            .transpose()?;

        Ok(LedgerOptions {
            busy_timeout: Duration::from_millis(self.ledger.busy_timeout_ms),
            max_retries: self.ledger.max_retries,
            retry_base: Duration::from_millis(self.ledger.retry_base_ms),
            recheck: RecheckPolicy {
                listing_interval,
                refetch_stranded: run.refetch_stranded,
                retry_failed_after,
                max_failures: run.max_failures,
            },
        })
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            index_dir: PathBuf::from(&self.dedup.index_dir),
            similarity_threshold: self.dedup.similarity_threshold,
            cache_capacity: self.dedup.cache_capacity,
            num_perm: self.dedup.num_perm,
            bands: self.dedup.bands,
            shingle_size: self.dedup.shingle_size,
            seed: DEFAULT_SEED,
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        let rate = &self.rate_limit;
        RateLimiterConfig {
            default_budget: rate.default_budget().to_budget(),
            overrides: rate
                .overrides
                .iter()
                .map(|(source, budget)| (source.clone(), budget.to_budget()))
                .collect(),
            backoff: BackoffPolicy {
                base: Duration::from_millis(rate.base_backoff_ms),
                max: Duration::from_millis(rate.max_backoff_ms),
                max_level: rate.max_level,
                jitter: rate.jitter,
            },
        }
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            lock_ttl: Duration::from_secs(self.run.lock_ttl_secs),
            concurrency: self.run.concurrency,
            checkpoint_every: self.run.checkpoint_every,
            holder: default_holder(),
        }
    }

    pub fn filter_chain(&self) -> FilterChain {
        let mut chain = FilterChain::new();
        if let Some(min) = self.filters.min_words {
            chain.push(Box::new(MinWordCount { min }));
        }
        if !self.filters.blocked_phrases.is_empty() {
            chain.push(Box::new(BlockedPhrases::new(&self.filters.blocked_phrases)));
        }
        chain
    }

    pub fn campaign_duration(&self) -> ConfigResult<chrono::Duration> {
        let days = self.campaign.duration_days;
        Some(days)
            .filter(|days| *days <= MAX_CAMPAIGN_DAYS)
            .and_then(|days| chrono::Duration::try_days(i64::from(days)))
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "campaign duration-days must be <= {}, got {}",
                    MAX_CAMPAIGN_DAYS, days
                ))
            })
    }
}
