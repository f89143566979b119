use crate::config::types::{
    Config, DedupSection, LedgerConfig, RateLimitConfig, RunSection, SourceEntry,
    UserAgentConfig,
};
use crate::{ConfigError, ConfigResult};
use std::collections::HashSet;
use url::Url;

/// Upper bound of hour-based intervals (ten years)
pub const MAX_INTERVAL_HOURS: u64 = 24 * 365 * 10;

/// Upper bound of a campaign's duration
pub const MAX_CAMPAIGN_DAYS: u32 = 365 * 10;

const MAX_WINDOW_SECS: u64 = 30 * 24 * 3600;
const MAX_DELAY_MS: u64 = 24 * 3600 * 1000;
const MAX_LOCK_TTL_SECS: u64 = 7 * 24 * 3600;

/// Validates the entire configuration
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_ledger_config(&config.ledger)?;
    validate_dedup_config(&config.dedup)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_run_config(&config.run)?;
    validate_user_agent_config(&config.user_agent)?;

    if config.campaign.name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "campaign name cannot be empty".to_string(),
        ));
    }
    if config.campaign.duration_days < 1 || config.campaign.duration_days > MAX_CAMPAIGN_DAYS {
        return Err(ConfigError::Validation(format!(
            "campaign duration-days must be between 1 and {}, got {}",
            MAX_CAMPAIGN_DAYS, config.campaign.duration_days
        )));
    }

    validate_sources(&config.sources)?;
    Ok(())
}

/// Validates ledger configuration
fn validate_ledger_config(config: &LedgerConfig) -> ConfigResult<()> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.max_retries > 20 {
        return Err(ConfigError::Validation(format!(
            "max_retries must be <= 20, got {}",
            config.max_retries
        )));
    }

    Ok(())
}

/// Validates deduplication configuration
fn validate_dedup_config(config: &DedupSection) -> ConfigResult<()> {
    if config.index_dir.is_empty() {
        return Err(ConfigError::Validation(
            "index_dir cannot be empty".to_string(),
        ));
    }

    if !(config.similarity_threshold > 0.0 && config.similarity_threshold <= 1.0) {
        return Err(ConfigError::Validation(format!(
            "similarity_threshold must be in (0, 1], got {}",
            config.similarity_threshold
        )));
    }

    if config.cache_capacity < 1 {
        return Err(ConfigError::Validation(
            "cache_capacity must be >= 1".to_string(),
        ));
    }

    if config.num_perm < 1 || config.bands < 1 || config.num_perm % config.bands != 0 {
        return Err(ConfigError::Validation(format!(
            "bands ({}) must divide num_perm ({})",
            config.bands, config.num_perm
        )));
    }

    if config.shingle_size < 1 {
        return Err(ConfigError::Validation(
            "shingle_size must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates rate limiting configuration
fn validate_rate_limit_config(config: &RateLimitConfig) -> ConfigResult<()> {
    let budgets = std::iter::once(("default".to_string(), config.default_budget())).chain(
        config
            .overrides
            .iter()
            .map(|(source, budget)| (source.clone(), *budget)),
    );
    for (name, budget) in budgets {
        if budget.requests_per_window < 1 || budget.window_secs < 1 {
            return Err(ConfigError::Validation(format!(
                "rate budget '{}' must allow at least one request per non-empty window",
                name
            )));
        }
        if budget.window_secs > MAX_WINDOW_SECS || budget.min_interval_ms > MAX_DELAY_MS {
            return Err(ConfigError::Validation(format!(
                "rate budget '{}' must have window-secs <= {} and min-interval-ms <= {}",
                name, MAX_WINDOW_SECS, MAX_DELAY_MS
            )));
        }
    }

    if config.max_backoff_ms > MAX_DELAY_MS {
        return Err(ConfigError::Validation(format!(
            "max_backoff_ms must be <= {}, got {}",
            MAX_DELAY_MS, config.max_backoff_ms
        )));
    }

    if config.base_backoff_ms > config.max_backoff_ms {
        return Err(ConfigError::Validation(format!(
            "base_backoff_ms ({}) must not exceed max_backoff_ms ({})",
            config.base_backoff_ms, config.max_backoff_ms
        )));
    }

    if config.max_level < 1 {
        return Err(ConfigError::Validation(
            "max_level must be >= 1".to_string(),
        ));
    }

    if !(0.0..1.0).contains(&config.jitter) {
        return Err(ConfigError::Validation(format!(
            "jitter must be in [0, 1), got {}",
            config.jitter
        )));
    }

    Ok(())
}

/// Validates run configuration
fn validate_run_config(config: &RunSection) -> ConfigResult<()> {
    if config.concurrency < 1 || config.concurrency > 100 {
        return Err(ConfigError::Validation(format!(
            "concurrency must be between 1 and 100, got {}",
            config.concurrency
        )));
    }

    if config.lock_ttl_secs < 10 || config.lock_ttl_secs > MAX_LOCK_TTL_SECS {
        return Err(ConfigError::Validation(format!(
            "lock_ttl_secs must be between 10 and {}, got {}",
            MAX_LOCK_TTL_SECS, config.lock_ttl_secs
        )));
    }

    let hours = std::iter::once(("listing-recheck-hours", config.listing_recheck_hours))
        .chain(config.retry_failed_after_hours.map(|h| ("retry-failed-after-hours", h)));
    for (field, value) in hours {
        if value > MAX_INTERVAL_HOURS {
            return Err(ConfigError::Validation(format!(
                "{} must be <= {}, got {}",
                field, MAX_INTERVAL_HOURS, value
            )));
        }
    }

    if config.checkpoint_every < 1 {
        return Err(ConfigError::Validation(
            "checkpoint_every must be >= 1".to_string(),
        ));
    }

    if config.output_dir.is_empty() {
        return Err(ConfigError::Validation(
            "output_dir cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> ConfigResult<()> {
    let name = &config.crawler_name;
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(ConfigError::Validation(format!(
            "crawler-name must be non-empty letters, digits and hyphens, got '{}'",
            name
        )));
    }

    if config.crawler_version.trim().is_empty() {
        return Err(ConfigError::Validation(
            "crawler-version cannot be empty".to_string(),
        ));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("contact-url: {}", e)))?;
    validate_email(&config.contact_email)
}

/// Validates source entries
fn validate_sources(sources: &[SourceEntry]) -> ConfigResult<()> {
    let mut names = HashSet::new();
    for source in sources {
        if source.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "source name cannot be empty".to_string(),
            ));
        }

        if !names.insert(source.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "source '{}' is defined more than once",
                source.name
            )));
        }

        if source.cadence_hours < 1 || source.cadence_hours > MAX_INTERVAL_HOURS {
            return Err(ConfigError::Validation(format!(
                "source '{}' must have cadence-hours between 1 and {}",
                source.name, MAX_INTERVAL_HOURS
            )));
        }

        for key in source.documents.iter().chain(&source.listings) {
            if key.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "source '{}' has an empty item key",
                    source.name
                )));
            }
        }

        for pattern in &source.exclude {
            validate_domain_pattern(pattern)?;
        }
    }

    Ok(())
}

/// Validates an exclusion pattern: `example.com` or `*.example.com`
fn validate_domain_pattern(pattern: &str) -> ConfigResult<()> {
    let domain = pattern.strip_prefix("*.").unwrap_or(pattern);
    let invalid = |reason: &str| {
        Err(ConfigError::InvalidPattern(format!(
            "'{}' {}",
            pattern, reason
        )))
    };

    if domain.is_empty() {
        return invalid("has no domain");
    }
    if !domain
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    {
        return invalid("contains characters not allowed in a domain");
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return invalid("must name a domain with at least one dot");
    }
    if labels
        .iter()
        .any(|label| label.is_empty() || label.starts_with('-') || label.ends_with('-'))
    {
        return invalid("has an empty label or a label starting or ending with '-'");
    }
    Ok(())
}

/// Requires `local@domain.tld`
fn validate_email(email: &str) -> ConfigResult<()> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.contains('@') && domain.split('.').count() >= 2
                && domain.split('.').all(|part| !part.is_empty())
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!(
            "contact-email '{}' is not a valid address",
            email
        )))
    }
}
