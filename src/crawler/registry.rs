//! Sources and the candidate items they offer

use crate::config::{Config, SourceEntry, MAX_INTERVAL_HOURS};
use crate::ledger::Discovery;
use crate::state::ItemKind;
use crate::url::{excluding_pattern, normalize_url};
use serde_json::Value;
use tracing::debug;

/// A registered source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub name: String,
    /// Time between refresh runs once no campaign is active
    pub cadence: chrono::Duration,
}

/// An item a source offers for a run
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Canonical ledger key
    pub key: String,
    /// Address to fetch, as the source listed it
    pub url: String,
    pub kind: ItemKind,
    pub metadata: Value,
    /// Set when policy excludes the item; it is recorded as skipped, never fetched
    pub skip_reason: Option<String>,
}

impl Candidate {
    /// A document fetched at its own key
    pub fn document(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            url: key.clone(),
            key,
            kind: ItemKind::Document,
            metadata: Value::Object(Default::default()),
            skip_reason: None,
        }
    }

    pub fn listing(key: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Listing,
            ..Self::document(key)
        }
    }

    /// Keys the candidate by the canonical form of `listed` and fetches `listed` itself
    pub fn listed(listed: &str, kind: ItemKind) -> Self {
        Self {
            key: canonical_key(listed),
            url: listed.to_string(),
            kind,
            ..Self::document("")
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    pub fn discovery(&self) -> Discovery {
        Discovery {
            kind: self.kind,
            metadata: self.metadata.clone(),
        }
    }
}

/// Supplies sources and their candidates
pub trait SourceRegistry: Send + Sync {
    fn sources(&self) -> Vec<SourceSpec>;

    /// Candidates of `source`; empty for unknown sources
    fn candidates(&self, source: &str) -> Vec<Candidate>;
}

/// Registry over the `[[source]]` entries of the configuration
#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    entries: Vec<SourceEntry>,
}

impl ConfigRegistry {
    pub fn new(entries: Vec<SourceEntry>) -> Self {
        Self { entries }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sources.clone())
    }
}

impl SourceRegistry for ConfigRegistry {
    fn sources(&self) -> Vec<SourceSpec> {
        self.entries
            .iter()
            .map(|entry| SourceSpec {
                name: entry.name.clone(),
                cadence: chrono::Duration::hours(entry.cadence_hours.min(MAX_INTERVAL_HOURS) as i64),
            })
            .collect()
    }

    fn candidates(&self, source: &str) -> Vec<Candidate> {
        let Some(entry) = self.entries.iter().find(|e| e.name == source) else {
            return Vec::new();
        };

        let documents = entry
            .documents
            .iter()
            .map(|listed| Candidate::listed(listed, ItemKind::Document));
        let listings = entry
            .listings
            .iter()
            .map(|listed| Candidate::listed(listed, ItemKind::Listing));

        documents
            .chain(listings)
            .map(|candidate| match excluding_pattern(&entry.exclude, &candidate.key) {
                Some(pattern) => {
                    debug!("Excluding {} (matches {})", candidate.key, pattern);
                    let reason = format!("excluded by pattern {}", pattern);
                    candidate.skipped(reason)
                }
                None => candidate,
            })
            .collect()
    }
}

/// Canonical ledger key: normalized URL when `key` parses as one, `key` otherwise
pub fn canonical_key(key: &str) -> String {
    match normalize_url(key) {
        Ok(url) => url.to_string(),
        Err(_) => key.to_string(),
    }
}
