//! Tidemark: crawl state and deduplication for recurring ingestion
//!
//! This crate keeps a durable ledger of every item ever discovered, deduplicates
//! content within and across runs, paces outbound requests per source, and decides
//! which sources are due to run while making sure a source never runs twice at once.

pub mod config;
pub mod crawler;
pub mod dedup;
pub mod ledger;
pub mod output;
pub mod state;
pub mod url;

use thiserror::Error;

/// Any failure surfaced by the library
#[derive(Debug, Error)]
pub enum TidemarkError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("ledger: {0}")]
    Ledger(#[from] ledger::LedgerError),

    #[error("dedup index: {0}")]
    Index(#[from] dedup::IndexError),

    #[error(transparent)]
    LockBusy(#[from] crawler::LockBusy),

    #[error("source lock: {0}")]
    Lock(#[from] crawler::LockError),

    #[error("fetch: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("process: {0}")]
    Process(#[from] crawler::ProcessError),

    #[error("item key: {0}")]
    UrlError(#[from] UrlError),

    #[error("http client: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures loading the TOML configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Validation(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid exclusion pattern {0}")]
    InvalidPattern(String),
}

/// Why a key could not be canonicalised as a URL
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("not a URL: {0}")]
    Parse(String),

    #[error("unsupported scheme '{0}'")]
    InvalidScheme(String),

    #[error("URL has no host")]
    MissingDomain,

    #[error("malformed URL: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, TidemarkError>;
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type UrlResult<T> = std::result::Result<T, UrlError>;

pub use config::Config;
pub use crawler::{RunCoordinator, RunOutcome, RunReport};
pub use dedup::DedupEngine;
pub use ledger::{Ledger, SqliteLedger};
pub use state::{ItemKind, ItemState};
