//! Per-source execution locks
//!
//! A lock is a lease row in the ledger. Whoever holds it may run the source; the
//! lease must be extended while the run is in progress, and anyone may take the
//! lock over once the lease has expired.

use crate::ledger::{Ledger, LedgerError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// The source is locked by another live run
#[derive(Debug, Clone, Error)]
#[error("Source '{source_name}' is locked by another run (lease until {})", fmt_expiry(.expires_at))]
pub struct LockBusy {
    pub source_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

fn fmt_expiry(expires_at: &Option<DateTime<Utc>>) -> String {
    expires_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Errors taking a source lock
#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    Busy(#[from] LockBusy),

    #[error("Lock ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Identity of a held lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub source: String,
    pub token: String,
    pub holder: String,
    pub ttl: Duration,
}

impl LockHandle {
    pub fn new(source: &str, ttl: Duration) -> Self {
        Self {
            source: source.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            holder: default_holder(),
            ttl,
        }
    }
}

/// `host:pid` of this process
pub fn default_holder() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}:{}", host, std::process::id())
}

/// A held source lock, released when dropped
pub struct LockGuard {
    ledger: Arc<dyn Ledger>,
    handle: LockHandle,
    released: bool,
}

impl LockGuard {
    /// Tries to take the lock for `source` with a fresh token
    pub fn acquire(
        ledger: Arc<dyn Ledger>,
        source: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Self, LockError> {
        let mut handle = LockHandle::new(source, ttl);
        handle.holder = holder.to_string();

        if ledger.try_lock(source, &handle.token, &handle.holder, ttl, Utc::now())? {
            debug!("Acquired lock on {} ({})", source, handle.holder);
            Ok(Self {
                ledger,
                handle,
                released: false,
            })
        } else {
            let expires_at = ledger.lock_expiry(source)?;
            Err(LockBusy {
                source_name: source.to_string(),
                expires_at,
            }
            .into())
        }
    }

    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Pushes the lease forward by its TTL
    ///
    /// Returns false if the lock was lost, e.g. because the lease had already
    /// expired and another run took it over.
    pub fn extend(&self) -> Result<bool, LedgerError> {
        let held = self.ledger.extend_lock(
            &self.handle.source,
            &self.handle.token,
            self.handle.ttl,
            Utc::now(),
        )?;
        if !held {
            warn!("Lost lock on {}", self.handle.source);
        }
        Ok(held)
    }

    /// Releases the lock; calling it again is a no-op
    pub fn release(&mut self) -> Result<(), LedgerError> {
        if self.released {
            return Ok(());
        }
        self.ledger.unlock(&self.handle.source, &self.handle.token)?;
        self.released = true;
        debug!("Released lock on {}", self.handle.source);
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release lock on {}: {}", self.handle.source, e);
        }
    }
}
