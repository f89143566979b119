//! Per-source request pacing with failure backoff
//!
//! Each source has a request budget (requests per window plus minimum spacing).
//! Failures classified as rate limiting, server errors or transient network
//! problems raise a backoff level that doubles on each consecutive failure; the
//! delay is `base * level`, jittered and clamped to a hard cap. A success resets it.

use crate::state::{RateBudget, RateSnapshot, RateState, Reservation};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How a failed request should affect pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The upstream asked us to slow down (HTTP 429)
    RateLimited,
    /// The upstream failed (HTTP 5xx)
    ServerError,
    /// Timeouts, resets, refused connections
    Transient,
    /// Not the upstream's load problem (bad request, 404, parse failure)
    Fatal,
}

impl FailureClass {
    pub fn triggers_backoff(&self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RateLimited => "rate-limited",
            Self::ServerError => "server-error",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        };
        write!(f, "{}", name)
    }
}

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_level: u32,
    /// Relative jitter, e.g. 0.2 for ±20 %
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            max_level: 64,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay for a backoff level, before any `Retry-After` hint
    pub fn delay_for(&self, level: u32) -> Duration {
        let nominal = self.base.as_secs_f64() * f64::from(level);
        let factor = if self.jitter > 0.0 {
            let jitter = self.jitter.min(1.0);
            1.0 + rand::rng().random_range(-jitter..=jitter)
        } else {
            1.0
        };
        let seconds = (nominal * factor).clamp(0.0, self.max.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }
}

/// Limiter settings: a default budget, per-source overrides and the backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    pub default_budget: RateBudget,
    pub overrides: HashMap<String, RateBudget>,
    pub backoff: BackoffPolicy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_budget: RateBudget {
                requests_per_window: 600,
                window: Duration::from_secs(3600),
                min_interval: Duration::from_millis(1000),
            },
            overrides: HashMap::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Thread-safe per-source rate limiter
pub struct RateLimiter {
    config: RateLimiterConfig,
    states: Mutex<HashMap<String, RateState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// The budget that applies to `source`
    pub fn budget_for(&self, source: &str) -> RateBudget {
        self.config
            .overrides
            .get(source)
            .copied()
            .unwrap_or(self.config.default_budget)
    }

    /// Tries to reserve the next request slot of `source`
    ///
    /// The wait never exceeds the longest of the backoff cap, the budget-window
    /// wait and the minimum spacing. A `Deferred` answer holds no slot.
    pub fn reserve(&self, source: &str) -> Reservation {
        let budget = self.budget_for(source);
        let mut states = self.lock_states();
        let state = states.entry(source.to_string()).or_default();
        let reservation = state.reserve(&budget, Instant::now());
        if !reservation.wait().is_zero() {
            debug!("Rate limiter: {} must wait {:?}", source, reservation.wait());
        }
        reservation
    }

    /// How long to wait before the next request of `source`
    pub fn acquire(&self, source: &str) -> Duration {
        self.reserve(source).wait()
    }

    /// Sleeps until a request slot of `source` is held
    pub async fn until_ready(&self, source: &str) {
        loop {
            let reservation = self.reserve(source);
            if !reservation.wait().is_zero() {
                tokio::time::sleep(reservation.wait()).await;
            }
            if reservation.is_granted() {
                return;
            }
        }
    }

    /// Clears any backoff of `source`
    pub fn report_success(&self, source: &str) {
        let mut states = self.lock_states();
        if let Some(state) = states.get_mut(source) {
            if state.backoff_level > 0 {
                debug!("Rate limiter: {} recovered, backoff cleared", source);
            }
            state.reset_backoff();
        }
    }

    /// Raises the backoff of `source` after a failed request
    ///
    /// Returns the applied delay, or `None` for classes that do not back off.
    /// A `retry_after` hint from the server can lengthen the delay but never past
    /// the configured cap.
    pub fn report_failure(
        &self,
        source: &str,
        class: FailureClass,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if !class.triggers_backoff() {
            return None;
        }

        let policy = self.config.backoff;
        let mut states = self.lock_states();
        let state = states.entry(source.to_string()).or_default();
        let level = state.escalate_backoff(policy.max_level);

        let mut delay = policy.delay_for(level);
        if let Some(hint) = retry_after {
            delay = delay.max(hint.min(policy.max));
        }

        let now = Instant::now();
        let until = now + delay;
        state.backoff_until = Some(match state.backoff_until {
            Some(existing) if existing > until && existing <= now + policy.max => existing,
            _ => until,
        });

        warn!(
            "Rate limiter: {} failure on {}, backing off {:?} (level {})",
            class, source, delay, level
        );
        Some(delay)
    }

    /// Current backoff level of `source` (0 when not backing off)
    pub fn backoff_level(&self, source: &str) -> u32 {
        self.lock_states()
            .get(source)
            .map(|state| state.backoff_level)
            .unwrap_or(0)
    }

    /// Wall-clock snapshots of every tracked source
    pub fn snapshot(&self) -> HashMap<String, RateSnapshot> {
        let now = Instant::now();
        let now_utc = Utc::now();
        self.lock_states()
            .iter()
            .map(|(source, state)| (source.clone(), state.to_snapshot(now, now_utc)))
            .collect()
    }

    /// Snapshot of a single source, if it is tracked
    pub fn snapshot_source(&self, source: &str) -> Option<RateSnapshot> {
        self.lock_states()
            .get(source)
            .map(|state| state.to_snapshot(Instant::now(), Utc::now()))
    }

    /// Replaces the state of every source present in `snapshots`
    pub fn restore(&self, snapshots: &HashMap<String, RateSnapshot>) {
        let now = Instant::now();
        let now_utc = Utc::now();
        let mut states = self.lock_states();
        for (source, snapshot) in snapshots {
            states.insert(
                source.clone(),
                RateState::from_snapshot(snapshot, now, now_utc),
            );
        }
    }

    fn lock_states(&self) -> MutexGuard<'_, HashMap<String, RateState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
