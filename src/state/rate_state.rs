use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Request budget for one source
///
/// A source may issue at most `requests_per_window` requests per `window`, spaced
/// at least `min_interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub requests_per_window: u32,
    pub window: Duration,
    pub min_interval: Duration,
}

impl RateBudget {
    /// A budget that never makes a caller wait
    pub fn unlimited() -> Self {
        Self {
            requests_per_window: u32::MAX,
            window: Duration::from_secs(3600),
            min_interval: Duration::ZERO,
        }
    }
}

/// Tracks the pacing state of a single source
///
/// This structure maintains the per-source information needed for budget
/// windows, minimum spacing and error backoff.
#[derive(Debug, Clone, Default)]
pub struct RateState {
    /// Current backoff level (0 = no backoff, then 1, 2, 4, ...)
    pub backoff_level: u32,

    /// No request may be issued before this instant
    pub backoff_until: Option<Instant>,

    /// Time of the last (possibly reserved, future) request
    pub last_request_time: Option<Instant>,

    /// Start of the current budget window
    pub window_started: Option<Instant>,

    /// Requests issued within the current budget window
    pub window_count: u32,
}

impl RateState {
    /// Creates a new RateState with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculates the time until the next request can be made
    ///
    /// Returns None if a request can be made now, or the duration to wait otherwise.
    /// The wait is the longest of the budget-window wait, the minimum spacing and
    /// the active backoff.
    pub fn time_until_next_request(&self, budget: &RateBudget, now: Instant) -> Option<Duration> {
        let waits = self.waits(budget, now);
        let wait = waits.window.max(waits.spacing).max(waits.backoff);
        if wait.is_zero() {
            None
        } else {
            Some(wait)
        }
    }

    fn waits(&self, budget: &RateBudget, now: Instant) -> Waits {
        let mut waits = Waits::default();

        if let Some(started) = self.window_started {
            let window_end = started + budget.window;
            if self.window_count >= budget.requests_per_window && now < window_end {
                waits.window = window_end - now;
            }
        }

        if let Some(last) = self.last_request_time {
            let earliest = last + budget.min_interval;
            if earliest > now {
                waits.spacing = earliest - now;
            }
        }

        if let Some(until) = self.backoff_until {
            if until > now {
                waits.backoff = until - now;
            }
        }

        waits
    }

    /// Checks if a request can be made right now
    pub fn can_request(&self, budget: &RateBudget, now: Instant) -> bool {
        self.time_until_next_request(budget, now).is_none()
    }

    /// Records a request issued at `at`, rolling the budget window if it expired
    pub fn record_request(&mut self, budget: &RateBudget, at: Instant) {
        match self.window_started {
            Some(started) if at < started + budget.window => {
                self.window_count = self.window_count.saturating_add(1);
            }
            _ => {
                self.window_started = Some(at);
                self.window_count = 1;
            }
        }
        self.last_request_time = Some(match self.last_request_time {
            Some(last) if last > at => last,
            _ => at,
        });
    }

    /// Reserves the next request slot
    ///
    /// A caller never waits longer than the active backoff, the budget-window wait
    /// or one `min_interval`, whichever is longest. When slots reserved by earlier
    /// callers push the next free one past that bound, nothing is reserved and the
    /// caller is told to come back after the bound.
    pub fn reserve(&mut self, budget: &RateBudget, now: Instant) -> Reservation {
        let waits = self.waits(budget, now);
        let bound = waits.window.max(waits.backoff).max(budget.min_interval);
        let wait = waits.window.max(waits.spacing).max(waits.backoff);

        if wait <= bound {
            self.record_request(budget, now + wait);
            Reservation::Granted(wait)
        } else {
            Reservation::Deferred(bound)
        }
    }

    /// Doubles the backoff level (starting at 1), capped at `max_level`
    pub fn escalate_backoff(&mut self, max_level: u32) -> u32 {
        self.backoff_level = if self.backoff_level == 0 {
            1
        } else {
            self.backoff_level.saturating_mul(2)
        }
        .min(max_level.max(1));
        self.backoff_level
    }

    /// Clears any backoff
    pub fn reset_backoff(&mut self) {
        self.backoff_level = 0;
        self.backoff_until = None;
    }

    /// Returns true if a backoff is currently delaying requests
    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.backoff_until.map(|until| until > now).unwrap_or(false)
    }

    /// Converts the monotonic timestamps into wall-clock form for persistence
    pub fn to_snapshot(&self, now: Instant, now_utc: DateTime<Utc>) -> RateSnapshot {
        RateSnapshot {
            backoff_level: self.backoff_level,
            backoff_until: self.backoff_until.and_then(|t| to_wall(t, now, now_utc)),
            last_request_at: self.last_request_time.and_then(|t| to_wall(t, now, now_utc)),
            window_started_at: self.window_started.and_then(|t| to_wall(t, now, now_utc)),
            window_count: self.window_count,
        }
    }

    /// Rebuilds a state from a persisted snapshot
    ///
    /// Timestamps that cannot be represented as an `Instant` on this host (too far
    /// in the past) are dropped, which only makes the limiter more permissive.
    pub fn from_snapshot(snapshot: &RateSnapshot, now: Instant, now_utc: DateTime<Utc>) -> Self {
        let window_started = snapshot
            .window_started_at
            .and_then(|t| to_instant(t, now, now_utc));
        Self {
            backoff_level: snapshot.backoff_level,
            backoff_until: snapshot
                .backoff_until
                .and_then(|t| to_instant(t, now, now_utc)),
            last_request_time: snapshot
                .last_request_at
                .and_then(|t| to_instant(t, now, now_utc)),
            window_started,
            window_count: if window_started.is_some() {
                snapshot.window_count
            } else {
                0
            },
        }
    }
}

#[derive(Debug, Default)]
struct Waits {
    window: Duration,
    spacing: Duration,
    backoff: Duration,
}

/// Outcome of [`RateState::reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// A slot is held for the caller after this wait
    Granted(Duration),
    /// No slot is free within the bound; try again after this wait
    Deferred(Duration),
}

impl Reservation {
    pub fn wait(&self) -> Duration {
        match self {
            Self::Granted(wait) | Self::Deferred(wait) => *wait,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Wall-clock form of a [`RateState`], as stored in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RateSnapshot {
    pub backoff_level: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_request_at: Option<DateTime<Utc>>,
    pub window_started_at: Option<DateTime<Utc>>,
    pub window_count: u32,
}

fn to_wall(t: Instant, now: Instant, now_utc: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if t >= now {
        chrono::Duration::from_std(t - now).ok().map(|d| now_utc + d)
    } else {
        chrono::Duration::from_std(now - t).ok().map(|d| now_utc - d)
    }
}

fn to_instant(t: DateTime<Utc>, now: Instant, now_utc: DateTime<Utc>) -> Option<Instant> {
    if t >= now_utc {
        (t - now_utc).to_std().ok().map(|d| now + d)
    } else {
        (now_utc - t).to_std().ok().and_then(|d| now.checked_sub(d))
    }
}
