//! Campaign and cadence scheduling
//!
//! While a bulk campaign is active every source runs in bulk mode. Once the
//! campaign has run its course (or none was ever started) sources are refreshed
//! on their own cadence. The scheduler only decides; the coordinator executes.

use crate::crawler::registry::SourceRegistry;
use crate::ledger::{Ledger, LedgerResult};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Whether a bulk campaign is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignPhase {
    Active,
    Completed,
}

/// How a run treats its candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Collect everything the source offers
    Bulk,
    /// Incremental refresh after the campaign
    Refresh,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bulk => write!(f, "bulk"),
            Self::Refresh => write!(f, "refresh"),
        }
    }
}

/// Why a source is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    /// A campaign is active
    Campaign,
    /// Its cadence has elapsed since the last successful run
    Cadence,
    /// It never completed a run
    NeverRun,
}

impl fmt::Display for DueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Campaign => write!(f, "campaign"),
            Self::Cadence => write!(f, "cadence"),
            Self::NeverRun => write!(f, "never-run"),
        }
    }
}

/// A source selected to run now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueSource {
    pub name: String,
    pub mode: RunMode,
    pub reason: DueReason,
}

/// Decides which sources should run
pub struct CampaignScheduler {
    ledger: Arc<dyn Ledger>,
}

impl CampaignScheduler {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Current campaign phase, completing an expired campaign first
    pub fn campaign_phase(&self, now: DateTime<Utc>) -> LedgerResult<CampaignPhase> {
        if self.ledger.complete_if_expired_at(now)? {
            info!("Campaign expired; switching to cadence refreshes");
        }
        if self.ledger.is_active_campaign()? {
            Ok(CampaignPhase::Active)
        } else {
            Ok(CampaignPhase::Completed)
        }
    }

    /// Run mode implied by the current phase
    pub fn run_mode(&self, now: DateTime<Utc>) -> LedgerResult<RunMode> {
        Ok(match self.campaign_phase(now)? {
            CampaignPhase::Active => RunMode::Bulk,
            CampaignPhase::Completed => RunMode::Refresh,
        })
    }

    /// Sources due at `now`
    pub fn due_sources(
        &self,
        now: DateTime<Utc>,
        registry: &dyn SourceRegistry,
    ) -> LedgerResult<Vec<DueSource>> {
        let sources = registry.sources();

        if self.campaign_phase(now)? == CampaignPhase::Active {
            return Ok(sources
                .into_iter()
                .map(|source| DueSource {
                    name: source.name,
                    mode: RunMode::Bulk,
                    reason: DueReason::Campaign,
                })
                .collect());
        }

        let mut due = Vec::new();
        let mut not_due = 0usize;
        for source in sources {
            match self.ledger.last_successful_run(&source.name)? {
                None => due.push(DueSource {
                    name: source.name,
                    mode: RunMode::Refresh,
                    reason: DueReason::NeverRun,
                }),
                Some(last) if last + source.cadence <= now => due.push(DueSource {
                    name: source.name,
                    mode: RunMode::Refresh,
                    reason: DueReason::Cadence,
                }),
                Some(last) => {
                    debug!(
                        "{} not due until {}",
                        source.name,
                        (last + source.cadence).to_rfc3339()
                    );
                    not_due += 1;
                }
            }
        }

        debug!("{} sources due, {} not due", due.len(), not_due);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::registry::{Candidate, SourceSpec};
    use crate::ledger::{RunStatus, SqliteLedger};
    use chrono::{Duration, TimeZone};

    struct Fixed(Vec<SourceSpec>);

    impl SourceRegistry for Fixed {
        fn sources(&self) -> Vec<SourceSpec> {
            self.0.clone()
        }

        fn candidates(&self, _source: &str) -> Vec<Candidate> {
            Vec::new()
        }
    }

    fn registry() -> Fixed {
        Fixed(vec![
            SourceSpec {
                name: "bbc".to_string(),
                cadence: Duration::hours(1),
            },
            SourceSpec {
                name: "cnn".to_string(),
                cadence: Duration::days(365),
            },
        ])
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_no_campaign_is_completed_phase() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let scheduler = CampaignScheduler::new(ledger);
        assert_eq!(
            scheduler.campaign_phase(t0()).unwrap(),
            CampaignPhase::Completed
        );
        assert_eq!(scheduler.run_mode(t0()).unwrap(), RunMode::Refresh);
    }

    #[test]
    fn test_active_campaign_schedules_everything_in_bulk() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open_in_memory().unwrap());
        ledger
            .start_campaign_at("spring", Duration::days(6), "{}", t0())
            .unwrap();
        let scheduler = CampaignScheduler::new(ledger);

        let due = scheduler
            .due_sources(t0() + Duration::days(2), &registry())
            .unwrap();
        assert_eq!(due.len(), 2);
        assert!(due
            .iter()
            .all(|d| d.mode == RunMode::Bulk && d.reason == DueReason::Campaign));
    }

    #[test]
    fn test_expired_campaign_switches_to_cadence() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open_in_memory().unwrap());
        ledger
            .start_campaign_at("spring", Duration::days(6), "{}", t0())
            .unwrap();
        let scheduler = CampaignScheduler::new(ledger.clone());

        let now = t0() + Duration::days(7);
        assert_eq!(
            scheduler.campaign_phase(now).unwrap(),
            CampaignPhase::Completed
        );
        assert!(!ledger.is_active_campaign().unwrap());

        let due = scheduler.due_sources(now, &registry()).unwrap();
        assert!(due
            .iter()
            .all(|d| d.mode == RunMode::Refresh && d.reason == DueReason::NeverRun));
    }

    #[test]
    fn test_cadence_decides_due_sources() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open_in_memory().unwrap());
        for source in ["bbc", "cnn"] {
            let run = ledger.begin_run(source).unwrap();
            ledger.finish_run(run, RunStatus::Completed).unwrap();
        }
        let scheduler = CampaignScheduler::new(ledger);

        let due = scheduler
            .due_sources(Utc::now() + Duration::hours(2), &registry())
            .unwrap();
        assert_eq!(
            due,
            vec![DueSource {
                name: "bbc".to_string(),
                mode: RunMode::Refresh,
                reason: DueReason::Cadence,
            }]
        );

        assert!(scheduler
            .due_sources(Utc::now(), &registry())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_failed_runs_do_not_count() {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let run = ledger.begin_run("bbc").unwrap();
        ledger.finish_run(run, RunStatus::Failed).unwrap();
        let scheduler = CampaignScheduler::new(ledger);

        let due = scheduler.due_sources(Utc::now(), &registry()).unwrap();
        assert!(due
            .iter()
            .any(|d| d.name == "bbc" && d.reason == DueReason::NeverRun));
    }
}
