//! Statistics gathered from the ledger
//!
//! This module collects what the ledger knows about items, campaigns and runs and
//! renders it as plain text.

use crate::ledger::{CampaignRecord, Ledger, LedgerResult, LedgerStatistics, RunRecord};
use crate::state::ItemState;
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Run history of one source
#[derive(Debug, Clone)]
pub struct SourceActivity {
    pub name: String,
    pub last_success: Option<DateTime<Utc>>,
    pub latest_run: Option<RunRecord>,
}

/// Everything the `stats` command shows
#[derive(Debug, Clone)]
pub struct StatsReport {
    /// Item counts, for one source or all of them
    pub statistics: LedgerStatistics,

    /// The active campaign, or the most recent one
    pub campaign: Option<CampaignRecord>,

    pub sources: Vec<SourceActivity>,
}

/// Loads a report for `source`, or for every source the ledger knows
pub fn load_report(ledger: &dyn Ledger, source: Option<&str>) -> LedgerResult<StatsReport> {
    let statistics = match source {
        Some(name) => ledger.statistics(name)?,
        None => ledger.statistics_all()?,
    };

    let campaign = match ledger.active_campaign()? {
        Some(active) => Some(active),
        None => ledger.campaigns()?.pop(),
    };

    let names = match source {
        Some(name) => vec![name.to_string()],
        None => ledger.sources()?,
    };
    let mut sources = Vec::with_capacity(names.len());
    for name in names {
        sources.push(SourceActivity {
            last_success: ledger.last_successful_run(&name)?,
            latest_run: ledger.latest_run(&name)?,
            name,
        });
    }

    Ok(StatsReport {
        statistics,
        campaign,
        sources,
    })
}

/// Renders a report as text
pub fn render_report(report: &StatsReport) -> String {
    let stats = &report.statistics;
    let mut out = String::new();

    let scope = stats.source.as_deref().unwrap_or("all sources");
    let _ = writeln!(out, "=== Ledger Statistics ({}) ===\n", scope);

    let _ = writeln!(out, "Items: {}", stats.total);
    let mut state_counts: Vec<(ItemState, u64)> = ItemState::all_states()
        .into_iter()
        .map(|state| (state, stats.count(state)))
        .filter(|(_, count)| *count > 0)
        .collect();
    state_counts.sort_by(|a, b| b.1.cmp(&a.1));
    for (state, count) in state_counts {
        let percentage = if stats.total > 0 {
            (count as f64 / stats.total as f64) * 100.0
        } else {
            0.0
        };
        let _ = writeln!(out, "  {}: {} ({:.1}%)", state, count, percentage);
    }
    let _ = writeln!(
        out,
        "Duplicate rate: {:.1}%\n",
        stats.duplicate_rate * 100.0
    );

    match &report.campaign {
        Some(campaign) => {
            let _ = writeln!(
                out,
                "Campaign: {} ({}), started {}, expires {}",
                campaign.name,
                campaign.status.to_db_string(),
                campaign.start_date.to_rfc3339(),
                campaign.expires_at().to_rfc3339()
            );
        }
        None => {
            let _ = writeln!(out, "Campaign: none");
        }
    }

    if !report.sources.is_empty() {
        let _ = writeln!(out, "\nSources:");
        for source in &report.sources {
            let last_success = source
                .last_success
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            let latest = source
                .latest_run
                .as_ref()
                .map(|run| run.status.to_string())
                .unwrap_or_else(|| "none".to_string());
            let _ = writeln!(
                out,
                "  {}: last success {}, latest run {}",
                source.name, last_success, latest
            );
        }
    }

    out
}

/// Prints a report to stdout
pub fn print_report(report: &StatsReport) {
    print!("{}", render_report(report));
}
