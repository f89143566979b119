//! Tidemark main entry point
//!
//! Command-line interface over the ledger, the deduplication engine and the run
//! coordinator.

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidemark::config::{load_config_with_hash, Config};
use tidemark::crawler::{
    ConfigRegistry, HtmlTextProcessor, HttpFetcher, RateLimiter, RunCoordinator, RunOutcome,
    SkipReason, SourceRegistry,
};
use tidemark::ledger::{Ledger, SqliteLedger};
use tidemark::output::{load_report, print_report};
use tidemark::DedupEngine;
use tracing_subscriber::EnvFilter;

/// Tidemark: crawl state and deduplication for recurring ingestion
///
/// Keeps a durable ledger of every item seen, deduplicates content across runs,
/// paces requests per source and runs each source at most once at a time.
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(version)]
#[command(about = "Crawl state and deduplication for recurring ingestion", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every due source, or one source regardless of schedule
    Run {
        /// Run only this source
        #[arg(long)]
        source: Option<String>,

        /// Re-fetch items that are already resolved
        #[arg(long, requires = "source")]
        force: bool,
    },

    /// Show which sources are due and why
    Due,

    /// Show ledger statistics
    Stats {
        /// Limit statistics to this source
        #[arg(long)]
        source: Option<String>,
    },

    /// Manage the bulk collection campaign
    Campaign {
        #[command(subcommand)]
        action: CampaignAction,
    },
}

#[derive(Subcommand, Debug)]
enum CampaignAction {
    /// Start a campaign using the [campaign] section
    Start,
    /// Show the active or most recent campaign
    Status,
    /// Complete the active campaign now
    Complete,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::debug!("Configuration loaded (hash: {})", config_hash);

    let ledger: Arc<dyn Ledger> = Arc::new(
        SqliteLedger::open(Path::new(&config.ledger.database_path), config.ledger_options()?)
            .with_context(|| format!("failed to open ledger {}", config.ledger.database_path))?,
    );

    match cli.command {
        Command::Run { source, force } => handle_run(&config, ledger, source, force).await,
        Command::Due => handle_due(&config, ledger),
        Command::Stats { source } => handle_stats(ledger.as_ref(), source.as_deref()),
        Command::Campaign { action } => handle_campaign(&config, &config_hash, ledger.as_ref(), action),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("tidemark=info,warn"),
            1 => EnvFilter::new("tidemark=debug,info"),
            2 => EnvFilter::new("tidemark=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn build_coordinator(config: &Config, ledger: Arc<dyn Ledger>) -> RunCoordinator {
    let dedup = Arc::new(DedupEngine::new(ledger.clone(), config.dedup_config()));
    let limiter = Arc::new(RateLimiter::new(config.rate_limiter_config()));
    RunCoordinator::new(
        ledger,
        dedup,
        limiter,
        config.filter_chain(),
        config.run_config(),
    )
}

/// Handles `run`: one named source, or every due source
async fn handle_run(
    config: &Config,
    ledger: Arc<dyn Ledger>,
    source: Option<String>,
    force: bool,
) -> anyhow::Result<()> {
    let coordinator = build_coordinator(config, ledger);
    let registry = ConfigRegistry::from_config(config);
    let fetcher = HttpFetcher::new(&config.user_agent).context("failed to build HTTP client")?;
    let processor = HtmlTextProcessor::new(&config.run.output_dir);

    let now = Utc::now();
    let outcomes = match source {
        Some(name) => {
            if config.source(&name).is_none() {
                bail!("unknown source '{}'", name);
            }
            let mode = coordinator.scheduler().run_mode(now)?;
            let candidates = registry.candidates(&name);
            let outcome = coordinator
                .run_source(&name, mode, candidates, &fetcher, &processor, force)
                .await?;
            vec![(name, Ok(outcome))]
        }
        None => coordinator
            .run_due(now, &registry, &fetcher, &processor)
            .await?
            .into_iter()
            .map(|run| (run.source, run.result))
            .collect(),
    };

    if outcomes.is_empty() {
        println!("No sources due");
    }

    let mut failures = 0usize;
    for (source, result) in outcomes {
        match result {
            Ok(RunOutcome::Completed(report)) => println!(
                "{}: completed {} run: {} candidates, {} fetched, {} processed, {} duplicates, {} filtered, {} failed",
                source,
                report.mode,
                report.candidates,
                report.fetched,
                report.processed,
                report.duplicates(),
                report.filtered,
                report.failed
            ),
            Ok(RunOutcome::Interrupted(report)) => println!(
                "{}: interrupted after {} fetches (lock lost)",
                source, report.fetched
            ),
            Ok(RunOutcome::Skipped(SkipReason::AlreadyRunning { expires_at })) => println!(
                "{}: skipped, already running (lock expires {})",
                source,
                expires_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
            Err(e) => {
                tracing::error!("Run of {} failed: {}", source, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} source run(s) failed", failures);
    }
    Ok(())
}

/// Handles `due`: lists sources that `run` would pick up now
fn handle_due(config: &Config, ledger: Arc<dyn Ledger>) -> anyhow::Result<()> {
    let coordinator = build_coordinator(config, ledger);
    let registry = ConfigRegistry::from_config(config);
    let due = coordinator.scheduler().due_sources(Utc::now(), &registry)?;

    if due.is_empty() {
        println!("No sources due");
    }
    for source in due {
        println!("{} ({} mode, {})", source.name, source.mode, source.reason);
    }
    Ok(())
}

fn handle_stats(ledger: &dyn Ledger, source: Option<&str>) -> anyhow::Result<()> {
    let report = load_report(ledger, source)?;
    print_report(&report);
    Ok(())
}

/// Handles `campaign start|status|complete`
fn handle_campaign(
    config: &Config,
    config_hash: &str,
    ledger: &dyn Ledger,
    action: CampaignAction,
) -> anyhow::Result<()> {
    match action {
        CampaignAction::Start => {
            let campaign = ledger
                .start_campaign(&config.campaign.name, config.campaign_duration()?, config_hash)
                .context("failed to start campaign")?;
            println!(
                "Started campaign {} (expires {})",
                campaign.name,
                campaign.expires_at().to_rfc3339()
            );
        }
        CampaignAction::Status => {
            ledger.complete_if_expired()?;
            match ledger.active_campaign()? {
                Some(campaign) => println!(
                    "Campaign {} is active until {}",
                    campaign.name,
                    campaign.expires_at().to_rfc3339()
                ),
                None => match ledger.campaigns()?.pop() {
                    Some(last) => println!(
                        "No active campaign; last was {} (ended {})",
                        last.name,
                        last.end_date
                            .map(|at| at.to_rfc3339())
                            .unwrap_or_else(|| "unknown".to_string())
                    ),
                    None => println!("No campaign has been started"),
                },
            }
        }
        CampaignAction::Complete => {
            if ledger.complete_campaign_at(Utc::now())? {
                println!("Campaign completed");
            } else {
                println!("No active campaign");
            }
        }
    }
    Ok(())
}
