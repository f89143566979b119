//! Output module for reporting ledger contents
//!
//! Renders per-state item counts, duplicate rates, campaign status and the run
//! history of each source for the command line.

pub mod stats;

pub use stats::{load_report, print_report, render_report, SourceActivity, StatsReport};
