//! State module for tracking item lifecycles and request pacing
//!
//! # Components
//!
//! - `ItemState`: Lifecycle state of a ledger item (discovered, fetched, processed, ...)
//! - `ItemKind`: Whether an item is a one-off document or a periodically re-checked listing
//! - `RateState`: Per-source pacing state (budget window, spacing, backoff)

mod item_state;
mod rate_state;

// Re-export main types
pub use item_state::{ItemKind, ItemState};
pub use rate_state::{RateBudget, RateSnapshot, RateState, Reservation};
