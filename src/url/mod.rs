//! Item key canonicalisation and source exclusion patterns
//!
//! Keys that parse as HTTP(S) URLs are normalized before they reach the ledger so
//! cosmetic variants of the same page share one row.

mod normalize;
mod pattern;

pub use normalize::normalize_url;
pub use pattern::{excluding_pattern, extract_domain, matches_wildcard};
