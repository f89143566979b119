//! Integration tests for Tidemark
//!
//! These tests run against on-disk ledgers and index files in temporary
//! directories, and against wiremock servers for the HTTP fetcher.

mod common;
mod coordinator_tests;
mod dedup_tests;
mod ledger_tests;
