//! Ledger behaviour against an on-disk database shared by several handles

use crate::common::{open_ledger, open_ledger_with};
use chrono::{Duration, Utc};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;
use tidemark::crawler::{
    CampaignPhase, CampaignScheduler, Candidate, DueReason, LockError, LockGuard, SourceRegistry,
    SourceSpec,
};
use tidemark::dedup::{content_hash, MinHasher};
use tidemark::ledger::{Discovery, FetchRecord, Ledger, LedgerError, LedgerOptions, RunStatus};
use tidemark::ItemState;

fn fetch_record(body: &str) -> FetchRecord {
    FetchRecord {
        http_status: 200,
        etag: None,
        last_modified: None,
        content_hash: content_hash(body),
        signature: MinHasher::default().signature(body),
    }
}

#[test]
fn test_concurrent_discovery_inserts_once() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");
    drop(open_ledger(&db_path));

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let db_path = db_path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let ledger = open_ledger(&db_path);
                barrier.wait();
                ledger
                    .discover("https://x/a", "bbc", &Discovery::default())
                    .unwrap()
            })
        })
        .collect();

    let created = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|created| *created)
        .count();
    assert_eq!(created, 1);

    let ledger = open_ledger(&db_path);
    assert_eq!(ledger.statistics("bbc").unwrap().total, 1);
}

#[test]
fn test_processed_item_is_not_refetched_unless_forced() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");
    let ledger = open_ledger(&db_path);

    assert!(ledger
        .discover("https://x/a", "bbc", &Discovery::default())
        .unwrap());
    assert!(ledger.should_fetch("https://x/a", false).unwrap());
    ledger
        .mark_fetched("https://x/a", &fetch_record("story"), false)
        .unwrap();
    ledger.mark_processed("https://x/a").unwrap();
    drop(ledger);

    let reopened = open_ledger(&db_path);
    assert!(!reopened
        .discover("https://x/a", "bbc", &Discovery::default())
        .unwrap());
    assert_eq!(
        reopened.get("https://x/a").unwrap().unwrap().state,
        ItemState::Processed
    );
    assert!(!reopened.should_fetch("https://x/a", false).unwrap());
    assert!(reopened.should_fetch("https://x/a", true).unwrap());
}

#[test]
fn test_invalid_transition_leaves_item_unchanged() {
    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(&dir.path().join("ledger.db"));
    ledger
        .discover("https://x/b", "bbc", &Discovery::default())
        .unwrap();

    let result = ledger.mark_processed("https://x/b");
    assert!(matches!(result, Err(LedgerError::InvalidTransition { .. })));
    assert_eq!(
        ledger.get("https://x/b").unwrap().unwrap().state,
        ItemState::Discovered
    );
}

#[test]
fn test_lock_is_exclusive_across_handles() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");
    drop(open_ledger(&db_path));

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let db_path = db_path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let ledger = open_ledger(&db_path);
                barrier.wait();
                let result = LockGuard::acquire(
                    ledger,
                    "bbc",
                    &format!("worker-{}", i),
                    std::time::Duration::from_secs(60),
                );
                match result {
                    Ok(mut guard) => {
                        // hold the lock until both attempts are done
                        thread::sleep(std::time::Duration::from_millis(200));
                        guard.release().unwrap();
                        true
                    }
                    Err(LockError::Busy(busy)) => {
                        assert_eq!(busy.source_name, "bbc");
                        assert!(busy.expires_at.is_some());
                        false
                    }
                    Err(e) => panic!("unexpected lock error: {}", e),
                }
            })
        })
        .collect();

    let acquired = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|acquired| *acquired)
        .count();
    assert_eq!(acquired, 1);

    let ledger = open_ledger(&db_path);
    assert!(LockGuard::acquire(ledger, "bbc", "late", std::time::Duration::from_secs(60)).is_ok());
}

struct Sources(Vec<SourceSpec>);

impl SourceRegistry for Sources {
    fn sources(&self) -> Vec<SourceSpec> {
        self.0.clone()
    }

    fn candidates(&self, _source: &str) -> Vec<Candidate> {
        Vec::new()
    }
}

#[test]
fn test_expired_campaign_falls_back_to_cadence() {
    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(&dir.path().join("ledger.db"));

    let now = Utc::now();
    let t0 = now - Duration::days(7);
    ledger
        .start_campaign_at("launch", Duration::days(6), "{}", t0)
        .unwrap();
    let run = ledger.begin_run("bbc").unwrap();
    ledger.finish_run(run, RunStatus::Completed).unwrap();

    let registry = Sources(vec![
        SourceSpec {
            name: "bbc".to_string(),
            cadence: Duration::hours(24),
        },
        SourceSpec {
            name: "cnn".to_string(),
            cadence: Duration::hours(24),
        },
    ]);

    let scheduler = CampaignScheduler::new(ledger.clone());
    assert_eq!(
        scheduler.campaign_phase(now).unwrap(),
        CampaignPhase::Completed
    );

    let due = scheduler.due_sources(now, &registry).unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].name, "cnn");
    assert_eq!(due[0].reason, DueReason::NeverRun);

    let campaigns = ledger.campaigns().unwrap();
    assert_eq!(campaigns.len(), 1);
    assert_eq!(campaigns[0].end_date, Some(t0 + Duration::days(6)));
}

#[test]
fn test_held_write_lock_surfaces_unavailable() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");
    let ledger = open_ledger_with(
        &db_path,
        LedgerOptions {
            busy_timeout: std::time::Duration::ZERO,
            max_retries: 1,
            retry_base: std::time::Duration::from_millis(1),
            ..LedgerOptions::default()
        },
    );

    let writer = rusqlite::Connection::open(&db_path).unwrap();
    writer.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let err = ledger
        .discover("https://x/a", "bbc", &Discovery::default())
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Unavailable {
            operation: "discover",
            attempts: 2,
            ..
        }
    ));

    writer.execute_batch("ROLLBACK;").unwrap();
    assert!(ledger
        .discover("https://x/a", "bbc", &Discovery::default())
        .unwrap());
}
