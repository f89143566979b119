//! End-to-end runs against a mock HTTP server

use crate::common::{article, coordinator, http_fetcher, open_ledger, open_ledger_with};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tidemark::config::load_config;
use tidemark::crawler::{
    Candidate, ConfigRegistry, DueReason, HtmlTextProcessor, HttpFetcher, RateLimiter,
    RunCoordinator, RunMode, RunOutcome, SkipReason, SourceRegistry,
};
use tidemark::ledger::{LedgerOptions, RecheckPolicy, RunStatus, SqliteLedger};
use tidemark::{DedupEngine, ItemState, Ledger};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_page(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(body)
                .insert_header("content-type", "text/html"),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_full_run_resolves_every_candidate() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_page(&server, "/a", article(0, 120)).await;
    mount_page(&server, "/b", article(0, 120)).await;
    mount_page(&server, "/c", article(1000, 120)).await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(&dir.path().join("ledger.db"));
    let coordinator = coordinator(ledger.clone(), &dir.path().join("index"));
    let processor = HtmlTextProcessor::new(dir.path().join("out"));
    let fetcher = http_fetcher();

    let keys: Vec<String> = ["/a", "/b", "/c", "/gone"]
        .iter()
        .map(|p| format!("{}{}", base, p))
        .collect();
    let candidates = keys.iter().map(|k| Candidate::document(k.clone())).collect();

    let outcome = coordinator
        .run_source("bbc", RunMode::Bulk, candidates, &fetcher, &processor, false)
        .await
        .unwrap();
    let report = match outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {:?}", other),
    };

    assert_eq!(report.discovered, 4);
    assert_eq!(report.fetched, 3);
    assert_eq!(report.processed, 2);
    assert_eq!(report.exact_duplicates, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.indexed_documents, 2);

    let states: Vec<ItemState> = keys
        .iter()
        .map(|k| ledger.get(k).unwrap().unwrap().state)
        .collect();
    assert_eq!(states[2], ItemState::Processed);
    assert_eq!(states[3], ItemState::Failed);
    assert_eq!(
        states[..2]
            .iter()
            .filter(|s| **s == ItemState::Duplicate)
            .count(),
        1
    );

    let emitted = std::fs::read_to_string(processor.document_path("bbc", &keys[2])).unwrap();
    assert!(emitted.starts_with("word1000 word1001"));
    assert!(!emitted.contains("var x"));

    assert_eq!(
        ledger.latest_run("bbc").unwrap().unwrap().status,
        RunStatus::Completed
    );
    assert!(ledger.lock_expiry("bbc").unwrap().is_none());
    assert!(coordinator.acquire_lock("bbc", Duration::from_secs(60)).is_ok());
}

#[tokio::test]
async fn test_second_run_fetches_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string(article(0, 50)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");
    let index_dir = dir.path().join("index");
    let processor = HtmlTextProcessor::new(dir.path().join("out"));
    let fetcher = http_fetcher();
    let key = format!("{}/a", server.uri());

    for _ in 0..2 {
        let coordinator = coordinator(open_ledger(&db_path), &index_dir);
        coordinator
            .run_source(
                "bbc",
                RunMode::Refresh,
                vec![Candidate::document(key.clone())],
                &fetcher,
                &processor,
                false,
            )
            .await
            .unwrap();
    }

    let ledger = open_ledger(&db_path);
    assert_eq!(ledger.get(&key).unwrap().unwrap().state, ItemState::Processed);
    assert_eq!(ledger.fetch_history(&key).unwrap().len(), 1);
}

#[tokio::test]
async fn test_listing_recheck_uses_validators() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(article(0, 40))
                .insert_header("etag", "\"v1\""),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let options = LedgerOptions {
        recheck: RecheckPolicy {
            listing_interval: Some(chrono::Duration::zero()),
            ..RecheckPolicy::default()
        },
        ..LedgerOptions::default()
    };
    let ledger = open_ledger_with(&dir.path().join("ledger.db"), options);
    let coordinator = coordinator(ledger.clone(), &dir.path().join("index"));
    let processor = HtmlTextProcessor::new(dir.path().join("out"));
    let fetcher = http_fetcher();
    let key = format!("{}/feed", server.uri());

    for _ in 0..2 {
        coordinator
            .run_source(
                "bbc",
                RunMode::Refresh,
                vec![Candidate::listing(key.clone())],
                &fetcher,
                &processor,
                false,
            )
            .await
            .unwrap();
    }

    let item = ledger.get(&key).unwrap().unwrap();
    assert_eq!(item.state, ItemState::Processed);
    assert_eq!(item.etag.as_deref(), Some("\"v1\""));
    assert_eq!(ledger.fetch_history(&key).unwrap().len(), 1);
    assert!(item.last_checked_at.is_some());
}

#[tokio::test]
async fn test_rate_limited_response_raises_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(&dir.path().join("ledger.db"));
    let limiter = crate::common::fast_limiter();
    let dedup = Arc::new(DedupEngine::new(
        ledger.clone(),
        crate::common::dedup_config(&dir.path().join("index")),
    ));
    let coordinator = RunCoordinator::new(
        ledger.clone(),
        dedup,
        limiter.clone(),
        Default::default(),
        Default::default(),
    );
    let processor = HtmlTextProcessor::new(dir.path().join("out"));
    let key = format!("{}/busy", server.uri());

    let outcome = coordinator
        .run_source(
            "bbc",
            RunMode::Bulk,
            vec![Candidate::document(key.clone())],
            &http_fetcher(),
            &processor,
            false,
        )
        .await
        .unwrap();

    assert_eq!(outcome.report().unwrap().failed, 1);
    assert_eq!(limiter.backoff_level("bbc"), 1);

    let item = ledger.get(&key).unwrap().unwrap();
    assert_eq!(item.state, ItemState::Failed);
    assert!(item.last_error.unwrap().contains("429"));

    let saved = ledger.load_rate_states().unwrap();
    assert_eq!(saved["bbc"].backoff_level, 1);

    let restarted = RateLimiter::new(limiter.config().clone());
    restarted.restore(&saved);
    assert_eq!(restarted.backoff_level("bbc"), 1);
}

#[tokio::test]
async fn test_busy_source_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(article(0, 30)))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");
    let index_dir = dir.path().join("index");
    let processor = HtmlTextProcessor::new(dir.path().join("out"));
    let fetcher = http_fetcher();
    let key = format!("{}/a", server.uri());

    let other_process = coordinator(open_ledger(&db_path), &index_dir);
    let guard = other_process
        .acquire_lock("bbc", Duration::from_secs(60))
        .unwrap();

    let ledger = open_ledger(&db_path);
    let coordinator = coordinator(ledger.clone(), &index_dir);
    let outcome = coordinator
        .run_source(
            "bbc",
            RunMode::Bulk,
            vec![Candidate::document(key.clone())],
            &fetcher,
            &processor,
            false,
        )
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Skipped(SkipReason::AlreadyRunning { expires_at: Some(_) })
    ));
    assert!(ledger.get(&key).unwrap().is_none());
    assert!(ledger.latest_run("bbc").unwrap().is_none());

    drop(guard);
    let outcome = coordinator
        .run_source(
            "bbc",
            RunMode::Bulk,
            vec![Candidate::document(key.clone())],
            &fetcher,
            &processor,
            false,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
}

#[tokio::test]
async fn test_run_due_from_config_file() {
    let server = MockServer::start().await;
    mount_page(&server, "/news/1", article(0, 60)).await;
    mount_page(&server, "/news/2", article(500, 60)).await;

    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("tidemark.toml");
    let content = format!(
        r#"
[ledger]
database-path = "{db}"

[dedup]
index-dir = "{index}"

[rate-limit]
min-interval-ms = 0

[run]
output-dir = "{out}"

[user-agent]
crawler-name = "TestBot"
crawler-version = "1.0.0"
contact-url = "https://example.com/contact"
contact-email = "test@example.com"

[[source]]
name = "local"
cadence-hours = 24
documents = ["{base}/news/1/", "{base}/news/2?utm_source=feed", "https://ads.example.com/x"]
exclude = ["*.example.com"]
"#,
        db = dir.path().join("ledger.db").display(),
        index = dir.path().join("index").display(),
        out = dir.path().join("out").display(),
        base = server.uri(),
    );
    std::fs::write(&config_path, content).unwrap();
    let config = load_config(&config_path).unwrap();

    let ledger: Arc<dyn Ledger> = Arc::new(
        SqliteLedger::open(
            std::path::Path::new(&config.ledger.database_path),
            config.ledger_options().unwrap(),
        )
        .unwrap(),
    );
    let coordinator = RunCoordinator::new(
        ledger.clone(),
        Arc::new(DedupEngine::new(ledger.clone(), config.dedup_config())),
        Arc::new(RateLimiter::new(config.rate_limiter_config())),
        config.filter_chain(),
        config.run_config(),
    );
    let registry = ConfigRegistry::from_config(&config);
    let fetcher = HttpFetcher::new(&config.user_agent).unwrap();
    let processor = HtmlTextProcessor::new(&config.run.output_dir);

    let runs = coordinator
        .run_due(Utc::now(), &registry, &fetcher, &processor)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].reason, DueReason::NeverRun);
    let report = runs[0].result.as_ref().unwrap().report().unwrap().clone();
    assert_eq!(report.processed, 2);
    assert_eq!(report.excluded, 1);

    let canonical = format!("{}/news/2", server.uri());
    assert_eq!(
        ledger.get(&canonical).unwrap().unwrap().state,
        ItemState::Processed
    );
    assert_eq!(
        ledger.get("https://ads.example.com/x").unwrap().unwrap().state,
        ItemState::Skipped
    );
    assert_eq!(registry.candidates("local").len(), 3);

    assert!(coordinator
        .scheduler()
        .due_sources(Utc::now(), &registry)
        .unwrap()
        .is_empty());
}
