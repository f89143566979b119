//! Cross-run persistence of the near-duplicate index

use crate::common::{dedup_config, open_ledger};
use tempfile::TempDir;
use tidemark::dedup::{content_hash, DedupEngine, DedupVerdict, IndexLoad};
use tidemark::ledger::{Discovery, FetchRecord, Ledger};

fn words(offset: usize, count: usize) -> String {
    (offset..offset + count)
        .map(|i| format!("token{}", i))
        .collect::<Vec<_>>()
        .join(" ")
}

fn resolve(ledger: &dyn Ledger, engine: &DedupEngine, key: &str, text: &str) -> DedupVerdict {
    let digest = content_hash(text);
    let signature = engine.similarity_signature(text);
    ledger.discover(key, "bbc", &Discovery::default()).unwrap();
    ledger
        .mark_fetched(
            key,
            &FetchRecord {
                http_status: 200,
                etag: None,
                last_modified: None,
                content_hash: digest,
                signature: signature.clone(),
            },
            false,
        )
        .unwrap();

    let verdict = engine.check("bbc", key, &digest, &signature).unwrap();
    match verdict.duplicate_of() {
        Some(of) => ledger.mark_duplicate(key, Some(of)).unwrap(),
        None => {
            ledger.mark_processed(key).unwrap();
            engine.add_document("bbc", key, &digest, &signature);
        }
    }
    verdict
}

#[test]
fn test_index_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("ledger.db");
    let index_dir = dir.path().join("index");
    let original = words(0, 200);

    {
        let ledger = open_ledger(&db_path);
        let engine = DedupEngine::new(ledger.clone(), dedup_config(&index_dir));
        assert_eq!(engine.load_index("bbc"), IndexLoad::Missing);
        assert_eq!(
            resolve(ledger.as_ref(), &engine, "https://x/a", &original),
            DedupVerdict::Unique
        );
        engine.save_index("bbc").unwrap();
    }

    let ledger = open_ledger(&db_path);
    let engine = DedupEngine::new(ledger.clone(), dedup_config(&index_dir));
    assert_eq!(engine.load_index("bbc"), IndexLoad::Loaded { documents: 1 });

    let edited = original.replacen("token100", "changed", 1);
    match resolve(ledger.as_ref(), &engine, "https://x/b", &edited) {
        DedupVerdict::Near { of, similarity } => {
            assert_eq!(of, "https://x/a");
            assert!(similarity >= 0.85, "similarity {}", similarity);
        }
        other => panic!("expected near duplicate, got {:?}", other),
    }

    let copy = format!("  {}  ", original.to_uppercase());
    assert_eq!(
        resolve(ledger.as_ref(), &engine, "https://x/c", &copy),
        DedupVerdict::Exact {
            of: "https://x/a".to_string()
        }
    );

    assert_eq!(
        resolve(ledger.as_ref(), &engine, "https://x/d", &words(5000, 200)),
        DedupVerdict::Unique
    );
}

#[test]
fn test_indexes_are_per_source() {
    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(&dir.path().join("ledger.db"));
    let engine = DedupEngine::new(ledger.clone(), dedup_config(&dir.path().join("index")));

    resolve(ledger.as_ref(), &engine, "https://x/a", &words(0, 100));
    engine.save_index("bbc").unwrap();

    assert!(engine.index_path("bbc").exists());
    assert!(!engine.index_path("cnn").exists());
    assert_eq!(engine.load_index("cnn"), IndexLoad::Missing);
    assert_eq!(engine.indexed_documents("bbc"), 1);
    assert_eq!(engine.indexed_documents("cnn"), 0);
}
