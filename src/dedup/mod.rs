//! Deduplication engine
//!
//! Duplicates are caught in three places:
//! - before fetching, by the ledger (`Ledger::should_fetch`)
//! - after fetching, by exact digest (bounded LRU cache, then the ledger) and by
//!   MinHash/LSH similarity against everything the source has indexed
//! - across runs, by persisting each source's LSH index and digest cache

mod fingerprint;
mod lsh;
mod persist;

pub use fingerprint::{
    content_hash, jaccard, normalize_text, shingles, ContentHash, MinHasher, Signature,
    DEFAULT_NUM_PERM, DEFAULT_SEED, DEFAULT_SHINGLE_SIZE,
};
pub use lsh::LshIndex;
pub use persist::{
    read_index, write_index, IndexError, IndexFile, IndexHeader, INDEX_FORMAT_VERSION,
    INDEX_MAGIC,
};

use crate::ledger::{Ledger, LedgerResult};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Engine parameters; all but the threshold and cache size are recorded in the
/// index header
#[derive(Debug, Clone, PartialEq)]
pub struct DedupConfig {
    pub index_dir: PathBuf,
    pub similarity_threshold: f64,
    pub cache_capacity: usize,
    pub num_perm: usize,
    pub bands: usize,
    pub shingle_size: usize,
    pub seed: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from("./data/index"),
            similarity_threshold: 0.85,
            cache_capacity: 10_000,
            num_perm: DEFAULT_NUM_PERM,
            bands: 32,
            shingle_size: DEFAULT_SHINGLE_SIZE,
            seed: DEFAULT_SEED,
        }
    }
}

impl DedupConfig {
    pub fn rows(&self) -> usize {
        if self.bands == 0 {
            0
        } else {
            self.num_perm / self.bands
        }
    }

    fn header(&self) -> IndexHeader {
        IndexHeader {
            magic: INDEX_MAGIC.to_string(),
            format_version: INDEX_FORMAT_VERSION,
            num_perm: self.num_perm,
            bands: self.bands,
            rows: self.rows(),
            shingle_size: self.shingle_size,
            seed: self.seed,
        }
    }
}

/// Result of checking a freshly fetched document
#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    Unique,
    Exact { of: String },
    Near { of: String, similarity: f64 },
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, Self::Unique)
    }

    pub fn duplicate_of(&self) -> Option<&str> {
        match self {
            Self::Unique => None,
            Self::Exact { of } | Self::Near { of, .. } => Some(of),
        }
    }
}

/// What `load_index` found on disk
#[derive(Debug, Clone, PartialEq)]
pub enum IndexLoad {
    Loaded { documents: usize },
    Missing,
    Corrupt(String),
    Incompatible(String),
}

struct EngineState {
    indexes: HashMap<String, LshIndex>,
    /// Signatures seen this run, so candidates rarely need a ledger lookup
    signatures: HashMap<String, Signature>,
    /// `(source, digest) -> key` of the first document with that content
    digests: LruCache<(String, ContentHash), String>,
}

/// Exact and near-duplicate detection for every source of one process
///
/// Each source's run is the single writer of its index; the engine itself is
/// `Sync` and may be shared between runs of different sources.
pub struct DedupEngine {
    ledger: Arc<dyn Ledger>,
    config: DedupConfig,
    hasher: MinHasher,
    state: Mutex<EngineState>,
}

impl DedupEngine {
    pub fn new(ledger: Arc<dyn Ledger>, config: DedupConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let hasher = MinHasher::new(config.num_perm, config.shingle_size, config.seed);
        Self {
            ledger,
            hasher,
            state: Mutex::new(EngineState {
                indexes: HashMap::new(),
                signatures: HashMap::new(),
                digests: LruCache::new(capacity),
            }),
            config,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// MinHash signature of `text` with this engine's parameters
    pub fn similarity_signature(&self, text: &str) -> Signature {
        self.hasher.signature(text)
    }

    /// Key of an earlier document of `source` with the same content, if any
    ///
    /// The in-memory cache answers first; on a miss the ledger is asked, so an
    /// evicted or previous-run digest is still found.
    pub fn is_exact_duplicate(
        &self,
        source: &str,
        key: &str,
        digest: &ContentHash,
    ) -> LedgerResult<Option<String>> {
        let cache_key = (source.to_string(), *digest);
        {
            let mut state = self.lock_state();
            if let Some(of) = state.digests.get(&cache_key) {
                if of != key {
                    return Ok(Some(of.clone()));
                }
            }
        }

        let found = self.ledger.find_by_content_hash(source, digest, key)?;
        if let Some(of) = &found {
            self.lock_state().digests.put(cache_key, of.clone());
        }
        Ok(found)
    }

    /// Most similar indexed document of `source` at or above `threshold`
    ///
    /// Signatures missing from memory are loaded from the ledger without holding
    /// the engine lock.
    pub fn is_near_duplicate(
        &self,
        source: &str,
        key: &str,
        signature: &Signature,
        threshold: f64,
    ) -> LedgerResult<Option<(String, f64)>> {
        let (mut known, missing) = {
            let state = self.lock_state();
            let Some(index) = state.indexes.get(source) else {
                return Ok(None);
            };
            let mut known = Vec::new();
            let mut missing = Vec::new();
            for candidate in index.candidates(signature) {
                if candidate == key {
                    continue;
                }
                match state.signatures.get(&candidate) {
                    Some(stored) => known.push((candidate, stored.clone())),
                    None => missing.push(candidate),
                }
            }
            (known, missing)
        };

        let mut loaded = Vec::new();
        for candidate in missing {
            match self.ledger.similarity_signature(&candidate)? {
                Some(stored) => loaded.push((candidate, stored)),
                None => debug!("No stored signature for candidate {}", candidate),
            }
        }
        if !loaded.is_empty() {
            let mut state = self.lock_state();
            for (candidate, stored) in &loaded {
                state.signatures.insert(candidate.clone(), stored.clone());
            }
        }
        known.extend(loaded);

        let mut best: Option<(String, f64)> = None;
        for (candidate, stored) in known {
            let similarity = signature.similarity(&stored);
            if similarity >= threshold
                && best.as_ref().map(|(_, s)| similarity > *s).unwrap_or(true)
            {
                best = Some((candidate, similarity));
            }
        }
        Ok(best)
    }

    /// Registers a unique document so later ones can be compared against it
    pub fn add_document(&self, source: &str, key: &str, digest: &ContentHash, signature: &Signature) {
        let mut state = self.lock_state();
        let cache_key = (source.to_string(), *digest);
        if !state.digests.contains(&cache_key) {
            state.digests.put(cache_key, key.to_string());
        }
        state
            .indexes
            .entry(source.to_string())
            .or_insert_with(|| LshIndex::new(self.config.bands, self.config.rows()))
            .insert(key, signature);
        state.signatures.insert(key.to_string(), signature.clone());
    }

    /// Exact check first, then near-duplicate check at the configured threshold
    pub fn check(
        &self,
        source: &str,
        key: &str,
        digest: &ContentHash,
        signature: &Signature,
    ) -> LedgerResult<DedupVerdict> {
        if let Some(of) = self.is_exact_duplicate(source, key, digest)? {
            return Ok(DedupVerdict::Exact { of });
        }
        if let Some((of, similarity)) =
            self.is_near_duplicate(source, key, signature, self.config.similarity_threshold)?
        {
            return Ok(DedupVerdict::Near { of, similarity });
        }
        Ok(DedupVerdict::Unique)
    }

    /// Number of documents indexed for `source`
    pub fn indexed_documents(&self, source: &str) -> usize {
        self.lock_state()
            .indexes
            .get(source)
            .map(LshIndex::len)
            .unwrap_or(0)
    }

    /// Location of a source's index file
    pub fn index_path(&self, source: &str) -> PathBuf {
        index_file_path(&self.config.index_dir, source)
    }

    /// Replaces the in-memory index of `source` with the persisted one
    ///
    /// Never fails: a missing, unreadable or incompatible file leaves an empty
    /// index and is reported through the returned [`IndexLoad`].
    pub fn load_index(&self, source: &str) -> IndexLoad {
        let path = self.index_path(source);
        let (index, digests, outcome) = match read_index(&path, &self.config.header()) {
            Ok(Some(file)) => {
                let index = LshIndex::from_buckets(self.config.bands, self.config.rows(), file.buckets);
                let documents = index.len();
                info!(
                    "Loaded index for {} ({} documents) from {}",
                    source,
                    documents,
                    path.display()
                );
                (index, file.digests, IndexLoad::Loaded { documents })
            }
            Ok(None) => {
                debug!("No index for {} at {}", source, path.display());
                (self.empty_index(), Vec::new(), IndexLoad::Missing)
            }
            Err(IndexError::Incompatible { reason, .. }) => {
                warn!(
                    "Index for {} is incompatible ({}), starting empty",
                    source, reason
                );
                (self.empty_index(), Vec::new(), IndexLoad::Incompatible(reason))
            }
            Err(e) => {
                warn!("Index for {} is unreadable ({}), starting empty", source, e);
                (self.empty_index(), Vec::new(), IndexLoad::Corrupt(e.to_string()))
            }
        };

        let mut state = self.lock_state();
        state.indexes.insert(source.to_string(), index);
        for (hex, key) in digests {
            match ContentHash::from_hex(&hex) {
                Some(digest) => {
                    state.digests.put((source.to_string(), digest), key);
                }
                None => warn!("Skipping malformed digest '{}' in index of {}", hex, source),
            }
        }
        outcome
    }

    /// Atomically writes the index and cached digests of `source`
    pub fn save_index(&self, source: &str) -> Result<(), IndexError> {
        let file = {
            let state = self.lock_state();
            let buckets = state
                .indexes
                .get(source)
                .map(LshIndex::buckets)
                .unwrap_or_default();
            let digests = state
                .digests
                .iter()
                .filter(|((s, _), _)| s == source)
                .map(|((_, digest), key)| (digest.to_hex(), key.clone()))
                .collect();
            IndexFile {
                header: self.config.header(),
                digests,
                buckets,
            }
        };

        let path = self.index_path(source);
        write_index(&path, &file)?;
        debug!(
            "Saved index for {} ({} buckets) to {}",
            source,
            file.buckets.len(),
            path.display()
        );
        Ok(())
    }

    fn empty_index(&self) -> LshIndex {
        LshIndex::new(self.config.bands, self.config.rows())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `<dir>/<source>.idx`
pub fn index_file_path(dir: &Path, source: &str) -> PathBuf {
    dir.join(format!("{}.idx", file_stem(source)))
}

/// A source name with characters unsafe in file names replaced by `_`
pub fn file_stem(source: &str) -> String {
    source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Discovery, FetchRecord, SqliteLedger};
    use tempfile::TempDir;

    fn words(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("{}{}", prefix, i)).collect()
    }

    fn engine(dir: &Path) -> (Arc<SqliteLedger>, DedupEngine) {
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let config = DedupConfig {
            index_dir: dir.to_path_buf(),
            ..DedupConfig::default()
        };
        let engine = DedupEngine::new(ledger.clone(), config);
        (ledger, engine)
    }

    fn index_text(engine: &DedupEngine, source: &str, key: &str, text: &str) {
        engine.add_document(
            source,
            key,
            &content_hash(text),
            &engine.similarity_signature(text),
        );
    }

    #[test]
    fn test_exact_duplicate_from_cache() {
        let dir = TempDir::new().unwrap();
        let (_, engine) = engine(dir.path());
        index_text(&engine, "bbc", "a", "Breaking news from the council");

        let verdict = engine
            .check(
                "bbc",
                "b",
                &content_hash("breaking   NEWS from the council"),
                &engine.similarity_signature("breaking news from the council"),
            )
            .unwrap();
        assert_eq!(verdict, DedupVerdict::Exact { of: "a".to_string() });

        // Other sources do not share digests
        assert!(engine
            .is_exact_duplicate("cnn", "b", &content_hash("breaking news from the council"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_exact_duplicate_from_ledger() {
        let dir = TempDir::new().unwrap();
        let (ledger, engine) = engine(dir.path());
        let text = "an article fetched in an earlier run";

        ledger.discover("old", "bbc", &Discovery::default()).unwrap();
        ledger
            .mark_fetched(
                "old",
                &FetchRecord {
                    http_status: 200,
                    etag: None,
                    last_modified: None,
                    content_hash: content_hash(text),
                    signature: engine.similarity_signature(text),
                },
                false,
            )
            .unwrap();
        ledger.mark_processed("old").unwrap();

        let found = engine
            .is_exact_duplicate("bbc", "new", &content_hash(text))
            .unwrap();
        assert_eq!(found.as_deref(), Some("old"));
    }

    #[test]
    fn test_near_duplicate_above_threshold() {
        let dir = TempDir::new().unwrap();
        let (_, engine) = engine(dir.path());

        let original = words("w", 0..400);
        let mut edited = original.clone();
        for (n, i) in [50, 120, 190, 260, 330].into_iter().enumerate() {
            edited[i] = format!("changed{}", n);
        }
        let original = original.join(" ");
        let edited = edited.join(" ");

        let truth = jaccard(&shingles(&original, 3), &shingles(&edited, 3));
        assert!(truth >= 0.9, "true jaccard {}", truth);

        index_text(&engine, "bbc", "a", &original);
        let verdict = engine
            .check(
                "bbc",
                "b",
                &content_hash(&edited),
                &engine.similarity_signature(&edited),
            )
            .unwrap();
        match verdict {
            DedupVerdict::Near { of, similarity } => {
                assert_eq!(of, "a");
                assert!(similarity >= 0.85);
            }
            other => panic!("expected near duplicate, got {:?}", other),
        }
    }

    #[test]
    fn test_low_similarity_is_unique() {
        let dir = TempDir::new().unwrap();
        let (_, engine) = engine(dir.path());

        let first = words("w", 0..400).join(" ");
        let mut second = words("w", 0..100);
        second.extend(words("x", 0..300));
        let second = second.join(" ");

        let truth = jaccard(&shingles(&first, 3), &shingles(&second, 3));
        assert!(truth <= 0.3, "true jaccard {}", truth);

        index_text(&engine, "bbc", "a", &first);
        let verdict = engine
            .check(
                "bbc",
                "b",
                &content_hash(&second),
                &engine.similarity_signature(&second),
            )
            .unwrap();
        assert_eq!(verdict, DedupVerdict::Unique);
    }

    #[test]
    fn test_document_is_not_its_own_duplicate() {
        let dir = TempDir::new().unwrap();
        let (_, engine) = engine(dir.path());
        let text = words("w", 0..50).join(" ");
        index_text(&engine, "bbc", "a", &text);

        let verdict = engine
            .check(
                "bbc",
                "a",
                &content_hash(&text),
                &engine.similarity_signature(&text),
            )
            .unwrap();
        assert_eq!(verdict, DedupVerdict::Unique);
    }

    #[test]
    fn test_save_and_load_across_engines() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let config = DedupConfig {
            index_dir: dir.path().to_path_buf(),
            ..DedupConfig::default()
        };
        let text = words("w", 0..200).join(" ");

        let first = DedupEngine::new(ledger.clone(), config.clone());
        assert_eq!(first.load_index("bbc"), IndexLoad::Missing);
        index_text(&first, "bbc", "a", &text);
        first.save_index("bbc").unwrap();
        drop(first);

        let second = DedupEngine::new(ledger, config);
        assert_eq!(second.load_index("bbc"), IndexLoad::Loaded { documents: 1 });
        // Digest cache survives too, without any ledger rows
        let found = second
            .is_exact_duplicate("bbc", "b", &content_hash(&text))
            .unwrap();
        assert_eq!(found.as_deref(), Some("a"));
    }

    #[test]
    fn test_near_duplicate_loads_signatures_from_ledger() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let config = DedupConfig {
            index_dir: dir.path().to_path_buf(),
            ..DedupConfig::default()
        };
        let mut text = words("w", 0..400);

        let first = DedupEngine::new(ledger.clone(), config.clone());
        let signature = first.similarity_signature(&text.join(" "));
        ledger.discover("a", "bbc", &Discovery::default()).unwrap();
        ledger
            .mark_fetched(
                "a",
                &FetchRecord {
                    http_status: 200,
                    etag: None,
                    last_modified: None,
                    content_hash: content_hash(&text.join(" ")),
                    signature: signature.clone(),
                },
                false,
            )
            .unwrap();
        first.add_document("bbc", "a", &content_hash(&text.join(" ")), &signature);
        first.save_index("bbc").unwrap();

        // A fresh engine knows the buckets but not the signatures
        let second = DedupEngine::new(ledger, config);
        second.load_index("bbc");
        assert!(second.lock_state().signatures.is_empty());

        text[7] = "edited".to_string();
        let edited = text.join(" ");
        let found = second
            .is_near_duplicate("bbc", "b", &second.similarity_signature(&edited), 0.8)
            .unwrap();
        assert_eq!(found.map(|(of, _)| of).as_deref(), Some("a"));
        assert!(second.lock_state().signatures.contains_key("a"));
    }

    #[test]
    fn test_corrupt_index_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let (_, engine) = engine(dir.path());
        std::fs::write(engine.index_path("bbc"), b"\xff\xfe garbage").unwrap();

        assert!(matches!(engine.load_index("bbc"), IndexLoad::Corrupt(_)));
        assert_eq!(engine.indexed_documents("bbc"), 0);
    }

    #[test]
    fn test_incompatible_index_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        let config = DedupConfig {
            index_dir: dir.path().to_path_buf(),
            ..DedupConfig::default()
        };

        let writer = DedupEngine::new(ledger.clone(), config.clone());
        index_text(&writer, "bbc", "a", "some words in a document");
        writer.save_index("bbc").unwrap();

        let reader = DedupEngine::new(
            ledger,
            DedupConfig {
                bands: 16,
                ..config
            },
        );
        assert!(matches!(reader.load_index("bbc"), IndexLoad::Incompatible(_)));
        assert_eq!(reader.indexed_documents("bbc"), 0);
    }

    #[test]
    fn test_index_file_path_is_sanitized() {
        let path = index_file_path(Path::new("/tmp/idx"), "news/bbc uk");
        assert_eq!(path, PathBuf::from("/tmp/idx/news_bbc_uk.idx"));
    }
}
