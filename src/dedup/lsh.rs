//! Locality-sensitive hashing over MinHash signatures
//!
//! A signature is cut into `bands` slices of `rows` values. Two documents become
//! candidates when any band hashes to the same bucket.

use crate::dedup::Signature;
use std::collections::{HashMap, HashSet};

/// Banded bucket index of item keys
#[derive(Debug, Clone, Default)]
pub struct LshIndex {
    bands: usize,
    rows: usize,
    buckets: HashMap<(u32, u64), Vec<String>>,
    keys: HashSet<String>,
}

impl LshIndex {
    pub fn new(bands: usize, rows: usize) -> Self {
        Self {
            bands,
            rows,
            buckets: HashMap::new(),
            keys: HashSet::new(),
        }
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// Adds `key` under every band of `signature`; re-adding a key is a no-op
    pub fn insert(&mut self, key: &str, signature: &Signature) {
        if !self.keys.insert(key.to_string()) {
            return;
        }
        for (band, hash) in self.band_hashes(signature) {
            self.buckets
                .entry((band, hash))
                .or_default()
                .push(key.to_string());
        }
    }

    /// Keys sharing at least one band with `signature`, in first-seen order
    pub fn candidates(&self, signature: &Signature) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for slot in self.band_hashes(signature) {
            if let Some(keys) = self.buckets.get(&slot) {
                for key in keys {
                    if seen.insert(key.as_str()) {
                        found.push(key.clone());
                    }
                }
            }
        }
        found
    }

    /// Every bucket as `(band, band_hash, keys)`, sorted for stable output
    pub fn buckets(&self) -> Vec<(u32, u64, Vec<String>)> {
        let mut buckets: Vec<_> = self
            .buckets
            .iter()
            .map(|(&(band, hash), keys)| (band, hash, keys.clone()))
            .collect();
        buckets.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        buckets
    }

    /// Rebuilds an index from persisted buckets
    pub fn from_buckets(
        bands: usize,
        rows: usize,
        buckets: impl IntoIterator<Item = (u32, u64, Vec<String>)>,
    ) -> Self {
        let mut index = Self::new(bands, rows);
        for (band, hash, keys) in buckets {
            index.keys.extend(keys.iter().cloned());
            index.buckets.entry((band, hash)).or_default().extend(keys);
        }
        index
    }

    fn band_hashes(&self, signature: &Signature) -> Vec<(u32, u64)> {
        if self.rows == 0 {
            return Vec::new();
        }
        signature
            .values()
            .chunks_exact(self.rows)
            .take(self.bands)
            .enumerate()
            .map(|(band, rows)| (band as u32, band_hash(rows)))
            .collect()
    }
}

/// FNV-1a over the band's values with a final avalanche; stable across builds
fn band_hash(rows: &[u64]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for value in rows {
        for byte in value.to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^ (hash >> 33)
}
