//! Content fingerprints
//!
//! Exact fingerprints are SHA-256 digests of normalized text. Similarity
//! fingerprints are MinHash signatures over word shingles, so the fraction of
//! matching slots between two signatures estimates the Jaccard similarity of the
//! documents' shingle sets.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;

/// Modulus of the permutation family, the Mersenne prime 2^61 - 1
const MERSENNE_PRIME: u64 = (1 << 61) - 1;

/// Seed for the permutation coefficients; changing it invalidates stored signatures
pub const DEFAULT_SEED: u64 = 0x7469_6465_6d61_726b;

pub const DEFAULT_NUM_PERM: usize = 128;
pub const DEFAULT_SHINGLE_SIZE: usize = 3;

/// Lowercases and collapses all whitespace runs into single spaces
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 of the normalized text
pub fn content_hash(text: &str) -> ContentHash {
    let normalized = normalize_text(text);
    let digest = Sha256::digest(normalized.as_bytes());
    ContentHash(digest.into())
}

/// Exact content fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Word shingles of already-normalized text
///
/// Text shorter than `size` words yields a single shingle holding all of it;
/// empty text yields none.
pub fn shingles(normalized: &str, size: usize) -> HashSet<String> {
    let words: Vec<&str> = normalized.split_whitespace().collect();
    if words.is_empty() {
        return HashSet::new();
    }
    let size = size.max(1);
    if words.len() < size {
        return HashSet::from([words.join(" ")]);
    }
    words.windows(size).map(|w| w.join(" ")).collect()
}

/// Exact Jaccard similarity of two sets
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

fn shingle_hash(shingle: &str) -> u64 {
    let digest = Sha256::digest(shingle.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// MinHash signature, one minimum per permutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(Vec<u64>);

impl Signature {
    pub fn new(values: Vec<u64>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Estimated Jaccard similarity; signatures of different lengths never match
    pub fn similarity(&self, other: &Signature) -> f64 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }
        let equal = self
            .0
            .iter()
            .zip(&other.0)
            .filter(|(a, b)| a == b)
            .count();
        equal as f64 / self.0.len() as f64
    }

    /// Little-endian encoding for the ledger
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 8 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();
        Some(Self(values))
    }
}

/// Computes MinHash signatures with a fixed, seeded permutation family
///
/// Each permutation is `(a * x + b) mod (2^61 - 1)` with coefficients drawn from
/// SplitMix64, so the same parameters always produce the same signatures.
#[derive(Debug, Clone)]
pub struct MinHasher {
    shingle_size: usize,
    seed: u64,
    coefficients: Vec<(u64, u64)>,
}

impl Default for MinHasher {
    fn default() -> Self {
        Self::new(DEFAULT_NUM_PERM, DEFAULT_SHINGLE_SIZE, DEFAULT_SEED)
    }
}

impl MinHasher {
    pub fn new(num_perm: usize, shingle_size: usize, seed: u64) -> Self {
        let mut state = seed;
        let coefficients = (0..num_perm)
            .map(|_| {
                let a = splitmix64(&mut state) % (MERSENNE_PRIME - 1) + 1;
                let b = splitmix64(&mut state) % MERSENNE_PRIME;
                (a, b)
            })
            .collect();
        Self {
            shingle_size,
            seed,
            coefficients,
        }
    }

    pub fn num_perm(&self) -> usize {
        self.coefficients.len()
    }

    pub fn shingle_size(&self) -> usize {
        self.shingle_size
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Signature of `text` (normalized internally)
    pub fn signature(&self, text: &str) -> Signature {
        let normalized = normalize_text(text);
        let hashes: Vec<u64> = shingles(&normalized, self.shingle_size)
            .iter()
            .map(|s| shingle_hash(s) % MERSENNE_PRIME)
            .collect();

        let values = self
            .coefficients
            .iter()
            .map(|&(a, b)| {
                hashes
                    .iter()
                    .map(|&x| {
                        ((a as u128 * x as u128 + b as u128) % MERSENNE_PRIME as u128) as u64
                    })
                    .min()
                    .unwrap_or(u64::MAX)
            })
            .collect();
        Signature(values)
    }
}
