//! On-disk format of the near-duplicate index
//!
//! One CBOR file per source. The header records every parameter that shapes
//! signatures and bands; a file written with different parameters is rejected as
//! incompatible rather than silently producing wrong candidates.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const INDEX_MAGIC: &str = "tidemark-index";
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Errors reading or writing an index file
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode index: {0}")]
    Encode(String),

    #[error("Failed to decode index {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Incompatible index {path:?}: {reason}")]
    Incompatible { path: PathBuf, reason: String },
}

/// Parameters an index was built with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub magic: String,
    pub format_version: u32,
    pub num_perm: usize,
    pub bands: usize,
    pub rows: usize,
    pub shingle_size: usize,
    pub seed: u64,
}

impl IndexHeader {
    /// Describes the first parameter that differs from `expected`
    pub fn mismatch(&self, expected: &IndexHeader) -> Option<String> {
        if self.magic != expected.magic {
            return Some(format!("magic '{}'", self.magic));
        }
        if self.format_version != expected.format_version {
            return Some(format!(
                "format version {} (expected {})",
                self.format_version, expected.format_version
            ));
        }
        let params = [
            ("num_perm", self.num_perm, expected.num_perm),
            ("bands", self.bands, expected.bands),
            ("rows", self.rows, expected.rows),
            ("shingle_size", self.shingle_size, expected.shingle_size),
        ];
        for (name, found, wanted) in params {
            if found != wanted {
                return Some(format!("{} {} (expected {})", name, found, wanted));
            }
        }
        if self.seed != expected.seed {
            return Some(format!("seed {:#x} (expected {:#x})", self.seed, expected.seed));
        }
        None
    }
}

/// Full contents of an index file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFile {
    pub header: IndexHeader,
    /// `(hex content hash, key)` of the digest cache
    pub digests: Vec<(String, String)>,
    /// `(band, band_hash, keys)`
    pub buckets: Vec<(u32, u64, Vec<String>)>,
}

/// Reads an index file, checking it against `expected`
///
/// Returns `Ok(None)` when the file does not exist.
pub fn read_index(path: &Path, expected: &IndexHeader) -> Result<Option<IndexFile>, IndexError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let index: IndexFile =
        ciborium::from_reader(BufReader::new(file)).map_err(|e| IndexError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if let Some(reason) = index.header.mismatch(expected) {
        return Err(IndexError::Incompatible {
            path: path.to_path_buf(),
            reason,
        });
    }

    Ok(Some(index))
}

/// Writes an index file atomically
///
/// The data goes to a temporary file in the same directory, is flushed to disk,
/// then renamed over `path`. Readers see either the old file or the new one.
pub fn write_index(path: &Path, index: &IndexFile) -> Result<(), IndexError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut temp_file = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp_file.as_file_mut());
        ciborium::into_writer(index, &mut writer)
            .map_err(|e| IndexError::Encode(e.to_string()))?;
        writer.flush()?;
    }
    temp_file.as_file().sync_all()?;

    temp_file.persist(path).map_err(|e| IndexError::Io(e.error))?;
    Ok(())
}
