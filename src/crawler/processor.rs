//! Turning fetched bodies into normalized text
//!
//! The processor extracts the text that is fingerprinted and deduplicated, and
//! emits accepted documents downstream.

use crate::dedup::file_stem;
use async_trait::async_trait;
use scraper::{Html, Node, Selector};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from the processing stage
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to extract text from {key}: {message}")]
    Extract { key: String, message: String },

    #[error("Failed to emit {key}: {source}")]
    Emit {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Extracts text from fetched bodies and hands off accepted documents
#[async_trait]
pub trait ContentProcessor: Send + Sync {
    /// Normalized text of `body`; this is what gets fingerprinted
    fn normalize(&self, key: &str, body: &str) -> Result<String, ProcessError>;

    /// Delivers an accepted document downstream
    async fn emit(&self, source: &str, key: &str, text: &str) -> Result<(), ProcessError>;
}

/// Elements whose text is never visible
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Extracts the visible text of `<body>` and writes accepted documents as `.txt` files
///
/// Documents land in `<output_dir>/<source>/<sha256(key)>.txt`.
#[derive(Debug, Clone)]
pub struct HtmlTextProcessor {
    output_dir: PathBuf,
}

impl HtmlTextProcessor {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Where the document for `key` is written
    pub fn document_path(&self, source: &str, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.output_dir
            .join(file_stem(source))
            .join(format!("{}.txt", digest))
    }
}

#[async_trait]
impl ContentProcessor for HtmlTextProcessor {
    fn normalize(&self, key: &str, body: &str) -> Result<String, ProcessError> {
        let text = extract_visible_text(body).ok_or_else(|| ProcessError::Extract {
            key: key.to_string(),
            message: "document has no body".to_string(),
        })?;
        if text.is_empty() {
            return Err(ProcessError::Extract {
                key: key.to_string(),
                message: "no visible text".to_string(),
            });
        }
        Ok(text)
    }

    async fn emit(&self, source: &str, key: &str, text: &str) -> Result<(), ProcessError> {
        let path = self.document_path(source, key);
        let emit_error = |source: std::io::Error| ProcessError::Emit {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(emit_error)?;
        }
        tokio::fs::write(&path, text).await.map_err(emit_error)?;
        Ok(())
    }
}

/// Visible text of the document body, whitespace-collapsed
///
/// Returns `None` if the document has no `<body>` element.
pub fn extract_visible_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let body_selector = Selector::parse("body").ok()?;
    let body = document.select(&body_selector).next()?;

    let mut text = String::new();
    for node in body.descendants() {
        let Node::Text(fragment) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|element| HIDDEN_ELEMENTS.contains(&element.name()))
                .unwrap_or(false)
        });
        if !hidden {
            text.push_str(fragment);
            text.push(' ');
        }
    }

    Some(normalize_whitespace(&text))
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
