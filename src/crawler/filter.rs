//! Content filters applied to unique documents before they are emitted

use serde_json::{json, Map, Value};

/// Result of a single filter
#[derive(Debug, Clone, PartialEq)]
pub struct FilterVerdict {
    pub passed: bool,
    pub metadata: Map<String, Value>,
}

impl FilterVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            metadata: Map::new(),
        }
    }

    pub fn reject() -> Self {
        Self {
            passed: false,
            metadata: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// A predicate over normalized document text
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, text: &str) -> FilterVerdict;
}

/// Result of a whole chain
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// Every filter passed; metadata of all filters merged
    Passed { metadata: Map<String, Value> },
    /// The named filter rejected the document; metadata gathered so far
    Rejected {
        filter: String,
        metadata: Map<String, Value>,
    },
}

impl FilterOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed { .. })
    }
}

/// Filters run in order; the first rejection stops the chain
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn push(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn run(&self, text: &str) -> FilterOutcome {
        let mut metadata = Map::new();
        for filter in &self.filters {
            let verdict = filter.evaluate(text);
            metadata.extend(verdict.metadata);
            if !verdict.passed {
                return FilterOutcome::Rejected {
                    filter: filter.name().to_string(),
                    metadata,
                };
            }
        }
        FilterOutcome::Passed { metadata }
    }
}

/// Rejects documents with fewer than `min` words
#[derive(Debug, Clone)]
pub struct MinWordCount {
    pub min: usize,
}

impl Filter for MinWordCount {
    fn name(&self) -> &str {
        "min-word-count"
    }

    fn evaluate(&self, text: &str) -> FilterVerdict {
        let words = text.split_whitespace().count();
        let verdict = if words >= self.min {
            FilterVerdict::pass()
        } else {
            FilterVerdict::reject()
        };
        verdict.with("word_count", json!(words))
    }
}

/// Rejects documents containing any of the phrases, case-insensitively
#[derive(Debug, Clone)]
pub struct BlockedPhrases {
    phrases: Vec<String>,
}

impl BlockedPhrases {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

impl Filter for BlockedPhrases {
    fn name(&self) -> &str {
        "blocked-phrases"
    }

    fn evaluate(&self, text: &str) -> FilterVerdict {
        let lowered = text.to_lowercase();
        match self.phrases.iter().find(|p| lowered.contains(p.as_str())) {
            Some(phrase) => FilterVerdict::reject().with("blocked_phrase", json!(phrase)),
            None => FilterVerdict::pass(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl Filter for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn evaluate(&self, _text: &str) -> FilterVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            FilterVerdict::pass()
        }
    }

    #[test]
    fn test_empty_chain_passes() {
        assert!(FilterChain::new().run("anything").passed());
    }

    #[test]
    fn test_min_word_count() {
        let filter = MinWordCount { min: 3 };
        assert!(filter.evaluate("one two three").passed);
        let verdict = filter.evaluate("one two");
        assert!(!verdict.passed);
        assert_eq!(verdict.metadata["word_count"], json!(2));
    }

    #[test]
    fn test_blocked_phrases_case_insensitive() {
        let filter = BlockedPhrases::new(["Sponsored Content", ""]);
        assert!(!filter.evaluate("This is SPONSORED content here").passed);
        assert!(filter.evaluate("Regular news").passed);
    }

    #[test]
    fn test_chain_merges_metadata_when_passing() {
        let chain = FilterChain::new()
            .with_filter(MinWordCount { min: 1 })
            .with_filter(BlockedPhrases::new(["advert"]));

        match chain.run("storm warning issued") {
            FilterOutcome::Passed { metadata } => assert_eq!(metadata["word_count"], json!(3)),
            other => panic!("expected pass, got {:?}", other),
        }
    }

    #[test]
    fn test_chain_stops_at_first_rejection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = FilterChain::new()
            .with_filter(MinWordCount { min: 10 })
            .with_filter(Counting {
                calls: calls.clone(),
            });

        match chain.run("too short") {
            FilterOutcome::Rejected { filter, metadata } => {
                assert_eq!(filter, "min-word-count");
                assert_eq!(metadata["word_count"], json!(2));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.len(), 2);
    }
}
