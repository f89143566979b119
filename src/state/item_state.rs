/// Item lifecycle states
///
/// This module defines every state an item can be in while the ledger tracks it,
/// and the transitions the ledger accepts between them.
use std::fmt;

/// Represents the current state of an item in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemState {
    // ===== Active States =====
    /// Item is known but has not been fetched yet
    Discovered,

    /// Item content was fetched and fingerprinted but not yet resolved
    Fetched,

    // ===== Terminal States =====
    /// Item was fetched, found unique and handed to the processor
    Processed,

    /// Item was fetched and matched earlier content (exact or near)
    Duplicate,

    /// Item was excluded by policy before any fetch
    Skipped,

    /// Fetching or processing failed; retryable only by requeue or force
    Failed,
}

impl ItemState {
    /// Returns true if this is a terminal state under normal operation
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Returns true if this is an active state (item may still be processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Discovered | Self::Fetched)
    }

    /// Returns true if the item's content has been resolved (emitted or deduplicated)
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Processed | Self::Duplicate)
    }

    /// Returns true if the transition `self -> to` is part of the normal state machine
    ///
    /// Forced re-fetches and re-checks of resolved items are decided by the ledger,
    /// which knows the refresh policy; they are not covered here.
    pub fn can_transition_to(&self, to: ItemState) -> bool {
        matches!(
            (self, to),
            (Self::Discovered, Self::Fetched)
                | (Self::Fetched, Self::Processed)
                | (Self::Fetched, Self::Duplicate)
                | (Self::Discovered, Self::Failed)
                | (Self::Fetched, Self::Failed)
                | (Self::Discovered, Self::Skipped)
                | (Self::Failed, Self::Discovered)
        )
    }

    /// Converts the item state to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Fetched => "fetched",
            Self::Processed => "processed",
            Self::Duplicate => "duplicate",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Parses an item state from its database string representation
    ///
    /// Returns None if the string doesn't match any known state.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(Self::Discovered),
            "fetched" => Some(Self::Fetched),
            "processed" => Some(Self::Processed),
            "duplicate" => Some(Self::Duplicate),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns all possible item states
    pub fn all_states() -> Vec<Self> {
        vec![
            Self::Discovered,
            Self::Fetched,
            Self::Processed,
            Self::Duplicate,
            Self::Skipped,
            Self::Failed,
        ]
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// What kind of unit an item is
///
/// Listings (feeds, index pages, sitemaps) are re-checked periodically even after
/// they were processed; documents are fetched once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ItemKind {
    #[default]
    Document,
    Listing,
}

impl ItemKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Listing => "listing",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "document" => Some(Self::Document),
            "listing" => Some(Self::Listing),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_terminal() {
        assert!(!ItemState::Discovered.is_terminal());
        assert!(!ItemState::Fetched.is_terminal());

        assert!(ItemState::Processed.is_terminal());
        assert!(ItemState::Duplicate.is_terminal());
        assert!(ItemState::Skipped.is_terminal());
        assert!(ItemState::Failed.is_terminal());
    }

    #[test]
    fn test_is_resolved() {
        assert!(ItemState::Processed.is_resolved());
        assert!(ItemState::Duplicate.is_resolved());

        assert!(!ItemState::Fetched.is_resolved());
        assert!(!ItemState::Failed.is_resolved());
        assert!(!ItemState::Skipped.is_resolved());
    }

    #[test]
    fn test_success_path_transitions() {
        assert!(ItemState::Discovered.can_transition_to(ItemState::Fetched));
        assert!(ItemState::Fetched.can_transition_to(ItemState::Processed));
        assert!(ItemState::Fetched.can_transition_to(ItemState::Duplicate));
    }

    #[test]
    fn test_failure_and_skip_transitions() {
        assert!(ItemState::Discovered.can_transition_to(ItemState::Failed));
        assert!(ItemState::Fetched.can_transition_to(ItemState::Failed));
        assert!(ItemState::Discovered.can_transition_to(ItemState::Skipped));
        assert!(ItemState::Failed.can_transition_to(ItemState::Discovered));
    }

    #[test]
    fn test_rejected_transitions() {
        assert!(!ItemState::Discovered.can_transition_to(ItemState::Processed));
        assert!(!ItemState::Discovered.can_transition_to(ItemState::Duplicate));
        assert!(!ItemState::Fetched.can_transition_to(ItemState::Skipped));
        assert!(!ItemState::Processed.can_transition_to(ItemState::Failed));
        assert!(!ItemState::Duplicate.can_transition_to(ItemState::Processed));
        assert!(!ItemState::Skipped.can_transition_to(ItemState::Fetched));
        assert!(!ItemState::Failed.can_transition_to(ItemState::Failed));
    }

    #[test]
    fn test_roundtrip_db_string() {
        for state in ItemState::all_states() {
            let db_str = state.to_db_string();
            let parsed = ItemState::from_db_string(db_str);
            assert_eq!(Some(state), parsed, "Failed roundtrip for {:?}", state);
        }
        assert_eq!(ItemState::from_db_string("fetching"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", ItemState::Discovered), "discovered");
        assert_eq!(format!("{}", ItemState::Duplicate), "duplicate");
        assert_eq!(format!("{}", ItemKind::Listing), "listing");
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(ItemKind::from_db_string("listing"), Some(ItemKind::Listing));
        assert_eq!(ItemKind::from_db_string("document"), Some(ItemKind::Document));
        assert_eq!(ItemKind::from_db_string("feed"), None);
        assert_eq!(ItemKind::default(), ItemKind::Document);
    }
}
