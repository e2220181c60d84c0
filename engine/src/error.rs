//! Error types for the docsync engine.

use crate::{operation::Intent, DocId};
use thiserror::Error;

/// All possible errors surfaced by the sync adapter.
///
/// Errors are `Clone` so a cached connection failure can be handed to every
/// caller that asks for the same store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Connection errors
    #[error("could not open store '{store}': {reason}")]
    ConnectionFailure { store: String, reason: String },

    // Store errors
    #[error("document not found: {0}")]
    NotFound(DocId),

    #[error("revision conflict on document: {id}")]
    RevisionConflict { id: DocId },

    #[error("store error: {0}")]
    Store(String),

    // Shape errors
    #[error("unrecognized store response: {0}")]
    Normalization(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    // Request errors
    #[error("record has no identifier for {0} request")]
    MissingIdentifier(Intent),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    // Change feed errors
    #[error("change feed terminated: {0}")]
    Subscription(String),

    // Lifecycle
    #[error("result discarded: {0}")]
    Discarded(String),
}

impl Error {
    /// True for a write rejected because of a stale revision.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::RevisionConflict { .. })
    }

    /// True for a point-read of a missing document.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::NotFound("todo-1".into());
        assert_eq!(err.to_string(), "document not found: todo-1");

        let err = Error::ConnectionFailure {
            store: "todos".into(),
            reason: "disk full".into(),
        };
        assert_eq!(err.to_string(), "could not open store 'todos': disk full");

        let err = Error::MissingIdentifier(Intent::Delete);
        assert_eq!(err.to_string(), "record has no identifier for delete request");
    }

    #[test]
    fn predicates() {
        assert!(Error::RevisionConflict { id: "a".into() }.is_conflict());
        assert!(!Error::NotFound("a".into()).is_conflict());
        assert!(Error::NotFound("a".into()).is_not_found());
    }
}
