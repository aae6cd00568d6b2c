use crate::persistence::types::StoreError;
use thiserror::Error;

/// Errors raised by the revision tree store
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// Local optimistic-update mismatch: the caller must re-read the current
    /// revision and retry
    #[error("Document update conflict on {doc_id}: expected parent {expected:?}, current is {actual:?}")]
    Conflict {
        doc_id: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Revision not found: {doc_id} {rev_id}")]
    RevisionNotFound { doc_id: String, rev_id: String },

    /// Malformed revision history (non-consecutive generations, bad ids).
    /// The tree is left untouched.
    #[error("Invalid revision history for {doc_id}: {reason}")]
    InvalidHistory { doc_id: String, reason: String },

    #[error("Invalid document id: {0:?}")]
    InvalidDocumentId(String),

    #[error("Invalid revision id: {0:?}")]
    InvalidRevisionId(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DatastoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DocumentNotFound(_) | Self::RevisionNotFound { .. }
        )
    }

    /// Errors caused by malformed input rather than by the store
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidHistory { .. } | Self::InvalidDocumentId(_) | Self::InvalidRevisionId(_)
        )
    }
}

impl From<serde_json::Error> for DatastoreError {
    fn from(e: serde_json::Error) -> Self {
        DatastoreError::SerializationError(e.to_string())
    }
}

/// Result type alias for datastore operations
pub type Result<T> = std::result::Result<T, DatastoreError>;
