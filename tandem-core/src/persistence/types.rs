use crate::core::types::{Attachments, DocumentBody};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Local store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Revision already stored: {doc_id} {rev_id}")]
    DuplicateRevision { doc_id: String, rev_id: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store corrupted: {0}")]
    Corrupted(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A stored revision row
///
/// Rows are append-only: once written they are never rewritten. Winner and
/// leaf flags are derived from the tree when the rows are read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub doc_id: String,
    pub rev_id: String,
    pub parent_rev_id: Option<String>,
    pub deleted: bool,
    /// Body was never seen (ancestor created from a replicated history)
    pub stub: bool,
    pub body: DocumentBody,
    pub attachments: Attachments,
    /// Assigned by the store on write
    pub sequence: u64,
}

impl RevisionRecord {
    pub fn new(
        doc_id: impl Into<String>,
        rev_id: impl Into<String>,
        parent_rev_id: Option<String>,
        deleted: bool,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            parent_rev_id,
            deleted,
            stub: false,
            body: DocumentBody::new(),
            attachments: Attachments::new(),
            sequence: 0,
        }
    }

    pub fn with_body(mut self, body: DocumentBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_attachments(mut self, attachments: Attachments) -> Self {
        self.attachments = attachments;
        self
    }

    /// Mark as a body-less ancestor stub
    pub fn as_stub(mut self) -> Self {
        self.stub = true;
        self.body = DocumentBody::new();
        self
    }
}

/// A change-feed row: the document and its latest sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub sequence: u64,
    pub doc_id: String,
}
