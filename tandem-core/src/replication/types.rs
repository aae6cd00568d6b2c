use crate::core::error::DatastoreError;
use crate::core::types::{Attachments, DocumentBody, Sequence};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Replication direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local datastore -> remote
    Push,
    /// Remote -> local datastore
    Pull,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Push => f.write_str("push"),
            Direction::Pull => f.write_str("pull"),
        }
    }
}

/// Lifecycle state of a replicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicatorState {
    Pending,
    Started,
    Stopping,
    Complete,
    Stopped,
    Error,
}

impl ReplicatorState {
    /// Complete, Stopped and Error end a run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicatorState::Complete | ReplicatorState::Stopped | ReplicatorState::Error
        )
    }

    /// A run is in flight
    pub fn is_active(&self) -> bool {
        matches!(self, ReplicatorState::Started | ReplicatorState::Stopping)
    }
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicatorState::Pending => "PENDING",
            ReplicatorState::Started => "STARTED",
            ReplicatorState::Stopping => "STOPPING",
            ReplicatorState::Complete => "COMPLETE",
            ReplicatorState::Stopped => "STOPPED",
            ReplicatorState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Failures talking to a replica
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Failures worth retrying: connection problems, timeouts and 5xx/429
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Connection(_) | TransportError::Timeout(_) => true,
            TransportError::Status { status, .. } => StatusCode::from_u16(*status)
                .is_ok_and(|s| s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS),
            TransportError::InvalidResponse(_) | TransportError::InvalidRequest(_) => false,
        }
    }
}

/// Replication error types
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Giving up on {operation} after {attempts} consecutive transport failures: {last}")]
    TransportExhausted {
        operation: String,
        attempts: u32,
        last: TransportError,
    },

    /// The target could not durably merge a batch
    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Datastore error: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Replicator is already running")]
    AlreadyRunning,

    #[error("No tokio runtime available to run the replication")]
    NoRuntime,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        ReplicationError::Serialization(e.to_string())
    }
}

pub type ReplicationResult<T> = std::result::Result<T, ReplicationError>;

/// One revision to fetch from a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkGetRequest {
    pub doc_id: String,
    pub rev_id: String,
    /// Revisions the target already has, so the source can omit their
    /// attachment metadata
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub atts_since: Vec<String>,
}

/// A revision fetched from a source together with its ancestry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedRevision {
    pub doc_id: String,
    pub rev_id: String,
    /// Revision ids from root to `rev_id`, inclusive
    pub history: Vec<String>,
    pub deleted: bool,
    pub body: DocumentBody,
    pub attachments: Attachments,
}

impl FetchedRevision {
    /// Approximate wire size, used to split write requests
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

/// Per-revision result of a fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(FetchedRevision),
    Failed {
        doc_id: String,
        rev_id: String,
        reason: String,
    },
}

/// Per-revision result of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub doc_id: String,
    pub rev_id: String,
    /// `None` when stored, otherwise the rejection reason
    pub error: Option<String>,
}

impl WriteOutcome {
    pub fn stored(doc_id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            error: None,
        }
    }

    pub fn rejected(
        doc_id: impl Into<String>,
        rev_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            error: Some(reason.into()),
        }
    }

    pub fn is_stored(&self) -> bool {
        self.error.is_none()
    }
}

/// Statistics of one replication run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStats {
    /// Change batches processed
    pub batches: u64,
    /// Documents with at least one revision written to the target
    pub documents_written: u64,
    pub revisions_written: u64,
    /// Documents rejected by the push filter
    pub documents_filtered: u64,
    /// Documents that failed to fetch or write
    pub documents_failed: u64,
    /// Transport calls retried after a transient failure
    pub transport_retries: u64,
    /// Last checkpointed source sequence
    pub last_sequence: Option<Sequence>,
}
