use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Document payload: a JSON object with ordered keys
pub type DocumentBody = serde_json::Map<String, Value>;

/// Attachment metadata carried by a revision
///
/// Content bytes are never stored here; `digest` identifies the blob so it
/// can be fetched lazily by whoever owns attachment storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub content_type: String,
    pub length: u64,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default)]
    pub revpos: u64,
    #[serde(default = "default_stub")]
    pub stub: bool,
}

fn default_stub() -> bool {
    true
}

pub type Attachments = BTreeMap<String, AttachmentInfo>;

/// One immutable version of a document, as returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRevision {
    pub doc_id: String,
    pub rev_id: String,
    pub parent_rev_id: Option<String>,
    pub deleted: bool,
    /// True only for the winning leaf
    pub current: bool,
    /// True when the revision has no children
    pub leaf: bool,
    /// True when the revision was created from a replicated history and its
    /// body was never transferred
    pub stub: bool,
    pub body: DocumentBody,
    pub attachments: Attachments,
    /// Local change-feed sequence assigned when the revision was stored
    pub sequence: u64,
}

impl DocumentRevision {
    /// Generation number parsed from the revision id
    pub fn generation(&self) -> u64 {
        super::rev_id::generation(&self.rev_id).unwrap_or(0)
    }

    /// Look up a top-level body field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }
}

/// Opaque change-feed position
///
/// Only the replica that issued a sequence interprets its ordering. The
/// in-memory store issues integers; CouchDB 2.x issues strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Sequence(String);

impl Sequence {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Sequence before any change
    pub fn zero() -> Self {
        Self("0".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value when the sequence was issued by an integer feed
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty() || self.0 == "0"
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Sequence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Sequence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Sequence::from(n),
            Raw::Text(s) => Sequence(s),
        })
    }
}

/// One entry of a change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub sequence: Sequence,
    pub doc_id: String,
    /// Winning revision at the time of the change
    pub rev_id: String,
    pub deleted: bool,
    /// Every leaf revision of the document, winner first
    pub leaf_revs: Vec<String>,
}

/// Per-document answer of a revision diff
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevsDiffEntry {
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub possible_ancestors: Vec<String>,
}

/// Notification sent to document observers after a document changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub doc_id: String,
    pub winning_rev_id: String,
    pub deleted: bool,
    pub conflicted: bool,
    pub sequence: u64,
}

/// Read-only consumer of document changes (secondary indexes, caches)
pub trait DocumentObserver: Send + Sync {
    fn document_changed(&self, change: &DocumentChange);
}
