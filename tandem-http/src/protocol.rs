//! CouchDB wire formats
//!
//! Documents travel as flat JSON objects with reserved `_`-prefixed fields;
//! ancestry is encoded as `_revisions: {start, ids}` with ids newest first
//! and without their generation prefix.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tandem_core::core::rev_id;
use tandem_core::replication::{BulkGetRequest, FetchedRevision};
use tandem_core::{Attachments, DocumentBody, DocumentRevision, Sequence};

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseInfo {
    pub db_name: String,
    #[serde(default)]
    pub doc_count: u64,
    #[serde(default)]
    pub doc_del_count: u64,
    #[serde(default)]
    pub update_seq: Option<Sequence>,
}

#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeRow>,
    pub last_seq: Sequence,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    pub seq: Sequence,
    pub id: String,
    pub changes: Vec<RevRef>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevRef {
    pub rev: String,
}

#[derive(Debug, Serialize)]
pub struct BulkGetBody<'a> {
    pub docs: Vec<BulkGetItem<'a>>,
}

#[derive(Debug, Serialize)]
pub struct BulkGetItem<'a> {
    pub id: &'a str,
    pub rev: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub atts_since: &'a [String],
}

impl<'a> BulkGetBody<'a> {
    pub fn new(requests: &'a [BulkGetRequest]) -> Self {
        Self {
            docs: requests
                .iter()
                .map(|r| BulkGetItem {
                    id: &r.doc_id,
                    rev: &r.rev_id,
                    atts_since: &r.atts_since,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkGetResponse {
    pub results: Vec<BulkGetResult>,
}

#[derive(Debug, Deserialize)]
pub struct BulkGetResult {
    pub id: String,
    pub docs: Vec<BulkGetDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkGetDoc {
    Ok(Map<String, Value>),
    Error(ErrorBody),
}

/// Error object of a bulk response row
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub rev: Option<String>,
    pub error: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ErrorBody {
    pub fn describe(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{}: {}", self.error, reason),
            None => self.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BulkDocsBody {
    pub docs: Vec<Map<String, Value>>,
    pub new_edits: bool,
}

/// Row of a `_bulk_docs` answer; with `new_edits: false` only failures are
/// usually reported
#[derive(Debug, Deserialize)]
pub struct BulkDocsRow {
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Replication checkpoint stored as a `_local` document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDoc {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "lastSequence")]
    pub last_sequence: Sequence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revisions {
    pub start: u64,
    pub ids: Vec<String>,
}

/// Encode a root-first history as `_revisions`
pub fn encode_revisions(history: &[String]) -> Option<Revisions> {
    let newest = history.last()?;
    let start = rev_id::generation(newest)?;
    let ids = history
        .iter()
        .rev()
        .map(|rev| match rev_id::parse(rev) {
            Ok((_, hash)) => hash.to_string(),
            Err(_) => rev.clone(),
        })
        .collect();
    Some(Revisions { start, ids })
}

/// Decode `_revisions` into a root-first history
pub fn decode_revisions(revisions: &Revisions) -> Result<Vec<String>, String> {
    if revisions.ids.is_empty() {
        return Err("empty _revisions".to_string());
    }
    if revisions.start < revisions.ids.len() as u64 {
        return Err(format!(
            "_revisions start {} is shorter than its {} ids",
            revisions.start,
            revisions.ids.len()
        ));
    }

    let mut history: Vec<String> = revisions
        .ids
        .iter()
        .enumerate()
        .map(|(i, id)| format!("{}-{}", revisions.start - i as u64, id))
        .collect();
    history.reverse();
    Ok(history)
}

/// Build the JSON document written by `_bulk_docs`
pub fn revision_to_doc(
    revision: &FetchedRevision,
) -> Result<Map<String, Value>, serde_json::Error> {
    let mut doc = revision.body.clone();
    doc.retain(|key, _| !key.starts_with('_'));
    doc.insert("_id".to_string(), Value::String(revision.doc_id.clone()));
    doc.insert("_rev".to_string(), Value::String(revision.rev_id.clone()));
    if revision.deleted {
        doc.insert("_deleted".to_string(), Value::Bool(true));
    }
    if let Some(revisions) = encode_revisions(&revision.history) {
        doc.insert("_revisions".to_string(), serde_json::to_value(revisions)?);
    }
    if !revision.attachments.is_empty() {
        doc.insert(
            "_attachments".to_string(),
            serde_json::to_value(&revision.attachments)?,
        );
    }
    Ok(doc)
}

/// Reserved fields split off a fetched document
struct DocParts {
    doc_id: String,
    rev_id: String,
    deleted: bool,
    revisions: Option<Revisions>,
    attachments: Attachments,
    body: DocumentBody,
}

fn split_doc(mut doc: Map<String, Value>) -> Result<DocParts, String> {
    let doc_id = match doc.remove("_id") {
        Some(Value::String(id)) => id,
        _ => return Err("document without _id".to_string()),
    };
    let rev_id = match doc.remove("_rev") {
        Some(Value::String(rev)) => rev,
        _ => return Err(format!("document {} without _rev", doc_id)),
    };
    let deleted = matches!(doc.remove("_deleted"), Some(Value::Bool(true)));
    let revisions = doc
        .remove("_revisions")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| format!("document {}: bad _revisions: {}", doc_id, e))?;
    let attachments = doc
        .remove("_attachments")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| format!("document {}: bad _attachments: {}", doc_id, e))?
        .unwrap_or_default();
    doc.retain(|key, _| !key.starts_with('_'));

    Ok(DocParts {
        doc_id,
        rev_id,
        deleted,
        revisions,
        attachments,
        body: doc,
    })
}

/// Parse a `_bulk_get` document into a revision with its ancestry
pub fn doc_to_fetched(doc: Map<String, Value>) -> Result<FetchedRevision, String> {
    let parts = split_doc(doc)?;
    let history = match &parts.revisions {
        Some(revisions) => decode_revisions(revisions)?,
        None => vec![parts.rev_id.clone()],
    };
    if history.last() != Some(&parts.rev_id) {
        return Err(format!(
            "document {}: _revisions does not end at {}",
            parts.doc_id, parts.rev_id
        ));
    }

    Ok(FetchedRevision {
        doc_id: parts.doc_id,
        rev_id: parts.rev_id,
        history,
        deleted: parts.deleted,
        body: parts.body,
        attachments: parts.attachments,
    })
}

/// Parse a single-document GET into a revision
pub fn doc_to_revision(doc: Map<String, Value>) -> Result<DocumentRevision, String> {
    let parts = split_doc(doc)?;
    let parent_rev_id = parts
        .revisions
        .as_ref()
        .and_then(|r| decode_revisions(r).ok())
        .and_then(|history| history.iter().rev().nth(1).cloned());

    Ok(DocumentRevision {
        doc_id: parts.doc_id,
        rev_id: parts.rev_id,
        parent_rev_id,
        deleted: parts.deleted,
        current: false,
        leaf: true,
        stub: false,
        body: parts.body,
        attachments: parts.attachments,
        sequence: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_revisions_are_newest_first() {
        let history = vec!["1-a".to_string(), "2-b".to_string(), "3-c".to_string()];
        let revisions = encode_revisions(&history).unwrap();
        assert_eq!(revisions.start, 3);
        assert_eq!(revisions.ids, vec!["c", "b", "a"]);
        assert_eq!(decode_revisions(&revisions).unwrap(), history);
    }

    #[test]
    fn test_truncated_revisions_keep_generations() {
        let revisions = Revisions {
            start: 7,
            ids: vec!["g".to_string(), "f".to_string()],
        };
        assert_eq!(decode_revisions(&revisions).unwrap(), vec!["6-f", "7-g"]);

        let broken = Revisions {
            start: 1,
            ids: vec!["b".to_string(), "a".to_string()],
        };
        assert!(decode_revisions(&broken).is_err());
    }

    #[test]
    fn test_doc_to_fetched() {
        let doc = json!({
            "_id": "mydoc",
            "_rev": "2-b",
            "_revisions": { "start": 2, "ids": ["b", "a"] },
            "_attachments": {
                "photo.png": { "content_type": "image/png", "length": 3, "digest": "md5-x", "revpos": 1, "stub": true }
            },
            "animal": "cat"
        });
        let fetched = doc_to_fetched(doc.as_object().cloned().unwrap()).unwrap();

        assert_eq!(fetched.doc_id, "mydoc");
        assert_eq!(fetched.history, vec!["1-a", "2-b"]);
        assert!(!fetched.deleted);
        assert_eq!(fetched.body.get("animal"), Some(&json!("cat")));
        assert!(!fetched.body.contains_key("_revisions"));
        assert_eq!(fetched.attachments["photo.png"].length, 3);
    }

    #[test]
    fn test_mismatched_revisions_rejected() {
        let doc = json!({
            "_id": "mydoc",
            "_rev": "2-b",
            "_revisions": { "start": 2, "ids": ["z", "a"] }
        });
        assert!(doc_to_fetched(doc.as_object().cloned().unwrap()).is_err());
    }

    #[test]
    fn test_revision_to_doc_marks_tombstones() {
        let revision = FetchedRevision {
            doc_id: "gone".to_string(),
            rev_id: "2-d".to_string(),
            history: vec!["1-a".to_string(), "2-d".to_string()],
            deleted: true,
            body: DocumentBody::new(),
            attachments: Attachments::new(),
        };
        let doc = Value::Object(revision_to_doc(&revision).unwrap());

        assert_eq!(doc["_id"], "gone");
        assert_eq!(doc["_deleted"], true);
        assert_eq!(doc["_revisions"], json!({ "start": 2, "ids": ["d", "a"] }));
        assert!(doc.get("_attachments").is_none());
    }

    #[test]
    fn test_bulk_get_result_variants() {
        let response: BulkGetResponse = serde_json::from_value(json!({
            "results": [
                { "id": "a", "docs": [{ "ok": { "_id": "a", "_rev": "1-x" } }] },
                { "id": "b", "docs": [{ "error": { "id": "b", "rev": "1-y", "error": "not_found", "reason": "missing" } }] }
            ]
        }))
        .unwrap();

        assert!(matches!(response.results[0].docs[0], BulkGetDoc::Ok(_)));
        match &response.results[1].docs[0] {
            BulkGetDoc::Error(e) => assert_eq!(e.describe(), "not_found: missing"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_doc_field_names() {
        let doc = CheckpointDoc {
            id: "_local/abc".to_string(),
            rev: None,
            last_sequence: Sequence::from(12),
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value, json!({ "_id": "_local/abc", "lastSequence": "12" }));
    }
}
