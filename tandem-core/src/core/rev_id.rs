//! Revision and document id helpers
//!
//! Revision ids have the form `<generation>-<hash>`. The hash is a content
//! fingerprint, so two replicas making the same edit to the same parent
//! produce the same revision id.

use super::error::{DatastoreError, Result};
use super::types::{Attachments, DocumentBody};
use serde_json::json;
use sha2::{Digest, Sha256};

const HASH_HEX_LEN: usize = 32;

/// Split a revision id into generation and hash
pub fn parse(rev_id: &str) -> Result<(u64, &str)> {
    let invalid = || DatastoreError::InvalidRevisionId(rev_id.to_string());

    let (generation, hash) = rev_id.split_once('-').ok_or_else(invalid)?;
    let generation: u64 = generation.parse().map_err(|_| invalid())?;

    if generation == 0 || hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid());
    }

    Ok((generation, hash))
}

/// Generation of a revision id, `None` when malformed
pub fn generation(rev_id: &str) -> Option<u64> {
    parse(rev_id).ok().map(|(generation, _)| generation)
}

pub fn validate(rev_id: &str) -> Result<()> {
    parse(rev_id).map(|_| ())
}

/// Document ids are non-empty and may only start with `_` for design documents
pub fn validate_document_id(doc_id: &str) -> Result<()> {
    if doc_id.is_empty() || (doc_id.starts_with('_') && !doc_id.starts_with("_design/")) {
        return Err(DatastoreError::InvalidDocumentId(doc_id.to_string()));
    }
    Ok(())
}

/// Compute the id of a new child revision of `parent`
pub fn next_rev_id(
    parent: Option<&str>,
    deleted: bool,
    body: &DocumentBody,
    attachments: &Attachments,
) -> Result<String> {
    let generation = match parent {
        Some(parent) => parse(parent)?.0 + 1,
        None => 1,
    };

    let digests: Vec<(&str, &str)> = attachments
        .iter()
        .map(|(name, info)| (name.as_str(), info.digest.as_str()))
        .collect();

    let fingerprint = json!({
        "parent": parent,
        "deleted": deleted,
        "body": body,
        "attachments": digests,
    });

    let bytes = serde_json::to_vec(&fingerprint)?;
    let digest = Sha256::digest(&bytes);
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_HEX_LEN);

    Ok(format!("{}-{}", generation, hash))
}
