use super::database::ReplicaDatabase;
use super::transfer::TransportGuard;
use super::types::ReplicationResult;
use crate::core::types::ChangeEntry;
use std::collections::BTreeMap;
use tracing::debug;

/// Revisions of one document the target does not have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRevisions {
    pub doc_id: String,
    pub missing: Vec<String>,
    pub possible_ancestors: Vec<String>,
}

/// Asks the target which leaf revisions of a change batch it lacks
///
/// One `revs_diff` round trip per batch. Every leaf of a changed document is
/// a candidate, so sibling branches are diffed independently.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffNegotiator;

impl DiffNegotiator {
    pub fn new() -> Self {
        Self
    }

    /// Missing revisions per document, in batch order
    pub async fn negotiate(
        &self,
        target: &dyn ReplicaDatabase,
        entries: &[ChangeEntry],
        guard: &TransportGuard,
    ) -> ReplicationResult<Vec<MissingRevisions>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut order: Vec<&str> = Vec::with_capacity(entries.len());
        let mut request: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in entries {
            let revs = request.entry(entry.doc_id.clone()).or_insert_with(|| {
                order.push(&entry.doc_id);
                Vec::new()
            });
            let candidates = if entry.leaf_revs.is_empty() {
                std::slice::from_ref(&entry.rev_id)
            } else {
                entry.leaf_revs.as_slice()
            };
            for rev in candidates {
                if !revs.contains(rev) {
                    revs.push(rev.clone());
                }
            }
        }

        let request = &request;
        let mut response = guard
            .call("revs_diff", || target.revs_diff(request))
            .await?;

        let missing: Vec<MissingRevisions> = order
            .into_iter()
            .filter_map(|doc_id| {
                let entry = response.remove(doc_id)?;
                if entry.missing.is_empty() {
                    return None;
                }
                Some(MissingRevisions {
                    doc_id: doc_id.to_string(),
                    missing: entry.missing,
                    possible_ancestors: entry.possible_ancestors,
                })
            })
            .collect();

        debug!(
            "Diff of {} documents: {} need transfer",
            entries.len(),
            missing.len()
        );
        Ok(missing)
    }
}
