use super::LocalStore;
use super::types::{ChangeRow, RevisionRecord, StoreError, StoreResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// In-memory [`LocalStore`]
///
/// A single writer lock serializes all writes, which is what makes a
/// multi-row document write atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    /// Revision rows per document, in write order
    revisions: HashMap<String, Vec<RevisionRecord>>,
    /// Change index: sequence -> document
    changes: BTreeMap<u64, String>,
    /// Latest sequence per document
    latest: HashMap<String, u64>,
    sequence: u64,
    checkpoints: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored revision rows
    pub fn revision_count(&self) -> usize {
        self.inner.read().revisions.values().map(Vec::len).sum()
    }
}

impl LocalStore for MemoryStore {
    fn read_revision_tree(&self, doc_id: &str) -> StoreResult<Vec<RevisionRecord>> {
        Ok(self
            .inner
            .read()
            .revisions
            .get(doc_id)
            .cloned()
            .unwrap_or_default())
    }

    fn write_revisions(
        &self,
        doc_id: &str,
        records: Vec<RevisionRecord>,
    ) -> StoreResult<Vec<u64>> {
        let mut inner = self.inner.write();

        // Validate everything before touching state
        if let Some(existing) = inner.revisions.get(doc_id) {
            for record in &records {
                if existing.iter().any(|r| r.rev_id == record.rev_id) {
                    return Err(StoreError::DuplicateRevision {
                        doc_id: doc_id.to_string(),
                        rev_id: record.rev_id.clone(),
                    });
                }
            }
        }
        if records.iter().any(|r| r.doc_id != doc_id) {
            return Err(StoreError::Corrupted(format!(
                "record for another document in write of {}",
                doc_id
            )));
        }

        let mut sequences = Vec::with_capacity(records.len());
        let mut stored = Vec::with_capacity(records.len());
        for mut record in records {
            inner.sequence += 1;
            record.sequence = inner.sequence;
            sequences.push(record.sequence);
            stored.push(record);
        }

        if let Some(&last) = sequences.last() {
            if let Some(previous) = inner.latest.insert(doc_id.to_string(), last) {
                inner.changes.remove(&previous);
            }
            inner.changes.insert(last, doc_id.to_string());
        }

        inner
            .revisions
            .entry(doc_id.to_string())
            .or_default()
            .extend(stored);

        debug!(
            "Stored {} revisions for {} (sequence now {})",
            sequences.len(),
            doc_id,
            inner.sequence
        );

        Ok(sequences)
    }

    fn list_changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<ChangeRow>> {
        let inner = self.inner.read();
        Ok(inner
            .changes
            .range(since.saturating_add(1)..)
            .take(limit)
            .map(|(sequence, doc_id)| ChangeRow {
                sequence: *sequence,
                doc_id: doc_id.clone(),
            })
            .collect())
    }

    fn last_sequence(&self) -> StoreResult<u64> {
        Ok(self.inner.read().sequence)
    }

    fn document_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids: Vec<String> = self.inner.read().revisions.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn read_checkpoint(&self, replication_id: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.read().checkpoints.get(replication_id).cloned())
    }

    fn write_checkpoint(&self, replication_id: &str, sequence: &str) -> StoreResult<()> {
        self.inner
            .write()
            .checkpoints
            .insert(replication_id.to_string(), sequence.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(doc_id: &str, rev_id: &str, parent: Option<&str>) -> RevisionRecord {
        RevisionRecord::new(doc_id, rev_id, parent.map(str::to_string), false)
    }

    #[test]
    fn test_write_assigns_sequences() {
        let store = MemoryStore::new();
        let seqs = store
            .write_revisions("a", vec![record("a", "1-x", None), record("a", "2-y", Some("1-x"))])
            .unwrap();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(store.last_sequence().unwrap(), 2);

        let rows = store.read_revision_tree("a").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].sequence, 2);
    }

    #[test]
    fn test_changes_keep_latest_sequence_per_document() {
        let store = MemoryStore::new();
        store.write_revisions("a", vec![record("a", "1-x", None)]).unwrap();
        store.write_revisions("b", vec![record("b", "1-x", None)]).unwrap();
        store
            .write_revisions("a", vec![record("a", "2-y", Some("1-x"))])
            .unwrap();

        let rows = store.list_changes_since(0, 10).unwrap();
        let docs: Vec<(u64, &str)> = rows.iter().map(|r| (r.sequence, r.doc_id.as_str())).collect();
        assert_eq!(docs, vec![(2, "b"), (3, "a")]);

        let rows = store.list_changes_since(2, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc_id, "a");
    }

    #[test]
    fn test_changes_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let id = format!("doc{}", i);
            store.write_revisions(&id, vec![record(&id, "1-x", None)]).unwrap();
        }
        let rows = store.list_changes_since(0, 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].sequence, 2);
    }

    #[test]
    fn test_duplicate_write_is_rejected_atomically() {
        let store = MemoryStore::new();
        store.write_revisions("a", vec![record("a", "1-x", None)]).unwrap();

        let result = store.write_revisions(
            "a",
            vec![record("a", "2-y", Some("1-x")), record("a", "1-x", None)],
        );
        assert!(matches!(result, Err(StoreError::DuplicateRevision { .. })));
        assert_eq!(store.revision_count(), 1);
        assert_eq!(store.last_sequence().unwrap(), 1);
    }

    #[test]
    fn test_checkpoints() {
        let store = MemoryStore::new();
        assert_eq!(store.read_checkpoint("rep").unwrap(), None);
        store.write_checkpoint("rep", "12").unwrap();
        assert_eq!(store.read_checkpoint("rep").unwrap(), Some("12".to_string()));
    }
}
