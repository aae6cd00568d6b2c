use super::error::{DatastoreError, Result};
use super::rev_id;
use super::tree::RevisionTree;
use super::types::{
    Attachments, ChangeEntry, DocumentBody, DocumentChange, DocumentObserver, DocumentRevision,
    RevsDiffEntry, Sequence,
};
use crate::config::DatastoreSettings;
use crate::persistence::{LocalStore, MemoryStore, RevisionRecord, StoreError};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::hash::BuildHasher;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Revision tree store
///
/// Every mutation of a document, whether a local edit or a replicated
/// insert, goes through the same load → validate → write path under that
/// document's stripe lock, so winner recomputation is never skipped.
/// Different documents mutate concurrently; reads take no stripe lock.
pub struct Datastore {
    name: String,
    store: Arc<dyn LocalStore>,
    stripes: Vec<Mutex<()>>,
    hasher: ahash::RandomState,
    observers: RwLock<Vec<Arc<dyn DocumentObserver>>>,
}

impl Datastore {
    /// Create a datastore over a store collaborator
    pub fn new(name: impl Into<String>, store: Arc<dyn LocalStore>) -> Self {
        Self::from_settings(
            &DatastoreSettings {
                name: name.into(),
                ..DatastoreSettings::default()
            },
            store,
        )
    }

    /// Create a datastore backed by a fresh [`MemoryStore`]
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(MemoryStore::new()))
    }

    pub fn from_settings(settings: &DatastoreSettings, store: Arc<dyn LocalStore>) -> Self {
        let stripes = settings.lock_stripes.max(1);
        info!(
            "Opening datastore {} with {} lock stripes",
            settings.name, stripes
        );

        Self {
            name: settings.name.clone(),
            store,
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
            hasher: ahash::RandomState::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identifier used to derive replication ids
    pub fn identifier(&self) -> String {
        format!("tandem:{}", self.name)
    }

    /// Register an observer notified after every document change
    pub fn add_observer(&self, observer: Arc<dyn DocumentObserver>) {
        self.observers.write().push(observer);
    }

    fn lock_document(&self, doc_id: &str) -> MutexGuard<'_, ()> {
        let stripe = (self.hasher.hash_one(doc_id) as usize) % self.stripes.len();
        self.stripes[stripe].lock()
    }

    /// Load the revision tree of a document, `None` when unknown
    pub fn load_tree(&self, doc_id: &str) -> Result<Option<RevisionTree>> {
        let records = self.store.read_revision_tree(doc_id)?;
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(RevisionTree::from_records(doc_id, records)?))
    }

    fn require_tree(&self, doc_id: &str) -> Result<RevisionTree> {
        self.load_tree(doc_id)?
            .ok_or_else(|| DatastoreError::DocumentNotFound(doc_id.to_string()))
    }

    fn revision_of(tree: &RevisionTree, rev_id: &str) -> Result<DocumentRevision> {
        tree.to_revision(rev_id)
            .ok_or_else(|| DatastoreError::RevisionNotFound {
                doc_id: tree.doc_id().to_string(),
                rev_id: rev_id.to_string(),
            })
    }

    // ---- reads ----

    /// Winning revision of a document; deleted documents are not found
    pub fn get_document(&self, doc_id: &str) -> Result<DocumentRevision> {
        let tree = self.require_tree(doc_id)?;
        match tree.winner() {
            Some(winner) if !winner.deleted => Self::revision_of(&tree, &winner.rev_id),
            _ => Err(DatastoreError::DocumentNotFound(doc_id.to_string())),
        }
    }

    pub fn get_revision(&self, doc_id: &str, rev_id: &str) -> Result<DocumentRevision> {
        let tree = self.require_tree(doc_id)?;
        Self::revision_of(&tree, rev_id)
    }

    /// Every leaf of the document, winner first
    pub fn get_leafs(&self, doc_id: &str) -> Result<Vec<DocumentRevision>> {
        let tree = self.require_tree(doc_id)?;
        tree.leaves()
            .iter()
            .map(|leaf| Self::revision_of(&tree, &leaf.rev_id))
            .collect()
    }

    /// Non-deleted leaves, winner first. More than one means a conflict.
    pub fn get_conflicts(&self, doc_id: &str) -> Result<Vec<DocumentRevision>> {
        let tree = self.require_tree(doc_id)?;
        tree.live_leaves()
            .iter()
            .map(|leaf| Self::revision_of(&tree, &leaf.rev_id))
            .collect()
    }

    pub fn is_conflicted(&self, doc_id: &str) -> Result<bool> {
        Ok(self.require_tree(doc_id)?.is_conflicted())
    }

    pub fn conflicted_document_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for doc_id in self.store.document_ids()? {
            if let Some(tree) = self.load_tree(&doc_id)? {
                if tree.is_conflicted() {
                    ids.push(doc_id);
                }
            }
        }
        Ok(ids)
    }

    /// Ids of documents whose winner is not a tombstone
    pub fn all_document_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for doc_id in self.store.document_ids()? {
            if let Some(tree) = self.load_tree(&doc_id)? {
                if tree.winner().is_some_and(|w| !w.deleted) {
                    ids.push(doc_id);
                }
            }
        }
        Ok(ids)
    }

    pub fn document_count(&self) -> Result<usize> {
        Ok(self.all_document_ids()?.len())
    }

    pub fn last_sequence(&self) -> Result<u64> {
        Ok(self.store.last_sequence()?)
    }

    /// Revision ids from the root down to `rev_id`
    pub fn revision_history(&self, doc_id: &str, rev_id: &str) -> Result<Vec<String>> {
        let tree = self.require_tree(doc_id)?;
        tree.history(rev_id)
            .ok_or_else(|| DatastoreError::RevisionNotFound {
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_string(),
            })
    }

    /// Documents changed after `since`, at most `limit`, in sequence order
    pub fn changes(&self, since: u64, limit: usize) -> Result<Vec<ChangeEntry>> {
        let rows = self.store.list_changes_since(since, limit)?;
        let mut entries = Vec::with_capacity(rows.len());

        for row in rows {
            let corrupted = || {
                DatastoreError::from(StoreError::Corrupted(format!(
                    "change {} names document {} with no revisions",
                    row.sequence, row.doc_id
                )))
            };
            let tree = self.load_tree(&row.doc_id)?.ok_or_else(corrupted)?;
            let winner = tree.winner().ok_or_else(corrupted)?;
            entries.push(ChangeEntry {
                sequence: Sequence::from(row.sequence),
                doc_id: row.doc_id.clone(),
                rev_id: winner.rev_id.clone(),
                deleted: winner.deleted,
                leaf_revs: tree.leaves().iter().map(|r| r.rev_id.clone()).collect(),
            });
        }

        Ok(entries)
    }

    /// Which of the given revisions are not stored here
    pub fn revs_diff(
        &self,
        request: &BTreeMap<String, Vec<String>>,
    ) -> Result<BTreeMap<String, RevsDiffEntry>> {
        let mut response = BTreeMap::new();

        for (doc_id, revs) in request {
            let tree = self.load_tree(doc_id)?;
            let mut missing: Vec<String> = Vec::new();
            for rev in revs {
                let known = tree.as_ref().is_some_and(|t| t.contains(rev));
                if !known && !missing.contains(rev) {
                    missing.push(rev.clone());
                }
            }
            if missing.is_empty() {
                continue;
            }

            let max_generation = missing
                .iter()
                .filter_map(|r| rev_id::generation(r))
                .max()
                .unwrap_or(0);
            let possible_ancestors = tree
                .as_ref()
                .map(|t| {
                    t.leaves()
                        .iter()
                        .filter(|leaf| {
                            rev_id::generation(&leaf.rev_id).unwrap_or(0) < max_generation
                        })
                        .map(|leaf| leaf.rev_id.clone())
                        .collect()
                })
                .unwrap_or_default();

            response.insert(
                doc_id.clone(),
                RevsDiffEntry {
                    missing,
                    possible_ancestors,
                },
            );
        }

        Ok(response)
    }

    pub fn read_checkpoint(&self, replication_id: &str) -> Result<Option<Sequence>> {
        Ok(self.store.read_checkpoint(replication_id)?.map(Sequence::new))
    }

    pub fn write_checkpoint(&self, replication_id: &str, sequence: &Sequence) -> Result<()> {
        debug!("Checkpoint {} -> {}", replication_id, sequence);
        Ok(self.store.write_checkpoint(replication_id, sequence.as_str())?)
    }

    // ---- local edits ----

    /// Create a new document, generating an id when none is given.
    ///
    /// Creating over a deleted document extends its tombstone branch.
    pub fn create_document(
        &self,
        doc_id: Option<&str>,
        body: DocumentBody,
        attachments: Attachments,
    ) -> Result<DocumentRevision> {
        let doc_id = match doc_id {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().simple().to_string(),
        };
        rev_id::validate_document_id(&doc_id)?;

        let (tree, rev) = {
            let _guard = self.lock_document(&doc_id);
            let tree = self.load_tree(&doc_id)?;

            let parent = match tree.as_ref().and_then(RevisionTree::winner) {
                Some(winner) if !winner.deleted => {
                    return Err(DatastoreError::Conflict {
                        doc_id,
                        expected: None,
                        actual: Some(winner.rev_id.clone()),
                    });
                }
                Some(tombstone) => Some(tombstone.rev_id.clone()),
                None => None,
            };

            let rev = rev_id::next_rev_id(parent.as_deref(), false, &body, &attachments)?;
            let record = RevisionRecord::new(&doc_id, rev.clone(), parent, false)
                .with_body(body)
                .with_attachments(attachments);
            (self.commit(&doc_id, tree, vec![record])?, rev)
        };

        self.notify(&tree);
        Self::revision_of(&tree, &rev)
    }

    /// Write a new child of the current winner `parent_rev_id`
    pub fn update_document(
        &self,
        doc_id: &str,
        parent_rev_id: &str,
        body: DocumentBody,
    ) -> Result<DocumentRevision> {
        self.edit(doc_id, parent_rev_id, body, false)
    }

    /// Write a tombstone child of the current winner `rev_id`
    pub fn delete_document(&self, doc_id: &str, rev_id: &str) -> Result<DocumentRevision> {
        self.edit(doc_id, rev_id, DocumentBody::new(), true)
    }

    fn edit(
        &self,
        doc_id: &str,
        parent_rev_id: &str,
        body: DocumentBody,
        deleted: bool,
    ) -> Result<DocumentRevision> {
        let (tree, rev) = {
            let _guard = self.lock_document(doc_id);
            let tree = self.require_tree(doc_id)?;
            let parent = Self::expect_winner(&tree, Some(parent_rev_id))?
                .ok_or_else(|| DatastoreError::DocumentNotFound(doc_id.to_string()))?;
            if deleted && parent.deleted {
                return Err(DatastoreError::DocumentNotFound(doc_id.to_string()));
            }

            let attachments = if deleted {
                Attachments::new()
            } else {
                parent.attachments.clone()
            };
            let rev = rev_id::next_rev_id(Some(parent_rev_id), deleted, &body, &attachments)?;
            let record =
                RevisionRecord::new(doc_id, rev.clone(), Some(parent_rev_id.to_string()), deleted)
                    .with_body(body)
                    .with_attachments(attachments);
            (self.commit(doc_id, Some(tree), vec![record])?, rev)
        };

        self.notify(&tree);
        Self::revision_of(&tree, &rev)
    }

    /// Insert a revision from a local edit.
    ///
    /// `parent_rev_id` must be the current winner (or `None` for a document
    /// that does not exist yet); anything else is a [`DatastoreError::Conflict`].
    pub fn insert(
        &self,
        doc_id: &str,
        rev_id: &str,
        parent_rev_id: Option<&str>,
        body: DocumentBody,
        deleted: bool,
    ) -> Result<DocumentRevision> {
        rev_id::validate_document_id(doc_id)?;
        rev_id::validate(rev_id)?;

        let tree = {
            let _guard = self.lock_document(doc_id);
            let tree = self.load_tree(doc_id)?;

            let attachments = match &tree {
                Some(tree) => Self::expect_winner(tree, parent_rev_id)?
                    .map(|parent| parent.attachments.clone())
                    .unwrap_or_default(),
                None if parent_rev_id.is_some() => {
                    return Err(DatastoreError::Conflict {
                        doc_id: doc_id.to_string(),
                        expected: parent_rev_id.map(str::to_string),
                        actual: None,
                    });
                }
                None => Attachments::new(),
            };

            if parent_rev_id.is_none() && rev_id::generation(rev_id) != Some(1) {
                return Err(DatastoreError::InvalidHistory {
                    doc_id: doc_id.to_string(),
                    reason: format!("root revision {} must be generation 1", rev_id),
                });
            }

            let body = if deleted { DocumentBody::new() } else { body };
            let record = RevisionRecord::new(
                doc_id,
                rev_id,
                parent_rev_id.map(str::to_string),
                deleted,
            )
            .with_body(body)
            .with_attachments(attachments);
            self.commit(doc_id, tree, vec![record])?
        };

        self.notify(&tree);
        Self::revision_of(&tree, rev_id)
    }

    /// Check the optimistic-concurrency precondition of a local edit
    fn expect_winner<'t>(
        tree: &'t RevisionTree,
        parent_rev_id: Option<&str>,
    ) -> Result<Option<&'t RevisionRecord>> {
        let winner = tree.winner();
        match (parent_rev_id, winner) {
            (Some(parent), Some(w)) if w.rev_id == parent => Ok(Some(w)),
            (None, None) => Ok(None),
            (None, Some(w)) if w.deleted => Ok(None),
            (expected, actual) => Err(DatastoreError::Conflict {
                doc_id: tree.doc_id().to_string(),
                expected: expected.map(str::to_string),
                actual: actual.map(|w| w.rev_id.clone()),
            }),
        }
    }

    // ---- replication merge ----

    /// Merge a replicated revision given its ancestry, root first.
    ///
    /// The stored prefix of `history` is skipped and the missing suffix is
    /// created; intermediate revisions become body-less stubs and the last one
    /// carries `body`. Never checks the winner, so a new branch simply becomes
    /// a conflict. Merging an already present leaf is a no-op.
    pub fn insert_with_history(
        &self,
        doc_id: &str,
        history: &[String],
        body: DocumentBody,
        deleted: bool,
        attachments: Attachments,
    ) -> Result<DocumentRevision> {
        rev_id::validate_document_id(doc_id)?;
        Self::validate_history(doc_id, history)?;
        let leaf_rev = &history[history.len() - 1];

        let tree = {
            let _guard = self.lock_document(doc_id);
            let tree = self.load_tree(doc_id)?;

            if let Some(existing) = tree.as_ref().filter(|t| t.contains(leaf_rev)) {
                debug!("Revision {} of {} already present", leaf_rev, doc_id);
                return Self::revision_of(existing, leaf_rev);
            }

            let known = tree
                .as_ref()
                .and_then(|t| history.iter().rposition(|rev| t.contains(rev)));
            let start = known.map_or(0, |i| i + 1);
            let mut parent = known.map(|i| history[i].clone());

            let mut records = Vec::with_capacity(history.len() - start);
            for (offset, rev) in history[start..].iter().enumerate() {
                let is_leaf = start + offset == history.len() - 1;
                let record =
                    RevisionRecord::new(doc_id, rev.clone(), parent.take(), is_leaf && deleted);
                let record = if is_leaf {
                    record
                        .with_body(if deleted { DocumentBody::new() } else { body.clone() })
                        .with_attachments(attachments.clone())
                } else {
                    record.as_stub()
                };
                parent = Some(rev.clone());
                records.push(record);
            }

            debug!(
                "Merging {} new revisions into {} (leaf {})",
                records.len(),
                doc_id,
                leaf_rev
            );
            self.commit(doc_id, tree, records)?
        };

        self.notify(&tree);
        Self::revision_of(&tree, leaf_rev)
    }

    fn validate_history(doc_id: &str, history: &[String]) -> Result<()> {
        let invalid = |reason: String| DatastoreError::InvalidHistory {
            doc_id: doc_id.to_string(),
            reason,
        };

        if history.is_empty() {
            return Err(invalid("empty revision history".to_string()));
        }

        let mut previous: Option<u64> = None;
        for rev in history {
            let generation = rev_id::parse(rev)
                .map_err(|_| invalid(format!("malformed revision id {:?}", rev)))?
                .0;
            if let Some(previous) = previous {
                if generation != previous + 1 {
                    return Err(invalid(format!(
                        "generation {} does not follow {}",
                        generation, previous
                    )));
                }
            }
            previous = Some(generation);
        }

        Ok(())
    }

    /// Tombstone every live leaf except the one chosen by `resolver`.
    ///
    /// `resolver` receives the conflicting leaves (winner first) and returns
    /// the revision id to keep, or `None` to leave the document unchanged.
    pub fn resolve_conflicts<F>(&self, doc_id: &str, resolver: F) -> Result<DocumentRevision>
    where
        F: FnOnce(&[DocumentRevision]) -> Option<String>,
    {
        let (tree, keep) = {
            let _guard = self.lock_document(doc_id);
            let tree = self.require_tree(doc_id)?;
            let conflicts: Vec<DocumentRevision> = tree
                .live_leaves()
                .iter()
                .map(|leaf| Self::revision_of(&tree, &leaf.rev_id))
                .collect::<Result<_>>()?;

            let winner = tree
                .winner()
                .map(|w| w.rev_id.clone())
                .ok_or_else(|| DatastoreError::DocumentNotFound(doc_id.to_string()))?;
            if conflicts.len() < 2 {
                return Self::revision_of(&tree, &winner);
            }

            let Some(keep) = resolver(&conflicts) else {
                return Self::revision_of(&tree, &winner);
            };
            if !conflicts.iter().any(|c| c.rev_id == keep) {
                return Err(DatastoreError::RevisionNotFound {
                    doc_id: doc_id.to_string(),
                    rev_id: keep,
                });
            }

            let mut records = Vec::new();
            for loser in conflicts.iter().filter(|c| c.rev_id != keep) {
                let rev = rev_id::next_rev_id(
                    Some(&loser.rev_id),
                    true,
                    &DocumentBody::new(),
                    &Attachments::new(),
                )?;
                records.push(RevisionRecord::new(
                    doc_id,
                    rev,
                    Some(loser.rev_id.clone()),
                    true,
                ));
            }

            info!(
                "Resolving {} conflicts on {} in favour of {}",
                records.len(),
                doc_id,
                keep
            );
            (self.commit(doc_id, Some(tree), records)?, keep)
        };

        self.notify(&tree);
        Self::revision_of(&tree, &keep)
    }

    /// Validate new rows against the tree, persist them, and return the
    /// updated tree. Nothing is written when validation fails.
    fn commit(
        &self,
        doc_id: &str,
        tree: Option<RevisionTree>,
        records: Vec<RevisionRecord>,
    ) -> Result<RevisionTree> {
        let mut tree = tree.unwrap_or_else(|| RevisionTree::new(doc_id));

        let mut staged = tree.clone();
        for record in &records {
            staged.add(record.clone())?;
        }

        let sequences = self.store.write_revisions(doc_id, records.clone())?;
        for (mut record, sequence) in records.into_iter().zip(sequences) {
            record.sequence = sequence;
            tree.add(record)?;
        }

        Ok(tree)
    }

    fn notify(&self, tree: &RevisionTree) {
        let observers = self.observers.read();
        if observers.is_empty() {
            return;
        }
        let Some(winner) = tree.winner() else {
            return;
        };

        let change = DocumentChange {
            doc_id: tree.doc_id().to_string(),
            winning_rev_id: winner.rev_id.clone(),
            deleted: winner.deleted,
            conflicted: tree.is_conflicted(),
            sequence: tree.max_sequence(),
        };
        for observer in observers.iter() {
            observer.document_changed(&change);
        }
    }
}
