use super::error::{DatastoreError, Result};
use super::types::DocumentRevision;
use super::{rev_id, winner};
use crate::persistence::types::RevisionRecord;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct RevisionNode {
    record: RevisionRecord,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Revision tree of one document
///
/// Nodes live in an arena; parent and child links are arena indices, and
/// `index` maps revision ids to slots. Several roots are allowed: a
/// replicated history that shares no stored ancestor starts a new root.
#[derive(Debug, Clone)]
pub struct RevisionTree {
    doc_id: String,
    nodes: Vec<RevisionNode>,
    index: HashMap<String, usize>,
}

impl RevisionTree {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild a tree from stored rows
    pub fn from_records(doc_id: &str, mut records: Vec<RevisionRecord>) -> Result<Self> {
        records.sort_by_key(|r| r.sequence);

        let mut tree = Self::new(doc_id);
        for record in records {
            tree.add(record)?;
        }
        Ok(tree)
    }

    /// Attach a revision. Its parent, if any, must already be in the tree.
    pub fn add(&mut self, record: RevisionRecord) -> Result<()> {
        let invalid = |reason: String| DatastoreError::InvalidHistory {
            doc_id: self.doc_id.clone(),
            reason,
        };

        if self.index.contains_key(&record.rev_id) {
            return Err(invalid(format!("duplicate revision {}", record.rev_id)));
        }

        let generation = rev_id::parse(&record.rev_id)?.0;

        let parent = match &record.parent_rev_id {
            Some(parent_rev) => {
                let slot = *self
                    .index
                    .get(parent_rev)
                    .ok_or_else(|| invalid(format!("missing parent {}", parent_rev)))?;
                let parent_generation = rev_id::parse(parent_rev)?.0;
                if generation != parent_generation + 1 {
                    return Err(invalid(format!(
                        "{} is not a child generation of {}",
                        record.rev_id, parent_rev
                    )));
                }
                Some(slot)
            }
            None => None,
        };

        let slot = self.nodes.len();
        self.index.insert(record.rev_id.clone(), slot);
        self.nodes.push(RevisionNode {
            record,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(slot);
        }

        Ok(())
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, rev_id: &str) -> bool {
        self.index.contains_key(rev_id)
    }

    pub fn get(&self, rev_id: &str) -> Option<&RevisionRecord> {
        self.index.get(rev_id).map(|&slot| &self.nodes[slot].record)
    }

    pub fn revisions(&self) -> impl Iterator<Item = &RevisionRecord> {
        self.nodes.iter().map(|n| &n.record)
    }

    pub fn is_leaf(&self, rev_id: &str) -> bool {
        self.index
            .get(rev_id)
            .is_some_and(|&slot| self.nodes[slot].children.is_empty())
    }

    /// All leaves, winner first
    pub fn leaves(&self) -> Vec<&RevisionRecord> {
        let mut leaves: Vec<&RevisionRecord> = self
            .nodes
            .iter()
            .filter(|n| n.children.is_empty())
            .map(|n| &n.record)
            .collect();
        winner::sort_leaves(&mut leaves);
        leaves
    }

    /// Non-deleted leaves, winner first
    pub fn live_leaves(&self) -> Vec<&RevisionRecord> {
        self.leaves().into_iter().filter(|r| !r.deleted).collect()
    }

    pub fn winner(&self) -> Option<&RevisionRecord> {
        winner::pick_winner(
            self.nodes
                .iter()
                .filter(|n| n.children.is_empty())
                .map(|n| &n.record),
        )
    }

    /// More than one non-deleted leaf
    pub fn is_conflicted(&self) -> bool {
        self.nodes
            .iter()
            .filter(|n| n.children.is_empty() && !n.record.deleted)
            .count()
            > 1
    }

    pub fn roots(&self) -> Vec<&RevisionRecord> {
        self.nodes
            .iter()
            .filter(|n| n.parent.is_none())
            .map(|n| &n.record)
            .collect()
    }

    /// Revision ids from the root down to `rev_id`
    pub fn history(&self, rev_id: &str) -> Option<Vec<String>> {
        let mut slot = *self.index.get(rev_id)?;
        let mut path = vec![self.nodes[slot].record.rev_id.clone()];
        while let Some(parent) = self.nodes[slot].parent {
            path.push(self.nodes[parent].record.rev_id.clone());
            slot = parent;
        }
        path.reverse();
        Some(path)
    }

    pub fn max_sequence(&self) -> u64 {
        self.nodes.iter().map(|n| n.record.sequence).max().unwrap_or(0)
    }

    /// Public view of a revision with its leaf/current flags
    pub fn to_revision(&self, rev_id: &str) -> Option<DocumentRevision> {
        let record = self.get(rev_id)?;
        let current = self.winner().is_some_and(|w| w.rev_id == rev_id);

        Some(DocumentRevision {
            doc_id: record.doc_id.clone(),
            rev_id: record.rev_id.clone(),
            parent_rev_id: record.parent_rev_id.clone(),
            deleted: record.deleted,
            current,
            leaf: self.is_leaf(rev_id),
            stub: record.stub,
            body: record.body.clone(),
            attachments: record.attachments.clone(),
            sequence: record.sequence,
        })
    }
}
