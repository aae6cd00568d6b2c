use super::database::{ChangesPage, PullFilter, ReplicaDatabase};
use super::types::{
    BulkGetRequest, FetchOutcome, FetchedRevision, ReplicationError, ReplicationResult,
    WriteOutcome,
};
use crate::core::error::DatastoreError;
use crate::core::types::{DocumentRevision, RevsDiffEntry, Sequence};
use crate::core::Datastore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// In-process [`ReplicaDatabase`] over a [`Datastore`]
#[derive(Clone)]
pub struct LocalDatabase {
    datastore: Arc<Datastore>,
}

impl LocalDatabase {
    pub fn new(datastore: Arc<Datastore>) -> Self {
        Self { datastore }
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.datastore
    }

    fn fetch(&self, request: &BulkGetRequest) -> Result<FetchedRevision, DatastoreError> {
        let revision = self
            .datastore
            .get_revision(&request.doc_id, &request.rev_id)?;
        if revision.stub {
            return Err(DatastoreError::RevisionNotFound {
                doc_id: request.doc_id.clone(),
                rev_id: request.rev_id.clone(),
            });
        }
        let history = self
            .datastore
            .revision_history(&request.doc_id, &request.rev_id)?;

        Ok(FetchedRevision {
            doc_id: revision.doc_id,
            rev_id: revision.rev_id,
            history,
            deleted: revision.deleted,
            body: revision.body,
            attachments: revision.attachments,
        })
    }
}

#[async_trait]
impl ReplicaDatabase for LocalDatabase {
    fn identifier(&self) -> String {
        self.datastore.identifier()
    }

    async fn changes(
        &self,
        since: &Sequence,
        limit: usize,
        filter: Option<&PullFilter>,
    ) -> ReplicationResult<ChangesPage> {
        if let Some(filter) = filter {
            return Err(ReplicationError::Unsupported(format!(
                "server-side filter {} on a local datastore",
                filter.name
            )));
        }

        let since_value = if since.is_zero() {
            0
        } else {
            since.as_u64().ok_or_else(|| {
                ReplicationError::Validation(format!("foreign sequence {:?}", since.as_str()))
            })?
        };

        let entries = self.datastore.changes(since_value, limit)?;
        let last_sequence = entries
            .last()
            .map(|e| e.sequence.clone())
            .unwrap_or_else(|| since.clone());

        Ok(ChangesPage {
            entries,
            last_sequence,
        })
    }

    async fn revs_diff(
        &self,
        revs: &BTreeMap<String, Vec<String>>,
    ) -> ReplicationResult<BTreeMap<String, RevsDiffEntry>> {
        Ok(self.datastore.revs_diff(revs)?)
    }

    async fn bulk_get(&self, requests: &[BulkGetRequest]) -> ReplicationResult<Vec<FetchOutcome>> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            match self.fetch(request) {
                Ok(revision) => outcomes.push(FetchOutcome::Found(revision)),
                Err(DatastoreError::Storage(e)) => {
                    return Err(DatastoreError::Storage(e).into());
                }
                Err(e) => outcomes.push(FetchOutcome::Failed {
                    doc_id: request.doc_id.clone(),
                    rev_id: request.rev_id.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        Ok(outcomes)
    }

    async fn bulk_docs(
        &self,
        revisions: &[FetchedRevision],
    ) -> ReplicationResult<Vec<WriteOutcome>> {
        let mut outcomes = Vec::with_capacity(revisions.len());
        for revision in revisions {
            let result = self.datastore.insert_with_history(
                &revision.doc_id,
                &revision.history,
                revision.body.clone(),
                revision.deleted,
                revision.attachments.clone(),
            );
            match result {
                Ok(_) => {
                    debug!("Merged {} {}", revision.doc_id, revision.rev_id);
                    outcomes.push(WriteOutcome::stored(&revision.doc_id, &revision.rev_id));
                }
                Err(DatastoreError::Storage(e)) => {
                    return Err(ReplicationError::Merge(format!(
                        "{} {}: {}",
                        revision.doc_id, revision.rev_id, e
                    )));
                }
                Err(e) => {
                    warn!(
                        "Rejected {} {}: {}",
                        revision.doc_id, revision.rev_id, e
                    );
                    outcomes.push(WriteOutcome::rejected(
                        &revision.doc_id,
                        &revision.rev_id,
                        e.to_string(),
                    ));
                }
            }
        }
        Ok(outcomes)
    }

    async fn get_revision(
        &self,
        doc_id: &str,
        rev_id: &str,
    ) -> ReplicationResult<Option<DocumentRevision>> {
        match self.datastore.get_revision(doc_id, rev_id) {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_checkpoint(&self, replication_id: &str) -> ReplicationResult<Option<Sequence>> {
        Ok(self.datastore.read_checkpoint(replication_id)?)
    }

    async fn write_checkpoint(
        &self,
        replication_id: &str,
        sequence: &Sequence,
    ) -> ReplicationResult<()> {
        Ok(self.datastore.write_checkpoint(replication_id, sequence)?)
    }
}
