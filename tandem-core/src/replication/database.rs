use super::types::{BulkGetRequest, FetchOutcome, FetchedRevision, ReplicationResult, WriteOutcome};
use crate::core::types::{ChangeEntry, DocumentRevision, RevsDiffEntry, Sequence};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One page of a replica's change feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesPage {
    pub entries: Vec<ChangeEntry>,
    /// Position to resume from after this page
    pub last_sequence: Sequence,
}

/// Server-side filter applied to a source's change feed (pull only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullFilter {
    /// `<design doc>/<filter>` name
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl PullFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Canonical text identifying the filter and its parameters
    pub fn identity(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}?{}", self.name, params.join("&"))
    }
}

/// Push filter: decides whether a document's winning revision is replicated
pub trait ReplicationFilter: Send + Sync {
    fn accept(&self, revision: &DocumentRevision) -> bool;
}

impl<F> ReplicationFilter for F
where
    F: Fn(&DocumentRevision) -> bool + Send + Sync,
{
    fn accept(&self, revision: &DocumentRevision) -> bool {
        self(revision)
    }
}

/// One side of a replication
///
/// Transport failures surface as [`super::ReplicationError::Transport`];
/// rejections of individual revisions are reported per revision and never
/// fail the whole call.
#[async_trait]
pub trait ReplicaDatabase: Send + Sync {
    /// Stable identifier, part of the replication id
    fn identifier(&self) -> String;

    /// Changes strictly after `since`, at most `limit`
    async fn changes(
        &self,
        since: &Sequence,
        limit: usize,
        filter: Option<&PullFilter>,
    ) -> ReplicationResult<ChangesPage>;

    /// Which of the given revisions this replica is missing
    async fn revs_diff(
        &self,
        revs: &BTreeMap<String, Vec<String>>,
    ) -> ReplicationResult<BTreeMap<String, RevsDiffEntry>>;

    /// Fetch revisions with their full history
    async fn bulk_get(&self, requests: &[BulkGetRequest]) -> ReplicationResult<Vec<FetchOutcome>>;

    /// Merge revisions with their histories, without winner checks
    async fn bulk_docs(
        &self,
        revisions: &[FetchedRevision],
    ) -> ReplicationResult<Vec<WriteOutcome>>;

    async fn get_revision(
        &self,
        doc_id: &str,
        rev_id: &str,
    ) -> ReplicationResult<Option<DocumentRevision>>;

    async fn read_checkpoint(&self, replication_id: &str) -> ReplicationResult<Option<Sequence>>;

    async fn write_checkpoint(
        &self,
        replication_id: &str,
        sequence: &Sequence,
    ) -> ReplicationResult<()>;
}
