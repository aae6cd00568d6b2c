//! CouchDB database as a replication peer

use crate::protocol::{
    BulkDocsBody, BulkDocsRow, BulkGetBody, BulkGetDoc, BulkGetResponse, ChangesResponse,
    CheckpointDoc, DatabaseInfo, doc_to_fetched, doc_to_revision, revision_to_doc,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tandem_core::core::types::RevsDiffEntry;
use tandem_core::replication::{
    BulkGetRequest, ChangesPage, FetchOutcome, FetchedRevision, ReplicationResult, WriteOutcome,
};
use tandem_core::{
    ChangeEntry, DocumentRevision, HttpRequest, HttpResponse, HttpTransport, InterceptorPipeline,
    PullFilter, ReplicaDatabase, ReplicationError, Sequence, TransportError,
};
use tandem_core::interceptor::{HeaderValue, StatusCode, header};
use tracing::{debug, warn};
use url::Url;

const LOCAL_PREFIX: &str = "_local";

/// Remote CouchDB-compatible database
///
/// Every call goes through the interceptor pipeline, so authentication and
/// custom headers apply to feed reads, diffs, fetches, writes and checkpoint
/// traffic alike.
#[derive(Clone)]
pub struct CouchDatabase {
    url: Url,
    identifier: String,
    transport: Arc<dyn HttpTransport>,
    pipeline: InterceptorPipeline,
}

impl CouchDatabase {
    /// `url` is the database URL, without credentials
    pub fn new(
        url: Url,
        identifier: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        pipeline: InterceptorPipeline,
    ) -> Self {
        Self {
            url,
            identifier: identifier.into(),
            transport,
            pipeline,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Database metadata (`GET /db`)
    pub async fn database_info(&self) -> ReplicationResult<DatabaseInfo> {
        let response = self.execute(HttpRequest::get(self.url.clone())).await?;
        Ok(Self::success(response)?.json()?)
    }

    /// Create the database; an existing one is not an error
    pub async fn create_database(&self) -> ReplicationResult<()> {
        let response = self
            .execute(HttpRequest::put(self.url.clone()))
            .await?;
        if response.status == StatusCode::PRECONDITION_FAILED {
            debug!("Database {} already exists", self.identifier);
            return Ok(());
        }
        Self::success(response)?;
        Ok(())
    }

    /// URL of `segments` below the database
    fn endpoint(&self, segments: &[&str]) -> ReplicationResult<Url> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ReplicationError::InvalidConfig(format!("{} cannot be a base URL", self.url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Path segments addressing a document; design and local documents keep
    /// their prefix as a separate segment
    fn document_segments(doc_id: &str) -> Vec<&str> {
        for prefix in ["_design/", "_local/"] {
            if let Some(name) = doc_id.strip_prefix(prefix) {
                return vec![&prefix[..prefix.len() - 1], name];
            }
        }
        vec![doc_id]
    }

    async fn execute(&self, request: HttpRequest) -> ReplicationResult<HttpResponse> {
        Ok(self
            .pipeline
            .execute(self.transport.as_ref(), request)
            .await?)
    }

    fn success(response: HttpResponse) -> ReplicationResult<HttpResponse> {
        Ok(response.error_for_status()?)
    }

    async fn post_json<B, T>(&self, url: Url, body: &B) -> ReplicationResult<T>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = HttpRequest::post(url)
            .with_header(header::ACCEPT, HeaderValue::from_static("application/json"))
            .with_json(body)?;
        let response = Self::success(self.execute(request).await?)?;
        Ok(response.json()?)
    }

    fn checkpoint_url(&self, replication_id: &str) -> ReplicationResult<Url> {
        self.endpoint(&[LOCAL_PREFIX, replication_id])
    }

    async fn fetch_checkpoint(
        &self,
        replication_id: &str,
    ) -> ReplicationResult<Option<CheckpointDoc>> {
        let url = self.checkpoint_url(replication_id)?;
        let response = self.execute(HttpRequest::get(url)).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::success(response)?.json()?))
    }
}

#[async_trait]
impl ReplicaDatabase for CouchDatabase {
    fn identifier(&self) -> String {
        self.identifier.clone()
    }

    async fn changes(
        &self,
        since: &Sequence,
        limit: usize,
        filter: Option<&PullFilter>,
    ) -> ReplicationResult<ChangesPage> {
        let mut url = self.endpoint(&["_changes"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("style", "all_docs")
                .append_pair("since", since.as_str())
                .append_pair("limit", &limit.to_string());
            if let Some(filter) = filter {
                query.append_pair("filter", &filter.name);
                for (key, value) in &filter.parameters {
                    query.append_pair(key, value);
                }
            }
        }

        let response = Self::success(self.execute(HttpRequest::get(url)).await?)?;
        let feed: ChangesResponse = response.json()?;

        let entries = feed
            .results
            .into_iter()
            .filter_map(|row| {
                let leaf_revs: Vec<String> = row.changes.into_iter().map(|c| c.rev).collect();
                let rev_id = leaf_revs.first()?.clone();
                Some(ChangeEntry {
                    sequence: row.seq,
                    doc_id: row.id,
                    rev_id,
                    deleted: row.deleted,
                    leaf_revs,
                })
            })
            .collect();

        Ok(ChangesPage {
            entries,
            last_sequence: feed.last_seq,
        })
    }

    async fn revs_diff(
        &self,
        revs: &BTreeMap<String, Vec<String>>,
    ) -> ReplicationResult<BTreeMap<String, RevsDiffEntry>> {
        if revs.is_empty() {
            return Ok(BTreeMap::new());
        }
        let url = self.endpoint(&["_revs_diff"])?;
        self.post_json(url, revs).await
    }

    async fn bulk_get(&self, requests: &[BulkGetRequest]) -> ReplicationResult<Vec<FetchOutcome>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let mut url = self.endpoint(&["_bulk_get"])?;
        url.query_pairs_mut()
            .append_pair("revs", "true")
            .append_pair("attachments", "false");

        let response: BulkGetResponse = self.post_json(url, &BulkGetBody::new(requests)).await?;

        let mut found: HashMap<(String, String), FetchOutcome> = HashMap::new();
        for result in response.results {
            for doc in result.docs {
                match doc {
                    BulkGetDoc::Ok(doc) => match doc_to_fetched(doc) {
                        Ok(revision) => {
                            let key = (revision.doc_id.clone(), revision.rev_id.clone());
                            found.insert(key, FetchOutcome::Found(revision));
                        }
                        Err(reason) => {
                            warn!("Unusable document in _bulk_get of {}: {}", result.id, reason);
                        }
                    },
                    BulkGetDoc::Error(error) => {
                        let doc_id = error.id.clone().unwrap_or_else(|| result.id.clone());
                        let rev_id = error.rev.clone().unwrap_or_default();
                        found.insert(
                            (doc_id.clone(), rev_id.clone()),
                            FetchOutcome::Failed {
                                doc_id,
                                rev_id,
                                reason: error.describe(),
                            },
                        );
                    }
                }
            }
        }

        Ok(requests
            .iter()
            .map(|request| {
                found
                    .remove(&(request.doc_id.clone(), request.rev_id.clone()))
                    .unwrap_or_else(|| FetchOutcome::Failed {
                        doc_id: request.doc_id.clone(),
                        rev_id: request.rev_id.clone(),
                        reason: "missing from _bulk_get response".to_string(),
                    })
            })
            .collect())
    }

    async fn bulk_docs(
        &self,
        revisions: &[FetchedRevision],
    ) -> ReplicationResult<Vec<WriteOutcome>> {
        if revisions.is_empty() {
            return Ok(Vec::new());
        }
        let docs = revisions
            .iter()
            .map(revision_to_doc)
            .collect::<Result<Vec<Map<String, Value>>, _>>()?;
        let url = self.endpoint(&["_bulk_docs"])?;
        let rows: Vec<BulkDocsRow> = self
            .post_json(
                url,
                &BulkDocsBody {
                    docs,
                    new_edits: false,
                },
            )
            .await?;

        let mut errors: HashMap<(String, Option<String>), String> = HashMap::new();
        for row in rows {
            if let Some(error) = row.error {
                let reason = match row.reason {
                    Some(reason) => format!("{}: {}", error, reason),
                    None => error,
                };
                errors.insert((row.id, row.rev), reason);
            }
        }

        Ok(revisions
            .iter()
            .map(|revision| {
                let exact = (revision.doc_id.clone(), Some(revision.rev_id.clone()));
                let any = (revision.doc_id.clone(), None);
                match errors.get(&exact).or_else(|| errors.get(&any)) {
                    Some(reason) => {
                        WriteOutcome::rejected(&revision.doc_id, &revision.rev_id, reason.clone())
                    }
                    None => WriteOutcome::stored(&revision.doc_id, &revision.rev_id),
                }
            })
            .collect())
    }

    async fn get_revision(
        &self,
        doc_id: &str,
        rev_id: &str,
    ) -> ReplicationResult<Option<DocumentRevision>> {
        let mut url = self.endpoint(&Self::document_segments(doc_id))?;
        url.query_pairs_mut()
            .append_pair("rev", rev_id)
            .append_pair("revs", "true");

        let response = self.execute(HttpRequest::get(url)).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let doc: Map<String, Value> = Self::success(response)?.json()?;
        doc_to_revision(doc)
            .map(Some)
            .map_err(|reason| TransportError::InvalidResponse(reason).into())
    }

    async fn read_checkpoint(&self, replication_id: &str) -> ReplicationResult<Option<Sequence>> {
        Ok(self
            .fetch_checkpoint(replication_id)
            .await?
            .map(|doc| doc.last_sequence))
    }

    async fn write_checkpoint(
        &self,
        replication_id: &str,
        sequence: &Sequence,
    ) -> ReplicationResult<()> {
        let existing = self.fetch_checkpoint(replication_id).await?;
        let doc = CheckpointDoc {
            id: format!("{}/{}", LOCAL_PREFIX, replication_id),
            rev: existing.and_then(|doc| doc.rev),
            last_sequence: sequence.clone(),
        };

        let request = HttpRequest::put(self.checkpoint_url(replication_id)?).with_json(&doc)?;
        Self::success(self.execute(request).await?)?;
        debug!(
            "Checkpoint {} on {} set to {}",
            replication_id, self.identifier, sequence
        );
        Ok(())
    }
}
