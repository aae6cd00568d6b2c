use super::config::ReplicationConfig;
use super::database::ReplicaDatabase;
use super::diff::MissingRevisions;
use super::types::{
    BulkGetRequest, FetchOutcome, FetchedRevision, ReplicationError, ReplicationResult,
};
use crate::core::rev_id;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Retries transient transport failures with a fixed delay
///
/// The failure count is consecutive across every call made through the
/// guard and resets on any success. Reaching the limit ends the run.
pub struct TransportGuard {
    max_failures: u32,
    delay: Duration,
    consecutive: AtomicU32,
    retries: AtomicU64,
}

impl TransportGuard {
    pub fn new(max_failures: u32, delay: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            delay,
            consecutive: AtomicU32::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self::new(config.max_consecutive_transport_failures, config.retry_delay())
    }

    /// Calls retried so far
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub async fn call<T, F, Fut>(&self, operation: &str, mut f: F) -> ReplicationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ReplicationResult<T>>,
    {
        loop {
            match f().await {
                Ok(value) => {
                    let failures = self.consecutive.swap(0, Ordering::Relaxed);
                    if failures > 0 {
                        debug!("{} succeeded after {} failures", operation, failures);
                    }
                    return Ok(value);
                }
                Err(ReplicationError::Transport(e)) if e.is_transient() => {
                    let failures = self.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures >= self.max_failures {
                        warn!(
                            "{} failed {} consecutive times, giving up: {}",
                            operation, failures, e
                        );
                        return Err(ReplicationError::TransportExhausted {
                            operation: operation.to_string(),
                            attempts: failures,
                            last: e,
                        });
                    }

                    warn!(
                        "{} failed ({}/{}), retrying in {:?}: {}",
                        operation, failures, self.max_failures, self.delay, e
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Result of transferring one batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Documents with at least one revision stored on the target
    pub documents_written: BTreeSet<String>,
    pub revisions_written: u64,
    /// Documents with at least one revision that failed to fetch or write
    pub documents_failed: BTreeSet<String>,
}

/// Moves missing revisions from source to target
///
/// Fetches go through `bulk_get` and writes through `bulk_docs`, both split
/// into requests of at most `max_docs_per_request` revisions; writes are also
/// capped at roughly `max_request_bytes` of JSON. Revisions of a document are
/// written ancestors first.
pub struct BatchTransfer {
    max_docs: usize,
    max_bytes: usize,
}

impl BatchTransfer {
    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            max_docs: config.max_docs_per_request.max(1),
            max_bytes: config.max_request_bytes.max(1),
        }
    }

    pub async fn transfer(
        &self,
        source: &dyn ReplicaDatabase,
        target: &dyn ReplicaDatabase,
        missing: &[MissingRevisions],
        guard: &TransportGuard,
    ) -> ReplicationResult<TransferResult> {
        let mut result = TransferResult::default();
        if missing.is_empty() {
            return Ok(result);
        }

        let requests = Self::fetch_requests(missing);
        let mut fetched = Vec::with_capacity(requests.len());

        for chunk in requests.chunks(self.max_docs) {
            let outcomes = guard.call("bulk_get", || source.bulk_get(chunk)).await?;
            for outcome in outcomes {
                match outcome {
                    FetchOutcome::Found(revision) => fetched.push(revision),
                    FetchOutcome::Failed {
                        doc_id,
                        rev_id,
                        reason,
                    } => {
                        warn!("Could not fetch {} {}: {}", doc_id, rev_id, reason);
                        result.documents_failed.insert(doc_id);
                    }
                }
            }
        }

        // Responses may come back in any order
        let rank: HashMap<&str, usize> = missing
            .iter()
            .enumerate()
            .map(|(i, m)| (m.doc_id.as_str(), i))
            .collect();
        fetched.sort_by_key(|r| {
            (
                rank.get(r.doc_id.as_str()).copied().unwrap_or(usize::MAX),
                rev_id::generation(&r.rev_id).unwrap_or(0),
            )
        });

        for chunk in self.split_writes(fetched) {
            let chunk = chunk.as_slice();
            let outcomes = guard.call("bulk_docs", || target.bulk_docs(chunk)).await?;
            for outcome in outcomes {
                if outcome.is_stored() {
                    result.revisions_written += 1;
                    result.documents_written.insert(outcome.doc_id);
                } else {
                    warn!(
                        "Target rejected {} {}: {}",
                        outcome.doc_id,
                        outcome.rev_id,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                    result.documents_failed.insert(outcome.doc_id);
                }
            }
        }

        debug!(
            "Transferred {} revisions of {} documents ({} failed)",
            result.revisions_written,
            result.documents_written.len(),
            result.documents_failed.len()
        );
        Ok(result)
    }

    fn fetch_requests(missing: &[MissingRevisions]) -> Vec<BulkGetRequest> {
        let mut requests = Vec::new();
        for doc in missing {
            let mut revs: Vec<&String> = doc.missing.iter().collect();
            revs.sort_by_key(|r| rev_id::generation(r).unwrap_or(0));
            for rev in revs {
                requests.push(BulkGetRequest {
                    doc_id: doc.doc_id.clone(),
                    rev_id: rev.clone(),
                    atts_since: doc.possible_ancestors.clone(),
                });
            }
        }
        requests
    }

    /// Group revisions into write requests bounded by count and size
    fn split_writes(&self, revisions: Vec<FetchedRevision>) -> Vec<Vec<FetchedRevision>> {
        let mut chunks = Vec::new();
        let mut current: Vec<FetchedRevision> = Vec::new();
        let mut current_bytes = 0;

        for revision in revisions {
            let size = revision.estimated_size();
            if !current.is_empty()
                && (current.len() >= self.max_docs || current_bytes + size > self.max_bytes)
            {
                chunks.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += size;
            current.push(revision);
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        chunks
    }
}
