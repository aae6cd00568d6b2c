use super::changes::ChangeFeedCursor;
use super::config::ReplicationConfig;
use super::database::{PullFilter, ReplicaDatabase, ReplicationFilter};
use super::diff::DiffNegotiator;
use super::transfer::{BatchTransfer, TransferResult, TransportGuard};
use super::types::{Direction, ReplicationResult, ReplicationStats};
use crate::core::types::{ChangeEntry, Sequence};
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

/// Everything that defines a replication, fixed at build time
#[derive(Clone)]
pub struct ReplicationPlan {
    pub source: Arc<dyn ReplicaDatabase>,
    pub target: Arc<dyn ReplicaDatabase>,
    pub direction: Direction,
    /// Push filter evaluated against the source's winning revision
    pub filter: Option<Arc<dyn ReplicationFilter>>,
    /// Server-side filter forwarded to the source's change feed
    pub pull_filter: Option<PullFilter>,
    pub config: ReplicationConfig,
}

impl ReplicationPlan {
    /// Stable id keying the checkpoint on the target
    ///
    /// Push filters are not part of the id: a push with a different filter
    /// resumes from the same checkpoint.
    pub fn replication_id(&self) -> String {
        let identity = json!({
            "source": self.source.identifier(),
            "target": self.target.identifier(),
            "direction": self.direction,
            "filter": self.pull_filter.as_ref().map(PullFilter::identity),
        });
        hex::encode(Sha256::digest(identity.to_string().as_bytes()))
    }
}

/// Counters and flags of one run, shared with the replicator
#[derive(Default)]
pub struct SessionState {
    document_counter: AtomicU64,
    batch_counter: AtomicU64,
    stop_requested: AtomicBool,
    stats: Mutex<ReplicationStats>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_counter(&self) -> u64 {
        self.document_counter.load(Ordering::SeqCst)
    }

    pub fn batch_counter(&self) -> u64 {
        self.batch_counter.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats.lock().clone()
    }

    fn record_batch(&self, result: &TransferResult, filtered: u64, checkpoint: &Sequence) {
        let documents = result.documents_written.len() as u64;
        self.document_counter.fetch_add(documents, Ordering::SeqCst);
        self.batch_counter.fetch_add(1, Ordering::SeqCst);

        let mut stats = self.stats.lock();
        stats.batches += 1;
        stats.documents_written += documents;
        stats.revisions_written += result.revisions_written;
        stats.documents_filtered += filtered;
        stats.documents_failed += result.documents_failed.len() as u64;
        stats.last_sequence = Some(checkpoint.clone());
    }
}

/// How a run ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Complete,
    Stopped,
}

/// One replication run
///
/// Loops over change batches: filter, diff, transfer, then checkpoint. The
/// checkpoint of a batch is written only after every revision of the batch
/// was accepted or rejected by the target, so an interrupted run re-processes
/// at most one batch. Stop requests are honoured between batches.
pub struct ReplicationStrategy {
    plan: ReplicationPlan,
    replication_id: String,
    session: Arc<SessionState>,
}

impl ReplicationStrategy {
    pub fn new(plan: ReplicationPlan, session: Arc<SessionState>) -> Self {
        let replication_id = plan.replication_id();
        Self {
            plan,
            replication_id,
            session,
        }
    }

    pub fn replication_id(&self) -> &str {
        &self.replication_id
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    pub async fn run(&self) -> ReplicationResult<RunOutcome> {
        let guard = TransportGuard::from_config(&self.plan.config);
        let result = self.replicate(&guard).await;
        self.session.stats.lock().transport_retries = guard.retries();
        result
    }

    async fn replicate(&self, guard: &TransportGuard) -> ReplicationResult<RunOutcome> {
        let id = self.replication_id.as_str();
        let source = self.plan.source.as_ref();
        let target = self.plan.target.as_ref();

        let mut checkpoint = guard
            .call("read_checkpoint", || target.read_checkpoint(id))
            .await?
            .unwrap_or_else(Sequence::zero);
        self.session.stats.lock().last_sequence = Some(checkpoint.clone());

        info!(
            "Replication {} ({} {} -> {}) starting after sequence {}",
            id,
            self.plan.direction,
            source.identifier(),
            target.identifier(),
            checkpoint
        );

        let mut cursor = ChangeFeedCursor::new(
            Arc::clone(&self.plan.source),
            checkpoint.clone(),
            self.plan.config.changes_limit,
            self.plan.pull_filter.clone(),
        );
        let negotiator = DiffNegotiator::new();
        let transfer = BatchTransfer::new(&self.plan.config);

        loop {
            if self.session.is_stop_requested() {
                info!("Replication {} stopped at sequence {}", id, checkpoint);
                return Ok(RunOutcome::Stopped);
            }

            let batch = cursor.next_batch(guard).await?;
            if batch.is_empty() {
                if batch.last_sequence != checkpoint {
                    let last = &batch.last_sequence;
                    guard
                        .call("write_checkpoint", || target.write_checkpoint(id, last))
                        .await?;
                    self.session.stats.lock().last_sequence = Some(last.clone());
                    checkpoint = batch.last_sequence;
                }
                info!(
                    "Replication {} complete at sequence {}: {} documents in {} batches",
                    id,
                    checkpoint,
                    self.session.document_counter(),
                    self.session.batch_counter()
                );
                return Ok(RunOutcome::Complete);
            }

            let (candidates, filtered) = self.apply_filter(&batch.entries, guard).await?;
            let missing = negotiator.negotiate(target, &candidates, guard).await?;
            let result = transfer.transfer(source, target, &missing, guard).await?;

            let last = &batch.last_sequence;
            guard
                .call("write_checkpoint", || target.write_checkpoint(id, last))
                .await?;
            self.session.record_batch(&result, filtered, last);

            debug!(
                "Batch {} of {}: {} changes, {} filtered, {} documents written, checkpoint {}",
                self.session.batch_counter(),
                id,
                batch.len(),
                filtered,
                result.documents_written.len(),
                last
            );
            checkpoint = batch.last_sequence;
        }
    }

    /// Drop changes whose winning revision the push filter rejects
    async fn apply_filter(
        &self,
        entries: &[ChangeEntry],
        guard: &TransportGuard,
    ) -> ReplicationResult<(Vec<ChangeEntry>, u64)> {
        let Some(filter) = &self.plan.filter else {
            return Ok((entries.to_vec(), 0));
        };

        let source = self.plan.source.as_ref();
        let mut accepted = Vec::with_capacity(entries.len());
        let mut filtered = 0;

        for entry in entries {
            let revision = guard
                .call("get_revision", || {
                    source.get_revision(&entry.doc_id, &entry.rev_id)
                })
                .await?;
            match revision {
                Some(revision) if !filter.accept(&revision) => filtered += 1,
                _ => accepted.push(entry.clone()),
            }
        }

        Ok((accepted, filtered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Datastore;
    use crate::core::types::{Attachments, DocumentRevision};
    use crate::replication::local::LocalDatabase;
    use serde_json::json;

    fn plan(source: &Arc<Datastore>, target: &Arc<Datastore>) -> ReplicationPlan {
        ReplicationPlan {
            source: Arc::new(LocalDatabase::new(Arc::clone(source))),
            target: Arc::new(LocalDatabase::new(Arc::clone(target))),
            direction: Direction::Push,
            filter: None,
            pull_filter: None,
            config: ReplicationConfig::default().with_changes_limit(2),
        }
    }

    fn populate(datastore: &Datastore, count: usize) {
        for i in 0..count {
            let body = json!({ "index": i }).as_object().cloned().unwrap();
            datastore
                .create_document(Some(&format!("doc{}", i)), body, Attachments::new())
                .unwrap();
        }
    }

    #[test]
    fn test_replication_id_ignores_push_filter() {
        let source = Arc::new(Datastore::in_memory("a"));
        let target = Arc::new(Datastore::in_memory("b"));

        let unfiltered = plan(&source, &target);
        let mut filtered = plan(&source, &target);
        filtered.filter = Some(Arc::new(|_: &DocumentRevision| false));
        assert_eq!(unfiltered.replication_id(), filtered.replication_id());

        let mut pull = plan(&source, &target);
        pull.direction = Direction::Pull;
        assert_ne!(unfiltered.replication_id(), pull.replication_id());

        let mut pull_filtered = pull.clone();
        pull_filtered.pull_filter = Some(PullFilter::new("app/owner"));
        assert_ne!(pull.replication_id(), pull_filtered.replication_id());
    }

    #[tokio::test]
    async fn test_run_transfers_in_batches() {
        let source = Arc::new(Datastore::in_memory("a"));
        let target = Arc::new(Datastore::in_memory("b"));
        populate(&source, 5);

        let session = Arc::new(SessionState::new());
        let strategy = ReplicationStrategy::new(plan(&source, &target), session.clone());
        let outcome = strategy.run().await.unwrap();

        assert_eq!(outcome, RunOutcome::Complete);
        assert_eq!(session.document_counter(), 5);
        assert_eq!(session.batch_counter(), 3);
        assert_eq!(target.document_count().unwrap(), 5);
        assert_eq!(
            target.read_checkpoint(strategy.replication_id()).unwrap(),
            Some(Sequence::from(5))
        );

        let stats = session.stats();
        assert_eq!(stats.revisions_written, 5);
        assert_eq!(stats.last_sequence, Some(Sequence::from(5)));
    }

    #[tokio::test]
    async fn test_second_run_transfers_nothing() {
        let source = Arc::new(Datastore::in_memory("a"));
        let target = Arc::new(Datastore::in_memory("b"));
        populate(&source, 3);

        ReplicationStrategy::new(plan(&source, &target), Arc::new(SessionState::new()))
            .run()
            .await
            .unwrap();

        let session = Arc::new(SessionState::new());
        ReplicationStrategy::new(plan(&source, &target), session.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(session.document_counter(), 0);
        assert_eq!(session.batch_counter(), 0);
    }

    #[tokio::test]
    async fn test_filter_skips_documents_but_advances_checkpoint() {
        let source = Arc::new(Datastore::in_memory("a"));
        let target = Arc::new(Datastore::in_memory("b"));
        populate(&source, 4);

        let mut plan = plan(&source, &target);
        plan.filter = Some(Arc::new(|rev: &DocumentRevision| {
            rev.field("index").and_then(|v| v.as_u64()) == Some(1)
        }));
        let session = Arc::new(SessionState::new());
        let strategy = ReplicationStrategy::new(plan, session.clone());
        strategy.run().await.unwrap();

        assert_eq!(session.document_counter(), 1);
        assert_eq!(session.stats().documents_filtered, 3);
        assert_eq!(target.all_document_ids().unwrap(), vec!["doc1".to_string()]);
        assert_eq!(
            target.read_checkpoint(strategy.replication_id()).unwrap(),
            Some(Sequence::from(4))
        );
    }

    #[tokio::test]
    async fn test_stop_before_first_batch() {
        let source = Arc::new(Datastore::in_memory("a"));
        let target = Arc::new(Datastore::in_memory("b"));
        populate(&source, 2);

        let session = Arc::new(SessionState::new());
        session.request_stop();
        let outcome = ReplicationStrategy::new(plan(&source, &target), session.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(target.document_count().unwrap(), 0);
        assert!(target.load_tree("doc0").unwrap().is_none());
    }
}
