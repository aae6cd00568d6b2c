use super::database::{PullFilter, ReplicaDatabase};
use super::transfer::TransportGuard;
use super::types::ReplicationResult;
use crate::core::types::{ChangeEntry, Sequence};
use std::sync::Arc;
use tracing::debug;

/// A bounded slice of a change feed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub entries: Vec<ChangeEntry>,
    /// Sequence to checkpoint once every entry is merged
    pub last_sequence: Sequence,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Reads a source's change feed in bounded batches
pub struct ChangeFeedCursor {
    source: Arc<dyn ReplicaDatabase>,
    since: Sequence,
    limit: usize,
    filter: Option<PullFilter>,
}

impl ChangeFeedCursor {
    /// Start after `since`; `Sequence::zero()` reads from the beginning
    pub fn new(
        source: Arc<dyn ReplicaDatabase>,
        since: Sequence,
        limit: usize,
        filter: Option<PullFilter>,
    ) -> Self {
        Self {
            source,
            since,
            limit: limit.max(1),
            filter,
        }
    }

    /// Position the next batch starts after
    pub fn position(&self) -> &Sequence {
        &self.since
    }

    /// Fetch the next batch; empty once the feed is exhausted
    pub async fn next_batch(&mut self, guard: &TransportGuard) -> ReplicationResult<ChangeBatch> {
        let source = &self.source;
        let since = &self.since;
        let limit = self.limit;
        let filter = self.filter.as_ref();

        let page = guard
            .call("changes", || source.changes(since, limit, filter))
            .await?;

        debug!(
            "Change feed of {} since {}: {} entries, last {}",
            self.source.identifier(),
            self.since,
            page.entries.len(),
            page.last_sequence
        );

        self.since = page.last_sequence.clone();
        Ok(ChangeBatch {
            entries: page.entries,
            last_sequence: page.last_sequence,
        })
    }
}
