/// Replication module - CouchDB-style push/pull replication
///
/// A run reads the source's change feed in batches, asks the target which
/// leaf revisions it lacks, copies those with their ancestry and checkpoints
/// the batch on the target:
///
/// ```text
/// changes -> [push filter] -> revs_diff -> bulk_get -> bulk_docs -> checkpoint
/// ```
///
/// The target merges every revision through the same revision-tree insert
/// path as local edits, so both replicas converge on the same winner.
pub mod builder;
pub mod changes;
pub mod config;
pub mod database;
pub mod diff;
pub mod events;
pub mod local;
pub mod replicator;
pub mod strategy;
pub mod transfer;
pub mod types;

pub use builder::{PullReplicatorBuilder, PushReplicatorBuilder, RemoteConnector, ReplicatorBuilder};
pub use changes::{ChangeBatch, ChangeFeedCursor};
pub use config::ReplicationConfig;
pub use database::{ChangesPage, PullFilter, ReplicaDatabase, ReplicationFilter};
pub use diff::{DiffNegotiator, MissingRevisions};
pub use events::{EventBus, EventStream, ReplicationEvent, ReplicationListener, ReplicationSummary};
pub use local::LocalDatabase;
pub use replicator::Replicator;
pub use strategy::{ReplicationPlan, ReplicationStrategy, RunOutcome, SessionState};
pub use transfer::{BatchTransfer, TransferResult, TransportGuard};
pub use types::{
    BulkGetRequest, Direction, FetchOutcome, FetchedRevision, ReplicationError,
    ReplicationResult, ReplicationStats, ReplicatorState, TransportError, WriteOutcome,
};
