/// Persistence collaborator contract for the revision tree store
///
/// The datastore only needs atomic reads and writes over revision rows, a
/// change index and checkpoint records. Durable engines plug in behind
/// [`LocalStore`]; [`MemoryStore`] is the reference implementation.
pub mod memory;
pub mod types;

pub use memory::MemoryStore;
pub use types::{ChangeRow, RevisionRecord, StoreError, StoreResult};

pub trait LocalStore: Send + Sync {
    /// Every stored revision row of a document (empty when unknown)
    fn read_revision_tree(&self, doc_id: &str) -> StoreResult<Vec<RevisionRecord>>;

    /// Atomically append revision rows for one document, parents first.
    ///
    /// Either every row is stored or none is. Returns the sequence assigned
    /// to each row, in order.
    fn write_revisions(&self, doc_id: &str, records: Vec<RevisionRecord>)
    -> StoreResult<Vec<u64>>;

    /// Documents changed strictly after `since`, one row per document at its
    /// latest sequence, ascending, at most `limit` rows
    fn list_changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<ChangeRow>>;

    /// Highest sequence issued so far (0 when empty)
    fn last_sequence(&self) -> StoreResult<u64>;

    /// Ids of every known document
    fn document_ids(&self) -> StoreResult<Vec<String>>;

    fn read_checkpoint(&self, replication_id: &str) -> StoreResult<Option<String>>;

    fn write_checkpoint(&self, replication_id: &str, sequence: &str) -> StoreResult<()>;
}
