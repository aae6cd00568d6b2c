pub mod datastore;
pub mod error;
pub mod rev_id;
pub mod tree;
pub mod types;
pub mod winner;

pub use datastore::Datastore;
pub use error::DatastoreError;
pub use tree::RevisionTree;
pub use types::{
    AttachmentInfo, Attachments, ChangeEntry, DocumentBody, DocumentChange, DocumentObserver,
    DocumentRevision, RevsDiffEntry, Sequence,
};
