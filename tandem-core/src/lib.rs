pub mod config;
pub mod core;
pub mod interceptor;
pub mod logging;
pub mod persistence;
pub mod replication;

// Re-export commonly used types
pub use config::{DatastoreSettings, LoggingConfig, TandemConfig};
pub use core::{
    AttachmentInfo, Attachments, ChangeEntry, Datastore, DatastoreError, DocumentBody,
    DocumentChange, DocumentObserver, DocumentRevision, RevisionTree, RevsDiffEntry, Sequence,
};
pub use interceptor::{
    BasicAuthInterceptor, CookieInterceptor, HeaderInterceptor, HttpRequest, HttpResponse,
    HttpTransport, InterceptorPipeline, RequestContext, RequestInterceptor, ResponseContext,
    ResponseInterceptor,
};
pub use logging::init_logging;
pub use persistence::{LocalStore, MemoryStore, StoreError};
pub use replication::{
    Direction, LocalDatabase, PullFilter, RemoteConnector, ReplicaDatabase, ReplicationConfig,
    ReplicationError, ReplicationEvent, ReplicationFilter, ReplicationListener,
    ReplicationStats, Replicator, ReplicatorBuilder, ReplicatorState, TransportError,
};
