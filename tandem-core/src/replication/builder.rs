use super::config::ReplicationConfig;
use super::database::{PullFilter, ReplicaDatabase, ReplicationFilter};
use super::local::LocalDatabase;
use super::replicator::Replicator;
use super::strategy::ReplicationPlan;
use super::types::{Direction, ReplicationError, ReplicationResult};
use crate::core::Datastore;
use crate::interceptor::{InterceptorPipeline, RequestInterceptor, ResponseInterceptor};
use std::sync::Arc;

/// Opens a remote replica with the replication's interceptor pipeline
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, interceptors: InterceptorPipeline)
    -> ReplicationResult<Arc<dyn ReplicaDatabase>>;
}

/// Two in-process datastores can replicate with each other; there is no
/// HTTP involved so interceptors are not used.
impl RemoteConnector for LocalDatabase {
    fn connect(
        &self,
        _interceptors: InterceptorPipeline,
    ) -> ReplicationResult<Arc<dyn ReplicaDatabase>> {
        Ok(Arc::new(self.clone()))
    }
}

/// Entry point for building replicators
///
/// ```ignore
/// let push = ReplicatorBuilder::push().from(datastore).to(remote).build()?;
/// let pull = ReplicatorBuilder::pull().from(remote).to(datastore).build()?;
/// ```
pub struct ReplicatorBuilder;

impl ReplicatorBuilder {
    pub fn push() -> PushReplicatorBuilder {
        PushReplicatorBuilder::default()
    }

    pub fn pull() -> PullReplicatorBuilder {
        PullReplicatorBuilder::default()
    }
}

#[derive(Default)]
struct CommonOptions {
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
    config: ReplicationConfig,
}

impl CommonOptions {
    fn validate(&self) -> ReplicationResult<()> {
        self.config
            .validate()
            .map_err(ReplicationError::InvalidConfig)
    }

    fn pipeline(&self) -> InterceptorPipeline {
        InterceptorPipeline::new(
            self.request_interceptors.clone(),
            self.response_interceptors.clone(),
        )
    }
}

/// Builder for local -> remote replication
#[derive(Default)]
pub struct PushReplicatorBuilder {
    source: Option<Arc<Datastore>>,
    target: Option<Arc<dyn RemoteConnector>>,
    filter: Option<Arc<dyn ReplicationFilter>>,
    common: CommonOptions,
}

impl PushReplicatorBuilder {
    pub fn from(mut self, datastore: Arc<Datastore>) -> Self {
        self.source = Some(datastore);
        self
    }

    pub fn to<R: RemoteConnector + 'static>(mut self, remote: R) -> Self {
        self.target = Some(Arc::new(remote));
        self
    }

    /// Only replicate documents whose winning revision passes `filter`
    pub fn filter<F: ReplicationFilter + 'static>(mut self, filter: F) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn add_request_interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = Arc<dyn RequestInterceptor>>,
    ) -> Self {
        self.common.request_interceptors.extend(interceptors);
        self
    }

    pub fn add_response_interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = Arc<dyn ResponseInterceptor>>,
    ) -> Self {
        self.common.response_interceptors.extend(interceptors);
        self
    }

    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.common.config = config;
        self
    }

    pub fn build(self) -> ReplicationResult<Replicator> {
        self.common.validate()?;
        let source = self.source.ok_or_else(|| {
            ReplicationError::InvalidConfig("push replication needs a source datastore".into())
        })?;
        let target = self.target.ok_or_else(|| {
            ReplicationError::InvalidConfig("push replication needs a target remote".into())
        })?;

        let target = target.connect(self.common.pipeline())?;
        Ok(Replicator::new(ReplicationPlan {
            source: Arc::new(LocalDatabase::new(source)),
            target,
            direction: Direction::Push,
            filter: self.filter,
            pull_filter: None,
            config: self.common.config,
        }))
    }
}

/// Builder for remote -> local replication
#[derive(Default)]
pub struct PullReplicatorBuilder {
    source: Option<Arc<dyn RemoteConnector>>,
    target: Option<Arc<Datastore>>,
    pull_filter: Option<PullFilter>,
    common: CommonOptions,
}

impl PullReplicatorBuilder {
    pub fn from<R: RemoteConnector + 'static>(mut self, remote: R) -> Self {
        self.source = Some(Arc::new(remote));
        self
    }

    pub fn to(mut self, datastore: Arc<Datastore>) -> Self {
        self.target = Some(datastore);
        self
    }

    /// Server-side filter applied to the remote change feed
    pub fn pull_filter(mut self, filter: PullFilter) -> Self {
        self.pull_filter = Some(filter);
        self
    }

    pub fn add_request_interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = Arc<dyn RequestInterceptor>>,
    ) -> Self {
        self.common.request_interceptors.extend(interceptors);
        self
    }

    pub fn add_response_interceptors(
        mut self,
        interceptors: impl IntoIterator<Item = Arc<dyn ResponseInterceptor>>,
    ) -> Self {
        self.common.response_interceptors.extend(interceptors);
        self
    }

    pub fn config(mut self, config: ReplicationConfig) -> Self {
        self.common.config = config;
        self
    }

    pub fn build(self) -> ReplicationResult<Replicator> {
        self.common.validate()?;
        let source = self.source.ok_or_else(|| {
            ReplicationError::InvalidConfig("pull replication needs a source remote".into())
        })?;
        let target = self.target.ok_or_else(|| {
            ReplicationError::InvalidConfig("pull replication needs a target datastore".into())
        })?;

        let source = source.connect(self.common.pipeline())?;
        Ok(Replicator::new(ReplicationPlan {
            source,
            target: Arc::new(LocalDatabase::new(target)),
            direction: Direction::Pull,
            filter: None,
            pull_filter: self.pull_filter,
            config: self.common.config,
        }))
    }
}
