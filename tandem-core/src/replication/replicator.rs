use super::events::{
    EventBus, EventStream, ReplicationEvent, ReplicationListener, ReplicationSummary,
};
use super::strategy::{ReplicationPlan, ReplicationStrategy, RunOutcome, SessionState};
use super::types::{Direction, ReplicationError, ReplicationResult, ReplicatorState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Supervisable replication between a local datastore and a remote
///
/// ```text
/// Pending --start--> Started --complete--> Complete
///                    Started --error-----> Error
///                    Started --stop------> Stopping --observed--> Stopped
/// ```
///
/// A replicator is reusable: starting it again after a terminal state runs a
/// fresh session with zeroed counters, resuming from the stored checkpoint.
/// Cloning yields another handle to the same replicator.
#[derive(Clone)]
pub struct Replicator {
    inner: Arc<ReplicatorInner>,
}

struct ReplicatorInner {
    plan: ReplicationPlan,
    replication_id: String,
    state: watch::Sender<ReplicatorState>,
    /// Current session; the lock also orders state transitions with the
    /// events that announce them
    session: Mutex<Option<Arc<SessionState>>>,
    events: EventBus,
}

impl Replicator {
    pub(crate) fn new(plan: ReplicationPlan) -> Self {
        let replication_id = plan.replication_id();
        let (state, _) = watch::channel(ReplicatorState::Pending);

        Self {
            inner: Arc::new(ReplicatorInner {
                plan,
                replication_id,
                state,
                session: Mutex::new(None),
                events: EventBus::new(),
            }),
        }
    }

    pub fn state(&self) -> ReplicatorState {
        *self.inner.state.borrow()
    }

    pub fn direction(&self) -> Direction {
        self.inner.plan.direction
    }

    pub fn replication_id(&self) -> &str {
        &self.inner.replication_id
    }

    /// Documents written by the current (or last) run
    pub fn document_counter(&self) -> u64 {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(0, |s| s.document_counter())
    }

    /// Batches processed by the current (or last) run
    pub fn batch_counter(&self) -> u64 {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(0, |s| s.batch_counter())
    }

    pub fn add_listener(&self, listener: Arc<dyn ReplicationListener>) {
        self.inner.events.add_listener(listener);
    }

    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Start a run on the current tokio runtime
    pub fn start(&self) -> ReplicationResult<()> {
        let handle = Handle::try_current().map_err(|_| ReplicationError::NoRuntime)?;
        let inner = &self.inner;

        let mut slot = inner.session.lock();
        let current = *inner.state.borrow();
        if current.is_active() {
            return Err(ReplicationError::AlreadyRunning);
        }

        let session = Arc::new(SessionState::new());
        let strategy = ReplicationStrategy::new(inner.plan.clone(), Arc::clone(&session));
        *slot = Some(Arc::clone(&session));

        let started_at = Utc::now();
        inner.state.send_replace(ReplicatorState::Started);
        inner.events.publish(ReplicationEvent::Started(Self::summary(
            inner,
            &session,
            ReplicatorState::Started,
            started_at,
            None,
        )));
        drop(slot);

        info!(
            "Replicator {} started ({})",
            inner.replication_id, inner.plan.direction
        );
        handle.spawn(Self::run_session(
            Arc::clone(inner),
            strategy,
            session,
            started_at,
        ));
        Ok(())
    }

    /// Request a stop. Pending goes straight to Stopped; a running session
    /// finishes its current batch first.
    pub fn stop(&self) {
        let slot = self.inner.session.lock();
        let current = *self.inner.state.borrow();
        match current {
            ReplicatorState::Pending => {
                self.inner.state.send_replace(ReplicatorState::Stopped);
            }
            ReplicatorState::Started => {
                if let Some(session) = slot.as_ref() {
                    session.request_stop();
                }
                self.inner.state.send_replace(ReplicatorState::Stopping);
                info!("Replicator {} stopping", self.inner.replication_id);
            }
            _ => {}
        }
    }

    /// Wait until the replicator reaches a terminal state
    pub async fn wait_for_terminal(&self) -> ReplicatorState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    async fn run_session(
        inner: Arc<ReplicatorInner>,
        strategy: ReplicationStrategy,
        session: Arc<SessionState>,
        started_at: DateTime<Utc>,
    ) {
        let result = strategy.run().await;

        let _slot = inner.session.lock();
        let finished_at = Some(Utc::now());
        let event = match result {
            Ok(RunOutcome::Complete) => {
                inner.state.send_replace(ReplicatorState::Complete);
                info!(
                    "Replicator {} complete: {} documents",
                    inner.replication_id,
                    session.document_counter()
                );
                ReplicationEvent::Completed(Self::summary(
                    &inner,
                    &session,
                    ReplicatorState::Complete,
                    started_at,
                    finished_at,
                ))
            }
            Ok(RunOutcome::Stopped) => {
                inner.state.send_replace(ReplicatorState::Stopped);
                info!("Replicator {} stopped", inner.replication_id);
                ReplicationEvent::Stopped(Self::summary(
                    &inner,
                    &session,
                    ReplicatorState::Stopped,
                    started_at,
                    finished_at,
                ))
            }
            Err(e) => {
                inner.state.send_replace(ReplicatorState::Error);
                match &e {
                    ReplicationError::TransportExhausted { .. } => {
                        warn!("Replicator {} failed: {}", inner.replication_id, e)
                    }
                    _ => error!("Replicator {} failed: {}", inner.replication_id, e),
                }
                ReplicationEvent::Errored {
                    summary: Self::summary(
                        &inner,
                        &session,
                        ReplicatorState::Error,
                        started_at,
                        finished_at,
                    ),
                    cause: Arc::new(e),
                }
            }
        };
        inner.events.publish(event);
    }

    fn summary(
        inner: &ReplicatorInner,
        session: &SessionState,
        state: ReplicatorState,
        started_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
    ) -> ReplicationSummary {
        ReplicationSummary {
            replication_id: inner.replication_id.clone(),
            direction: inner.plan.direction,
            state,
            document_counter: session.document_counter(),
            batch_counter: session.batch_counter(),
            stats: session.stats(),
            started_at,
            finished_at,
        }
    }
}
