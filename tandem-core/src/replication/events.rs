use super::types::{Direction, ReplicationError, ReplicationStats, ReplicatorState};
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tracing::debug;

/// Snapshot of a run attached to every event
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationSummary {
    pub replication_id: String,
    pub direction: Direction,
    pub state: ReplicatorState,
    pub document_counter: u64,
    pub batch_counter: u64,
    pub stats: ReplicationStats,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lifecycle notification of a replicator
///
/// Every run emits one `Started` followed by exactly one terminal event.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    Started(ReplicationSummary),
    Completed(ReplicationSummary),
    Stopped(ReplicationSummary),
    Errored {
        summary: ReplicationSummary,
        cause: Arc<ReplicationError>,
    },
}

impl ReplicationEvent {
    pub fn summary(&self) -> &ReplicationSummary {
        match self {
            ReplicationEvent::Started(summary)
            | ReplicationEvent::Completed(summary)
            | ReplicationEvent::Stopped(summary)
            | ReplicationEvent::Errored { summary, .. } => summary,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplicationEvent::Started(_))
    }
}

/// Receives replicator events on the notification task
pub trait ReplicationListener: Send + Sync {
    fn on_event(&self, event: &ReplicationEvent);
}

impl<F> ReplicationListener for F
where
    F: Fn(&ReplicationEvent) + Send + Sync,
{
    fn on_event(&self, event: &ReplicationEvent) {
        self(event)
    }
}

type Listeners = Arc<RwLock<Vec<Arc<dyn ReplicationListener>>>>;
type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<ReplicationEvent>>>>;

/// Fans replicator events out to listeners and subscribers
///
/// Publishing only enqueues; a dispatcher task on the publisher's runtime
/// delivers events in publish order. A dispatcher that died with its runtime
/// is replaced on the next publish, so a replicator restarted from another
/// runtime keeps delivering. Listeners see an event before any subscriber
/// stream does.
pub struct EventBus {
    dispatcher: Mutex<Option<mpsc::UnboundedSender<ReplicationEvent>>>,
    listeners: Listeners,
    subscribers: Subscribers,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            dispatcher: Mutex::new(None),
            listeners: Arc::new(RwLock::new(Vec::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ReplicationListener>) {
        self.listeners.write().push(listener);
    }

    /// Stream of every event published from now on
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventStream { rx }
    }

    /// Enqueue an event
    ///
    /// Outside a tokio runtime the event is delivered on the calling thread.
    pub fn publish(&self, event: ReplicationEvent) {
        let mut dispatcher = self.dispatcher.lock();
        let event = match dispatcher.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(SendError(event)) => {
                    debug!("Event dispatcher is gone, starting a new one");
                    event
                }
            },
            None => event,
        };

        let Ok(handle) = Handle::try_current() else {
            *dispatcher = None;
            Self::deliver(&self.listeners, &self.subscribers, &event);
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(Self::dispatch(
            rx,
            Arc::clone(&self.listeners),
            Arc::clone(&self.subscribers),
        ));
        if let Err(SendError(event)) = tx.send(event) {
            // runtime is shutting down
            Self::deliver(&self.listeners, &self.subscribers, &event);
        }
        *dispatcher = Some(tx);
    }

    fn deliver(listeners: &Listeners, subscribers: &Subscribers, event: &ReplicationEvent) {
        let current: Vec<Arc<dyn ReplicationListener>> = listeners.read().clone();
        for listener in current {
            listener.on_event(event);
        }

        subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    async fn dispatch(
        mut rx: mpsc::UnboundedReceiver<ReplicationEvent>,
        listeners: Listeners,
        subscribers: Subscribers,
    ) {
        while let Some(event) = rx.recv().await {
            Self::deliver(&listeners, &subscribers, &event);
        }
    }
}

/// Async stream of replicator events
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ReplicationEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<ReplicationEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = ReplicationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn summary(state: ReplicatorState) -> ReplicationSummary {
        ReplicationSummary {
            replication_id: "rep".to_string(),
            direction: Direction::Push,
            state,
            document_counter: 0,
            batch_counter: 0,
            stats: ReplicationStats::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_events_reach_listeners_before_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.add_listener(Arc::new(move |_: &ReplicationEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut stream = bus.subscribe();

        bus.publish(ReplicationEvent::Started(summary(ReplicatorState::Started)));
        bus.publish(ReplicationEvent::Completed(summary(ReplicatorState::Complete)));

        let first = stream.next().await.unwrap();
        assert!(!first.is_terminal());
        let second = stream.next().await.unwrap();
        assert!(second.is_terminal());
        assert_eq!(second.summary().state, ReplicatorState::Complete);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let dropped = bus.subscribe();
        drop(dropped);
        let mut kept = bus.subscribe();

        bus.publish(ReplicationEvent::Stopped(summary(ReplicatorState::Stopped)));
        assert!(kept.recv().await.is_some());
        assert_eq!(bus.subscribers.lock().len(), 1);
    }

    #[test]
    fn test_dispatcher_survives_a_runtime_change() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.add_listener(Arc::new(move |_: &ReplicationEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let mut stream = bus.subscribe();

        for state in [ReplicatorState::Complete, ReplicatorState::Stopped] {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                bus.publish(ReplicationEvent::Completed(summary(state)));
                let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(event.summary().state, state);
            });
        }

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_publish_without_runtime_delivers_inline() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.add_listener(Arc::new(move |_: &ReplicationEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(ReplicationEvent::Stopped(summary(ReplicatorState::Stopped)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
