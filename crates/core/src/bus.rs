// Event Bus
//
// Fans run events out to in-memory subscriptions. Each subscriber owns a
// bounded queue; `publish` never waits on it. A subscriber whose queue is
// full is evicted and observes `RecvError::SlowConsumer`, while the
// publisher and every other subscriber carry on.
//
// Watching a run replays its persisted history before live events. The
// run is added to the filter before history is read, and delivery skips
// any sequence number at or below the last one handed out for that run, so
// the replay/live boundary has neither gaps nor duplicates.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, StoreResult};
use crate::events::RunEvent;
use crate::traits::RunStore;

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Events buffered per subscriber before it is evicted
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
        }
    }
}

impl BusConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Why a subscription stopped receiving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The subscriber fell behind and was disconnected by the bus
    #[error("SlowConsumer")]
    SlowConsumer,

    #[error("event bus closed")]
    Closed,
}

impl RecvError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RecvError::SlowConsumer => Some(ErrorCode::SlowConsumer),
            RecvError::Closed => None,
        }
    }
}

#[derive(Debug, Default)]
struct Interest {
    all: bool,
    runs: HashSet<Uuid>,
}

impl Interest {
    fn matches(&self, run_id: Uuid) -> bool {
        self.all || self.runs.contains(&run_id)
    }
}

struct Subscriber {
    sender: mpsc::Sender<Arc<RunEvent>>,
    interest: Arc<RwLock<Interest>>,
    closed: Arc<OnceLock<RecvError>>,
}

struct BusInner {
    config: BusConfig,
    history: Arc<dyn RunStore>,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

/// In-process broadcaster of run events
///
/// Cheap to clone; clones share the subscriber table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(history: Arc<dyn RunStore>, config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                history,
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Create a subscription with no interests yet
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.config.queue_capacity);
        let interest = Arc::new(RwLock::new(Interest::default()));
        let closed = Arc::new(OnceLock::new());

        self.inner.subscribers.write().insert(
            id,
            Subscriber {
                sender,
                interest: interest.clone(),
                closed: closed.clone(),
            },
        );
        debug!(subscriber_id = id, "Subscriber registered");

        Subscription {
            id,
            receiver,
            interest,
            closed,
            pending: VecDeque::new(),
            delivered: HashMap::new(),
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Deliver `event` to every matching subscriber without blocking
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: RunEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut evicted = Vec::new();
        let mut gone = Vec::new();

        {
            let subscribers = self.inner.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                if !subscriber.interest.read().matches(event.run_id) {
                    continue;
                }
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => evicted.push(*id),
                    Err(TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }

        if !evicted.is_empty() || !gone.is_empty() {
            let mut subscribers = self.inner.subscribers.write();
            for id in evicted {
                if let Some(subscriber) = subscribers.remove(&id) {
                    let _ = subscriber.closed.set(RecvError::SlowConsumer);
                    warn!(
                        subscriber_id = id,
                        run_id = %event.run_id,
                        sequence = event.sequence,
                        capacity = self.inner.config.queue_capacity,
                        "Evicting slow consumer"
                    );
                }
            }
            for id in gone {
                subscribers.remove(&id);
            }
        }

        debug!(
            run_id = %event.run_id,
            sequence = event.sequence,
            event_type = %event.event_type,
            delivered,
            "Event published"
        );
        delivered
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A live client's interest in some runs (or all of them)
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Arc<RunEvent>>,
    interest: Arc<RwLock<Interest>>,
    closed: Arc<OnceLock<RecvError>>,
    /// Replayed history not yet handed out
    pending: VecDeque<Arc<RunEvent>>,
    /// Highest sequence handed out per run
    delivered: HashMap<Uuid, u64>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Watch one run, replaying every persisted event first
    pub async fn watch_run(&mut self, run_id: Uuid) -> StoreResult<usize> {
        self.watch_run_after(run_id, None).await
    }

    /// Watch one run, replaying persisted events after `after`
    ///
    /// Returns the number of replayed events.
    pub async fn watch_run_after(&mut self, run_id: Uuid, after: Option<u64>) -> StoreResult<usize> {
        self.interest.write().runs.insert(run_id);

        let Some(bus) = self.bus.upgrade() else {
            return Ok(0);
        };
        let history = bus.history.list_events(run_id, after).await?;

        let mut high_water = self.delivered.get(&run_id).copied().or(after);
        let mut replayed = 0;
        for event in history {
            if high_water.is_some_and(|seen| event.sequence <= seen) {
                continue;
            }
            high_water = Some(event.sequence);
            self.pending.push_back(Arc::new(event));
            replayed += 1;
        }
        if let Some(seq) = high_water {
            self.delivered.insert(run_id, seq);
        }
        Ok(replayed)
    }

    /// Receive live events for every run (no replay)
    pub fn watch_all(&mut self) {
        self.interest.write().all = true;
    }

    /// Stop watching a run; watching it again replays its history
    pub fn unwatch_run(&mut self, run_id: Uuid) {
        self.interest.write().runs.remove(&run_id);
        self.pending.retain(|e| e.run_id != run_id);
        self.delivered.remove(&run_id);
    }

    pub fn unwatch_all(&mut self) {
        self.interest.write().all = false;
    }

    pub fn is_watching(&self, run_id: Uuid) -> bool {
        self.interest.read().matches(run_id)
    }

    /// Next event, replayed history first
    pub async fn recv(&mut self) -> Result<Arc<RunEvent>, RecvError> {
        loop {
            if let Some(reason) = self.closed.get() {
                return Err(*reason);
            }
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            match self.receiver.recv().await {
                Some(event) => {
                    if let Some(event) = self.accept(event) {
                        return Ok(event);
                    }
                }
                None => return Err(self.closed.get().copied().unwrap_or(RecvError::Closed)),
            }
        }
    }

    /// Non-waiting variant of `recv`; `Ok(None)` when nothing is queued
    pub fn try_recv(&mut self) -> Result<Option<Arc<RunEvent>>, RecvError> {
        loop {
            if let Some(reason) = self.closed.get() {
                return Err(*reason);
            }
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            match self.receiver.try_recv() {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Ok(Some(event));
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(self.closed.get().copied().unwrap_or(RecvError::Closed))
                }
            }
        }
    }

    /// Drop duplicates of replayed events and events for runs no longer watched
    ///
    /// A run publishes nothing after its terminal event, so its high-water
    /// mark is released once that event is handed out.
    fn accept(&mut self, event: Arc<RunEvent>) -> Option<Arc<RunEvent>> {
        if !self.interest.read().matches(event.run_id) {
            return None;
        }
        match self.delivered.get(&event.run_id) {
            Some(seen) if event.sequence <= *seen => None,
            _ if event.is_terminal() => {
                self.delivered.remove(&event.run_id);
                Some(event)
            }
            _ => {
                self.delivered.insert(event.run_id, event.sequence);
                Some(event)
            }
        }
    }

    /// Runs with a recorded high-water mark
    pub fn tracked_runs(&self) -> usize {
        self.delivered.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.write().remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pending", &self.pending.len())
            .finish()
    }
}
