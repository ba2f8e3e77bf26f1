use super::ExecutionEvent;
use crate::RunId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

pub const DEFAULT_BUFFER_SIZE: usize = 256;
pub const DEFAULT_MAX_LAG: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Topic {
    Run(RunId),
    All,
}

struct Slot {
    id: u64,
    sender: mpsc::Sender<ExecutionEvent>,
    /// Consecutive events dropped because the channel was full.
    lag: usize,
}

struct Shared {
    topics: Mutex<HashMap<Topic, Vec<Slot>>>,
    next_id: AtomicU64,
    buffer_size: usize,
    max_lag: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<Topic, Vec<Slot>>> {
        // A panic while holding the lock cannot leave a slot half-written.
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn detach(&self, topic: Topic, id: u64) {
        let mut topics = self.lock();
        if let Some(slots) = topics.get_mut(&topic) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                topics.remove(&topic);
            }
        }
    }
}

/// Fan-out of run events to live subscribers.
///
/// Subscribers attach by run id (or to every run) at any time and only see
/// events published after they attached. Publishing never blocks: each
/// subscriber owns a bounded channel, and an event that does not fit is
/// dropped for that subscriber alone. A subscriber that keeps falling
/// behind for more than `max_lag` consecutive events is cut off.
#[derive(Clone)]
pub struct EventBroadcaster {
    shared: Arc<Shared>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_LAG)
    }
}

impl EventBroadcaster {
    pub fn new(buffer_size: usize, max_lag: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer_size: buffer_size.max(1),
                max_lag,
            }),
        }
    }

    /// Events of one run.
    pub fn subscribe(&self, run_id: RunId) -> Subscription {
        self.attach(Topic::Run(run_id))
    }

    /// Events of every run.
    pub fn subscribe_all(&self) -> Subscription {
        self.attach(Topic::All)
    }

    /// A subscription that is already at its end, for runs that have finished.
    /// It never takes a slot.
    pub fn closed(&self, run_id: RunId) -> Subscription {
        let (_, receiver) = mpsc::channel(1);
        Subscription {
            receiver,
            topic: Topic::Run(run_id),
            id: 0,
            shared: Weak::new(),
        }
    }

    fn attach(&self, topic: Topic) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.shared.buffer_size);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .lock()
            .entry(topic)
            .or_default()
            .push(Slot { id, sender, lag: 0 });
        tracing::debug!(?topic, subscriber = id, "Subscriber attached");
        Subscription {
            receiver,
            topic,
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn publish(&self, event: ExecutionEvent) {
        let max_lag = self.shared.max_lag;
        let mut topics = self.shared.lock();
        for topic in [Topic::Run(event.run_id), Topic::All] {
            let Some(slots) = topics.get_mut(&topic) else {
                continue;
            };
            slots.retain_mut(|slot| match slot.sender.try_send(event.clone()) {
                Ok(()) => {
                    slot.lag = 0;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    slot.lag += 1;
                    if slot.lag > max_lag {
                        tracing::warn!(subscriber = slot.id, lag = slot.lag, "Dropping lagging subscriber");
                        false
                    } else {
                        true
                    }
                }
                Err(TrySendError::Closed(_)) => false,
            });
            if slots.is_empty() {
                topics.remove(&topic);
            }
        }
    }

    /// Detach every subscriber of a finished run. Their streams end once drained.
    pub fn close_run(&self, run_id: RunId) {
        if self.shared.lock().remove(&Topic::Run(run_id)).is_some() {
            tracing::debug!(%run_id, "Closed run subscriptions");
        }
    }

    pub fn subscriber_count(&self, run_id: RunId) -> usize {
        self.shared
            .lock()
            .get(&Topic::Run(run_id))
            .map_or(0, Vec::len)
    }
}

/// Live stream of events. Dropping it detaches from the broadcaster.
pub struct Subscription {
    receiver: mpsc::Receiver<ExecutionEvent>,
    topic: Topic,
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Next event, or `None` once the run is closed or the subscriber was cut off.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn run_id(&self) -> Option<RunId> {
        match self.topic {
            Topic::Run(run_id) => Some(run_id),
            Topic::All => None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.detach(self.topic, self.id);
        }
    }
}
