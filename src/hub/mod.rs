use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::stats::StatisticsSnapshot;

/// Fan-out hub delivering statistics snapshots to connected dashboard
/// sessions. Every subscriber owns an independent bounded queue, so a slow
/// or wedged client only ever loses its own updates; `publish` never blocks.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Mutex<HubInner>>,
    queue_len: usize,
}

struct HubInner {
    subscribers: HashMap<Uuid, mpsc::Sender<StatisticsSnapshot>>,
    latest: Option<StatisticsSnapshot>,
}

/// One client's live feed. Unsubscribes itself when dropped, so transport
/// handlers can simply fall out of scope on disconnect.
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<StatisticsSnapshot>,
    hub: Hub,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

impl Hub {
    pub fn new(queue_len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                subscribers: HashMap::new(),
                latest: None,
            })),
            queue_len: queue_len.max(1),
        }
    }

    /// Register a new session. The current full snapshot (if any has been
    /// published) is queued first, so late joiners see consistent state
    /// instead of waiting for the next delta.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_len);
        let id = Uuid::new_v4();

        let mut inner = self.lock();
        if let Some(latest) = inner.latest.clone() {
            // Queue is empty at this point, so this cannot fail on capacity.
            let _ = tx.try_send(latest);
        }
        inner.subscribers.insert(id, tx);
        debug!(
            "hub: session {id} subscribed ({} active)",
            inner.subscribers.len()
        );

        Subscription {
            id,
            rx,
            hub: self.clone(),
        }
    }

    /// Remove a session. Idempotent; unknown ids are ignored.
    pub fn unsubscribe(&self, id: Uuid) {
        let mut inner = self.lock();
        if inner.subscribers.remove(&id).is_some() {
            debug!(
                "hub: session {id} unsubscribed ({} active)",
                inner.subscribers.len()
            );
        }
    }

    /// Broadcast a snapshot to all current sessions. Per-session queues are
    /// filled with `try_send`: a full queue drops this update for that
    /// session only, and a closed queue evicts the session.
    pub fn publish(&self, snapshot: StatisticsSnapshot) {
        let mut inner = self.lock();
        inner.latest = Some(snapshot.clone());

        let mut dead = Vec::new();
        for (id, tx) in &inner.subscribers {
            match tx.try_send(snapshot.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("hub: session {id} is lagging, dropping update");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }

        for id in dead {
            inner.subscribers.remove(&id);
            debug!("hub: evicted closed session {id}");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Most recently published snapshot, if any.
    pub fn latest(&self) -> Option<StatisticsSnapshot> {
        self.lock().latest.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
