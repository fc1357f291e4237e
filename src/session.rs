use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::ConfigurationSummary;
use crate::status::StatusPush;

/// Identity of one push channel subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Messages pushed to connected sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PushEvent {
    Status(StatusPush),
    ConfigurationChanged {
        configuration: ConfigurationSummary,
    },
    ConfigurationDeleted {
        id: String,
    },
}

struct SessionEntry {
    tx: mpsc::Sender<PushEvent>,
    strikes: u32,
}

/// Tracks every connected session and fans events out to them. Delivery is
/// best effort: a full queue is a strike, `failure_threshold` consecutive
/// strikes evict the session, and one failing session never blocks the rest.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    failure_threshold: u32,
}

impl SessionRegistry {
    pub fn new(queue_capacity: usize, failure_threshold: u32) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
            failure_threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a session and hand back the receiving end of its queue. Dropping
    /// the registry side of the queue tells the session to go away.
    pub fn register(&self) -> (SessionId, mpsc::Receiver<PushEvent>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut sessions = self.lock();
        sessions.insert(id, SessionEntry { tx, strikes: 0 });
        debug!("{id} registered ({} active)", sessions.len());
        (id, rx)
    }

    pub fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.lock();
        let removed = sessions.remove(&id).is_some();
        if removed {
            debug!("{id} unregistered ({} active)", sessions.len());
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver one event to a single session, e.g. its welcome snapshot.
    pub fn send_to(&self, id: SessionId, event: PushEvent) -> bool {
        let mut sessions = self.lock();
        let Some(entry) = sessions.get_mut(&id) else {
            return false;
        };
        match entry.tx.try_send(event) {
            Ok(()) => {
                entry.strikes = 0;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                sessions.remove(&id);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                entry.strikes += 1;
                if entry.strikes >= self.failure_threshold {
                    warn!("{id} evicted after {} missed deliveries", entry.strikes);
                    sessions.remove(&id);
                }
                false
            }
        }
    }

    /// Fan an event out to every session. Returns how many queues accepted it.
    pub fn broadcast(&self, event: &PushEvent) -> usize {
        let mut sessions = self.lock();
        let mut delivered = 0;
        let threshold = self.failure_threshold;
        sessions.retain(|id, entry| match entry.tx.try_send(event.clone()) {
            Ok(()) => {
                entry.strikes = 0;
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("{id} closed its queue, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                entry.strikes += 1;
                if entry.strikes >= threshold {
                    warn!("{id} evicted after {} missed deliveries", entry.strikes);
                    false
                } else {
                    debug!("{id} queue full, strike {}", entry.strikes);
                    true
                }
            }
        });
        delivered
    }
}
