use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::ConnectionState;
use crate::model::EngineStatus;
use crate::session::{PushEvent, SessionId, SessionRegistry};

/// Flat status snapshot pushed to sessions. Always a complete picture,
/// never a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPush {
    pub connected: bool,
    pub streaming: bool,
    pub recording: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_scene: Option<String>,
}

impl StatusPush {
    pub fn compose(state: ConnectionState, status: &EngineStatus) -> Self {
        Self {
            connected: state.is_connected(),
            streaming: status.streaming,
            recording: status.recording,
            current_scene: status.current_scene.clone(),
        }
    }
}

/// Folds the engine's connection state and status snapshots into deduplicated
/// pushes. The most recent push is buffered so a session that connects later
/// gets the current picture without waiting for the next change.
pub struct StatusBroadcaster {
    registry: Arc<SessionRegistry>,
    latest: Mutex<Option<StatusPush>>,
}

impl StatusBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            latest: Mutex::new(None),
        }
    }

    fn latest_lock(&self) -> MutexGuard<'_, Option<StatusPush>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recent push, if any has gone out yet.
    pub fn latest(&self) -> Option<StatusPush> {
        self.latest_lock().clone()
    }

    /// Register a session and enqueue its welcome snapshot in one step.
    /// The buffer lock spans registration and enqueue, and [`Self::emit`]
    /// broadcasts under the same lock: a concurrent push is either already
    /// reflected in the welcome or queued after it, never before.
    ///
    /// `fallback` is used when nothing has been pushed yet.
    pub fn register_session(
        &self,
        fallback: StatusPush,
    ) -> (SessionId, mpsc::Receiver<PushEvent>) {
        let latest = self.latest_lock();
        let (id, rx) = self.registry.register();
        let snapshot = latest.clone().unwrap_or(fallback);
        self.registry.send_to(id, PushEvent::Status(snapshot));
        (id, rx)
    }

    pub async fn run(
        self: Arc<Self>,
        mut state_rx: watch::Receiver<ConnectionState>,
        mut status_rx: watch::Receiver<EngineStatus>,
        cancel: CancellationToken,
    ) {
        let state = *state_rx.borrow_and_update();
        let status = status_rx.borrow_and_update().clone();
        self.emit(StatusPush::compose(state, &status));

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            // Re-read both feeds after any wake. Composing one changed feed
            // with a stale copy of the other can pair Connected with
            // pre-snapshot status.
            let state = *state_rx.borrow_and_update();
            let status = status_rx.borrow_and_update().clone();
            self.emit(StatusPush::compose(state, &status));
        }
    }

    /// Broadcast `push` unless it equals the last one sent. The buffer lock
    /// is held across the broadcast so registrations and pushes stay ordered
    /// (see [`Self::register_session`]); the broadcast itself never blocks.
    fn emit(&self, push: StatusPush) {
        let mut latest = self.latest_lock();
        if latest.as_ref() == Some(&push) {
            return;
        }
        *latest = Some(push.clone());
        let delivered = self.registry.broadcast(&PushEvent::Status(push));
        debug!("status push delivered to {delivered} sessions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn compose_reflects_connection_state() {
        let status = EngineStatus {
            streaming: true,
            recording: false,
            current_scene: Some("Intro".to_string()),
        };
        let push = StatusPush::compose(ConnectionState::Connected, &status);
        assert!(push.connected);
        assert!(push.streaming);

        let push = StatusPush::compose(ConnectionState::Reconnecting, &status);
        assert!(!push.connected);
        assert_eq!(push.current_scene.as_deref(), Some("Intro"));
    }

    async fn recv_push(rx: &mut tokio::sync::mpsc::Receiver<PushEvent>) -> StatusPush {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for push")
            .expect("push channel closed");
        match event {
            PushEvent::Status(push) => push,
            other => panic!("expected status push, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identical_snapshots_collapse_into_one_push() {
        let registry = Arc::new(SessionRegistry::new(8, 3));
        let broadcaster = Arc::new(StatusBroadcaster::new(Arc::clone(&registry)));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (status_tx, status_rx) = watch::channel(EngineStatus::default());
        let cancel = CancellationToken::new();

        let (_id, mut rx) = registry.register();
        let task = tokio::spawn(Arc::clone(&broadcaster).run(state_rx, status_rx, cancel.clone()));

        // Initial composition for the idle engine.
        let push = recv_push(&mut rx).await;
        assert!(!push.connected);

        let live = EngineStatus {
            streaming: true,
            recording: false,
            current_scene: Some("Intro".to_string()),
        };
        status_tx.send(live.clone()).expect("status send");
        let push = recv_push(&mut rx).await;
        assert!(push.streaming);

        // Same snapshot again: the watch wakes the broadcaster, but no
        // push goes out.
        status_tx.send(live.clone()).expect("status send");
        state_tx
            .send(ConnectionState::Connecting)
            .expect("state send");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        // A real change goes out and lands in the buffer.
        state_tx
            .send(ConnectionState::Connected)
            .expect("state send");
        let push = recv_push(&mut rx).await;
        assert!(push.connected);
        assert_eq!(broadcaster.latest(), Some(push));

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn late_session_sees_buffered_snapshot() {
        let registry = Arc::new(SessionRegistry::new(8, 3));
        let broadcaster = Arc::new(StatusBroadcaster::new(Arc::clone(&registry)));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (status_tx, status_rx) = watch::channel(EngineStatus::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&broadcaster).run(state_rx, status_rx, cancel.clone()));

        status_tx
            .send(EngineStatus {
                streaming: false,
                recording: true,
                current_scene: Some("Main".to_string()),
            })
            .expect("status send");
        state_tx
            .send(ConnectionState::Connected)
            .expect("state send");

        // Wait until the broadcaster has absorbed both updates.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if broadcaster.latest().is_some_and(|p| p.connected) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("broadcaster never published");

        let snapshot = broadcaster.latest().expect("buffered push");
        assert!(snapshot.connected);
        assert!(snapshot.recording);
        assert_eq!(snapshot.current_scene.as_deref(), Some("Main"));

        // A session registering now gets that buffered picture as its
        // first event, ahead of anything broadcast afterwards.
        let (_id, mut rx) = broadcaster.register_session(StatusPush::compose(
            ConnectionState::Disconnected,
            &EngineStatus::default(),
        ));
        let welcome = recv_push(&mut rx).await;
        assert_eq!(welcome, snapshot);

        cancel.cancel();
        let _ = task.await;
    }

    fn numbered_push(n: u32) -> StatusPush {
        StatusPush {
            connected: true,
            streaming: false,
            recording: false,
            current_scene: Some(format!("scene-{n}")),
        }
    }

    fn scene_number(push: &StatusPush) -> u32 {
        push.current_scene
            .as_deref()
            .and_then(|s| s.strip_prefix("scene-"))
            .and_then(|s| s.parse().ok())
            .expect("numbered scene")
    }

    #[tokio::test]
    async fn welcome_snapshot_never_trails_a_newer_push() {
        let registry = Arc::new(SessionRegistry::new(64, 3));
        let broadcaster = Arc::new(StatusBroadcaster::new(Arc::clone(&registry)));

        // Hammer out numbered pushes while sessions register concurrently.
        // A session's queue must never hold a push older than one it
        // already received, welcome included.
        let pusher = {
            let broadcaster = Arc::clone(&broadcaster);
            tokio::spawn(async move {
                for n in 0..200u32 {
                    broadcaster.emit(numbered_push(n));
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..50 {
            let (id, mut rx) = broadcaster.register_session(numbered_push(0));
            let welcome = recv_push(&mut rx).await;
            let mut floor = scene_number(&welcome);
            while let Ok(event) = rx.try_recv() {
                let PushEvent::Status(push) = event else {
                    continue;
                };
                let n = scene_number(&push);
                assert!(n >= floor, "push {n} queued behind newer {floor}");
                floor = n;
            }
            registry.unregister(id);
            tokio::task::yield_now().await;
        }

        let _ = pusher.await;
    }
}
