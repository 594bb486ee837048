//! Sequenced snapshot+delta fan-out to subscribers (spec §4.9).
//!
//! Runs as its own actor task, grounded in the teacher's `Backend` actor
//! (`backend.rs`): a command channel in, `tokio::select!` loop, message-passing
//! rather than a shared lock. A slow client is evicted rather than allowed to
//! back-pressure the whole daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::health::{HealthStatus, HealthTracker};
use crate::store::{EmitIntent, SessionState, SessionStore};

/// Bounded per-client outbound queue depth. A client that can't keep up with
/// this is evicted rather than slowing the broadcaster down for everyone
/// else.
const CLIENT_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealthSnapshot {
    pub source: &'static str,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotPayload {
    pub sessions: Vec<SessionState>,
    #[serde(rename = "sourceHealth", skip_serializing_if = "Option::is_none")]
    pub source_health: Option<Vec<SourceHealthSnapshot>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeltaPayload {
    pub updates: Vec<SessionState>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionPayload {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub activity: crate::source::Activity,
    pub name: String,
}

/// Wire frame per spec.md §6: `{"type":<kind>,"seq":N,"payload":{...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Snapshot { seq: u64, payload: SnapshotPayload },
    Delta { seq: u64, payload: DeltaPayload },
    Completion { seq: u64, payload: CompletionPayload },
}

pub struct ClientSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<OutboundMessage>>,
}

enum Command {
    QueueUpdate(Vec<SessionState>),
    QueueRemoval(Vec<String>),
    Emit(EmitIntent),
    Subscribe(oneshot::Sender<Option<ClientSubscription>>),
}

/// Cheap-to-clone handle the monitor and the connection-accept loop hold.
/// All mutable state lives in the actor task spawned by `Broadcaster::spawn`.
#[derive(Clone)]
pub struct Broadcaster {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Broadcaster {
    /// Spawn the actor task and return the handle used to feed it.
    pub fn spawn(
        store: Arc<SessionStore>,
        health: Vec<(&'static str, Arc<HealthTracker>)>,
        max_connections: usize,
        throttle: Duration,
        snapshot_interval: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = BroadcasterActor {
            store,
            health,
            max_connections,
            throttle,
            snapshot_interval,
            clients: Vec::new(),
            next_client_id: 0,
            seq: 0,
            pending: PendingBatch::default(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    pub fn queue_update(&self, sessions: Vec<SessionState>) {
        if sessions.is_empty() {
            return;
        }
        let _ = self.cmd_tx.send(Command::QueueUpdate(sessions));
    }

    pub fn queue_removal(&self, ids: Vec<String>) {
        if ids.is_empty() {
            return;
        }
        let _ = self.cmd_tx.send(Command::QueueRemoval(ids));
    }

    pub fn dispatch(&self, intent: EmitIntent) {
        if matches!(intent, EmitIntent::None) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Emit(intent));
    }

    /// Request a new subscription. Returns `None` if `max_connections` is
    /// already saturated; the caller should close the connection.
    pub async fn subscribe(&self) -> Option<ClientSubscription> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Subscribe(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.ok().flatten()
    }
}

struct ClientHandle {
    id: u64,
    tx: mpsc::Sender<Arc<OutboundMessage>>,
}

#[derive(Default)]
struct PendingBatch {
    updated: HashMap<String, SessionState>,
    removed: std::collections::HashSet<String>,
}

impl PendingBatch {
    fn is_dirty(&self) -> bool {
        !self.updated.is_empty() || !self.removed.is_empty()
    }

    fn take(&mut self) -> (Vec<SessionState>, Vec<String>) {
        let updated = self.updated.drain().map(|(_, v)| v).collect();
        let removed = self.removed.drain().collect();
        (updated, removed)
    }
}

struct BroadcasterActor {
    store: Arc<SessionStore>,
    health: Vec<(&'static str, Arc<HealthTracker>)>,
    max_connections: usize,
    throttle: Duration,
    snapshot_interval: Duration,

    clients: Vec<ClientHandle>,
    next_client_id: u64,
    seq: u64,
    pending: PendingBatch,
}

impl BroadcasterActor {
    fn next_seq(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn broadcast(&mut self, message: OutboundMessage) {
        let message = Arc::new(message);
        self.clients.retain(|client| match client.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id = client.id, "evicting slow broadcaster client");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn flush_pending(&mut self) {
        if !self.pending.is_dirty() {
            return;
        }
        let (updates, removed) = self.pending.take();
        let seq = self.next_seq();
        self.broadcast(OutboundMessage::Delta { seq, payload: DeltaPayload { updates, removed } });
    }

    /// Per spec, the source-health array only rides along with a snapshot
    /// when at least one source's status crossed a threshold since the last
    /// snapshot.
    fn health_snapshot_if_changed(&self) -> Option<Vec<SourceHealthSnapshot>> {
        let mut changed = false;
        let mut snapshot = Vec::with_capacity(self.health.len());
        for (name, tracker) in &self.health {
            let (status, did_change) = tracker.snapshot_and_transition();
            changed |= did_change;
            snapshot.push(SourceHealthSnapshot { source: name, status });
        }
        changed.then_some(snapshot)
    }

    fn send_full_snapshot(&mut self) {
        let sessions = self.store.get_all();
        let source_health = self.health_snapshot_if_changed();
        let seq = self.next_seq();
        self.broadcast(OutboundMessage::Snapshot { seq, payload: SnapshotPayload { sessions, source_health } });
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut throttle_tick = tokio::time::interval(self.throttle);
        throttle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut snapshot_tick = tokio::time::interval(self.snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::QueueUpdate(sessions) => {
                            for session in sessions {
                                self.pending.removed.remove(&session.id);
                                self.pending.updated.insert(session.id.clone(), session);
                            }
                        }
                        Command::QueueRemoval(ids) => {
                            for id in ids {
                                self.pending.updated.remove(&id);
                                self.pending.removed.insert(id);
                            }
                        }
                        Command::Emit(EmitIntent::Completion { session_id, activity, name }) => {
                            let seq = self.next_seq();
                            self.broadcast(OutboundMessage::Completion {
                                seq,
                                payload: CompletionPayload { session_id, activity, name },
                            });
                        }
                        Command::Emit(EmitIntent::None) => {}
                        Command::Subscribe(reply) => {
                            if self.clients.len() >= self.max_connections {
                                info!(max = self.max_connections, "rejecting subscriber: connection cap reached");
                                let _ = reply.send(None);
                                continue;
                            }
                            let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
                            let seq = self.next_seq();
                            let snapshot = OutboundMessage::Snapshot {
                                seq,
                                payload: SnapshotPayload {
                                    sessions: self.store.get_all(),
                                    source_health: self.health_snapshot_if_changed(),
                                },
                            };
                            if tx.try_send(Arc::new(snapshot)).is_err() {
                                let _ = reply.send(None);
                                continue;
                            }
                            let id = self.next_client_id;
                            self.next_client_id += 1;
                            self.clients.push(ClientHandle { id, tx });
                            let _ = reply.send(Some(ClientSubscription { id, rx }));
                        }
                    }
                }
                _ = throttle_tick.tick() => {
                    self.flush_pending();
                }
                _ = snapshot_tick.tick() => {
                    self.send_full_snapshot();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Activity;
    use chrono::Utc;

    fn fixture_state(id: &str) -> SessionState {
        SessionState {
            id: id.to_string(),
            name: "proj".into(),
            source: "claude".into(),
            working_dir: None,
            branch: None,
            model: None,
            pid: None,
            tmux_target: None,
            message_count: 0,
            tool_call_count: 0,
            tokens_used: 0,
            max_context_tokens: 0,
            context_utilization: 0.0,
            token_estimated: false,
            is_churning: false,
            activity: Activity::Thinking,
            started_at: Utc::now(),
            last_activity_at: Utc::now(),
            last_data_received_at: Utc::now(),
            completed_at: None,
            burn_rate_per_minute: 0.0,
            subagents: Vec::new(),
            recent_files: Vec::new(),
        }
    }

    fn make_actor(max_connections: usize) -> BroadcasterActor {
        BroadcasterActor {
            store: Arc::new(SessionStore::new()),
            health: Vec::new(),
            max_connections,
            throttle: Duration::from_millis(50),
            snapshot_interval: Duration::from_secs(30),
            clients: Vec::new(),
            next_client_id: 0,
            seq: 0,
            pending: PendingBatch::default(),
        }
    }

    #[test]
    fn pending_batch_coalesces_update_after_removal() {
        let mut pending = PendingBatch::default();
        pending.removed.insert("claude:1".into());
        pending.updated.remove("claude:1");
        pending.removed.remove("claude:1");
        pending.updated.insert("claude:1".into(), fixture_state("claude:1"));
        let (updated, removed) = pending.take();
        assert_eq!(updated.len(), 1);
        assert!(removed.is_empty());
    }

    #[test]
    fn seq_wraps_without_panicking() {
        let mut actor = make_actor(4);
        actor.seq = u64::MAX;
        assert_eq!(actor.next_seq(), 0);
    }

    /// Wire contract (spec §6): `{"type":...,"seq":N,"payload":{...}}`, with
    /// `updates`/`sessionID`/`sourceHealth` inside `payload`, not flat.
    #[test]
    fn wire_frames_match_the_documented_envelope() {
        let delta = OutboundMessage::Delta {
            seq: 1,
            payload: DeltaPayload { updates: vec![fixture_state("claude:1")], removed: vec!["claude:2".into()] },
        };
        let v: serde_json::Value = serde_json::to_value(&delta).unwrap();
        assert_eq!(v["type"], "delta");
        assert_eq!(v["seq"], 1);
        assert!(v["payload"]["updates"].is_array());
        assert_eq!(v["payload"]["removed"][0], "claude:2");
        assert!(v.get("kind").is_none());
        assert!(v.get("updated").is_none());

        let completion = OutboundMessage::Completion {
            seq: 2,
            payload: CompletionPayload {
                session_id: "claude:1".into(),
                activity: Activity::Complete,
                name: "proj".into(),
            },
        };
        let v: serde_json::Value = serde_json::to_value(&completion).unwrap();
        assert_eq!(v["type"], "completion");
        assert_eq!(v["payload"]["sessionID"], "claude:1");
        assert_eq!(v["payload"]["activity"], "complete");

        let snapshot = OutboundMessage::Snapshot {
            seq: 3,
            payload: SnapshotPayload {
                sessions: vec![fixture_state("claude:1")],
                source_health: Some(vec![SourceHealthSnapshot { source: "claude", status: HealthStatus::Healthy }]),
            },
        };
        let v: serde_json::Value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(v["type"], "snapshot");
        assert!(v["payload"]["sessions"].is_array());
        assert_eq!(v["payload"]["sourceHealth"][0]["source"], "claude");
    }

    #[tokio::test]
    async fn subscribe_rejected_once_connection_cap_reached() {
        let mut actor = make_actor(1);
        let (tx, _rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        actor.clients.push(ClientHandle { id: 0, tx });

        assert!(actor.clients.len() >= actor.max_connections);
    }

    #[tokio::test]
    async fn subscribe_delivers_immediate_snapshot() {
        let store = Arc::new(SessionStore::new());
        store.update(fixture_state("claude:1"));
        let broadcaster = Broadcaster::spawn(store, Vec::new(), 4, Duration::from_millis(20), Duration::from_secs(30));

        let mut sub = broadcaster.subscribe().await.expect("under connection cap");
        let first = sub.rx.recv().await.expect("snapshot delivered");
        assert!(matches!(*first, OutboundMessage::Snapshot { .. }));
    }

    #[tokio::test]
    async fn queued_update_flushes_as_delta_after_throttle() {
        let store = Arc::new(SessionStore::new());
        let broadcaster = Broadcaster::spawn(store, Vec::new(), 4, Duration::from_millis(20), Duration::from_secs(30));
        let mut sub = broadcaster.subscribe().await.expect("under connection cap");
        let _snapshot = sub.rx.recv().await.unwrap();

        broadcaster.queue_update(vec![fixture_state("claude:1")]);
        let delta = tokio::time::timeout(Duration::from_millis(200), sub.rx.recv())
            .await
            .expect("delta arrives within throttle window")
            .expect("channel open");
        assert!(matches!(*delta, OutboundMessage::Delta { .. }));
    }

    #[tokio::test]
    async fn completion_bypasses_throttle() {
        let store = Arc::new(SessionStore::new());
        let broadcaster = Broadcaster::spawn(store, Vec::new(), 4, Duration::from_secs(30), Duration::from_secs(30));
        let mut sub = broadcaster.subscribe().await.expect("under connection cap");
        let _snapshot = sub.rx.recv().await.unwrap();

        broadcaster.dispatch(EmitIntent::Completion {
            session_id: "claude:1".into(),
            activity: Activity::Complete,
            name: "proj".into(),
        });
        let msg = tokio::time::timeout(Duration::from_millis(200), sub.rx.recv())
            .await
            .expect("completion arrives immediately")
            .expect("channel open");
        assert!(matches!(*msg, OutboundMessage::Completion { .. }));
    }
}
