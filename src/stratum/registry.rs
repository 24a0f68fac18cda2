//! Authoritative set of live miner sessions.
//!
//! The registry owns a typed map from session id to a session record and is
//! the only cross-session coordination point: job and difficulty broadcasts
//! fan out from here, stats are snapshotted from here, and idle or
//! slow-consuming sessions are closed from here. Each record carries the
//! sending side of that session's bounded outbound queue; a dedicated
//! writer task drains the other end, so delivery per session stays
//! serialized and FIFO.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bitcoin::ScriptBuf;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::messages::JsonRpcMessage;
use crate::job::Job;
use crate::tracing::prelude::*;

/// Process-unique session identifier. Its big-endian bytes double as the
/// session's extranonce1, which makes extranonce uniqueness structural.
pub type SessionId = u32;

/// Outbound messages queued per session before the connection is
/// considered a slow consumer and dropped.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// What the accept path gets back when registering a connection.
pub struct SessionHandle {
    pub session_id: SessionId,
    pub extranonce1: [u8; 4],
    pub outbound_tx: mpsc::Sender<JsonRpcMessage>,
    pub outbound_rx: mpsc::Receiver<JsonRpcMessage>,
    pub cancel: CancellationToken,
}

struct SessionEntry {
    peer: SocketAddr,
    outbound: mpsc::Sender<JsonRpcMessage>,
    cancel: CancellationToken,
    authorized: bool,
    worker: Option<String>,
    payout_script: Option<ScriptBuf>,
    difficulty: f64,
    last_activity: Instant,
}

/// Point-in-time counters for the monitor log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub connections: usize,
    pub authorized: usize,
    pub workers: usize,
}

/// Registry of live sessions. All methods take `&self`; the map is behind
/// a mutex held only for map manipulation, never across I/O.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU32,
    initial_difficulty: f64,
}

impl SessionRegistry {
    pub fn new(initial_difficulty: f64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            initial_difficulty,
        }
    }

    /// Register a new connection.
    pub fn add(&self, peer: SocketAddr) -> SessionHandle {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();

        let entry = SessionEntry {
            peer,
            outbound: outbound_tx.clone(),
            cancel: cancel.clone(),
            authorized: false,
            worker: None,
            payout_script: None,
            difficulty: self.initial_difficulty,
            last_activity: Instant::now(),
        };

        self.lock().insert(session_id, entry);

        SessionHandle {
            session_id,
            extranonce1: session_id.to_be_bytes(),
            outbound_tx,
            outbound_rx,
            cancel,
        }
    }

    /// Drop a session record. Idempotent.
    pub fn remove(&self, session_id: SessionId) {
        self.lock().remove(&session_id);
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Record a successful authorize; the session joins job broadcasts.
    pub fn mark_authorized(&self, session_id: SessionId, worker: &str, script: ScriptBuf) {
        if let Some(entry) = self.lock().get_mut(&session_id) {
            entry.authorized = true;
            entry.worker = Some(worker.to_string());
            entry.payout_script = Some(script);
        }
    }

    /// Update the difficulty used for this session's future broadcasts.
    pub fn set_difficulty(&self, session_id: SessionId, difficulty: f64) {
        if let Some(entry) = self.lock().get_mut(&session_id) {
            entry.difficulty = difficulty;
        }
    }

    /// Note inbound traffic, for idle accounting.
    pub fn touch(&self, session_id: SessionId) {
        if let Some(entry) = self.lock().get_mut(&session_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Send a new job to every authorized session, re-pinning difficulty
    /// first as miners expect. The second coinbase half is rendered against
    /// each session's own payout script.
    pub fn broadcast_job(&self, job: &Job) {
        let mut slow = Vec::new();

        {
            let sessions = self.lock();
            for (id, entry) in sessions.iter() {
                let Some(script) = entry.payout_script.as_ref().filter(|_| entry.authorized)
                else {
                    continue;
                };

                let difficulty = JsonRpcMessage::notification(
                    "mining.set_difficulty",
                    json!([entry.difficulty]),
                );
                let notify = JsonRpcMessage::notification(
                    "mining.notify",
                    job.notify_params(script, job.clean_jobs),
                );

                if entry.outbound.try_send(difficulty).is_err()
                    || entry.outbound.try_send(notify).is_err()
                {
                    slow.push(*id);
                }
            }
        }

        self.close_slow_consumers(&slow);
    }

    /// Push a difficulty to every authorized session, updating the
    /// per-session record as well.
    pub fn broadcast_difficulty(&self, difficulty: f64) {
        let mut slow = Vec::new();

        {
            let mut sessions = self.lock();
            for (id, entry) in sessions.iter_mut() {
                if !entry.authorized {
                    continue;
                }
                entry.difficulty = difficulty;

                let msg = JsonRpcMessage::notification(
                    "mining.set_difficulty",
                    json!([difficulty]),
                );
                if entry.outbound.try_send(msg).is_err() {
                    slow.push(*id);
                }
            }
        }

        self.close_slow_consumers(&slow);
    }

    fn close_slow_consumers(&self, ids: &[SessionId]) {
        if ids.is_empty() {
            return;
        }
        let sessions = self.lock();
        for id in ids {
            if let Some(entry) = sessions.get(id) {
                warn!(session = id, peer = %entry.peer, "Dropping slow consumer");
                entry.cancel.cancel();
            }
        }
    }

    pub fn snapshot_stats(&self) -> RegistryStats {
        let sessions = self.lock();
        let workers: HashSet<&str> = sessions
            .values()
            .filter_map(|e| e.worker.as_deref())
            .collect();

        RegistryStats {
            connections: sessions.len(),
            authorized: sessions.values().filter(|e| e.authorized).count(),
            workers: workers.len(),
        }
    }

    /// Cancel sessions with no inbound traffic for `max_idle`. Returns how
    /// many were closed.
    pub fn close_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let sessions = self.lock();
        let mut closed = 0;

        for (id, entry) in sessions.iter() {
            if now.duration_since(entry.last_activity) > max_idle {
                info!(session = id, peer = %entry.peer, "Closing idle session");
                entry.cancel.cancel();
                closed += 1;
            }
        }

        closed
    }

    /// Courteously close every session: queue a `client.reconnect` and
    /// cancel. Writer tasks drain their queues before exiting.
    pub fn shutdown_all(&self) {
        let mut sessions = self.lock();
        for entry in sessions.values() {
            let _ = entry
                .outbound
                .try_send(JsonRpcMessage::notification("client.reconnect", json!([])));
            entry.cancel.cancel();
        }
        sessions.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobBuilder;
    use crate::template::TemplateUpdate;
    use std::sync::Arc;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn test_script() -> ScriptBuf {
        ScriptBuf::from_bytes(
            hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap(),
        )
    }

    fn test_job() -> Job {
        let update = TemplateUpdate {
            template: Arc::new(crate::job::tests::test_template(false)),
            clean: true,
        };
        JobBuilder::new().build(&update)
    }

    #[test]
    fn test_extranonce1_unique_across_sessions() {
        let registry = SessionRegistry::new(1.0);
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let handle = registry.add(peer());
            assert!(seen.insert(handle.extranonce1));
        }
    }

    #[test]
    fn test_add_remove_counts() {
        let registry = SessionRegistry::new(1.0);
        let a = registry.add(peer());
        let b = registry.add(peer());
        assert_eq!(registry.connection_count(), 2);

        registry.remove(a.session_id);
        registry.remove(a.session_id); // idempotent
        assert_eq!(registry.connection_count(), 1);

        registry.remove(b.session_id);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_authorized() {
        let registry = SessionRegistry::new(2.0);
        let mut authorized = registry.add(peer());
        let mut fresh = registry.add(peer());

        registry.mark_authorized(authorized.session_id, "worker", test_script());
        registry.broadcast_job(&test_job());

        // Authorized session gets set_difficulty then notify, in order.
        let first = authorized.outbound_rx.recv().await.unwrap();
        assert_eq!(first.method(), Some("mining.set_difficulty"));
        let second = authorized.outbound_rx.recv().await.unwrap();
        assert_eq!(second.method(), Some("mining.notify"));

        assert!(fresh.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_cancelled() {
        let registry = SessionRegistry::new(1.0);
        let handle = registry.add(peer());
        registry.mark_authorized(handle.session_id, "worker", test_script());

        // Nobody drains the queue; each broadcast enqueues two messages.
        for _ in 0..(OUTBOUND_QUEUE_DEPTH / 2 + 1) {
            registry.broadcast_job(&test_job());
        }

        assert!(handle.cancel.is_cancelled());
    }

    #[test]
    fn test_snapshot_stats() {
        let registry = SessionRegistry::new(1.0);
        let a = registry.add(peer());
        let b = registry.add(peer());
        let _c = registry.add(peer());

        registry.mark_authorized(a.session_id, "alice.rig1", test_script());
        registry.mark_authorized(b.session_id, "alice.rig1", test_script());

        let stats = registry.snapshot_stats();
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.authorized, 2);
        assert_eq!(stats.workers, 1);
    }

    #[tokio::test]
    async fn test_shutdown_sends_reconnect_and_cancels() {
        let registry = SessionRegistry::new(1.0);
        let mut handle = registry.add(peer());

        registry.shutdown_all();

        let msg = handle.outbound_rx.recv().await.unwrap();
        assert_eq!(msg.method(), Some("client.reconnect"));
        assert!(handle.cancel.is_cancelled());
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn test_close_idle() {
        let registry = SessionRegistry::new(1.0);
        let handle = registry.add(peer());

        assert_eq!(registry.close_idle(Duration::from_secs(300)), 0);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.close_idle(Duration::from_millis(1)), 1);
        assert!(handle.cancel.is_cancelled());
    }
}
