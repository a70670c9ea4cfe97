//! Session records and the concurrent table that holds them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::DropGuard;

use super::pty::PtyProcess;
use super::reaper::IdleTimer;
use super::sequencer::{Delivery, InboundGate};
use super::SessionId;

/// Lifecycle of a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Reserved by `handshake`, no process yet.
    Waiting,
    /// A shell is attached.
    Running,
    /// Torn down. Never leaves this state.
    Destroyed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Waiting => write!(f, "waiting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Output delivery for one connect cycle. Dropping it stops the worker.
pub struct Subscription {
    pub delivery: Delivery,
    _guard: DropGuard,
}

impl Subscription {
    /// Bind a delivery worker to the guard that cancels it.
    pub fn new(delivery: Delivery, guard: DropGuard) -> Self {
        Self {
            delivery,
            _guard: guard,
        }
    }
}

/// One terminal session.
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    pub process: Option<Arc<dyn PtyProcess>>,
    /// Keeps the process event pump alive.
    pub pump: Option<DropGuard>,
    /// Every chunk exchanged since the session was created, base64
    /// encoded. Survives reconnects; cleared only by `destroy`.
    pub history: Vec<String>,
    /// Incremented by every successful `connect`.
    pub cycle: u64,
    /// Last output sequence assigned in this cycle.
    pub outbound_sequence: u64,
    pub inbound: InboundGate,
    pub subscription: Option<Subscription>,
    pub idle_timer: Option<IdleTimer>,
}

impl Session {
    /// A fresh `waiting` reservation with empty history.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            status: SessionStatus::Waiting,
            process: None,
            pump: None,
            history: Vec::new(),
            cycle: 0,
            outbound_sequence: 0,
            inbound: InboundGate::new(),
            subscription: None,
            idle_timer: None,
        }
    }

    /// Whether `destroy` has run.
    pub fn is_destroyed(&self) -> bool {
        self.status == SessionStatus::Destroyed
    }

    /// Renew the idle timer, if armed.
    pub fn touch(&self) {
        if let Some(timer) = &self.idle_timer {
            timer.renew();
        }
    }

    /// Tear everything down. Returns whether a process was attached.
    /// Calling it again is a no-op.
    pub fn destroy(&mut self) -> bool {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
        self.subscription = None;
        self.pump = None;

        let had_process = match self.process.take() {
            Some(process) => {
                process.kill();
                true
            }
            None => false,
        };

        self.history.clear();
        self.outbound_sequence = 0;
        self.inbound.close();
        self.status = SessionStatus::Destroyed;
        had_process
    }

    /// Snapshot for introspection. Geometry reads as 0x0 without a process.
    pub fn info(&self) -> SessionInfo {
        let (cols, rows) = self
            .process
            .as_ref()
            .map(|process| process.size())
            .unwrap_or((0, 0));

        SessionInfo {
            id: self.id.clone(),
            status: self.status,
            pid: self.process.as_ref().and_then(|process| process.pid()),
            cols,
            rows,
            cycle: self.cycle,
            outbound_sequence: self.outbound_sequence,
            inbound_sequence: self.inbound.cursor().applied,
            history_len: self.history.len(),
            idle_timeout_ms: self
                .idle_timer
                .as_ref()
                .map(|timer| timer.timeout())
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("cycle", &self.cycle)
            .field("outbound_sequence", &self.outbound_sequence)
            .field("history_len", &self.history.len())
            .finish()
    }
}

/// Read-only view of a session for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub cycle: u64,
    pub outbound_sequence: u64,
    pub inbound_sequence: u64,
    pub history_len: usize,
    pub idle_timeout_ms: u64,
}

pub type SessionHandle = Arc<Mutex<Session>>;

/// Concurrent map of live sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, SessionHandle>,
}

impl SessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session, replacing any record with the same id.
    pub fn insert(&self, session: Session) -> SessionHandle {
        let id = session.id.clone();
        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(id, handle.clone());
        handle
    }

    /// Look up a session by id.
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Drop a session from the table. The caller destroys it.
    pub fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, handle)| handle)
    }

    /// Check if a session exists.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of sessions in the table, in any state.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of every session, in no particular order.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of every handle, so callers never hold a shard lock across
    /// an await.
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
