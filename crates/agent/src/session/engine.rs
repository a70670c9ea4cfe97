//! The terminal session engine.
//!
//! Owns every session, spawns shells on `connect`, applies input in
//! sequence order, numbers and delivers output, and reclaims idle sessions.
//! Everything it says to the peer goes through a [`TransportSender`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use protocol::{
    decode_chunk, encode_chunk, CloseReason, ClosePush, ConnectRequest, ConsumeConfirmRequest,
    DataRequest, ResizeRequest,
};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use super::error::{SessionError, SessionId};
use super::pty::{PtyEvent, PtyProcess, PtySpawner, SpawnOptions};
use super::reaper::IdleTimer;
use super::sequencer::{wait_for_turn, Delivery, Turn};
use super::store::{Session, SessionInfo, SessionStatus, SessionStore, Subscription};
use crate::config::Config;
use crate::transport::{TerminalEvent, TransportSender};

/// How long shutdown waits for each closure notice.
const SHUTDOWN_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// Terminal type exported to every shell unless the request overrides it.
const DEFAULT_TERM: &str = "xterm-256color";

/// Engine tuning, usually taken from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub input_wait_timeout: Duration,
    pub retransmit_interval: Duration,
    pub max_sessions: usize,
}

impl EngineSettings {
    /// Read the terminal and transport sections. The working directory
    /// falls back to the home directory.
    pub fn from_config(config: &Config) -> Self {
        let terminal = &config.terminal;
        Self {
            shell: terminal.default_shell.clone(),
            cols: terminal.default_cols,
            rows: terminal.default_rows,
            cwd: terminal.default_cwd.clone().or_else(dirs::home_dir),
            idle_timeout: terminal.idle_timeout(),
            input_wait_timeout: terminal.input_wait_timeout(),
            retransmit_interval: config.transport.retransmit_interval(),
            max_sessions: terminal.max_sessions,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct EngineInner {
    store: SessionStore,
    spawner: Arc<dyn PtySpawner>,
    transport: Arc<dyn TransportSender>,
    settings: EngineSettings,
    live_processes: AtomicUsize,
}

/// Cheap-to-clone handle to the engine.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

fn required<'a>(value: Option<&'a str>, name: &'static str) -> Result<&'a str, SessionError> {
    value
        .filter(|value| !value.is_empty())
        .ok_or(SessionError::MissingParameter(name))
}

fn turn_error(turn: Turn, id: &str, sequence: u64) -> Option<SessionError> {
    match turn {
        Turn::Ready => None,
        Turn::Duplicate { applied } => Some(SessionError::DuplicateSequence { sequence, applied }),
        Turn::CycleReset => Some(SessionError::CycleReset(sequence)),
        Turn::Closed => Some(SessionError::ProcessNotFound(id.to_string())),
    }
}

impl SessionEngine {
    /// Create an engine that spawns shells with `spawner` and pushes
    /// everything it has to say through `transport`.
    pub fn new(
        settings: EngineSettings,
        spawner: Arc<dyn PtySpawner>,
        transport: Arc<dyn TransportSender>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store: SessionStore::new(),
                spawner,
                transport,
                settings,
                live_processes: AtomicUsize::new(0),
            }),
        }
    }

    /// Settings the engine was built with.
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Reserve a fresh session id.
    pub fn handshake(&self) -> SessionId {
        let id = Uuid::new_v4().to_string();
        let mut session = Session::new(id.clone());
        session.idle_timer = Some(self.idle_timer(&id, self.inner.settings.idle_timeout));
        self.inner.store.insert(session);

        tracing::info!(session_id = %id, "Session reserved");
        id
    }

    /// Spawn or re-attach the session's shell and return its history.
    pub async fn connect(&self, request: ConnectRequest) -> Result<Vec<String>, SessionError> {
        let id = required(request.id.as_deref(), "id")?;
        let not_connectable = || SessionError::NotConnectable(id.to_string());

        let handle = self.inner.store.get(id).ok_or_else(not_connectable)?;
        let mut session = handle.lock().await;
        if session.is_destroyed() {
            return Err(not_connectable());
        }

        // A plain reconnect keeps whatever window the session already has.
        let idle_timeout = request
            .die_timeout
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .or_else(|| session.idle_timer.as_ref().map(|timer| timer.timeout()))
            .unwrap_or(self.inner.settings.idle_timeout);

        if session.process.is_none() {
            let process = self.spawn_process(&request)?;
            session.pump = Some(self.start_pump(id, &process));
            tracing::info!(session_id = %id, pid = ?process.pid(), "Shell started");
            session.process = Some(process);
        }

        session.cycle += 1;
        session.outbound_sequence = 0;
        session.inbound.reset(session.cycle);

        // Old delivery first, so two workers never push for one session.
        session.subscription = None;
        let cancel = CancellationToken::new();
        let delivery = Delivery::spawn(
            id.to_string(),
            self.inner.transport.clone(),
            self.inner.settings.retransmit_interval,
            cancel.clone(),
        );
        session.subscription = Some(Subscription::new(delivery, cancel.drop_guard()));

        match session.idle_timer.as_mut() {
            Some(timer) => timer.rearm(idle_timeout),
            None => session.idle_timer = Some(self.idle_timer(id, idle_timeout)),
        }
        session.status = SessionStatus::Running;

        tracing::info!(
            session_id = %id,
            cycle = session.cycle,
            replay = session.history.len(),
            "Session connected"
        );
        Ok(session.history.clone())
    }

    /// Apply one sequenced input chunk.
    ///
    /// Returns `Ok(false)` for an empty tick: the slot is consumed but
    /// nothing is written.
    pub async fn data(&self, request: DataRequest) -> Result<bool, SessionError> {
        let id = required(Some(request.id.as_str()), "id")?;
        let sequence = request.sequence;
        let not_found = || SessionError::ProcessNotFound(id.to_string());

        let handle = self.inner.store.get(id).ok_or_else(not_found)?;
        let (cycle, rx) = {
            let session = handle.lock().await;
            if session.is_destroyed() || session.process.is_none() {
                return Err(not_found());
            }
            (session.cycle, session.inbound.subscribe())
        };

        let deadline = Instant::now() + self.inner.settings.input_wait_timeout;
        let mut session = loop {
            let turn = tokio::time::timeout_at(deadline, wait_for_turn(rx.clone(), cycle, sequence))
                .await
                .map_err(|_| SessionError::InputTimeout(sequence))?;
            if let Some(err) = turn_error(turn, id, sequence) {
                return Err(err);
            }

            // Another call may have taken the slot between wake-up and lock.
            let session = handle.lock().await;
            match session.inbound.cursor().turn(cycle, sequence) {
                Some(Turn::Ready) => break session,
                Some(turn) => return Err(turn_error(turn, id, sequence).unwrap_or_else(not_found)),
                None => drop(session),
            }
        };

        let process = session.process.clone().ok_or_else(not_found)?;
        session.inbound.advance(sequence);
        session.touch();

        let payload = request.data.unwrap_or_default();
        if payload.is_empty() {
            tracing::trace!(session_id = %id, sequence, "Empty input tick");
            return Ok(false);
        }

        let bytes = decode_chunk(&payload).map_err(|e| SessionError::InvalidPayload {
            sequence,
            reason: e.to_string(),
        })?;
        process.write(&bytes)?;
        session.history.push(payload);

        tracing::trace!(session_id = %id, sequence, len = bytes.len(), "Input applied");
        Ok(true)
    }

    /// Resize the session's terminal. Missing dimensions keep their value.
    pub async fn resize(&self, request: ResizeRequest) -> Result<(), SessionError> {
        let handle = self
            .inner
            .store
            .get(&request.id)
            .ok_or(SessionError::ResizeTargetMissing)?;
        let session = handle.lock().await;
        let process = session
            .process
            .as_ref()
            .ok_or(SessionError::ResizeTargetMissing)?;

        let (cols, rows) = process.size();
        let cols = request.cols.filter(|c| *c > 0).unwrap_or(cols);
        let rows = request.rows.filter(|r| *r > 0).unwrap_or(rows);
        process.resize(cols, rows)?;

        tracing::debug!(session_id = %request.id, cols, rows, "Session resized");
        Ok(())
    }

    /// Tear a session down. Returns whether a process was attached.
    pub async fn close(&self, id: &str) -> bool {
        match self.discard(id).await {
            Some(had_process) => {
                tracing::info!(session_id = %id, had_process, "Session closed");
                had_process
            }
            None => false,
        }
    }

    /// Stop retransmitting an output chunk of the current cycle.
    pub async fn consume_confirm(&self, request: ConsumeConfirmRequest) -> Result<(), SessionError> {
        let id = required(Some(request.id.as_str()), "id")?;
        let not_found = || SessionError::ProcessNotFound(id.to_string());

        let handle = self.inner.store.get(id).ok_or_else(not_found)?;
        let session = handle.lock().await;
        let subscription = session.subscription.as_ref().ok_or_else(not_found)?;
        subscription.delivery.confirm(request.sequence);
        Ok(())
    }

    /// Close every session and tell the peer why.
    pub async fn shutdown(&self) {
        let ids = self.inner.store.ids();
        tracing::info!(sessions = ids.len(), "Closing all sessions");

        for id in ids {
            if self.discard(&id).await.is_some() {
                let notice = self.notify_closed(&id, CloseReason::Shutdown, None);
                if tokio::time::timeout(SHUTDOWN_NOTICE_TIMEOUT, notice).await.is_err() {
                    tracing::warn!(session_id = %id, "Closure notice timed out");
                }
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Number of sessions in the store, waiting or running.
    pub fn session_count(&self) -> usize {
        self.inner.store.len()
    }

    /// Number of sessions with a live shell.
    pub fn process_count(&self) -> usize {
        self.inner.live_processes.load(Ordering::SeqCst)
    }

    /// Status of a session, or `None` once it has been removed.
    pub async fn status(&self, id: &str) -> Option<SessionStatus> {
        let handle = self.inner.store.get(id)?;
        let session = handle.lock().await;
        Some(session.status)
    }

    /// Snapshot of one session.
    pub async fn info(&self, id: &str) -> Option<SessionInfo> {
        let handle = self.inner.store.get(id)?;
        let session = handle.lock().await;
        Some(session.info())
    }

    /// Snapshot of every session, sorted by id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for handle in self.inner.store.handles() {
            infos.push(handle.lock().await.info());
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    // ========================================================================
    // Process events
    // ========================================================================

    async fn on_output(&self, id: &str, bytes: Vec<u8>) {
        let Some(handle) = self.inner.store.get(id) else {
            return;
        };
        let mut session = handle.lock().await;
        if session.is_destroyed() {
            return;
        }

        session.outbound_sequence += 1;
        let sequence = session.outbound_sequence;
        let content = encode_chunk(&bytes);
        session.history.push(content.clone());
        session.touch();

        match &session.subscription {
            Some(subscription) => subscription.delivery.enqueue(sequence, content),
            None => tracing::debug!(session_id = %id, sequence, "Output with no subscriber"),
        }
    }

    async fn on_exit(&self, id: &str, code: Option<i32>) {
        if self.discard(id).await.is_some() {
            tracing::info!(session_id = %id, exit_code = ?code, "Shell exited");
            self.notify_closed(id, CloseReason::Exit, code).await;
        }
    }

    /// Idle timer callback. Renewals that raced the timer win.
    async fn expire(&self, id: &str) {
        let Some(handle) = self.inner.store.get(id) else {
            return;
        };
        {
            let mut session = handle.lock().await;
            let expired = !session.is_destroyed()
                && session
                    .idle_timer
                    .as_ref()
                    .is_some_and(|timer| timer.is_expired());
            if !expired {
                return;
            }
            self.destroy_locked(&mut session);
        }

        tracing::info!(session_id = %id, "Session reclaimed after inactivity");
        self.notify_closed(id, CloseReason::Idle, None).await;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn spawn_process(&self, request: &ConnectRequest) -> Result<Arc<dyn PtyProcess>, SessionError> {
        let settings = &self.inner.settings;
        let max = settings.max_sessions;
        self.inner
            .live_processes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| SessionError::LimitReached(max))?;

        let mut env = HashMap::from([("TERM".to_string(), DEFAULT_TERM.to_string())]);
        if let Some(extra) = &request.env {
            env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let options = SpawnOptions {
            shell: settings.shell.clone(),
            args: request.args.clone().unwrap_or_default(),
            cols: request.cols.filter(|c| *c > 0).unwrap_or(settings.cols),
            rows: request.rows.filter(|r| *r > 0).unwrap_or(settings.rows),
            cwd: request
                .cwd
                .as_deref()
                .filter(|cwd| !cwd.is_empty())
                .map(PathBuf::from)
                .or_else(|| settings.cwd.clone()),
            env,
        };

        self.inner.spawner.spawn(options).inspect_err(|e| {
            self.inner.live_processes.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("Failed to spawn shell: {}", e);
        })
    }

    /// Forward process events to the engine until the guard drops.
    fn start_pump(&self, id: &str, process: &Arc<dyn PtyProcess>) -> DropGuard {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut events = process.subscribe();
        let engine = Arc::downgrade(&self.inner);
        let id = id.to_string();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(engine) = SessionEngine::upgrade(&engine) else {
                    break;
                };
                match event {
                    Some(PtyEvent::Output(bytes)) => engine.on_output(&id, bytes).await,
                    Some(PtyEvent::Exit(code)) => {
                        engine.on_exit(&id, code).await;
                        break;
                    }
                    None => {
                        engine.on_exit(&id, None).await;
                        break;
                    }
                }
            }
        });

        cancel.drop_guard()
    }

    fn idle_timer(&self, id: &str, timeout: Duration) -> IdleTimer {
        let engine = Arc::downgrade(&self.inner);
        let id = id.to_string();
        IdleTimer::start(timeout, move || {
            let engine = engine.clone();
            let id = id.clone();
            async move {
                if let Some(engine) = SessionEngine::upgrade(&engine) {
                    engine.expire(&id).await;
                }
            }
        })
    }

    fn upgrade(inner: &Weak<EngineInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Remove and destroy a session. `None` if it was already gone.
    async fn discard(&self, id: &str) -> Option<bool> {
        let handle = self.inner.store.get(id)?;
        let mut session = handle.lock().await;
        if session.is_destroyed() {
            return None;
        }
        Some(self.destroy_locked(&mut session))
    }

    fn destroy_locked(&self, session: &mut Session) -> bool {
        self.inner.store.remove(&session.id);
        let had_process = session.destroy();
        if had_process {
            self.inner.live_processes.fetch_sub(1, Ordering::SeqCst);
        }
        had_process
    }

    async fn notify_closed(&self, id: &str, reason: CloseReason, exit_code: Option<i32>) {
        let event = TerminalEvent::Closed(ClosePush { reason, exit_code });
        if let Err(e) = self.inner.transport.push(id, &event).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to deliver closure notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ScriptedSpawner;
    use crate::transport::{memory_transport, MemoryPeer, Pushed};
    use protocol::OutputPush;

    const WAIT: Duration = Duration::from_secs(2);

    fn settings() -> EngineSettings {
        EngineSettings {
            shell: "/bin/sh".to_string(),
            cols: 120,
            rows: 80,
            cwd: None,
            idle_timeout: Duration::from_secs(60),
            input_wait_timeout: Duration::from_millis(500),
            retransmit_interval: Duration::from_millis(50),
            max_sessions: 4,
        }
    }

    fn engine_with(
        settings: EngineSettings,
        confirmations: bool,
    ) -> (SessionEngine, Arc<ScriptedSpawner>, MemoryPeer) {
        let spawner = ScriptedSpawner::new();
        let (link, peer) = memory_transport(confirmations);
        let engine = SessionEngine::new(settings, spawner.clone(), link.sender);
        (engine, spawner, peer)
    }

    fn engine() -> (SessionEngine, Arc<ScriptedSpawner>, MemoryPeer) {
        engine_with(settings(), false)
    }

    fn connect(id: &str) -> ConnectRequest {
        ConnectRequest {
            id: Some(id.to_string()),
            ..ConnectRequest::default()
        }
    }

    fn data(id: &str, payload: &str, sequence: u64) -> DataRequest {
        DataRequest {
            id: id.to_string(),
            data: Some(payload.to_string()),
            sequence,
        }
    }

    fn output(sequence: u64, content: &str) -> TerminalEvent {
        TerminalEvent::Output(OutputPush {
            content: content.to_string(),
            sequence,
        })
    }

    async fn wait_for_history(engine: &SessionEngine, id: &str, len: usize) {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if engine.info(id).await.map(|info| info.history_len) == Some(len) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("history of {} never reached {}", id, len);
    }

    #[tokio::test]
    async fn test_handshake_reserves_waiting_session() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();

        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(engine.status(&id).await, Some(SessionStatus::Waiting));
        assert_eq!(engine.session_count(), 1);
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_spawns_with_defaults() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();

        let history = engine.connect(connect(&id)).await.unwrap();
        assert!(history.is_empty());
        assert_eq!(engine.status(&id).await, Some(SessionStatus::Running));

        let process = spawner.last().unwrap();
        let options = process.options();
        assert_eq!(options.shell, "/bin/sh");
        assert_eq!((options.cols, options.rows), (120, 80));
        assert_eq!(options.env.get("TERM").map(String::as_str), Some(DEFAULT_TERM));
        assert_eq!(engine.process_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_applies_overrides() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();

        let request = ConnectRequest {
            id: Some(id.clone()),
            die_timeout: Some(5_000),
            args: Some(vec!["-l".to_string()]),
            cols: Some(90),
            rows: Some(0),
            cwd: Some("/tmp".to_string()),
            env: Some(HashMap::from([("TERM".to_string(), "dumb".to_string())])),
        };
        engine.connect(request).await.unwrap();

        let options = spawner.last().unwrap().options().clone();
        assert_eq!(options.args, vec!["-l".to_string()]);
        assert_eq!((options.cols, options.rows), (90, 80));
        assert_eq!(options.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(options.env.get("TERM").map(String::as_str), Some("dumb"));
        assert_eq!(engine.info(&id).await.unwrap().idle_timeout_ms, 5_000);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_idle_timeout() {
        let (engine, _spawner, _peer) = engine();
        let id = engine.handshake();
        assert_eq!(engine.info(&id).await.unwrap().idle_timeout_ms, 60_000);

        let request = ConnectRequest {
            die_timeout: Some(5_000),
            ..connect(&id)
        };
        engine.connect(request).await.unwrap();
        assert_eq!(engine.info(&id).await.unwrap().idle_timeout_ms, 5_000);

        engine.connect(connect(&id)).await.unwrap();
        assert_eq!(engine.info(&id).await.unwrap().idle_timeout_ms, 5_000);

        let request = ConnectRequest {
            die_timeout: Some(8_000),
            ..connect(&id)
        };
        engine.connect(request).await.unwrap();
        assert_eq!(engine.info(&id).await.unwrap().idle_timeout_ms, 8_000);
    }

    #[tokio::test]
    async fn test_connect_validation() {
        let (engine, _spawner, _peer) = engine();

        let err = engine.connect(ConnectRequest::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "Parameter 'id' must be specified");

        let err = engine.connect(connect("")).await.unwrap_err();
        assert_eq!(err.to_string(), "Parameter 'id' must be specified");

        let err = engine.connect(connect("missing")).await.unwrap_err();
        assert_eq!(err.to_string(), "PTY missing is not waiting or not running");
    }

    #[tokio::test]
    async fn test_failed_spawn_leaves_session_waiting() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();
        spawner.fail_spawns(true);

        let err = engine.connect(connect(&id)).await.unwrap_err();
        assert!(matches!(err, SessionError::SpawnFailed(_)));
        assert_eq!(engine.status(&id).await, Some(SessionStatus::Waiting));
        assert_eq!(engine.process_count(), 0);

        spawner.fail_spawns(false);
        assert!(engine.connect(connect(&id)).await.is_ok());
    }

    #[tokio::test]
    async fn test_process_limit() {
        let mut limited = settings();
        limited.max_sessions = 1;
        let (engine, _spawner, _peer) = engine_with(limited, false);

        let first = engine.handshake();
        let second = engine.handshake();
        engine.connect(connect(&first)).await.unwrap();

        let err = engine.connect(connect(&second)).await.unwrap_err();
        assert!(matches!(err, SessionError::LimitReached(1)));

        assert!(engine.close(&first).await);
        engine.connect(connect(&second)).await.unwrap();
    }

    #[tokio::test]
    async fn test_output_is_sequenced_and_recorded() {
        let (engine, spawner, mut peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        let process = spawner.last().unwrap();
        process.emit(b"hello");
        process.emit(b"world");

        let first = peer.next_push(WAIT).await.unwrap();
        let second = peer.next_push(WAIT).await.unwrap();
        assert_eq!(
            first,
            Pushed {
                session_id: id.clone(),
                event: output(1, "aGVsbG8="),
            }
        );
        assert_eq!(second.event, output(2, "d29ybGQ="));

        let info = engine.info(&id).await.unwrap();
        assert_eq!(info.outbound_sequence, 2);
        assert_eq!(info.history_len, 2);
    }

    #[tokio::test]
    async fn test_reconnect_reuses_process_and_replays() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        let process = spawner.last().unwrap();
        process.emit(b"one");
        process.emit(b"two");
        wait_for_history(&engine, &id, 2).await;

        let history = engine.connect(connect(&id)).await.unwrap();
        assert_eq!(history, vec!["b25l".to_string(), "dHdv".to_string()]);
        assert_eq!(spawner.spawn_count(), 1);

        let info = engine.info(&id).await.unwrap();
        assert_eq!(info.cycle, 2);
        assert_eq!(info.outbound_sequence, 0);
        assert_eq!(info.inbound_sequence, 0);
    }

    #[tokio::test]
    async fn test_data_writes_in_order() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        let third = tokio::spawn({
            let engine = engine.clone();
            let id = id.clone();
            async move { engine.data(data(&id, "Yw==", 3)).await }
        });
        let second = tokio::spawn({
            let engine = engine.clone();
            let id = id.clone();
            async move { engine.data(data(&id, "Yg==", 2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.data(data(&id, "YQ==", 1)).await.unwrap());
        assert!(second.await.unwrap().unwrap());
        assert!(third.await.unwrap().unwrap());

        assert_eq!(spawner.last().unwrap().written(), b"abc");
        assert_eq!(engine.info(&id).await.unwrap().inbound_sequence, 3);
    }

    #[tokio::test]
    async fn test_data_duplicate_rejected() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        assert!(engine.data(data(&id, "YQ==", 1)).await.unwrap());
        let err = engine.data(data(&id, "YQ==", 1)).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::DuplicateSequence {
                sequence: 1,
                applied: 1
            }
        ));
        assert_eq!(spawner.last().unwrap().written(), b"a");
    }

    #[tokio::test]
    async fn test_data_times_out_without_consuming() {
        let (engine, _spawner, _peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        let err = engine.data(data(&id, "Yg==", 2)).await.unwrap_err();
        assert_eq!(err.to_string(), "timed out waiting for sequence 2");
        assert_eq!(engine.info(&id).await.unwrap().inbound_sequence, 0);
    }

    #[tokio::test]
    async fn test_empty_tick_consumes_slot() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        let tick = DataRequest {
            id: id.clone(),
            data: None,
            sequence: 1,
        };
        assert!(!engine.data(tick).await.unwrap());
        assert!(engine.data(data(&id, "YQ==", 2)).await.unwrap());
        assert_eq!(spawner.last().unwrap().written(), b"a");
    }

    #[tokio::test]
    async fn test_invalid_payload_consumes_slot() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        let err = engine.data(data(&id, "%%%", 1)).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidPayload { sequence: 1, .. }));
        assert!(engine.data(data(&id, "YQ==", 2)).await.unwrap());
        assert_eq!(spawner.last().unwrap().written(), b"a");
    }

    #[tokio::test]
    async fn test_data_records_input_in_history() {
        let (engine, _spawner, _peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        engine.data(data(&id, "bHM=", 1)).await.unwrap();
        let history = engine.connect(connect(&id)).await.unwrap();
        assert_eq!(history, vec!["bHM=".to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_rejects_stale_waiters() {
        let (engine, _spawner, _peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        let waiter = tokio::spawn({
            let engine = engine.clone();
            let id = id.clone();
            async move { engine.data(data(&id, "Yg==", 2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.connect(connect(&id)).await.unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::CycleReset(2)));
        assert!(engine.data(data(&id, "YQ==", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let (engine, _spawner, _peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        let waiter = tokio::spawn({
            let engine = engine.clone();
            let id = id.clone();
            async move { engine.data(data(&id, "Yg==", 2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.close(&id).await);

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), format!("PTY process {} not found", id));
    }

    #[tokio::test]
    async fn test_data_without_process() {
        let (engine, _spawner, _peer) = engine();
        let id = engine.handshake();

        let err = engine.data(data(&id, "YQ==", 1)).await.unwrap_err();
        assert!(matches!(err, SessionError::ProcessNotFound(_)));
        let err = engine.data(data("nope", "YQ==", 1)).await.unwrap_err();
        assert_eq!(err.to_string(), "PTY process nope not found");
    }

    #[tokio::test]
    async fn test_resize() {
        let (engine, spawner, _peer) = engine();
        let id = engine.handshake();

        let err = engine
            .resize(ResizeRequest {
                id: id.clone(),
                cols: Some(100),
                rows: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot find pty process");

        engine.connect(connect(&id)).await.unwrap();
        engine
            .resize(ResizeRequest {
                id: id.clone(),
                cols: Some(100),
                rows: None,
            })
            .await
            .unwrap();
        assert_eq!(spawner.last().unwrap().size(), (100, 80));
    }

    #[tokio::test]
    async fn test_close_semantics() {
        let (engine, spawner, mut peer) = engine();

        let waiting = engine.handshake();
        assert!(!engine.close(&waiting).await);
        assert_eq!(engine.status(&waiting).await, None);

        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();
        assert!(engine.close(&id).await);
        assert!(spawner.last().unwrap().is_killed());
        assert!(!engine.close(&id).await);
        assert!(!engine.close("unknown").await);

        assert_eq!(engine.session_count(), 0);
        assert_eq!(engine.process_count(), 0);
        // Explicit close sends no notice.
        assert!(peer.next_push(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_exit_tears_down_and_notifies() {
        let (engine, spawner, mut peer) = engine();
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        spawner.last().unwrap().exit(Some(3));
        let pushed = peer.next_push(WAIT).await.unwrap();
        assert_eq!(
            pushed.event,
            TerminalEvent::Closed(ClosePush {
                reason: CloseReason::Exit,
                exit_code: Some(3),
            })
        );
        assert_eq!(engine.status(&id).await, None);
        assert_eq!(engine.process_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_expiry() {
        let (engine, spawner, mut peer) = engine();
        let id = engine.handshake();
        let request = ConnectRequest {
            die_timeout: Some(50),
            ..connect(&id)
        };
        engine.connect(request).await.unwrap();

        let pushed = peer.next_push(WAIT).await.unwrap();
        assert_eq!(
            pushed.event,
            TerminalEvent::Closed(ClosePush {
                reason: CloseReason::Idle,
                exit_code: None,
            })
        );
        assert_eq!(engine.status(&id).await, None);
        assert!(spawner.last().unwrap().is_killed());
    }

    #[tokio::test]
    async fn test_activity_postpones_expiry() {
        let (engine, _spawner, _peer) = engine();
        let id = engine.handshake();
        let request = ConnectRequest {
            die_timeout: Some(150),
            ..connect(&id)
        };
        engine.connect(request).await.unwrap();

        for sequence in 1..=4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            engine.data(data(&id, "YQ==", sequence)).await.unwrap();
        }
        assert_eq!(engine.status(&id).await, Some(SessionStatus::Running));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(engine.status(&id).await, None);
    }

    #[tokio::test]
    async fn test_waiting_reservation_expires() {
        let mut short = settings();
        short.idle_timeout = Duration::from_millis(30);
        let (engine, _spawner, _peer) = engine_with(short, false);

        let id = engine.handshake();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.status(&id).await, None);
    }

    #[tokio::test]
    async fn test_consume_confirm_stops_retransmission() {
        let (engine, spawner, mut peer) = engine_with(settings(), true);
        let id = engine.handshake();
        engine.connect(connect(&id)).await.unwrap();

        spawner.last().unwrap().emit(b"x");
        assert_eq!(peer.next_push(WAIT).await.unwrap().event, output(1, "eA=="));
        assert_eq!(peer.next_push(WAIT).await.unwrap().event, output(1, "eA=="));

        engine
            .consume_confirm(ConsumeConfirmRequest {
                id: id.clone(),
                sequence: 1,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.drain_pushes();
        assert!(peer.next_push(Duration::from_millis(150)).await.is_none());

        let err = engine
            .consume_confirm(ConsumeConfirmRequest {
                id: "nope".to_string(),
                sequence: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ProcessNotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (engine, _spawner, mut peer) = engine();
        let running = engine.handshake();
        engine.connect(connect(&running)).await.unwrap();
        engine.handshake();

        engine.shutdown().await;
        assert_eq!(engine.session_count(), 0);

        let mut reasons: Vec<TerminalEvent> = peer.drain_pushes().into_iter().map(|p| p.event).collect();
        reasons.dedup();
        assert_eq!(
            reasons,
            vec![TerminalEvent::Closed(ClosePush {
                reason: CloseReason::Shutdown,
                exit_code: None,
            })]
        );
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let (engine, _spawner, _peer) = engine();
        let a = engine.handshake();
        let b = engine.handshake();
        engine.connect(connect(&a)).await.unwrap();

        let infos = engine.list().await;
        assert_eq!(infos.len(), 2);
        let running = infos.iter().find(|info| info.id == a).unwrap();
        assert_eq!(running.status, SessionStatus::Running);
        assert_eq!(running.pid, Some(1000));
        assert_eq!((running.cols, running.rows), (120, 80));
        let waiting = infos.iter().find(|info| info.id == b).unwrap();
        assert_eq!(waiting.status, SessionStatus::Waiting);
    }
}
