//! Scripted PTY doubles.
//!
//! [`ScriptedSpawner`] hands out [`ScriptedProcess`]es that record what the
//! engine writes and emit whatever output the test asks for. Compiled for
//! unit tests and behind the `testing` feature.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::error::SessionError;
use super::pty::{lock, EventFanout, PtyEvent, PtyProcess, PtySpawner, SpawnOptions};

pub struct ScriptedProcess {
    pid: u32,
    options: SpawnOptions,
    size: Mutex<(u16, u16)>,
    written: Mutex<Vec<u8>>,
    fanout: Mutex<EventFanout>,
    killed: AtomicBool,
}

impl ScriptedProcess {
    fn new(pid: u32, options: SpawnOptions) -> Self {
        Self {
            pid,
            size: Mutex::new((options.cols, options.rows)),
            options,
            written: Mutex::new(Vec::new()),
            fanout: Mutex::new(EventFanout::default()),
            killed: AtomicBool::new(false),
        }
    }

    /// Pretend the shell printed `bytes`.
    pub fn emit(&self, bytes: &[u8]) {
        lock(&self.fanout).emit(PtyEvent::Output(bytes.to_vec()));
    }

    /// Pretend the shell exited.
    pub fn exit(&self, code: Option<i32>) {
        lock(&self.fanout).emit(PtyEvent::Exit(code));
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.written).clone()
    }

    pub fn options(&self) -> &SpawnOptions {
        &self.options
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl PtyProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.is_killed() {
            return Err(SessionError::WriteFailed("process killed".to_string()));
        }
        lock(&self.written).extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        *lock(&self.size) = (cols, rows);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent> {
        lock(&self.fanout).subscribe()
    }

    fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            lock(&self.fanout).emit(PtyEvent::Exit(None));
        }
    }
}

/// Spawner that records every process it creates.
#[derive(Default)]
pub struct ScriptedSpawner {
    next_pid: AtomicU32,
    fail: AtomicBool,
    spawned: Mutex<Vec<Arc<ScriptedProcess>>>,
}

impl ScriptedSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent spawns fail.
    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        lock(&self.spawned).len()
    }

    pub fn last(&self) -> Option<Arc<ScriptedProcess>> {
        lock(&self.spawned).last().cloned()
    }
}

impl PtySpawner for ScriptedSpawner {
    fn spawn(&self, options: SpawnOptions) -> Result<Arc<dyn PtyProcess>, SessionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::SpawnFailed(format!(
                "cannot start {}",
                options.shell
            )));
        }
        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = Arc::new(ScriptedProcess::new(pid, options));
        lock(&self.spawned).push(process.clone());
        let process: Arc<dyn PtyProcess> = process;
        Ok(process)
    }
}
