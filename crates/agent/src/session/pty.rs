//! Pseudo-terminal process adapter.
//!
//! The engine only ever sees [`PtyProcess`] and [`PtySpawner`]; the native
//! implementation below drives a real shell through `portable-pty`.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::error::SessionError;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Events kept while no listener is attached. Oldest are dropped first.
const MAX_BACKLOG_EVENTS: usize = 1024;

/// Something the process did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw bytes read from the PTY master.
    Output(Vec<u8>),
    /// The process is gone. Carries the exit code when it could be reaped.
    Exit(Option<i32>),
}

/// Everything needed to start a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOptions {
    pub shell: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// A running process attached to a pseudo-terminal.
pub trait PtyProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Current `(cols, rows)`.
    fn size(&self) -> (u16, u16);

    fn write(&self, data: &[u8]) -> Result<(), SessionError>;

    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    /// Attach a listener, closing the previous one. Events emitted while no
    /// listener was attached are delivered first.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent>;

    /// Best-effort termination (SIGHUP on unix). Never fails.
    fn kill(&self);
}

/// Starts processes for the engine.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, options: SpawnOptions) -> Result<Arc<dyn PtyProcess>, SessionError>;
}

/// Lock a std mutex, ignoring poisoning. The guarded state stays consistent
/// because no guard is held across a panic-prone section.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-listener event slot with a bounded backlog.
#[derive(Default)]
pub struct EventFanout {
    listener: Option<mpsc::UnboundedSender<PtyEvent>>,
    backlog: VecDeque<PtyEvent>,
}

impl EventFanout {
    pub fn emit(&mut self, event: PtyEvent) {
        let event = match self.listener.as_ref() {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    self.listener = None;
                    event
                }
            },
            None => event,
        };

        if self.backlog.len() == MAX_BACKLOG_EVENTS {
            self.backlog.pop_front();
            tracing::warn!("PTY backlog full, dropping oldest event");
        }
        self.backlog.push_back(event);
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PtyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in self.backlog.drain(..) {
            let _ = tx.send(event);
        }
        self.listener = Some(tx);
        rx
    }
}

/// Spawns shells on the host through `portable-pty`.
#[derive(Debug, Default, Clone)]
pub struct NativePtySpawner;

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, options: SpawnOptions) -> Result<Arc<dyn PtyProcess>, SessionError> {
        let process: Arc<dyn PtyProcess> = NativePty::spawn(options)?;
        Ok(process)
    }
}

/// A shell running on a native pseudo-terminal.
pub struct NativePty {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    fanout: Arc<Mutex<EventFanout>>,
    running: Arc<AtomicBool>,
    size: Mutex<(u16, u16)>,
    pid: Option<u32>,
}

impl NativePty {
    /// Open a PTY, start the shell and its read loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(options: SpawnOptions) -> Result<Arc<Self>, SessionError> {
        let spawn_err = |e: anyhow::Error| SessionError::SpawnFailed(e.to_string());

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(spawn_err)?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.args(&options.args);
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(spawn_err)?;
        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair.master.try_clone_reader().map_err(spawn_err)?;
        let writer = pair.master.take_writer().map_err(spawn_err)?;

        let process = Arc::new(NativePty {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Arc::new(Mutex::new(child)),
            fanout: Arc::new(Mutex::new(EventFanout::default())),
            running: Arc::new(AtomicBool::new(true)),
            size: Mutex::new((options.cols, options.rows)),
            pid,
        });
        process.start_read_loop(reader);

        tracing::debug!(
            shell = %options.shell,
            pid = ?pid,
            cols = options.cols,
            rows = options.rows,
            "Spawned PTY process"
        );
        Ok(process)
    }

    fn start_read_loop(&self, mut reader: Box<dyn Read + Send>) {
        let fanout = Arc::clone(&self.fanout);
        let child = Arc::clone(&self.child);
        let running = Arc::clone(&self.running);
        let pid = self.pid;

        tokio::task::spawn_blocking(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => lock(&fanout).emit(PtyEvent::Output(buffer[..n].to_vec())),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a hung-up master.
                        tracing::trace!(pid = ?pid, error = %e, "PTY read ended");
                        break;
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
            let code = match lock(&child).wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    tracing::debug!(pid = ?pid, error = %e, "Failed to reap PTY child");
                    None
                }
            };
            tracing::debug!(pid = ?pid, exit_code = ?code, "PTY process exited");
            lock(&fanout).emit(PtyEvent::Exit(code));
        });
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl PtyProcess for NativePty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn size(&self) -> (u16, u16) {
        *lock(&self.size)
    }

    fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::WriteFailed("process has exited".to_string()));
        }
        let mut writer = lock(&self.writer);
        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *lock(&self.size) = (cols, rows);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent> {
        lock(&self.fanout).subscribe()
    }

    fn kill(&self) {
        if !self.is_running() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                Ok(()) => return,
                Err(e) => tracing::debug!(pid, error = %e, "SIGHUP failed, killing child"),
            }
        }

        if let Err(e) = lock(&self.child).kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "Failed to kill PTY child");
        }
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        self.kill();
    }
}
