//! Terminal session engine.
//!
//! A session is reserved by `handshake`, gets a shell on `connect`, and is
//! destroyed by `close`, process exit or inactivity. Input and output are
//! sequenced per connect cycle; see [`sequencer`].

pub mod engine;
pub mod error;
pub mod pty;
pub mod reaper;
pub mod sequencer;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use engine::{EngineSettings, SessionEngine};
pub use error::{SessionError, SessionId};
pub use pty::{NativePty, NativePtySpawner, PtyEvent, PtyProcess, PtySpawner, SpawnOptions};
pub use reaper::IdleTimer;
pub use sequencer::{Delivery, InboundCursor, InboundGate, Turn};
pub use store::{Session, SessionInfo, SessionStatus, SessionStore};
