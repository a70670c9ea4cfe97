use thiserror::Error;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors raised by terminal session operations.
///
/// The engine converts every one of these into `{accepted: false, error}`
/// before it reaches the dispatcher; the messages are what the peer sees.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A required request parameter was missing or empty.
    #[error("Parameter '{0}' must be specified")]
    MissingParameter(&'static str),

    /// A request field had the wrong shape.
    #[error("Invalid parameters for '{operation}': {reason}")]
    InvalidParameters {
        operation: &'static str,
        reason: String,
    },

    /// `connect` on an id that is unknown or already destroyed.
    #[error("PTY {0} is not waiting or not running")]
    NotConnectable(SessionId),

    /// Input or confirmation for a session without a live process.
    #[error("PTY process {0} not found")]
    ProcessNotFound(SessionId),

    /// Resize for a session without a live process.
    #[error("Cannot find pty process")]
    ResizeTargetMissing,

    /// Too many live shell processes.
    #[error("session limit of {0} reached")]
    LimitReached(usize),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The input chunk is not valid base64.
    #[error("invalid payload encoding for sequence {sequence}: {reason}")]
    InvalidPayload { sequence: u64, reason: String },

    /// The sequence was already applied in this connect cycle.
    #[error("sequence {sequence} already applied (last applied {applied})")]
    DuplicateSequence { sequence: u64, applied: u64 },

    /// The earlier sequences never arrived.
    #[error("timed out waiting for sequence {0}")]
    InputTimeout(u64),

    /// A new `connect` reset the counters while this input was waiting.
    #[error("connect cycle reset while sequence {0} was waiting")]
    CycleReset(u64),
}
