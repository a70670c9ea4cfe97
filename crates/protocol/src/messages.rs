//! Message definitions for the agent link.
//!
//! Three layers live here:
//!
//! - channel envelopes ([`ChannelRequest`] / [`ChannelResponse`]) that the
//!   control plane routes to the agent by scope,
//! - the terminal channel schema ([`TerminalRequest`] and its responses and
//!   push payloads),
//! - [`LinkMessage`], the frames exchanged over a room or socket link.
//!
//! Field names on the wire are camelCase to match the control plane.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Scope under which the terminal channel is registered.
pub const TERMINAL_SCOPE: &str = "terminal";

// ============================================================================
// Channel envelopes
// ============================================================================

/// A request routed to the agent: `{id, scope, options}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRequest {
    /// Request id, echoed back in the response.
    pub id: String,
    /// Scope selecting the channel handler.
    pub scope: String,
    /// Handler-specific payload.
    #[serde(default)]
    pub options: Value,
}

/// Response to a [`ChannelRequest`]: `{requestId, data, errored}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelResponse {
    pub request_id: String,
    pub data: Value,
    pub errored: bool,
}

impl ChannelResponse {
    pub fn ok(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            data,
            errored: false,
        }
    }

    pub fn error(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            data,
            errored: true,
        }
    }
}

// ============================================================================
// Terminal channel
// ============================================================================

/// Terminal channel operation, selected by `options.type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalRequest {
    /// Reserve a session id.
    Handshake,
    /// Spawn or re-attach the session's process.
    Connect(ConnectRequest),
    /// Deliver one sequenced input chunk.
    Data(DataRequest),
    /// Change the terminal geometry.
    Resize(ResizeRequest),
    /// Tear the session down.
    Close(CloseRequest),
    /// Confirm that an output chunk was consumed.
    ConsumeConfirm(ConsumeConfirmRequest),
}

impl TerminalRequest {
    /// Every value `options.type` may take.
    pub const KINDS: [&'static str; 6] = [
        "handshake",
        "connect",
        "data",
        "resize",
        "close",
        "consume_confirm",
    ];

    /// Operation name, as it appears in `options.type`.
    pub fn kind(&self) -> &'static str {
        match self {
            TerminalRequest::Handshake => "handshake",
            TerminalRequest::Connect(_) => "connect",
            TerminalRequest::Data(_) => "data",
            TerminalRequest::Resize(_) => "resize",
            TerminalRequest::Close(_) => "close",
            TerminalRequest::ConsumeConfirm(_) => "consume_confirm",
        }
    }
}

/// Connect parameters. Everything except `id` falls back to agent defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectRequest {
    pub id: Option<String>,
    /// Idle timeout override in milliseconds.
    pub die_timeout: Option<u64>,
    pub args: Option<Vec<String>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

/// One input chunk. `data` is base64; empty or missing means a no-op tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataRequest {
    pub id: String,
    pub data: Option<String>,
    pub sequence: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResizeRequest {
    pub id: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloseRequest {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeConfirmRequest {
    pub id: String,
    pub sequence: u64,
}

/// Handshake result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub id: String,
}

/// Connect result. `content` is the session history on success, `null` on
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub accepted: bool,
    pub content: Option<Vec<String>>,
    pub error: Option<String>,
}

impl ConnectResponse {
    pub fn accepted(content: Vec<String>) -> Self {
        Self {
            accepted: true,
            content: Some(content),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            content: None,
            error: Some(error.into()),
        }
    }
}

/// Result of data, resize, close and consume_confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub accepted: bool,
    pub error: Option<String>,
}

impl OperationResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            error: None,
        }
    }

    /// Not accepted, but nothing went wrong (no-op tick, closing an absent
    /// process).
    pub fn declined() -> Self {
        Self {
            accepted: false,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            error: Some(error.into()),
        }
    }
}

/// Output chunk pushed on `terminal:{id}:recv_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPush {
    pub content: String,
    pub sequence: u64,
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The shell process exited.
    Exit,
    /// No activity within the idle timeout.
    Idle,
    /// The agent is shutting down.
    Shutdown,
}

/// Closure notice pushed on `terminal:{id}:close`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosePush {
    pub reason: CloseReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Input streamed by the peer on `terminal:{id}:send_data`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPush {
    pub data: Option<String>,
    pub sequence: u64,
}

/// Confirmation streamed by the peer on `terminal:{id}:consume_confirm_data`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeConfirmPush {
    pub sequence: u64,
}

// ============================================================================
// Stream event ids
// ============================================================================

/// The per-session event kinds carried on the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
    /// Agent to peer: output chunk.
    RecvData,
    /// Agent to peer: session closed.
    Close,
    /// Peer to agent: input chunk.
    SendData,
    /// Peer to agent: output chunk consumed.
    ConsumeConfirm,
}

impl StreamEventKind {
    fn as_str(self) -> &'static str {
        match self {
            StreamEventKind::RecvData => "recv_data",
            StreamEventKind::Close => "close",
            StreamEventKind::SendData => "send_data",
            StreamEventKind::ConsumeConfirm => "consume_confirm_data",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "recv_data" => Some(StreamEventKind::RecvData),
            "close" => Some(StreamEventKind::Close),
            "send_data" => Some(StreamEventKind::SendData),
            "consume_confirm_data" => Some(StreamEventKind::ConsumeConfirm),
            _ => None,
        }
    }
}

/// A gateway event id of the form `terminal:{session_id}:{kind}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamEventId {
    pub session_id: String,
    pub kind: StreamEventKind,
}

impl StreamEventId {
    pub fn new(session_id: impl Into<String>, kind: StreamEventKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
        }
    }

    /// Parse an event id. The session id may not contain `:`.
    pub fn parse(event_id: &str) -> Result<Self> {
        let invalid = || ProtocolError::InvalidEventId(event_id.to_string());
        let mut parts = event_id.splitn(3, ':');
        let scope = parts.next().ok_or_else(invalid)?;
        let session_id = parts.next().ok_or_else(invalid)?;
        let kind = parts.next().and_then(StreamEventKind::parse);
        match kind {
            Some(kind) if scope == TERMINAL_SCOPE && !session_id.is_empty() => {
                Ok(Self::new(session_id, kind))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for StreamEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            TERMINAL_SCOPE,
            self.session_id,
            self.kind.as_str()
        )
    }
}

// ============================================================================
// Link messages
// ============================================================================

/// Stream payload addressed to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStream {
    pub event_id: String,
    pub room_id: String,
    pub data: Value,
}

/// Frames exchanged with the control plane over a room or socket link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LinkMessage {
    /// Socket authentication, first frame from the agent.
    Hello { client_key: String },
    /// Join the room named after the client id.
    Join { room_id: String },
    /// Routed request for a channel handler.
    ChannelRequest(ChannelRequest),
    /// Response to a routed request.
    ChannelResponse(ChannelResponse),
    /// Per-session stream event, in either direction.
    ChannelStream(ChannelStream),
    /// Keepalive.
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    /// Link-level failure reported by the peer.
    Error { message: String },
}

impl LinkMessage {
    /// Serialize to MessagePack with named fields.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
