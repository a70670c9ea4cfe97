//! # Remote Agent Protocol Library
//!
//! Wire types shared by the agent and anything that talks to it.
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Terminal channel requests / pushes    │  JSON values, base64 chunks
//! ├─────────────────────────────────────────┤
//! │   Channel envelopes (scope routing)     │  {id, scope, options}
//! ├─────────────────────────────────────────┤
//! │            Link messages                │  JSON (room) or MessagePack
//! ├─────────────────────────────────────────┤
//! │     Framing (socket link only)          │  Length-prefixed, LZ4
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use protocol::{ChannelRequest, Frame, FrameCodec, LinkMessage};
//! use serde_json::json;
//!
//! let request = LinkMessage::ChannelRequest(ChannelRequest {
//!     id: "req-1".to_string(),
//!     scope: "terminal".to_string(),
//!     options: json!({"type": "handshake"}),
//! });
//!
//! let codec = FrameCodec::new();
//! let bytes = codec.encode(&Frame::new(request.to_msgpack().unwrap())).unwrap();
//! let (frame, _) = codec.decode(&bytes).unwrap();
//! assert_eq!(LinkMessage::from_msgpack(&frame.payload).unwrap(), request);
//! ```

pub mod encoding;
pub mod error;
pub mod framing;
pub mod messages;

pub use encoding::{client_key, decode_chunk, encode_chunk};
pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_SIZE,
};
pub use messages::{
    ChannelRequest, ChannelResponse, ChannelStream, CloseReason, ClosePush, CloseRequest,
    ConnectRequest, ConnectResponse, ConsumeConfirmPush, ConsumeConfirmRequest, DataRequest,
    HandshakeResponse, InputPush, LinkMessage, OperationResponse, OutputPush, ResizeRequest,
    StreamEventId, StreamEventKind, TerminalRequest, TERMINAL_SCOPE,
};
