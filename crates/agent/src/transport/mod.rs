//! Transports between the agent and the control plane.
//!
//! The session engine only sees [`TransportSender`]: a best-effort push of
//! a [`TerminalEvent`] for one session. Responses to routed requests go
//! through [`ResponseSender`], and everything the peer sends arrives as an
//! [`Inbound`] on a channel.
//!
//! | Kind     | Inbound            | Pushes and responses   | Confirmations |
//! |----------|--------------------|------------------------|---------------|
//! | `room`   | WebSocket room     | same room              | yes           |
//! | `socket` | framed TCP link    | same link              | no            |
//! | `http`   | WebSocket room     | HTTP callbacks         | no            |
//! | memory   | in-process channel | in-process channel     | configurable  |

pub mod http;
pub mod link;
pub mod memory;
pub mod room;
pub mod socket;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use protocol::{
    ChannelRequest, ChannelResponse, ClosePush, ConsumeConfirmPush, InputPush, LinkMessage,
    OutputPush, ProtocolError, StreamEventId, StreamEventKind,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, TransportKind};
use crate::session::SessionId;

pub use http::HttpTransport;
pub use link::{Backoff, LinkClient};
pub use memory::{memory_transport, MemoryPeer, MemoryTransport, Pushed};
pub use room::RoomDriver;
pub use socket::SocketDriver;

/// Capacity of the inbound channel shared by all transports.
pub const INBOUND_CAPACITY: usize = 1024;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Errors that can occur while talking to the control plane.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control plane answered {status} for {url}")]
    Rejected { status: u16, url: String },

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(err))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Protocol(err.into())
    }
}

/// A per-session event pushed to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// One sequenced output chunk (`terminal:{id}:recv_data`).
    Output(OutputPush),
    /// The session is gone (`terminal:{id}:close`).
    Closed(ClosePush),
}

impl TerminalEvent {
    pub fn event_id(&self, session_id: &str) -> StreamEventId {
        let kind = match self {
            TerminalEvent::Output(_) => StreamEventKind::RecvData,
            TerminalEvent::Closed(_) => StreamEventKind::Close,
        };
        StreamEventId::new(session_id, kind)
    }

    pub fn payload(&self) -> Result<Value, TransportError> {
        let value = match self {
            TerminalEvent::Output(push) => serde_json::to_value(push)?,
            TerminalEvent::Closed(push) => serde_json::to_value(push)?,
        };
        Ok(value)
    }
}

/// Best-effort delivery of session events to the peer.
pub trait TransportSender: Send + Sync {
    fn push<'a>(&'a self, session_id: &'a str, event: &'a TerminalEvent)
        -> TransportFuture<'a, ()>;

    /// Whether the peer answers output with consume-confirmations. When it
    /// does not, each chunk is pushed once.
    fn supports_confirmation(&self) -> bool;
}

/// Delivery of responses to routed requests.
pub trait ResponseSender: Send + Sync {
    fn respond(&self, response: ChannelResponse) -> TransportFuture<'_, ()>;
}

/// Something the peer sent the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A routed channel request.
    Request(ChannelRequest),
    /// Input streamed on `terminal:{id}:send_data`.
    Input {
        session_id: SessionId,
        input: InputPush,
    },
    /// Confirmation streamed on `terminal:{id}:consume_confirm_data`.
    ConsumeConfirm {
        session_id: SessionId,
        sequence: u64,
    },
}

impl Inbound {
    /// Map a link message to an inbound item. Link-level chatter and
    /// agent-bound pushes we do not understand map to `None`.
    pub fn from_link(message: LinkMessage) -> Option<Self> {
        match message {
            LinkMessage::ChannelRequest(request) => Some(Inbound::Request(request)),
            LinkMessage::ChannelStream(stream) => {
                let event = match StreamEventId::parse(&stream.event_id) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring stream event");
                        return None;
                    }
                };
                match event.kind {
                    StreamEventKind::SendData => match serde_json::from_value(stream.data) {
                        Ok(input) => Some(Inbound::Input {
                            session_id: event.session_id,
                            input,
                        }),
                        Err(e) => {
                            tracing::warn!(event_id = %stream.event_id, error = %e, "Malformed input event");
                            None
                        }
                    },
                    StreamEventKind::ConsumeConfirm => {
                        match serde_json::from_value::<ConsumeConfirmPush>(stream.data) {
                            Ok(confirm) => Some(Inbound::ConsumeConfirm {
                                session_id: event.session_id,
                                sequence: confirm.sequence,
                            }),
                            Err(e) => {
                                tracing::warn!(event_id = %stream.event_id, error = %e, "Malformed confirmation");
                                None
                            }
                        }
                    }
                    // Our own pushes echoed back by the room.
                    StreamEventKind::RecvData | StreamEventKind::Close => None,
                }
            }
            _ => None,
        }
    }
}

/// A started transport: the engine's sender, the dispatcher's responder and
/// the stream of inbound items.
pub struct TransportLink {
    pub sender: Arc<dyn TransportSender>,
    pub responder: Arc<dyn ResponseSender>,
    pub inbound: mpsc::Receiver<Inbound>,
    /// The supervised link carrying inbound traffic, if any. Dropping the
    /// last handle closes the link.
    pub link: Option<LinkClient>,
}

/// Start the transport selected by `config.transport.kind`.
///
/// Link supervisors run until `shutdown` is cancelled.
pub fn start(config: &Config, shutdown: CancellationToken) -> Result<TransportLink, TransportError> {
    let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
    let backoff = Backoff::from_config(&config.transport);
    let room_id = config.control.client_id.clone();

    let link = match config.transport.kind {
        TransportKind::Room => {
            let client = LinkClient::start(
                RoomDriver::new(&config.control)?,
                room_id,
                backoff,
                true,
                inbound_tx,
                shutdown,
            );
            let handle = Arc::new(client.clone());
            TransportLink {
                sender: handle.clone(),
                responder: handle,
                inbound,
                link: Some(client),
            }
        }
        TransportKind::Socket => {
            let client = LinkClient::start(
                SocketDriver::new(&config.control),
                room_id,
                backoff,
                false,
                inbound_tx,
                shutdown,
            );
            let handle = Arc::new(client.clone());
            TransportLink {
                sender: handle.clone(),
                responder: handle,
                inbound,
                link: Some(client),
            }
        }
        TransportKind::Http => {
            // The room still carries requests in; everything out goes over HTTP.
            let client = LinkClient::start(
                RoomDriver::new(&config.control)?,
                room_id,
                backoff,
                false,
                inbound_tx,
                shutdown,
            );
            let http = Arc::new(HttpTransport::new(
                &config.control,
                config.transport.request_timeout(),
            )?);
            TransportLink {
                sender: http.clone(),
                responder: http,
                inbound,
                link: Some(client),
            }
        }
    };

    tracing::info!(kind = ?config.transport.kind, "Transport started");
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ChannelStream, CloseReason};
    use serde_json::json;

    fn stream(event_id: &str, data: Value) -> LinkMessage {
        LinkMessage::ChannelStream(ChannelStream {
            event_id: event_id.to_string(),
            room_id: "client-1".to_string(),
            data,
        })
    }

    #[test]
    fn test_event_ids() {
        let output = TerminalEvent::Output(OutputPush {
            content: "aGVsbG8=".to_string(),
            sequence: 1,
        });
        assert_eq!(output.event_id("s1").to_string(), "terminal:s1:recv_data");
        assert_eq!(
            output.payload().unwrap(),
            json!({"content": "aGVsbG8=", "sequence": 1})
        );

        let closed = TerminalEvent::Closed(ClosePush {
            reason: CloseReason::Idle,
            exit_code: None,
        });
        assert_eq!(closed.event_id("s1").to_string(), "terminal:s1:close");
    }

    #[test]
    fn test_inbound_from_request() {
        let request = ChannelRequest {
            id: "r1".to_string(),
            scope: "terminal".to_string(),
            options: json!({"type": "handshake"}),
        };
        assert_eq!(
            Inbound::from_link(LinkMessage::ChannelRequest(request.clone())),
            Some(Inbound::Request(request))
        );
    }

    #[test]
    fn test_inbound_from_input_stream() {
        let inbound = Inbound::from_link(stream(
            "terminal:s1:send_data",
            json!({"data": "bHM=", "sequence": 1}),
        ));
        assert_eq!(
            inbound,
            Some(Inbound::Input {
                session_id: "s1".to_string(),
                input: InputPush {
                    data: Some("bHM=".to_string()),
                    sequence: 1,
                },
            })
        );
    }

    #[test]
    fn test_inbound_from_confirmation() {
        let inbound = Inbound::from_link(stream(
            "terminal:s1:consume_confirm_data",
            json!({"sequence": 7}),
        ));
        assert_eq!(
            inbound,
            Some(Inbound::ConsumeConfirm {
                session_id: "s1".to_string(),
                sequence: 7,
            })
        );
    }

    fn credentials(kind: TransportKind) -> Config {
        let mut config = Config::default();
        config.control.hostname = "127.0.0.1:9".to_string();
        config.control.client_id = "client-1".to_string();
        config.control.api_key = "key".to_string();
        config.transport.kind = kind;
        config
    }

    #[tokio::test]
    async fn test_start_selects_transport() {
        let shutdown = CancellationToken::new();

        let room = start(&credentials(TransportKind::Room), shutdown.clone()).unwrap();
        assert!(room.sender.supports_confirmation());
        assert!(room.link.is_some());

        let socket = start(&credentials(TransportKind::Socket), shutdown.clone()).unwrap();
        assert!(!socket.sender.supports_confirmation());

        // HTTP pushes, but the room link must stay up for inbound traffic.
        let http = start(&credentials(TransportKind::Http), shutdown.clone()).unwrap();
        assert!(!http.sender.supports_confirmation());
        let link = http.link.as_ref().unwrap();
        assert!(!link.is_connected());

        shutdown.cancel();
    }

    #[test]
    fn test_inbound_ignores_echo_and_garbage() {
        assert!(Inbound::from_link(stream("terminal:s1:recv_data", json!({}))).is_none());
        assert!(Inbound::from_link(stream("nonsense", json!({}))).is_none());
        assert!(Inbound::from_link(stream(
            "terminal:s1:consume_confirm_data",
            json!({"sequence": "seven"})
        ))
        .is_none());
        assert!(Inbound::from_link(LinkMessage::Pong { timestamp: 1 }).is_none());
    }
}
