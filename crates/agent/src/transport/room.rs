//! WebSocket room link.
//!
//! Connects to the control plane's room endpoint with an
//! `Authorization: CK {client_key}` header, joins the room named after the
//! client id and exchanges JSON [`LinkMessage`]s. Binary frames are accepted
//! as MessagePack.

use futures_util::{SinkExt, StreamExt};
use protocol::LinkMessage;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::link::{LinkDriver, LinkSession};
use super::{TransportError, TransportFuture};
use crate::config::ControlConfig;

pub struct RoomDriver {
    url: String,
    authorization: HeaderValue,
}

impl RoomDriver {
    pub fn new(control: &ControlConfig) -> Result<Self, TransportError> {
        let url = control.room_url();
        url::Url::parse(&url).map_err(|e| TransportError::InvalidEndpoint(format!("{url}: {e}")))?;

        let authorization = HeaderValue::from_str(&format!("CK {}", control.client_key()))
            .map_err(|e| TransportError::InvalidEndpoint(format!("client key: {e}")))?;

        Ok(Self { url, authorization })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn decode_text(text: &str) -> Option<LinkMessage> {
    match LinkMessage::from_json(text) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!("failed to parse room message: {} (raw: {})", e, text);
            None
        }
    }
}

fn decode_binary(bytes: &[u8]) -> Option<LinkMessage> {
    match LinkMessage::from_msgpack(bytes) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(len = bytes.len(), "failed to parse binary room message: {}", e);
            None
        }
    }
}

impl LinkDriver for RoomDriver {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn run<'a>(&'a self, link: &'a mut LinkSession) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut request = self.url.as_str().into_client_request()?;
            request
                .headers_mut()
                .insert(AUTHORIZATION, self.authorization.clone());

            let (ws_stream, _) = connect_async(request).await?;
            let (mut ws_sink, mut ws_stream) = ws_stream.split();

            let join = LinkMessage::Join {
                room_id: link.room_id().to_string(),
            };
            ws_sink.send(WsMessage::Text(join.to_json()?)).await?;
            link.mark_connected();
            tracing::info!(room_id = %link.room_id(), "Joined room");

            loop {
                tokio::select! {
                    outgoing = link.next_outgoing() => {
                        let Some(message) = outgoing else {
                            let _ = ws_sink.send(WsMessage::Close(None)).await;
                            return Err(TransportError::Closed);
                        };
                        ws_sink.send(WsMessage::Text(message.to_json()?)).await?;
                    }
                    incoming = ws_stream.next() => {
                        let message = match incoming {
                            Some(Ok(WsMessage::Text(text))) => decode_text(&text),
                            Some(Ok(WsMessage::Binary(bytes))) => decode_binary(&bytes),
                            Some(Ok(WsMessage::Ping(payload))) => {
                                ws_sink.send(WsMessage::Pong(payload)).await?;
                                None
                            }
                            Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                            Some(Ok(_)) => None,
                            Some(Err(e)) => return Err(e.into()),
                        };
                        if let Some(message) = message {
                            if let Some(reply) = link.dispatch(message).await {
                                ws_sink.send(WsMessage::Text(reply.to_json()?)).await?;
                            }
                        }
                    }
                }
            }
        })
    }
}
