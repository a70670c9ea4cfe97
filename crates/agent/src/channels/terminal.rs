//! The `terminal` channel.
//!
//! Decodes `options.type` into a [`TerminalRequest`], calls the engine and
//! turns the outcome into the response payload. Engine errors never escape
//! as handler errors; they become `{accepted: false, error}`.

use protocol::{
    ConnectResponse, HandshakeResponse, OperationResponse, TerminalRequest, TERMINAL_SCOPE,
};
use serde_json::Value;

use super::{ChannelError, ChannelFuture, ChannelHandler};
use crate::session::{SessionEngine, SessionError};

pub struct TerminalChannel {
    engine: SessionEngine,
}

impl TerminalChannel {
    pub fn new(engine: SessionEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &SessionEngine {
        &self.engine
    }

    /// Run one request and build its response payload.
    pub async fn execute(&self, request: TerminalRequest) -> Result<Value, ChannelError> {
        let kind = request.kind();
        let value = match request {
            TerminalRequest::Handshake => {
                let id = self.engine.handshake();
                serde_json::to_value(HandshakeResponse { id })?
            }
            TerminalRequest::Connect(connect) => {
                let response = match self.engine.connect(connect).await {
                    Ok(content) => ConnectResponse::accepted(content),
                    Err(e) => ConnectResponse::rejected(rejection(kind, e)),
                };
                serde_json::to_value(response)?
            }
            TerminalRequest::Data(data) => {
                let response = match self.engine.data(data).await {
                    Ok(true) => OperationResponse::accepted(),
                    Ok(false) => OperationResponse::declined(),
                    Err(e) => OperationResponse::rejected(rejection(kind, e)),
                };
                serde_json::to_value(response)?
            }
            TerminalRequest::Resize(resize) => {
                let response = match self.engine.resize(resize).await {
                    Ok(()) => OperationResponse::accepted(),
                    Err(e) => OperationResponse::rejected(rejection(kind, e)),
                };
                serde_json::to_value(response)?
            }
            TerminalRequest::Close(close) => {
                let response = if self.engine.close(&close.id).await {
                    OperationResponse::accepted()
                } else {
                    OperationResponse::declined()
                };
                serde_json::to_value(response)?
            }
            TerminalRequest::ConsumeConfirm(confirm) => {
                let response = match self.engine.consume_confirm(confirm).await {
                    Ok(()) => OperationResponse::accepted(),
                    Err(e) => OperationResponse::rejected(rejection(kind, e)),
                };
                serde_json::to_value(response)?
            }
        };
        Ok(value)
    }
}

fn rejection(kind: &'static str, error: SessionError) -> String {
    match &error {
        SessionError::DuplicateSequence { .. } | SessionError::InputTimeout(_) => {
            tracing::debug!(operation = kind, error = %error, "Terminal request rejected")
        }
        _ => tracing::warn!(operation = kind, error = %error, "Terminal request rejected"),
    }
    error.to_string()
}

impl ChannelHandler for TerminalChannel {
    fn scope(&self) -> &'static str {
        TERMINAL_SCOPE
    }

    fn handle(&self, options: Value) -> ChannelFuture<'_> {
        Box::pin(async move {
            let kind = operation_kind(&options)?;
            match parse_request(kind, options) {
                Ok(request) => self.execute(request).await,
                Err(error) => {
                    let message = rejection(kind, error);
                    if kind == "connect" {
                        Ok(serde_json::to_value(ConnectResponse::rejected(message))?)
                    } else {
                        Ok(serde_json::to_value(OperationResponse::rejected(message))?)
                    }
                }
            }
        })
    }
}

/// Resolve `options.type` to a known operation. Anything else is not a
/// terminal request at all and fails the envelope.
fn operation_kind(options: &Value) -> Result<&'static str, ChannelError> {
    let requested = options
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ChannelError::InvalidOptions("missing 'type'".to_string()))?;
    TerminalRequest::KINDS
        .iter()
        .copied()
        .find(|kind| *kind == requested)
        .ok_or_else(|| ChannelError::InvalidOptions(format!("unknown type '{}'", requested)))
}

/// Decode the fields of a known operation.
fn parse_request(kind: &'static str, options: Value) -> Result<TerminalRequest, SessionError> {
    if kind != "handshake" && !options.get("id").is_some_and(Value::is_string) {
        return Err(SessionError::MissingParameter("id"));
    }
    serde_json::from_value(options).map_err(|e| SessionError::InvalidParameters {
        operation: kind,
        reason: e.to_string(),
    })
}
