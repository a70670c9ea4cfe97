//! Request dispatcher.
//!
//! Routes each [`ChannelRequest`] to the handler registered for its scope
//! and converts every outcome into a [`ChannelResponse`]. The registry is
//! fixed once the dispatcher is built.

use std::collections::HashMap;
use std::sync::Arc;

use protocol::{ChannelRequest, ChannelResponse};
use serde_json::Value;
use tracing::{debug, warn};

use crate::channels::{ChannelError, ChannelHandler};

/// Errors that can occur while building or using the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Two handlers claimed the same scope.
    #[error("scope '{0}' is already registered")]
    DuplicateScope(String),

    /// No handler for the request's scope.
    #[error("Channel '{0}' is not registered in client")]
    UnknownScope(String),

    /// The envelope could not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The handler failed.
    #[error("handler error: {0}")]
    Handler(#[from] ChannelError),
}

impl DispatchError {
    /// Response payload the peer sees for this error.
    pub fn to_response_data(&self) -> Value {
        match self {
            DispatchError::UnknownScope(_) => Value::String(self.to_string()),
            _ => Value::Null,
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Default)]
pub struct DispatcherBuilder {
    handlers: HashMap<&'static str, Arc<dyn ChannelHandler>>,
}

impl DispatcherBuilder {
    pub fn register<H>(mut self, handler: H) -> Result<Self, DispatchError>
    where
        H: ChannelHandler + 'static,
    {
        let scope = handler.scope();
        if self.handlers.contains_key(scope) {
            return Err(DispatchError::DuplicateScope(scope.to_string()));
        }
        self.handlers.insert(scope, Arc::new(handler));
        Ok(self)
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            handlers: Arc::new(self.handlers),
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Cheap-to-clone, immutable scope registry.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<HashMap<&'static str, Arc<dyn ChannelHandler>>>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn scopes(&self) -> Vec<&'static str> {
        let mut scopes: Vec<_> = self.handlers.keys().copied().collect();
        scopes.sort_unstable();
        scopes
    }

    /// Route one request and build its response.
    pub async fn dispatch(&self, request: ChannelRequest) -> ChannelResponse {
        let ChannelRequest { id, scope, options } = request;
        match self.route(&scope, options).await {
            Ok(data) => ChannelResponse::ok(id, data),
            Err(e) => {
                warn!(request_id = %id, %scope, error = %e, "Request failed");
                ChannelResponse::error(id, e.to_response_data())
            }
        }
    }

    /// Route a raw envelope. Returns `None` when the envelope carries no
    /// request id to answer to.
    pub async fn dispatch_value(&self, envelope: Value) -> Option<ChannelResponse> {
        match serde_json::from_value::<ChannelRequest>(envelope.clone()) {
            Ok(request) => Some(self.dispatch(request).await),
            Err(e) => {
                let error = DispatchError::MalformedRequest(e.to_string());
                match envelope.get("id").and_then(Value::as_str) {
                    Some(id) => {
                        warn!(request_id = %id, error = %error, "Rejecting envelope");
                        Some(ChannelResponse::error(id, error.to_response_data()))
                    }
                    None => {
                        warn!(error = %error, "Dropping envelope without request id");
                        None
                    }
                }
            }
        }
    }

    async fn route(&self, scope: &str, options: Value) -> Result<Value, DispatchError> {
        let handler = self
            .handlers
            .get(scope)
            .ok_or_else(|| DispatchError::UnknownScope(scope.to_string()))?;
        debug!(%scope, "Routing request");
        Ok(handler.handle(options).await?)
    }
}
