//! Channel handlers: one per request scope.
//!
//! A handler receives the `options` payload of a routed request and returns
//! the `data` of the response.

pub mod terminal;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use thiserror::Error;

pub use terminal::TerminalChannel;

/// Boxed future returned by [`ChannelHandler::handle`].
pub type ChannelFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ChannelError>> + Send + 'a>>;

/// Errors a handler reports instead of a response payload.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("failed to encode response: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Encode(err.to_string())
    }
}

pub trait ChannelHandler: Send + Sync {
    /// Scope this handler answers, e.g. `"terminal"`.
    fn scope(&self) -> &'static str;

    fn handle(&self, options: Value) -> ChannelFuture<'_>;
}
