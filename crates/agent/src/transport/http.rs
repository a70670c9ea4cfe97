//! HTTP callback transport.
//!
//! Pushes go to `POST {api}/client/channel_gateway/{event_id}` and
//! responses to `POST {api}/client/channel_response/{request_id}`, both with
//! a `{data, errored}` body and the `CLIENT-KEY` header.

use std::time::Duration;

use protocol::ChannelResponse;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::{ResponseSender, TerminalEvent, TransportError, TransportFuture, TransportSender};
use crate::config::ControlConfig;

/// Header carrying `base64("{api_key}:{client_id}")`.
pub const CLIENT_KEY_HEADER: &str = "CLIENT-KEY";

#[derive(Debug, Serialize)]
struct CallbackBody<'a> {
    data: &'a Value,
    errored: bool,
}

pub struct HttpTransport {
    client: Client,
    base_url: String,
    client_key: String,
}

impl HttpTransport {
    pub fn new(control: &ControlConfig, timeout: Duration) -> Result<Self, TransportError> {
        let base_url = control.api_base_url();
        url::Url::parse(&base_url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{base_url}: {e}")))?;

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            client_key: control.client_key(),
        })
    }

    pub fn gateway_url(&self, event_id: &str) -> String {
        format!("{}/client/channel_gateway/{}", self.base_url, event_id)
    }

    pub fn response_url(&self, request_id: &str) -> String {
        format!("{}/client/channel_response/{}", self.base_url, request_id)
    }

    async fn post(&self, url: String, data: &Value, errored: bool) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&url)
            .header(CLIENT_KEY_HEADER, &self.client_key)
            .json(&CallbackBody { data, errored })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                url,
            });
        }
        tracing::trace!(%url, "Callback delivered");
        Ok(())
    }
}

impl TransportSender for HttpTransport {
    fn push<'a>(
        &'a self,
        session_id: &'a str,
        event: &'a TerminalEvent,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let url = self.gateway_url(&event.event_id(session_id).to_string());
            self.post(url, &event.payload()?, false).await
        })
    }

    fn supports_confirmation(&self) -> bool {
        false
    }
}

impl ResponseSender for HttpTransport {
    fn respond(&self, response: ChannelResponse) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let url = self.response_url(&response.request_id);
            self.post(url, &response.data, response.errored).await
        })
    }
}
