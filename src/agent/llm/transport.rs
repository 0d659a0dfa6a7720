//! HTTP transport used by the backend generators.
//!
//! Generators only build URLs, headers and JSON bodies; moving bytes is
//! delegated to an [`HttpTransport`], so adapters can be exercised without a
//! network.

use std::pin::Pin;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::Error;
use crate::Result;

/// Data payloads of a server-sent-events response, in arrival order.
pub type SseStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Request/response and streaming client for backend calls.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST a JSON body and decode a JSON reply.
    async fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<Value>;

    /// POST a JSON body and stream the `data:` payloads of the SSE reply.
    async fn post_sse(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<SseStream>;
}

/// [`HttpTransport`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn send(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
    ) -> Result<reqwest::Response> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "Backend returned error status");
            return Err(Error::from_http_status(status.as_u16(), error_text));
        }
        Ok(response)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<Value> {
        let response = self.send(url, headers, body).await?;
        Ok(response.json().await?)
    }

    async fn post_sse(&self, url: &str, headers: &[(String, String)], body: &Value) -> Result<SseStream> {
        let response = self.send(url, headers, body).await?;
        let stream = response.bytes_stream().eventsource().map(|event| match event {
            Ok(event) => {
                trace!("SSE data: {:?}", event.data);
                Ok(event.data)
            }
            Err(e) => Err(Error::TransientBackend {
                status: None,
                message: format!("SSE stream error: {e}"),
            }),
        });
        Ok(Box::pin(stream))
    }
}
