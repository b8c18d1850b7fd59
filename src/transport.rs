use crate::constants::REQUEST_ID_HEADER;
use crate::specs::openai::ChatCompletionBody;
use crate::types::*;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Status plus an unread body. Error bodies are read through [`UpstreamResponse::text`].
pub struct UpstreamResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: ByteStream) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drains the body. Invalid UTF-8 is replaced rather than rejected.
    pub async fn text(mut self) -> Result<String> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Sends one completion request to the gateway.
///
/// Implementations must not retry; the relay owns the retry budget.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        body: &ChatCompletionBody,
        api_key: &str,
        request_id: &RequestId,
    ) -> Result<UpstreamResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn build_client(
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        body: &ChatCompletionBody,
        api_key: &str,
        request_id: &RequestId,
    ) -> Result<UpstreamResponse> {
        tracing::info!(
            "[⚙️  -> ☁️ ] POST {} model={} stream={}",
            self.url,
            body.model,
            body.stream
        );
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .header(REQUEST_ID_HEADER, request_id.0.as_str())
            .json(body)
            .send()
            .await
            .map_err(|e| ObservedError::from(RelayError::Network(e)))?;

        let status = response.status().as_u16();
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);

        let stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        Ok(UpstreamResponse::new(status, Box::pin(stream)))
    }
}
