//! HTTP transport to peers and subscribers
//!
//! The service core only sees [`HttpClient`]; [`ReqwestClient`] is the
//! production implementation. Tests substitute an in-process mesh.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::wire::WireFormat;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("Request to {0} timed out")]
    Timeout(String),
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },
}

/// Status and body of a completed request
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into a `TransportError::Status`
    pub fn error_for_status(self, url: &str) -> Result<Self, TransportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Status {
                url: url.to_string(),
                status: self.status,
            })
        }
    }
}

/// Minimal HTTP client contract used by the audit and notification paths
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, TransportError>;
    async fn delete(&self, url: &str) -> Result<HttpResponse, TransportError>;
}

/// reqwest-backed client with connect and request timeouts
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    format: WireFormat,
}

impl ReqwestClient {
    pub fn new(
        format: WireFormat,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Request {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, format })
    }

    async fn execute(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<HttpResponse, TransportError> {
        let response = request
            .header(reqwest::header::ACCEPT, self.format.content_type())
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;
        debug!("{} -> {} ({} bytes)", url, status, body.len());
        Ok(HttpResponse::new(status, body.to_vec()))
    }
}

fn map_reqwest_error(url: &str, e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(url.to_string())
    } else if e.is_connect() {
        TransportError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        }
    } else {
        TransportError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.execute(url, self.client.get(url)).await
    }

    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, TransportError> {
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, self.format.content_type())
            .body(body);
        self.execute(url, request).await
    }

    async fn delete(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.execute(url, self.client.delete(url)).await
    }
}
