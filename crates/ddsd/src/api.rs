//! Request routing for the node's HTTP surface
//!
//! [`DdsService::handle`] is independent of the HTTP server; `routes` binds
//! it to warp and tests drive it in-process.

use crate::dispatcher::{DispatcherStats, NotificationDispatcher};
use crate::document_store::{DocumentStore, StoreStats};
use crate::registry::{RegistryError, RegistryStats, SubscriptionRegistry};
use dds_core::types::*;
use dds_net::messages::ErrorResponse;
use dds_net::peer::{decode_segment, CALLBACK_PATH, DOCUMENTS_PATH, HEALTH_PATH, SUBSCRIPTIONS_PATH};
use dds_net::{
    HttpResponse, ManifestPage, NotificationBatch, RenewRequest, SubscribeRequest, WireError,
    WireFormat,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// API errors, each mapped to an HTTP status
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Malformed body: {0}")]
    Decode(WireError),
    #[error("{0}")]
    Registry(#[from] RegistryError),
    #[error("Encoding response failed: {0}")]
    Encode(WireError),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::MethodNotAllowed(_) => 405,
            ApiError::BadRequest(_) | ApiError::Decode(_) | ApiError::Registry(_) => 400,
            ApiError::Encode(_) => 500,
        }
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub node_id: String,
    pub store: StoreStats,
    pub registry: RegistryStats,
    pub dispatcher: DispatcherStats,
}

/// The node's request handler
pub struct DdsService {
    store: Arc<DocumentStore>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    format: WireFormat,
    /// Largest manifest page served
    page_size: usize,
}

impl DdsService {
    pub fn new(
        store: Arc<DocumentStore>,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<NotificationDispatcher>,
        format: WireFormat,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            registry,
            dispatcher,
            format,
            page_size: page_size.max(1),
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Route one request; failures become error responses
    pub async fn handle(
        &self,
        method: &str,
        path: &str,
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> HttpResponse {
        match self.route(method, path, query, body).await {
            Ok(response) => response,
            Err(e) => {
                debug!("{} {} -> {}: {}", method, path, e.status(), e);
                let error = ErrorResponse {
                    error: e.to_string(),
                };
                HttpResponse::new(e.status(), self.format.encode(&error).unwrap_or_default())
            }
        }
    }

    async fn route(
        &self,
        method: &str,
        path: &str,
        query: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<HttpResponse, ApiError> {
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(decode_segment)
            .collect::<Option<_>>()
            .ok_or_else(|| ApiError::BadRequest(format!("undecodable path {}", path)))?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

        match (method, segments.as_slice()) {
            ("GET", [DOCUMENTS_PATH]) => self.manifest(query),
            ("GET", [DOCUMENTS_PATH, owner, doc_type, id]) => {
                let key = DocumentKey::new(*owner, *doc_type, *id);
                let document = self
                    .store
                    .get(&key)
                    .ok_or_else(|| ApiError::NotFound(key.to_string()))?;
                self.ok(200, &document)
            }
            ("POST", [SUBSCRIPTIONS_PATH]) => {
                let request: SubscribeRequest = self.decode(body)?;
                let subscription = self.registry.subscribe(
                    request.requester_id,
                    request.callback,
                    request.filter,
                    Duration::from_secs(request.ttl_secs),
                )?;
                self.ok(201, &subscription)
            }
            ("GET", [SUBSCRIPTIONS_PATH, id]) => {
                let id = SubscriptionId(id.to_string());
                let subscription = self
                    .registry
                    .get(&id)
                    .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
                self.ok(200, &subscription)
            }
            ("POST", [SUBSCRIPTIONS_PATH, id]) => {
                let request: RenewRequest = self.decode(body)?;
                let id = SubscriptionId(id.to_string());
                let subscription = self
                    .registry
                    .renew(&id, Duration::from_secs(request.ttl_secs))
                    .ok_or_else(|| ApiError::NotFound(id.to_string()))?;
                self.ok(200, &subscription)
            }
            ("DELETE", [SUBSCRIPTIONS_PATH, id]) => {
                let id = SubscriptionId(id.to_string());
                if self.registry.unsubscribe(&id) {
                    Ok(HttpResponse::new(204, Vec::new()))
                } else {
                    Err(ApiError::NotFound(id.to_string()))
                }
            }
            ("POST", [CALLBACK_PATH]) => {
                let batch: NotificationBatch = self.decode(body)?;
                let report = self.dispatcher.on_inbound_notification(batch).await;
                self.ok(200, &report.ack())
            }
            ("GET", [HEALTH_PATH]) => {
                let health = HealthResponse {
                    node_id: self.store.node_id().to_string(),
                    store: self.store.stats(),
                    registry: self.registry.stats(),
                    dispatcher: self.dispatcher.stats(),
                };
                let body = serde_json::to_vec(&health)
                    .map_err(|e| ApiError::Encode(WireError::Json(e)))?;
                Ok(HttpResponse::new(200, body))
            }
            (_, [DOCUMENTS_PATH])
            | (_, [DOCUMENTS_PATH, _, _, _])
            | (_, [SUBSCRIPTIONS_PATH])
            | (_, [SUBSCRIPTIONS_PATH, _])
            | (_, [CALLBACK_PATH])
            | (_, [HEALTH_PATH]) => Err(ApiError::MethodNotAllowed(method.to_string())),
            _ => Err(ApiError::NotFound(path.to_string())),
        }
    }

    fn manifest(&self, query: &HashMap<String, String>) -> Result<HttpResponse, ApiError> {
        let offset = parse_param(query, "offset")?.unwrap_or(0);
        let limit = parse_param(query, "limit")?
            .unwrap_or(self.page_size)
            .clamp(1, self.page_size);
        let (total, entries) = self.store.manifest(offset, limit);
        self.ok(
            200,
            &ManifestPage {
                provider_id: self.store.node_id().to_string(),
                offset,
                total,
                entries,
            },
        )
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, body: &[u8]) -> Result<T, ApiError> {
        self.format.decode(body).map_err(ApiError::Decode)
    }

    fn ok<T: Serialize>(&self, status: u16, value: &T) -> Result<HttpResponse, ApiError> {
        let body = self.format.encode(value).map_err(ApiError::Encode)?;
        Ok(HttpResponse::new(status, body))
    }
}

fn parse_param(query: &HashMap<String, String>, name: &str) -> Result<Option<usize>, ApiError> {
    query
        .get(name)
        .map(|raw| {
            raw.parse()
                .map_err(|_| ApiError::BadRequest(format!("{}={} is not a number", name, raw)))
        })
        .transpose()
}
