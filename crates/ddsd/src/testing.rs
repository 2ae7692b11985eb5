//! In-process federation for tests
//!
//! [`MeshClient`] routes requests by base URL to [`DdsService`] instances or
//! recording sinks. Partitioned or unknown hosts fail with a connect error;
//! stalled hosts never answer.

use crate::api::DdsService;
use crate::audit::{AuditConfig, AuditReport, AuditScheduler};
use crate::dispatcher::{DeliveryReport, DispatcherConfig, NotificationDispatcher};
use crate::document_store::DocumentStore;
use crate::pool::WorkerPool;
use crate::registry::SubscriptionRegistry;
use async_trait::async_trait;
use dds_core::types::*;
use dds_core::MonotonicClock;
use dds_net::{CallbackAck, HttpClient, HttpResponse, NotificationBatch, TransportError, WireFormat};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Callback endpoint that records what it receives
#[derive(Default)]
pub struct Sink {
    batches: Mutex<Vec<NotificationBatch>>,
    failures: AtomicUsize,
}

impl Sink {
    pub fn batches(&self) -> Vec<NotificationBatch> {
        self.batches.lock().clone()
    }

    /// Answer the next `n` requests with 503
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn receive(&self, body: &[u8]) -> HttpResponse {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return HttpResponse::new(503, Vec::new());
        }
        match WireFormat::Json.decode::<NotificationBatch>(body) {
            Ok(batch) => {
                let ack = CallbackAck {
                    accepted: batch.notifications.len(),
                    ..Default::default()
                };
                self.batches.lock().push(batch);
                HttpResponse::new(200, WireFormat::Json.encode(&ack).unwrap_or_default())
            }
            Err(_) => HttpResponse::new(400, Vec::new()),
        }
    }
}

#[derive(Clone)]
enum Endpoint {
    Service(Arc<DdsService>),
    Sink(Arc<Sink>),
}

#[derive(Default)]
struct Mesh {
    endpoints: RwLock<HashMap<String, Endpoint>>,
    partitioned: RwLock<HashSet<String>>,
    stalled: RwLock<HashSet<String>>,
}

struct Route {
    endpoint: Endpoint,
    path: String,
    query: HashMap<String, String>,
    stalled: bool,
}

/// `HttpClient` over in-process endpoints
#[derive(Clone, Default)]
pub struct MeshClient {
    mesh: Arc<Mesh>,
}

impl MeshClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, base_url: &str, service: Arc<DdsService>) {
        self.mesh
            .endpoints
            .write()
            .insert(base_url.to_string(), Endpoint::Service(service));
    }

    pub fn add_sink(&self, base_url: &str) -> Arc<Sink> {
        let sink = Arc::new(Sink::default());
        self.mesh
            .endpoints
            .write()
            .insert(base_url.to_string(), Endpoint::Sink(sink.clone()));
        sink
    }

    /// Make `base_url` unreachable
    pub fn partition(&self, base_url: &str) {
        self.mesh.partitioned.write().insert(base_url.to_string());
    }

    pub fn heal(&self, base_url: &str) {
        self.mesh.partitioned.write().remove(base_url);
        self.mesh.stalled.write().remove(base_url);
    }

    /// Accept requests to `base_url` but never answer them
    pub fn stall(&self, base_url: &str) {
        self.mesh.stalled.write().insert(base_url.to_string());
    }

    fn resolve(&self, url: &str) -> Result<Route, TransportError> {
        let unreachable = || TransportError::Connect {
            url: url.to_string(),
            reason: "host unreachable".into(),
        };
        let endpoints = self.mesh.endpoints.read();
        let (base, endpoint) = endpoints
            .iter()
            .filter(|(base, _)| {
                url.strip_prefix(base.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']))
            })
            .max_by_key(|(base, _)| base.len())
            .ok_or_else(unreachable)?;
        if self.mesh.partitioned.read().contains(base) {
            return Err(unreachable());
        }
        let stalled = self.mesh.stalled.read().contains(base);

        let rest = &url[base.len()..];
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let query = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Ok(Route {
            endpoint: endpoint.clone(),
            path: path.to_string(),
            query,
            stalled,
        })
    }

    async fn request(
        &self,
        method: &str,
        url: &str,
        body: Vec<u8>,
    ) -> Result<HttpResponse, TransportError> {
        let route = self.resolve(url)?;
        if route.stalled {
            std::future::pending::<()>().await;
        }
        let Route {
            endpoint,
            path,
            query,
            ..
        } = route;
        Ok(match endpoint {
            Endpoint::Service(service) => service.handle(method, &path, &query, &body).await,
            Endpoint::Sink(sink) => sink.receive(&body),
        })
    }
}

#[async_trait]
impl HttpClient for MeshClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.request("GET", url, Vec::new()).await
    }

    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, TransportError> {
        self.request("POST", url, body).await
    }

    async fn delete(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.request("DELETE", url, Vec::new()).await
    }
}

/// A fully wired node attached to a mesh
pub struct TestNode {
    pub store: Arc<DocumentStore>,
    pub registry: Arc<SubscriptionRegistry>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub auditor: Arc<AuditScheduler>,
    pub service: Arc<DdsService>,
    events: Mutex<mpsc::UnboundedReceiver<NotificationEvent>>,
}

impl TestNode {
    pub fn new(node_id: &str, base_url: &str, mesh: &MeshClient) -> Self {
        Self::with_audit_config(
            node_id,
            base_url,
            mesh,
            AuditConfig {
                interval: Duration::from_secs(300),
                timeout: Duration::from_secs(5),
                page_size: 3,
                ..Default::default()
            },
        )
    }

    pub fn with_audit_config(
        node_id: &str,
        base_url: &str,
        mesh: &MeshClient,
        audit: AuditConfig,
    ) -> Self {
        let clock = Arc::new(MonotonicClock::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(DocumentStore::new(node_id, clock.clone()).with_events(tx));
        let registry = Arc::new(SubscriptionRegistry::new(
            node_id,
            clock,
            Duration::from_secs(7 * 24 * 3600),
        ));
        let client: Arc<dyn HttpClient> = Arc::new(mesh.clone());
        let pool = WorkerPool::new(5);

        let dispatcher = Arc::new(NotificationDispatcher::new(
            store.clone(),
            registry.clone(),
            client.clone(),
            pool.clone(),
            WireFormat::Json,
            DispatcherConfig {
                batch_size: 10,
                delivery_attempts: 2,
                backoff_base: Duration::from_millis(5),
                backoff_max: Duration::from_millis(10),
            },
        ));
        let auditor = Arc::new(AuditScheduler::new(
            base_url,
            store.clone(),
            registry.clone(),
            client,
            pool,
            WireFormat::Json,
            audit,
        ));
        let service = Arc::new(DdsService::new(
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
            WireFormat::Json,
            3,
        ));
        mesh.register(base_url, service.clone());

        Self {
            store,
            registry,
            dispatcher,
            auditor,
            service,
            events: Mutex::new(rx),
        }
    }

    pub async fn audit_peer(&self, peer_url: &str) -> AuditReport {
        self.auditor.audit_peer(peer_url).await
    }

    /// Store events emitted since the last drain
    pub fn drain_events(&self) -> Vec<NotificationEvent> {
        let mut events = self.events.lock();
        std::iter::from_fn(|| events.try_recv().ok()).collect()
    }

    /// Deliver pending store events to subscribers and wait for the deliveries
    pub async fn pump(&self) -> Vec<DeliveryReport> {
        for event in self.drain_events() {
            self.dispatcher.enqueue(&event);
        }
        let mut reports = Vec::new();
        for handle in self.dispatcher.flush() {
            if let Ok(Some(report)) = handle.await {
                reports.push(report);
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn manifest(node: &TestNode) -> Vec<ManifestEntry> {
        node.store.manifest(0, usize::MAX).1
    }

    #[tokio::test]
    async fn test_convergence_after_partition() {
        let mesh = MeshClient::new();
        let a = TestNode::new("urn:nsa:a", "http://a", &mesh);
        let b = TestNode::new("urn:nsa:b", "http://b", &mesh);
        let c = TestNode::new("urn:nsa:c", "http://c", &mesh);
        let all = ["http://a".to_string(), "http://b".into(), "http://c".into()];
        for node in [&a, &b, &c] {
            node.auditor.sync_peers(&all).await;
            node.auditor.audit_all().await;
        }

        // c is cut off while a and b keep publishing
        mesh.partition("http://c");
        a.store.publish("nsa", "one", b"a1".to_vec(), HOUR).unwrap();
        a.store.publish("nsa", "two", b"a2".to_vec(), HOUR).unwrap();
        b.store.publish("nsa", "three", b"b1".to_vec(), HOUR).unwrap();
        let reports = a.pump().await;
        assert!(reports.contains(&DeliveryReport::Delivered {
            attempts: 1,
            notifications: 2
        }));
        assert!(reports
            .iter()
            .any(|r| matches!(r, DeliveryReport::Dropped { .. })));
        b.pump().await;

        // notifications alone reached the reachable nodes
        assert_eq!(b.store.len(), 3);
        assert_eq!(a.store.len(), 3);
        assert_eq!(c.store.len(), 0);

        // one audit round after healing repairs what c missed
        mesh.heal("http://c");
        let reports = c.auditor.audit_all().await;
        assert!(reports.iter().all(|r| r.is_success()));
        assert_eq!(manifest(&a), manifest(&b));
        assert_eq!(manifest(&b), manifest(&c));
        for node in [&a, &b, &c] {
            let remotes = node.registry.all_remote();
            assert_eq!(remotes.len(), 2);
            assert!(remotes.iter().all(|r| r.state == RemoteState::Active));
        }
    }

    #[tokio::test]
    async fn test_notification_fetches_when_not_embedded() {
        let mesh = MeshClient::new();
        let a = TestNode::new("urn:nsa:a", "http://a", &mesh);
        let b = TestNode::new("urn:nsa:b", "http://b", &mesh);
        b.audit_peer("http://a").await;

        let doc = a.store.publish("nsa", "x", b"payload".to_vec(), HOUR).unwrap();
        let id = b
            .registry
            .get_remote("http://a")
            .unwrap()
            .subscription_id()
            .cloned()
            .unwrap();
        let report = b
            .dispatcher
            .on_inbound_notification(NotificationBatch {
                subscription_id: id,
                provider_id: "urn:nsa:a".into(),
                notifications: vec![dds_net::Notification {
                    kind: EventKind::Updated,
                    key: doc.key.clone(),
                    document: None,
                    discovered: Timestamp::now(),
                }],
            })
            .await;
        assert_eq!(report.accepted, 1);
        assert_eq!(b.store.get(&doc.key).unwrap().content, b"payload");
    }

    #[tokio::test]
    async fn test_mesh_routing() {
        let mesh = MeshClient::new();
        let _a = TestNode::new("urn:nsa:a", "http://a", &mesh);
        let response = mesh.get("http://a/health").await.unwrap();
        assert_eq!(response.status, 200);
        assert!(mesh.get("http://ab/health").await.is_err());
        mesh.partition("http://a");
        assert!(matches!(
            mesh.get("http://a/health").await,
            Err(TransportError::Connect { .. })
        ));
    }
}
