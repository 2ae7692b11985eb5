//! ddsd node - wiring and background tasks

use crate::api::DdsService;
use crate::audit::{AuditConfig, AuditScheduler};
use crate::config::Config;
use crate::dispatcher::{DispatcherConfig, DispatcherStats, NotificationDispatcher};
use crate::document_store::{DocumentStore, StoreError, StoreStats};
use crate::pool::WorkerPool;
use crate::registry::{RegistryStats, SubscriptionRegistry};
use crate::routes;
use crate::storage::{Storage, StorageError, META_SIGNING_SEED};
use crate::watch::{is_file_updated, modified, read_peers_file};
use dds_core::crypto::{DocumentVerifier, Ed25519Verifier, KeyPair};
use dds_core::types::*;
use dds_core::MonotonicClock;
use dds_net::{HttpClient, ReqwestClient, TransportError};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// How often the peers file is checked for changes
const PEERS_FILE_POLL: Duration = Duration::from_secs(30);

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Key error: {0}")]
    Key(#[from] dds_core::Error),
    #[error("Bind failed: {0}")]
    Bind(#[from] warp::Error),
    #[error("Node already started")]
    AlreadyStarted,
}

/// Application context: owns every component and background task
pub struct Node {
    config: Config,
    base_url: String,
    storage: Arc<Storage>,
    keypair: Option<Arc<KeyPair>>,
    store: Arc<DocumentStore>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    auditor: Arc<AuditScheduler>,
    service: Arc<DdsService>,
    pool: WorkerPool,
    events: Mutex<Option<mpsc::UnboundedReceiver<NotificationEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Node {
    /// Build a node talking to peers over reqwest
    pub fn open(config: Config) -> Result<Self, NodeError> {
        let client = ReqwestClient::new(
            config.wire_format,
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Self::new(config, Arc::new(client))
    }

    /// Build a node on `client`; `config` is expected to be normalized
    pub fn new(config: Config, client: Arc<dyn HttpClient>) -> Result<Self, NodeError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let clock = Arc::new(MonotonicClock::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut store = DocumentStore::new(config.node_id.clone(), clock.clone())
            .with_storage(storage.clone())?
            .with_events(events_tx);

        let mut verifier: Option<Arc<dyn DocumentVerifier>> = None;
        let keypair = if config.signing_enabled {
            let keypair = Arc::new(load_or_create_keypair(&storage)?);
            info!("Signing key {}", hex::encode(keypair.public_key()));
            store = store.with_signer(keypair.clone());
            verifier = Some(Arc::new(Ed25519Verifier::from_hex_keys(&config.trusted_keys)?));
            Some(keypair)
        } else {
            None
        };
        let store = Arc::new(store);

        let registry = Arc::new(SubscriptionRegistry::new(
            config.node_id.clone(),
            clock,
            Duration::from_secs(config.max_subscription_ttl_secs),
        ));
        let pool = WorkerPool::new(config.worker_pool_size);

        let mut dispatcher = NotificationDispatcher::new(
            store.clone(),
            registry.clone(),
            client.clone(),
            pool.clone(),
            config.wire_format,
            DispatcherConfig {
                batch_size: config.notification_batch_size,
                delivery_attempts: config.delivery_attempts,
                backoff_base: Duration::from_millis(config.delivery_backoff_ms),
                ..Default::default()
            },
        );
        let base_url = config.base_url();
        let mut auditor = AuditScheduler::new(
            base_url.clone(),
            store.clone(),
            registry.clone(),
            client,
            pool.clone(),
            config.wire_format,
            AuditConfig {
                interval: config.audit_interval(),
                timeout: Duration::from_secs(config.audit_timeout_secs),
                page_size: config.page_size,
                subscription_ttl: Duration::from_secs(config.subscription_ttl_secs),
                max_failures: config.max_audit_failures,
                filter: SubscriptionFilter::default(),
            },
        );
        if let Some(verifier) = &verifier {
            dispatcher = dispatcher.with_verifier(verifier.clone());
            auditor = auditor.with_verifier(verifier.clone());
        }
        let dispatcher = Arc::new(dispatcher);
        let auditor = Arc::new(auditor);

        let service = Arc::new(DdsService::new(
            store.clone(),
            registry.clone(),
            dispatcher.clone(),
            config.wire_format,
            config.page_size,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            base_url,
            storage,
            keypair,
            store,
            registry,
            dispatcher,
            auditor,
            service,
            pool,
            events: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Public signing key, when signing is enabled
    pub fn public_key(&self) -> Option<Bytes32> {
        self.keypair.as_ref().map(|k| k.public_key())
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn service(&self) -> &Arc<DdsService> {
        &self.service
    }

    /// Bind the API and spawn background tasks; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        let events = self.events.lock().take().ok_or(NodeError::AlreadyStarted)?;

        let (added, _) = self.auditor.sync_peers(&self.configured_peers()).await;
        info!(
            "Starting ddsd node {} at {} ({} peers)",
            self.config.node_id, self.base_url, added
        );

        let (addr, server) = routes::bind(
            self.service.clone(),
            self.config.listen,
            self.shutdown_tx.subscribe(),
        )?;
        info!("Listening on {}", addr);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(server));
        tasks.push(tokio::spawn(
            self.dispatcher
                .clone()
                .run(events, self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.auditor.clone().run(self.shutdown_tx.subscribe()),
        ));
        tasks.push(self.spawn_expiry_task());
        if let Some(path) = self.config.peers_file.clone() {
            tasks.push(self.spawn_peers_file_task(path));
        }
        Ok(addr)
    }

    /// Peers from the command line plus the peers file, if readable
    fn configured_peers(&self) -> Vec<String> {
        let mut peers = self.config.peers.clone();
        if let Some(path) = &self.config.peers_file {
            match read_peers_file(path) {
                Ok(from_file) => peers.extend(from_file),
                Err(e) => warn!("Cannot read peers file {}: {}", path.display(), e),
            }
        }
        peers
    }

    /// Spawn background expiry sweep
    fn spawn_expiry_task(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let period = self.config.expiry_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Running expiry sweep");
                        store.expire_sweep();
                        registry.expire_sweep();
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Spawn peers-file watcher
    fn spawn_peers_file_task(&self, path: PathBuf) -> JoinHandle<()> {
        let auditor = self.auditor.clone();
        let static_peers = self.config.peers.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut last_seen: Option<SystemTime> = modified(&path);
            let mut ticker = interval(PEERS_FILE_POLL);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !is_file_updated(&path, last_seen) {
                            continue;
                        }
                        last_seen = modified(&path);
                        match read_peers_file(&path) {
                            Ok(from_file) => {
                                let mut peers = static_peers.clone();
                                peers.extend(from_file);
                                let (added, removed) = auditor.sync_peers(&peers).await;
                                info!(
                                    "Reloaded {}: {} peers added, {} removed",
                                    path.display(),
                                    added,
                                    removed
                                );
                            }
                            Err(e) => warn!("Cannot read peers file {}: {}", path.display(), e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Publish a document owned by this node
    pub fn publish(
        &self,
        document_type: impl Into<String>,
        document_id: impl Into<String>,
        content: Vec<u8>,
        lifetime: Duration,
    ) -> Result<Document, NodeError> {
        Ok(self.store.publish(document_type, document_id, content, lifetime)?)
    }

    /// Stop background tasks and flush storage
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        info!("Shutting down...");
        let _ = self.shutdown_tx.send(());
        self.pool.close();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task failed: {}", e);
            }
        }
        self.storage.flush()?;
        Ok(())
    }

    /// Get node statistics
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            node_id: self.config.node_id.clone(),
            store: self.store.stats(),
            registry: self.registry.stats(),
            dispatcher: self.dispatcher.stats(),
            busy_workers: self.pool.busy(),
        }
    }
}

fn load_or_create_keypair(storage: &Storage) -> Result<KeyPair, NodeError> {
    if let Some(seed) = storage.get_metadata(META_SIGNING_SEED)? {
        let seed: [u8; 32] = seed.try_into().map_err(|_| {
            StorageError::CorruptMetadata(META_SIGNING_SEED.to_string())
        })?;
        return Ok(KeyPair::from_seed(&seed));
    }
    let keypair = KeyPair::generate();
    storage.put_metadata(META_SIGNING_SEED, &keypair.seed())?;
    info!("Generated new signing key");
    Ok(keypair)
}

/// Node statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStats {
    pub node_id: String,
    pub store: StoreStats,
    pub registry: RegistryStats,
    pub dispatcher: DispatcherStats,
    pub busy_workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MeshClient;
    use clap::Parser;
    use std::path::Path;
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn test_config(node_id: &str, base_url: &str, data_dir: &Path, extra: &[&str]) -> Config {
        let data_dir = data_dir.to_string_lossy().to_string();
        let mut argv = vec![
            "ddsd",
            "--node-id",
            node_id,
            "--base-url",
            base_url,
            "--listen",
            "127.0.0.1:0",
            "--data-dir",
            &data_dir,
        ];
        argv.extend_from_slice(extra);
        Config::parse_from(argv)
    }

    #[tokio::test]
    async fn test_start_publish_shutdown() {
        let dir = tempdir().unwrap();
        let mesh = MeshClient::new();
        let config = test_config("urn:nsa:a", "http://a", dir.path(), &[]);
        let node = Node::new(config, Arc::new(mesh)).unwrap();

        let addr = node.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(matches!(node.start().await, Err(NodeError::AlreadyStarted)));

        let doc = node.publish("nsa", "x", b"hello".to_vec(), HOUR).unwrap();
        assert_eq!(doc.owner_id(), "urn:nsa:a");
        assert_eq!(node.stats().store.owned, 1);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_keeps_documents_key_and_versions() {
        let dir = tempdir().unwrap();
        let (first_version, first_key) = {
            let config = test_config("urn:nsa:a", "http://a", dir.path(), &["--signing-enabled"]);
            let node = Node::new(config, Arc::new(MeshClient::new())).unwrap();
            let doc = node.publish("nsa", "x", b"v1".to_vec(), HOUR).unwrap();
            assert!(doc.signature.is_some());
            node.shutdown().await.unwrap();
            (doc.version, node.public_key().unwrap())
        };

        let config = test_config("urn:nsa:a", "http://a", dir.path(), &["--signing-enabled"]);
        let node = Node::new(config, Arc::new(MeshClient::new())).unwrap();
        assert_eq!(node.public_key(), Some(first_key));
        let key = DocumentKey::new("urn:nsa:a", "nsa", "x");
        assert_eq!(node.store().get(&key).unwrap().content, b"v1");

        let doc = node.publish("nsa", "x", b"v2".to_vec(), HOUR).unwrap();
        assert!(doc.version > first_version);
    }

    #[tokio::test]
    async fn test_nodes_converge_through_background_audit() {
        let dirs = (tempdir().unwrap(), tempdir().unwrap());
        let mesh = MeshClient::new();
        let a = Node::new(
            test_config("urn:nsa:a", "http://a", dirs.0.path(), &[]),
            Arc::new(mesh.clone()),
        )
        .unwrap();
        let b = Node::new(
            test_config("urn:nsa:b", "http://b", dirs.1.path(), &["--peers", "http://a"]),
            Arc::new(mesh.clone()),
        )
        .unwrap();
        mesh.register("http://a", a.service().clone());
        mesh.register("http://b", b.service().clone());

        let doc = a.publish("nsa", "early", vec![1], HOUR).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        // first audit round runs immediately and subscribes b at a
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while b.store().get(&doc.key).is_none() || a.registry().stats().local == 0 {
            assert!(tokio::time::Instant::now() < deadline, "audit did not converge");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // later changes arrive by notification
        let late = a.publish("nsa", "late", vec![2], HOUR).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while b.store().get(&late.key).is_none() {
            assert!(tokio::time::Instant::now() < deadline, "notification not delivered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
