//! Periodic peer audit
//!
//! Each round keeps our subscription at every configured peer alive and
//! reconciles the local store against the peer's manifest. Audits are the
//! durability backstop for dropped notifications.

use crate::document_store::DocumentStore;
use crate::ingest::{fetch_document, ingest, IngestOutcome};
use crate::pool::WorkerPool;
use crate::registry::SubscriptionRegistry;
use dds_core::crypto::DocumentVerifier;
use dds_core::types::*;
use dds_net::messages::ManifestPage;
use dds_net::peer::{callback_url, manifest_url, subscription_url, subscriptions_url};
use dds_net::{
    normalize_peer_url, HttpClient, RenewRequest, SubscribeRequest, TransportError, WireError,
    WireFormat,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Audit errors
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Decode error: {0}")]
    Decode(#[from] WireError),
    #[error("Audit of {0} timed out")]
    Timeout(String),
}

impl AuditError {
    fn is_transport(&self) -> bool {
        matches!(self, AuditError::Transport(_) | AuditError::Timeout(_))
    }
}

/// Audit tuning
#[derive(Clone, Debug)]
pub struct AuditConfig {
    pub interval: Duration,
    /// Upper bound on one peer's audit
    pub timeout: Duration,
    /// Manifest entries requested per page
    pub page_size: usize,
    /// Lifetime requested for our subscriptions at peers
    pub subscription_ttl: Duration,
    /// Consecutive failed audits before a peer is marked Failed
    pub max_failures: u32,
    pub filter: SubscriptionFilter,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1200),
            timeout: Duration::from_secs(120),
            page_size: 50,
            subscription_ttl: Duration::from_secs(7200),
            max_failures: 3,
            filter: SubscriptionFilter::default(),
        }
    }
}

impl AuditConfig {
    /// Renew once the peer-side subscription is this close to expiring
    pub fn renewal_window(&self) -> Duration {
        self.interval.saturating_mul(2)
    }

    /// Lifetime asked of peers; outlives the next audit plus the renewal window
    pub fn requested_ttl(&self) -> Duration {
        self.subscription_ttl
            .max(self.interval.saturating_add(self.renewal_window()))
    }
}

/// Result of auditing one peer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub peer_url: String,
    /// Subscription registered from scratch this round
    pub subscribed: bool,
    pub renewed: bool,
    pub pages: usize,
    pub fetched: usize,
    pub accepted: usize,
    pub ignored: usize,
    pub rejected: usize,
    pub decode_errors: usize,
    pub transport_errors: usize,
    /// First transport failure, if any
    pub error: Option<String>,
}

impl AuditReport {
    fn new(peer_url: &str) -> Self {
        Self {
            peer_url: peer_url.to_string(),
            ..Default::default()
        }
    }

    /// Whether the round finished without a transport failure
    pub fn is_success(&self) -> bool {
        self.transport_errors == 0
    }

    fn record_error(&mut self, error: &AuditError) {
        if error.is_transport() {
            self.transport_errors += 1;
            if self.error.is_none() {
                self.error = Some(error.to_string());
            }
        } else {
            self.decode_errors += 1;
        }
    }
}

/// Drives remote subscriptions and manifest reconciliation
pub struct AuditScheduler {
    /// Our own base URL, used to build the callback we register
    base_url: String,
    store: Arc<DocumentStore>,
    registry: Arc<SubscriptionRegistry>,
    client: Arc<dyn HttpClient>,
    pool: WorkerPool,
    format: WireFormat,
    verifier: Option<Arc<dyn DocumentVerifier>>,
    config: AuditConfig,
}

impl AuditScheduler {
    pub fn new(
        base_url: impl Into<String>,
        store: Arc<DocumentStore>,
        registry: Arc<SubscriptionRegistry>,
        client: Arc<dyn HttpClient>,
        pool: WorkerPool,
        format: WireFormat,
        config: AuditConfig,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            store,
            registry,
            client,
            pool,
            format,
            verifier: None,
            config,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn DocumentVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Peer set
    // -------------------------------------------------------------------------

    /// Make the tracked peer set equal to `peers`; returns (added, removed)
    ///
    /// Dropped peers are unsubscribed best effort before their record goes.
    pub async fn sync_peers(&self, peers: &[String]) -> (usize, usize) {
        let wanted: HashSet<String> = peers
            .iter()
            .filter_map(|raw| match normalize_peer_url(raw) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("Ignoring peer: {}", e);
                    None
                }
            })
            .filter(|url| url != &self.base_url)
            .collect();

        let now = Timestamp::now();
        let mut added = 0;
        for url in &wanted {
            if self.registry.get_remote(url).is_none() {
                info!("Tracking peer {}", url);
                self.registry
                    .upsert_remote(RemoteSubscription::unregistered(url.clone(), now));
                added += 1;
            }
        }

        let mut removed = 0;
        for remote in self.registry.all_remote() {
            if wanted.contains(&remote.peer_url) {
                continue;
            }
            if let Some(id) = remote.subscription_id() {
                let url = subscription_url(&remote.peer_url, id);
                match self.client.delete(&url).await {
                    Ok(response) if response.is_success() || response.status == 404 => {
                        debug!("Unsubscribed from {}", remote.peer_url)
                    }
                    Ok(response) => warn!(
                        "Unsubscribe from {} returned {}",
                        remote.peer_url, response.status
                    ),
                    Err(e) => warn!("Unsubscribe from {} failed: {}", remote.peer_url, e),
                }
            }
            self.registry.remove_remote(&remote.peer_url);
            info!("Stopped tracking peer {}", remote.peer_url);
            removed += 1;
        }
        (added, removed)
    }

    // -------------------------------------------------------------------------
    // Audit rounds
    // -------------------------------------------------------------------------

    /// Audit every tracked peer concurrently on the worker pool
    pub async fn audit_all(self: &Arc<Self>) -> Vec<AuditReport> {
        let peers: Vec<String> = self
            .registry
            .all_remote()
            .into_iter()
            .map(|r| r.peer_url)
            .collect();
        if peers.is_empty() {
            return Vec::new();
        }
        debug!("Auditing {} peers", peers.len());

        let handles: Vec<_> = peers
            .into_iter()
            .map(|peer_url| {
                let scheduler = self.clone();
                self.pool.spawn(async move {
                    match tokio::time::timeout(
                        scheduler.config.timeout,
                        scheduler.audit_peer(&peer_url),
                    )
                    .await
                    {
                        Ok(report) => report,
                        Err(_) => scheduler.record_timeout(&peer_url),
                    }
                })
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => debug!("Audit skipped; worker pool closed"),
                Err(e) => warn!("Audit task failed: {}", e),
            }
        }

        let failed = reports.iter().filter(|r| !r.is_success()).count();
        info!(
            "Audit round finished: {} peers, {} failed, {} documents accepted",
            reports.len(),
            failed,
            reports.iter().map(|r| r.accepted).sum::<usize>()
        );
        reports
    }

    fn record_timeout(&self, peer_url: &str) -> AuditReport {
        let error = AuditError::Timeout(peer_url.to_string());
        warn!("{}", error);
        // the cancelled round may have left a transient state behind
        let now = Timestamp::now();
        self.registry.update_remote(peer_url, |r| match r.state {
            RemoteState::Registering => r.with_state(RemoteState::Unregistered, now),
            RemoteState::Expiring => r.with_state(RemoteState::Active, now),
            _ => r.clone(),
        });
        let mut report = AuditReport::new(peer_url);
        report.record_error(&error);
        self.finish(&report);
        report
    }

    /// Run one audit against a single peer
    pub async fn audit_peer(&self, peer_url: &str) -> AuditReport {
        let mut report = AuditReport::new(peer_url);
        if self.registry.get_remote(peer_url).is_none() {
            self.registry
                .upsert_remote(RemoteSubscription::unregistered(peer_url, Timestamp::now()));
        }

        if let Err(e) = self.ensure_subscription(peer_url, &mut report).await {
            warn!("Subscription at {} failed: {}", peer_url, e);
            report.record_error(&e);
        }
        self.pull_manifest(peer_url, &mut report).await;
        self.finish(&report);

        debug!(
            "Audited {}: {} pages, {} fetched, {} accepted, {} transport errors",
            peer_url, report.pages, report.fetched, report.accepted, report.transport_errors
        );
        report
    }

    /// Record the outcome; too many consecutive failures marks the peer Failed
    fn finish(&self, report: &AuditReport) {
        let now = Timestamp::now();
        let max_failures = self.config.max_failures.max(1);
        let updated = self.registry.update_remote(&report.peer_url, |r| {
            let next = r.with_audit(now, report.is_success());
            if next.consecutive_failures >= max_failures && next.state != RemoteState::Failed {
                next.with_state(RemoteState::Failed, now)
            } else {
                next
            }
        });
        if let Some(remote) = updated {
            if remote.state == RemoteState::Failed && !report.is_success() {
                warn!(
                    "Peer {} failed {} consecutive audits",
                    remote.peer_url, remote.consecutive_failures
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Step 1: subscription lifecycle
    // -------------------------------------------------------------------------

    async fn ensure_subscription(
        &self,
        peer_url: &str,
        report: &mut AuditReport,
    ) -> Result<(), AuditError> {
        let now = Timestamp::now();
        let Some(remote) = self.registry.get_remote(peer_url) else {
            return Ok(());
        };

        let renewable = matches!(remote.state, RemoteState::Active | RemoteState::Expiring)
            && remote.subscription.is_some();
        if renewable && !remote.expires_within(self.config.renewal_window(), now) {
            return Ok(());
        }

        if let (true, Some(id)) = (renewable, remote.subscription_id()) {
            self.registry
                .update_remote(peer_url, |r| r.with_state(RemoteState::Expiring, now));
            if let Some(subscription) = self.renew(peer_url, id).await? {
                self.check_grant(peer_url, &subscription);
                self.registry.update_remote(peer_url, |r| {
                    r.with_subscription(subscription.clone(), Timestamp::now())
                });
                report.renewed = true;
                debug!("Renewed subscription at {} until {}", peer_url, subscription.expires);
                return Ok(());
            }
            info!("Subscription at {} is gone; subscribing again", peer_url);
        }

        self.registry
            .update_remote(peer_url, |r| r.with_state(RemoteState::Registering, now));
        match self.subscribe(peer_url).await {
            Ok(subscription) => {
                info!("Subscribed at {} as {}", peer_url, subscription.id);
                self.check_grant(peer_url, &subscription);
                self.registry.update_remote(peer_url, |r| {
                    r.with_subscription(subscription, Timestamp::now())
                });
                report.subscribed = true;
                Ok(())
            }
            Err(e) => {
                let state = if remote.state == RemoteState::Failed {
                    RemoteState::Failed
                } else {
                    RemoteState::Unregistered
                };
                self.registry
                    .update_remote(peer_url, |r| r.with_state(state, Timestamp::now()));
                Err(e)
            }
        }
    }

    /// Peers may grant less than we ask for
    fn check_grant(&self, peer_url: &str, subscription: &Subscription) {
        if subscription.expires < Timestamp::now().plus(self.config.interval) {
            warn!(
                "Subscription at {} expires at {}, before our next audit",
                peer_url, subscription.expires
            );
        }
    }

    async fn subscribe(&self, peer_url: &str) -> Result<Subscription, AuditError> {
        let request = SubscribeRequest {
            requester_id: self.store.node_id().to_string(),
            callback: callback_url(&self.base_url),
            filter: self.config.filter.clone(),
            ttl_secs: self.config.requested_ttl().as_secs(),
        };
        let url = subscriptions_url(peer_url);
        let response = self
            .client
            .post(&url, self.format.encode(&request)?)
            .await?
            .error_for_status(&url)?;
        Ok(self.format.decode(&response.body)?)
    }

    /// Renew at the peer; `None` when the peer no longer knows the subscription
    async fn renew(
        &self,
        peer_url: &str,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, AuditError> {
        let request = RenewRequest {
            ttl_secs: self.config.requested_ttl().as_secs(),
        };
        let url = subscription_url(peer_url, id);
        let response = self
            .client
            .post(&url, self.format.encode(&request)?)
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        let response = response.error_for_status(&url)?;
        Ok(Some(self.format.decode(&response.body)?))
    }

    // -------------------------------------------------------------------------
    // Step 2: manifest reconciliation
    // -------------------------------------------------------------------------

    async fn pull_manifest(&self, peer_url: &str, report: &mut AuditReport) {
        let page_size = self.config.page_size.max(1);
        let mut offset = 0;
        loop {
            let mut page = match self.fetch_page(peer_url, offset, page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("Manifest page {} from {} failed: {}", offset, peer_url, e);
                    report.record_error(&e);
                    return;
                }
            };
            report.pages += 1;
            // page from the offset we asked for, whatever the peer echoes back
            page.offset = offset;

            for entry in &page.entries {
                self.reconcile_entry(peer_url, entry, report).await;
            }

            match page.next_offset() {
                Some(next) if next > offset => offset = next,
                _ => return,
            }
        }
    }

    async fn fetch_page(
        &self,
        peer_url: &str,
        offset: usize,
        limit: usize,
    ) -> Result<ManifestPage, AuditError> {
        let url = manifest_url(peer_url, offset, limit);
        let response = self.client.get(&url).await?.error_for_status(&url)?;
        Ok(self.format.decode(&response.body)?)
    }

    async fn reconcile_entry(&self, peer_url: &str, entry: &ManifestEntry, report: &mut AuditReport) {
        if self.store.is_local(&entry.key) {
            return;
        }
        if let Some(expires) = entry.expires {
            if expires <= Timestamp::now() {
                return;
            }
        }
        if matches!(self.store.version_of(&entry.key), Some(local) if local >= entry.version) {
            return;
        }

        let document =
            match fetch_document(self.client.as_ref(), self.format, peer_url, &entry.key).await {
                Ok(document) => document,
                Err(e) if e.is_transport() => {
                    warn!("Fetching {} from {}: {}", entry.key, peer_url, e);
                    report.transport_errors += 1;
                    if report.error.is_none() {
                        report.error = Some(e.to_string());
                    }
                    return;
                }
                Err(e) => {
                    warn!("Skipping {} from {}: {}", entry.key, peer_url, e);
                    report.decode_errors += 1;
                    return;
                }
            };
        report.fetched += 1;

        let initiator = Initiator::Audit {
            peer_url: peer_url.to_string(),
        };
        match ingest(&self.store, self.verifier.as_deref(), document, initiator) {
            IngestOutcome::Accepted(_) => report.accepted += 1,
            IngestOutcome::Ignored(_) => report.ignored += 1,
            IngestOutcome::Rejected(_) => report.rejected += 1,
        }
    }

    // -------------------------------------------------------------------------
    // Loop
    // -------------------------------------------------------------------------

    /// Audit on every tick until shutdown; the first round runs immediately
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Audit scheduler started (every {:?})", self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = self.audit_all() => {}
                        _ = shutdown.recv() => break,
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Audit scheduler stopped");
    }
}
