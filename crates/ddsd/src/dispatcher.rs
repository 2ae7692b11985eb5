//! Notification dispatcher
//!
//! Outbound: store events are queued per matching subscriber and flushed in
//! bounded batches to each callback as pool tasks, retried with exponential
//! backoff. Delivery is at-least-once and best effort; audits repair drops.
//!
//! Inbound: batches posted to our callback are merged into the store.

use crate::document_store::DocumentStore;
use crate::ingest::{fetch_document, ingest, IngestOutcome};
use crate::pool::WorkerPool;
use crate::registry::SubscriptionRegistry;
use dds_core::crypto::DocumentVerifier;
use dds_core::types::*;
use dds_net::messages::CallbackAck;
use dds_net::{HttpClient, Notification, NotificationBatch, WireFormat};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Most events drained from the channel before a flush
const MAX_DRAIN: usize = 1024;

/// Delivery tuning
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Most notifications per POST
    pub batch_size: usize,
    /// Attempts per batch, including the first
    pub delivery_attempts: u32,
    /// Backoff before the second attempt; doubles after each failure
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            delivery_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    /// Delay after failed attempt number `attempt` (1-based), with up to 10% jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.backoff_max);
        let jitter_ms = capped.as_millis() as u64 / 10;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }
}

/// Outcome of one batch delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered { attempts: u32, notifications: usize },
    /// Gave up after all attempts
    Dropped { attempts: u32, notifications: usize },
    /// Subscription went away before delivery finished
    Cancelled,
}

/// Summary of an inbound batch
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundReport {
    pub accepted: usize,
    pub deleted: usize,
    pub ignored: usize,
    pub rejected: usize,
    pub decode_errors: usize,
    pub transport_errors: usize,
    /// Peer whose subscription this batch correlated to
    pub peer_url: Option<String>,
}

impl InboundReport {
    pub fn ack(&self) -> CallbackAck {
        CallbackAck {
            accepted: self.accepted + self.deleted,
            ignored: self.ignored,
            failed: self.rejected + self.decode_errors + self.transport_errors,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    delivered_batches: AtomicU64,
    delivered_notifications: AtomicU64,
    dropped_batches: AtomicU64,
    failed_attempts: AtomicU64,
    inbound_batches: AtomicU64,
}

struct PendingQueue {
    subscription: Subscription,
    notifications: VecDeque<Notification>,
}

/// Routes document changes to subscribers and merges inbound changes
pub struct NotificationDispatcher {
    store: Arc<DocumentStore>,
    registry: Arc<SubscriptionRegistry>,
    client: Arc<dyn HttpClient>,
    pool: WorkerPool,
    format: WireFormat,
    verifier: Option<Arc<dyn DocumentVerifier>>,
    config: DispatcherConfig,
    pending: Mutex<HashMap<SubscriptionId, PendingQueue>>,
    counters: Arc<Counters>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<DocumentStore>,
        registry: Arc<SubscriptionRegistry>,
        client: Arc<dyn HttpClient>,
        pool: WorkerPool,
        format: WireFormat,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            client,
            pool,
            format,
            verifier: None,
            config,
            pending: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Verify signatures on inbound documents
    pub fn with_verifier(mut self, verifier: Arc<dyn DocumentVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Queue and immediately flush deliveries for one event
    pub fn on_event(&self, event: NotificationEvent) -> Vec<JoinHandle<Option<DeliveryReport>>> {
        self.enqueue(&event);
        self.flush()
    }

    /// Queue `event` for every matching subscriber; returns the subscriber count
    pub fn enqueue(&self, event: &NotificationEvent) -> usize {
        let subscriptions = self.registry.matching(event);
        if subscriptions.is_empty() {
            return 0;
        }
        debug!(
            "{} {} ({}) -> {} subscribers",
            event.kind,
            event.key,
            event.initiator,
            subscriptions.len()
        );

        let notification = Notification::from_event(event);
        let mut pending = self.pending.lock();
        for subscription in &subscriptions {
            let queue = pending
                .entry(subscription.id.clone())
                .or_insert_with(|| PendingQueue {
                    subscription: subscription.clone(),
                    notifications: VecDeque::new(),
                });
            queue.subscription = subscription.clone();
            queue.notifications.push_back(notification.clone());
        }
        subscriptions.len()
    }

    /// Hand every queued notification to the pool, in batches
    pub fn flush(&self) -> Vec<JoinHandle<Option<DeliveryReport>>> {
        let drained: Vec<PendingQueue> = self.pending.lock().drain().map(|(_, q)| q).collect();
        let batch_size = self.config.batch_size.max(1);

        let mut handles = Vec::new();
        for mut queue in drained {
            while !queue.notifications.is_empty() {
                let take = queue.notifications.len().min(batch_size);
                let notifications: Vec<Notification> = queue.notifications.drain(..take).collect();
                let delivery = Delivery {
                    batch: NotificationBatch {
                        subscription_id: queue.subscription.id.clone(),
                        provider_id: self.store.node_id().to_string(),
                        notifications,
                    },
                    callback: queue.subscription.callback.clone(),
                    client: self.client.clone(),
                    registry: self.registry.clone(),
                    format: self.format,
                    config: self.config.clone(),
                    counters: self.counters.clone(),
                };
                handles.push(self.pool.spawn(delivery.run()));
            }
        }
        handles
    }

    /// Consume store events until shutdown
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<NotificationEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Notification dispatcher started");
        loop {
            tokio::select! {
                received = events.recv() => {
                    let Some(event) = received else { break };
                    self.enqueue(&event);
                    // coalesce whatever else is already waiting into the same flush
                    let mut drained = 0;
                    while drained < MAX_DRAIN {
                        match events.try_recv() {
                            Ok(event) => {
                                self.enqueue(&event);
                                drained += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    self.flush();
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
        info!("Notification dispatcher stopped");
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Merge a batch posted to our callback by a peer
    pub async fn on_inbound_notification(&self, batch: NotificationBatch) -> InboundReport {
        self.counters.inbound_batches.fetch_add(1, Ordering::Relaxed);
        let remote = self.registry.find_remote_by_subscription(&batch.subscription_id);
        let initiator = Initiator::Notification {
            provider_id: batch.provider_id.clone(),
        };
        let mut report = InboundReport {
            peer_url: remote.as_ref().map(|r| r.peer_url.clone()),
            ..Default::default()
        };

        for notification in batch.notifications {
            if self.store.is_local(&notification.key) {
                report.ignored += 1;
                continue;
            }

            if notification.kind == EventKind::Deleted {
                if self
                    .store
                    .remove_from(&notification.key, initiator.clone())
                    .is_some()
                {
                    report.deleted += 1;
                } else {
                    report.ignored += 1;
                }
                continue;
            }

            let document = match notification.document {
                Some(document) if document.key == notification.key => document,
                Some(document) => {
                    warn!(
                        "Notification for {} carried {}; skipping",
                        notification.key, document.key
                    );
                    report.rejected += 1;
                    continue;
                }
                None => {
                    let Some(remote) = &remote else {
                        debug!(
                            "No embedded document for {} and no known peer to fetch from",
                            notification.key
                        );
                        report.rejected += 1;
                        continue;
                    };
                    match fetch_document(
                        self.client.as_ref(),
                        self.format,
                        &remote.peer_url,
                        &notification.key,
                    )
                    .await
                    {
                        Ok(document) => document,
                        Err(e) if e.is_transport() => {
                            warn!("Fetching {} from {}: {}", notification.key, remote.peer_url, e);
                            report.transport_errors += 1;
                            continue;
                        }
                        Err(e) => {
                            warn!("Fetching {} from {}: {}", notification.key, remote.peer_url, e);
                            report.decode_errors += 1;
                            continue;
                        }
                    }
                }
            };

            match ingest(&self.store, self.verifier.as_deref(), document, initiator.clone()) {
                IngestOutcome::Accepted(_) => report.accepted += 1,
                IngestOutcome::Ignored(_) => report.ignored += 1,
                IngestOutcome::Rejected(_) => report.rejected += 1,
            }
        }

        if let Some(remote) = &remote {
            if report.transport_errors == 0 {
                let now = Timestamp::now();
                self.registry
                    .update_remote(&remote.peer_url, |r| r.with_notification_success(now));
            }
        }
        debug!(
            "Inbound batch from {}: {} accepted, {} deleted, {} ignored, {} failed",
            batch.provider_id,
            report.accepted,
            report.deleted,
            report.ignored,
            report.rejected + report.decode_errors + report.transport_errors
        );
        report
    }

    /// Dispatcher statistics
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            pending: self
                .pending
                .lock()
                .values()
                .map(|q| q.notifications.len())
                .sum(),
            delivered_batches: self.counters.delivered_batches.load(Ordering::Relaxed),
            delivered_notifications: self.counters.delivered_notifications.load(Ordering::Relaxed),
            dropped_batches: self.counters.dropped_batches.load(Ordering::Relaxed),
            failed_attempts: self.counters.failed_attempts.load(Ordering::Relaxed),
            inbound_batches: self.counters.inbound_batches.load(Ordering::Relaxed),
        }
    }
}

/// Dispatcher statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherStats {
    pub pending: usize,
    pub delivered_batches: u64,
    pub delivered_notifications: u64,
    pub dropped_batches: u64,
    pub failed_attempts: u64,
    pub inbound_batches: u64,
}

/// One batch on its way to one subscriber
struct Delivery {
    batch: NotificationBatch,
    callback: String,
    client: Arc<dyn HttpClient>,
    registry: Arc<SubscriptionRegistry>,
    format: WireFormat,
    config: DispatcherConfig,
    counters: Arc<Counters>,
}

impl Delivery {
    async fn run(self) -> DeliveryReport {
        let notifications = self.batch.notifications.len();
        let body = match self.format.encode(&self.batch) {
            Ok(body) => body,
            Err(e) => {
                warn!("Cannot encode batch for {}: {}", self.batch.subscription_id, e);
                self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                return DeliveryReport::Dropped {
                    attempts: 0,
                    notifications,
                };
            }
        };

        let attempts = self.config.delivery_attempts.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 && self.registry.get(&self.batch.subscription_id).is_none() {
                debug!("Subscription {} gone; abandoning delivery", self.batch.subscription_id);
                return DeliveryReport::Cancelled;
            }

            let result = self
                .client
                .post(&self.callback, body.clone())
                .await
                .and_then(|response| response.error_for_status(&self.callback));
            match result {
                Ok(_) => {
                    self.counters.delivered_batches.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .delivered_notifications
                        .fetch_add(notifications as u64, Ordering::Relaxed);
                    debug!(
                        "Delivered {} notifications to {} (attempt {})",
                        notifications, self.callback, attempt
                    );
                    return DeliveryReport::Delivered {
                        attempts: attempt,
                        notifications,
                    };
                }
                Err(e) => {
                    self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Delivery to {} failed (attempt {}/{}): {}",
                        self.callback, attempt, attempts, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.backoff(attempt)).await;
                    }
                }
            }
        }

        self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Dropping {} notifications for {} after {} attempts",
            notifications, self.batch.subscription_id, attempts
        );
        DeliveryReport::Dropped {
            attempts,
            notifications,
        }
    }
}
