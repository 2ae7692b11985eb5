//! Subscription registry
//!
//! Local subscriptions are held on behalf of peers that want our changes.
//! Remote subscriptions are the ones this node holds against its peers,
//! keyed by peer base URL.

use dds_core::types::*;
use dds_core::MonotonicClock;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Shortest lifetime granted to a local subscription
pub const MIN_SUBSCRIPTION_TTL: Duration = Duration::from_secs(60);

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid callback URL: {0}")]
    InvalidCallback(String),
    #[error("Missing requester id")]
    MissingRequester,
}

/// Registry of local and remote subscriptions
pub struct SubscriptionRegistry {
    node_id: String,
    clock: Arc<MonotonicClock>,
    /// Longest lifetime granted to a local subscription
    max_ttl: Duration,
    local: RwLock<HashMap<SubscriptionId, Subscription>>,
    remote: RwLock<HashMap<String, RemoteSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new(node_id: impl Into<String>, clock: Arc<MonotonicClock>, max_ttl: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            clock,
            max_ttl: max_ttl.max(MIN_SUBSCRIPTION_TTL),
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
        }
    }

    fn clamp_ttl(&self, ttl: Duration) -> Duration {
        ttl.clamp(MIN_SUBSCRIPTION_TTL, self.max_ttl)
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(format!("{}:sub:{:016x}", self.node_id, self.clock.next()))
    }

    // -------------------------------------------------------------------------
    // Local subscriptions
    // -------------------------------------------------------------------------

    /// Register a peer's subscription
    pub fn subscribe(
        &self,
        requester_id: impl Into<String>,
        callback: impl Into<String>,
        filter: SubscriptionFilter,
        ttl: Duration,
    ) -> Result<Subscription, RegistryError> {
        let requester_id = requester_id.into();
        let callback = callback.into();
        if requester_id.is_empty() {
            return Err(RegistryError::MissingRequester);
        }
        dds_net::normalize_peer_url(&callback)
            .map_err(|e| RegistryError::InvalidCallback(e.to_string()))?;

        let now = Timestamp::now();
        let subscription = Subscription {
            id: self.next_id(),
            requester_id,
            callback,
            filter,
            created: now,
            last_modified: now,
            expires: now.plus(self.clamp_ttl(ttl)),
        };
        info!(
            "New subscription {} from {} -> {}",
            subscription.id, subscription.requester_id, subscription.callback
        );
        self.local
            .write()
            .insert(subscription.id.clone(), subscription.clone());
        Ok(subscription)
    }

    /// Extend a live subscription
    pub fn renew(&self, id: &SubscriptionId, ttl: Duration) -> Option<Subscription> {
        let now = Timestamp::now();
        let mut local = self.local.write();
        let current = local.get(id).filter(|s| !s.is_expired_at(now))?;
        let renewed = Subscription {
            last_modified: now,
            expires: now.plus(self.clamp_ttl(ttl)),
            ..current.clone()
        };
        local.insert(id.clone(), renewed.clone());
        debug!("Renewed subscription {} until {}", id, renewed.expires);
        Some(renewed)
    }

    /// Drop a subscription; true if it existed
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.local.write().remove(id).is_some();
        if removed {
            info!("Removed subscription {}", id);
        }
        removed
    }

    /// Live subscription by id
    pub fn get(&self, id: &SubscriptionId) -> Option<Subscription> {
        let now = Timestamp::now();
        self.local
            .read()
            .get(id)
            .filter(|s| !s.is_expired_at(now))
            .cloned()
    }

    /// Live subscriptions whose filter accepts `event`
    pub fn matching(&self, event: &NotificationEvent) -> Vec<Subscription> {
        let now = Timestamp::now();
        self.local
            .read()
            .values()
            .filter(|s| !s.is_expired_at(now) && s.filter.accepts(event.kind, &event.key))
            .cloned()
            .collect()
    }

    /// Remove expired local subscriptions
    pub fn expire_sweep(&self) -> usize {
        self.expire_sweep_at(Timestamp::now())
    }

    pub fn expire_sweep_at(&self, now: Timestamp) -> usize {
        let mut local = self.local.write();
        let before = local.len();
        local.retain(|_, s| !s.is_expired_at(now));
        let removed = before - local.len();
        if removed > 0 {
            info!("Expired {} subscriptions", removed);
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Remote subscriptions
    // -------------------------------------------------------------------------

    /// Insert or replace the record for `remote.peer_url`
    pub fn upsert_remote(&self, remote: RemoteSubscription) {
        self.remote.write().insert(remote.peer_url.clone(), remote);
    }

    /// Atomically replace the record for `peer_url` with `f(current)`
    pub fn update_remote<F>(&self, peer_url: &str, f: F) -> Option<RemoteSubscription>
    where
        F: FnOnce(&RemoteSubscription) -> RemoteSubscription,
    {
        let mut remote = self.remote.write();
        let current = remote.get(peer_url)?;
        let next = f(current);
        remote.insert(peer_url.to_string(), next.clone());
        Some(next)
    }

    pub fn get_remote(&self, peer_url: &str) -> Option<RemoteSubscription> {
        self.remote.read().get(peer_url).cloned()
    }

    pub fn remove_remote(&self, peer_url: &str) -> Option<RemoteSubscription> {
        self.remote.write().remove(peer_url)
    }

    pub fn all_remote(&self) -> Vec<RemoteSubscription> {
        self.remote.read().values().cloned().collect()
    }

    /// Remote record whose peer-issued subscription id is `id`
    pub fn find_remote_by_subscription(&self, id: &SubscriptionId) -> Option<RemoteSubscription> {
        self.remote
            .read()
            .values()
            .find(|r| r.subscription_id() == Some(id))
            .cloned()
    }

    /// Registry statistics
    pub fn stats(&self) -> RegistryStats {
        let remote = self.remote.read();
        RegistryStats {
            local: self.local.read().len(),
            remote: remote.len(),
            remote_active: remote
                .values()
                .filter(|r| r.state == RemoteState::Active)
                .count(),
            remote_failed: remote
                .values()
                .filter(|r| r.state == RemoteState::Failed)
                .count(),
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub local: usize,
    pub remote: usize,
    pub remote_active: usize,
    pub remote_failed: usize,
}
