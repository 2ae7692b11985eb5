//! Core data model for the document distribution service
//!
//! Every type here crosses the wire, so everything derives serde. Field order
//! matters for the canonical (postcard) encoding used when signing documents.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 32-byte fixed-size array used for hashes and public keys.
pub type Bytes32 = [u8; 32];

/// Domain prefix for document key digests
pub const DOMAIN_DOCUMENT_KEY: &[u8] = b"dds-document-key";

// =============================================================================
// TIME
// =============================================================================

/// Wall-clock instant as unix milliseconds.
///
/// Immutable: arithmetic returns a new value.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// This instant shifted forward by `duration`
    pub fn plus(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }

    /// This instant shifted back by `duration`
    pub fn minus(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }

    /// Time elapsed from `earlier` to this instant (zero if `earlier` is later)
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// Composite document identity: (owner, type, id)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentKey {
    pub owner_id: String,
    pub document_type: String,
    pub document_id: String,
}

impl DocumentKey {
    pub fn new(
        owner_id: impl Into<String>,
        document_type: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            document_type: document_type.into(),
            document_id: document_id.into(),
        }
    }

    /// All three components present
    pub fn is_complete(&self) -> bool {
        !self.owner_id.is_empty() && !self.document_type.is_empty() && !self.document_id.is_empty()
    }

    /// Fixed-length digest: BLAKE3("dds-document-key" || owner || 0 || type || 0 || id)
    ///
    /// Used as the persistent storage key.
    pub fn digest(&self) -> Bytes32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN_DOCUMENT_KEY);
        hasher.update(self.owner_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.document_type.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.document_id.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner_id, self.document_type, self.document_id)
    }
}

/// Detached Ed25519 signature over a document's canonical bytes
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentSignature {
    /// Signer's public key
    pub public_key: Bytes32,
    /// 64-byte signature
    pub signature: Vec<u8>,
}

/// A versioned, expiring document
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub key: DocumentKey,
    /// Logical timestamp assigned by the owner; higher wins
    pub version: u64,
    /// Expiration instant. `None` only on malformed input.
    pub expires: Option<Timestamp>,
    /// Opaque payload
    pub content: Vec<u8>,
    pub signature: Option<DocumentSignature>,
    /// When this node first learned of the document
    pub discovered: Timestamp,
}

impl Document {
    pub fn new(key: DocumentKey, version: u64, expires: Timestamp, content: Vec<u8>) -> Self {
        Self {
            key,
            version,
            expires: Some(expires),
            content,
            signature: None,
            discovered: Timestamp::now(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.key.owner_id
    }

    /// Expired when the expiration is at or before `now`
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        matches!(self.expires, Some(expires) if expires <= now)
    }

    pub fn with_discovered(mut self, discovered: Timestamp) -> Self {
        self.discovered = discovered;
        self
    }

    pub fn with_signature(mut self, signature: DocumentSignature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            key: self.key.clone(),
            version: self.version,
            expires: self.expires,
        }
    }
}

/// One (key, version) pair of a peer's manifest
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub key: DocumentKey,
    pub version: u64,
    pub expires: Option<Timestamp>,
}

/// Listing filter over owner and/or type
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentFilter {
    pub owner_id: Option<String>,
    pub document_type: Option<String>,
}

impl DocumentFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            document_type: None,
        }
    }

    pub fn accepts(&self, key: &DocumentKey) -> bool {
        self.owner_id.as_deref().map_or(true, |o| o == key.owner_id)
            && self
                .document_type
                .as_deref()
                .map_or(true, |t| t == key.document_type)
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// Document change kind
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    /// Subscription-side wildcard
    All,
}

impl EventKind {
    /// Whether a subscription asking for `self` wants an event of `kind`
    pub fn covers(&self, kind: EventKind) -> bool {
        *self == EventKind::All || *self == kind
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Created => "CREATED",
            EventKind::Updated => "UPDATED",
            EventKind::Deleted => "DELETED",
            EventKind::All => "ALL",
        };
        f.write_str(s)
    }
}

/// Provenance tag carried by events, for logging only
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Initiator {
    /// Published or removed through the local API
    Local,
    /// Merged from a peer's notification
    Notification { provider_id: String },
    /// Merged during an audit of a peer
    Audit { peer_url: String },
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initiator::Local => f.write_str("local"),
            Initiator::Notification { provider_id } => write!(f, "notification:{}", provider_id),
            Initiator::Audit { peer_url } => write!(f, "audit:{}", peer_url),
        }
    }
}

/// A document change, emitted by the store on every accepted mutation
#[derive(Clone, Debug)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub key: DocumentKey,
    /// The new document; `None` for Deleted
    pub document: Option<Document>,
    pub discovered: Timestamp,
    pub initiator: Initiator,
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// Opaque subscription handle
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a subscriber wants to hear about
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub owner_id: Option<String>,
    pub document_type: Option<String>,
    /// Empty means every kind
    pub events: Vec<EventKind>,
}

impl SubscriptionFilter {
    pub fn accepts(&self, kind: EventKind, key: &DocumentKey) -> bool {
        let kind_ok = self.events.is_empty() || self.events.iter().any(|e| e.covers(kind));
        kind_ok
            && self.owner_id.as_deref().map_or(true, |o| o == key.owner_id)
            && self
                .document_type
                .as_deref()
                .map_or(true, |t| t == key.document_type)
    }
}

/// A subscription held by this node on behalf of a remote requester
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub requester_id: String,
    /// Callback endpoint receiving notification batches
    pub callback: String,
    pub filter: SubscriptionFilter,
    pub created: Timestamp,
    pub last_modified: Timestamp,
    pub expires: Timestamp,
}

impl Subscription {
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires <= now
    }
}

/// Lifecycle of this node's subscription against a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteState {
    Unregistered,
    Registering,
    Active,
    /// Active but inside the renewal window
    Expiring,
    /// Too many consecutive audit failures; retried next cycle
    Failed,
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// This node's subscription against a peer
///
/// Never mutated in place: every `with_*` call returns a new value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSubscription {
    pub peer_url: String,
    /// Handle returned by the peer, once registered
    pub subscription: Option<Subscription>,
    pub state: RemoteState,
    pub created: Timestamp,
    pub last_modified: Timestamp,
    pub last_audit: Option<Timestamp>,
    pub last_successful_audit: Option<Timestamp>,
    pub consecutive_failures: u32,
}

impl RemoteSubscription {
    /// A peer we know about but have not registered with yet
    pub fn unregistered(peer_url: impl Into<String>, now: Timestamp) -> Self {
        Self {
            peer_url: peer_url.into(),
            subscription: None,
            state: RemoteState::Unregistered,
            created: now,
            last_modified: now,
            last_audit: None,
            last_successful_audit: None,
            consecutive_failures: 0,
        }
    }

    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        self.subscription.as_ref().map(|s| &s.id)
    }

    pub fn with_state(&self, state: RemoteState, now: Timestamp) -> Self {
        Self {
            state,
            last_modified: now,
            ..self.clone()
        }
    }

    /// Registered or renewed at the peer; also stamps `last_audit`
    pub fn with_subscription(&self, subscription: Subscription, now: Timestamp) -> Self {
        Self {
            subscription: Some(subscription),
            state: RemoteState::Active,
            last_modified: now,
            last_audit: Some(self.last_audit.map_or(now, |a| a.max(now))),
            consecutive_failures: 0,
            ..self.clone()
        }
    }

    /// An audit ran; `success` also advances `last_successful_audit`
    pub fn with_audit(&self, now: Timestamp, success: bool) -> Self {
        Self {
            last_audit: Some(now),
            last_successful_audit: if success {
                Some(now)
            } else {
                self.last_successful_audit
            },
            consecutive_failures: if success { 0 } else { self.consecutive_failures + 1 },
            ..self.clone()
        }
    }

    /// A notification from this peer was fully merged
    pub fn with_notification_success(&self, now: Timestamp) -> Self {
        Self {
            last_audit: Some(self.last_audit.map_or(now, |a| a.max(now))),
            last_successful_audit: Some(now),
            ..self.clone()
        }
    }

    /// Whether the peer-side subscription expires within `window` of `now`
    pub fn expires_within(&self, window: Duration, now: Timestamp) -> bool {
        match &self.subscription {
            Some(sub) => sub.expires <= now.plus(window),
            None => true,
        }
    }
}
