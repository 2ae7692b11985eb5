//! Versioned, expiring document store
//!
//! One entry per [`DocumentKey`], always the highest version seen. Every
//! accepted mutation emits a [`NotificationEvent`] on the configured channel.

use crate::storage::{Storage, StorageError, META_CLOCK_FLOOR};
use dds_core::crypto::{sign_document, DocumentSigner};
use dds_core::types::*;
use dds_core::MonotonicClock;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    #[error("Signing failed: {0}")]
    Signing(#[from] dds_core::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result of a version-checked put
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// No live document existed for the key
    Created,
    /// Replaced a lower version
    Updated,
    /// An equal or higher version is already held
    Stale,
    /// Arrived already past its expiration; not stored
    Expired,
}

impl PutOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PutOutcome::Created | PutOutcome::Updated)
    }
}

/// Authoritative document cache
pub struct DocumentStore {
    /// This node's NSA id; owner of locally published documents
    node_id: String,
    documents: RwLock<HashMap<DocumentKey, Document>>,
    clock: Arc<MonotonicClock>,
    storage: Option<Arc<Storage>>,
    signer: Option<Arc<dyn DocumentSigner>>,
    events: Option<mpsc::UnboundedSender<NotificationEvent>>,
}

impl DocumentStore {
    /// Create an empty, memory-only store
    pub fn new(node_id: impl Into<String>, clock: Arc<MonotonicClock>) -> Self {
        Self {
            node_id: node_id.into(),
            documents: RwLock::new(HashMap::new()),
            clock,
            storage: None,
            signer: None,
            events: None,
        }
    }

    /// Load persisted documents and mirror all future mutations to `storage`
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Result<Self, StoreError> {
        let now = Timestamp::now();
        let mut loaded = HashMap::new();
        let mut dropped = Vec::new();

        for result in storage.all_documents() {
            let document = result?;
            if document.is_expired_at(now) {
                dropped.push(document.key);
                continue;
            }
            if document.owner_id() == self.node_id {
                self.clock.observe(document.version);
            }
            loaded.insert(document.key.clone(), document);
        }
        for key in &dropped {
            storage.remove_document(key)?;
        }
        if let Some(floor) = storage.get_u64(META_CLOCK_FLOOR)? {
            self.clock.observe(floor);
        }

        info!(
            "Loaded {} documents from storage ({} expired dropped)",
            loaded.len(),
            dropped.len()
        );
        self.documents = RwLock::new(loaded);
        self.storage = Some(storage);
        Ok(self)
    }

    /// Sign documents published through [`DocumentStore::publish`]
    pub fn with_signer(mut self, signer: Arc<dyn DocumentSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Emit change events on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<NotificationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether `key` belongs to a document this node is authoritative for
    pub fn is_local(&self, key: &DocumentKey) -> bool {
        key.owner_id == self.node_id
    }

    fn validate(document: &Document) -> Result<(), StoreError> {
        if document.key.owner_id.is_empty() {
            return Err(StoreError::InvalidDocument("missing owner id".into()));
        }
        if !document.key.is_complete() {
            return Err(StoreError::InvalidDocument(format!(
                "incomplete key {}",
                document.key
            )));
        }
        if document.expires.is_none() {
            return Err(StoreError::InvalidDocument(format!(
                "missing expiration on {}",
                document.key
            )));
        }
        Ok(())
    }

    fn emit(&self, kind: EventKind, key: DocumentKey, document: Option<Document>, now: Timestamp, initiator: Initiator) {
        if let Some(events) = &self.events {
            let event = NotificationEvent {
                kind,
                key,
                document,
                discovered: now,
                initiator,
            };
            if events.send(event).is_err() {
                debug!("Event channel closed; dropping {} event", kind);
            }
        }
    }

    /// Version-checked insert of a locally originated document
    pub fn put(&self, document: Document) -> Result<PutOutcome, StoreError> {
        self.merge(document, Initiator::Local)
    }

    /// Version-checked insert tagged with its provenance
    pub fn merge(&self, document: Document, initiator: Initiator) -> Result<PutOutcome, StoreError> {
        self.merge_at(document, initiator, Timestamp::now())
    }

    /// Version-checked insert as of `now`
    ///
    /// The compare and the replace happen under one write lock, so for any key
    /// the highest version wins regardless of arrival order and equal versions
    /// are stale.
    pub fn merge_at(
        &self,
        document: Document,
        initiator: Initiator,
        now: Timestamp,
    ) -> Result<PutOutcome, StoreError> {
        Self::validate(&document)?;
        if document.is_expired_at(now) {
            debug!("Ignoring expired document {} v{}", document.key, document.version);
            return Ok(PutOutcome::Expired);
        }

        let mut documents = self.documents.write();
        let outcome = match documents.get(&document.key) {
            Some(existing) if existing.version >= document.version => return Ok(PutOutcome::Stale),
            Some(existing) if !existing.is_expired_at(now) => PutOutcome::Updated,
            _ => PutOutcome::Created,
        };

        let document = document.with_discovered(now);
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.put_document(&document) {
                warn!("Failed to persist {}: {}", document.key, e);
            }
        }
        debug!(
            "{} {} v{} ({})",
            if outcome == PutOutcome::Created { "Created" } else { "Updated" },
            document.key,
            document.version,
            initiator
        );

        let kind = if outcome == PutOutcome::Created {
            EventKind::Created
        } else {
            EventKind::Updated
        };
        let key = document.key.clone();
        documents.insert(key.clone(), document.clone());
        self.emit(kind, key, Some(document), now, initiator);
        Ok(outcome)
    }

    /// Live document for `key`
    pub fn get(&self, key: &DocumentKey) -> Option<Document> {
        let now = Timestamp::now();
        self.documents
            .read()
            .get(key)
            .filter(|d| !d.is_expired_at(now))
            .cloned()
    }

    /// Version currently held for `key`, live or not yet swept
    pub fn version_of(&self, key: &DocumentKey) -> Option<u64> {
        self.documents.read().get(key).map(|d| d.version)
    }

    /// Remove regardless of version
    pub fn remove(&self, key: &DocumentKey) -> Option<Document> {
        self.remove_from(key, Initiator::Local)
    }

    /// Remove regardless of version, tagged with its provenance
    pub fn remove_from(&self, key: &DocumentKey, initiator: Initiator) -> Option<Document> {
        let now = Timestamp::now();
        let mut documents = self.documents.write();
        let removed = documents.remove(key)?;

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove_document(key) {
                warn!("Failed to remove {} from storage: {}", key, e);
            }
        }
        if removed.is_expired_at(now) {
            return None;
        }
        debug!("Deleted {} v{} ({})", key, removed.version, initiator);
        self.emit(EventKind::Deleted, key.clone(), None, now, initiator);
        Some(removed)
    }

    /// Snapshot of live documents accepted by `filter`
    pub fn list(&self, filter: &DocumentFilter) -> Vec<Document> {
        let now = Timestamp::now();
        self.documents
            .read()
            .values()
            .filter(|d| !d.is_expired_at(now) && filter.accepts(&d.key))
            .cloned()
            .collect()
    }

    /// One page of the manifest, in key order; returns (total, entries)
    pub fn manifest(&self, offset: usize, limit: usize) -> (usize, Vec<ManifestEntry>) {
        let now = Timestamp::now();
        let mut entries: Vec<ManifestEntry> = self
            .documents
            .read()
            .values()
            .filter(|d| !d.is_expired_at(now))
            .map(|d| d.manifest_entry())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let total = entries.len();
        let page = entries.into_iter().skip(offset).take(limit).collect();
        (total, page)
    }

    /// Remove every document whose expiration has passed
    pub fn expire_sweep(&self) -> usize {
        self.expire_sweep_at(Timestamp::now())
    }

    /// Remove every document whose expiration is at or before `now`
    pub fn expire_sweep_at(&self, now: Timestamp) -> usize {
        let mut documents = self.documents.write();
        let expired: Vec<DocumentKey> = documents
            .values()
            .filter(|d| d.is_expired_at(now))
            .map(|d| d.key.clone())
            .collect();

        for key in &expired {
            documents.remove(key);
            if let Some(storage) = &self.storage {
                if let Err(e) = storage.remove_document(key) {
                    warn!("Failed to remove expired {} from storage: {}", key, e);
                }
            }
        }
        if !expired.is_empty() {
            info!("Expired {} documents", expired.len());
        }
        expired.len()
    }

    /// Create or replace a document owned by this node
    pub fn publish(
        &self,
        document_type: impl Into<String>,
        document_id: impl Into<String>,
        content: Vec<u8>,
        lifetime: Duration,
    ) -> Result<Document, StoreError> {
        let key = DocumentKey::new(self.node_id.clone(), document_type, document_id);
        if let Some(existing) = self.version_of(&key) {
            self.clock.observe(existing);
        }
        let now = Timestamp::now();
        let version = self.clock.next();
        let mut document = Document::new(key, version, now.plus(lifetime), content);
        if let Some(signer) = &self.signer {
            document = sign_document(signer.as_ref(), document)?;
        }
        if let Some(storage) = &self.storage {
            storage.put_u64(META_CLOCK_FLOOR, version)?;
        }

        match self.merge_at(document.clone(), Initiator::Local, now)? {
            outcome if outcome.is_accepted() => {
                info!("Published {} v{}", document.key, version);
                Ok(document.with_discovered(now))
            }
            outcome => Err(StoreError::InvalidDocument(format!(
                "publish of {} not accepted: {:?}",
                document.key, outcome
            ))),
        }
    }

    /// Number of live documents
    pub fn len(&self) -> usize {
        let now = Timestamp::now();
        self.documents
            .read()
            .values()
            .filter(|d| !d.is_expired_at(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store statistics
    pub fn stats(&self) -> StoreStats {
        let now = Timestamp::now();
        let documents = self.documents.read();
        let live = documents.values().filter(|d| !d.is_expired_at(now)).count();
        StoreStats {
            total: documents.len(),
            live,
            expired_pending: documents.len() - live,
            owned: documents.keys().filter(|k| self.is_local(k)).count(),
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub live: usize,
    pub expired_pending: usize,
    pub owned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dds_core::crypto::{verify_document, Ed25519Verifier, KeyPair};
    use tempfile::tempdir;

    const YEAR: Duration = Duration::from_secs(365 * 24 * 3600);

    fn create_test_store() -> (DocumentStore, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = DocumentStore::new("urn:nsa:local", Arc::new(MonotonicClock::new())).with_events(tx);
        (store, rx)
    }

    fn doc(id: &str, version: u64) -> Document {
        Document::new(
            DocumentKey::new("urn:nsa:peer", "nsa", id),
            version,
            Timestamp::now().plus(YEAR),
            format!("v{}", version).into_bytes(),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<NotificationEvent>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[test]
    fn test_highest_version_wins_in_order() {
        let (store, mut rx) = create_test_store();
        assert_eq!(store.put(doc("a", 1)).unwrap(), PutOutcome::Created);
        assert_eq!(store.put(doc("a", 2)).unwrap(), PutOutcome::Updated);
        assert_eq!(store.get(&doc("a", 0).key).unwrap().version, 2);
        assert_eq!(drain(&mut rx), vec![EventKind::Created, EventKind::Updated]);
    }

    #[test]
    fn test_highest_version_wins_out_of_order() {
        let (store, mut rx) = create_test_store();
        assert_eq!(store.put(doc("a", 2)).unwrap(), PutOutcome::Created);
        assert_eq!(store.put(doc("a", 1)).unwrap(), PutOutcome::Stale);
        let held = store.get(&doc("a", 0).key).unwrap();
        assert_eq!(held.version, 2);
        assert_eq!(held.content, b"v2");
        assert_eq!(drain(&mut rx), vec![EventKind::Created]);
    }

    #[test]
    fn test_repeated_put_is_idempotent() {
        let (store, mut rx) = create_test_store();
        assert_eq!(store.put(doc("a", 3)).unwrap(), PutOutcome::Created);
        assert_eq!(store.put(doc("a", 3)).unwrap(), PutOutcome::Stale);
        assert_eq!(store.len(), 1);
        assert_eq!(drain(&mut rx), vec![EventKind::Created]);
    }

    #[test]
    fn test_invalid_documents_rejected() {
        let (store, mut rx) = create_test_store();

        let mut no_owner = doc("a", 1);
        no_owner.key.owner_id.clear();
        assert!(matches!(store.put(no_owner), Err(StoreError::InvalidDocument(_))));

        let mut no_expiry = doc("a", 1);
        no_expiry.expires = None;
        assert!(matches!(store.put(no_expiry), Err(StoreError::InvalidDocument(_))));

        assert!(store.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_expired_entries_invisible() {
        let (store, _rx) = create_test_store();
        let now = Timestamp::now();
        let mut short = doc("a", 1);
        short.expires = Some(now.plus(Duration::from_secs(10)));
        store.merge_at(short, Initiator::Local, now).unwrap();

        assert!(store.get(&doc("a", 0).key).is_some());
        // already-expired arrivals are not stored
        let mut stale = doc("b", 1);
        stale.expires = Some(now.minus(Duration::from_secs(1)));
        assert_eq!(store.put(stale).unwrap(), PutOutcome::Expired);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expire_sweep_exact() {
        let (store, _rx) = create_test_store();
        let now = Timestamp::now();
        for i in 0..10 {
            let mut d = doc(&format!("short-{}", i), 1);
            d.expires = Some(now.plus(Duration::from_secs(60)));
            store.merge_at(d, Initiator::Local, now).unwrap();
        }
        for i in 0..5 {
            store.put(doc(&format!("long-{}", i), 1)).unwrap();
        }

        // expiration == now counts as expired
        assert_eq!(store.expire_sweep_at(now.plus(Duration::from_secs(60))), 10);
        assert_eq!(store.stats().total, 5);
        assert_eq!(store.expire_sweep_at(now.plus(Duration::from_secs(60))), 0);
    }

    #[test]
    fn test_expire_sweep_year_out_unchanged() {
        let (store, _rx) = create_test_store();
        for i in 0..100 {
            store.put(doc(&i.to_string(), 1)).unwrap();
        }
        assert_eq!(store.expire_sweep(), 0);
        assert_eq!(store.len(), 100);
    }

    #[test]
    fn test_remove_fires_deleted() {
        let (store, mut rx) = create_test_store();
        store.put(doc("a", 9)).unwrap();
        let removed = store.remove(&doc("a", 0).key).unwrap();
        assert_eq!(removed.version, 9);
        assert!(store.remove(&doc("a", 0).key).is_none());
        assert_eq!(drain(&mut rx), vec![EventKind::Created, EventKind::Deleted]);

        // re-adding after delete is a fresh create at any version
        assert_eq!(store.put(doc("a", 1)).unwrap(), PutOutcome::Created);
    }

    #[test]
    fn test_list_filter() {
        let (store, _rx) = create_test_store();
        store.put(doc("a", 1)).unwrap();
        let mut other = doc("b", 1);
        other.key.document_type = "topology".into();
        store.put(other).unwrap();

        assert_eq!(store.list(&DocumentFilter::default()).len(), 2);
        let filter = DocumentFilter {
            owner_id: Some("urn:nsa:peer".into()),
            document_type: Some("topology".into()),
        };
        let listed = store.list(&filter);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key.document_id, "b");
        assert!(store.list(&DocumentFilter::owner("urn:nsa:nobody")).is_empty());
    }

    #[test]
    fn test_manifest_paging() {
        let (store, _rx) = create_test_store();
        for i in 0..7 {
            store.put(doc(&format!("d{}", i), i + 1)).unwrap();
        }
        let (total, first) = store.manifest(0, 5);
        let (_, second) = store.manifest(5, 5);
        assert_eq!(total, 7);
        assert_eq!(first.len(), 5);
        assert_eq!(second.len(), 2);
        assert_eq!(first[0].key.document_id, "d0");
        assert_eq!(second[1].version, 7);
    }

    #[test]
    fn test_concurrent_puts_no_lost_updates() {
        let store = DocumentStore::new("urn:nsa:local", Arc::new(MonotonicClock::new()));
        const KEYS: usize = 50;
        const WORKERS: u64 = 8;
        const VERSIONS: u64 = 20;

        std::thread::scope(|scope| {
            for worker in 0..WORKERS {
                let store = &store;
                scope.spawn(move || {
                    // each worker writes an interleaved slice of versions
                    for round in 0..VERSIONS {
                        let version = round * WORKERS + worker + 1;
                        for k in 0..KEYS {
                            store.put(doc(&format!("k{}", k), version)).unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(store.len(), KEYS);
        let highest = VERSIONS * WORKERS;
        for k in 0..KEYS {
            let held = store.get(&doc(&format!("k{}", k), 0).key).unwrap();
            assert_eq!(held.version, highest);
            assert_eq!(held.content, format!("v{}", highest).into_bytes());
        }
    }

    #[test]
    fn test_concurrent_same_key_single_winner() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = DocumentStore::new("urn:nsa:local", Arc::new(MonotonicClock::new())).with_events(tx);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let store = &store;
                scope.spawn(move || store.put(doc("same", 5)).unwrap());
            }
        });

        // exactly one put won; the rest were stale
        assert_eq!(drain(&mut rx), vec![EventKind::Created]);
    }

    #[test]
    fn test_publish_signed_and_monotonic() {
        let keypair = Arc::new(KeyPair::generate());
        let (store, mut rx) = create_test_store();
        let store = store.with_signer(keypair);

        let first = store.publish("nsa", "self", b"one".to_vec(), YEAR).unwrap();
        let second = store.publish("nsa", "self", b"two".to_vec(), YEAR).unwrap();

        assert!(second.version > first.version);
        assert_eq!(first.owner_id(), "urn:nsa:local");
        verify_document(&Ed25519Verifier::new(), &second).unwrap();
        assert_eq!(store.stats().owned, 1);
        assert_eq!(drain(&mut rx), vec![EventKind::Created, EventKind::Updated]);
    }

    #[test]
    fn test_reload_from_storage() {
        let dir = tempdir().unwrap();
        let published_version;
        {
            let storage = Arc::new(Storage::open(dir.path()).unwrap());
            let store = DocumentStore::new("urn:nsa:local", Arc::new(MonotonicClock::new()))
                .with_storage(storage.clone())
                .unwrap();
            store.put(doc("a", 4)).unwrap();
            published_version = store.publish("nsa", "self", vec![], YEAR).unwrap().version;
            storage.flush().unwrap();
        }

        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let clock = Arc::new(MonotonicClock::new());
        let store = DocumentStore::new("urn:nsa:local", clock.clone())
            .with_storage(storage)
            .unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&doc("a", 0).key).unwrap().version, 4);
        assert!(clock.last() >= published_version);
    }
}
