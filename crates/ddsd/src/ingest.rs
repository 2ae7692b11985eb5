//! Document ingestion shared by inbound notifications and audits

use crate::document_store::{DocumentStore, PutOutcome, StoreError};
use dds_core::crypto::{verify_document, DocumentVerifier};
use dds_core::types::*;
use dds_net::peer::document_url;
use dds_net::{HttpClient, TransportError, WireError, WireFormat};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors fetching a document from a peer
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Decode error: {0}")]
    Decode(#[from] WireError),
    #[error("Peer returned {returned} for {requested}")]
    KeyMismatch {
        requested: DocumentKey,
        returned: DocumentKey,
    },
}

impl FetchError {
    /// Whether the peer itself was unreachable or failed
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }
}

/// Fetch one document from `peer_url`
pub async fn fetch_document(
    client: &dyn HttpClient,
    format: WireFormat,
    peer_url: &str,
    key: &DocumentKey,
) -> Result<Document, FetchError> {
    let url = document_url(peer_url, key);
    let response = client.get(&url).await?.error_for_status(&url)?;
    let document: Document = format.decode(&response.body)?;
    if &document.key != key {
        return Err(FetchError::KeyMismatch {
            requested: key.clone(),
            returned: document.key,
        });
    }
    Ok(document)
}

/// What happened to an ingested document
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored as Created or Updated
    Accepted(PutOutcome),
    /// Stale, expired, or owned by this node
    Ignored(PutOutcome),
    /// Invalid or failed verification
    Rejected(String),
}

/// Verify (when a verifier is configured) and merge a document from a peer
///
/// Documents owned by this node are never replaced by a peer's copy.
pub fn ingest(
    store: &DocumentStore,
    verifier: Option<&dyn DocumentVerifier>,
    document: Document,
    initiator: Initiator,
) -> IngestOutcome {
    if store.is_local(&document.key) {
        debug!("Ignoring peer copy of local document {}", document.key);
        return IngestOutcome::Ignored(PutOutcome::Stale);
    }
    if let Some(verifier) = verifier {
        if let Err(e) = verify_document(verifier, &document) {
            warn!("Rejecting {} v{} from {}: {}", document.key, document.version, initiator, e);
            return IngestOutcome::Rejected(e.to_string());
        }
    }
    match store.merge(document, initiator) {
        Ok(outcome) if outcome.is_accepted() => IngestOutcome::Accepted(outcome),
        Ok(outcome) => IngestOutcome::Ignored(outcome),
        Err(StoreError::InvalidDocument(reason)) => {
            warn!("Rejecting invalid document: {}", reason);
            IngestOutcome::Rejected(reason)
        }
        Err(e) => IngestOutcome::Rejected(e.to_string()),
    }
}
