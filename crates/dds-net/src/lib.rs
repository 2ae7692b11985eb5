//! Networking primitives for the document distribution service
//!
//! This crate provides:
//! - Wire encoding of documents and protocol messages (JSON or postcard)
//! - The `HttpClient` contract and its reqwest implementation
//! - Peer URL normalization and the shared route layout
//! - Protocol message types

pub mod messages;
pub mod peer;
pub mod transport;
pub mod wire;

pub use messages::{CallbackAck, ManifestPage, Notification, NotificationBatch, RenewRequest, SubscribeRequest};
pub use peer::{normalize_peer_url, PeerUrlError};
pub use transport::{HttpClient, HttpResponse, ReqwestClient, TransportError};
pub use wire::{WireError, WireFormat};
