//! DDS Core Library
//!
//! Core types, canonical encoding, and signing primitives shared by every
//! document distribution service (DDS) node.
//!
//! # Modules
//!
//! - [`types`]: Data model (DocumentKey, Document, Subscription, RemoteSubscription, ...)
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Document signing and verification
//! - [`clock`]: Monotonic version/id generator
//! - [`error`]: Error types

pub mod canonical;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod types;

pub use clock::MonotonicClock;
pub use error::{Error, Result};
pub use types::*;
