//! Canonical encoding for document signing
//!
//! Signed bytes use postcard serialization of the unsigned document fields.
//! `discovered` is node-local and never signed; neither is the signature itself.
//! Field order is Rust struct field order.

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Domain prefix for document signatures
pub const DOMAIN_DOC_SIG: &[u8] = b"dds-doc-sig";

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// The signed view of a document
#[derive(Serialize)]
struct UnsignedDocument<'a> {
    key: &'a DocumentKey,
    version: u64,
    expires: Timestamp,
    content: &'a [u8],
}

/// Compute the bytes to sign for a document.
///
/// `sign_bytes = "dds-doc-sig" || canonical_bytes(key, version, expires, content)`
pub fn document_sign_bytes(document: &Document) -> Result<Vec<u8>> {
    let expires = document
        .expires
        .ok_or_else(|| Error::MissingField("expires".into()))?;
    let unsigned = canonical_bytes(&UnsignedDocument {
        key: &document.key,
        version: document.version,
        expires,
        content: &document.content,
    })?;

    let mut bytes = Vec::with_capacity(DOMAIN_DOC_SIG.len() + unsigned.len());
    bytes.extend_from_slice(DOMAIN_DOC_SIG);
    bytes.extend_from_slice(&unsigned);
    Ok(bytes)
}
