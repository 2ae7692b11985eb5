//! Peer addressing and route layout
//!
//! Every node serves the same routes under its base URL:
//!
//! | method | path                               | purpose                  |
//! |--------|------------------------------------|--------------------------|
//! | GET    | `/documents?offset=&limit=`        | manifest page            |
//! | GET    | `/documents/{owner}/{type}/{id}`   | single document          |
//! | POST   | `/subscriptions`                   | subscribe                |
//! | GET    | `/subscriptions/{id}`              | read subscription        |
//! | POST   | `/subscriptions/{id}`              | renew                    |
//! | DELETE | `/subscriptions/{id}`              | unsubscribe              |
//! | POST   | `/callback`                        | inbound notifications    |
//! | GET    | `/health`                          | node statistics          |

use dds_core::{DocumentKey, SubscriptionId};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;
use url::Url;

/// Path segment escape set: everything outside unreserved characters and ':'
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'&')
    .add(b'+')
    .add(b'=');

pub const DOCUMENTS_PATH: &str = "documents";
pub const SUBSCRIPTIONS_PATH: &str = "subscriptions";
pub const CALLBACK_PATH: &str = "callback";
pub const HEALTH_PATH: &str = "health";

/// Peer URL errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerUrlError {
    #[error("Invalid peer URL {0}: {1}")]
    Invalid(String, String),
    #[error("Unsupported scheme in {0} (expected http or https)")]
    UnsupportedScheme(String),
}

/// Canonical form of a peer base URL: http(s), no trailing slash, no query
pub fn normalize_peer_url(raw: &str) -> Result<String, PeerUrlError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| PeerUrlError::Invalid(raw.to_string(), e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(PeerUrlError::UnsupportedScheme(raw.to_string()));
    }
    if url.host_str().is_none() {
        return Err(PeerUrlError::Invalid(raw.to_string(), "missing host".into()));
    }
    let mut base = url;
    base.set_query(None);
    base.set_fragment(None);
    Ok(base.as_str().trim_end_matches('/').to_string())
}

/// Escape one path segment
pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Unescape one path segment
pub fn decode_segment(segment: &str) -> Option<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

pub fn manifest_url(base: &str, offset: usize, limit: usize) -> String {
    format!("{}/{}?offset={}&limit={}", base, DOCUMENTS_PATH, offset, limit)
}

pub fn document_url(base: &str, key: &DocumentKey) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        base,
        DOCUMENTS_PATH,
        encode_segment(&key.owner_id),
        encode_segment(&key.document_type),
        encode_segment(&key.document_id)
    )
}

pub fn subscriptions_url(base: &str) -> String {
    format!("{}/{}", base, SUBSCRIPTIONS_PATH)
}

pub fn subscription_url(base: &str, id: &SubscriptionId) -> String {
    format!("{}/{}/{}", base, SUBSCRIPTIONS_PATH, encode_segment(&id.0))
}

pub fn callback_url(base: &str) -> String {
    format!("{}/{}", base, CALLBACK_PATH)
}
