//! Wire encoding for documents and protocol messages
//!
//! Peers agree on one format per deployment. JSON is the default;
//! postcard is the compact alternative.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Encoding errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    TooLarge(usize),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Postcard error: {0}")]
    Postcard(#[from] postcard::Error),
    #[error("Unknown wire format: {0}")]
    UnknownFormat(String),
}

/// Payload serializer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireFormat {
    #[default]
    Json,
    Postcard,
}

impl WireFormat {
    /// Encode a value
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, WireError> {
        let bytes = match self {
            WireFormat::Json => serde_json::to_vec(value)?,
            WireFormat::Postcard => postcard::to_allocvec(value)?,
        };
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Decode a value
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, WireError> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::TooLarge(bytes.len()));
        }
        match self {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::Postcard => Ok(postcard::from_bytes(bytes)?),
        }
    }

    /// HTTP content type
    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Postcard => "application/octet-stream",
        }
    }
}

impl FromStr for WireFormat {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "postcard" => Ok(WireFormat::Postcard),
            other => Err(WireError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Json => f.write_str("json"),
            WireFormat::Postcard => f.write_str("postcard"),
        }
    }
}
