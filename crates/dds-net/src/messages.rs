//! Protocol messages exchanged between nodes

use dds_core::*;
use serde::{Deserialize, Serialize};

/// One page of a node's manifest
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestPage {
    pub provider_id: String,
    pub offset: usize,
    /// Live documents on the provider when the page was cut
    pub total: usize,
    pub entries: Vec<ManifestEntry>,
}

impl ManifestPage {
    /// Offset of the next page, if any
    pub fn next_offset(&self) -> Option<usize> {
        let next = self.offset.checked_add(self.entries.len())?;
        (!self.entries.is_empty() && next < self.total).then_some(next)
    }
}

/// Ask a peer to notify us of changes
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub requester_id: String,
    pub callback: String,
    pub filter: SubscriptionFilter,
    pub ttl_secs: u64,
}

/// Extend an existing subscription
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenewRequest {
    pub ttl_secs: u64,
}

/// A single change in a notification batch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub kind: EventKind,
    pub key: DocumentKey,
    /// Embedded document; when absent the receiver fetches it from the provider
    pub document: Option<Document>,
    pub discovered: Timestamp,
}

impl Notification {
    pub fn from_event(event: &NotificationEvent) -> Self {
        Self {
            kind: event.kind,
            key: event.key.clone(),
            document: event.document.clone(),
            discovered: event.discovered,
        }
    }
}

/// Batch delivered to a subscriber's callback
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationBatch {
    pub subscription_id: SubscriptionId,
    pub provider_id: String,
    pub notifications: Vec<Notification>,
}

/// Receiver's summary of an inbound batch
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackAck {
    pub accepted: usize,
    pub ignored: usize,
    pub failed: usize,
}

/// Error body returned with non-2xx statuses
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> ManifestEntry {
        ManifestEntry {
            key: DocumentKey::new("o", "t", n.to_string()),
            version: 1,
            expires: Some(Timestamp(1)),
        }
    }

    #[test]
    fn test_paging() {
        let first = ManifestPage {
            provider_id: "p".into(),
            offset: 0,
            total: 3,
            entries: vec![entry(0), entry(1)],
        };
        assert_eq!(first.next_offset(), Some(2));

        let last = ManifestPage {
            provider_id: "p".into(),
            offset: 2,
            total: 3,
            entries: vec![entry(2)],
        };
        assert_eq!(last.next_offset(), None);

        // provider shrank between pages
        let empty = ManifestPage {
            provider_id: "p".into(),
            offset: 4,
            total: 10,
            entries: vec![],
        };
        assert_eq!(empty.next_offset(), None);
    }

    #[test]
    fn test_paging_stops_on_offset_overflow() {
        let bogus = ManifestPage {
            provider_id: "p".into(),
            offset: usize::MAX - 1,
            total: usize::MAX,
            entries: vec![entry(0), entry(1)],
        };
        assert_eq!(bogus.next_offset(), None);
    }
}
