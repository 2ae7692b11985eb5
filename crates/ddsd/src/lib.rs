//! ddsd - Document Distribution Service daemon
//!
//! This daemon provides:
//! - A versioned, expiring document store persisted in sled
//! - Subscriptions held for peers and against peers
//! - Batched, retried change notifications to subscribers
//! - Periodic manifest audits that repair missed notifications
//! - The HTTP API peers use to reach all of the above

pub mod api;
pub mod audit;
pub mod config;
pub mod dispatcher;
pub mod document_store;
pub mod ingest;
pub mod pool;
pub mod registry;
pub mod routes;
pub mod server;
pub mod storage;
pub mod watch;

#[cfg(test)]
mod testing;

pub use api::DdsService;
pub use audit::AuditScheduler;
pub use config::Config;
pub use dispatcher::NotificationDispatcher;
pub use document_store::DocumentStore;
pub use registry::SubscriptionRegistry;
pub use server::Node;
pub use storage::Storage;
