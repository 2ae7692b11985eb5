//! Configuration for ddsd

use clap::Parser;
use dds_net::{normalize_peer_url, WireFormat};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// ddsd - federated document distribution daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "ddsd")]
#[command(about = "Federated document distribution daemon")]
pub struct Config {
    /// Listen address for the HTTP API
    #[arg(short, long, default_value = "0.0.0.0:9200")]
    pub listen: SocketAddr,

    /// Base URL peers use to reach this node (defaults to http://<listen>)
    #[arg(long, env = "DDS_BASE_URL")]
    pub base_url: Option<String>,

    /// Identifier of this node; owner id of the documents it publishes
    #[arg(long, env = "DDS_NODE_ID")]
    pub node_id: String,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/ddsd")]
    pub data_dir: PathBuf,

    /// Peer base URLs (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<String>,

    /// File listing peer base URLs, reloaded when it changes
    #[arg(long)]
    pub peers_file: Option<PathBuf>,

    /// Seconds between peer audits
    #[arg(long, default_value_t = defaults::AUDIT_INTERVAL_SECS)]
    pub audit_interval_secs: u64,

    /// Seconds between expiry sweeps
    #[arg(long, default_value_t = defaults::EXPIRY_INTERVAL_SECS)]
    pub expiry_interval_secs: u64,

    /// Concurrent delivery and audit tasks
    #[arg(long, default_value_t = defaults::WORKER_POOL_SIZE)]
    pub worker_pool_size: usize,

    /// Notifications per delivered batch
    #[arg(long, default_value_t = defaults::NOTIFICATION_BATCH_SIZE)]
    pub notification_batch_size: usize,

    /// Manifest entries per page
    #[arg(long, default_value_t = defaults::PAGE_SIZE)]
    pub page_size: usize,

    /// Sign published documents and verify received ones
    #[arg(long)]
    pub signing_enabled: bool,

    /// Hex Ed25519 public keys accepted on received documents (empty: any)
    #[arg(long, value_delimiter = ',')]
    pub trusted_keys: Vec<String>,

    /// Lifetime requested for our subscriptions at peers
    #[arg(long, default_value_t = defaults::SUBSCRIPTION_TTL_SECS)]
    pub subscription_ttl_secs: u64,

    /// Longest lifetime granted to subscriptions held for peers
    #[arg(long, default_value_t = defaults::MAX_SUBSCRIPTION_TTL_SECS)]
    pub max_subscription_ttl_secs: u64,

    /// Outbound connect timeout in seconds
    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Outbound request timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Upper bound on a single peer audit in seconds
    #[arg(long, default_value_t = 120)]
    pub audit_timeout_secs: u64,

    /// Attempts per notification batch
    #[arg(long, default_value_t = defaults::DELIVERY_ATTEMPTS)]
    pub delivery_attempts: u32,

    /// Initial delivery retry backoff in milliseconds
    #[arg(long, default_value_t = defaults::DELIVERY_BACKOFF_MS)]
    pub delivery_backoff_ms: u64,

    /// Consecutive failed audits before a peer is marked failed
    #[arg(long, default_value_t = defaults::MAX_AUDIT_FAILURES)]
    pub max_audit_failures: u32,

    /// Payload encoding (json or postcard)
    #[arg(long, default_value = "json")]
    pub wire_format: WireFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

pub mod defaults {
    pub const AUDIT_INTERVAL_SECS: u64 = 1200;
    pub const EXPIRY_INTERVAL_SECS: u64 = 86_400;
    pub const WORKER_POOL_SIZE: usize = 20;
    pub const NOTIFICATION_BATCH_SIZE: usize = 10;
    pub const PAGE_SIZE: usize = 50;
    pub const SUBSCRIPTION_TTL_SECS: u64 = 7200;
    pub const MAX_SUBSCRIPTION_TTL_SECS: u64 = 86_400;
    pub const DELIVERY_ATTEMPTS: u32 = 5;
    pub const DELIVERY_BACKOFF_MS: u64 = 500;
    pub const MAX_AUDIT_FAILURES: u32 = 3;
}

/// An out-of-range option that was replaced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub option: &'static str,
    pub value: u64,
    pub min: u64,
    pub max: u64,
    /// Value used instead
    pub default: u64,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max == u64::MAX {
            return write!(
                f,
                "{} = {} below {}; using {}",
                self.option, self.value, self.min, self.default
            );
        }
        write!(
            f,
            "{} = {} outside [{}, {}]; using {}",
            self.option, self.value, self.min, self.max, self.default
        )
    }
}

/// Raise `value` to `floor` when it falls short
fn raise_option(option: &'static str, value: &mut u64, floor: u64, warnings: &mut Vec<ConfigWarning>) {
    if *value < floor {
        warnings.push(ConfigWarning {
            option,
            value: *value,
            min: floor,
            max: u64::MAX,
            default: floor,
        });
        *value = floor;
    }
}

fn clamp_option<T>(
    option: &'static str,
    value: &mut T,
    min: u64,
    max: u64,
    default: T,
    warnings: &mut Vec<ConfigWarning>,
) where
    T: Copy + Into<u64>,
{
    let current: u64 = (*value).into();
    if current < min || current > max {
        warnings.push(ConfigWarning {
            option,
            value: current,
            min,
            max,
            default: default.into(),
        });
        *value = default;
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("Node id cannot be empty");
        }
        for peer in &self.peers {
            normalize_peer_url(peer)?;
        }
        if let Some(base_url) = &self.base_url {
            normalize_peer_url(base_url)?;
        }
        for key in &self.trusted_keys {
            let bytes = hex::decode(key)
                .map_err(|e| anyhow::anyhow!("Trusted key {} is not hex: {}", key, e))?;
            if bytes.len() != 32 {
                anyhow::bail!("Trusted key {} is not 32 bytes", key);
            }
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("Unknown log format {}", self.log_format);
        }
        Ok(())
    }

    /// Reset out-of-range numeric options to their defaults
    pub fn normalize(&mut self) -> Vec<ConfigWarning> {
        use defaults::*;
        let mut warnings = Vec::new();
        clamp_option(
            "audit_interval_secs",
            &mut self.audit_interval_secs,
            300,
            86_400,
            AUDIT_INTERVAL_SECS,
            &mut warnings,
        );
        clamp_option(
            "expiry_interval_secs",
            &mut self.expiry_interval_secs,
            600,
            2_592_000,
            EXPIRY_INTERVAL_SECS,
            &mut warnings,
        );
        let mut pool = self.worker_pool_size as u64;
        clamp_option("worker_pool_size", &mut pool, 5, 100, WORKER_POOL_SIZE as u64, &mut warnings);
        self.worker_pool_size = pool as usize;
        let mut batch = self.notification_batch_size as u64;
        clamp_option(
            "notification_batch_size",
            &mut batch,
            5,
            40,
            NOTIFICATION_BATCH_SIZE as u64,
            &mut warnings,
        );
        self.notification_batch_size = batch as usize;
        let mut page = self.page_size as u64;
        clamp_option("page_size", &mut page, 5, 100, PAGE_SIZE as u64, &mut warnings);
        self.page_size = page as usize;
        clamp_option(
            "delivery_attempts",
            &mut self.delivery_attempts,
            1,
            20,
            DELIVERY_ATTEMPTS,
            &mut warnings,
        );
        clamp_option(
            "max_audit_failures",
            &mut self.max_audit_failures,
            1,
            100,
            MAX_AUDIT_FAILURES,
            &mut warnings,
        );

        // our subscriptions at peers must outlive the next audit plus the
        // renewal window (2 x interval), or notifications lapse between audits
        let ttl_floor = self.audit_interval_secs.saturating_mul(3);
        raise_option(
            "subscription_ttl_secs",
            &mut self.subscription_ttl_secs,
            ttl_floor,
            &mut warnings,
        );
        raise_option(
            "max_subscription_ttl_secs",
            &mut self.max_subscription_ttl_secs,
            self.subscription_ttl_secs,
            &mut warnings,
        );
        warnings
    }

    /// URL peers use to reach us
    pub fn base_url(&self) -> String {
        self.base_url
            .as_deref()
            .and_then(|url| normalize_peer_url(url).ok())
            .unwrap_or_else(|| format!("http://{}", self.listen))
    }

    pub fn audit_interval(&self) -> Duration {
        Duration::from_secs(self.audit_interval_secs)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["ddsd", "--node-id", "urn:nsa:test"];
        argv.extend_from_slice(args);
        Config::parse_from(argv)
    }

    #[test]
    fn test_defaults_are_valid() {
        let mut config = parse(&[]);
        assert!(config.validate().is_ok());
        assert!(config.normalize().is_empty());
        assert_eq!(config.audit_interval(), Duration::from_secs(1200));
        assert_eq!(config.wire_format, WireFormat::Json);
        assert_eq!(config.base_url(), "http://0.0.0.0:9200");
    }

    #[test]
    fn test_out_of_range_reset_with_warnings() {
        let mut config = parse(&[
            "--audit-interval-secs",
            "10",
            "--worker-pool-size",
            "500",
            "--page-size",
            "20",
        ]);
        let warnings = config.normalize();
        let options: Vec<&str> = warnings.iter().map(|w| w.option).collect();
        assert_eq!(options, vec!["audit_interval_secs", "worker_pool_size"]);
        assert_eq!(config.audit_interval_secs, 1200);
        assert_eq!(config.worker_pool_size, 20);
        assert_eq!(config.page_size, 20);
        assert!(warnings[0].to_string().contains("using 1200"));
    }

    #[test]
    fn test_subscription_ttl_follows_audit_interval() {
        let mut config = parse(&["--audit-interval-secs", "86400"]);
        let warnings = config.normalize();
        let options: Vec<&str> = warnings.iter().map(|w| w.option).collect();
        assert_eq!(
            options,
            vec!["subscription_ttl_secs", "max_subscription_ttl_secs"]
        );
        assert_eq!(config.audit_interval_secs, 86_400);
        assert_eq!(config.subscription_ttl_secs, 3 * 86_400);
        assert_eq!(config.max_subscription_ttl_secs, 3 * 86_400);
        assert_eq!(
            warnings[0].to_string(),
            "subscription_ttl_secs = 7200 below 259200; using 259200"
        );

        // a long enough lifetime is left alone
        let mut config = parse(&["--audit-interval-secs", "600", "--subscription-ttl-secs", "5000"]);
        assert!(config.normalize().is_empty());
        assert_eq!(config.subscription_ttl_secs, 5000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(parse(&["--peers", "http://a,ftp://b"]).validate().is_err());
        assert!(parse(&["--trusted-keys", "abcd"]).validate().is_err());
        assert!(parse(&["--log-format", "xml"]).validate().is_err());

        let mut blank = parse(&[]);
        blank.node_id = "  ".into();
        assert!(blank.validate().is_err());

        let ok = parse(&["--peers", "http://a:1,https://b/", "--base-url", "http://me:9200/"]);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.base_url(), "http://me:9200");
        assert_eq!(ok.peers.len(), 2);
    }
}
