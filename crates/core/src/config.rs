//! Configuration types
//!
//! Typed settings the host populates (from its own config file layer,
//! which is outside the core) and hands down by reference.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Settings for owned-path construction and upkeep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Lifetime requested for new hops.
    #[serde(default = "default_lifetime")]
    pub default_lifetime: Duration,

    /// Hard deadline for one build attempt.
    #[serde(default = "default_build_timeout")]
    pub build_timeout: Duration,

    /// Interval between latency probes on established paths.
    #[serde(default = "default_probe_interval")]
    pub latency_probe_interval: Duration,

    /// Hops per path.
    #[serde(default = "default_hops")]
    pub num_hops: usize,

    /// Paths each pathset tries to keep established.
    #[serde(default = "default_paths")]
    pub num_paths: usize,
}

fn default_lifetime() -> Duration {
    constants::DEFAULT_LIFETIME
}

fn default_build_timeout() -> Duration {
    constants::PATH_BUILD_TIMEOUT
}

fn default_probe_interval() -> Duration {
    constants::LATENCY_PROBE_INTERVAL
}

fn default_hops() -> usize {
    3
}

fn default_paths() -> usize {
    4
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            default_lifetime: default_lifetime(),
            build_timeout: default_build_timeout(),
            latency_probe_interval: default_probe_interval(),
            num_hops: default_hops(),
            num_paths: default_paths(),
        }
    }
}

/// Settings for the contact cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDbConfig {
    /// Interval between full flushes to disk.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: Duration,

    /// Entries older than this are evicted unless pinned by the keep set.
    #[serde(default = "default_stale_age")]
    pub stale_age: Duration,
}

fn default_flush_interval() -> Duration {
    constants::NODEDB_FLUSH_INTERVAL
}

fn default_stale_age() -> Duration {
    constants::RC_STALE_INSERTION_AGE
}

impl Default for NodeDbConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
            stale_age: default_stale_age(),
        }
    }
}

/// Settings for router-contact validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcConfig {
    /// The 8-byte ASCII network tag contacts must carry.
    #[serde(default = "default_net_id")]
    pub net_id: String,

    /// Reject contacts advertising loopback/private/multicast addresses.
    /// Disabled by tests that run everything on localhost.
    #[serde(default = "default_block_bogons")]
    pub block_bogons: bool,

    /// Tolerated forward clock skew on `last_updated`.
    #[serde(default = "default_clock_skew")]
    pub clock_skew: Duration,

    /// Contacts older than this fail verification.
    #[serde(default = "default_rc_lifetime")]
    pub lifetime: Duration,
}

fn default_net_id() -> String {
    "veilnet".to_string()
}

fn default_block_bogons() -> bool {
    true
}

fn default_clock_skew() -> Duration {
    Duration::from_secs(60)
}

fn default_rc_lifetime() -> Duration {
    constants::RC_LIFETIME
}

impl Default for RcConfig {
    fn default() -> Self {
        Self {
            net_id: default_net_id(),
            block_bogons: default_block_bogons(),
            clock_skew: default_clock_skew(),
            lifetime: default_rc_lifetime(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_config_defaults() {
        let cfg = PathConfig::default();
        assert_eq!(cfg.default_lifetime, Duration::from_secs(600));
        assert_eq!(cfg.build_timeout, Duration::from_secs(10));
        assert_eq!(cfg.num_hops, 3);
    }

    #[test]
    fn test_rc_config_defaults() {
        let cfg = RcConfig::default();
        assert_eq!(cfg.net_id.len(), 7); // padded to 8 bytes at encode time
        assert!(cfg.block_bogons);
        assert_eq!(cfg.lifetime, Duration::from_secs(86400));
    }

    #[test]
    fn test_configs_serialize() {
        let cfg = NodeDbConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: NodeDbConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.flush_interval, cfg.flush_interval);
    }
}
