//! Configuration loader using TOML and serde.
//!
//! Nested sections mirror the dotted configuration paths the server
//! recognizes (`cache.max_cost`, `coordinator.lease_ttl`, ...). All
//! interval and TTL values are integer milliseconds. Every
//! field carries a default so an empty file (or no file at all) yields
//! a runnable configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ════════════════════════════════════════════════════════════════════════════
// SECTIONS
// ════════════════════════════════════════════════════════════════════════════

/// Identity of this server instance.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FleetSection {
    /// Server id; generated at startup when empty.
    #[serde(default)]
    pub agent_id: String,
    /// Host id; falls back to `agent_id` when empty.
    #[serde(default)]
    pub host_id: String,
    /// Version string reported in the server registration.
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Artifact cache sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    /// Number of frequency counters kept for admission decisions.
    #[serde(default = "default_num_counters")]
    pub num_counters: usize,
    /// Maximum total cost (bytes of decoded artifact bodies).
    #[serde(default = "default_max_cost")]
    pub max_cost: u64,
}

fn default_num_counters() -> usize {
    100_000
}

fn default_max_cost() -> u64 {
    50 * 1024 * 1024
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            num_counters: default_num_counters(),
            max_cost: default_max_cost(),
        }
    }
}

/// Artifact fetch-path limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactSection {
    /// Global cap on concurrent store fetches.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Throttle token TTL in milliseconds.
    #[serde(rename = "throttle_ttl", default = "default_throttle_ttl_ms")]
    pub throttle_ttl_ms: u64,
}

fn default_max_parallel() -> usize {
    8
}

fn default_throttle_ttl_ms() -> u64 {
    60_000
}

impl Default for ArtifactSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            throttle_ttl_ms: default_throttle_ttl_ms(),
        }
    }
}

impl ArtifactSection {
    pub fn throttle_ttl(&self) -> Duration {
        Duration::from_millis(self.throttle_ttl_ms)
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Bind address for the HTTP listener.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub artifact: ArtifactSection,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8220".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            artifact: ArtifactSection::default(),
        }
    }
}

/// Coordination-plane intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSection {
    /// Leadership lease TTL in milliseconds.
    #[serde(rename = "lease_ttl", default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// Election tick interval in milliseconds.
    #[serde(rename = "check_interval", default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Unenroll scan interval in milliseconds (test-tunable).
    #[serde(rename = "unenroll_check_interval", default = "default_check_interval_ms")]
    pub unenroll_check_interval_ms: u64,
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_check_interval_ms() -> u64 {
    30_000
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl_ms(),
            check_interval_ms: default_check_interval_ms(),
            unenroll_check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl CoordinatorSection {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn unenroll_check_interval(&self) -> Duration {
        Duration::from_millis(self.unenroll_check_interval_ms)
    }
}

/// Index monitor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    /// Poll interval in milliseconds.
    #[serde(rename = "poll_interval", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum documents fetched per poll (and per priming scan).
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_fetch_size() -> usize {
    512
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            fetch_size: default_fetch_size(),
        }
    }
}

impl MonitorSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Store backend selection and index naming.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// Backend: only `"memory"` ships in this workspace; external
    /// document-store clients register their own name.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Request deadline handed to the store client.
    #[serde(rename = "timeout", default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    /// Deadline for long-poll paths; the store drives the poll, so this
    /// is deliberately generous.
    #[serde(rename = "long_poll_timeout", default = "default_long_poll_timeout_ms")]
    pub long_poll_timeout_ms: u64,
    /// Prefix applied to every derived index name.
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    /// Explicit overrides; empty means derived from the prefix.
    #[serde(default)]
    pub policies_index: String,
    #[serde(default)]
    pub leaders_index: String,
    #[serde(default)]
    pub agents_index: String,
    #[serde(default)]
    pub servers_index: String,
    #[serde(default)]
    pub artifacts_index: String,
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_store_timeout_ms() -> u64 {
    90_000
}

fn default_long_poll_timeout_ms() -> u64 {
    600_000
}

fn default_index_prefix() -> String {
    ".fleet-".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            timeout_ms: default_store_timeout_ms(),
            long_poll_timeout_ms: default_long_poll_timeout_ms(),
            index_prefix: default_index_prefix(),
            policies_index: String::new(),
            leaders_index: String::new(),
            agents_index: String::new(),
            servers_index: String::new(),
            artifacts_index: String::new(),
        }
    }
}

impl StoreSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    fn derived(&self, explicit: &str, suffix: &str) -> String {
        if explicit.is_empty() {
            format!("{}{}", self.index_prefix, suffix)
        } else {
            explicit.to_string()
        }
    }

    pub fn policies(&self) -> String {
        self.derived(&self.policies_index, "policies")
    }

    pub fn leaders(&self) -> String {
        self.derived(&self.leaders_index, "policies-leader")
    }

    pub fn agents(&self) -> String {
        self.derived(&self.agents_index, "agents")
    }

    pub fn servers(&self) -> String {
        self.derived(&self.servers_index, "servers")
    }

    pub fn artifacts(&self) -> String {
        self.derived(&self.artifacts_index, "artifacts")
    }
}

// ════════════════════════════════════════════════════════════════════════════
// CONFIG
// ════════════════════════════════════════════════════════════════════════════

/// Full server configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub fleet: FleetSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub store: StoreSection,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let cfg: Config = toml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that would stall or wedge the control plane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.poll_interval must be > 0".to_string(),
            ));
        }
        if self.monitor.fetch_size == 0 {
            return Err(ConfigError::Invalid(
                "monitor.fetch_size must be > 0".to_string(),
            ));
        }
        if self.coordinator.lease_ttl_ms == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.lease_ttl must be > 0".to_string(),
            ));
        }
        if self.coordinator.check_interval_ms == 0 || self.coordinator.unenroll_check_interval_ms == 0
        {
            return Err(ConfigError::Invalid(
                "coordinator intervals must be > 0".to_string(),
            ));
        }
        if self.cache.max_cost == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_cost must be > 0".to_string(),
            ));
        }
        if self.server.artifact.max_parallel == 0 {
            return Err(ConfigError::Invalid(
                "server.artifact.max_parallel must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
