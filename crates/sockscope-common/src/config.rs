//! Tracer configuration model.
//!
//! The configuration is a static snapshot read once when the tracer is
//! constructed. Every field has a default so partial YAML files are valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, SockscopeError};

/// Retry policy for NAT lookups that miss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatRetryConfig {
    /// Extra lookups performed after a miss on a young connection.
    pub max_retries: u32,
    /// Sleep between two lookups, in milliseconds.
    pub backoff_ms: u64,
    /// Wall-clock budget of one resolve call, in milliseconds.
    pub budget_ms: u64,
    /// Connections younger than this are never marked as having no NAT.
    pub young_threshold_ms: u64,
}

impl Default for NatRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 5,
            budget_ms: 50,
            young_threshold_ms: 2_000,
        }
    }
}

impl NatRetryConfig {
    /// Sleep between two lookups.
    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Wall-clock budget of one resolve call.
    #[must_use]
    pub const fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    /// Age below which a miss is not final.
    #[must_use]
    pub const fn young_threshold(&self) -> Duration {
        Duration::from_millis(self.young_threshold_ms)
    }
}

/// Root configuration of the connection tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Capacity ceiling of the connection table.
    pub max_tracked_connections: usize,
    /// Minimum time a closed, fully observed entry stays in the table.
    pub closed_grace_ms: u64,
    /// Idle time after which an orphaned client registration is reclaimed.
    pub client_expiry_secs: u64,
    /// Per-client bound on buffered short-lived connections.
    pub short_lived_buffer_size: usize,
    /// Idle time after which an open TCP entry is expired.
    pub tcp_conn_timeout_secs: u64,
    /// Idle time after which an open UDP entry is expired.
    pub udp_conn_timeout_secs: u64,
    /// Period of the background reclaim and eviction task.
    pub maintenance_interval_secs: u64,
    /// Whether NAT translations are resolved.
    pub enable_conntrack: bool,
    /// Whether the accelerated conntrack backend is attempted first.
    pub enable_ebpf_conntracker: bool,
    /// Pin path of the accelerated backend's map.
    pub conntrack_map_pin_path: PathBuf,
    /// Kernel conntrack table read by the compatible backend.
    pub conntrack_procfs_path: PathBuf,
    /// Minimum interval between two rescans of the conntrack table.
    pub conntrack_rescan_interval_ms: u64,
    /// Retry policy for NAT lookup misses.
    pub nat_retry: NatRetryConfig,
    /// Whether gateway/subnet enrichment is enabled.
    pub enable_gateway_lookup: bool,
    /// Lifetime of a cached route.
    pub gateway_route_cache_ttl_secs: u64,
    /// Lifetime of a cached subnet lookup failure.
    pub gateway_error_ttl_secs: u64,
    /// Bound of each gateway cache.
    pub gateway_cache_size: usize,
    /// Procfs mount point used for route lookups.
    pub procfs_root: PathBuf,
    /// Sysfs mount point used for interface lookups.
    pub sysfs_root: PathBuf,
    /// Whether early connection bytes are classified.
    pub enable_protocol_classification: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            max_tracked_connections: 65_536,
            closed_grace_ms: 0,
            client_expiry_secs: 120,
            short_lived_buffer_size: 10_000,
            tcp_conn_timeout_secs: 120,
            udp_conn_timeout_secs: 30,
            maintenance_interval_secs: 30,
            enable_conntrack: true,
            enable_ebpf_conntracker: true,
            conntrack_map_pin_path: PathBuf::from(constants::DEFAULT_CONNTRACK_MAP_PIN),
            conntrack_procfs_path: PathBuf::from(constants::DEFAULT_CONNTRACK_PROCFS_PATH),
            conntrack_rescan_interval_ms: 250,
            nat_retry: NatRetryConfig::default(),
            enable_gateway_lookup: false,
            gateway_route_cache_ttl_secs: 120,
            gateway_error_ttl_secs: 300,
            gateway_cache_size: 1024,
            procfs_root: PathBuf::from(constants::DEFAULT_PROCFS_ROOT),
            sysfs_root: PathBuf::from(constants::DEFAULT_SYSFS_ROOT),
            enable_protocol_classification: true,
        }
    }
}

impl TracerConfig {
    /// Loads a configuration snapshot from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML,
    /// or fails validation.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SockscopeError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the values can drive a tracer.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_tracked_connections == 0 {
            return Err(SockscopeError::Config {
                message: "max_tracked_connections must be greater than zero".into(),
            });
        }
        if self.short_lived_buffer_size == 0 {
            return Err(SockscopeError::Config {
                message: "short_lived_buffer_size must be greater than zero".into(),
            });
        }
        if self.nat_retry.max_retries > 0 && self.nat_retry.budget_ms < self.nat_retry.backoff_ms
        {
            return Err(SockscopeError::Config {
                message: format!(
                    "nat_retry.budget_ms ({}) is smaller than one backoff step ({})",
                    self.nat_retry.budget_ms, self.nat_retry.backoff_ms
                ),
            });
        }
        if self.gateway_cache_size == 0 {
            return Err(SockscopeError::Config {
                message: "gateway_cache_size must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Grace period of closed entries.
    #[must_use]
    pub const fn closed_grace(&self) -> Duration {
        Duration::from_millis(self.closed_grace_ms)
    }

    /// Idle time after which a client registration is reclaimed.
    #[must_use]
    pub const fn client_expiry(&self) -> Duration {
        Duration::from_secs(self.client_expiry_secs)
    }

    /// Idle timeout of open TCP entries.
    #[must_use]
    pub const fn tcp_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_conn_timeout_secs)
    }

    /// Idle timeout of open UDP entries.
    #[must_use]
    pub const fn udp_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_conn_timeout_secs)
    }

    /// Period of the maintenance task.
    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Minimum interval between conntrack table rescans.
    #[must_use]
    pub const fn conntrack_rescan_interval(&self) -> Duration {
        Duration::from_millis(self.conntrack_rescan_interval_ms)
    }
}
