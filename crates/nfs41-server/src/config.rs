//! NFS server configuration

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NfsError, NfsResult};

/// Per-client limits and relaxations
///
/// Channel attributes a client asks for at CREATE_SESSION are only ever
/// adjusted downward to these values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientLimits {
    /// Largest request accepted on a fore channel
    pub max_request_size: u32,
    /// Largest reply sent on a fore channel
    pub max_response_size: u32,
    /// Largest reply kept in a slot's replay cache
    pub max_response_size_cached: u32,
    /// Operations allowed per COMPOUND
    pub max_operations: u32,
    /// Slots per channel
    pub max_requests: u32,
    /// READ may present the all-ones stateid to bypass share checks
    pub allow_stateid1: bool,
    /// CLOSE drops byte-range locks instead of failing with LOCKS_HELD
    pub allow_close_with_locks: bool,
}

impl Default for ClientLimits {
    fn default() -> Self {
        Self {
            max_request_size: 16384,
            max_response_size: 16384,
            max_response_size_cached: 4096,
            max_operations: 128,
            max_requests: 8,
            allow_stateid1: true,
            allow_close_with_locks: false,
        }
    }
}

/// NFS server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NfsConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Lease time in seconds
    pub lease_time_secs: u64,
    /// Grace period after a reboot, in seconds
    pub grace_period_secs: u64,
    /// Act as a pNFS metadata server
    pub is_mds: bool,
    /// Act as a pNFS data server (stateids are not checked)
    pub is_ds: bool,
    /// Hand out delegations at OPEN
    pub delegations_enabled: bool,
    /// POSIX split/merge semantics for byte-range locks
    pub posix_locks: bool,
    /// Recall tasks allowed to run at once
    pub recall_workers: usize,
    /// How long a recall waits for the client's CB_COMPOUND reply, in seconds
    pub callback_timeout_secs: u64,
    /// Per-client limits
    pub limits: ClientLimits,
}

impl Default for NfsConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 2049)),
            lease_time_secs: 60,
            grace_period_secs: 90,
            is_mds: false,
            is_ds: false,
            delegations_enabled: true,
            posix_locks: true,
            recall_workers: 8,
            callback_timeout_secs: 10,
            limits: ClientLimits::default(),
        }
    }
}

impl NfsConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(s: &str) -> NfsResult<Self> {
        toml::from_str(s).map_err(|e| NfsError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> NfsResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Lease time
    pub fn lease_time(&self) -> Duration {
        Duration::from_secs(self.lease_time_secs)
    }

    /// Grace period
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Callback reply timeout
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }

    /// Set bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set lease time
    pub fn with_lease_time(mut self, secs: u64) -> Self {
        self.lease_time_secs = secs;
        self
    }

    /// Set grace period
    pub fn with_grace_period(mut self, secs: u64) -> Self {
        self.grace_period_secs = secs;
        self
    }

    /// Run as a pNFS metadata server
    pub fn metadata_server(mut self) -> Self {
        self.is_mds = true;
        self
    }

    /// Run as a pNFS data server
    pub fn data_server(mut self) -> Self {
        self.is_ds = true;
        self
    }

    /// Disable delegations
    pub fn disable_delegations(mut self) -> Self {
        self.delegations_enabled = false;
        self
    }

    /// Choose between POSIX and exact-range lock semantics
    pub fn posix_locks(mut self, enabled: bool) -> Self {
        self.posix_locks = enabled;
        self
    }

    /// Set per-client limits
    pub fn with_limits(mut self, limits: ClientLimits) -> Self {
        self.limits = limits;
        self
    }
}
