//! Configuration for wemixvisor
//!
//! The supervisor is configured from a TOML file plus a small set of
//! environment-variable overrides supplied by the surrounding tooling. The
//! core components receive a read-only handle to the resulting
//! [`VisorConfig`]; nothing in the core reads the environment directly.

use crate::core::error::{VisorError, VisorResult};
use crate::core::paths::VisorPaths;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supervisor configuration record
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VisorConfig {
    /// Node home directory; everything else lives under it
    pub home: PathBuf,

    /// Binary filename of the managed daemon
    #[serde(default = "default_daemon_name")]
    pub daemon_name: String,

    /// Seconds to wait for a graceful exit before SIGKILL
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Automatically restart the node after an unexpected exit
    #[serde(default = "default_restart_on_failure")]
    pub restart_on_failure: bool,

    /// Automatic restart attempts per crash chain
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Milliseconds between health-check rounds
    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,

    /// Node JSON-RPC port on localhost
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Network label exported to the node as WEMIX_NETWORK
    #[serde(default = "default_network")]
    pub network: String,

    /// Redirect node stdout/stderr to this file; inherit when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Extra environment variables for the node process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Skip the pre-upgrade data backup
    #[serde(default)]
    pub unsafe_skip_backup: bool,

    /// Milliseconds between upgrade-plan file polls
    #[serde(default = "default_plan_poll_interval")]
    pub plan_poll_interval_ms: u64,

    /// Milliseconds between chain-height polls
    #[serde(default = "default_height_poll_interval")]
    pub height_poll_interval_ms: u64,

    /// Minimum connected peers before the peer probe reports healthy
    #[serde(default = "default_min_peers")]
    pub min_peers: u64,

    /// Minimum free GiB on the data filesystem
    #[serde(default = "default_min_disk_gib")]
    pub min_disk_gib: u64,

    /// Optional pidfile consulted by the process probe
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

// Default value functions
fn default_daemon_name() -> String {
    "wemixd".to_string()
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_restart_on_failure() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

fn default_health_interval() -> u64 {
    30_000
}

fn default_rpc_port() -> u16 {
    8588
}

fn default_network() -> String {
    "mainnet".to_string()
}

fn default_plan_poll_interval() -> u64 {
    300
}

fn default_height_poll_interval() -> u64 {
    5_000
}

fn default_min_peers() -> u64 {
    1
}

fn default_min_disk_gib() -> u64 {
    10
}

/// Smallest poll/health interval the configuration accepts
pub const MIN_INTERVAL_MS: u64 = 100;

impl VisorConfig {
    /// Configuration with defaults for everything but the home directory
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            daemon_name: default_daemon_name(),
            shutdown_grace_secs: default_shutdown_grace(),
            restart_on_failure: default_restart_on_failure(),
            max_restarts: default_max_restarts(),
            health_interval_ms: default_health_interval(),
            rpc_port: default_rpc_port(),
            network: default_network(),
            log_file: None,
            env: HashMap::new(),
            unsafe_skip_backup: false,
            plan_poll_interval_ms: default_plan_poll_interval(),
            height_poll_interval_ms: default_height_poll_interval(),
            min_peers: default_min_peers(),
            min_disk_gib: default_min_disk_gib(),
            pid_file: None,
        }
    }

    pub fn load_from_file(path: &Path) -> VisorResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            VisorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: VisorConfig = toml::from_str(&contents).map_err(|e| {
            VisorError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Apply overrides from the environment variables the surrounding
    /// tooling recognizes.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(home) = std::env::var("DAEMON_HOME") {
            if !home.is_empty() {
                self.home = PathBuf::from(home);
            }
        }
        if let Ok(name) = std::env::var("DAEMON_NAME") {
            if !name.is_empty() {
                self.daemon_name = name;
            }
        }
        if let Ok(value) = std::env::var("DAEMON_RESTART_AFTER_UPGRADE") {
            self.restart_on_failure = parse_bool_flag(&value);
        }
        if let Ok(value) = std::env::var("UNSAFE_SKIP_BACKUP") {
            self.unsafe_skip_backup = parse_bool_flag(&value);
        }
        if let Ok(value) = std::env::var("DAEMON_ALLOW_DOWNLOAD_BINARIES") {
            if parse_bool_flag(&value) {
                log::warn!(
                    "DAEMON_ALLOW_DOWNLOAD_BINARIES is set but binary download \
                     is not supported; binaries must be pre-placed on disk"
                );
            }
        }
    }

    /// Validate the configuration; called once at startup
    pub fn validate(&self) -> VisorResult<()> {
        if self.home.as_os_str().is_empty() {
            return Err(VisorError::Config("home directory is empty".to_string()));
        }
        if self.daemon_name.is_empty() {
            return Err(VisorError::Config("daemon_name is empty".to_string()));
        }
        if self.daemon_name.contains('/') {
            return Err(VisorError::Config(format!(
                "daemon_name must be a bare filename, got {:?}",
                self.daemon_name
            )));
        }
        if self.shutdown_grace_secs == 0 {
            return Err(VisorError::Config(
                "shutdown_grace_secs must be at least 1".to_string(),
            ));
        }
        if self.rpc_port == 0 {
            return Err(VisorError::Config("rpc_port must be non-zero".to_string()));
        }
        for (name, value) in [
            ("health_interval_ms", self.health_interval_ms),
            ("plan_poll_interval_ms", self.plan_poll_interval_ms),
            ("height_poll_interval_ms", self.height_poll_interval_ms),
        ] {
            if value < MIN_INTERVAL_MS {
                return Err(VisorError::Config(format!(
                    "{} must be at least {} ms, got {}",
                    name, MIN_INTERVAL_MS, value
                )));
            }
        }
        Ok(())
    }

    /// Path resolver bound to this configuration
    pub fn paths(&self) -> VisorPaths {
        VisorPaths::new(&self.home, &self.daemon_name)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn plan_poll_interval(&self) -> Duration {
        Duration::from_millis(self.plan_poll_interval_ms)
    }

    pub fn height_poll_interval(&self) -> Duration {
        Duration::from_millis(self.height_poll_interval_ms)
    }
}

fn parse_bool_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
