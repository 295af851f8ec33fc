//! Core types for wemixvisor
//!
//! This module contains the node state machine variants, the published
//! status record, upgrade plan structures, and health report types used
//! throughout the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle state of the managed node process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Upgrading,
    Error,
    Crashed,
}

impl NodeState {
    /// String representation used in status output and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Stopped => "stopped",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Upgrading => "upgrading",
            NodeState::Error => "error",
            NodeState::Crashed => "crashed",
        }
    }

    /// States in which the node process is expected to hold a live pid
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            NodeState::Starting | NodeState::Running | NodeState::Stopping | NodeState::Upgrading
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upgrade plan scheduled by an external coordinator.
///
/// Written to `<home>/data/upgrade-info.json` by the chain (or an operator)
/// and picked up by the upgrade watcher. The `info` map is opaque except for
/// the optionally recognized keys `binaries`, `checksum`, and `description`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradePlan {
    pub name: String,
    pub height: i64,
    #[serde(default)]
    pub info: serde_json::Map<String, serde_json::Value>,
}

impl UpgradePlan {
    pub fn new(name: impl Into<String>, height: i64) -> Self {
        Self {
            name: name.into(),
            height,
            info: serde_json::Map::new(),
        }
    }

    /// Validate the plan's structural requirements
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("plan name is empty".to_string());
        }
        if self.height <= 0 {
            return Err(format!("plan height must be positive, got {}", self.height));
        }
        Ok(())
    }

    /// Optional human-readable description from the info map
    pub fn description(&self) -> Option<&str> {
        self.info.get("description").and_then(|v| v.as_str())
    }

    /// Optional checksum from the info map
    pub fn checksum(&self) -> Option<&str> {
        self.info.get("checksum").and_then(|v| v.as_str())
    }
}

/// Outcome of a single health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub fn ok(name: impl Into<String>, details: Option<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            error: None,
            details,
        }
    }

    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            error: Some(reason.into()),
            details: None,
        }
    }
}

/// Aggregated health record published by the health monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// AND of all probe outcomes
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub checks: HashMap<String, CheckResult>,
}

impl HealthStatus {
    pub fn from_checks(checks: Vec<CheckResult>) -> Self {
        let healthy = checks.iter().all(|c| c.healthy);
        Self {
            healthy,
            timestamp: Utc::now(),
            checks: checks.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }
}

/// Status record published to observers of the node manager
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub state: NodeState,
    pub state_string: String,
    /// 0 when no process is present
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub restart_count: u32,
    pub version: String,
    pub network: String,
    pub binary_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
}

impl NodeStatus {
    /// Uptime as a duration, for callers that prefer not to work in seconds
    pub fn uptime(&self) -> Duration {
        Duration::from_secs(self.uptime_secs)
    }
}
