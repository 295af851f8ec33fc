//! Core functionality for wemixvisor
//!
//! This module contains the process lifecycle manager, the upgrade
//! orchestrator and its collaborators, and the foundational types and
//! error handling used throughout the supervisor.

pub mod cli;
pub mod error;
pub mod height;
pub mod paths;
pub mod process;
pub mod signals;
pub mod symlink;
pub mod types;
pub mod upgrade;
pub mod watcher;

// Re-export commonly used items
pub use cli::VisorCli;
pub use error::{VisorError, VisorResult};
pub use height::HeightMonitor;
pub use paths::VisorPaths;
pub use process::NodeManager;
pub use signals::SignalHandler;
pub use symlink::SymlinkSwitcher;
pub use types::{CheckResult, HealthStatus, NodeState, NodeStatus, UpgradePlan};
pub use upgrade::{UpgradeManager, UpgradeStatus};
pub use watcher::UpgradeWatcher;
