//! Filesystem layout for the supervisor's home directory
//!
//! All paths the supervisor touches are derived from the home directory and
//! the daemon name through this one resolver, so the layout contract lives
//! in a single place:
//!
//! ```text
//! <home>/wemixvisor/genesis/bin/<name>          initial binary
//! <home>/wemixvisor/upgrades/<plan>/bin/<name>  upgrade binaries
//! <home>/wemixvisor/current                     symlink -> genesis | upgrades/<plan>
//! <home>/data/upgrade-info.json                 upgrade plan file
//! <home>/logs/node.log                          optional node output log
//! <home>/backups/                               optional archived data
//! ```

use std::path::{Path, PathBuf};

/// Directory name under the home that holds the supervisor's binary tree
pub const VISOR_DIR: &str = "wemixvisor";

/// Name of the symlink that selects the live binary directory
pub const CURRENT_LINK: &str = "current";

/// Resolves every path the supervisor needs from home + daemon name
#[derive(Debug, Clone)]
pub struct VisorPaths {
    home: PathBuf,
    daemon_name: String,
}

impl VisorPaths {
    pub fn new(home: impl Into<PathBuf>, daemon_name: impl Into<String>) -> Self {
        Self {
            home: home.into(),
            daemon_name: daemon_name.into(),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// `<home>/wemixvisor`
    pub fn root(&self) -> PathBuf {
        self.home.join(VISOR_DIR)
    }

    /// `<home>/wemixvisor/genesis`
    pub fn genesis_dir(&self) -> PathBuf {
        self.root().join("genesis")
    }

    /// `<home>/wemixvisor/genesis/bin/<name>`
    pub fn genesis_bin(&self) -> PathBuf {
        self.genesis_dir().join("bin").join(&self.daemon_name)
    }

    /// `<home>/wemixvisor/upgrades`
    pub fn upgrades_dir(&self) -> PathBuf {
        self.root().join("upgrades")
    }

    /// `<home>/wemixvisor/upgrades/<plan>`
    pub fn upgrade_dir(&self, plan_name: &str) -> PathBuf {
        self.upgrades_dir().join(plan_name)
    }

    /// `<home>/wemixvisor/upgrades/<plan>/bin/<name>`
    pub fn upgrade_bin(&self, plan_name: &str) -> PathBuf {
        self.upgrade_dir(plan_name).join("bin").join(&self.daemon_name)
    }

    /// `<home>/wemixvisor/current` (symlink)
    pub fn current_link(&self) -> PathBuf {
        self.root().join(CURRENT_LINK)
    }

    /// `<home>/wemixvisor/current/bin/<name>` — the live binary
    pub fn current_bin(&self) -> PathBuf {
        self.current_link().join("bin").join(&self.daemon_name)
    }

    /// `<home>/data`
    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    /// `<home>/data/upgrade-info.json`
    pub fn upgrade_info_file(&self) -> PathBuf {
        self.data_dir().join("upgrade-info.json")
    }

    /// `<home>/logs`
    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// `<home>/logs/node.log`
    pub fn node_log_file(&self) -> PathBuf {
        self.logs_dir().join("node.log")
    }

    /// `<home>/backups`
    pub fn backups_dir(&self) -> PathBuf {
        self.home.join("backups")
    }
}
