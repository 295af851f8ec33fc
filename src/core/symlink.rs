//! Binary selection via the `current` symlink
//!
//! The `current` link under `<home>/wemixvisor` decides which binary
//! directory is live. This module is the only code permitted to mutate it.
//! Links are created *relative* to the link's parent directory so the whole
//! home tree can be relocated without breaking the selection.

use crate::core::error::{VisorError, VisorResult};
use crate::core::paths::VisorPaths;
use std::fs;
use std::path::{Path, PathBuf};

/// Atomically repoints the `current` handle between `genesis` and
/// `upgrades/<name>`.
///
/// Callers must only invoke the switch while the node process is stopped;
/// between removal and re-creation the link is transiently absent.
#[derive(Debug, Clone)]
pub struct SymlinkSwitcher {
    paths: VisorPaths,
}

impl SymlinkSwitcher {
    pub fn new(paths: VisorPaths) -> Self {
        Self { paths }
    }

    /// Point `current` at the genesis binary directory
    pub fn link_to_genesis(&self) -> VisorResult<()> {
        self.relink(Path::new("genesis"))
    }

    /// Point `current` at `upgrades/<name>`
    pub fn link_to_upgrade(&self, name: &str) -> VisorResult<()> {
        let target = PathBuf::from("upgrades").join(name);
        let target_dir = self.paths.root().join(&target);
        if !target_dir.is_dir() {
            return Err(VisorError::SwitchFailed(format!(
                "upgrade directory does not exist: {}",
                target_dir.display()
            )));
        }
        self.relink(&target)
    }

    /// Resolve the link's current target, relative to `<home>/wemixvisor`
    pub fn current_target(&self) -> VisorResult<PathBuf> {
        fs::read_link(self.paths.current_link()).map_err(VisorError::Io)
    }

    fn relink(&self, target: &Path) -> VisorResult<()> {
        let link = self.paths.current_link();

        match fs::symlink_metadata(&link) {
            Ok(_) => {
                fs::remove_file(&link).map_err(|e| {
                    VisorError::SwitchFailed(format!(
                        "failed to remove {}: {}",
                        link.display(),
                        e
                    ))
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(VisorError::SwitchFailed(format!(
                    "failed to inspect {}: {}",
                    link.display(),
                    e
                )));
            }
        }

        std::os::unix::fs::symlink(target, &link).map_err(|e| {
            VisorError::SwitchFailed(format!(
                "failed to link {} -> {}: {}",
                link.display(),
                target.display(),
                e
            ))
        })?;

        log::info!("current -> {}", target.display());
        Ok(())
    }
}
