//! Upgrade plan file watching
//!
//! The chain (or an operator) announces an upgrade by writing
//! `<home>/data/upgrade-info.json`. The watcher polls that file and raises
//! an edge when the plan's identity (name, height) changes. Absence of the
//! file means no pending plan; a malformed file keeps the last good plan.

use crate::core::error::{VisorError, VisorResult};
use crate::core::types::UpgradePlan;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct WatchState {
    last_seen: Option<UpgradePlan>,
    needs_update: bool,
}

/// Observes the upgrade-plan file and reports "plan changed" edges
#[derive(Debug, Clone)]
pub struct UpgradeWatcher {
    plan_file: PathBuf,
    state: Arc<RwLock<WatchState>>,
}

impl UpgradeWatcher {
    pub fn new(plan_file: PathBuf) -> Self {
        Self {
            plan_file,
            state: Arc::new(RwLock::new(WatchState::default())),
        }
    }

    /// Read the plan file once and record any change.
    ///
    /// A missing file is not an error. A parse failure is logged and the
    /// previously cached plan is retained.
    pub fn poll(&self) -> VisorResult<()> {
        let contents = match std::fs::read_to_string(&self.plan_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(VisorError::Io(e)),
        };

        let plan: UpgradePlan = match serde_json::from_str(&contents) {
            Ok(plan) => plan,
            Err(e) => {
                // Keep the last good plan; the malformed file is reported
                // but never surfaced to callers.
                log::warn!(
                    "ignoring malformed plan file {}: {}",
                    self.plan_file.display(),
                    VisorError::PlanParse(e)
                );
                return Ok(());
            }
        };

        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let changed = match &state.last_seen {
            Some(seen) => seen.name != plan.name || seen.height != plan.height,
            None => true,
        };
        if changed {
            log::info!(
                "upgrade plan detected: {} at height {}",
                plan.name,
                plan.height
            );
            state.last_seen = Some(plan);
            state.needs_update = true;
        }
        Ok(())
    }

    /// True when a changed plan has been cached and not yet consumed
    pub fn needs_update(&self) -> bool {
        self.state.read().map(|s| s.needs_update).unwrap_or(false)
    }

    /// The most recently cached plan
    pub fn current_plan(&self) -> Option<UpgradePlan> {
        self.state.read().ok().and_then(|s| s.last_seen.clone())
    }

    /// Acknowledge the pending edge after scheduling the plan
    pub fn clear_update_flag(&self) {
        if let Ok(mut state) = self.state.write() {
            state.needs_update = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_plan(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("upgrade-info.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_absent_file_means_no_plan() {
        let dir = TempDir::new().unwrap();
        let watcher = UpgradeWatcher::new(dir.path().join("upgrade-info.json"));
        watcher.poll().unwrap();
        assert!(!watcher.needs_update());
        assert!(watcher.current_plan().is_none());
    }

    #[test]
    fn test_new_plan_raises_edge_once() {
        let dir = TempDir::new().unwrap();
        let path = write_plan(&dir, r#"{"name":"v1.2.0","height":1000000,"info":{}}"#);
        let watcher = UpgradeWatcher::new(path);

        watcher.poll().unwrap();
        assert!(watcher.needs_update());
        let plan = watcher.current_plan().unwrap();
        assert_eq!(plan.name, "v1.2.0");
        assert_eq!(plan.height, 1_000_000);

        watcher.clear_update_flag();
        // Re-reading the same plan raises no new edge.
        watcher.poll().unwrap();
        assert!(!watcher.needs_update());
    }

    #[test]
    fn test_changed_height_raises_new_edge() {
        let dir = TempDir::new().unwrap();
        let path = write_plan(&dir, r#"{"name":"v1.2.0","height":1000000}"#);
        let watcher = UpgradeWatcher::new(path.clone());

        watcher.poll().unwrap();
        watcher.clear_update_flag();

        std::fs::write(&path, r#"{"name":"v1.2.0","height":2000000}"#).unwrap();
        watcher.poll().unwrap();
        assert!(watcher.needs_update());
        assert_eq!(watcher.current_plan().unwrap().height, 2_000_000);
    }

    #[test]
    fn test_malformed_file_retains_previous_plan() {
        let dir = TempDir::new().unwrap();
        let path = write_plan(&dir, r#"{"name":"v1.2.0","height":1000000}"#);
        let watcher = UpgradeWatcher::new(path.clone());

        watcher.poll().unwrap();
        watcher.clear_update_flag();

        std::fs::write(&path, "{not json").unwrap();
        watcher.poll().unwrap();
        assert!(!watcher.needs_update());
        assert_eq!(watcher.current_plan().unwrap().name, "v1.2.0");
    }

    #[test]
    fn test_deleted_file_retains_cached_plan() {
        let dir = TempDir::new().unwrap();
        let path = write_plan(&dir, r#"{"name":"v1.2.0","height":1000000}"#);
        let watcher = UpgradeWatcher::new(path.clone());

        watcher.poll().unwrap();
        watcher.clear_update_flag();

        std::fs::remove_file(&path).unwrap();
        watcher.poll().unwrap();
        assert!(!watcher.needs_update());
        assert!(watcher.current_plan().is_some());
    }
}
