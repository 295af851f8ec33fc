//! Height-triggered binary upgrades
//!
//! The upgrade manager decides *when* to upgrade and in *what order* to run
//! the steps. It consumes plan edges from the watcher and height updates
//! from the height monitor; when the chain crosses a pending plan's target
//! height it stops the node, repoints the `current` symlink, and starts the
//! node again, rolling back to the genesis binary if the new one fails.

use crate::config::VisorConfig;
use crate::core::error::{VisorError, VisorResult};
use crate::core::height::HeightMonitor;
use crate::core::process::NodeManager;
use crate::core::symlink::SymlinkSwitcher;
use crate::core::types::{NodeState, UpgradePlan};
use crate::core::watcher::UpgradeWatcher;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct OrchestratorState {
    pending: Option<UpgradePlan>,
    upgrading: bool,
}

/// Snapshot of the orchestrator's view of the world
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeStatus {
    pub pending: Option<UpgradePlan>,
    pub upgrading: bool,
    pub last_height: u64,
    pub node_state: NodeState,
}

/// Coordinates stop → switch → start → rollback around the node manager
#[derive(Clone)]
pub struct UpgradeManager {
    config: Arc<VisorConfig>,
    manager: NodeManager,
    switcher: SymlinkSwitcher,
    watcher: UpgradeWatcher,
    heights: Arc<HeightMonitor>,
    state: Arc<RwLock<OrchestratorState>>,
    started: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl UpgradeManager {
    pub fn new(
        config: Arc<VisorConfig>,
        manager: NodeManager,
        heights: Arc<HeightMonitor>,
    ) -> Self {
        let paths = config.paths();
        Self {
            switcher: SymlinkSwitcher::new(paths.clone()),
            watcher: UpgradeWatcher::new(paths.upgrade_info_file()),
            config,
            manager,
            heights,
            state: Arc::new(RwLock::new(OrchestratorState::default())),
            started: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Launch the plan-watching and height-monitoring tasks
    pub fn start(&self) -> VisorResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(VisorError::AlreadyStarted);
        }
        self.running.store(true, Ordering::SeqCst);

        let height_rx = self.heights.subscribe();

        let this = self.clone();
        let watch = tokio::spawn(async move { this.watch_plans().await });

        let this = self.clone();
        let monitor = tokio::spawn(async move { this.monitor_heights(height_rx).await });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(watch);
            tasks.push(monitor);
        }
        log::info!(
            "upgrade orchestrator started (watching {})",
            self.config.paths().upgrade_info_file().display()
        );
        Ok(())
    }

    /// Halt both tasks and wait for them to exit; idempotent
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.started.store(false, Ordering::SeqCst);
    }

    /// Record a plan as pending, replacing any previous one
    pub async fn schedule(&self, plan: UpgradePlan) {
        let mut state = self.state.write().await;
        match &state.pending {
            Some(prev) => log::info!(
                "replacing pending upgrade {} with {} at height {}",
                prev.name,
                plan.name,
                plan.height
            ),
            None => log::info!(
                "upgrade {} scheduled at height {}{}{}",
                plan.name,
                plan.height,
                plan.description()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default(),
                plan.checksum()
                    .map(|c| format!(" [checksum {}]", c))
                    .unwrap_or_default()
            ),
        }
        state.pending = Some(plan);
    }

    pub async fn status(&self) -> UpgradeStatus {
        let state = self.state.read().await;
        UpgradeStatus {
            pending: state.pending.clone(),
            upgrading: state.upgrading,
            last_height: self.heights.last_height(),
            node_state: self.manager.state().await,
        }
    }

    /// Perform the upgrade transition for `plan` at the observed height.
    ///
    /// At most one upgrade runs at a time; a reentrant call fails
    /// immediately with [`VisorError::UpgradeInProgress`].
    pub async fn execute_upgrade(
        &self,
        plan: &UpgradePlan,
        current_height: u64,
    ) -> VisorResult<()> {
        {
            let mut state = self.state.write().await;
            if state.upgrading {
                return Err(VisorError::UpgradeInProgress);
            }
            state.upgrading = true;
        }

        let result = self.run_upgrade(plan, current_height).await;

        self.state.write().await.upgrading = false;
        result
    }

    async fn run_upgrade(&self, plan: &UpgradePlan, current_height: u64) -> VisorResult<()> {
        plan.validate().map_err(VisorError::PlanInvalid)?;
        if current_height > plan.height as u64 {
            return Err(VisorError::PlanInvalid(format!(
                "plan {} targets height {} but the chain is already at {}",
                plan.name, plan.height, current_height
            )));
        }

        log::info!(
            "upgrading node to {} (target height {}, observed {})",
            plan.name,
            plan.height,
            current_height
        );
        if self.config.unsafe_skip_backup {
            log::warn!("unsafe_skip_backup is set; data directory will not be archived");
        }

        // Stop first. If this fails, the `current` link has not been
        // touched and the node is left as the manager reached it.
        self.manager.stop().await?;

        let args = self.manager.last_args().await;

        if let Err(e) = self.switcher.link_to_upgrade(&plan.name) {
            log::error!("binary switch to {} failed: {}", plan.name, e);
            self.rollback(&args).await?;
            return Err(e);
        }

        if let Err(e) = self.manager.start(&args).await {
            log::error!("node failed to start on {}: {}", plan.name, e);
            self.rollback(&args).await?;
            return Err(e);
        }

        log::info!("upgrade to {} complete", plan.name);
        Ok(())
    }

    /// Point `current` back at genesis and bring the node up again
    pub async fn rollback(&self, args: &[String]) -> VisorResult<()> {
        log::warn!("rolling back to genesis binary");

        self.switcher
            .link_to_genesis()
            .map_err(|e| VisorError::RollbackFailed(e.to_string()))?;

        let result = match self.manager.state().await {
            NodeState::Stopped => self.manager.start(args).await,
            // A failed start leaves the manager in Error; restart resets it.
            _ => self.manager.restart().await,
        };
        result.map_err(|e| VisorError::RollbackFailed(e.to_string()))?;

        log::info!("rollback complete; node running on genesis binary");
        Ok(())
    }

    async fn watch_plans(&self) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.watcher.poll() {
                log::warn!("plan poll failed: {}", e);
            }
            if self.watcher.needs_update() {
                if let Some(plan) = self.watcher.current_plan() {
                    self.schedule(plan).await;
                }
                self.watcher.clear_update_flag();
            }
            tokio::time::sleep(self.config.plan_poll_interval()).await;
        }
        log::debug!("plan watch task exiting");
    }

    async fn monitor_heights(&self, mut rx: broadcast::Receiver<u64>) {
        while self.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(Duration::from_millis(250), rx.recv()).await {
                Ok(Ok(height)) => self.on_height(height).await,
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    log::debug!("height subscriber lagged by {} updates", missed);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                // Timeout: re-check the running flag.
                Err(_) => {}
            }
        }
        log::debug!("height monitor task exiting");
    }

    async fn on_height(&self, height: u64) {
        let plan = {
            let state = self.state.read().await;
            if state.upgrading {
                return;
            }
            match &state.pending {
                // A plan with a nonsensical height still goes through
                // execute_upgrade so validation can reject and clear it.
                Some(plan) if plan.height <= 0 || height >= plan.height as u64 => plan.clone(),
                _ => return,
            }
        };

        if let Err(e) = self.execute_upgrade(&plan, height).await {
            log::error!("upgrade to {} failed: {}", plan.name, e);
        }

        // One attempt per scheduled plan, success or failure; operators
        // re-schedule to retry.
        self.state.write().await.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::height::DEFAULT_HEIGHT_INTERVAL;
    use crate::rpc::RpcClient;
    use tempfile::TempDir;

    fn orchestrator(home: &TempDir) -> UpgradeManager {
        let config = Arc::new(VisorConfig::with_home(home.path()));
        let manager = NodeManager::new(config.clone());
        let heights = Arc::new(HeightMonitor::new(
            RpcClient::new(config.rpc_port),
            DEFAULT_HEIGHT_INTERVAL,
        ));
        UpgradeManager::new(config, manager, heights)
    }

    #[tokio::test]
    async fn test_start_twice_returns_already_started() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);

        orch.start().unwrap();
        let err = orch.start().unwrap_err();
        assert!(matches!(err, VisorError::AlreadyStarted));

        orch.stop().await;
        // After a stop the orchestrator may be started again.
        orch.start().unwrap();
        orch.stop().await;
    }

    #[tokio::test]
    async fn test_zero_height_plan_rejected() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);

        let plan = UpgradePlan::new("v2", 0);
        let err = orch.execute_upgrade(&plan, 100).await.unwrap_err();
        assert!(matches!(err, VisorError::PlanInvalid(_)));
        assert!(!orch.status().await.upgrading);
    }

    #[tokio::test]
    async fn test_stale_plan_rejected_before_touching_node() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);

        let plan = UpgradePlan::new("v2", 999_999);
        let err = orch.execute_upgrade(&plan, 1_000_000).await.unwrap_err();
        match err {
            VisorError::PlanInvalid(reason) => {
                assert!(reason.contains("already at 1000000"), "{}", reason);
            }
            other => panic!("expected PlanInvalid, got {}", other),
        }
        // Validation failed before any stop/switch: node untouched.
        assert_eq!(orch.manager.state().await, NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_empty_name_plan_rejected() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);

        let plan = UpgradePlan::new("", 1_000_000);
        let err = orch.execute_upgrade(&plan, 500).await.unwrap_err();
        assert!(matches!(err, VisorError::PlanInvalid(_)));
    }

    #[tokio::test]
    async fn test_schedule_replaces_pending() {
        let home = TempDir::new().unwrap();
        let orch = orchestrator(&home);

        orch.schedule(UpgradePlan::new("v1", 100)).await;
        orch.schedule(UpgradePlan::new("v2", 200)).await;

        let status = orch.status().await;
        let pending = status.pending.unwrap();
        assert_eq!(pending.name, "v2");
        assert_eq!(pending.height, 200);
        assert!(!status.upgrading);
    }
}
