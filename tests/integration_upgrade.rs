//! End-to-end upgrade scenarios against a real filesystem layout and real
//! shell-script node binaries.

use std::future::Future;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wemixvisor::config::VisorConfig;
use wemixvisor::core::height::{HeightMonitor, DEFAULT_HEIGHT_INTERVAL};
use wemixvisor::core::process::NodeManager;
use wemixvisor::core::symlink::SymlinkSwitcher;
use wemixvisor::core::types::{NodeState, UpgradePlan};
use wemixvisor::core::upgrade::UpgradeManager;
use wemixvisor::core::VisorError;
use wemixvisor::rpc::RpcClient;

struct Harness {
    _home: TempDir,
    config: Arc<VisorConfig>,
    manager: NodeManager,
    heights: Arc<HeightMonitor>,
    orchestrator: UpgradeManager,
}

fn write_script(path: &Path, body: &str) {
    let mut f = std::fs::File::create(path).unwrap();
    writeln!(f, "#!/bin/sh").unwrap();
    writeln!(f, "{}", body).unwrap();
    let mut perms = f.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

fn harness() -> Harness {
    let home = TempDir::new().unwrap();
    let mut config = VisorConfig::with_home(home.path());
    config.shutdown_grace_secs = 2;
    config.restart_on_failure = false;
    config.plan_poll_interval_ms = 100;
    let config = Arc::new(config);

    let paths = config.paths();
    std::fs::create_dir_all(paths.genesis_dir().join("bin")).unwrap();
    std::fs::create_dir_all(paths.data_dir()).unwrap();
    write_script(&paths.genesis_bin(), "sleep 30");
    std::os::unix::fs::symlink("genesis", paths.current_link()).unwrap();

    let manager = NodeManager::new(config.clone());
    let heights = Arc::new(HeightMonitor::new(
        RpcClient::new(config.rpc_port),
        DEFAULT_HEIGHT_INTERVAL,
    ));
    let orchestrator = UpgradeManager::new(config.clone(), manager.clone(), heights.clone());

    Harness {
        _home: home,
        config,
        manager,
        heights,
        orchestrator,
    }
}

impl Harness {
    fn install_upgrade(&self, name: &str, body: &str) -> PathBuf {
        let paths = self.config.paths();
        let bin = paths.upgrade_bin(name);
        std::fs::create_dir_all(bin.parent().unwrap()).unwrap();
        write_script(&bin, body);
        bin
    }

    fn write_plan(&self, body: &str) {
        std::fs::write(self.config.paths().upgrade_info_file(), body).unwrap();
    }

    fn current_target(&self) -> PathBuf {
        SymlinkSwitcher::new(self.config.paths())
            .current_target()
            .unwrap()
    }
}

async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_happy_path_upgrade() {
    let h = harness();
    h.install_upgrade("v1.2.0", "sleep 30");

    h.manager.start(&[]).await.unwrap();
    h.orchestrator.start().unwrap();

    h.write_plan(r#"{"name":"v1.2.0","height":1000000,"info":{}}"#);
    let orch = h.orchestrator.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let orch = orch.clone();
            async move { orch.status().await.pending.is_some() }
        })
        .await,
        "plan never scheduled"
    );

    // One height short of the target: nothing may happen.
    h.heights.publish(999_999);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.orchestrator.status().await.pending.is_some());
    assert_eq!(h.manager.state().await, NodeState::Running);
    assert_eq!(h.current_target(), PathBuf::from("genesis"));

    // Target height crossed: stop, switch, start. The pending plan is
    // cleared only after the attempt completes.
    h.heights.publish(1_000_000);
    assert!(
        eventually(Duration::from_secs(10), || {
            let orch = h.orchestrator.clone();
            async move { orch.status().await.pending.is_none() }
        })
        .await,
        "upgrade never completed"
    );
    assert_eq!(h.current_target(), PathBuf::from("upgrades/v1.2.0"));
    assert_eq!(h.manager.state().await, NodeState::Running);
    assert!(h.manager.pid().await > 0);

    h.orchestrator.stop().await;
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_failed_start_rolls_back_to_genesis() {
    let h = harness();
    let bad_bin = h.install_upgrade("v1.3.0", "sleep 30");
    // New binary present but not executable: the switch succeeds, the
    // start fails, and rollback must bring genesis back up.
    let mut perms = std::fs::metadata(&bad_bin).unwrap().permissions();
    perms.set_mode(0o644);
    std::fs::set_permissions(&bad_bin, perms).unwrap();

    h.manager.start(&[]).await.unwrap();

    let plan = UpgradePlan::new("v1.3.0", 1_000_000);
    let err = h
        .orchestrator
        .execute_upgrade(&plan, 1_000_000)
        .await
        .unwrap_err();
    assert!(matches!(err, VisorError::NotExecutable(_)));

    assert_eq!(h.current_target(), PathBuf::from("genesis"));
    assert_eq!(h.manager.state().await, NodeState::Running);
    assert!(!h.orchestrator.status().await.upgrading);

    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_upgrade_directory_rolls_back() {
    let h = harness();
    // No upgrades/v2.0.0 directory at all: the switch itself fails.
    h.manager.start(&[]).await.unwrap();

    let plan = UpgradePlan::new("v2.0.0", 500);
    let err = h.orchestrator.execute_upgrade(&plan, 500).await.unwrap_err();
    assert!(matches!(err, VisorError::SwitchFailed(_)));

    assert_eq!(h.current_target(), PathBuf::from("genesis"));
    assert_eq!(h.manager.state().await, NodeState::Running);

    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_stale_plan_rejected_on_height_event() {
    let h = harness();
    h.install_upgrade("v2", "sleep 30");

    h.manager.start(&[]).await.unwrap();
    h.orchestrator.start().unwrap();

    h.orchestrator.schedule(UpgradePlan::new("v2", 999_999)).await;
    h.heights.publish(1_000_000);

    let orch = h.orchestrator.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let orch = orch.clone();
            async move { orch.status().await.pending.is_none() }
        })
        .await,
        "stale plan not cleared"
    );
    // Validation rejected the plan before any stop/switch.
    assert_eq!(h.manager.state().await, NodeState::Running);
    assert_eq!(h.current_target(), PathBuf::from("genesis"));

    h.orchestrator.stop().await;
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_plan_deletion_leaves_pending_intact() {
    let h = harness();
    h.manager.start(&[]).await.unwrap();
    h.orchestrator.start().unwrap();

    h.write_plan(r#"{"name":"v3","height":5000000,"info":{}}"#);
    let orch = h.orchestrator.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            let orch = orch.clone();
            async move { orch.status().await.pending.is_some() }
        })
        .await
    );

    std::fs::remove_file(h.config.paths().upgrade_info_file()).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Deleting the file does not cancel the in-memory plan; it simply
    // never fires because the height is not reached.
    let status = h.orchestrator.status().await;
    assert_eq!(status.pending.unwrap().name, "v3");
    assert_eq!(h.manager.state().await, NodeState::Running);
    assert_eq!(h.current_target(), PathBuf::from("genesis"));

    h.orchestrator.stop().await;
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_upgrade_rejected() {
    let h = harness();
    // A node that ignores SIGTERM keeps the first upgrade inside stop()
    // for the full grace period, leaving room to observe the guard.
    write_script(
        &h.config.paths().genesis_bin(),
        "trap '' TERM INT\nsleep 30",
    );
    h.install_upgrade("v1.2.0", "sleep 30");

    h.manager.start(&[]).await.unwrap();

    let first = {
        let orch = h.orchestrator.clone();
        tokio::spawn(async move {
            orch.execute_upgrade(&UpgradePlan::new("v1.2.0", 100), 100)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = h
        .orchestrator
        .execute_upgrade(&UpgradePlan::new("v1.2.0", 100), 100)
        .await
        .unwrap_err();
    assert!(matches!(err, VisorError::UpgradeInProgress));

    first.await.unwrap().unwrap();
    assert_eq!(h.current_target(), PathBuf::from("upgrades/v1.2.0"));
    assert_eq!(h.manager.state().await, NodeState::Running);

    h.manager.stop().await.unwrap();
}
