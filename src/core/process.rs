//! Node process lifecycle management
//!
//! [`NodeManager`] owns the managed child process: spawn through the
//! `current` binary, graceful-or-forced shutdown of the whole process
//! group, crash detection with bounded automatic restarts, and zombie
//! reaping. All state transitions go through one lock so observers always
//! see a consistent state/pid pair.

use crate::config::VisorConfig;
use crate::core::error::{VisorError, VisorResult};
use crate::core::paths::VisorPaths;
use crate::core::types::{NodeState, NodeStatus};
use crate::monitoring::health::HealthMonitor;
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Pause between stopping and starting during a restart, letting the OS
/// release ports and file locks
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Delay before an automatic restart after a crash
const CRASH_RESTART_DELAY: Duration = Duration::from_secs(1);

/// How often the child is polled for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline for each `version` flag attempt against the binary
const VERSION_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
struct ManagerState {
    state: NodeState,
    pid: Option<u32>,
    start_time: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    restart_count: u32,
    /// Automatic restart attempts in the current crash chain; reset by a
    /// manual restart
    auto_restarts: u32,
    last_args: Vec<String>,
    /// Version string sampled from the binary after each start
    version: String,
    /// A deferred automatic restart has been scheduled but not finished;
    /// the node will pass through `Stopped` on its way back up
    restart_pending: bool,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            state: NodeState::Stopped,
            pid: None,
            start_time: None,
            started_at: None,
            restart_count: 0,
            auto_restarts: 0,
            last_args: Vec::new(),
            version: "unknown".to_string(),
            restart_pending: false,
        }
    }
}

/// Thread-safe owner of the node child process
#[derive(Clone)]
pub struct NodeManager {
    config: Arc<VisorConfig>,
    paths: VisorPaths,
    inner: Arc<RwLock<ManagerState>>,
    child: Arc<Mutex<Option<Child>>>,
    health: Option<Arc<HealthMonitor>>,
}

impl NodeManager {
    pub fn new(config: Arc<VisorConfig>) -> Self {
        let paths = config.paths();
        Self {
            config,
            paths,
            inner: Arc::new(RwLock::new(ManagerState::new())),
            child: Arc::new(Mutex::new(None)),
            health: None,
        }
    }

    /// Attach a health monitor; it is started when the node enters
    /// `Running` and stopped when the node leaves it
    pub fn with_health_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.health = Some(monitor);
        self
    }

    pub fn paths(&self) -> &VisorPaths {
        &self.paths
    }

    /// Spawn the node with the given arguments.
    ///
    /// Permitted only from `Stopped`. The child runs in its own process
    /// group so later signals reach every descendant.
    pub fn start<'a>(
        &'a self,
        args: &'a [String],
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = VisorResult<()>> + Send + 'a>> {
        Box::pin(async move {
        {
            let mut inner = self.inner.write().await;
            if inner.state != NodeState::Stopped {
                return Err(VisorError::InvalidState {
                    operation: "start",
                    state: inner.state,
                });
            }
            inner.state = NodeState::Starting;
            inner.last_args = args.to_vec();
            inner.version = "unknown".to_string();
        }

        match self.spawn_child(args) {
            Ok(child) => {
                let pid = child.id();
                *self.child.lock().await = Some(child);
                {
                    let mut inner = self.inner.write().await;
                    inner.pid = Some(pid);
                    inner.start_time = Some(Utc::now());
                    inner.started_at = Some(Instant::now());
                    inner.state = NodeState::Running;
                }
                log::info!(
                    "node started: {} (pid {})",
                    self.paths.current_bin().display(),
                    pid
                );

                let manager = self.clone();
                tokio::spawn(async move { manager.monitor_child().await });

                // Sample the binary's version off the hot path; a binary
                // with no version flag would otherwise stall status calls.
                // The result is keyed to the pid it was probed for, so a
                // slow probe from before an upgrade cannot overwrite the
                // new binary's version.
                let manager = self.clone();
                tokio::spawn(async move {
                    let version = probe_binary_version(&manager.paths.current_bin()).await;
                    let mut inner = manager.inner.write().await;
                    if inner.pid == Some(pid) {
                        inner.version = version;
                    }
                });

                if let Some(health) = &self.health {
                    health.start();
                }
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.write().await;
                inner.state = NodeState::Error;
                inner.pid = None;
                Err(e)
            }
        }
        })
    }

    /// Stop the node: SIGTERM to the process group, bounded grace wait,
    /// SIGKILL on expiry. Permitted only from `Running`.
    pub async fn stop(&self) -> VisorResult<()> {
        {
            let mut inner = self.inner.write().await;
            if inner.state != NodeState::Running {
                return Err(VisorError::InvalidState {
                    operation: "stop",
                    state: inner.state,
                });
            }
            inner.state = NodeState::Stopping;
        }

        if let Some(health) = &self.health {
            health.stop().await;
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            let pid = child.id();
            let pgid = Pid::from_raw(pid as i32);

            log::info!("stopping node: SIGTERM to process group {}", pid);
            if let Err(e) = killpg(pgid, Signal::SIGTERM) {
                log::warn!("failed to signal process group {}: {}", pid, e);
            }

            let deadline = Instant::now() + self.config.shutdown_grace();
            let mut exited = false;
            while Instant::now() < deadline {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        log::info!("node exited: {}", status);
                        exited = true;
                        break;
                    }
                    Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                    Err(e) => {
                        log::error!("error waiting for node: {}", e);
                        break;
                    }
                }
            }

            if !exited {
                log::warn!(
                    "node did not exit within {}s grace; SIGKILL to process group {}",
                    self.config.shutdown_grace().as_secs(),
                    pid
                );
                let _ = killpg(pgid, Signal::SIGKILL);
                let _ = child.wait();
            }

            reap_group(pid);
        }

        {
            let mut inner = self.inner.write().await;
            inner.state = NodeState::Stopped;
            inner.pid = None;
        }
        log::info!("node stopped");
        Ok(())
    }

    /// Stop (or reset from a failed state), settle, and start again with
    /// the most recently recorded arguments
    pub async fn restart(&self) -> VisorResult<()> {
        self.restart_internal(true).await
    }

    async fn restart_internal(&self, manual: bool) -> VisorResult<()> {
        if manual {
            self.inner.write().await.auto_restarts = 0;
        }

        if self.state().await == NodeState::Running {
            self.stop().await?;
        } else {
            let mut inner = self.inner.write().await;
            inner.state = NodeState::Stopped;
            inner.pid = None;
        }

        tokio::time::sleep(RESTART_SETTLE_DELAY).await;

        let args = self.inner.read().await.last_args.clone();
        self.start(&args).await?;

        self.inner.write().await.restart_count += 1;
        Ok(())
    }

    pub async fn state(&self) -> NodeState {
        self.inner.read().await.state
    }

    /// Child pid; 0 when no process is present
    pub async fn pid(&self) -> u32 {
        self.inner.read().await.pid.unwrap_or(0)
    }

    pub async fn restart_count(&self) -> u32 {
        self.inner.read().await.restart_count
    }

    pub async fn last_args(&self) -> Vec<String> {
        self.inner.read().await.last_args.clone()
    }

    /// Time since the current process entered `Running`; zero when the
    /// node is not active
    pub async fn uptime(&self) -> Duration {
        let inner = self.inner.read().await;
        if inner.state.is_active() {
            inner.started_at.map(|t| t.elapsed()).unwrap_or_default()
        } else {
            Duration::ZERO
        }
    }

    /// Running and, when a health monitor is attached, the latest record
    /// reports healthy
    pub async fn is_healthy(&self) -> bool {
        if self.state().await != NodeState::Running {
            return false;
        }
        match &self.health {
            Some(health) => health.latest().await.map(|h| h.healthy).unwrap_or(true),
            None => true,
        }
    }

    /// Best-effort version of the live binary, sampled at startup;
    /// `"unknown"` when the node is not running or no version flag yields
    /// output
    pub async fn version(&self) -> String {
        let inner = self.inner.read().await;
        if inner.state != NodeState::Running {
            return "unknown".to_string();
        }
        inner.version.clone()
    }

    /// Snapshot of the full status record
    pub async fn status(&self) -> NodeStatus {
        let snapshot = {
            let inner = self.inner.read().await;
            let uptime = if inner.state.is_active() {
                inner.started_at.map(|t| t.elapsed()).unwrap_or_default()
            } else {
                Duration::ZERO
            };
            NodeStatus {
                state: inner.state,
                state_string: inner.state.to_string(),
                pid: inner.pid.unwrap_or(0),
                start_time: inner.start_time,
                uptime_secs: uptime.as_secs(),
                restart_count: inner.restart_count,
                version: if inner.state == NodeState::Running {
                    inner.version.clone()
                } else {
                    "unknown".to_string()
                },
                network: self.config.network.clone(),
                binary_path: self.paths.current_bin(),
                health: None,
            }
        };

        let health = match &self.health {
            Some(health) => health.latest().await,
            None => None,
        };
        NodeStatus { health, ..snapshot }
    }

    /// Block until the node settles into `Stopped` or `Error` with no
    /// automatic restart pending
    pub async fn wait(&self) -> NodeState {
        loop {
            {
                let inner = self.inner.read().await;
                match inner.state {
                    NodeState::Error => return NodeState::Error,
                    NodeState::Stopped if !inner.restart_pending => return NodeState::Stopped,
                    _ => {}
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    fn spawn_child(&self, args: &[String]) -> VisorResult<Child> {
        let binary = self.paths.current_bin();
        let metadata =
            std::fs::metadata(&binary).map_err(|_| VisorError::BinaryMissing(binary.clone()))?;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(VisorError::NotExecutable(binary));
        }

        let mut cmd = Command::new(&binary);
        cmd.args(args)
            .env("WEMIX_HOME", self.paths.home())
            .env("WEMIX_NETWORK", &self.config.network)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .process_group(0);

        match &self.config.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let stdout = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                let stderr = stdout.try_clone()?;
                cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            }
            None => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VisorError::BinaryMissing(binary.clone()),
            _ => VisorError::Spawn(e.to_string()),
        })
    }

    /// Watches the tracked child for exit. Returns once the child is gone,
    /// whether taken by `stop()` or exited on its own.
    async fn monitor_child(&self) {
        loop {
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;

            let mut guard = self.child.lock().await;
            let Some(child) = guard.as_mut() else {
                // stop() claimed the child; nothing left to watch.
                return;
            };
            match child.try_wait() {
                Ok(None) => continue,
                Ok(Some(status)) => {
                    guard.take();
                    drop(guard);
                    self.handle_exit(Some(status)).await;
                    return;
                }
                Err(e) => {
                    log::error!("failed to poll node process: {}", e);
                    guard.take();
                    drop(guard);
                    self.handle_exit(None).await;
                    return;
                }
            }
        }
    }

    async fn handle_exit(&self, status: Option<ExitStatus>) {
        let (prev_state, pid, restart_allowed) = {
            let mut inner = self.inner.write().await;
            let prev = inner.state;
            if !matches!(prev, NodeState::Starting | NodeState::Running) {
                // Orderly shutdown; stop() owns the rest of the transition.
                return;
            }
            let pid = inner.pid.take().unwrap_or(0);
            inner.state = NodeState::Crashed;
            let allowed = self.config.restart_on_failure
                && inner.auto_restarts < self.config.max_restarts;
            if allowed {
                inner.auto_restarts += 1;
                inner.restart_pending = true;
            }
            (prev, pid, allowed)
        };

        match status {
            Some(status) => log::error!(
                "node exited unexpectedly while {}: {}",
                prev_state,
                status
            ),
            None => log::error!("node exited unexpectedly while {}", prev_state),
        }

        if let Some(health) = &self.health {
            health.stop().await;
        }
        if pid != 0 {
            reap_group(pid);
        }

        if restart_allowed {
            let manager = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CRASH_RESTART_DELAY).await;
                let attempt = manager.inner.read().await.auto_restarts;
                log::info!(
                    "automatic restart {}/{}",
                    attempt,
                    manager.config.max_restarts
                );
                if let Err(e) = manager.restart_internal(false).await {
                    log::error!("automatic restart failed: {}", e);
                }
                manager.inner.write().await.restart_pending = false;
            });
        } else {
            let mut inner = self.inner.write().await;
            if inner.state == NodeState::Crashed {
                inner.state = NodeState::Error;
            }
            log::error!("restart budget exhausted; manual intervention required");
        }
    }
}

/// Non-blocking sweep of any remaining zombies in the child's process group
fn reap_group(pgid: u32) {
    loop {
        match waitpid(
            Pid::from_raw(-(pgid as i32)),
            Some(WaitPidFlag::WNOHANG),
        ) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => log::debug!("reaped group member: {:?}", status),
            // ECHILD: nothing left in the group that belongs to us
            Err(_) => break,
        }
    }
}

/// Ask a binary for its version, trying the common flag spellings.
///
/// The first flag that exits successfully with non-empty output wins; each
/// attempt runs under a short deadline. Returns `"unknown"` when nothing
/// works.
pub async fn probe_binary_version(binary: &Path) -> String {
    for flag in ["version", "--version", "-version", "-v"] {
        let attempt = tokio::time::timeout(
            VERSION_TIMEOUT,
            tokio::process::Command::new(binary)
                .arg(flag)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        if let Ok(Ok(output)) = attempt {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if let Some(line) = stdout.lines().next() {
                    let line = line.trim();
                    if !line.is_empty() {
                        return line.to_string();
                    }
                }
            }
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VisorConfig;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_script(path: &Path, body: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "{}", body).unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }

    fn test_manager(home: &TempDir, script_body: &str) -> NodeManager {
        let mut config = VisorConfig::with_home(home.path());
        config.shutdown_grace_secs = 2;
        config.restart_on_failure = false;
        let config = Arc::new(config);

        let paths = config.paths();
        std::fs::create_dir_all(paths.genesis_dir().join("bin")).unwrap();
        write_script(&paths.genesis_bin(), script_body);
        std::os::unix::fs::symlink("genesis", paths.current_link()).unwrap();

        NodeManager::new(config)
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let home = TempDir::new().unwrap();
        let manager = test_manager(&home, "sleep 30");

        assert_eq!(manager.state().await, NodeState::Stopped);
        assert_eq!(manager.pid().await, 0);

        manager.start(&[]).await.unwrap();
        assert_eq!(manager.state().await, NodeState::Running);
        assert!(manager.pid().await > 0);

        manager.stop().await.unwrap();
        assert_eq!(manager.state().await, NodeState::Stopped);
        assert_eq!(manager.pid().await, 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let home = TempDir::new().unwrap();
        let manager = test_manager(&home, "sleep 30");

        manager.start(&[]).await.unwrap();
        let err = manager.start(&[]).await.unwrap_err();
        assert!(matches!(err, VisorError::InvalidState { .. }));

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_invalid_state() {
        let home = TempDir::new().unwrap();
        let manager = test_manager(&home, "sleep 30");

        let err = manager.stop().await.unwrap_err();
        assert!(matches!(
            err,
            VisorError::InvalidState {
                operation: "stop",
                state: NodeState::Stopped,
            }
        ));
        // A second failed stop must not disturb the state either.
        assert!(manager.stop().await.is_err());
        assert_eq!(manager.state().await, NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_binary_surfaces_error_state() {
        let home = TempDir::new().unwrap();
        let manager = test_manager(&home, "sleep 30");
        std::fs::remove_file(manager.paths().genesis_bin()).unwrap();

        let err = manager.start(&[]).await.unwrap_err();
        assert!(matches!(err, VisorError::BinaryMissing(_)));
        assert_eq!(manager.state().await, NodeState::Error);
        assert_eq!(manager.pid().await, 0);
    }

    #[tokio::test]
    async fn test_non_executable_binary_rejected() {
        let home = TempDir::new().unwrap();
        let manager = test_manager(&home, "sleep 30");
        let bin = manager.paths().genesis_bin();
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&bin, perms).unwrap();

        let err = manager.start(&[]).await.unwrap_err();
        assert!(matches!(err, VisorError::NotExecutable(_)));
        assert_eq!(manager.state().await, NodeState::Error);
    }

    #[tokio::test]
    async fn test_restart_resets_failed_state() {
        let home = TempDir::new().unwrap();
        let manager = test_manager(&home, "sleep 30");
        std::fs::remove_file(manager.paths().genesis_bin()).unwrap();

        assert!(manager.start(&[]).await.is_err());
        assert_eq!(manager.state().await, NodeState::Error);

        write_script(&manager.paths().genesis_bin(), "sleep 30");
        manager.restart().await.unwrap();
        assert_eq!(manager.state().await, NodeState::Running);
        assert_eq!(manager.restart_count().await, 1);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_snapshot_fields() {
        let home = TempDir::new().unwrap();
        let manager = test_manager(&home, "sleep 30");

        manager.start(&["--syncmode".to_string(), "full".to_string()]).await.unwrap();
        let status = manager.status().await;
        assert_eq!(status.state, NodeState::Running);
        assert_eq!(status.state_string, "running");
        assert!(status.pid > 0);
        assert!(status.start_time.is_some());
        assert_eq!(status.restart_count, 0);
        assert_eq!(
            manager.last_args().await,
            vec!["--syncmode".to_string(), "full".to_string()]
        );

        manager.stop().await.unwrap();
        let status = manager.status().await;
        assert_eq!(status.pid, 0);
        assert_eq!(status.version, "unknown");
    }

    #[tokio::test]
    async fn test_is_healthy_requires_running() {
        let home = TempDir::new().unwrap();
        let manager = test_manager(&home, "sleep 30");

        assert!(!manager.is_healthy().await);
        manager.start(&[]).await.unwrap();
        // No monitor attached: a running node counts as healthy.
        assert!(manager.is_healthy().await);
        manager.stop().await.unwrap();
        assert!(!manager.is_healthy().await);
    }

    #[tokio::test]
    async fn test_probe_binary_version() {
        let home = TempDir::new().unwrap();
        let bin = home.path().join("vbin");
        write_script(&bin, r#"echo "wemixd v0.10.5-stable""#);
        assert_eq!(probe_binary_version(&bin).await, "wemixd v0.10.5-stable");

        let silent = home.path().join("silent");
        write_script(&silent, "exit 1");
        assert_eq!(probe_binary_version(&silent).await, "unknown");
    }
}
