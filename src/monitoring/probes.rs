//! Individual health probes
//!
//! A probe is anything with a name and an async check that either succeeds
//! (optionally with details) or fails with a reason. The monitor runs every
//! probe independently and aggregates the outcomes.

use crate::core::error::VisorResult;
use crate::rpc::{RpcClient, SyncStatus};
use async_trait::async_trait;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::PathBuf;

/// A single health check with a name and a pass/fail outcome
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(details)` when healthy, `Err(reason)` otherwise
    async fn check(&self) -> Result<Option<String>, String>;
}

/// Verifies the process named by a pidfile is alive (signal 0).
///
/// With no pidfile configured the probe trivially succeeds; the manager's
/// own state machine already tracks the child it spawned.
pub struct ProcessProbe {
    pidfile: Option<PathBuf>,
}

impl ProcessProbe {
    pub fn new(pidfile: Option<PathBuf>) -> Self {
        Self { pidfile }
    }
}

#[async_trait]
impl HealthProbe for ProcessProbe {
    fn name(&self) -> &str {
        "process"
    }

    async fn check(&self) -> Result<Option<String>, String> {
        let Some(ref pidfile) = self.pidfile else {
            return Ok(None);
        };

        let contents = std::fs::read_to_string(pidfile)
            .map_err(|e| format!("failed to read pidfile {}: {}", pidfile.display(), e))?;
        let pid: i32 = contents
            .trim()
            .parse()
            .map_err(|e| format!("invalid pid in {}: {}", pidfile.display(), e))?;

        kill(Pid::from_raw(pid), None)
            .map_err(|e| format!("process {} not reachable: {}", pid, e))?;
        Ok(Some(format!("pid {}", pid)))
    }
}

/// RPC liveness via `web3_clientVersion`
pub struct RpcLivenessProbe {
    rpc: RpcClient,
}

impl RpcLivenessProbe {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl HealthProbe for RpcLivenessProbe {
    fn name(&self) -> &str {
        "rpc"
    }

    async fn check(&self) -> Result<Option<String>, String> {
        let version = self
            .rpc
            .client_version()
            .await
            .map_err(|e| e.to_string())?;
        Ok(Some(version))
    }
}

/// Connected peers via `net_peerCount` against a configured minimum
pub struct PeerCountProbe {
    rpc: RpcClient,
    min_peers: u64,
}

impl PeerCountProbe {
    pub fn new(rpc: RpcClient, min_peers: u64) -> Self {
        Self { rpc, min_peers }
    }
}

#[async_trait]
impl HealthProbe for PeerCountProbe {
    fn name(&self) -> &str {
        "peers"
    }

    async fn check(&self) -> Result<Option<String>, String> {
        let peers = self.rpc.peer_count().await.map_err(|e| e.to_string())?;
        if peers < self.min_peers {
            return Err(format!("{} peers < minimum {}", peers, self.min_peers));
        }
        Ok(Some(format!("{} peers", peers)))
    }
}

/// Sync status via `eth_syncing`; healthy only once fully synced
pub struct SyncProbe {
    rpc: RpcClient,
}

impl SyncProbe {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl HealthProbe for SyncProbe {
    fn name(&self) -> &str {
        "sync"
    }

    async fn check(&self) -> Result<Option<String>, String> {
        match self.rpc.syncing().await.map_err(|e| e.to_string())? {
            SyncStatus::Synced => Ok(Some("synced".to_string())),
            SyncStatus::Syncing { current, highest } => Err(format!(
                "syncing: currentBlock {} / highestBlock {}",
                current, highest
            )),
        }
    }
}

/// Free space on the data directory's filesystem against a GiB threshold
pub struct DiskSpaceProbe {
    data_dir: PathBuf,
    min_free_gib: u64,
}

impl DiskSpaceProbe {
    pub fn new(data_dir: PathBuf, min_free_gib: u64) -> Self {
        Self {
            data_dir,
            min_free_gib,
        }
    }

    fn available_gib(&self) -> VisorResult<u64> {
        let stat = nix::sys::statvfs::statvfs(&self.data_dir)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(available / (1024 * 1024 * 1024))
    }
}

#[async_trait]
impl HealthProbe for DiskSpaceProbe {
    fn name(&self) -> &str {
        "disk"
    }

    async fn check(&self) -> Result<Option<String>, String> {
        let available = self.available_gib().map_err(|e| {
            format!("statvfs failed for {}: {}", self.data_dir.display(), e)
        })?;
        if available < self.min_free_gib {
            return Err(format!(
                "{} GiB free < minimum {} GiB",
                available, self.min_free_gib
            ));
        }
        Ok(Some(format!("{} GiB free", available)))
    }
}

/// The standard probe set the supervisor runs against a node
pub fn standard_probes(
    rpc: RpcClient,
    data_dir: PathBuf,
    min_peers: u64,
    min_disk_gib: u64,
    pidfile: Option<PathBuf>,
) -> Vec<Box<dyn HealthProbe>> {
    vec![
        Box::new(ProcessProbe::new(pidfile)),
        Box::new(RpcLivenessProbe::new(rpc.clone())),
        Box::new(PeerCountProbe::new(rpc.clone(), min_peers)),
        Box::new(SyncProbe::new(rpc)),
        Box::new(DiskSpaceProbe::new(data_dir, min_disk_gib)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_process_probe_without_pidfile_succeeds() {
        let probe = ProcessProbe::new(None);
        assert_eq!(probe.check().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_process_probe_own_pid() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("node.pid");
        let mut f = std::fs::File::create(&pidfile).unwrap();
        writeln!(f, "{}", std::process::id()).unwrap();

        let probe = ProcessProbe::new(Some(pidfile));
        let details = probe.check().await.unwrap();
        assert!(details.unwrap().starts_with("pid "));
    }

    #[tokio::test]
    async fn test_process_probe_garbage_pidfile() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("node.pid");
        std::fs::write(&pidfile, "not-a-pid").unwrap();

        let probe = ProcessProbe::new(Some(pidfile));
        let reason = probe.check().await.unwrap_err();
        assert!(reason.contains("invalid pid"));
    }

    #[tokio::test]
    async fn test_process_probe_missing_pidfile() {
        let probe = ProcessProbe::new(Some(PathBuf::from("/nonexistent/node.pid")));
        let reason = probe.check().await.unwrap_err();
        assert!(reason.contains("failed to read pidfile"));
    }

    #[tokio::test]
    async fn test_disk_probe_thresholds() {
        let dir = TempDir::new().unwrap();

        let probe = DiskSpaceProbe::new(dir.path().to_path_buf(), 0);
        assert!(probe.check().await.is_ok());

        let probe = DiskSpaceProbe::new(dir.path().to_path_buf(), u64::MAX);
        let reason = probe.check().await.unwrap_err();
        assert!(reason.contains("GiB free < minimum"));
    }

    #[tokio::test]
    async fn test_rpc_probe_reports_transport_failure() {
        let probe = RpcLivenessProbe::new(RpcClient::with_endpoint("http://127.0.0.1:1"));
        let reason = probe.check().await.unwrap_err();
        assert!(reason.contains("web3_clientVersion"));
    }
}
