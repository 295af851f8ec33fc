//! Periodic health monitoring
//!
//! Runs every configured probe on a timer, aggregates the outcomes into a
//! single [`HealthStatus`], caches the latest record, and offers it to a
//! capacity-1 subscriber channel (non-blocking send, latest wins).

use crate::core::types::{CheckResult, HealthStatus};
use crate::monitoring::probes::HealthProbe;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Default interval between probe rounds
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline applied independently to each probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodic probe runner with a cached latest status
pub struct HealthMonitor {
    probes: Arc<Vec<Box<dyn HealthProbe>>>,
    interval: Duration,
    status: Arc<RwLock<Option<HealthStatus>>>,
    tx: mpsc::Sender<HealthStatus>,
    rx: Mutex<Option<mpsc::Receiver<HealthStatus>>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(probes: Vec<Box<dyn HealthProbe>>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            probes: Arc::new(probes),
            interval,
            status: Arc::new(RwLock::new(None)),
            tx,
            rx: Mutex::new(Some(rx)),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Begin periodic checking; idempotent
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let probes = self.probes.clone();
        let status = self.status.clone();
        let tx = self.tx.clone();
        let running = self.running.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let record = run_probes(&probes).await;
                *status.write().await = Some(record.clone());
                // Capacity 1: if the subscriber is behind, the stale record
                // it has not consumed yet is simply not replaced.
                let _ = tx.try_send(record);

                let mut remaining = interval;
                while running.load(Ordering::SeqCst) && remaining > Duration::ZERO {
                    let step = remaining.min(Duration::from_millis(100));
                    tokio::time::sleep(step).await;
                    remaining = remaining.saturating_sub(step);
                }
            }
            log::debug!("health monitor task exiting");
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// Halt periodic checking and wait for the task to exit; idempotent
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run one probe round immediately, bypassing the timer
    pub async fn check_now(&self) -> HealthStatus {
        let record = run_probes(&self.probes).await;
        *self.status.write().await = Some(record.clone());
        let _ = self.tx.try_send(record.clone());
        record
    }

    /// Latest aggregated record, if a round has completed
    pub async fn latest(&self) -> Option<HealthStatus> {
        self.status.read().await.clone()
    }

    /// Take the subscriber end of the status channel; the first caller wins
    pub fn take_subscriber(&self) -> Option<mpsc::Receiver<HealthStatus>> {
        self.rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

async fn run_probes(probes: &[Box<dyn HealthProbe>]) -> HealthStatus {
    let checks: Vec<CheckResult> = join_all(probes.iter().map(|probe| async {
        let name = probe.name().to_string();
        match tokio::time::timeout(PROBE_TIMEOUT, probe.check()).await {
            Ok(Ok(details)) => CheckResult::ok(name, details),
            Ok(Err(reason)) => CheckResult::failed(name, reason),
            Err(_) => CheckResult::failed(
                name,
                format!("probe timed out after {}s", PROBE_TIMEOUT.as_secs()),
            ),
        }
    }))
    .await;

    let status = HealthStatus::from_checks(checks);
    if !status.healthy {
        let failing: Vec<&str> = status
            .checks
            .values()
            .filter(|c| !c.healthy)
            .map(|c| c.name.as_str())
            .collect();
        log::warn!("health check failed: {}", failing.join(", "));
    }
    status
}
