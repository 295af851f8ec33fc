//! Chain height monitoring
//!
//! Periodically reads the live chain head over RPC and fans the height out
//! to subscribers. Poll failures are logged and produce no update; slow
//! subscribers may miss intermediate heights (latest wins).

use crate::rpc::RpcClient;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Default interval between `eth_blockNumber` polls
pub const DEFAULT_HEIGHT_INTERVAL: Duration = Duration::from_secs(5);

/// Capacity of the fan-out channel; laggards drop old heights
const CHANNEL_CAPACITY: usize = 16;

/// Periodic chain-head poller with broadcast fan-out
pub struct HeightMonitor {
    rpc: RpcClient,
    interval: Duration,
    tx: broadcast::Sender<u64>,
    last_height: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeightMonitor {
    pub fn new(rpc: RpcClient, interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            rpc,
            interval,
            tx,
            last_height: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Obtain a receive-only subscription to height updates
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.tx.subscribe()
    }

    /// Most recently observed height; 0 before the first successful poll
    pub fn last_height(&self) -> u64 {
        self.last_height.load(Ordering::SeqCst)
    }

    /// Publish a height to subscribers directly.
    ///
    /// Used by the poll task, and by tests that drive the orchestrator
    /// without a live RPC endpoint.
    pub fn publish(&self, height: u64) {
        self.last_height.store(height, Ordering::SeqCst);
        // No receivers is fine; the next subscriber starts fresh.
        let _ = self.tx.send(height);
    }

    /// Begin polling; idempotent
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let rpc = self.rpc.clone();
        let tx = self.tx.clone();
        let last_height = self.last_height.clone();
        let running = self.running.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match rpc.block_number().await {
                    Ok(height) => {
                        last_height.store(height, Ordering::SeqCst);
                        let _ = tx.send(height);
                        log::debug!("chain height {}", height);
                    }
                    Err(e) => {
                        log::warn!("height poll failed: {}", e);
                    }
                }

                let mut remaining = interval;
                while running.load(Ordering::SeqCst) && remaining > Duration::ZERO {
                    let step = remaining.min(Duration::from_millis(100));
                    tokio::time::sleep(step).await;
                    remaining = remaining.saturating_sub(step);
                }
            }
            log::debug!("height monitor task exiting");
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// Halt polling and wait for the task to exit; idempotent
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
}
