//! Command-line interface for wemixvisor
//!
//! This module provides the CLI commands for running the supervisor,
//! initializing the home layout, and inspecting state. Parsing stays here;
//! the core components never touch argv.

use crate::config::VisorConfig;
use crate::core::error::{VisorError, VisorResult};
use crate::core::height::HeightMonitor;
use crate::core::process::{probe_binary_version, NodeManager};
use crate::core::signals::SignalHandler;
use crate::core::symlink::SymlinkSwitcher;
use crate::core::types::NodeState;
use crate::core::upgrade::UpgradeManager;
use crate::core::watcher::UpgradeWatcher;
use crate::monitoring::health::HealthMonitor;
use crate::monitoring::probes::standard_probes;
use crate::rpc::RpcClient;
use clap::{Parser, Subcommand};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "wemixvisor")]
#[command(about = "Lifecycle supervisor for the wemixd node")]
#[command(version)]
pub struct VisorCli {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Node home directory (overrides config file and DAEMON_HOME)
    #[arg(long)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node under supervision
    Run {
        /// Arguments passed through to the node binary
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Create the supervisor directory layout under the home
    Init,
    /// Print the node and upgrade status as JSON
    Status,
    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "wemixvisor.toml")]
        config: PathBuf,
    },
    /// Print supervisor and node binary versions
    Version,
}

impl VisorCli {
    pub async fn run(self) -> VisorResult<()> {
        let config = self.resolve_config()?;

        match self.command {
            Commands::Run { ref args } => handle_run(config, args.clone()).await,
            Commands::Init => handle_init(config),
            Commands::Status => handle_status(config).await,
            Commands::Validate { ref config } => handle_validate(config.clone()),
            Commands::Version => handle_version(config).await,
        }
    }

    fn resolve_config(&self) -> VisorResult<Arc<VisorConfig>> {
        let mut config = match &self.config {
            Some(path) => VisorConfig::load_from_file(path)?,
            None => VisorConfig::with_home("."),
        };
        config.apply_env_overrides();
        if let Some(home) = &self.home {
            config.home = home.clone();
        }
        config.validate()?;
        Ok(Arc::new(config))
    }
}

async fn handle_run(config: Arc<VisorConfig>, args: Vec<String>) -> VisorResult<()> {
    let paths = config.paths();
    let rpc = RpcClient::new(config.rpc_port);

    let health = Arc::new(HealthMonitor::new(
        standard_probes(
            rpc.clone(),
            paths.data_dir(),
            config.min_peers,
            config.min_disk_gib,
            config.pid_file.clone(),
        ),
        config.health_interval(),
    ));
    let manager = NodeManager::new(config.clone()).with_health_monitor(health);
    let heights = Arc::new(HeightMonitor::new(rpc, config.height_poll_interval()));
    let orchestrator = UpgradeManager::new(config.clone(), manager.clone(), heights.clone());

    let signals = SignalHandler::new();
    signals.start_monitoring();

    manager.start(&args).await?;
    heights.start();
    orchestrator.start()?;

    log::info!(
        "supervising {} (network {}, home {})",
        config.daemon_name,
        config.network,
        config.home.display()
    );

    let exit_result = loop {
        tokio::select! {
            state = manager.wait() => {
                if state == NodeState::Error {
                    break Err(VisorError::Internal(
                        "node entered error state and will not be restarted".to_string(),
                    ));
                }
                // Stopped: either the transient window inside an upgrade
                // transition, or a stop outside the supervisor's control.
                if orchestrator.status().await.upgrading {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                log::info!("node stopped; exiting");
                break Ok(());
            }
            _ = signals.wait_for_shutdown() => {
                log::info!("shutting down");
                break Ok(());
            }
        }
    };

    orchestrator.stop().await;
    heights.stop().await;
    if manager.state().await == NodeState::Running {
        manager.stop().await?;
    }
    exit_result
}

fn handle_init(config: Arc<VisorConfig>) -> VisorResult<()> {
    let paths = config.paths();

    let current = paths.current_link();
    if current.symlink_metadata().is_ok() {
        return Err(VisorError::Config(format!(
            "{} already exists; home appears initialized",
            current.display()
        )));
    }

    for dir in [
        paths.genesis_dir().join("bin"),
        paths.upgrades_dir(),
        paths.data_dir(),
        paths.logs_dir(),
    ] {
        std::fs::create_dir_all(&dir)?;
    }

    let genesis_bin = paths.genesis_bin();
    let metadata = std::fs::metadata(&genesis_bin)
        .map_err(|_| VisorError::BinaryMissing(genesis_bin.clone()))?;
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(VisorError::NotExecutable(genesis_bin));
    }

    SymlinkSwitcher::new(paths.clone()).link_to_genesis()?;

    println!("initialized {}", paths.root().display());
    println!("  genesis binary: {}", genesis_bin.display());
    println!("  current -> genesis");
    Ok(())
}

async fn handle_status(config: Arc<VisorConfig>) -> VisorResult<()> {
    let paths = config.paths();
    let switcher = SymlinkSwitcher::new(paths.clone());

    let current_target = switcher
        .current_target()
        .map(|t| t.display().to_string())
        .unwrap_or_else(|_| "unset".to_string());

    let watcher = UpgradeWatcher::new(paths.upgrade_info_file());
    watcher.poll()?;

    let binary = paths.current_bin();
    let version = if binary.exists() {
        probe_binary_version(&binary).await
    } else {
        "unknown".to_string()
    };

    let status = serde_json::json!({
        "home": paths.home(),
        "network": config.network,
        "binary_path": binary,
        "current": current_target,
        "version": version,
        "pending_plan": watcher.current_plan(),
    });
    let rendered = serde_json::to_string_pretty(&status)
        .map_err(|e| VisorError::Internal(e.to_string()))?;
    println!("{}", rendered);
    Ok(())
}

fn handle_validate(path: PathBuf) -> VisorResult<()> {
    let config = VisorConfig::load_from_file(&path)?;
    config.validate()?;

    println!("configuration OK: {}", path.display());
    println!("  home: {}", config.home.display());
    println!("  daemon: {}", config.daemon_name);
    println!("  network: {}", config.network);
    println!("  rpc port: {}", config.rpc_port);
    println!(
        "  restart on failure: {} (max {})",
        config.restart_on_failure, config.max_restarts
    );
    Ok(())
}

async fn handle_version(config: Arc<VisorConfig>) -> VisorResult<()> {
    println!("wemixvisor {}", env!("CARGO_PKG_VERSION"));

    let binary = config.paths().current_bin();
    if binary.exists() {
        println!("{}: {}", config.daemon_name, probe_binary_version(&binary).await);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_parsing() {
        let cli = VisorCli::try_parse_from(["wemixvisor", "run", "--", "--syncmode", "full"])
            .unwrap();
        match cli.command {
            Commands::Run { args } => {
                assert_eq!(args, vec!["--syncmode".to_string(), "full".to_string()]);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_home_flag_parsing() {
        let cli =
            VisorCli::try_parse_from(["wemixvisor", "--home", "/var/lib/wemixd", "init"]).unwrap();
        assert_eq!(cli.home, Some(PathBuf::from("/var/lib/wemixd")));
        assert!(matches!(cli.command, Commands::Init));
    }

    #[test]
    fn test_validate_command_default_path() {
        let cli = VisorCli::try_parse_from(["wemixvisor", "validate"]).unwrap();
        match cli.command {
            Commands::Validate { config } => {
                assert_eq!(config, PathBuf::from("wemixvisor.toml"));
            }
            _ => panic!("expected validate command"),
        }
    }
}
