//! Core error types for wemixvisor
//!
//! This module provides the centralized error type used throughout the
//! supervisor, covering process lifecycle, upgrade, RPC, and configuration
//! failures.

use crate::core::types::NodeState;
use std::path::PathBuf;

/// The main error type for wemixvisor operations
#[derive(Debug, thiserror::Error)]
pub enum VisorError {
    /// Operation requested in a state that disallows it
    #[error("invalid state for {operation}: node is {state}")]
    InvalidState {
        operation: &'static str,
        state: NodeState,
    },

    /// Target binary does not exist
    #[error("binary not found: {0}")]
    BinaryMissing(PathBuf),

    /// Target binary exists but is not executable
    #[error("binary is not executable: {0}")]
    NotExecutable(PathBuf),

    /// The OS refused to spawn the child process
    #[error("failed to spawn node process: {0}")]
    Spawn(String),

    /// Transport or protocol error against the node's RPC endpoint
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Upgrade plan file could not be parsed
    #[error("failed to parse upgrade plan: {0}")]
    PlanParse(#[from] serde_json::Error),

    /// Upgrade plan failed validation
    #[error("invalid upgrade plan: {0}")]
    PlanInvalid(String),

    /// Symlink manipulation failed
    #[error("binary switch failed: {0}")]
    SwitchFailed(String),

    /// Rollback after a failed upgrade also failed; the node is left
    /// stopped and requires operator intervention
    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    /// Reentrant upgrade attempt while another is in flight
    #[error("an upgrade is already in progress")]
    UpgradeInProgress,

    /// Component start() invoked more than once
    #[error("component already started")]
    AlreadyStarted,

    /// Configuration loading or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal supervisor errors
    #[error("internal error: {0}")]
    Internal(String),

    /// IO related errors (file operations, symlinks, etc.)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for wemixvisor operations
pub type VisorResult<T> = Result<T, VisorError>;
