use std::time::Duration;

use thiserror::Error;

use crate::actions::ActionError;

/// Failures raised by the lock manager while a transaction waits for a resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Transaction {transaction_id} aborted by wound-wait")]
    Wounded { transaction_id: String },

    #[error("Timed out after {waited:?} waiting for lock on {resource_id}")]
    Timeout { resource_id: String, waited: Duration },

    #[error("Lock request of transaction {transaction_id} was withdrawn")]
    Cancelled { transaction_id: String },
}

/// Failures of the write-ahead log. All of them are fatal to the operation
/// that attempted the append or the scan.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt WAL line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("WAL field {field} cannot hold value {value:?}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum FragError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Write-ahead log error: {0}")]
    Wal(#[from] WalError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Transport error talking to {peer}: {reason}")]
    Transport { peer: String, reason: String },

    #[error("Shard key {0:?} is not owned by any node")]
    NoParticipants(Option<i64>),

    #[error("Node {0} has crashed")]
    NodeCrashed(String),

    #[error("Recovery of transaction {transaction_id} failed: {reason}")]
    RecoveryFailed {
        transaction_id: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FragError {
    /// Builds a transport failure for `peer`.
    pub fn transport(peer: impl Into<String>, reason: impl ToString) -> Self {
        FragError::Transport {
            peer: peer.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = FragError> = std::result::Result<T, E>;
