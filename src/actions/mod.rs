pub mod titles;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::locking::LockType;
use crate::transaction::TransactionPayload;

/// Errors reported by an action's `validate` or `execute`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Validation refused the payload.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The record the action addresses does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The effect is already present (duplicate key). Redo treats this as success.
    #[error("Already applied: {0}")]
    AlreadyApplied(String),

    /// The storage engine failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ActionError {
    /// Whether a redo that failed with this error can be treated as applied.
    pub fn is_already_applied(&self) -> bool {
        matches!(self, ActionError::AlreadyApplied(_))
    }
}

/// The storage-facing half of an operation type.
///
/// The transaction machinery never looks past this contract: it takes the
/// declared lock, calls `validate` during PREPARE and `execute` during
/// COMMIT (and again during recovery redo, so `execute` must tolerate
/// being replayed).
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use fragstore::prelude::*;
///
/// struct Ping;
///
/// #[async_trait]
/// impl ActionHandler for Ping {
///     fn lock_type(&self) -> LockType {
///         LockType::Shared
///     }
///
///     async fn validate(&self, _payload: &TransactionPayload) -> Result<(), ActionError> {
///         Ok(())
///     }
///
///     async fn execute(
///         &self,
///         _payload: &TransactionPayload,
///     ) -> Result<Option<serde_json::Value>, ActionError> {
///         Ok(Some(serde_json::json!("pong")))
///     }
/// }
/// ```
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// The lock mode the participant must hold while the action is in flight.
    fn lock_type(&self) -> LockType;

    /// Checks that the action can be applied. Runs with the lock held.
    async fn validate(&self, payload: &TransactionPayload) -> Result<(), ActionError>;

    /// Applies the action and returns the data produced, if any.
    async fn execute(
        &self,
        payload: &TransactionPayload,
    ) -> Result<Option<serde_json::Value>, ActionError>;
}

/// Maps action names to their handlers.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}
