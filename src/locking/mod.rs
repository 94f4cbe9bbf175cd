pub mod lock_manager;
pub mod wound;

use serde::{Deserialize, Serialize};

pub use lock_manager::{LockHolder, LockManager, DEFAULT_LOCK_WAIT};
pub use wound::{WoundListener, WoundRegistry};

/// Lock modes. Any number of `Shared` holders may coexist; an `Exclusive`
/// holder excludes everyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockType {
    Shared,
    Exclusive,
}

impl LockType {
    /// Whether a request of this type conflicts with a holder of `other`.
    pub fn conflicts_with(self, other: LockType) -> bool {
        self == LockType::Exclusive || other == LockType::Exclusive
    }
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockType::Shared => write!(f, "SHARED"),
            LockType::Exclusive => write!(f, "EXCLUSIVE"),
        }
    }
}
