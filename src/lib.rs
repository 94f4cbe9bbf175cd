pub mod actions;
pub mod distributed;
pub mod errors;
pub mod locking;
pub mod node;
pub mod transaction;
pub mod twopc;
pub mod wal;

// Re-export key types and structs for easier access
pub use actions::{ActionError, ActionHandler, ActionRegistry};
pub use distributed::coordinator::{Coordinator, CoordinatorState, TransactionOutcome};
pub use distributed::dist_config::{FragmentRole, NodeConfig, PeerConfig};
pub use distributed::network::{InProcessNetwork, PeerClient, Transport};
pub use distributed::participant::Participant;
pub use distributed::recovery::{RecoveryManager, RecoveryReport};
pub use errors::{FragError, Result};
pub use locking::{LockManager, LockType};
pub use node::{prelude, Node};
pub use transaction::{Transaction, TransactionPayload};
pub use twopc::TwoPhaseCommitParticipant;
pub use wal::{WalStatus, WriteAheadLog};
