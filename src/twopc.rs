use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::transaction::TransactionPayload;
use crate::wal::TransactionRecord;

/// Phase 1 request: `{transactionId, timestamp, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareRequest {
    pub transaction_id: String,
    pub timestamp: u64,
    pub data: TransactionPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    Yes,
    No,
}

/// A participant's vote, with the reason when it is NO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub vote: Vote,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PrepareResponse {
    pub fn yes() -> Self {
        Self {
            vote: Vote::Yes,
            error: None,
        }
    }

    pub fn no(reason: impl Into<String>) -> Self {
        Self {
            vote: Vote::No,
            error: Some(reason.into()),
        }
    }

    pub fn is_yes(&self) -> bool {
        self.vote == Vote::Yes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub transaction_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitStatus {
    Committed,
    CommittedAlready,
    Error,
}

/// Phase 2 acknowledgement. `data` is set only by the node that produced a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitResponse {
    pub status: CommitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommitResponse {
    pub fn committed(data: Option<Value>) -> Self {
        Self {
            status: CommitStatus::Committed,
            data,
            error: None,
        }
    }

    pub fn committed_already() -> Self {
        Self {
            status: CommitStatus::CommittedAlready,
            data: None,
            error: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: CommitStatus::Error,
            data: None,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub transaction_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbortStatus {
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortResponse {
    pub status: AbortStatus,
}

/// The decision a node's log records for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionStatus {
    Commit,
    Abort,
    Unknown,
}

/// Answer to the termination protocol's status lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: DecisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<TransactionRecord>,
}

/// Trait for a participant in the two-phase commit protocol.
///
/// Every node implements it for its local state, and every peer client
/// implements it to reach a remote node, so the coordinator addresses its
/// own participant and remote ones through the same interface.
///
/// An `Err` from any method means the call itself failed (transport, WAL,
/// crashed node). Protocol-level refusals travel inside the response: a NO
/// vote, or a commit answered with [`CommitStatus::Error`].
#[async_trait]
pub trait TwoPhaseCommitParticipant: Send + Sync {
    /// Phase 1: lock, log READY, validate, and vote.
    async fn prepare(&self, request: PrepareRequest) -> Result<PrepareResponse>;

    /// Phase 2: apply the prepared transaction. Idempotent.
    async fn commit(&self, request: CommitRequest) -> Result<CommitResponse>;

    /// Phase 2: discard the prepared transaction. Idempotent.
    async fn abort(&self, request: AbortRequest) -> Result<AbortResponse>;

    /// Reports what this node's log decided for `transaction_id`.
    async fn check_status(&self, transaction_id: &str) -> Result<StatusResponse>;
}
