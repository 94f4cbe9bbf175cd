use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::actions::{ActionHandler, ActionRegistry};
use crate::distributed::dist_config::NodeConfig;
use crate::distributed::fault::{CrashPoint, FaultInjector};
use crate::distributed::history::CommittedHistory;
use crate::errors::{LockError, Result};
use crate::locking::LockManager;
use crate::transaction::TransactionPayload;
use crate::twopc::{
    AbortRequest, AbortResponse, AbortStatus, CommitRequest, CommitResponse, DecisionStatus,
    PrepareRequest, PrepareResponse, StatusResponse, TwoPhaseCommitParticipant,
};
use crate::wal::{WalStatus, WriteAheadLog};

/// A transaction that voted YES and awaits the decision.
struct PendingTransaction {
    handler: Arc<dyn ActionHandler>,
    payload: TransactionPayload,
    resource_id: String,
    timestamp: u64,
    prepared_at: Instant,
}

/// The participant half of two-phase commit for one node.
///
/// Owns the node's lock table, pending-transaction table and committed
/// history. The coordinator of the same node calls it directly; peers
/// reach it through the transport.
pub struct Participant {
    address: String,
    registry: ActionRegistry,
    locks: Arc<LockManager>,
    wal: Arc<WriteAheadLog>,
    history: Arc<CommittedHistory>,
    faults: Arc<FaultInjector>,
    pending: Mutex<HashMap<String, PendingTransaction>>,
    pending_timeout: Duration,
}

impl Participant {
    pub fn new(
        config: &NodeConfig,
        registry: ActionRegistry,
        wal: Arc<WriteAheadLog>,
        history: Arc<CommittedHistory>,
        faults: Arc<FaultInjector>,
    ) -> Self {
        Self {
            address: config.address.clone(),
            registry,
            locks: Arc::new(LockManager::new(config.lock_timeout())),
            wal,
            history,
            faults,
            pending: Mutex::new(HashMap::new()),
            pending_timeout: config.pending_timeout(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn history(&self) -> &Arc<CommittedHistory> {
        &self.history
    }

    pub fn is_pending(&self, transaction_id: &str) -> bool {
        self.pending.lock().contains_key(transaction_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Phase 1. Takes the action's lock, logs READY, validates, and votes.
    ///
    /// Lock denial, validation failure and a wound while validating all
    /// produce a NO vote carrying the reason. `Err` is reserved for WAL
    /// failures and crashed nodes.
    pub async fn handle_prepare(&self, request: PrepareRequest) -> Result<PrepareResponse> {
        self.faults.on_rpc().await?;
        let PrepareRequest {
            transaction_id,
            timestamp,
            data: payload,
        } = request;

        if self.history.contains(&transaction_id) || self.is_pending(&transaction_id) {
            debug!("Duplicate prepare for {}, voting YES", transaction_id);
            return Ok(PrepareResponse::yes());
        }

        let Some(handler) = self.registry.get(&payload.action) else {
            warn!(
                "Voting NO on {}: unknown action {}",
                transaction_id, payload.action
            );
            return Ok(PrepareResponse::no(format!(
                "Unknown action: {}",
                payload.action
            )));
        };

        let resource_id = payload.resource_id();
        let listener = self.locks.wounds().subscribe(&transaction_id);
        let acquired = tokio::select! {
            biased;
            _ = listener.wounded() => Err(LockError::Wounded {
                transaction_id: transaction_id.clone(),
            }),
            result = self.locks.acquire(&resource_id, &transaction_id, handler.lock_type(), timestamp) => result,
        };
        if let Err(e) = acquired {
            warn!("Voting NO on {}: {}", transaction_id, e);
            return Ok(PrepareResponse::no(e.to_string()));
        }

        let payload_json = serde_json::to_value(&payload)?;
        if let Err(e) =
            self.wal
                .write_log(&transaction_id, &payload.action, WalStatus::Ready, &payload_json)
        {
            self.locks.release(&resource_id, &transaction_id);
            return Err(e.into());
        }
        self.faults.hit(CrashPoint::ParticipantAfterReady)?;

        let checked = async {
            if let Some(delay_ms) = payload.delay_ms {
                debug!("Holding {} for {}ms before validating", resource_id, delay_ms);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            handler.validate(&payload).await
        };
        let verdict = tokio::select! {
            biased;
            _ = listener.wounded() => None,
            result = checked => Some(result),
        };

        let reason = match verdict {
            Some(Ok(())) => {
                self.pending.lock().insert(
                    transaction_id.clone(),
                    PendingTransaction {
                        handler,
                        payload,
                        resource_id,
                        timestamp,
                        prepared_at: Instant::now(),
                    },
                );
                info!("Prepared {} on {}, voting YES", transaction_id, self.address);
                return Ok(PrepareResponse::yes());
            }
            Some(Err(e)) => e.to_string(),
            None => LockError::Wounded {
                transaction_id: transaction_id.clone(),
            }
            .to_string(),
        };

        warn!("Voting NO on {}: {}", transaction_id, reason);
        self.wal
            .write_log(&transaction_id, &payload.action, WalStatus::Abort, &payload_json)?;
        self.locks.release(&resource_id, &transaction_id);
        Ok(PrepareResponse::no(reason))
    }

    /// Phase 2 commit. Idempotent: a repeated commit answers
    /// `COMMITTED_ALREADY` without executing again.
    pub async fn handle_commit(&self, request: CommitRequest) -> Result<CommitResponse> {
        self.faults.on_rpc().await?;
        self.faults.hit(CrashPoint::ParticipantBeforeCommit)?;
        let transaction_id = request.transaction_id;

        let pending = {
            let mut table = self.pending.lock();
            if self.history.contains(&transaction_id) {
                debug!("Commit of {} already applied", transaction_id);
                return Ok(CommitResponse::committed_already());
            }
            let Some(pending) = table.remove(&transaction_id) else {
                error!(
                    "Commit of {} on {} has no pending entry",
                    transaction_id, self.address
                );
                return Ok(CommitResponse::error(format!(
                    "No pending transaction {transaction_id}"
                )));
            };
            self.history.insert(&transaction_id);
            pending
        };

        let action = pending.payload.action.clone();
        let payload_json = serde_json::to_value(&pending.payload)?;
        if let Err(e) = self
            .wal
            .write_log(&transaction_id, &action, WalStatus::Commit, &payload_json)
        {
            self.history.remove(&transaction_id);
            self.pending.lock().insert(transaction_id, pending);
            return Err(e.into());
        }
        self.faults.hit(CrashPoint::ParticipantAfterCommitLog)?;

        if !self.locks.is_held_by(&pending.resource_id, &transaction_id) {
            error!(
                "Commit of {} refused: lock on {} is no longer held",
                transaction_id, pending.resource_id
            );
            self.history.remove(&transaction_id);
            self.wal.write_log(
                &transaction_id,
                &action,
                WalStatus::CommitError,
                &payload_json,
            )?;
            return Ok(CommitResponse::error(format!(
                "Lock on {} lost before commit",
                pending.resource_id
            )));
        }

        let executed = pending.handler.execute(&pending.payload).await;
        self.locks.release(&pending.resource_id, &transaction_id);
        match executed {
            Ok(data) => {
                info!("Committed {} on {}", transaction_id, self.address);
                Ok(CommitResponse::committed(data))
            }
            Err(e) => {
                error!("Execution of {} failed: {}", transaction_id, e);
                self.history.remove(&transaction_id);
                self.wal.write_log(
                    &transaction_id,
                    &action,
                    WalStatus::CommitError,
                    &payload_json,
                )?;
                Ok(CommitResponse::error(e.to_string()))
            }
        }
    }

    /// Phase 2 abort. Idempotent; a transaction with nothing pending is a
    /// no-op apart from stopping any prepare still running for it.
    pub async fn handle_abort(&self, request: AbortRequest) -> Result<AbortResponse> {
        self.faults.on_rpc().await?;
        let transaction_id = request.transaction_id;
        let pending = self.pending.lock().remove(&transaction_id);
        match pending {
            Some(pending) => {
                let payload_json = serde_json::to_value(&pending.payload)?;
                self.wal.write_log(
                    &transaction_id,
                    &pending.payload.action,
                    WalStatus::Abort,
                    &payload_json,
                )?;
                self.locks.release(&pending.resource_id, &transaction_id);
                info!("Aborted {} on {}", transaction_id, self.address);
            }
            None => debug!("Abort of {}: nothing pending", transaction_id),
        }
        self.locks.wounds().signal(&transaction_id);
        Ok(AbortResponse {
            status: AbortStatus::Aborted,
        })
    }

    /// What this node knows about the outcome of `transaction_id`.
    pub async fn check_status(&self, transaction_id: &str) -> Result<StatusResponse> {
        self.faults.on_rpc().await?;
        let record = self.wal.get_transaction_log(transaction_id)?;
        let committed = self.history.contains(transaction_id)
            || record
                .as_ref()
                .is_some_and(|record| record.has_status(WalStatus::Commit));
        let status = if committed {
            DecisionStatus::Commit
        } else if record
            .as_ref()
            .is_some_and(|record| record.last_status == WalStatus::Abort)
        {
            DecisionStatus::Abort
        } else {
            DecisionStatus::Unknown
        };
        debug!(
            "Status of {} on {}: {:?}",
            transaction_id, self.address, status
        );
        Ok(StatusResponse {
            status,
            details: record,
        })
    }

    /// Aborts every pending transaction older than the pending timeout.
    /// Returns how many were aborted.
    pub fn sweep_expired(&self) -> usize {
        if self.faults.is_crashed() {
            return 0;
        }
        let expired: Vec<(String, PendingTransaction)> = {
            let mut table = self.pending.lock();
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, pending)| pending.prepared_at.elapsed() >= self.pending_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove_entry(&id))
                .collect()
        };

        for (transaction_id, pending) in &expired {
            warn!(
                "Sweeping {} (ts={}): no decision after {:?}",
                transaction_id, pending.timestamp, self.pending_timeout
            );
            let payload_json =
                serde_json::to_value(&pending.payload).unwrap_or(Value::Null);
            if let Err(e) = self.wal.write_log(
                transaction_id,
                &pending.payload.action,
                WalStatus::Abort,
                &payload_json,
            ) {
                error!("Failed to log sweep abort of {}: {}", transaction_id, e);
            }
            self.locks.release(&pending.resource_id, transaction_id);
        }
        self.history.purge_expired();
        expired.len()
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// the participant is dropped or the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let participant: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(participant) = participant.upgrade() else {
                    break;
                };
                let swept = participant.sweep_expired();
                if swept > 0 {
                    info!("Sweeper aborted {} stale transaction(s)", swept);
                }
            }
        })
    }
}

#[async_trait]
impl TwoPhaseCommitParticipant for Participant {
    async fn prepare(&self, request: PrepareRequest) -> Result<PrepareResponse> {
        self.handle_prepare(request).await
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitResponse> {
        self.handle_commit(request).await
    }

    async fn abort(&self, request: AbortRequest) -> Result<AbortResponse> {
        self.handle_abort(request).await
    }

    async fn check_status(&self, transaction_id: &str) -> Result<StatusResponse> {
        Participant::check_status(self, transaction_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::titles::{self, TitleStore};
    use crate::distributed::dist_config::FragmentRole;
    use crate::twopc::{CommitStatus, Vote};
    use serde_json::json;

    struct Fixture {
        participant: Arc<Participant>,
        store: Arc<TitleStore>,
        _dir: tempfile::TempDir,
    }

    fn fixture(pending_timeout_ms: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::new("node-a", FragmentRole::Central, dir.path());
        config.lock_timeout_ms = 200;
        config.pending_timeout_ms = pending_timeout_ms;
        let store = Arc::new(TitleStore::new());
        let wal = Arc::new(WriteAheadLog::open(dir.path(), &config.address, false).unwrap());
        let participant = Arc::new(Participant::new(
            &config,
            titles::title_registry(Arc::clone(&store)),
            wal,
            Arc::new(CommittedHistory::new(config.history_ttl())),
            Arc::new(FaultInjector::new("node-a")),
        ));
        Fixture {
            participant,
            store,
            _dir: dir,
        }
    }

    fn create(id: &str, timestamp: u64) -> PrepareRequest {
        PrepareRequest {
            transaction_id: format!("txn-{id}-{timestamp}"),
            timestamp,
            data: TransactionPayload::new(titles::CREATE_TITLE, id)
                .with_shard_key(1994)
                .with_data(json!({ "tconst": id, "primaryTitle": "Fixture" })),
        }
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let f = fixture(10_000);
        let request = create("tt1", 1);
        let id = request.transaction_id.clone();
        assert_eq!(f.participant.handle_prepare(request).await.unwrap().vote, Vote::Yes);

        let first = f
            .participant
            .handle_commit(CommitRequest {
                transaction_id: id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(first.status, CommitStatus::Committed);
        let second = f
            .participant
            .handle_commit(CommitRequest {
                transaction_id: id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(second.status, CommitStatus::CommittedAlready);
        assert_eq!(f.store.len(), 1);
        assert_eq!(f.participant.locks().resource_count(), 0);

        let status = f.participant.check_status(&id).await.unwrap();
        assert_eq!(status.status, DecisionStatus::Commit);
    }

    #[tokio::test]
    async fn validation_failure_votes_no_and_releases() {
        let f = fixture(10_000);
        let mut request = create("tt1", 1);
        request.data = TransactionPayload::new(titles::UPDATE_TITLE, "missing")
            .with_data(json!({ "primaryTitle": "x" }));
        let id = request.transaction_id.clone();
        let vote = f.participant.handle_prepare(request).await.unwrap();
        assert_eq!(vote.vote, Vote::No);
        assert!(vote.error.is_some());
        assert_eq!(f.participant.locks().resource_count(), 0);
        let record = f.participant.wal().get_transaction_log(&id).unwrap().unwrap();
        assert_eq!(record.last_status, WalStatus::Abort);
    }

    #[tokio::test]
    async fn unknown_action_votes_no() {
        let f = fixture(10_000);
        let mut request = create("tt1", 1);
        request.data.action = "DROP_TABLE".to_string();
        let vote = f.participant.handle_prepare(request).await.unwrap();
        assert_eq!(vote.vote, Vote::No);
        assert!(f.participant.wal().entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_without_prepare_is_reported() {
        let f = fixture(10_000);
        let response = f
            .participant
            .handle_commit(CommitRequest {
                transaction_id: "ghost".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.status, CommitStatus::Error);
    }

    #[tokio::test]
    async fn wounded_after_vote_refuses_to_commit() {
        let f = fixture(10_000);
        let young = create("tt1", 10);
        let young_id = young.transaction_id.clone();
        assert!(f.participant.handle_prepare(young).await.unwrap().is_yes());

        // An older transaction takes the lock away.
        let old = create("tt1", 5);
        assert!(f.participant.handle_prepare(old).await.unwrap().is_yes());

        let response = f
            .participant
            .handle_commit(CommitRequest {
                transaction_id: young_id.clone(),
            })
            .await
            .unwrap();
        assert_eq!(response.status, CommitStatus::Error);
        let record = f.participant.wal().get_transaction_log(&young_id).unwrap().unwrap();
        assert_eq!(record.last_status, WalStatus::CommitError);
        assert!(f.store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wound_interrupts_validation_delay() {
        let f = fixture(10_000);
        let mut young = create("tt1", 10);
        young.data = young.data.with_delay_ms(2_000);
        let young_id = young.transaction_id.clone();
        let resource = young.data.resource_id();

        let started = Instant::now();
        let participant = Arc::clone(&f.participant);
        let young_vote = tokio::spawn(async move { participant.handle_prepare(young).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.participant.locks().is_held_by(&resource, &young_id));

        let old = create("tt1", 5);
        let old_id = old.transaction_id.clone();
        assert!(f.participant.handle_prepare(old).await.unwrap().is_yes());

        let vote = young_vote.await.unwrap().unwrap();
        assert_eq!(vote.vote, Vote::No);
        assert!(vote.error.unwrap().contains("wound-wait"));
        assert!(started.elapsed() < Duration::from_millis(1_000));

        let record = f.participant.wal().get_transaction_log(&young_id).unwrap().unwrap();
        assert_eq!(record.last_status, WalStatus::Abort);
        assert!(!f.participant.is_pending(&young_id));
        assert!(f.participant.is_pending(&old_id));
        assert!(f.participant.locks().is_held_by(&resource, &old_id));
    }

    #[tokio::test]
    async fn abort_releases_and_is_idempotent() {
        let f = fixture(10_000);
        let request = create("tt1", 1);
        let id = request.transaction_id.clone();
        f.participant.handle_prepare(request).await.unwrap();
        for _ in 0..2 {
            let response = f
                .participant
                .handle_abort(AbortRequest {
                    transaction_id: id.clone(),
                })
                .await
                .unwrap();
            assert_eq!(response.status, AbortStatus::Aborted);
        }
        assert!(!f.participant.is_pending(&id));
        assert_eq!(f.participant.locks().resource_count(), 0);
        let aborts = f
            .participant
            .wal()
            .entries()
            .unwrap()
            .into_iter()
            .filter(|entry| entry.status == WalStatus::Abort)
            .count();
        assert_eq!(aborts, 1);
    }

    #[tokio::test]
    async fn sweeper_aborts_stale_prepares() {
        let f = fixture(20);
        let request = create("tt1", 1);
        let id = request.transaction_id.clone();
        f.participant.handle_prepare(request).await.unwrap();
        assert_eq!(f.participant.sweep_expired(), 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(f.participant.sweep_expired(), 1);
        assert_eq!(f.participant.locks().resource_count(), 0);
        let status = f.participant.check_status(&id).await.unwrap();
        assert_eq!(status.status, DecisionStatus::Abort);
    }
}
