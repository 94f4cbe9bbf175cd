use futures::future;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::actions::ActionRegistry;
use crate::distributed::history::CommittedHistory;
use crate::distributed::network::PeerClient;
use crate::distributed::routing::Router;
use crate::errors::{FragError, Result};
use crate::transaction::TransactionPayload;
use crate::twopc::{CommitRequest, CommitStatus, DecisionStatus};
use crate::wal::{TransactionRecord, WalStatus, WriteAheadLog};

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transactions this pass aborted (last status PREPARE, or READY with
    /// no peer reporting COMMIT).
    pub aborted: Vec<String>,
    /// In-doubt transactions resolved to COMMIT through a peer.
    pub committed: Vec<String>,
    /// Transactions whose COMMIT was already logged and were redone.
    pub redone: Vec<String>,
    /// Transactions that needed nothing.
    pub settled: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.aborted.is_empty() && self.committed.is_empty() && self.redone.is_empty()
    }
}

/// Replays the WAL at startup and settles every unfinished transaction.
pub struct RecoveryManager {
    address: String,
    wal: Arc<WriteAheadLog>,
    registry: ActionRegistry,
    history: Arc<CommittedHistory>,
    router: Router,
    peers: Vec<Arc<dyn PeerClient>>,
    rpc_timeout: Duration,
}

impl RecoveryManager {
    pub fn new(
        address: impl Into<String>,
        wal: Arc<WriteAheadLog>,
        registry: ActionRegistry,
        history: Arc<CommittedHistory>,
        router: Router,
        peers: Vec<Arc<dyn PeerClient>>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            wal,
            registry,
            history,
            router,
            peers,
            rpc_timeout,
        }
    }

    /// Runs one recovery pass over the whole log, oldest transaction first.
    ///
    /// # Errors
    ///
    /// WAL failures, a corrupt log, and redo failures other than
    /// "already applied" stop recovery.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let mut records: Vec<TransactionRecord> =
            self.wal.recover_from_logs()?.into_values().collect();
        records.sort_by_key(|record| record.first_seen);
        info!(
            "Recovering {} transaction(s) from {}",
            records.len(),
            self.wal.path().display()
        );

        let mut report = RecoveryReport::default();
        let mut to_notify = Vec::new();
        for record in records {
            match record.last_status {
                WalStatus::Prepare => {
                    warn!(
                        "{} never reached READY, aborting",
                        record.transaction_id
                    );
                    self.log(&record, WalStatus::Abort)?;
                    report.aborted.push(record.transaction_id);
                }
                WalStatus::Ready => {
                    if self.peer_reports_commit(&record.transaction_id).await {
                        info!("{} committed elsewhere, adopting COMMIT", record.transaction_id);
                        self.log(&record, WalStatus::Commit)?;
                        self.redo(&record).await?;
                        self.history.insert(&record.transaction_id);
                        report.committed.push(record.transaction_id);
                    } else {
                        warn!("{} is in doubt with no COMMIT reported, aborting", record.transaction_id);
                        self.log(&record, WalStatus::Abort)?;
                        report.aborted.push(record.transaction_id);
                    }
                }
                WalStatus::Commit => {
                    // Only a node that voted READY executed the action.
                    if record.has_status(WalStatus::Ready) {
                        self.redo(&record).await?;
                    }
                    self.history.insert(&record.transaction_id);
                    report.redone.push(record.transaction_id.clone());
                    to_notify.push(record);
                }
                WalStatus::Abort | WalStatus::CommitError => report.settled += 1,
            }
        }
        // One round of re-sent commits for every redone record at once.
        future::join_all(to_notify.iter().map(|record| self.notify_commit(record))).await;
        info!(
            "Recovery on {} finished: {} aborted, {} committed, {} redone, {} settled",
            self.address,
            report.aborted.len(),
            report.committed.len(),
            report.redone.len(),
            report.settled
        );
        Ok(report)
    }

    fn log(&self, record: &TransactionRecord, status: WalStatus) -> Result<()> {
        self.wal
            .write_log(&record.transaction_id, &record.action, status, &record.payload)?;
        Ok(())
    }

    fn payload(&self, record: &TransactionRecord) -> Result<TransactionPayload> {
        serde_json::from_value(record.payload.clone()).map_err(|e| FragError::RecoveryFailed {
            transaction_id: record.transaction_id.clone(),
            reason: format!("unreadable payload: {e}"),
        })
    }

    /// Re-applies a committed action. "Already applied" counts as success.
    async fn redo(&self, record: &TransactionRecord) -> Result<()> {
        let handler = self
            .registry
            .get(&record.action)
            .ok_or_else(|| FragError::RecoveryFailed {
                transaction_id: record.transaction_id.clone(),
                reason: format!("unknown action {}", record.action),
            })?;
        let payload = self.payload(record)?;
        match handler.execute(&payload).await {
            Ok(_) => {
                info!("Redid {} ({})", record.transaction_id, record.action);
                Ok(())
            }
            Err(e) if e.is_already_applied() => {
                info!("{} was already applied: {}", record.transaction_id, e);
                Ok(())
            }
            Err(e) => {
                error!("Redo of {} failed: {}", record.transaction_id, e);
                Err(FragError::RecoveryFailed {
                    transaction_id: record.transaction_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Termination protocol: asks every peer what it logged.
    async fn peer_reports_commit(&self, transaction_id: &str) -> bool {
        let answers = future::join_all(self.peers.iter().map(|peer| async move {
            let answer =
                tokio::time::timeout(self.rpc_timeout, peer.check_status(transaction_id)).await;
            (peer.address(), answer)
        }))
        .await;

        let mut committed = false;
        for (address, answer) in answers {
            match answer {
                Ok(Ok(status)) => {
                    info!("{} reports {:?} for {}", address, status.status, transaction_id);
                    committed |= status.status == DecisionStatus::Commit;
                }
                Ok(Err(e)) => warn!("Status lookup of {} on {} failed: {}", transaction_id, address, e),
                Err(_) => warn!("Status lookup of {} on {} timed out", transaction_id, address),
            }
        }
        committed
    }

    /// Re-sends commit to the peers that own the record's shard key.
    async fn notify_commit(&self, record: &TransactionRecord) {
        let shard_key = match self.payload(record) {
            Ok(payload) => payload.shard_key,
            Err(e) => {
                warn!("Cannot route re-notification of {}: {}", record.transaction_id, e);
                return;
            }
        };
        let Ok(plan) = self.router.route(shard_key) else {
            return;
        };
        let targets: Vec<&Arc<dyn PeerClient>> = self
            .peers
            .iter()
            .filter(|peer| plan.targets.iter().any(|target| target == peer.address()))
            .collect();
        let acks = future::join_all(targets.into_iter().map(|peer| {
            let request = CommitRequest {
                transaction_id: record.transaction_id.clone(),
            };
            async move {
                let ack = tokio::time::timeout(self.rpc_timeout, peer.commit(request)).await;
                (peer.address(), ack)
            }
        }))
        .await;
        for (address, ack) in acks {
            match ack {
                Ok(Ok(response)) if response.status != CommitStatus::Error => {}
                Ok(Ok(response)) => warn!(
                    "{} did not apply re-sent commit of {}: {}",
                    address,
                    record.transaction_id,
                    response.error.unwrap_or_default()
                ),
                Ok(Err(e)) => warn!("Re-sent commit of {} to {} failed: {}", record.transaction_id, address, e),
                Err(_) => warn!("Re-sent commit of {} to {} timed out", record.transaction_id, address),
            }
        }
    }
}
