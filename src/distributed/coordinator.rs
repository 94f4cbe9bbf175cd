use ahash::AHashMap as HashMap;
use futures::future::{self, BoxFuture, FutureExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::distributed::dist_config::NodeConfig;
use crate::distributed::fault::{CrashPoint, FaultInjector};
use crate::distributed::network::{PeerClient, Transport};
use crate::distributed::participant::Participant;
use crate::distributed::routing::{RoutePlan, Router};
use crate::errors::{FragError, Result};
use crate::transaction::{Transaction, TransactionClock, TransactionPayload};
use crate::twopc::{
    AbortRequest, CommitRequest, CommitResponse, CommitStatus, PrepareRequest, PrepareResponse,
};
use crate::wal::{WalStatus, WriteAheadLog};

/// Coordinator-side progress of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Started,
    Preparing,
    Committing,
    Committed,
    Aborted,
}

/// What the client is told once the protocol has finished.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Committed {
        transaction_id: String,
        data: Option<Value>,
    },
    Aborted {
        transaction_id: String,
        reason: String,
    },
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }

    pub fn transaction_id(&self) -> &str {
        match self {
            TransactionOutcome::Committed { transaction_id, .. }
            | TransactionOutcome::Aborted { transaction_id, .. } => transaction_id,
        }
    }

    /// Data returned by the participant that executed the action.
    pub fn data(&self) -> Option<&Value> {
        match self {
            TransactionOutcome::Committed { data, .. } => data.as_ref(),
            TransactionOutcome::Aborted { .. } => None,
        }
    }

    /// Why the transaction aborted.
    pub fn reason(&self) -> Option<&str> {
        match self {
            TransactionOutcome::Aborted { reason, .. } => Some(reason),
            TransactionOutcome::Committed { .. } => None,
        }
    }
}

/// Drives two-phase commit for requests that arrive at this node.
pub struct Coordinator {
    address: String,
    router: Router,
    clock: TransactionClock,
    wal: Arc<WriteAheadLog>,
    local: Arc<Participant>,
    peers: HashMap<String, Arc<dyn PeerClient>>,
    faults: Arc<FaultInjector>,
    rpc_timeout: Duration,
    states: Mutex<HashMap<String, CoordinatorState>>,
}

impl Coordinator {
    pub fn new(
        config: &NodeConfig,
        local: Arc<Participant>,
        transport: &dyn Transport,
        faults: Arc<FaultInjector>,
    ) -> Self {
        let peers = config
            .peers
            .iter()
            .map(|peer| (peer.address.clone(), transport.connect(&peer.address)))
            .collect();
        Self {
            address: config.address.clone(),
            router: Router::new(config),
            clock: TransactionClock::new(),
            wal: Arc::clone(local.wal()),
            local,
            peers,
            faults,
            rpc_timeout: config.rpc_timeout(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// State of a transaction this coordinator is still driving.
    pub fn state(&self, transaction_id: &str) -> Option<CoordinatorState> {
        self.states.lock().get(transaction_id).copied()
    }

    pub fn in_flight(&self) -> usize {
        self.states.lock().len()
    }

    /// Runs `payload` as a distributed transaction.
    ///
    /// Vote failures and unreachable peers end in
    /// [`TransactionOutcome::Aborted`]; `Err` means the coordinator itself
    /// could not proceed (WAL failure, unowned shard key, crashed node).
    pub async fn start_transaction(&self, payload: TransactionPayload) -> Result<TransactionOutcome> {
        self.faults.ensure_alive()?;
        let plan = self.router.route(payload.shard_key)?;
        let txn = Transaction::new(self.clock.next(), payload);
        let action = txn.payload.action.clone();
        let payload_json = serde_json::to_value(&txn.payload)?;
        info!(
            "Starting {} ({} on {}, ts={}) with {} participant(s)",
            txn.id,
            action,
            txn.resource_id(),
            txn.timestamp,
            plan.participant_count()
        );
        self.set_state(&txn.id, CoordinatorState::Started);

        let outcome = self.run(&txn, &plan, &action, &payload_json).await;
        match &outcome {
            Ok(_) | Err(FragError::NodeCrashed(_)) => {}
            Err(e) => warn!("Transaction {} failed on the coordinator: {}", txn.id, e),
        }
        if !self.faults.is_crashed() {
            self.states.lock().remove(&txn.id);
        }
        outcome
    }

    async fn run(
        &self,
        txn: &Transaction,
        plan: &RoutePlan,
        action: &str,
        payload_json: &Value,
    ) -> Result<TransactionOutcome> {
        self.wal
            .write_log(&txn.id, action, WalStatus::Prepare, payload_json)?;
        self.faults.hit(CrashPoint::CoordinatorAfterPrepareLog)?;

        self.set_state(&txn.id, CoordinatorState::Preparing);
        let rejections = self.prepare_all(txn, plan).await;
        self.faults.ensure_alive()?;
        if !rejections.is_empty() {
            let reason = rejections.join("; ");
            warn!("Aborting {}: {}", txn.id, reason);
            self.wal
                .write_log(&txn.id, action, WalStatus::Abort, payload_json)?;
            self.set_state(&txn.id, CoordinatorState::Aborted);
            self.abort_all(&txn.id, plan).await;
            return Ok(TransactionOutcome::Aborted {
                transaction_id: txn.id.clone(),
                reason,
            });
        }

        self.wal
            .write_log(&txn.id, action, WalStatus::Commit, payload_json)?;
        self.faults.hit(CrashPoint::CoordinatorAfterCommitLog)?;
        self.set_state(&txn.id, CoordinatorState::Committing);
        let data = self.commit_all(&txn.id, plan).await;
        self.set_state(&txn.id, CoordinatorState::Committed);
        info!("Committed {}", txn.id);
        Ok(TransactionOutcome::Committed {
            transaction_id: txn.id.clone(),
            data,
        })
    }

    /// Sends prepare everywhere at once and returns the reasons of every
    /// NO vote or failed call.
    async fn prepare_all(&self, txn: &Transaction, plan: &RoutePlan) -> Vec<String> {
        let request = PrepareRequest {
            transaction_id: txn.id.clone(),
            timestamp: txn.timestamp,
            data: txn.payload.clone(),
        };
        let mut calls: Vec<BoxFuture<'_, (String, Result<PrepareResponse>)>> = plan
            .targets
            .iter()
            .map(|address| {
                let request = request.clone();
                async move {
                    let vote = match self.peers.get(address) {
                        Some(peer) => self.bounded(address, peer.prepare(request)).await,
                        None => Err(FragError::transport(address.as_str(), "unknown peer")),
                    };
                    (address.clone(), vote)
                }
                .boxed()
            })
            .collect();
        if plan.local_participant {
            calls.push(
                async move {
                    let vote = self.local.handle_prepare(request).await;
                    (self.address.clone(), vote)
                }
                .boxed(),
            );
        }

        future::join_all(calls)
            .await
            .into_iter()
            .filter_map(|(address, vote)| match vote {
                Ok(response) if response.is_yes() => None,
                Ok(response) => Some(format!(
                    "{} voted NO: {}",
                    address,
                    response.error.unwrap_or_default()
                )),
                Err(e) => Some(format!("{} failed to prepare: {}", address, e)),
            })
            .collect()
    }

    /// Sends commit everywhere and returns the first non-null result.
    async fn commit_all(&self, transaction_id: &str, plan: &RoutePlan) -> Option<Value> {
        let request = CommitRequest {
            transaction_id: transaction_id.to_string(),
        };
        let mut calls: Vec<BoxFuture<'_, (String, Result<CommitResponse>)>> = plan
            .targets
            .iter()
            .map(|address| {
                let request = request.clone();
                async move {
                    let ack = match self.peers.get(address) {
                        Some(peer) => self.bounded(address, peer.commit(request)).await,
                        None => Err(FragError::transport(address.as_str(), "unknown peer")),
                    };
                    (address.clone(), ack)
                }
                .boxed()
            })
            .collect();
        if plan.local_participant {
            calls.push(
                async move {
                    let ack = self.local.handle_commit(request).await;
                    (self.address.clone(), ack)
                }
                .boxed(),
            );
        }

        let mut data = None;
        for (address, ack) in future::join_all(calls).await {
            match ack {
                Ok(response) => {
                    if response.status == CommitStatus::Error {
                        warn!(
                            "{} could not apply {}: {}",
                            address,
                            transaction_id,
                            response.error.unwrap_or_default()
                        );
                    }
                    if data.is_none() {
                        data = response.data;
                    }
                }
                Err(e) => warn!("Commit of {} on {} failed: {}", transaction_id, address, e),
            }
        }
        data
    }

    /// Sends abort everywhere. Failures are logged and otherwise ignored.
    async fn abort_all(&self, transaction_id: &str, plan: &RoutePlan) {
        let request = AbortRequest {
            transaction_id: transaction_id.to_string(),
        };
        let mut calls: Vec<BoxFuture<'_, (String, Result<()>)>> = plan
            .targets
            .iter()
            .map(|address| {
                let request = request.clone();
                async move {
                    let ack = match self.peers.get(address) {
                        Some(peer) => self
                            .bounded(address, peer.abort(request))
                            .await
                            .map(|_| ()),
                        None => Err(FragError::transport(address.as_str(), "unknown peer")),
                    };
                    (address.clone(), ack)
                }
                .boxed()
            })
            .collect();
        if plan.local_participant {
            calls.push(
                async move {
                    let ack = self.local.handle_abort(request).await.map(|_| ());
                    (self.address.clone(), ack)
                }
                .boxed(),
            );
        }

        for (address, ack) in future::join_all(calls).await {
            if let Err(e) = ack {
                warn!("Abort of {} on {} failed: {}", transaction_id, address, e);
            }
        }
    }

    /// Bounds a peer call by the RPC timeout.
    async fn bounded<T>(&self, peer: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FragError::transport(
                peer,
                format!("no answer within {:?}", self.rpc_timeout),
            )),
        }
    }

    fn set_state(&self, transaction_id: &str, state: CoordinatorState) {
        debug!("Transaction {} is {:?}", transaction_id, state);
        self.states.lock().insert(transaction_id.to_string(), state);
    }
}
