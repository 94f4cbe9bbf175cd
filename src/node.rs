use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::actions::ActionRegistry;
use crate::distributed::coordinator::{Coordinator, TransactionOutcome};
use crate::distributed::dist_config::NodeConfig;
use crate::distributed::fault::FaultInjector;
use crate::distributed::history::CommittedHistory;
use crate::distributed::network::Transport;
use crate::distributed::participant::Participant;
use crate::distributed::recovery::{RecoveryManager, RecoveryReport};
use crate::distributed::routing::Router;
use crate::errors::Result;
use crate::transaction::TransactionPayload;
use crate::wal::WriteAheadLog;

/// Fragstore prelude
pub mod prelude {
    pub use crate::actions::*;
    pub use crate::distributed::coordinator::{CoordinatorState, TransactionOutcome};
    pub use crate::distributed::dist_config::*;
    pub use crate::distributed::fault::{CrashPoint, FaultInjector};
    pub use crate::distributed::network::{InProcessNetwork, PeerClient, Transport};
    pub use crate::errors::*;
    pub use crate::locking::LockType;
    pub use crate::transaction::*;
    pub use crate::twopc::*;
    pub use crate::wal::WalStatus;
    pub use crate::*;
}

/// One member of the fragmented store: the coordinator that serves client
/// requests, the participant that serves peers, and the state they share.
pub struct Node {
    config: NodeConfig,
    participant: Arc<Participant>,
    coordinator: Coordinator,
    transport: Arc<dyn Transport>,
    faults: Arc<FaultInjector>,
    recovery: RecoveryReport,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Opens the node's WAL, recovers from it, and starts serving.
    ///
    /// Recovery completes before the node is reachable, so no new
    /// transaction interleaves with it.
    ///
    /// # Errors
    ///
    /// Invalid configuration, WAL failures, and recovery failures.
    pub async fn open(
        config: NodeConfig,
        registry: ActionRegistry,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let wal = Arc::new(WriteAheadLog::open(
            &config.wal_dir,
            &config.address,
            config.fsync,
        )?);
        let history = Arc::new(CommittedHistory::new(config.history_ttl()));
        let faults = Arc::new(FaultInjector::new(config.address.clone()));

        let recovery = RecoveryManager::new(
            config.address.clone(),
            Arc::clone(&wal),
            registry.clone(),
            Arc::clone(&history),
            Router::new(&config),
            config
                .peers
                .iter()
                .map(|peer| transport.connect(&peer.address))
                .collect(),
            config.rpc_timeout(),
        )
        .run()
        .await?;

        let participant = Arc::new(Participant::new(
            &config,
            registry,
            wal,
            history,
            Arc::clone(&faults),
        ));
        let coordinator = Coordinator::new(
            &config,
            Arc::clone(&participant),
            transport.as_ref(),
            Arc::clone(&faults),
        );
        transport.register(&config.address, participant.clone());
        let sweeper = participant.spawn_sweeper(config.sweep_interval());
        info!("Node {} ({:?}) is up", config.address, config.role);

        Ok(Self {
            config,
            participant,
            coordinator,
            transport,
            faults,
            recovery,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Runs a client request as a distributed transaction coordinated here.
    pub async fn start_transaction(&self, payload: TransactionPayload) -> Result<TransactionOutcome> {
        self.coordinator.start_transaction(payload).await
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn participant(&self) -> &Arc<Participant> {
        &self.participant
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    /// What startup recovery did.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stops the sweeper and leaves the network. Idempotent.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
            self.transport.deregister(&self.config.address);
            info!("Node {} shut down", self.config.address);
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}
