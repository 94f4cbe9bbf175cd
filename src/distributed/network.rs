use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use crate::errors::{FragError, Result};
use crate::twopc::{
    AbortRequest, AbortResponse, CommitRequest, CommitResponse, PrepareRequest, PrepareResponse,
    StatusResponse, TwoPhaseCommitParticipant,
};

/// Client side of a peer connection.
pub trait PeerClient: TwoPhaseCommitParticipant {
    /// The address this client talks to.
    fn address(&self) -> &str;
}

/// How a node reaches its peers and makes itself reachable.
pub trait Transport: Send + Sync {
    /// Returns a client for `address`. Connection failures surface on use.
    fn connect(&self, address: &str) -> Arc<dyn PeerClient>;

    /// Starts serving `participant` under `address`.
    fn register(&self, address: &str, participant: Arc<dyn TwoPhaseCommitParticipant>);

    /// Stops serving `address`.
    fn deregister(&self, address: &str);
}

#[derive(Default)]
struct Registry {
    nodes: HashMap<String, Arc<dyn TwoPhaseCommitParticipant>>,
    partitioned: HashSet<String>,
}

/// In-process transport. Nodes sharing an `InProcessNetwork` reach each
/// other through direct calls, and an address can be cut off to simulate
/// an unreachable peer.
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    inner: Arc<RwLock<Registry>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `address` unreachable until [`heal`](Self::heal) is called.
    pub fn partition(&self, address: &str) {
        debug!("Partitioning {}", address);
        self.inner.write().partitioned.insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        debug!("Healing {}", address);
        self.inner.write().partitioned.remove(address);
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.inner.read().nodes.contains_key(address)
    }

    fn resolve(&self, address: &str) -> Result<Arc<dyn TwoPhaseCommitParticipant>> {
        let registry = self.inner.read();
        if registry.partitioned.contains(address) {
            return Err(FragError::transport(address, "network partitioned"));
        }
        registry
            .nodes
            .get(address)
            .cloned()
            .ok_or_else(|| FragError::transport(address, "connection refused"))
    }
}

impl Transport for InProcessNetwork {
    fn connect(&self, address: &str) -> Arc<dyn PeerClient> {
        Arc::new(InProcessPeer {
            address: address.to_string(),
            network: self.clone(),
        })
    }

    fn register(&self, address: &str, participant: Arc<dyn TwoPhaseCommitParticipant>) {
        debug!("Registering {} on the in-process network", address);
        self.inner
            .write()
            .nodes
            .insert(address.to_string(), participant);
    }

    fn deregister(&self, address: &str) {
        debug!("Deregistering {} from the in-process network", address);
        self.inner.write().nodes.remove(address);
    }
}

/// A client bound to one address of an [`InProcessNetwork`]. The target is
/// looked up on every call, so a restarted node is picked up transparently.
pub struct InProcessPeer {
    address: String,
    network: InProcessNetwork,
}

impl PeerClient for InProcessPeer {
    fn address(&self) -> &str {
        &self.address
    }
}

impl InProcessPeer {
    /// Runs `call` as its own task so the serving side finishes even when
    /// the caller stops waiting, as it would behind a real socket.
    async fn deliver<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        tokio::spawn(call)
            .await
            .map_err(|e| FragError::transport(self.address.as_str(), e))?
    }
}

#[async_trait]
impl TwoPhaseCommitParticipant for InProcessPeer {
    async fn prepare(&self, request: PrepareRequest) -> Result<PrepareResponse> {
        let node = self.network.resolve(&self.address)?;
        self.deliver(async move { node.prepare(request).await }).await
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitResponse> {
        let node = self.network.resolve(&self.address)?;
        self.deliver(async move { node.commit(request).await }).await
    }

    async fn abort(&self, request: AbortRequest) -> Result<AbortResponse> {
        let node = self.network.resolve(&self.address)?;
        self.deliver(async move { node.abort(request).await }).await
    }

    async fn check_status(&self, transaction_id: &str) -> Result<StatusResponse> {
        let node = self.network.resolve(&self.address)?;
        let transaction_id = transaction_id.to_string();
        self.deliver(async move { node.check_status(&transaction_id).await })
            .await
    }
}
