use log::debug;

use crate::distributed::dist_config::{FragmentRole, NodeConfig, PeerConfig};
use crate::errors::{FragError, Result};

/// Which nodes take part in a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    /// Peers that receive prepare/commit/abort RPCs.
    pub targets: Vec<String>,
    /// Whether the coordinating node is itself a participant.
    pub local_participant: bool,
}

impl RoutePlan {
    pub fn participant_count(&self) -> usize {
        self.targets.len() + usize::from(self.local_participant)
    }

    pub fn is_empty(&self) -> bool {
        self.participant_count() == 0
    }
}

/// Maps shard keys to the nodes that store them.
///
/// Local and remote membership come from the same ownership test, so a
/// key is never routed to zero nodes without the router noticing.
#[derive(Debug, Clone)]
pub struct Router {
    local_role: FragmentRole,
    peers: Vec<PeerConfig>,
    threshold: i64,
}

impl Router {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            local_role: config.role,
            peers: config.peers.clone(),
            threshold: config.shard_threshold,
        }
    }

    /// Computes the participants for `shard_key`. A missing key (broadcast
    /// read) involves every node.
    ///
    /// # Errors
    ///
    /// Returns [`FragError::NoParticipants`] when no node owns the key.
    pub fn route(&self, shard_key: Option<i64>) -> Result<RoutePlan> {
        let targets: Vec<String> = self
            .peers
            .iter()
            .filter(|peer| peer.role.owns(shard_key, self.threshold))
            .map(|peer| peer.address.clone())
            .collect();
        let plan = RoutePlan {
            targets,
            local_participant: self.local_role.owns(shard_key, self.threshold),
        };
        if plan.is_empty() {
            return Err(FragError::NoParticipants(shard_key));
        }
        debug!(
            "Shard key {:?} routes to {:?} (local participant: {})",
            shard_key, plan.targets, plan.local_participant
        );
        Ok(plan)
    }
}
