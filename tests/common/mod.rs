//! Common utilities for fragstore integration tests.
#![allow(dead_code)]

use ahash::AHashMap as HashMap;
use fragstore::actions::titles::{self, TitleStore};
use fragstore::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

pub const CENTRAL: &str = "node-central";
pub const BELOW: &str = "node-below";
pub const ABOVE: &str = "node-above";

/// Fragmentation boundary used by every test cluster.
pub const THRESHOLD: i64 = 2000;

const MEMBERS: [(&str, FragmentRole); 3] = [
    (CENTRAL, FragmentRole::Central),
    (BELOW, FragmentRole::Below),
    (ABOVE, FragmentRole::AtOrAbove),
];

/// A running node and the table it writes to. The table outlives restarts
/// of the node, the way a database outlives the process using it.
pub struct TestNode {
    pub node: Node,
    pub store: Arc<TitleStore>,
}

/// Three nodes on one in-process network, each with its own WAL directory.
pub struct Cluster {
    pub network: InProcessNetwork,
    dir: TempDir,
    tune: fn(&mut NodeConfig),
    nodes: HashMap<String, TestNode>,
}

impl Cluster {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Starts a cluster whose node configs are adjusted by `tune`.
    pub async fn start_with(tune: fn(&mut NodeConfig)) -> Self {
        let mut cluster = Self {
            network: InProcessNetwork::new(),
            dir: TempDir::new().unwrap(),
            tune,
            nodes: HashMap::new(),
        };
        for (address, _) in MEMBERS {
            let store = Arc::new(TitleStore::new());
            let node = cluster.open(address, Arc::clone(&store)).await.unwrap();
            cluster
                .nodes
                .insert(address.to_string(), TestNode { node, store });
        }
        cluster
    }

    pub fn config(&self, address: &str) -> NodeConfig {
        let (_, role) = MEMBERS
            .iter()
            .find(|(member, _)| *member == address)
            .copied()
            .unwrap();
        let mut config = NodeConfig::new(address, role, self.dir.path().join(address));
        config.shard_threshold = THRESHOLD;
        config.fsync = false;
        for (peer, peer_role) in MEMBERS {
            if peer != address {
                config = config.with_peer(peer, peer_role);
            }
        }
        (self.tune)(&mut config);
        config
    }

    async fn open(&self, address: &str, store: Arc<TitleStore>) -> Result<Node> {
        let transport: Arc<dyn Transport> = Arc::new(self.network.clone());
        Node::open(
            self.config(address),
            titles::title_registry(store),
            transport,
        )
        .await
    }

    pub fn node(&self, address: &str) -> &Node {
        &self.nodes.get(address).unwrap().node
    }

    pub fn store(&self, address: &str) -> &Arc<TitleStore> {
        &self.nodes.get(address).unwrap().store
    }

    /// Stops `address` and opens it again from its WAL, keeping its table.
    pub async fn restart(&mut self, address: &str) -> Result<&Node> {
        let store = {
            let old = self.nodes.get(address).unwrap();
            old.node.shutdown();
            Arc::clone(&old.store)
        };
        self.nodes.remove(address);
        let node = self.open(address, Arc::clone(&store)).await?;
        self.nodes
            .insert(address.to_string(), TestNode { node, store });
        Ok(self.node(address))
    }

    /// Last WAL status `address` recorded for `transaction_id`.
    pub fn wal_status(&self, address: &str, transaction_id: &str) -> Option<WalStatus> {
        self.node(address)
            .participant()
            .wal()
            .get_transaction_log(transaction_id)
            .unwrap()
            .map(|record| record.last_status)
    }

    /// Ids of every transaction `address` has logged, oldest first.
    pub fn logged_transactions(&self, address: &str) -> Vec<String> {
        self.node(address)
            .participant()
            .wal()
            .transaction_ids()
            .unwrap()
    }

    /// Panics if any node's log ends a transaction in PREPARE or READY.
    pub fn assert_nothing_in_doubt(&self) {
        for (address, _) in MEMBERS {
            let records = self
                .node(address)
                .participant()
                .wal()
                .recover_from_logs()
                .unwrap();
            for record in records.values() {
                assert!(
                    !matches!(record.last_status, WalStatus::Prepare | WalStatus::Ready),
                    "{} left {} in {}",
                    address,
                    record.transaction_id,
                    record.last_status
                );
            }
        }
    }
}

pub fn create_title(tconst: &str, start_year: i64) -> TransactionPayload {
    TransactionPayload::new(titles::CREATE_TITLE, tconst)
        .with_shard_key(start_year)
        .with_data(json!({
            "tconst": tconst,
            "titleType": "movie",
            "primaryTitle": format!("Title {tconst}"),
            "startYear": start_year,
            "genres": "Drama"
        }))
}

pub fn read_title(tconst: &str, start_year: Option<i64>) -> TransactionPayload {
    let payload = TransactionPayload::new(titles::READ_TITLE, tconst);
    match start_year {
        Some(year) => payload.with_shard_key(year),
        None => payload,
    }
}

pub fn update_title(tconst: &str, start_year: i64, primary_title: &str) -> TransactionPayload {
    TransactionPayload::new(titles::UPDATE_TITLE, tconst)
        .with_shard_key(start_year)
        .with_data(json!({ "primaryTitle": primary_title }))
}

pub fn delete_title(tconst: &str, start_year: i64) -> TransactionPayload {
    TransactionPayload::new(titles::DELETE_TITLE, tconst).with_shard_key(start_year)
}
