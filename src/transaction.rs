use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix used to derive a lock resource id from a record's primary key.
pub const RESOURCE_PREFIX: &str = "tx-";

/// Derives the lock resource for a primary key.
pub fn resource_id_for(primary_key: &str) -> String {
    format!("{RESOURCE_PREFIX}{primary_key}")
}

/// The client request carried through both protocol phases.
///
/// `shard_key` is the fragmentation attribute; reads that do not know it
/// leave it empty and are broadcast to every node. `delay_ms` asks the
/// participant to keep the lock for that long before validating, which is
/// how the concurrency scenarios are exercised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    pub action: String,
    pub id: String,
    #[serde(default, alias = "startYear", skip_serializing_if = "Option::is_none")]
    pub shard_key: Option<i64>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl TransactionPayload {
    pub fn new(action: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            id: id.into(),
            shard_key: None,
            data: serde_json::Value::Null,
            delay_ms: None,
        }
    }

    pub fn with_shard_key(mut self, shard_key: i64) -> Self {
        self.shard_key = Some(shard_key);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// The lock resource this payload touches.
    pub fn resource_id(&self) -> String {
        resource_id_for(&self.id)
    }
}

/// A distributed transaction as created by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Globally unique, opaque identifier.
    pub id: String,
    /// Wound-wait priority: smaller is older and wins.
    pub timestamp: u64,
    pub payload: TransactionPayload,
}

impl Transaction {
    pub fn new(timestamp: u64, payload: TransactionPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            payload,
        }
    }

    pub fn resource_id(&self) -> String {
        self.payload.resource_id()
    }
}

/// Priority key used by wound-wait. Ties on the timestamp are broken by id
/// so that two distinct transactions are never equally old.
pub fn is_older(a_ts: u64, a_id: &str, b_ts: u64, b_id: &str) -> bool {
    (a_ts, a_id) < (b_ts, b_id)
}

/// Strictly increasing millisecond clock used to stamp new transactions.
#[derive(Debug, Default)]
pub struct TransactionClock {
    last: AtomicU64,
}

impl TransactionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `max(now, last + 1)` and records it.
    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }
}
