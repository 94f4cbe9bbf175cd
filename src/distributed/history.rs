use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Ids of recently committed transactions, each kept for a fixed TTL.
///
/// Lets duplicate prepare and commit deliveries be answered without
/// touching the lock table or the action handler a second time.
#[derive(Debug)]
pub struct CommittedHistory {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl CommittedHistory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records `transaction_id`. Returns false if it was already present.
    pub fn insert(&self, transaction_id: &str) -> bool {
        let expires = Instant::now() + self.ttl;
        let mut entries = self.entries.lock();
        match entries.get_mut(transaction_id) {
            Some(existing) if *existing > Instant::now() => false,
            _ => {
                entries.insert(transaction_id.to_string(), expires);
                true
            }
        }
    }

    pub fn contains(&self, transaction_id: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(transaction_id) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                entries.remove(transaction_id);
                false
            }
            None => false,
        }
    }

    pub fn remove(&self, transaction_id: &str) {
        self.entries.lock().remove(transaction_id);
    }

    /// Drops expired ids and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, expires| *expires > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
