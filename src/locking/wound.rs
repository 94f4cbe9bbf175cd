use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Cancellation signal shared by one listener and the registry.
#[derive(Debug, Default)]
struct Signal {
    fired: AtomicBool,
    notify: Notify,
}

/// Registry of cancellation listeners keyed by transaction id.
///
/// Code that works on behalf of a transaction (waiting for a lock,
/// validating) subscribes for the duration of that work. When the lock
/// manager wounds the transaction, or the participant aborts it, every
/// listener for the id is woken and should abandon its work.
#[derive(Debug, Default)]
pub struct WoundRegistry {
    listeners: Mutex<HashMap<String, Vec<(u64, Arc<Signal>)>>>,
    next_listener: AtomicU64,
}

impl WoundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `transaction_id`. It is removed when dropped.
    pub fn subscribe(self: &Arc<Self>, transaction_id: &str) -> WoundListener {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let signal = Arc::new(Signal::default());
        self.listeners
            .lock()
            .entry(transaction_id.to_string())
            .or_default()
            .push((id, Arc::clone(&signal)));
        WoundListener {
            registry: Arc::clone(self),
            transaction_id: transaction_id.to_string(),
            id,
            signal,
        }
    }

    /// Wakes every listener bound to `transaction_id`. Returns how many were woken.
    pub fn signal(&self, transaction_id: &str) -> usize {
        let listeners = self.listeners.lock();
        let Some(bound) = listeners.get(transaction_id) else {
            return 0;
        };
        for (_, signal) in bound {
            signal.fired.store(true, Ordering::SeqCst);
            signal.notify.notify_one();
        }
        debug!(
            "Signalled {} listener(s) of transaction {}",
            bound.len(),
            transaction_id
        );
        bound.len()
    }

    /// Number of live listeners for `transaction_id`.
    pub fn listener_count(&self, transaction_id: &str) -> usize {
        self.listeners
            .lock()
            .get(transaction_id)
            .map_or(0, |bound| bound.len())
    }

    fn deregister(&self, transaction_id: &str, id: u64) {
        let mut listeners = self.listeners.lock();
        if let Some(bound) = listeners.get_mut(transaction_id) {
            bound.retain(|(listener, _)| *listener != id);
            if bound.is_empty() {
                listeners.remove(transaction_id);
            }
        }
    }
}

/// A subscription created by [`WoundRegistry::subscribe`].
#[derive(Debug)]
pub struct WoundListener {
    registry: Arc<WoundRegistry>,
    transaction_id: String,
    id: u64,
    signal: Arc<Signal>,
}

impl WoundListener {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn is_wounded(&self) -> bool {
        self.signal.fired.load(Ordering::SeqCst)
    }

    /// Resolves once the transaction has been signalled.
    pub async fn wounded(&self) {
        while !self.is_wounded() {
            self.signal.notify.notified().await;
        }
    }
}

impl Drop for WoundListener {
    fn drop(&mut self) {
        self.registry.deregister(&self.transaction_id, self.id);
    }
}
