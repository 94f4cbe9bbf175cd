use ahash::AHashMap as HashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::errors::LockError;
use crate::locking::{LockType, WoundRegistry};
use crate::transaction::is_older;

/// Default bound on how long `acquire` waits in the queue.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// An active lock on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub transaction_id: String,
    pub lock_type: LockType,
    pub timestamp: u64,
    ticket: u64,
}

/// A request waiting for a resource, with the channel that resolves it.
#[derive(Debug)]
struct LockRequest {
    transaction_id: String,
    lock_type: LockType,
    timestamp: u64,
    ticket: u64,
    waiter: oneshot::Sender<Result<(), LockError>>,
}

/// Per-resource state. An entry with no holders and no waiters is removed.
#[derive(Debug, Default)]
struct ResourceLocks {
    active: Vec<LockHolder>,
    pending: VecDeque<LockRequest>,
}

impl ResourceLocks {
    fn is_idle(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }

    fn conflicts(&self, transaction_id: &str, lock_type: LockType) -> Vec<LockHolder> {
        self.active
            .iter()
            .filter(|holder| {
                holder.transaction_id != transaction_id && lock_type.conflicts_with(holder.lock_type)
            })
            .cloned()
            .collect()
    }

    /// Queues `request` behind every older waiter.
    fn enqueue(&mut self, request: LockRequest) {
        let position = self
            .pending
            .iter()
            .position(|queued| {
                is_older(
                    request.timestamp,
                    &request.transaction_id,
                    queued.timestamp,
                    &queued.transaction_id,
                )
            })
            .unwrap_or(self.pending.len());
        self.pending.insert(position, request);
    }

    /// Records `transaction_id` as a holder, upgrading an existing shared hold.
    fn grant(&mut self, transaction_id: &str, lock_type: LockType, timestamp: u64, ticket: u64) {
        if let Some(holder) = self
            .active
            .iter_mut()
            .find(|holder| holder.transaction_id == transaction_id)
        {
            if lock_type == LockType::Exclusive {
                holder.lock_type = LockType::Exclusive;
                holder.ticket = ticket;
            }
            return;
        }
        self.active.push(LockHolder {
            transaction_id: transaction_id.to_string(),
            lock_type,
            timestamp,
            ticket,
        });
    }

    /// Drops every hold and queued request of `transaction_id`. Queued
    /// requests are resolved with `reason`.
    fn remove_transaction(&mut self, transaction_id: &str, reason: impl Fn() -> LockError) {
        self.active
            .retain(|holder| holder.transaction_id != transaction_id);
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for request in self.pending.drain(..) {
            if request.transaction_id == transaction_id {
                let _ = request.waiter.send(Err(reason()));
            } else {
                kept.push_back(request);
            }
        }
        self.pending = kept;
    }

    /// Grants from the head of the queue while the head is compatible with
    /// the current holders. Consecutive shared requests are granted together.
    fn grant_pending(&mut self, resource_id: &str) {
        self.pending
            .make_contiguous()
            .sort_by(|a, b| (a.timestamp, &a.transaction_id).cmp(&(b.timestamp, &b.transaction_id)));

        while let Some(head) = self.pending.front() {
            if !self.conflicts(&head.transaction_id, head.lock_type).is_empty() {
                break;
            }
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            self.grant(
                &request.transaction_id,
                request.lock_type,
                request.timestamp,
                request.ticket,
            );
            if request.waiter.send(Ok(())).is_err() {
                // The waiter gave up before the grant landed.
                self.active.retain(|holder| holder.ticket != request.ticket);
                continue;
            }
            debug!(
                "Granted queued {} lock on {} to {}",
                request.lock_type, resource_id, request.transaction_id
            );
        }
    }
}

/// Outcome of one non-blocking acquisition attempt.
enum Attempt {
    Granted,
    Wait,
}

/// Shared/exclusive lock table with wound-wait deadlock prevention.
///
/// An older requester (smaller timestamp) wounds younger conflicting
/// holders: their locks are dropped and their wound listeners fire. A
/// younger requester waits in the resource queue, which is kept ordered by
/// timestamp and never bypassed by a newcomer for another transaction.
pub struct LockManager {
    table: Mutex<HashMap<String, ResourceLocks>>,
    wounds: Arc<WoundRegistry>,
    wait_timeout: Duration,
    next_ticket: AtomicU64,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_WAIT)
    }
}

impl LockManager {
    pub fn new(wait_timeout: Duration) -> Self {
        Self::with_wounds(wait_timeout, Arc::new(WoundRegistry::new()))
    }

    pub fn with_wounds(wait_timeout: Duration, wounds: Arc<WoundRegistry>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            wounds,
            wait_timeout,
            next_ticket: AtomicU64::new(1),
        }
    }

    /// The registry that receives wound notifications.
    pub fn wounds(&self) -> &Arc<WoundRegistry> {
        &self.wounds
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Acquires `lock_type` on `resource_id` for `transaction_id`.
    ///
    /// Suspends until the lock is granted, the request is rejected (wounded
    /// or withdrawn), or the configured wait bound elapses. Dropping the
    /// returned future withdraws the request.
    pub async fn acquire(
        &self,
        resource_id: &str,
        transaction_id: &str,
        lock_type: LockType,
        timestamp: u64,
    ) -> Result<(), LockError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut wounded = Vec::new();
        let receiver = {
            let mut table = self.table.lock();
            let state = table.entry(resource_id.to_string()).or_default();
            match Self::attempt(
                state,
                resource_id,
                transaction_id,
                lock_type,
                timestamp,
                ticket,
                &mut wounded,
            ) {
                Attempt::Granted => None,
                Attempt::Wait => {
                    let (sender, receiver) = oneshot::channel();
                    debug!(
                        "Enqueued {} request of {} (ts={}) on {}",
                        lock_type, transaction_id, timestamp, resource_id
                    );
                    state.enqueue(LockRequest {
                        transaction_id: transaction_id.to_string(),
                        lock_type,
                        timestamp,
                        ticket,
                        waiter: sender,
                    });
                    Some(receiver)
                }
            }
        };
        for victim in &wounded {
            self.wounds.signal(victim);
        }

        let Some(receiver) = receiver else {
            debug!(
                "Granted {} lock on {} to {}",
                lock_type, resource_id, transaction_id
            );
            return Ok(());
        };

        let mut guard = WaitGuard {
            manager: self,
            resource_id,
            ticket,
            settled: false,
        };
        match tokio::time::timeout(self.wait_timeout, receiver).await {
            Ok(Ok(outcome)) => {
                guard.settled = true;
                outcome
            }
            Ok(Err(_)) => {
                guard.settled = true;
                Err(LockError::Cancelled {
                    transaction_id: transaction_id.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    "Lock wait of {} on {} timed out after {:?}",
                    transaction_id, resource_id, self.wait_timeout
                );
                drop(guard);
                Err(LockError::Timeout {
                    resource_id: resource_id.to_string(),
                    waited: self.wait_timeout,
                })
            }
        }
    }

    /// Runs the wound-wait decision loop against the current holders.
    fn attempt(
        state: &mut ResourceLocks,
        resource_id: &str,
        transaction_id: &str,
        lock_type: LockType,
        timestamp: u64,
        ticket: u64,
        wounded: &mut Vec<String>,
    ) -> Attempt {
        loop {
            if let Some(holder) = state
                .active
                .iter()
                .find(|holder| holder.transaction_id == transaction_id)
            {
                if holder.lock_type == LockType::Exclusive || lock_type == LockType::Shared {
                    return Attempt::Granted;
                }
            }

            let conflicts = state.conflicts(transaction_id, lock_type);
            if conflicts.is_empty() {
                let may_bypass = state
                    .pending
                    .front()
                    .is_none_or(|head| head.transaction_id == transaction_id);
                if may_bypass {
                    state.grant(transaction_id, lock_type, timestamp, ticket);
                    return Attempt::Granted;
                }
                return Attempt::Wait;
            }

            if conflicts.iter().any(|holder| {
                is_older(holder.timestamp, &holder.transaction_id, timestamp, transaction_id)
            }) {
                return Attempt::Wait;
            }

            for victim in conflicts {
                warn!(
                    "Wound-wait: {} (ts={}) wounds {} (ts={}) on {}",
                    transaction_id,
                    timestamp,
                    victim.transaction_id,
                    victim.timestamp,
                    resource_id
                );
                let victim_id = victim.transaction_id.clone();
                state.remove_transaction(&victim.transaction_id, || LockError::Wounded {
                    transaction_id: victim_id.clone(),
                });
                wounded.push(victim.transaction_id);
            }
            state.grant_pending(resource_id);
        }
    }

    /// Releases every hold and queued request of `transaction_id` on
    /// `resource_id`. A no-op if nothing is held.
    pub fn release(&self, resource_id: &str, transaction_id: &str) {
        let mut table = self.table.lock();
        let Some(state) = table.get_mut(resource_id) else {
            return;
        };
        state.remove_transaction(transaction_id, || LockError::Cancelled {
            transaction_id: transaction_id.to_string(),
        });
        state.grant_pending(resource_id);
        if state.is_idle() {
            table.remove(resource_id);
        }
        debug!("Released {} for {}", resource_id, transaction_id);
    }

    /// Whether `transaction_id` currently holds a lock on `resource_id`.
    pub fn is_held_by(&self, resource_id: &str, transaction_id: &str) -> bool {
        self.table.lock().get(resource_id).is_some_and(|state| {
            state
                .active
                .iter()
                .any(|holder| holder.transaction_id == transaction_id)
        })
    }

    /// Active holders of `resource_id`.
    pub fn holders(&self, resource_id: &str) -> Vec<LockHolder> {
        self.table
            .lock()
            .get(resource_id)
            .map(|state| state.active.clone())
            .unwrap_or_default()
    }

    /// Number of requests queued on `resource_id`.
    pub fn queue_len(&self, resource_id: &str) -> usize {
        self.table
            .lock()
            .get(resource_id)
            .map_or(0, |state| state.pending.len())
    }

    /// Number of resources with holders or waiters.
    pub fn resource_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Removes the request identified by `ticket`, whether it is still
    /// queued or was granted without the waiter observing it.
    fn withdraw(&self, resource_id: &str, ticket: u64) {
        let mut table = self.table.lock();
        let Some(state) = table.get_mut(resource_id) else {
            return;
        };
        state.pending.retain(|request| request.ticket != ticket);
        state.active.retain(|holder| holder.ticket != ticket);
        state.grant_pending(resource_id);
        if state.is_idle() {
            table.remove(resource_id);
        }
    }
}

/// Withdraws a queued request when its `acquire` future is dropped or times out.
struct WaitGuard<'a> {
    manager: &'a LockManager,
    resource_id: &'a str,
    ticket: u64,
    settled: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.manager.withdraw(self.resource_id, self.ticket);
        }
    }
}
