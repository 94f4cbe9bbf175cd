use log::{error, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::errors::{FragError, Result};

/// Places in the protocol where a simulated crash can be triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Coordinator has logged PREPARE but sent nothing.
    CoordinatorAfterPrepareLog,
    /// Coordinator has logged COMMIT but sent no commit.
    CoordinatorAfterCommitLog,
    /// Participant has logged READY but not voted.
    ParticipantAfterReady,
    /// Participant voted YES and dies as the commit arrives.
    ParticipantBeforeCommit,
    /// Participant has logged COMMIT but not executed.
    ParticipantAfterCommitLog,
}

/// Test hooks for delays and crashes.
///
/// Once a crash point fires the node stays crashed: every later call into
/// it fails with [`FragError::NodeCrashed`] until a fresh node is opened
/// from the same WAL.
#[derive(Debug)]
pub struct FaultInjector {
    node: String,
    delay: Mutex<Option<Duration>>,
    armed: Mutex<HashSet<CrashPoint>>,
    crashed: AtomicBool,
}

impl FaultInjector {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            delay: Mutex::new(None),
            armed: Mutex::new(HashSet::new()),
            crashed: AtomicBool::new(false),
        }
    }

    /// Delays every incoming RPC by `delay`. `None` disables the delay.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn arm_crash(&self, point: CrashPoint) {
        warn!("Node {} armed to crash at {:?}", self.node, point);
        self.armed.lock().insert(point);
    }

    /// Clears delays and armed crash points. A node that already crashed
    /// stays crashed.
    pub fn reset(&self) {
        *self.delay.lock() = None;
        self.armed.lock().clear();
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Marks the node crashed without waiting for a crash point.
    pub fn crash(&self) {
        error!("Node {} crashed", self.node);
        self.crashed.store(true, Ordering::SeqCst);
    }

    /// Applies the configured delay, then fails if the node has crashed.
    pub async fn on_rpc(&self) -> Result<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.ensure_alive()
    }

    pub fn ensure_alive(&self) -> Result<()> {
        if self.is_crashed() {
            return Err(FragError::NodeCrashed(self.node.clone()));
        }
        Ok(())
    }

    /// Fires `point` if it is armed.
    pub fn hit(&self, point: CrashPoint) -> Result<()> {
        if self.armed.lock().remove(&point) {
            error!("Node {} crashing at {:?}", self.node, point);
            self.crashed.store(true, Ordering::SeqCst);
        }
        self.ensure_alive()
    }
}
