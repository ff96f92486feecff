//! Synchronous-aggregation gating.
//!
//! In synchronous mode every gradient contribution consumes one token. The
//! chief seeds the queue with the aggregation count K for the first step
//! and its queue runner releases K fresh tokens after every applied-step
//! event, so the fleet advances in lockstep: no worker contributes to step
//! i+1 before step i has been applied. With K = 0 the gate is inert and
//! contributions apply individually.

use tokio::sync::{watch, Semaphore};

/// The token queue and the applied-step event channel.
pub struct SyncGate {
    aggregate: usize,
    tokens: Semaphore,
    applied: watch::Sender<i64>,
}

impl SyncGate {
    /// Creates a new gate.
    ///
    /// # Arguments
    /// * `aggregate` - Contributions per applied step; 0 disables gating.
    pub fn new(aggregate: usize) -> Self {
        Self {
            aggregate,
            tokens: Semaphore::new(0),
            applied: watch::channel(0).0,
        }
    }

    /// The aggregation count K.
    pub fn aggregate(&self) -> usize {
        self.aggregate
    }

    /// Whether contributions are token-gated.
    pub fn is_synchronous(&self) -> bool {
        self.aggregate > 0
    }

    /// Waits for one contribution token.
    ///
    /// Returns immediately in non-synchronous mode, and unblocks without a
    /// token when the terminate flag rises so draining workers can reach
    /// their own loop check.
    pub async fn acquire_token(&self, mut terminate: watch::Receiver<bool>) {
        if !self.is_synchronous() {
            return;
        }

        tokio::select! {
            permit = self.tokens.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
            }
            _ = terminate.wait_for(|&t| t) => {}
        }
    }

    /// Releases K tokens; the seed op and every queue-runner refill.
    pub fn add_tokens(&self) {
        if self.is_synchronous() {
            self.tokens.add_permits(self.aggregate);
        }
    }

    /// Publishes an applied step to the queue-runner channel.
    pub fn notify_applied(&self, global_step: i64) {
        self.applied.send_replace(global_step);
    }

    /// Re-aligns the event channel after a checkpoint restore.
    pub fn set_applied(&self, global_step: i64) {
        self.applied.send_replace(global_step);
    }

    /// Observes applied-step events; the chief queue runner subscribes.
    pub fn subscribe_applied(&self) -> watch::Receiver<i64> {
        self.applied.subscribe()
    }
}
