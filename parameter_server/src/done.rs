//! The shutdown-barrier done queue.
//!
//! Each worker enqueues exactly one token as its last action; the server's
//! wait routine dequeues one per replica and only then lets the process
//! exit, so no server terminates while a worker still depends on its shard.

use log::info;
use tokio::sync::mpsc;

/// The enqueue side, shared by every worker connection.
pub struct DoneQueue {
    tx: mpsc::Sender<()>,
}

/// The dequeue side, owned by the server main task.
pub struct DoneWaiter {
    rx: mpsc::Receiver<()>,
    expected: usize,
}

/// Creates the done queue for `num_replicas` workers.
pub fn done_queue(num_replicas: usize) -> (DoneQueue, DoneWaiter) {
    let (tx, rx) = mpsc::channel(num_replicas.max(1));

    (
        DoneQueue { tx },
        DoneWaiter {
            rx,
            expected: num_replicas,
        },
    )
}

impl DoneQueue {
    /// Enqueues one shutdown token.
    ///
    /// The queue has capacity for every replica, so under the
    /// one-token-per-worker contract this never blocks.
    ///
    /// # Returns
    /// `false` when the contract was violated and the queue is full.
    pub fn enqueue(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

impl DoneWaiter {
    /// Dequeues one token per replica, then returns.
    pub async fn wait(mut self) {
        info!("waiting for workers to finish");

        for finished in 1..=self.expected {
            if self.rx.recv().await.is_none() {
                return;
            }
            info!("{finished}/{} workers have finished", self.expected);
        }
    }
}
