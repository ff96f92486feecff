//! The shared state of one parameter-server process.

use std::{fmt, sync::Arc};

use comms::{
    msg::ControlSnapshot,
    specs::TrainerSpec,
};
use tokio::sync::watch;

use crate::{
    control::ControlStore,
    done::{done_queue, DoneQueue, DoneWaiter},
    optimization::{Adam, Optimizer, Sgd},
    store::{ShardErr, ShardStore},
    sync::SyncGate,
};

/// The optimizer applied to the hosted shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl OptimizerKind {
    fn build(self, len: usize) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Adam => Box::new(Adam::with_defaults(len)),
            OptimizerKind::Sgd => Box::new(Sgd),
        }
    }
}

/// Everything a server needs to host its shard and control replica.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_replicas: usize,
    pub numbatches_to_aggregate: usize,
    pub initial_learning_rate: f32,
    pub learning_rate_decay: f32,
    pub valid_frequency: i64,
    pub optimizer: OptimizerKind,
}

impl ServerConfig {
    /// Derives the server configuration from the shared trainer options.
    ///
    /// # Errors
    /// A message describing the first invalid option; servers fail fast at
    /// startup like every other node.
    pub fn from_trainer(trainer: &TrainerSpec, num_replicas: usize) -> Result<Self, String> {
        if num_replicas == 0 {
            return Err("the cluster needs at least one worker".to_string());
        }
        if trainer.initial_learning_rate <= 0.0 {
            return Err("initial_learning_rate must be positive".to_string());
        }
        if trainer.learning_rate_decay <= 0.0 || trainer.learning_rate_decay > 1.0 {
            return Err("learning_rate_decay must be in (0, 1]".to_string());
        }
        if trainer.valid_frequency < 0 {
            return Err("valid_frequency cannot be negative".to_string());
        }

        Ok(Self {
            num_replicas,
            numbatches_to_aggregate: trainer.numbatches_to_aggregate,
            initial_learning_rate: trainer.initial_learning_rate,
            learning_rate_decay: trainer.learning_rate_decay,
            valid_frequency: trainer.valid_frequency,
            optimizer: OptimizerKind::Adam,
        })
    }
}

/// Errors surfaced to workers as protocol error messages.
#[derive(Debug)]
pub enum StateErr {
    /// A gradient arrived before the chief installed the decay horizon.
    NotConfigured,
    Shard(ShardErr),
}

impl fmt::Display for StateErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateErr::NotConfigured => {
                write!(f, "the server has not been configured by the chief")
            }
            StateErr::Shard(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StateErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateErr::Shard(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ShardErr> for StateErr {
    fn from(value: ShardErr) -> Self {
        Self::Shard(value)
    }
}

/// The process-wide server state shared by every worker connection.
pub struct ServerState {
    control: ControlStore,
    store: ShardStore,
    sync: SyncGate,
    done: DoneQueue,
    terminate: watch::Sender<bool>,
    optimizer: OptimizerKind,
}

impl ServerState {
    /// Creates the state and the done-barrier waiter for the main task.
    pub fn new(config: ServerConfig) -> (Arc<Self>, DoneWaiter) {
        let (done, waiter) = done_queue(config.num_replicas);

        let state = Self {
            control: ControlStore::new(
                config.valid_frequency,
                config.initial_learning_rate,
                config.learning_rate_decay,
            ),
            store: ShardStore::new(),
            sync: SyncGate::new(config.numbatches_to_aggregate),
            done,
            terminate: watch::channel(false).0,
            optimizer: config.optimizer,
        };

        (Arc::new(state), waiter)
    }

    /// The control-variable store.
    pub fn control(&self) -> &ControlStore {
        &self.control
    }

    /// Installs the decay horizon; chief only.
    pub fn configure(&self, num_steps: i64) {
        self.control.configure(num_steps);
    }

    /// Restores the control replica from a checkpoint snapshot.
    pub fn restore(&self, snapshot: ControlSnapshot) {
        self.sync.set_applied(snapshot.global_step);
        self.control.restore(snapshot);
    }

    /// Installs (or overwrites) the shard weights with a fresh optimizer.
    pub fn init_params(&self, weights: &[f32]) {
        self.store.init(weights, self.optimizer.build(weights.len()));
    }

    /// One gradient contribution; applies the aggregate on the Kth and
    /// advances the step counter by exactly one.
    ///
    /// # Returns
    /// The learning rate of the step the contribution belongs to.
    pub fn push_gradient(&self, grad: &[f32]) -> Result<f32, StateErr> {
        if !self.control.is_configured() {
            return Err(StateErr::NotConfigured);
        }

        let learning_rate = self.control.learning_rate();
        let threshold = self.sync.aggregate().max(1);
        let applied = self.store.push(grad, threshold, learning_rate)?;

        if applied {
            let global_step = self.control.advance_step();
            self.sync.notify_applied(global_step);
        }

        Ok(learning_rate)
    }

    /// A copy of the shard weights, waiting for chief initialization first.
    pub async fn pull_weights(&self) -> Vec<f32> {
        let mut ready = self.store.subscribe_ready();
        let _ = ready.wait_for(|&r| r).await;

        self.store.pull().unwrap_or_default()
    }

    /// Waits for one contribution token (synchronous mode only).
    pub async fn acquire_token(&self) {
        self.sync.acquire_token(self.terminate.subscribe()).await;
    }

    /// Releases K tokens: the chief's seed op and every queue-runner refill.
    pub fn add_tokens(&self) {
        self.sync.add_tokens();
    }

    /// Observes applied-step events for the chief queue runner.
    pub fn subscribe_applied(&self) -> watch::Receiver<i64> {
        self.sync.subscribe_applied()
    }

    /// Raises the cooperative stop flag and wakes token waiters.
    pub fn terminate(&self) {
        self.control.terminate();
        self.terminate.send_replace(true);
    }

    /// Observes the terminate flag.
    pub fn subscribe_terminate(&self) -> watch::Receiver<bool> {
        self.terminate.subscribe()
    }

    /// Enqueues one shutdown token.
    pub fn enqueue_done(&self) -> bool {
        self.done.enqueue()
    }
}

#[cfg(test)]
mod tests {
    use comms::msg::{VarId, VarValue};

    use super::*;

    fn config(aggregate: usize) -> ServerConfig {
        ServerConfig {
            num_replicas: 2,
            numbatches_to_aggregate: aggregate,
            initial_learning_rate: 1.0,
            learning_rate_decay: 1.0,
            valid_frequency: 5,
            optimizer: OptimizerKind::Sgd,
        }
    }

    #[test]
    fn gradients_before_configuration_are_rejected() {
        let (state, _waiter) = ServerState::new(config(0));
        state.init_params(&[0.0]);

        assert!(matches!(
            state.push_gradient(&[1.0]),
            Err(StateErr::NotConfigured)
        ));
    }

    #[test]
    fn the_step_advances_once_per_aggregate() {
        let (state, _waiter) = ServerState::new(config(2));
        state.configure(10);
        state.init_params(&[0.0, 0.0]);

        state.push_gradient(&[2.0, 2.0]).unwrap();
        assert_eq!(state.control().read(VarId::GlobalStep), VarValue::Int(0));

        state.push_gradient(&[4.0, 4.0]).unwrap();
        assert_eq!(state.control().read(VarId::GlobalStep), VarValue::Int(1));
    }

    #[test]
    fn non_synchronous_contributions_apply_individually() {
        let (state, _waiter) = ServerState::new(config(0));
        state.configure(10);
        state.init_params(&[0.0]);

        state.push_gradient(&[1.0]).unwrap();
        state.push_gradient(&[1.0]).unwrap();

        assert_eq!(state.control().read(VarId::GlobalStep), VarValue::Int(2));
    }

    #[tokio::test]
    async fn restored_state_is_visible_to_pulls_and_reads() {
        let (state, _waiter) = ServerState::new(config(0));
        state.configure(10);

        state.restore(ControlSnapshot {
            global_step: 7,
            position: 16,
            validated_step: 5,
            validation_loss: 1.25,
            learning_rate_fact: 0.5,
        });
        state.init_params(&[1.0, 2.0]);

        assert_eq!(state.control().read(VarId::GlobalStep), VarValue::Int(7));
        assert_eq!(state.control().read(VarId::Position), VarValue::Int(16));
        assert_eq!(state.pull_weights().await, vec![1.0, 2.0]);
    }
}
