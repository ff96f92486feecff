//! The hosted parameter shard.
//!
//! One contiguous chunk of the flat model parameters lives here together
//! with a gradient accumulation buffer and the optimizer state. The shard
//! starts empty; the chief initializes it (from fresh weights or a restored
//! checkpoint) and readiness gates every reader until then.

use std::fmt;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::optimization::Optimizer;

/// Errors produced by shard operations.
#[derive(Debug)]
pub enum ShardErr {
    /// The shard has not been initialized by the chief yet.
    NotInitialized,
    /// A gradient does not match the shard size.
    SizeMismatch { got: usize, expected: usize },
}

impl fmt::Display for ShardErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardErr::NotInitialized => write!(f, "the parameter shard is not initialized"),
            ShardErr::SizeMismatch { got, expected } => {
                write!(f, "shard size mismatch: got {got}, expected {expected}")
            }
        }
    }
}

impl std::error::Error for ShardErr {}

struct Inner {
    weights: Vec<f32>,
    grad: Vec<f32>,
    count: usize,
    optimizer: Option<Box<dyn Optimizer>>,
}

/// The primary storage of shard weights and accumulated gradients.
pub struct ShardStore {
    inner: Mutex<Inner>,
    ready: watch::Sender<bool>,
}

impl Default for ShardStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardStore {
    /// Creates an empty, not yet ready store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                weights: Vec::new(),
                grad: Vec::new(),
                count: 0,
                optimizer: None,
            }),
            ready: watch::channel(false).0,
        }
    }

    /// The shard size; zero until initialized.
    pub fn len(&self) -> usize {
        self.inner.lock().weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Installs the shard weights and a fresh optimizer, marking the store
    /// ready. Re-initialization (a checkpoint restore) replaces both.
    pub fn init(&self, weights: &[f32], optimizer: Box<dyn Optimizer>) {
        let mut inner = self.inner.lock();
        inner.weights = weights.to_vec();
        inner.grad = vec![0.0; weights.len()];
        inner.count = 0;
        inner.optimizer = Some(optimizer);
        drop(inner);

        self.ready.send_replace(true);
    }

    /// Observes initialization; non-chief sessions wait on this before
    /// pulling weights.
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Accumulates one gradient contribution and applies the aggregate once
    /// `aggregate_threshold` contributions have been buffered.
    ///
    /// The whole operation is atomic: of k concurrent contributions exactly
    /// one observes the threshold and performs the apply.
    ///
    /// # Arguments
    /// * `grad` - The gradient contribution.
    /// * `aggregate_threshold` - Contributions per applied step (>= 1).
    /// * `learning_rate` - The step size used if this contribution applies.
    ///
    /// # Returns
    /// `true` when this contribution triggered the aggregated update.
    pub fn push(
        &self,
        grad: &[f32],
        aggregate_threshold: usize,
        learning_rate: f32,
    ) -> Result<bool, ShardErr> {
        let mut inner = self.inner.lock();
        let Inner {
            weights,
            grad: buffer,
            count,
            optimizer,
        } = &mut *inner;

        let Some(optimizer) = optimizer.as_mut() else {
            return Err(ShardErr::NotInitialized);
        };
        if grad.len() != buffer.len() {
            return Err(ShardErr::SizeMismatch {
                got: grad.len(),
                expected: buffer.len(),
            });
        }

        buffer.iter_mut().zip(grad).for_each(|(b, g)| *b += g);
        *count += 1;

        if *count < aggregate_threshold.max(1) {
            return Ok(false);
        }

        let scale = 1.0 / *count as f32;
        buffer.iter_mut().for_each(|b| *b *= scale);

        optimizer
            .update_params(learning_rate, buffer, weights)
            .map_err(|_| ShardErr::SizeMismatch {
                got: grad.len(),
                expected: weights.len(),
            })?;

        buffer.fill(0.0);
        *count = 0;

        Ok(true)
    }

    /// A copy of the shard weights.
    ///
    /// # Errors
    /// `ShardErr::NotInitialized` before the chief initialized the shard.
    pub fn pull(&self) -> Result<Vec<f32>, ShardErr> {
        let inner = self.inner.lock();
        if inner.optimizer.is_none() {
            return Err(ShardErr::NotInitialized);
        }

        Ok(inner.weights.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::Sgd;

    fn ready_store(weights: &[f32]) -> ShardStore {
        let store = ShardStore::new();
        store.init(weights, Box::new(Sgd));
        store
    }

    #[test]
    fn pushes_before_initialization_are_rejected() {
        let store = ShardStore::new();
        assert!(matches!(
            store.push(&[1.0], 1, 0.1),
            Err(ShardErr::NotInitialized)
        ));
        assert!(matches!(store.pull(), Err(ShardErr::NotInitialized)));
    }

    #[test]
    fn the_aggregate_applies_on_the_kth_contribution() {
        let store = ready_store(&[0.0, 0.0]);

        assert!(!store.push(&[2.0, 2.0], 2, 1.0).unwrap());
        assert!(store.push(&[4.0, 4.0], 2, 1.0).unwrap());

        // The mean of the two contributions, applied once.
        assert_eq!(store.pull().unwrap(), vec![-3.0, -3.0]);
    }

    #[test]
    fn a_threshold_of_one_applies_every_contribution() {
        let store = ready_store(&[1.0]);

        assert!(store.push(&[1.0], 1, 0.5).unwrap());
        assert!(store.push(&[1.0], 1, 0.5).unwrap());

        assert_eq!(store.pull().unwrap(), vec![0.0]);
    }

    #[test]
    fn mismatched_gradients_are_rejected() {
        let store = ready_store(&[0.0, 0.0]);
        assert!(matches!(
            store.push(&[1.0], 1, 0.1),
            Err(ShardErr::SizeMismatch { got: 1, expected: 2 })
        ));
    }

    #[test]
    fn readiness_flips_on_initialization() {
        let store = ShardStore::new();
        let ready = store.subscribe_ready();

        assert!(!*ready.borrow());
        store.init(&[0.5], Box::new(Sgd));
        assert!(*ready.borrow());
        assert_eq!(store.len(), 1);
    }
}
