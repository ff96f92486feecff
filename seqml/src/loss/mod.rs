//! Loss/decoding strategies.
//!
//! A strategy owns everything loss-specific about a trainer: the training
//! loss and its gradient w.r.t. the logits, the outputs evaluated during
//! validation, and the per-utterance validation metric. The driver treats
//! the strategy as a capability set and never inspects which variant it is.

mod cross_entropy;
mod ctc;

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3};

pub use cross_entropy::CrossEntropy;
pub use ctc::Ctc;

use crate::{Logits, MlError};

/// A scalar training loss together with its gradient w.r.t. the logits.
///
/// The gradient is zero on padding frames so it can be fed straight into
/// the classifier's backward pass.
#[derive(Debug, Clone)]
pub struct LossGrad {
    pub loss: f32,
    pub d_logits: Array3<f32>,
}

/// What a strategy evaluates on validation batches.
#[derive(Debug, Clone)]
pub enum ValidationOutput {
    /// `[B, T, D]` label probabilities (frame-level strategies).
    Probabilities(Array3<f32>),
    /// `[B, L]` decoded label sequences padded with -1 (sequence-level
    /// strategies).
    Labels(Array2<i32>),
}

/// The loss/decoding capability set consumed by the training driver.
pub trait LossStrategy: Send + Sync {
    /// Computes the batch-mean training loss and its logit gradient.
    ///
    /// # Arguments
    /// * `targets` - `[B, U, 1]` padded target labels.
    /// * `logits` - The training forward pass output.
    /// * `target_seq_length` - The true label count per utterance.
    fn compute_loss(
        &self,
        targets: ArrayView3<'_, i32>,
        logits: &Logits,
        target_seq_length: &[usize],
    ) -> Result<LossGrad, MlError>;

    /// Computes the outputs evaluated on validation batches.
    fn validation_output(&self, logits: &Logits) -> Result<ValidationOutput, MlError>;

    /// Scores validation outputs against the ground truth.
    ///
    /// # Returns
    /// One error value per utterance.
    fn validation_metric(
        &self,
        outputs: &ValidationOutput,
        targets: &[Array1<i32>],
    ) -> Result<Vec<f32>, MlError>;
}

/// Row-wise log-softmax with the usual max subtraction.
pub(crate) fn log_softmax(row: ArrayView1<'_, f32>) -> Array1<f32> {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let log_z = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
    row.mapv(|v| v - log_z)
}
