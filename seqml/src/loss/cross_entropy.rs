//! Frame-level cross-entropy.
//!
//! Targets align frame-by-frame with the inputs, so the loss is the mean
//! softmax cross-entropy over every real frame in the batch, computed on
//! the non-sequence view.

use ndarray::{Array1, Array2, ArrayView3, Axis};

use crate::{
    loss::{log_softmax, LossGrad, LossStrategy, ValidationOutput},
    seq::{nonseq2seq, seq2nonseq},
    Logits, MlError,
};

/// The frame-level cross-entropy strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropy;

impl LossStrategy for CrossEntropy {
    fn compute_loss(
        &self,
        targets: ArrayView3<'_, i32>,
        logits: &Logits,
        target_seq_length: &[usize],
    ) -> Result<LossGrad, MlError> {
        let nonseq_targets = seq2nonseq(targets, target_seq_length)?;
        let nonseq_logits = seq2nonseq(logits.values.view(), &logits.seq_length)?;

        if nonseq_targets.nrows() != nonseq_logits.nrows() {
            return Err(MlError::ShapeMismatch {
                what: "frames",
                got: nonseq_targets.nrows(),
                expected: nonseq_logits.nrows(),
            });
        }

        let frames = nonseq_logits.nrows();
        let dim = nonseq_logits.ncols();
        let mut loss = 0.0;
        let mut d_nonseq = Array2::zeros((frames, dim));

        for (row, (logit_row, target)) in nonseq_logits
            .axis_iter(Axis(0))
            .zip(nonseq_targets.column(0))
            .enumerate()
        {
            let label = usize::try_from(*target).ok().filter(|&l| l < dim).ok_or(
                MlError::InvalidInput("target label is outside the logit dimension"),
            )?;

            let log_probs = log_softmax(logit_row);
            loss -= log_probs[label];

            let mut d_row = d_nonseq.row_mut(row);
            d_row.assign(&log_probs.mapv(f32::exp));
            d_row[label] -= 1.0;
        }

        let scale = 1.0 / frames.max(1) as f32;
        let d_logits = nonseq2seq(
            (d_nonseq * scale).view(),
            &logits.seq_length,
            logits.values.shape()[1],
        )?;

        Ok(LossGrad {
            loss: loss * scale,
            d_logits,
        })
    }

    fn validation_output(&self, logits: &Logits) -> Result<ValidationOutput, MlError> {
        let mut probs = logits.values.clone();
        for mut frame in probs.rows_mut() {
            let log_probs = log_softmax(frame.view());
            frame.assign(&log_probs.mapv(f32::exp));
        }

        Ok(ValidationOutput::Probabilities(probs))
    }

    fn validation_metric(
        &self,
        outputs: &ValidationOutput,
        targets: &[Array1<i32>],
    ) -> Result<Vec<f32>, MlError> {
        let ValidationOutput::Probabilities(probs) = outputs else {
            return Err(MlError::InvalidInput(
                "cross-entropy scoring needs label probabilities",
            ));
        };

        if targets.len() > probs.shape()[0] {
            return Err(MlError::ShapeMismatch {
                what: "utterances",
                got: targets.len(),
                expected: probs.shape()[0],
            });
        }

        let dim = probs.shape()[2];
        let mut errors = Vec::with_capacity(targets.len());

        for (utt, target) in targets.iter().enumerate() {
            if target.len() > probs.shape()[1] {
                return Err(MlError::ShapeMismatch {
                    what: "target length",
                    got: target.len(),
                    expected: probs.shape()[1],
                });
            }

            let mut loss = 0.0;
            for (t, &label) in target.iter().enumerate() {
                let label = usize::try_from(label).ok().filter(|&l| l < dim).ok_or(
                    MlError::InvalidInput("target label is outside the logit dimension"),
                )?;

                loss -= probs[[utt, t, label]].ln();
            }

            errors.push(loss / target.len().max(1) as f32);
        }

        Ok(errors)
    }
}
