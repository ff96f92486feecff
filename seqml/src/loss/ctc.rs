//! Connectionist Temporal Classification.
//!
//! The loss marginalizes over all alignments between the logit frames and
//! the (shorter) label sequence, with the last logit dimension reserved for
//! the blank. Training uses the log-space forward-backward recursion;
//! validation decodes with a prefix beam search and scores the label error
//! rate.

use std::collections::HashMap;

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3};

use crate::{
    loss::{log_softmax, LossGrad, LossStrategy, ValidationOutput},
    Logits, MlError,
};

/// The CTC strategy.
#[derive(Debug, Clone, Copy)]
pub struct Ctc {
    beam_width: usize,
}

impl Ctc {
    /// Creates a new CTC strategy.
    ///
    /// # Arguments
    /// * `beam_width` - The decoding beam width, at least 1.
    pub fn new(beam_width: usize) -> Result<Self, MlError> {
        if beam_width == 0 {
            return Err(MlError::InvalidInput("the beam width must be at least 1"));
        }

        Ok(Self { beam_width })
    }
}

fn lse(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        b
    } else if b == f64::NEG_INFINITY {
        a
    } else {
        let m = a.max(b);
        m + ((a - m).exp() + (b - m).exp()).ln()
    }
}

/// The extended label sequence interleaves blanks around the labels:
/// even positions are blank, odd positions are labels.
fn extended(labels: &[usize], blank: usize, s: usize) -> usize {
    if s % 2 == 0 {
        blank
    } else {
        labels[s / 2]
    }
}

/// Log-probabilities for the valid frames of one utterance, as f64 rows.
fn utterance_log_probs(frames: ArrayView2<'_, f32>) -> Array2<f64> {
    let mut lp = Array2::zeros(frames.raw_dim());
    for (t, row) in frames.rows().into_iter().enumerate() {
        lp.row_mut(t).assign(&log_softmax(row).mapv(f64::from));
    }
    lp
}

impl LossStrategy for Ctc {
    fn compute_loss(
        &self,
        targets: ArrayView3<'_, i32>,
        logits: &Logits,
        target_seq_length: &[usize],
    ) -> Result<LossGrad, MlError> {
        let (batch_size, t_max, dim) = logits.values.dim();
        if dim < 2 {
            return Err(MlError::InvalidInput(
                "CTC needs at least one real label besides the blank",
            ));
        }
        if target_seq_length.len() != batch_size || logits.seq_length.len() != batch_size {
            return Err(MlError::ShapeMismatch {
                what: "lengths",
                got: target_seq_length.len().min(logits.seq_length.len()),
                expected: batch_size,
            });
        }
        if targets.shape()[0] != batch_size {
            return Err(MlError::ShapeMismatch {
                what: "targets",
                got: targets.shape()[0],
                expected: batch_size,
            });
        }

        let blank = dim - 1;
        let mut total = 0.0_f64;
        let mut d_logits = Array3::<f32>::zeros((batch_size, t_max, dim));

        for b in 0..batch_size {
            let t_len = logits.seq_length[b];
            let u_len = target_seq_length[b];

            if t_len == 0 || t_len > t_max {
                return Err(MlError::ShapeMismatch {
                    what: "logit length",
                    got: t_len,
                    expected: t_max,
                });
            }
            if u_len > targets.shape()[1] {
                return Err(MlError::ShapeMismatch {
                    what: "target length",
                    got: u_len,
                    expected: targets.shape()[1],
                });
            }

            let labels: Vec<usize> = (0..u_len)
                .map(|k| {
                    usize::try_from(targets[[b, k, 0]])
                        .ok()
                        .filter(|&l| l < blank)
                        .ok_or(MlError::InvalidInput(
                            "target label collides with the blank or is negative",
                        ))
                })
                .collect::<Result<_, _>>()?;

            let lp = utterance_log_probs(logits.values.slice(s![b, ..t_len, ..]));
            let states = 2 * u_len + 1;

            // Forward pass, probabilities up to and including frame t.
            let mut alpha = Array2::from_elem((t_len, states), f64::NEG_INFINITY);
            alpha[[0, 0]] = lp[[0, blank]];
            if states > 1 {
                alpha[[0, 1]] = lp[[0, extended(&labels, blank, 1)]];
            }

            for t in 1..t_len {
                for state in 0..states {
                    let symbol = extended(&labels, blank, state);
                    let mut a = alpha[[t - 1, state]];

                    if state >= 1 {
                        a = lse(a, alpha[[t - 1, state - 1]]);
                    }
                    if state >= 2
                        && symbol != blank
                        && symbol != extended(&labels, blank, state - 2)
                    {
                        a = lse(a, alpha[[t - 1, state - 2]]);
                    }

                    alpha[[t, state]] = a + lp[[t, symbol]];
                }
            }

            let mut log_p = alpha[[t_len - 1, states - 1]];
            if states > 1 {
                log_p = lse(log_p, alpha[[t_len - 1, states - 2]]);
            }

            if !log_p.is_finite() {
                return Err(MlError::InvalidInput(
                    "no valid alignment between the inputs and the targets",
                ));
            }

            // Backward pass, probabilities from frame t on, including t.
            let mut beta = Array2::from_elem((t_len, states), f64::NEG_INFINITY);
            beta[[t_len - 1, states - 1]] = lp[[t_len - 1, extended(&labels, blank, states - 1)]];
            if states > 1 {
                beta[[t_len - 1, states - 2]] =
                    lp[[t_len - 1, extended(&labels, blank, states - 2)]];
            }

            for t in (0..t_len.saturating_sub(1)).rev() {
                for state in 0..states {
                    let symbol = extended(&labels, blank, state);
                    let mut v = beta[[t + 1, state]];

                    if state + 1 < states {
                        v = lse(v, beta[[t + 1, state + 1]]);
                    }
                    if state + 2 < states
                        && symbol != blank
                        && symbol != extended(&labels, blank, state + 2)
                    {
                        v = lse(v, beta[[t + 1, state + 2]]);
                    }

                    beta[[t, state]] = v + lp[[t, symbol]];
                }
            }

            total -= log_p;

            // d loss / d logit = softmax - alignment posterior; alpha and
            // beta both include frame t, so one emission term is divided
            // back out.
            for t in 0..t_len {
                let mut occupancy = vec![f64::NEG_INFINITY; dim];
                for state in 0..states {
                    let symbol = extended(&labels, blank, state);
                    occupancy[symbol] =
                        lse(occupancy[symbol], alpha[[t, state]] + beta[[t, state]]);
                }

                for k in 0..dim {
                    let softmax = lp[[t, k]].exp();
                    let posterior = if occupancy[k] == f64::NEG_INFINITY {
                        0.0
                    } else {
                        (occupancy[k] - log_p - lp[[t, k]]).exp()
                    };

                    d_logits[[b, t, k]] = ((softmax - posterior) / batch_size as f64) as f32;
                }
            }
        }

        Ok(LossGrad {
            loss: (total / batch_size as f64) as f32,
            d_logits,
        })
    }

    fn validation_output(&self, logits: &Logits) -> Result<ValidationOutput, MlError> {
        let (batch_size, t_max, dim) = logits.values.dim();
        if dim < 2 {
            return Err(MlError::InvalidInput(
                "CTC needs at least one real label besides the blank",
            ));
        }

        let blank = dim - 1;

        // Time-major view, the layout the decoder walks.
        let time_major = logits.values.view().permuted_axes([1, 0, 2]);

        let mut decoded = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let t_len = logits.seq_length[b];
            if t_len > t_max {
                return Err(MlError::ShapeMismatch {
                    what: "logit length",
                    got: t_len,
                    expected: t_max,
                });
            }

            let frames = time_major.slice(s![..t_len, b, ..]);
            let lp = utterance_log_probs(frames);
            decoded.push(beam_search(lp.view(), blank, self.beam_width));
        }

        let max_len = decoded.iter().map(Vec::len).max().unwrap_or(0);
        let mut dense = Array2::from_elem((batch_size, max_len), -1);
        for (b, labels) in decoded.iter().enumerate() {
            for (k, &label) in labels.iter().enumerate() {
                dense[[b, k]] = label;
            }
        }

        Ok(ValidationOutput::Labels(dense))
    }

    fn validation_metric(
        &self,
        outputs: &ValidationOutput,
        targets: &[Array1<i32>],
    ) -> Result<Vec<f32>, MlError> {
        let ValidationOutput::Labels(dense) = outputs else {
            return Err(MlError::InvalidInput(
                "label-error-rate scoring needs decoded labels",
            ));
        };

        if targets.len() > dense.nrows() {
            return Err(MlError::ShapeMismatch {
                what: "utterances",
                got: targets.len(),
                expected: dense.nrows(),
            });
        }

        let mut errors = Vec::with_capacity(targets.len());
        for (utt, target) in targets.iter().enumerate() {
            if target.is_empty() {
                return Err(MlError::InvalidInput("empty reference transcription"));
            }

            let decoded: Vec<i32> = dense
                .row(utt)
                .iter()
                .copied()
                .filter(|&l| l != -1)
                .collect();

            let distance = levenshtein(&decoded, target.as_slice().unwrap_or(&[]));
            errors.push(distance as f32 / target.len() as f32);
        }

        Ok(errors)
    }
}

/// CTC prefix beam search over the log-probabilities of one utterance.
///
/// Beams carry separate mass for "ends in blank" and "ends in its last
/// label" so repeats collapse correctly.
fn beam_search(log_probs: ArrayView2<'_, f64>, blank: usize, width: usize) -> Vec<i32> {
    let dim = log_probs.ncols();
    let mut beams: Vec<(Vec<i32>, (f64, f64))> =
        vec![(Vec::new(), (0.0, f64::NEG_INFINITY))];

    for t in 0..log_probs.nrows() {
        let mut next: HashMap<Vec<i32>, (f64, f64)> = HashMap::new();

        for (prefix, (p_blank, p_label)) in &beams {
            let p_total = lse(*p_blank, *p_label);

            for k in 0..dim {
                let p = log_probs[[t, k]];

                if k == blank {
                    let entry = next
                        .entry(prefix.clone())
                        .or_insert((f64::NEG_INFINITY, f64::NEG_INFINITY));
                    entry.0 = lse(entry.0, p_total + p);
                    continue;
                }

                let label = k as i32;
                if prefix.last() == Some(&label) {
                    // The bare repeat collapses into the prefix; only a
                    // blank-separated emission extends it.
                    let entry = next
                        .entry(prefix.clone())
                        .or_insert((f64::NEG_INFINITY, f64::NEG_INFINITY));
                    entry.1 = lse(entry.1, p_label + p);

                    let mut ext = prefix.clone();
                    ext.push(label);
                    let entry = next
                        .entry(ext)
                        .or_insert((f64::NEG_INFINITY, f64::NEG_INFINITY));
                    entry.1 = lse(entry.1, p_blank + p);
                } else {
                    let mut ext = prefix.clone();
                    ext.push(label);
                    let entry = next
                        .entry(ext)
                        .or_insert((f64::NEG_INFINITY, f64::NEG_INFINITY));
                    entry.1 = lse(entry.1, p_total + p);
                }
            }
        }

        let mut pruned: Vec<(Vec<i32>, (f64, f64))> = next.into_iter().collect();
        pruned.sort_by(|a, b| {
            lse(b.1 .0, b.1 .1)
                .partial_cmp(&lse(a.1 .0, a.1 .1))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        pruned.truncate(width);
        beams = pruned;
    }

    beams
        .into_iter()
        .next()
        .map(|(prefix, _)| prefix)
        .unwrap_or_default()
}

/// Edit distance with unit substitution, insertion and deletion costs.
fn levenshtein(a: &[i32], b: &[i32]) -> usize {
    let mut row: Vec<usize> = (0..=a.len()).collect();

    for (j, &bj) in b.iter().enumerate() {
        let mut previous_diagonal = row[0];
        row[0] = j + 1;

        for (i, &ai) in a.iter().enumerate() {
            let substitution = previous_diagonal + usize::from(ai != bj);
            previous_diagonal = row[i + 1];
            row[i + 1] = substitution.min(row[i] + 1).min(previous_diagonal + 1);
        }
    }

    row[a.len()]
}
