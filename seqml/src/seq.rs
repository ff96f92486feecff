//! Conversions between the padded "sequence" view of a batch and the
//! concatenated "non-sequence" view.
//!
//! The padded view stacks every utterance to a fixed time length so a batch
//! is one dense tensor; the non-sequence view concatenates only the real
//! frames in batch order. Losses that treat frames independently work on the
//! non-sequence view, and their gradients are scattered back to the padded
//! view with `nonseq2seq`.

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayView3, Axis};
use num_traits::Zero;

use crate::MlError;

/// Pads every sequence along its leading (time) axis with zero rows to
/// exactly `length`, stacking the batch into one `[B, length, F]` tensor.
///
/// # Arguments
/// * `seqs` - The time-major sequences, one `[T_i, F]` matrix per utterance.
/// * `length` - The padded time length; every `T_i` must be `<= length`.
///
/// # Returns
/// The padded batch, or a shape error when a sequence is too long or the
/// feature dimensions disagree.
pub fn pad<A>(seqs: &[Array2<A>], length: usize) -> Result<Array3<A>, MlError>
where
    A: Clone + Zero,
{
    let dim = seqs.first().map(|s| s.ncols()).unwrap_or_default();
    let mut padded = Array3::zeros((seqs.len(), length, dim));

    for (i, seq) in seqs.iter().enumerate() {
        if seq.nrows() > length {
            return Err(MlError::ShapeMismatch {
                what: "sequence length",
                got: seq.nrows(),
                expected: length,
            });
        }
        if seq.ncols() != dim {
            return Err(MlError::ShapeMismatch {
                what: "feature dimension",
                got: seq.ncols(),
                expected: dim,
            });
        }

        padded
            .slice_mut(s![i, ..seq.nrows(), ..])
            .assign(&seq.view());
    }

    Ok(padded)
}

/// Pads label vectors to `[B, length, 1]`, the shape the targets feed takes.
///
/// # Arguments
/// * `seqs` - One label vector per utterance.
/// * `length` - The padded target length.
pub fn pad_labels(seqs: &[Array1<i32>], length: usize) -> Result<Array3<i32>, MlError> {
    let columns: Vec<Array2<i32>> = seqs
        .iter()
        .map(|s| s.clone().insert_axis(Axis(1)))
        .collect();

    pad(&columns, length)
}

/// Concatenates the first `lengths[i]` rows of batch element i, in batch
/// order, discarding padding.
///
/// # Arguments
/// * `padded` - A `[B, T, F]` padded batch.
/// * `lengths` - The true time length of every batch element.
///
/// # Returns
/// The `[sum(lengths), F]` non-sequence view.
pub fn seq2nonseq<A>(padded: ArrayView3<A>, lengths: &[usize]) -> Result<Array2<A>, MlError>
where
    A: Clone + Zero,
{
    if lengths.len() != padded.shape()[0] {
        return Err(MlError::ShapeMismatch {
            what: "lengths",
            got: lengths.len(),
            expected: padded.shape()[0],
        });
    }

    let total: usize = lengths.iter().sum();
    let dim = padded.shape()[2];
    let mut nonseq = Array2::zeros((total, dim));

    let mut row = 0;
    for (i, &len) in lengths.iter().enumerate() {
        if len > padded.shape()[1] {
            return Err(MlError::ShapeMismatch {
                what: "sequence length",
                got: len,
                expected: padded.shape()[1],
            });
        }

        nonseq
            .slice_mut(s![row..row + len, ..])
            .assign(&padded.slice(s![i, ..len, ..]));
        row += len;
    }

    Ok(nonseq)
}

/// Restores the padded `[B, length, F]` shape from a non-sequence view,
/// zero-filling the padding rows. Inverse of `seq2nonseq`.
///
/// # Arguments
/// * `nonseq` - The `[sum(lengths), F]` concatenated frames.
/// * `lengths` - The true time length of every batch element.
/// * `length` - The padded time length to restore.
pub fn nonseq2seq<A>(
    nonseq: ArrayView2<A>,
    lengths: &[usize],
    length: usize,
) -> Result<Array3<A>, MlError>
where
    A: Clone + Zero,
{
    let total: usize = lengths.iter().sum();
    if nonseq.nrows() != total {
        return Err(MlError::ShapeMismatch {
            what: "frames",
            got: nonseq.nrows(),
            expected: total,
        });
    }

    let mut padded = Array3::zeros((lengths.len(), length, nonseq.ncols()));

    let mut row = 0;
    for (i, &len) in lengths.iter().enumerate() {
        if len > length {
            return Err(MlError::ShapeMismatch {
                what: "sequence length",
                got: len,
                expected: length,
            });
        }

        padded
            .slice_mut(s![i, ..len, ..])
            .assign(&nonseq.slice(s![row..row + len, ..]));
        row += len;
    }

    Ok(padded)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn pad_preserves_the_prefix_and_zero_fills() {
        let seqs = vec![array![[1.0, 2.0], [3.0, 4.0]], array![[5.0, 6.0]]];
        let padded = pad(&seqs, 3).unwrap();

        assert_eq!(padded.shape(), [2, 3, 2]);
        assert_eq!(padded.slice(s![0, ..2, ..]), seqs[0]);
        assert_eq!(padded.slice(s![1, ..1, ..]), seqs[1]);
        assert!(padded.slice(s![0, 2.., ..]).iter().all(|&v| v == 0.0));
        assert!(padded.slice(s![1, 1.., ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn pad_rejects_too_long_sequences() {
        let seqs = vec![array![[1.0], [2.0], [3.0]]];
        assert!(pad(&seqs, 2).is_err());
    }

    #[test]
    fn seq2nonseq_concatenates_in_batch_order() {
        let seqs = vec![array![[1.0], [2.0], [3.0]], array![[4.0], [5.0]]];
        let lengths = [3, 2];

        let padded = pad(&seqs, 4).unwrap();
        let nonseq = seq2nonseq(padded.view(), &lengths).unwrap();

        assert_eq!(nonseq, array![[1.0], [2.0], [3.0], [4.0], [5.0]]);
    }

    #[test]
    fn nonseq2seq_round_trips() {
        let seqs = vec![array![[1.0, -1.0], [2.0, -2.0]], array![[3.0, -3.0]]];
        let lengths = [2, 1];

        let padded = pad(&seqs, 5).unwrap();
        let nonseq = seq2nonseq(padded.view(), &lengths).unwrap();
        let restored = nonseq2seq(nonseq.view(), &lengths, 5).unwrap();

        assert_eq!(restored, padded);
    }

    #[test]
    fn labels_pad_to_a_trailing_singleton_axis() {
        let targets = vec![array![1, 2, 3], array![4]];
        let padded = pad_labels(&targets, 4).unwrap();

        assert_eq!(padded.shape(), [2, 4, 1]);
        assert_eq!(padded[[0, 2, 0]], 3);
        assert_eq!(padded[[1, 0, 0]], 4);
        assert_eq!(padded[[1, 3, 0]], 0);
    }
}
