//! The classifier seam.
//!
//! The driver treats the acoustic model as a black box that maps padded
//! input batches to logits and loss-gradients to flat parameter gradients.
//! Architectures live behind the `Classifier` trait; the factory resolves
//! the configured encoder kind and fails fast on an unknown one.

use ndarray::{Array1, Array2, Array3, ArrayView3, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    seq::{nonseq2seq, seq2nonseq},
    MlError,
};

/// Output of a classifier forward pass: logits for every padded frame and
/// the per-utterance logit sequence lengths.
#[derive(Debug, Clone)]
pub struct Logits {
    /// `[B, T, D]` unnormalized label scores.
    pub values: Array3<f32>,
    /// The number of valid logit frames per utterance.
    pub seq_length: Vec<usize>,
}

/// A named contiguous block of the flat parameter vector, used for
/// checkpoints and per-parameter summaries.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub name: String,
    pub len: usize,
}

/// Abstraction over the trainable acoustic model.
///
/// The training and validation passes run against the same instance, so
/// both observe the same parameters (the reuse discipline of the classifier
/// interface). Implementations keep their parameters as a flat f32 vector
/// that the driver exchanges with the parameter servers.
pub trait Classifier: Send {
    /// The total flat parameter count.
    fn num_params(&self) -> usize;

    /// The named blocks tiling the flat parameter vector, in order.
    fn param_layout(&self) -> Vec<ParamBlock>;

    /// A copy of the flat parameter vector.
    fn params(&self) -> Vec<f32>;

    /// Overwrites the parameters from a flat vector.
    ///
    /// # Errors
    /// `MlError::ShapeMismatch` when the length differs from `num_params`.
    fn set_params(&mut self, flat: &[f32]) -> Result<(), MlError>;

    /// Computes logits for a padded input batch.
    ///
    /// # Arguments
    /// * `inputs` - `[B, T, F]` padded features.
    /// * `input_seq_length` - The true frame count per utterance.
    /// * `is_training` - Enables training-only behavior where the
    ///   architecture has any.
    fn forward(
        &self,
        inputs: ArrayView3<'_, f32>,
        input_seq_length: &[usize],
        is_training: bool,
    ) -> Result<Logits, MlError>;

    /// Backpropagates a loss gradient through the model.
    ///
    /// # Arguments
    /// * `inputs` - The same padded batch that produced the logits.
    /// * `input_seq_length` - The true frame count per utterance.
    /// * `d_logits` - `[B, T, D]` loss gradient, zero on padding frames.
    ///
    /// # Returns
    /// The gradient w.r.t. the flat parameter vector.
    fn backward(
        &self,
        inputs: ArrayView3<'_, f32>,
        input_seq_length: &[usize],
        d_logits: ArrayView3<'_, f32>,
    ) -> Result<Vec<f32>, MlError>;
}

/// Creates a classifier from the configured encoder kind.
///
/// # Arguments
/// * `encoder` - The encoder kind name.
/// * `input_dim` - The feature dimension F.
/// * `hidden_units` - The hidden layer width.
/// * `num_labels` - The output dimension D.
/// * `seed` - Seed for the weight initialization.
///
/// # Errors
/// `MlError::Unknown` for an undefined encoder kind.
pub fn encoder_factory(
    encoder: &str,
    input_dim: usize,
    hidden_units: usize,
    num_labels: usize,
    seed: u64,
) -> Result<Box<dyn Classifier>, MlError> {
    match encoder {
        "dnn" => Ok(Box::new(DnnClassifier::new(
            input_dim,
            hidden_units,
            num_labels,
            seed,
        ))),
        other => Err(MlError::Unknown {
            what: "encoder type",
            got: other.to_string(),
        }),
    }
}

/// A frame-wise feedforward classifier with one sigmoid hidden layer.
///
/// Every valid frame is mapped independently; the logit sequence lengths
/// equal the input sequence lengths.
pub struct DnnClassifier {
    input_dim: usize,
    hidden_units: usize,
    num_labels: usize,
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

impl DnnClassifier {
    /// Creates a new classifier with uniformly initialized weights scaled
    /// by the inverse square root of the fan-in.
    pub fn new(input_dim: usize, hidden_units: usize, num_labels: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let s1 = 1.0 / (input_dim.max(1) as f32).sqrt();
        let s2 = 1.0 / (hidden_units.max(1) as f32).sqrt();

        Self {
            input_dim,
            hidden_units,
            num_labels,
            w1: Array2::from_shape_fn((input_dim, hidden_units), |_| rng.random_range(-s1..s1)),
            b1: Array1::zeros(hidden_units),
            w2: Array2::from_shape_fn((hidden_units, num_labels), |_| rng.random_range(-s2..s2)),
            b2: Array1::zeros(num_labels),
        }
    }

    /// The flattened frames and hidden activations for a batch.
    fn activations(
        &self,
        inputs: ArrayView3<'_, f32>,
        input_seq_length: &[usize],
    ) -> Result<(Array2<f32>, Array2<f32>), MlError> {
        if inputs.shape()[2] != self.input_dim {
            return Err(MlError::ShapeMismatch {
                what: "input dimension",
                got: inputs.shape()[2],
                expected: self.input_dim,
            });
        }

        let frames = seq2nonseq(inputs, input_seq_length)?;
        let hidden = (frames.dot(&self.w1) + &self.b1).mapv(sigmoid);

        Ok((frames, hidden))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Classifier for DnnClassifier {
    fn num_params(&self) -> usize {
        self.param_layout().iter().map(|b| b.len).sum()
    }

    fn param_layout(&self) -> Vec<ParamBlock> {
        let Self {
            input_dim,
            hidden_units,
            num_labels,
            ..
        } = *self;

        vec![
            ParamBlock {
                name: "layer0/weights".to_string(),
                len: input_dim * hidden_units,
            },
            ParamBlock {
                name: "layer0/bias".to_string(),
                len: hidden_units,
            },
            ParamBlock {
                name: "output/weights".to_string(),
                len: hidden_units * num_labels,
            },
            ParamBlock {
                name: "output/bias".to_string(),
                len: num_labels,
            },
        ]
    }

    fn params(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.num_params());
        flat.extend(self.w1.iter());
        flat.extend(self.b1.iter());
        flat.extend(self.w2.iter());
        flat.extend(self.b2.iter());
        flat
    }

    fn set_params(&mut self, flat: &[f32]) -> Result<(), MlError> {
        if flat.len() != self.num_params() {
            return Err(MlError::ShapeMismatch {
                what: "params",
                got: flat.len(),
                expected: self.num_params(),
            });
        }

        let mut offset = 0;
        let mut take = |len: usize| {
            let chunk = &flat[offset..offset + len];
            offset += len;
            chunk.to_vec()
        };

        let (f, h, d) = (self.input_dim, self.hidden_units, self.num_labels);

        // The shapes are consistent with num_params, from_shape_vec cannot
        // fail here.
        self.w1 = Array2::from_shape_vec((f, h), take(f * h)).unwrap();
        self.b1 = Array1::from_vec(take(h));
        self.w2 = Array2::from_shape_vec((h, d), take(h * d)).unwrap();
        self.b2 = Array1::from_vec(take(d));

        Ok(())
    }

    fn forward(
        &self,
        inputs: ArrayView3<'_, f32>,
        input_seq_length: &[usize],
        _is_training: bool,
    ) -> Result<Logits, MlError> {
        let (_, hidden) = self.activations(inputs, input_seq_length)?;
        let logits = hidden.dot(&self.w2) + &self.b2;

        Ok(Logits {
            values: nonseq2seq(logits.view(), input_seq_length, inputs.shape()[1])?,
            seq_length: input_seq_length.to_vec(),
        })
    }

    fn backward(
        &self,
        inputs: ArrayView3<'_, f32>,
        input_seq_length: &[usize],
        d_logits: ArrayView3<'_, f32>,
    ) -> Result<Vec<f32>, MlError> {
        let (frames, hidden) = self.activations(inputs, input_seq_length)?;
        let d_out = seq2nonseq(d_logits, input_seq_length)?;

        if d_out.nrows() != hidden.nrows() {
            return Err(MlError::ShapeMismatch {
                what: "frames",
                got: d_out.nrows(),
                expected: hidden.nrows(),
            });
        }

        let d_w2 = hidden.t().dot(&d_out);
        let d_b2 = d_out.sum_axis(Axis(0));

        let d_hidden = d_out.dot(&self.w2.t()) * &hidden * (1.0 - &hidden);
        let d_w1 = frames.t().dot(&d_hidden);
        let d_b1 = d_hidden.sum_axis(Axis(0));

        let mut flat = Vec::with_capacity(self.num_params());
        flat.extend(d_w1.iter());
        flat.extend(d_b1.iter());
        flat.extend(d_w2.iter());
        flat.extend(d_b2.iter());
        Ok(flat)
    }
}
