//! The batch dispenser seam.
//!
//! Feature pipelines live behind `BatchDispenser`; the driver only needs a
//! resumable cursor and padded-ready mini-batches. The in-memory
//! implementation backs tests, demos and small corpora.

use ndarray::{Array1, Array2};

use crate::MlError;

/// One mini-batch of utterances: time-major feature matrices and their
/// label vectors, unpadded.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub inputs: Vec<Array2<f32>>,
    pub targets: Vec<Array1<i32>>,
}

impl Batch {
    /// The number of utterances in the batch.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// The frame count per utterance.
    pub fn input_seq_length(&self) -> Vec<usize> {
        self.inputs.iter().map(|i| i.nrows()).collect()
    }

    /// The label count per utterance.
    pub fn target_seq_length(&self) -> Vec<usize> {
        self.targets.iter().map(|t| t.len()).collect()
    }
}

/// A stateful iterator over a corpus, producing mini-batches and advancing
/// a position cursor measured in utterances.
///
/// The cursor is shared across workers through the control plane: the
/// driver seeds it with `set_pos` before reading and publishes the advanced
/// value afterwards.
pub trait BatchDispenser: Send {
    /// The batch size B.
    fn size(&self) -> usize;

    /// The number of batches in one epoch; fractional when the corpus size
    /// is not a multiple of B.
    fn num_batches(&self) -> f32;

    /// The current cursor.
    fn pos(&self) -> usize;

    /// Moves the cursor.
    fn set_pos(&mut self, pos: usize);

    /// Reads the next B utterances, wrapping at the end of the corpus.
    fn get_batch(&mut self) -> Result<Batch, MlError>;

    /// Reads up to B utterances without wrapping; the final batch of a pass
    /// may be short and reads at the end yield an empty batch.
    fn get_batch_stop_at_end(&mut self) -> Result<Batch, MlError>;
}

/// A dispenser over an in-memory corpus.
pub struct MemoryDispenser {
    utterances: Vec<(Array2<f32>, Array1<i32>)>,
    batch_size: usize,
    pos: usize,
}

impl MemoryDispenser {
    /// Creates a new `MemoryDispenser`.
    ///
    /// # Arguments
    /// * `utterances` - The corpus: one (features, labels) pair per utterance.
    /// * `batch_size` - The batch size B.
    ///
    /// # Errors
    /// `MlError::InvalidInput` on an empty corpus or a zero batch size.
    pub fn new(
        utterances: Vec<(Array2<f32>, Array1<i32>)>,
        batch_size: usize,
    ) -> Result<Self, MlError> {
        if utterances.is_empty() {
            return Err(MlError::InvalidInput("the corpus is empty"));
        }
        if batch_size == 0 {
            return Err(MlError::InvalidInput("the batch size must be positive"));
        }

        Ok(Self {
            utterances,
            batch_size,
            pos: 0,
        })
    }
}

impl BatchDispenser for MemoryDispenser {
    fn size(&self) -> usize {
        self.batch_size
    }

    fn num_batches(&self) -> f32 {
        self.utterances.len() as f32 / self.batch_size as f32
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn set_pos(&mut self, pos: usize) {
        self.pos = pos % self.utterances.len();
    }

    fn get_batch(&mut self) -> Result<Batch, MlError> {
        let n = self.utterances.len();
        let mut batch = Batch::default();

        for i in 0..self.batch_size {
            let (input, target) = &self.utterances[(self.pos + i) % n];
            batch.inputs.push(input.clone());
            batch.targets.push(target.clone());
        }

        self.pos = (self.pos + self.batch_size) % n;
        Ok(batch)
    }

    fn get_batch_stop_at_end(&mut self) -> Result<Batch, MlError> {
        let n = self.utterances.len();
        let count = self.batch_size.min(n.saturating_sub(self.pos));
        let mut batch = Batch::default();

        for (input, target) in &self.utterances[self.pos..self.pos + count] {
            batch.inputs.push(input.clone());
            batch.targets.push(target.clone());
        }

        self.pos += count;
        Ok(batch)
    }
}
