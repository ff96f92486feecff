//! Sequence-model building blocks for the training driver.
//!
//! This crate holds everything the driver needs that is about *models and
//! data* rather than about distribution: padding and sequence/non-sequence
//! conversions, the loss/decoding strategies (frame cross-entropy and CTC),
//! the classifier seam behind which model architectures live, and the batch
//! dispenser seam behind which feature pipelines live.

mod classifier;
mod dispenser;
mod error;
pub mod loss;
pub mod seq;

pub use classifier::{encoder_factory, Classifier, DnnClassifier, Logits, ParamBlock};
pub use dispenser::{Batch, BatchDispenser, MemoryDispenser};
pub use error::MlError;
