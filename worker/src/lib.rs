//! The training driver.
//!
//! A worker owns the local half of distributed training: it builds the
//! training graph (classifier, strategy, shard layout), coordinates with
//! the parameter servers through typed protocol clients, runs the step loop
//! with the reader-exclusion discipline, and on the chief drives
//! validation, learning-rate control, summaries and checkpoints.

pub mod checkpoint;
mod client;
pub mod data;
mod error;
mod graph;
mod local;
mod summary;
mod trainer;

pub use client::PsClient;
pub use error::{Result, TrainerErr};
pub use graph::TrainGraph;
pub use local::{LocalBarrier, LocalClient, LocalSession};
pub use summary::SummaryWriter;
pub use trainer::Trainer;
