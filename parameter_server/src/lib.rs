//! The parameter-server side of the training system.
//!
//! A parameter server hosts one contiguous shard of the flat model
//! parameters, a replica of the learning-rate schedule state, and, on the
//! chief server (task 0), the control-plane variables the workers
//! coordinate through. Workers talk to it over the `comms` protocol; the
//! service is passive and serves every connection independently.

mod control;
mod done;
pub mod optimization;
mod service;
mod state;
mod store;
mod sync;

pub use control::ControlStore;
pub use done::{done_queue, DoneQueue, DoneWaiter};
pub use service::serve;
pub use state::{OptimizerKind, ServerConfig, ServerState, StateErr};
pub use store::{ShardErr, ShardStore};
pub use sync::SyncGate;
