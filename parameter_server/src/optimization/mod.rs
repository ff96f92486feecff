//! Parameter-update strategies applied to the hosted shard.

mod adam;
mod sgd;

use std::fmt;

pub use adam::Adam;
pub use sgd::Sgd;

/// Error for a gradient that does not match the shard size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeMismatchErr;

impl fmt::Display for SizeMismatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gradient and parameter sizes do not match")
    }
}

impl std::error::Error for SizeMismatchErr {}

pub type Result<T> = std::result::Result<T, SizeMismatchErr>;

/// Defines the strategy for updating shard parameters from an aggregated
/// gradient.
///
/// The learning rate is passed per update because the schedule (and the
/// chief-halved factor) changes it between steps.
pub trait Optimizer: Send {
    /// Updates the provided parameters in place.
    ///
    /// # Arguments
    /// * `learning_rate` - The step size for this update.
    /// * `grad` - The aggregated gradient.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error when `grad` and `params` sizes differ.
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32])
        -> Result<()>;
}
