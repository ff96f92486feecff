use super::{Optimizer, Result, SizeMismatchErr};

/// Adam with bias correction; the step size comes from the schedule at
/// every update.
#[derive(Debug)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization
    ///   algorithm.
    pub fn new(len: usize, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }

    /// Adam with the usual defaults.
    pub fn with_defaults(len: usize) -> Self {
        Self::new(len, 0.9, 0.999, 1e-8)
    }
}

impl Optimizer for Adam {
    fn update_params(
        &mut self,
        learning_rate: f32,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<()> {
        if grad.len() != params.len() || grad.len() != self.v.len() {
            return Err(SizeMismatchErr);
        }

        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = learning_rate * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_first_step_moves_against_the_gradient() {
        let mut adam = Adam::with_defaults(3);
        let mut params = [0.0, 1.0, -1.0];

        adam.update_params(0.1, &[1.0, -1.0, 0.5], &mut params).unwrap();

        // With bias correction the first update has magnitude ~lr.
        assert!(params[0] < 0.0);
        assert!(params[1] > 1.0);
        assert!(params[2] < -1.0);
        assert!((params[0] + 0.1).abs() < 1e-3);
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let mut adam = Adam::with_defaults(2);
        let mut params = [0.0, 0.0];

        assert_eq!(
            adam.update_params(0.1, &[1.0], &mut params),
            Err(SizeMismatchErr)
        );
    }
}
