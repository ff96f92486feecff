use super::{Optimizer, Result, SizeMismatchErr};

/// Plain gradient descent; useful where update arithmetic must stay
/// predictable.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sgd;

impl Optimizer for Sgd {
    fn update_params(
        &mut self,
        learning_rate: f32,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<()> {
        if grad.len() != params.len() {
            return Err(SizeMismatchErr);
        }

        params
            .iter_mut()
            .zip(grad)
            .for_each(|(p, g)| *p -= learning_rate * g);

        Ok(())
    }
}
