use rayon::prelude::*;

use super::Optimizer;
use crate::mat::{DistMat, MatElem, MatError, Result};

/// Stochastic Gradient Descent, with optional momentum.
///
/// Without momentum: `w = w - lr * g`.
/// With momentum `μ`: `v = μ v - lr * g; w = w + v`.
pub struct Sgd<T: MatElem> {
    pub learning_rate: T,
    pub momentum: T,
    velocity: Vec<T>,
}

impl<T: MatElem> Sgd<T> {
    pub fn new(learning_rate: T) -> Self {
        Self {
            learning_rate,
            momentum: T::zero(),
            velocity: Vec::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: T) -> Self {
        self.momentum = momentum;
        self
    }
}

impl<T: MatElem> Optimizer<T> for Sgd<T> {
    fn setup(&mut self, input_width: usize, output_width: usize) {
        self.velocity = vec![T::zero(); input_width * output_width];
    }

    fn update_weight_bias_matrix(
        &mut self,
        gradient: &DistMat<T>,
        weights: &mut DistMat<T>,
    ) -> Result<()> {
        if !gradient.same_shape(weights) || gradient.local().len() != weights.local().len() {
            return Err(MatError::ShapeMismatch {
                expected: vec![weights.height(), weights.width()],
                got: vec![gradient.height(), gradient.width()],
            });
        }
        if self.velocity.len() != weights.local().len() {
            // Tolerate a missed `setup` by sizing lazily.
            self.velocity = vec![T::zero(); weights.local().len()];
        }

        let lr = self.learning_rate;
        let momentum = self.momentum;

        if momentum == T::zero() {
            weights
                .local_mut()
                .par_iter_mut()
                .zip(gradient.local().par_iter())
                .for_each(|(w, g)| {
                    *w = *w - lr * *g;
                });
        } else {
            self.velocity
                .par_iter_mut()
                .zip(weights.local_mut().par_iter_mut())
                .zip(gradient.local().par_iter())
                .for_each(|((v, w), g)| {
                    *v = momentum * *v - lr * *g;
                    *w = *w + *v;
                });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ProcessGrid;
    use crate::mat::Distribution;

    fn replicated(data: &[f64], h: usize, w: usize) -> DistMat<f64> {
        let mut m = DistMat::zeros(ProcessGrid::local(), Distribution::Replicated, h, w);
        m.local_mut().copy_from_slice(data);
        m
    }

    #[test]
    fn test_sgd_update() {
        let mut sgd = Sgd::new(0.1);
        sgd.setup(2, 1);
        let grad = replicated(&[0.5, -0.5], 1, 2);
        let mut weights = replicated(&[1.0, 2.0], 1, 2);
        sgd.update_weight_bias_matrix(&grad, &mut weights).unwrap();
        assert!((weights.local()[0] - 0.95).abs() < 1e-12);
        assert!((weights.local()[1] - 2.05).abs() < 1e-12);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut sgd = Sgd::new(1.0).with_momentum(0.5);
        sgd.setup(1, 1);
        let grad = replicated(&[1.0], 1, 1);
        let mut w = replicated(&[0.0], 1, 1);
        sgd.update_weight_bias_matrix(&grad, &mut w).unwrap();
        // v = -1, w = -1
        assert!((w.local()[0] + 1.0).abs() < 1e-12);
        sgd.update_weight_bias_matrix(&grad, &mut w).unwrap();
        // v = -1.5, w = -2.5
        assert!((w.local()[0] + 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_sgd_shape_mismatch() {
        let mut sgd = Sgd::new(0.1);
        let grad = replicated(&[0.5], 1, 1);
        let mut w = replicated(&[1.0, 2.0], 1, 2);
        assert!(sgd.update_weight_bias_matrix(&grad, &mut w).is_err());
    }
}
