use rayon::prelude::*;

use super::Optimizer;
use crate::mat::{DistMat, MatElem, MatError, Result};

/// Adam optimizer.
///
/// Keeps exponential moving averages of the gradient and its square, with
/// bias correction:
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \theta_t = \theta_{t-1} - \eta \, \hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon)
/// \end{aligned}
/// $$
pub struct Adam<T: MatElem> {
    pub learning_rate: T,
    pub beta1: T,
    pub beta2: T,
    pub epsilon: T,
    m: Vec<T>,
    v: Vec<T>,
    step: u64,
}

impl<T: MatElem> Adam<T> {
    pub fn new(learning_rate: T) -> Self {
        Self {
            learning_rate,
            beta1: T::from_f64(0.9).unwrap(),
            beta2: T::from_f64(0.999).unwrap(),
            epsilon: T::from_f64(1e-8).unwrap(),
            m: Vec::new(),
            v: Vec::new(),
            step: 0,
        }
    }

    pub fn with_betas(mut self, beta1: T, beta2: T) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: T) -> Self {
        self.epsilon = epsilon;
        self
    }
}

impl<T: MatElem> Optimizer<T> for Adam<T> {
    fn setup(&mut self, input_width: usize, output_width: usize) {
        let size = input_width * output_width;
        self.m = vec![T::zero(); size];
        self.v = vec![T::zero(); size];
        self.step = 0;
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
        let size = weights.local().len();
        if self.m.len() != size {
            self.m = vec![T::zero(); size];
            self.v = vec![T::zero(); size];
            self.step = 0;
        }

        self.step += 1;
        let lr = self.learning_rate;
        let (b1, b2) = (self.beta1, self.beta2);
        let eps = self.epsilon;
        let bias1 = T::one() - b1.powi(self.step as i32);
        let bias2 = T::one() - b2.powi(self.step as i32);

        self.m
            .par_iter_mut()
            .zip(self.v.par_iter_mut())
            .zip(
                weights
                    .local_mut()
                    .par_iter_mut()
                    .zip(gradient.local().par_iter()),
            )
            .for_each(|((m, v), (w, g))| {
                *m = b1 * *m + (T::one() - b1) * *g;
                *v = b2 * *v + (T::one() - b2) * *g * *g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *w = *w - lr * m_hat / (v_hat.sqrt() + eps);
            });

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
    fn test_adam_first_step_magnitude() {
        // On the first step m_hat = g and v_hat = g^2, so the update is
        // approximately -lr * sign(g).
        let mut adam = Adam::new(0.001);
        adam.setup(1, 2);
        let grad = replicated(&[0.1, -0.2], 2, 1);
        let mut w = replicated(&[1.0, 1.0], 2, 1);
        adam.update_weight_bias_matrix(&grad, &mut w).unwrap();
        assert!((w.local()[0] - (1.0 - 0.001)).abs() < 1e-5);
        assert!((w.local()[1] - (1.0 + 0.001)).abs() < 1e-5);
    }

    #[test]
    fn test_adam_zero_gradient_is_fixed_point() {
        let mut adam = Adam::new(0.01);
        adam.setup(2, 2);
        let grad = replicated(&[0.0; 4], 2, 2);
        let mut w = replicated(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        for _ in 0..3 {
            adam.update_weight_bias_matrix(&grad, &mut w).unwrap();
        }
        assert_eq!(w.local(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_adam_shape_mismatch() {
        let mut adam = Adam::new(0.01);
        let grad = replicated(&[0.0], 1, 1);
        let mut w = replicated(&[1.0, 1.0], 1, 2);
        assert!(adam.update_weight_bias_matrix(&grad, &mut w).is_err());
    }
}
