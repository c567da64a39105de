//! Weight regularization.
//!
//! Regularizers are applied by the layer after the gradient GEMM, through
//! the *bias-excluding* weight view: the trailing bias row of the weight
//! matrix carries no regularization penalty.

use crate::mat::{ops, DistMat, MatElem, MatView, Result};

/// A gradient-side regularization hook.
pub trait Regularizer<T: MatElem>: Send {
    fn name(&self) -> &'static str;

    /// Adds this regularizer's contribution to the weight gradient. `view`
    /// is the layer's bias-excluding weight view; implementations must not
    /// write outside it.
    fn update_gradient(
        &self,
        weights: &DistMat<T>,
        view: MatView,
        gradient: &mut DistMat<T>,
    ) -> Result<()>;
}

/// L2 weight decay: adds `lambda * W` to the gradient over the true-weight
/// sub-block.
pub struct L2WeightDecay<T: MatElem> {
    pub lambda: T,
}

impl<T: MatElem> L2WeightDecay<T> {
    pub fn new(lambda: T) -> Self {
        Self { lambda }
    }
}

impl<T: MatElem> Regularizer<T> for L2WeightDecay<T> {
    fn name(&self) -> &'static str {
        "l2_weight_decay"
    }

    fn update_gradient(
        &self,
        weights: &DistMat<T>,
        view: MatView,
        gradient: &mut DistMat<T>,
    ) -> Result<()> {
        ops::axpy(self.lambda, weights, view, gradient, view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ProcessGrid;
    use crate::mat::Distribution;

    #[test]
    fn test_l2_decay_skips_rows_outside_view() {
        let grid = ProcessGrid::local();
        let mut w = DistMat::<f64>::zeros(grid.clone(), Distribution::Replicated, 3, 2);
        w.local_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 9.0, 9.0]);
        let mut g = DistMat::<f64>::zeros(grid, Distribution::Replicated, 3, 2);
        // Bias-excluding view: first two rows only.
        let view = MatView::new(0..2, 0..2);
        let reg = L2WeightDecay::new(0.5);
        reg.update_gradient(&w, view, &mut g).unwrap();
        assert_eq!(g.local(), &[0.5, 1.0, 1.5, 2.0, 0.0, 0.0]);
    }
}
