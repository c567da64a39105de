//! Optimizers: the update-weights-given-gradient contract layers consume.

pub mod adam;
pub mod sgd;

pub use adam::Adam;
pub use sgd::Sgd;

use crate::mat::{DistMat, MatElem, Result};

/// The contract a layer drives its optimizer through.
///
/// A layer owns its optimizer exclusively, calls [`Optimizer::setup`] once
/// from its own `setup`, and then
/// [`Optimizer::update_weight_bias_matrix`] once per training step. The
/// optimizer mutates the weight-bias matrix in place and may keep state
/// (momentum, moments) across steps.
pub trait Optimizer<T: MatElem>: Send {
    /// Sizes the optimizer's state for an `output_width × input_width`
    /// weight-bias matrix.
    fn setup(&mut self, input_width: usize, output_width: usize);

    /// One optimization step: consumes the gradient, mutates `weights` in
    /// place.
    fn update_weight_bias_matrix(
        &mut self,
        gradient: &DistMat<T>,
        weights: &mut DistMat<T>,
    ) -> Result<()>;
}
