//! The dense, fully connected layer.
//!
//! # Weight-bias matrix structure
//!
//! The weight matrix is bias-augmented: one row per neuron, one column per
//! previous-layer feature, plus a trailing bias column and a trailing bias
//! row whose corner is pinned to 1 so the constant bias term propagates
//! through the matrix product itself:
//!
//! ```text
//! [ W0 ...    B0 ]
//! [ |          | ]
//! [ Wn        Bn ]
//! [ 0  ...  0  1 ]   <- fixed; never trained
//! ```
//!
//! With the previous layer's activations carrying a matching all-ones bias
//! row, `Z = W · A_prev` computes every neuron's affine transform *and*
//! regenerates the bias row of `Z` in one GEMM.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::distributed::ProcessGrid;
use crate::mat::{ops, DistMat, MatElem, MatView, Orientation};
use crate::nn::activation::Activation;
use crate::nn::layer::{ExecutionMode, Layer, LayerBase, LayerError, Result};
use crate::optim::Optimizer;
use crate::regularizer::Regularizer;
use crate::summary::Summarizer;

/// The distribution used to initialize the trainable weight block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightInit {
    /// All zeros.
    #[default]
    Zero,
    /// i.i.d. `U(0, 1)`.
    Uniform,
    /// i.i.d. `N(0, 1)`.
    Normal,
    /// `N(0, 2 / (fan_in + fan_out))`.
    GlorotNormal,
    /// `U(-l, l)` with `l = sqrt(3 * 2 / (fan_in + fan_out))`.
    GlorotUniform,
    /// `N(0, 1 / fan_in)`.
    HeNormal,
    /// `U(-l, l)` with `l = sqrt(3 / fan_in)`.
    HeUniform,
}

/// Dense layer: `Z = W · A_prev`, gradients by GEMM, weights updated by the
/// layer's optimizer.
pub struct FullyConnectedLayer<T: MatElem> {
    base: LayerBase<T>,
    /// Previous-layer width fixed at construction; `setup` must agree.
    num_prev_neurons: usize,
    weight_init: WeightInit,
    init_seed: u64,
    wb_l2norm_sum: T,
    /// Weight view excluding the trailing bias row, for regularizers.
    wb_view: MatView,
    /// Gradient view excluding the trailing bias row.
    wb_d_view: MatView,
    /// Activations view excluding the trailing bias row.
    acts_view: MatView,
}

impl<T: MatElem> FullyConnectedLayer<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        num_prev_neurons: usize,
        num_neurons: usize,
        mini_batch_size: usize,
        activation: Activation,
        weight_init: WeightInit,
        grid: Arc<ProcessGrid>,
        optimizer: Option<Box<dyn Optimizer<T>>>,
        regularizers: Vec<Box<dyn Regularizer<T>>>,
    ) -> Self {
        let mut base = LayerBase::new(
            index,
            grid,
            optimizer,
            mini_batch_size,
            activation,
            regularizers,
        );
        base.num_neurons = num_neurons;
        Self {
            base,
            num_prev_neurons,
            weight_init,
            // Distinct default stream per layer; replicated weights stay in
            // sync because every rank derives the same seed.
            init_seed: (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            wb_l2norm_sum: T::zero(),
            wb_view: MatView::default(),
            wb_d_view: MatView::default(),
            acts_view: MatView::default(),
        }
    }

    /// Overrides the weight-initialization seed. Must be identical on every
    /// rank of the grid.
    pub fn with_init_seed(mut self, seed: u64) -> Self {
        self.init_seed = seed;
        self
    }

    pub fn weight_initialization(&self) -> WeightInit {
        self.weight_init
    }

    /// The cached squared weight norm from the last forward pass.
    pub fn wb_l2norm_sum(&self) -> T {
        self.wb_l2norm_sum
    }

    pub fn wb_view(&self) -> MatView {
        self.wb_view
    }

    pub fn wb_d_view(&self) -> MatView {
        self.wb_d_view
    }

    pub fn acts_view(&self) -> MatView {
        self.acts_view
    }

    /// Average per-column L2 norm of an externally supplied delta matrix,
    /// reduced across the grid. Pure apart from the collective.
    pub fn compute_cost(&self, deltas: &DistMat<T>) -> Result<T> {
        if deltas.width() == 0 {
            return Ok(T::zero());
        }
        let norms = ops::column_norms_local(deltas, deltas.full_view())?;
        let local_total = norms
            .iter()
            .fold(0.0f64, |acc, &v| acc + v.to_f64().unwrap_or(0.0));
        let total = deltas.grid().all_reduce_sum_scalar(local_total);
        Ok(T::from_f64(total / deltas.width() as f64).unwrap_or_else(T::zero))
    }
}

/// Full-width forward pass into scratch matrices: `zs = W · prev`, then the
/// activation over the first `num_neurons` rows of the current mini-batch.
fn forward_scratch<T: MatElem>(
    weights: &DistMat<T>,
    prev_activations: &DistMat<T>,
    activation: Activation,
    num_neurons: usize,
    cur: usize,
    zs: &mut DistMat<T>,
    acts: &mut DistMat<T>,
) -> Result<()> {
    let wv = weights.full_view();
    let pv = prev_activations.full_view();
    let zv = zs.full_view();
    ops::gemm(
        Orientation::Normal,
        Orientation::Normal,
        T::one(),
        weights,
        wv,
        prev_activations,
        pv,
        T::zero(),
        zs,
        zv,
    )?;
    ops::copy(zs, acts)?;
    ops::apply(acts, MatView::new(0..num_neurons, 0..cur), move |z| {
        activation.apply(z)
    })?;
    Ok(())
}

/// Sum of the locally owned elements of `mat` over `rows × cols`.
fn local_sum<T: MatElem>(mat: &DistMat<T>, rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> f64 {
    let mut acc = 0.0f64;
    for r in rows {
        for lc in mat.local_col_range(cols.clone()) {
            acc += mat.at_local(r, lc).to_f64().unwrap_or(0.0);
        }
    }
    acc
}

impl<T: MatElem> Layer<T> for FullyConnectedLayer<T> {
    fn base(&self) -> &LayerBase<T> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut LayerBase<T> {
        &mut self.base
    }

    fn setup(&mut self, num_prev_neurons: usize) -> Result<()> {
        if num_prev_neurons != self.num_prev_neurons {
            return Err(LayerError::PrevWidthMismatch {
                index: self.base.index(),
                declared: self.num_prev_neurons,
                actual: num_prev_neurons,
            });
        }
        self.base.setup_matrices(num_prev_neurons)?;
        let n = self.base.num_neurons;
        let p = num_prev_neurons;

        if let Some(opt) = self.base.optimizer.as_mut() {
            opt.setup(p + 1, n + 1);
        }

        // Bias-propagation invariant: the corner is exactly 1, never trained.
        // The gradient views exclude the trailing row, so no update touches it.
        if self.base.weights.is_local(n, p) {
            self.base.weights.set(n, p, T::one());
        }

        // Initialize the trainable block.
        let weights_view = MatView::new(0..n, 0..p);
        let mut rng = StdRng::seed_from_u64(self.init_seed);
        match self.weight_init {
            WeightInit::Zero => {}
            WeightInit::Uniform => {
                self.base
                    .weights
                    .uniform_fill(weights_view, &mut rng, 0.0, 1.0)?;
            }
            WeightInit::Normal => {
                self.base
                    .weights
                    .gaussian_fill(weights_view, &mut rng, 0.0, 1.0)?;
            }
            WeightInit::GlorotNormal => {
                let var = 2.0 / (p + n) as f64;
                self.base
                    .weights
                    .gaussian_fill(weights_view, &mut rng, 0.0, var.sqrt())?;
            }
            WeightInit::GlorotUniform => {
                let var = 2.0 / (p + n) as f64;
                let limit = (3.0 * var).sqrt();
                self.base
                    .weights
                    .uniform_fill(weights_view, &mut rng, -limit, limit)?;
            }
            WeightInit::HeNormal => {
                let var = 1.0 / p as f64;
                self.base
                    .weights
                    .gaussian_fill(weights_view, &mut rng, 0.0, var.sqrt())?;
            }
            WeightInit::HeUniform => {
                let limit = (3.0 / p as f64).sqrt();
                self.base
                    .weights
                    .uniform_fill(weights_view, &mut rng, -limit, limit)?;
            }
        }

        // Bias-excluding sub-views for regularizers and reporting.
        let h = self.base.weights.height();
        let w = self.base.weights.width();
        self.wb_view = MatView::new(0..h - 1, 0..w);
        self.wb_d_view = MatView::new(0..h - 1, 0..w);
        self.acts_view = MatView::new(0..n, 0..self.base.mini_batch_size());

        // Full-width weight views: the single override point the base
        // class's partial-mini-batch logic goes through.
        self.base.weights_v = self.base.weights.full_view();
        self.base.weights_gradient_v = self.base.weights_gradient.full_view();
        Ok(())
    }

    fn fp_linearity(&mut self) -> Result<()> {
        let base = &mut self.base;
        // Full allocated width: only the trailing mini-batch of an epoch can
        // be partial, and the view boundaries gate every downstream use.
        let wv = base.weights.full_view();
        let pav = base.prev_activations.full_view();
        let zv = base.preactivations.full_view();
        ops::gemm(
            Orientation::Normal,
            Orientation::Normal,
            T::one(),
            &base.weights,
            wv,
            &base.prev_activations,
            pav,
            T::zero(),
            &mut base.preactivations,
            zv,
        )?;
        let mut acts = base.activations.write().unwrap();
        ops::copy(&base.preactivations, &mut acts)?;
        Ok(())
    }

    fn bp_linearity(&mut self) -> Result<()> {
        let wb_view = self.wb_view;
        let base = &mut self.base;

        // Error propagated to the previous layer: E = W^T · E_prev over the
        // current mini-batch views. The bias row of E_prev was zeroed by
        // bp_nonlinearity, so the full-width weight view is equivalent to a
        // bias-row-excluded one.
        {
            let mut err = base.error_signal.write().unwrap();
            ops::gemm(
                Orientation::Transpose,
                Orientation::Normal,
                T::one(),
                &base.weights,
                base.weights_v,
                &base.prev_error_signal,
                base.prev_error_signal_v,
                T::zero(),
                &mut err,
                base.error_signal_v,
            )?;
        }

        // Mini-batch-averaged gradient, normalized by the *effective* size so
        // multi-replica accumulation averages instead of summing.
        let scale = T::one() / T::from_usize(base.effective_mini_batch_size()).unwrap();
        ops::gemm(
            Orientation::Normal,
            Orientation::Transpose,
            scale,
            &base.prev_error_signal,
            base.prev_error_signal_v,
            &base.prev_activations,
            base.prev_activations_v,
            T::zero(),
            &mut base.weights_gradient,
            base.weights_gradient_v,
        )?;

        // Regularizers see only the true-weight block.
        for reg in &base.regularizers {
            reg.update_gradient(&base.weights, wb_view, &mut base.weights_gradient)?;
        }
        Ok(())
    }

    fn wb_l2norm(&mut self) -> Result<T> {
        let nrm2 = ops::frobenius_norm_sq(&self.base.weights);
        self.wb_l2norm_sum = nrm2;
        Ok(nrm2)
    }

    fn update(&mut self) -> Result<bool> {
        let base = &mut self.base;
        if base.execution_mode == ExecutionMode::Training {
            let index = base.index();
            let LayerBase {
                optimizer,
                weights,
                weights_gradient,
                ..
            } = base;
            let opt = optimizer
                .as_mut()
                .ok_or(LayerError::MissingOptimizer { index })?;
            opt.update_weight_bias_matrix(weights_gradient, weights)?;
        }
        Ok(true)
    }

    /// Finite-difference gradient verification.
    ///
    /// Perturbs every weight entry by ±epsilon, recomputes the forward pass,
    /// and checks two things: that activations deviate only in the perturbed
    /// entry's output row (anything else means bias-row accounting is
    /// broken — reported as a diagnostic print, never fatal), and that the
    /// finite-difference gradient of `J = Σ activations` matches the
    /// analytic one. Returns the relative gradient error.
    ///
    /// O(weights) full forward passes, and it clobbers `prev_error_signal`
    /// and the scratch state: strictly an offline verification utility.
    fn check_gradient_mb(&mut self, prev_layer: &dyn Layer<T>, epsilon: T) -> Result<T> {
        let n = self.base.num_neurons;
        let p = self.base.num_prev_neurons;
        let cur = self.base.current_mini_batch_size();
        let act = self.base.activation();
        let eps = epsilon;

        // Refresh the previous-activation copy from the neighbor.
        {
            let prev_acts = prev_layer.base().activations_shared();
            let prev_acts = prev_acts.read().unwrap();
            ops::copy(&prev_acts, &mut self.base.prev_activations)?;
        }

        // Baseline forward state.
        let mut zs = self.base.preactivations.clone();
        let mut acts_base = self.base.preactivations.clone();
        forward_scratch(
            &self.base.weights,
            &self.base.prev_activations,
            act,
            n,
            cur,
            &mut zs,
            &mut acts_base,
        )?;

        // Analytic gradient of J = Σ_{i<n, c<cur} A[i][c]:
        // E = σ'(Z) over the true-neuron rows, zero in the bias row, and
        // dW_an = E · A_prev^T (unnormalized).
        let view = MatView::new(0..n, 0..cur);
        let mut e = self.base.prev_error_signal.clone();
        e.zero_view(e.full_view())?;
        ops::apply(&mut e, view, |_| T::one())?;
        ops::zip_apply(&mut e, view, &zs, view, move |ones, z| {
            ones * act.derivative(z)
        })?;
        let mut analytic = self.base.weights_gradient.clone();
        analytic.zero_view(analytic.full_view())?;
        let e_view = MatView::new(0..n + 1, 0..cur);
        let pa_view = MatView::new(0..p + 1, 0..cur);
        let an_view = analytic.full_view();
        ops::gemm(
            Orientation::Normal,
            Orientation::Transpose,
            T::one(),
            &e,
            e_view,
            &self.base.prev_activations,
            pa_view,
            T::zero(),
            &mut analytic,
            an_view,
        )?;

        let two_eps = (eps + eps).to_f64().unwrap_or(2e-4);
        let dev_tol = 1e-12;
        let mut wb = self.base.weights.clone();
        let mut zs_e = zs.clone();
        let mut acts_e1 = acts_base.clone();
        let mut acts_e2 = acts_base.clone();
        let mut grad_diff = 0.0f64;
        let mut grad_sum = 0.0f64;

        for row in 0..=n {
            for col in 0..=p {
                let orig = wb.get(row, col);
                if let Some(v) = orig {
                    wb.set(row, col, v + eps);
                }
                forward_scratch(
                    &wb,
                    &self.base.prev_activations,
                    act,
                    n,
                    cur,
                    &mut zs_e,
                    &mut acts_e1,
                )?;
                if let Some(v) = orig {
                    wb.set(row, col, v - eps);
                }
                forward_scratch(
                    &wb,
                    &self.base.prev_activations,
                    act,
                    n,
                    cur,
                    &mut zs_e,
                    &mut acts_e2,
                )?;
                if let Some(v) = orig {
                    wb.set(row, col, v);
                }

                // A perturbation of W[row][*] may move activations only in
                // `row`; a deviation anywhere else is a bias-accounting bug.
                for r in 0..=n {
                    for lc in acts_base.local_col_range(0..cur) {
                        if r == row {
                            continue;
                        }
                        let d1 = (acts_e1.at_local(r, lc) - acts_base.at_local(r, lc))
                            .to_f64()
                            .unwrap_or(0.0);
                        let d2 = (acts_e2.at_local(r, lc) - acts_base.at_local(r, lc))
                            .to_f64()
                            .unwrap_or(0.0);
                        if d1.abs() > dev_tol || d2.abs() > dev_tol {
                            if self.base.grid().is_root() {
                                eprintln!(
                                    "gradient check: unexpected deviation at ({r}, {}) while perturbing ({row}, {col})",
                                    acts_base.global_col(lc)
                                );
                            }
                        }
                    }
                }

                let j1 = self
                    .base
                    .grid()
                    .all_reduce_sum_scalar(local_sum(&acts_e1, 0..n, 0..cur));
                let j2 = self
                    .base
                    .grid()
                    .all_reduce_sum_scalar(local_sum(&acts_e2, 0..n, 0..cur));
                let fd = (j1 - j2) / two_eps;
                let an = analytic
                    .get(row, col)
                    .and_then(|v| v.to_f64())
                    .unwrap_or(0.0);
                grad_diff += (fd - an).powi(2);
                grad_sum += fd.powi(2) + an.powi(2);
            }
        }

        let rel = (grad_diff / grad_sum.max(1e-30)).sqrt();
        Ok(T::from_f64(rel).unwrap_or_else(T::zero))
    }

    fn summarize(&mut self, summarizer: &mut dyn Summarizer, step: i64) {
        let idx = self.base.index();
        summarizer.scalar(
            &format!("layer{idx}/fp_time"),
            step,
            self.base.fp_time().as_secs_f64(),
        );
        summarizer.scalar(
            &format!("layer{idx}/bp_time"),
            step,
            self.base.bp_time().as_secs_f64(),
        );
        summarizer.scalar(
            &format!("layer{idx}/weights_fro_norm_sq"),
            step,
            ops::frobenius_norm_sq(&self.base.weights)
                .to_f64()
                .unwrap_or(0.0),
        );
        summarizer.scalar(
            &format!("layer{idx}/gradient_fro_norm_sq"),
            step,
            ops::frobenius_norm_sq(&self.base.weights_gradient)
                .to_f64()
                .unwrap_or(0.0),
        );
        // Activation statistics over the bias-excluding view: the constant
        // bias row would otherwise dominate small layers.
        let acts = self.base.activations.read().unwrap();
        if let Ok(norms) = ops::column_norms_local(&acts, self.acts_view) {
            let sum_sq: f64 = norms
                .iter()
                .map(|v| v.to_f64().unwrap_or(0.0).powi(2))
                .sum();
            summarizer.scalar(&format!("layer{idx}/activations_sum_sq"), step, sum_sq);
        }
    }

    fn epoch_print(&self) {
        if self.base.grid().is_root() {
            println!(
                "layer {}: fp {:.6}s, bp {:.6}s",
                self.base.index(),
                self.base.fp_time().as_secs_f64(),
                self.base.bp_time().as_secs_f64()
            );
        }
    }

    fn epoch_reset(&mut self) {
        self.base.reset_counters();
        self.wb_l2norm_sum = T::zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(
        p: usize,
        n: usize,
        mbs: usize,
        init: WeightInit,
        activation: Activation,
    ) -> FullyConnectedLayer<f64> {
        FullyConnectedLayer::new(
            0,
            p,
            n,
            mbs,
            activation,
            init,
            ProcessGrid::local(),
            None,
            Vec::new(),
        )
    }

    #[test]
    fn test_setup_shapes_and_corner() {
        let mut fc = layer(2, 3, 4, WeightInit::Zero, Activation::Identity);
        fc.setup(2).unwrap();
        let w = fc.base().weights();
        assert_eq!((w.height(), w.width()), (4, 3));
        assert_eq!(w.get(3, 2), Some(1.0));
        // Everything but the corner is zero under the default policy.
        for row in 0..4 {
            for col in 0..3 {
                if (row, col) != (3, 2) {
                    assert_eq!(w.get(row, col), Some(0.0));
                }
            }
        }
    }

    #[test]
    fn test_setup_rejects_wrong_prev_width() {
        let mut fc = layer(2, 3, 4, WeightInit::Zero, Activation::Identity);
        assert!(matches!(
            fc.setup(5),
            Err(LayerError::PrevWidthMismatch { .. })
        ));
    }

    #[test]
    fn test_he_uniform_bounds_and_bias_region() {
        let mut fc = layer(4, 3, 2, WeightInit::HeUniform, Activation::Identity);
        fc.setup(4).unwrap();
        let w = fc.base().weights();
        let limit = (3.0f64 / 4.0).sqrt();
        for row in 0..3 {
            for col in 0..4 {
                let v = w.get(row, col).unwrap();
                assert!(v.abs() <= limit, "w[{row}][{col}] = {v} out of bounds");
            }
        }
        // The bias column and bias row stay zero (corner excepted).
        for row in 0..3 {
            assert_eq!(w.get(row, 4), Some(0.0));
        }
        for col in 0..4 {
            assert_eq!(w.get(3, col), Some(0.0));
        }
        assert_eq!(w.get(3, 4), Some(1.0));
    }

    #[test]
    fn test_init_deterministic_for_fixed_seed() {
        let mut a = layer(3, 3, 1, WeightInit::Normal, Activation::Identity).with_init_seed(99);
        let mut b = layer(3, 3, 1, WeightInit::Normal, Activation::Identity).with_init_seed(99);
        a.setup(3).unwrap();
        b.setup(3).unwrap();
        assert_eq!(a.base().weights().local(), b.base().weights().local());
    }

    #[test]
    fn test_bias_excluding_views() {
        let mut fc = layer(2, 3, 4, WeightInit::Zero, Activation::Identity);
        fc.setup(2).unwrap();
        assert_eq!(fc.wb_view(), MatView::new(0..3, 0..3));
        assert_eq!(fc.wb_d_view(), MatView::new(0..3, 0..3));
        assert_eq!(fc.acts_view(), MatView::new(0..3, 0..4));
    }

    #[test]
    fn test_compute_cost_average_column_norm() {
        let fc = layer(2, 2, 2, WeightInit::Zero, Activation::Identity);
        let grid = fc.base().grid().clone();
        let mut deltas =
            DistMat::<f64>::zeros(grid, crate::mat::Distribution::ColumnDist, 2, 2);
        deltas.local_mut().copy_from_slice(&[3.0, 0.0, 4.0, 5.0]);
        // Column norms are 5 and 5; the average is 5.
        let cost = fc.compute_cost(&deltas).unwrap();
        assert!((cost - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_optimizer_error_in_training() {
        let mut fc = layer(2, 2, 1, WeightInit::Zero, Activation::Identity);
        fc.setup(2).unwrap();
        assert!(matches!(
            fc.update(),
            Err(LayerError::MissingOptimizer { .. })
        ));
    }
}
