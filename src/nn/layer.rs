//! The layer contract: forward propagation, backward propagation, update,
//! and the checkpoint protocol.
//!
//! # Anatomy of a training step
//!
//! For every mini-batch the model driver walks the layers index-ascending
//! calling [`Layer::forward_prop`], computes the loss externally, then walks
//! them index-descending calling [`Layer::back_prop`] and [`Layer::update`].
//! Within one layer the step is a fixed pipeline:
//!
//! ```text
//! ingest fp_input → rebuild views → fp_linearity → fp_nonlinearity
//!                     ⋮ (external loss) ⋮
//! ingest bp_input → bp_nonlinearity → bp_linearity → update?
//! ```
//!
//! The pipeline lives in the trait's provided methods; concrete layers
//! customize the seams (`fp_linearity`, `bp_linearity`, `fp_nonlinearity`,
//! `bp_nonlinearity`, `fp_set_std_matrix_view`, `wb_l2norm`) — the same
//! override points the wider toolkit's other layer kinds hook into.
//!
//! # Ownership
//!
//! Each layer exclusively owns its matrices. Activations and the outgoing
//! error signal are handed to neighbors as [`SharedMat`] handles, wired once
//! by the driver via [`Layer::setup_fp_input`] / [`Layer::setup_bp_input`];
//! the layer then *copies* the neighbor's matrix into its own
//! `prev_activations` / `prev_error_signal` at the top of each pass, so all
//! hot-path math runs on exclusively owned storage.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::checkpoint;
use crate::distributed::ProcessGrid;
use crate::mat::{ops, DistMat, Distribution, MatElem, MatError, MatView, SharedMat};
use crate::nn::activation::Activation;
use crate::optim::Optimizer;
use crate::regularizer::Regularizer;
use crate::summary::Summarizer;

/// Error type for layer operations.
#[derive(Error, Debug)]
pub enum LayerError {
    #[error(transparent)]
    Mat(#[from] MatError),
    #[error("checkpoint I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization: {0}")]
    Checkpoint(String),
    #[error("checkpoint shape mismatch: expected {expected:?}, got {got:?}")]
    CheckpointShape {
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("layer {index} has no optimizer")]
    MissingOptimizer { index: usize },
    #[error("mini-batch width {requested} exceeds allocated width {allocated}")]
    MiniBatchOverflow { requested: usize, allocated: usize },
    #[error("effective mini-batch size {effective} is smaller than local size {local}")]
    EffectiveBatchTooSmall { effective: usize, local: usize },
    #[error("layer {index} configured for {declared} previous neurons but setup saw {actual}")]
    PrevWidthMismatch {
        index: usize,
        declared: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// Whether the current pass trains, validates or tests.
///
/// Only [`ExecutionMode::Training`] lets [`Layer::update`] mutate weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    #[default]
    Training,
    Validation,
    Testing,
}

/// State shared by every layer kind: the owned matrices, their current
/// mini-batch views, neighbor hand-off, mini-batch bookkeeping and timers.
pub struct LayerBase<T: MatElem> {
    index: usize,
    pub(crate) num_neurons: usize,
    pub(crate) num_prev_neurons: usize,
    pub(crate) execution_mode: ExecutionMode,
    pub(crate) activation: Activation,
    grid: Arc<ProcessGrid>,
    pub(crate) optimizer: Option<Box<dyn Optimizer<T>>>,
    pub(crate) regularizers: Vec<Box<dyn Regularizer<T>>>,

    /// Weight-bias matrix, `(num_neurons + 1) × (num_prev_neurons + 1)`.
    pub(crate) weights: DistMat<T>,
    /// Gradient w.r.t. the weight-bias matrix, same shape as `weights`.
    pub(crate) weights_gradient: DistMat<T>,
    /// Linear-transform output `Z`, `(num_neurons + 1) × mini_batch_size`.
    pub(crate) preactivations: DistMat<T>,
    /// Local copy of the error signal arriving from the next layer.
    pub(crate) prev_error_signal: DistMat<T>,
    /// Error signal propagated to the previous layer,
    /// `(num_prev_neurons + 1) × mini_batch_size`. Shared: the previous
    /// layer's `bp_input` aliases this handle.
    pub(crate) error_signal: SharedMat<T>,
    /// Activations `A`. Shared: the next layer's `fp_input` aliases this.
    pub(crate) activations: SharedMat<T>,
    /// Local copy of the previous layer's activations.
    pub(crate) prev_activations: DistMat<T>,

    // Views restricting each matrix to the current (possibly partial)
    // mini-batch; rebuilt by `set_std_matrix_view`.
    pub(crate) weights_v: MatView,
    pub(crate) weights_gradient_v: MatView,
    pub(crate) preactivations_v: MatView,
    pub(crate) prev_error_signal_v: MatView,
    pub(crate) error_signal_v: MatView,
    pub(crate) activations_v: MatView,
    pub(crate) prev_activations_v: MatView,

    fp_input: Option<SharedMat<T>>,
    bp_input: Option<SharedMat<T>>,

    mini_batch_size: usize,
    effective_mini_batch_size: usize,
    current_mini_batch_size: usize,

    fp_time: Duration,
    bp_time: Duration,
    is_setup: bool,
}

impl<T: MatElem> LayerBase<T> {
    pub fn new(
        index: usize,
        grid: Arc<ProcessGrid>,
        optimizer: Option<Box<dyn Optimizer<T>>>,
        mini_batch_size: usize,
        activation: Activation,
        regularizers: Vec<Box<dyn Regularizer<T>>>,
    ) -> Self {
        let empty_col = |g: &Arc<ProcessGrid>| {
            Arc::new(RwLock::new(DistMat::zeros(
                g.clone(),
                Distribution::ColumnDist,
                0,
                0,
            )))
        };
        Self {
            index,
            num_neurons: 0,
            num_prev_neurons: 0,
            execution_mode: ExecutionMode::Training,
            activation,
            optimizer,
            regularizers,
            weights: DistMat::zeros(grid.clone(), Distribution::Replicated, 0, 0),
            weights_gradient: DistMat::zeros(grid.clone(), Distribution::Replicated, 0, 0),
            preactivations: DistMat::zeros(grid.clone(), Distribution::ColumnDist, 0, 0),
            prev_error_signal: DistMat::zeros(grid.clone(), Distribution::ColumnDist, 0, 0),
            error_signal: empty_col(&grid),
            activations: empty_col(&grid),
            prev_activations: DistMat::zeros(grid.clone(), Distribution::ColumnDist, 0, 0),
            weights_v: MatView::default(),
            weights_gradient_v: MatView::default(),
            preactivations_v: MatView::default(),
            prev_error_signal_v: MatView::default(),
            error_signal_v: MatView::default(),
            activations_v: MatView::default(),
            prev_activations_v: MatView::default(),
            fp_input: None,
            bp_input: None,
            mini_batch_size,
            effective_mini_batch_size: mini_batch_size,
            current_mini_batch_size: mini_batch_size,
            fp_time: Duration::ZERO,
            bp_time: Duration::ZERO,
            grid,
            is_setup: false,
        }
    }

    /// Allocates (or re-zeros) every owned matrix for the given previous
    /// layer width and rebuilds all views at full mini-batch width.
    ///
    /// Deliberately not idempotent: a second call wipes trained state.
    /// Drivers call this exactly once, after the network topology is final.
    pub(crate) fn setup_matrices(&mut self, num_prev_neurons: usize) -> Result<()> {
        self.num_prev_neurons = num_prev_neurons;
        let n1 = self.num_neurons + 1;
        let p1 = num_prev_neurons + 1;
        let mbs = self.mini_batch_size;
        self.weights.resize_zeros(n1, p1);
        self.weights_gradient.resize_zeros(n1, p1);
        self.preactivations.resize_zeros(n1, mbs);
        self.prev_error_signal.resize_zeros(n1, mbs);
        self.activations.write().unwrap().resize_zeros(n1, mbs);
        self.error_signal.write().unwrap().resize_zeros(p1, mbs);
        self.prev_activations.resize_zeros(p1, mbs);
        self.weights_v = self.weights.full_view();
        self.weights_gradient_v = self.weights_gradient.full_view();
        self.current_mini_batch_size = mbs;
        self.set_std_matrix_view()?;
        self.is_setup = true;
        Ok(())
    }

    /// Re-derives the activation-shaped views for the current mini-batch
    /// width. Fails loudly if the requested width outgrew the allocation —
    /// continuing would silently corrupt gradient accumulation.
    pub(crate) fn set_std_matrix_view(&mut self) -> Result<()> {
        let cur = self.current_mini_batch_size;
        if cur > self.mini_batch_size {
            return Err(LayerError::MiniBatchOverflow {
                requested: cur,
                allocated: self.mini_batch_size,
            });
        }
        let n1 = self.num_neurons + 1;
        let p1 = self.num_prev_neurons + 1;
        self.preactivations_v = MatView::new(0..n1, 0..cur);
        self.prev_error_signal_v = MatView::new(0..n1, 0..cur);
        self.activations_v = MatView::new(0..n1, 0..cur);
        self.error_signal_v = MatView::new(0..p1, 0..cur);
        self.prev_activations_v = MatView::new(0..p1, 0..cur);
        Ok(())
    }

    pub(crate) fn ingest_fp_input(&mut self) -> Result<()> {
        if let Some(src) = &self.fp_input {
            let src = src.read().unwrap();
            ops::copy(&src, &mut self.prev_activations)?;
        }
        Ok(())
    }

    pub(crate) fn ingest_bp_input(&mut self) -> Result<()> {
        if let Some(src) = &self.bp_input {
            let src = src.read().unwrap();
            ops::copy(&src, &mut self.prev_error_signal)?;
        }
        Ok(())
    }

    /// Applies the activation element-wise over the first `num_neurons` rows
    /// of the current mini-batch. The bias row is left alone: it is already
    /// the constant 1 propagated by the weight-matrix corner invariant.
    pub(crate) fn apply_activation(&mut self) -> Result<()> {
        let view = MatView::new(0..self.num_neurons, 0..self.current_mini_batch_size);
        let act = self.activation;
        let mut acts = self.activations.write().unwrap();
        ops::apply(&mut acts, view, move |z| act.apply(z))?;
        Ok(())
    }

    /// Scales the incoming error signal by the activation derivative at the
    /// pre-activations, then zeroes the bias row: the bias activation is a
    /// constant, so its derivative is exactly zero. With that row zeroed the
    /// full-width backward GEMM is equal to a bias-row-excluded one.
    pub(crate) fn apply_activation_derivative(&mut self) -> Result<()> {
        let cur = self.current_mini_batch_size;
        let view = MatView::new(0..self.num_neurons, 0..cur);
        let act = self.activation;
        ops::zip_apply(
            &mut self.prev_error_signal,
            view,
            &self.preactivations,
            view,
            move |e, z| e * act.derivative(z),
        )?;
        self.prev_error_signal
            .zero_view(MatView::new(self.num_neurons..self.num_neurons + 1, 0..cur))?;
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn num_neurons(&self) -> usize {
        self.num_neurons
    }

    pub fn num_prev_neurons(&self) -> usize {
        self.num_prev_neurons
    }

    pub fn grid(&self) -> &Arc<ProcessGrid> {
        &self.grid
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub fn set_execution_mode(&mut self, mode: ExecutionMode) {
        self.execution_mode = mode;
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn is_setup(&self) -> bool {
        self.is_setup
    }

    pub fn weights(&self) -> &DistMat<T> {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut DistMat<T> {
        &mut self.weights
    }

    pub fn weights_gradient(&self) -> &DistMat<T> {
        &self.weights_gradient
    }

    pub fn preactivations(&self) -> &DistMat<T> {
        &self.preactivations
    }

    pub fn prev_activations(&self) -> &DistMat<T> {
        &self.prev_activations
    }

    /// Direct access to the previous-activations copy; how a driver feeds
    /// the first layer, which has no `fp_input` neighbor.
    pub fn prev_activations_mut(&mut self) -> &mut DistMat<T> {
        &mut self.prev_activations
    }

    pub fn prev_error_signal(&self) -> &DistMat<T> {
        &self.prev_error_signal
    }

    /// Direct access to the incoming error signal; how a loss writes into
    /// the last layer, which has no `bp_input` neighbor.
    pub fn prev_error_signal_mut(&mut self) -> &mut DistMat<T> {
        &mut self.prev_error_signal
    }

    /// Shared handle to this layer's activations (the next layer's
    /// forward-pass input).
    pub fn activations_shared(&self) -> SharedMat<T> {
        self.activations.clone()
    }

    /// Shared handle to this layer's outgoing error signal (the previous
    /// layer's backward-pass input).
    pub fn error_signal_shared(&self) -> SharedMat<T> {
        self.error_signal.clone()
    }

    pub fn set_fp_input(&mut self, input: SharedMat<T>) {
        self.fp_input = Some(input);
    }

    pub fn set_bp_input(&mut self, input: SharedMat<T>) {
        self.bp_input = Some(input);
    }

    pub fn mini_batch_size(&self) -> usize {
        self.mini_batch_size
    }

    pub fn effective_mini_batch_size(&self) -> usize {
        self.effective_mini_batch_size
    }

    /// Sets the global normalization denominator for gradient averaging.
    /// Must be at least the local mini-batch size.
    pub fn set_effective_mini_batch_size(&mut self, size: usize) -> Result<()> {
        if size < self.mini_batch_size {
            return Err(LayerError::EffectiveBatchTooSmall {
                effective: size,
                local: self.mini_batch_size,
            });
        }
        self.effective_mini_batch_size = size;
        Ok(())
    }

    pub fn current_mini_batch_size(&self) -> usize {
        self.current_mini_batch_size
    }

    /// Sets the width of the next mini-batch. Only the trailing mini-batch
    /// of an epoch may be smaller than the allocation; larger is an error.
    pub fn set_current_mini_batch_size(&mut self, size: usize) -> Result<()> {
        if size > self.mini_batch_size {
            return Err(LayerError::MiniBatchOverflow {
                requested: size,
                allocated: self.mini_batch_size,
            });
        }
        self.current_mini_batch_size = size;
        Ok(())
    }

    pub fn fp_time(&self) -> Duration {
        self.fp_time
    }

    pub fn bp_time(&self) -> Duration {
        self.bp_time
    }

    pub(crate) fn add_fp_time(&mut self, elapsed: Duration) {
        self.fp_time += elapsed;
    }

    pub(crate) fn add_bp_time(&mut self, elapsed: Duration) {
        self.bp_time += elapsed;
    }

    /// Resets the cumulative forward/backward timers.
    pub fn reset_counters(&mut self) {
        self.fp_time = Duration::ZERO;
        self.bp_time = Duration::ZERO;
    }
}

/// One stage of a network: the uniform forward/backward/update interface
/// every layer kind implements, with the orchestration provided and the
/// linearity/nonlinearity seams left to override.
pub trait Layer<T: MatElem>: Send {
    fn base(&self) -> &LayerBase<T>;
    fn base_mut(&mut self) -> &mut LayerBase<T>;

    /// Allocates all owned matrices, given the previous layer's width.
    /// Call exactly once, after the full network topology is known; calling
    /// again re-zeros all state.
    fn setup(&mut self, num_prev_neurons: usize) -> Result<()> {
        self.base_mut().setup_matrices(num_prev_neurons)
    }

    /// Rebuilds the per-mini-batch views. Override point for layers whose
    /// weight views are not the identity.
    fn fp_set_std_matrix_view(&mut self) -> Result<()> {
        self.base_mut().set_std_matrix_view()
    }

    /// The layer's linear transform. Identity (no-op) in the base contract.
    fn fp_linearity(&mut self) -> Result<()> {
        Ok(())
    }

    /// Gradient and propagated-error computation. No-op in the base contract.
    fn bp_linearity(&mut self) -> Result<()> {
        Ok(())
    }

    /// Applies the activation function to produce `A` from `Z`.
    fn fp_nonlinearity(&mut self) -> Result<()> {
        self.base_mut().apply_activation()
    }

    /// Scales the incoming error signal by the activation derivative.
    fn bp_nonlinearity(&mut self) -> Result<()> {
        self.base_mut().apply_activation_derivative()
    }

    /// This layer's contribution to the accumulated weight-L2-norm sum.
    /// Zero for layers without a linear transform.
    fn wb_l2norm(&mut self) -> Result<T> {
        Ok(T::zero())
    }

    /// Runs the forward pass for the current mini-batch and threads the
    /// accumulated weight-L2-norm sum through for weight-decay reporting.
    ///
    /// Side effects: overwrites `Z` and `A`; accumulates `fp_time`.
    fn forward_prop(&mut self, prev_wb_l2norm_sum: T) -> Result<T> {
        let start = Instant::now();
        self.base_mut().ingest_fp_input()?;
        self.fp_set_std_matrix_view()?;
        self.fp_linearity()?;
        self.fp_nonlinearity()?;
        let sum = prev_wb_l2norm_sum + self.wb_l2norm()?;
        self.base_mut().add_fp_time(start.elapsed());
        Ok(sum)
    }

    /// Runs the backward pass for the current mini-batch.
    ///
    /// Side effects: overwrites the gradient and the outgoing error signal;
    /// accumulates `bp_time`.
    fn back_prop(&mut self) -> Result<()> {
        let start = Instant::now();
        self.base_mut().ingest_bp_input()?;
        self.bp_nonlinearity()?;
        self.bp_linearity()?;
        self.base_mut().add_bp_time(start.elapsed());
        Ok(())
    }

    /// Applies the optimizer to the weights. Returns whether an update
    /// occurred; the base contract has no learnable parameters and returns
    /// `false`.
    fn update(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Finite-difference gradient verification (see the fully-connected
    /// implementation). Numeric no-op in the base contract.
    fn check_gradient_mb(&mut self, _prev_layer: &dyn Layer<T>, _epsilon: T) -> Result<T> {
        Ok(T::zero())
    }

    /// Pushes this layer's per-step statistics into the summarizer.
    fn summarize(&mut self, summarizer: &mut dyn Summarizer, step: i64) {
        let base = self.base();
        summarizer.scalar(
            &format!("layer{}/fp_time", base.index()),
            step,
            base.fp_time().as_secs_f64(),
        );
        summarizer.scalar(
            &format!("layer{}/bp_time", base.index()),
            step,
            base.bp_time().as_secs_f64(),
        );
    }

    /// Print information at the end of an epoch. Called on the grid root;
    /// implementations synchronize printing if needed.
    fn epoch_print(&self) {}

    /// Called on every layer at the end of each epoch for reset/cleanup.
    fn epoch_reset(&mut self) {}

    /// Resets the layer's stat counters.
    fn reset_counters(&mut self) {
        self.base_mut().reset_counters();
    }

    /// The matrix this layer exposes to the next layer's forward pass.
    fn fp_output(&self) -> SharedMat<T> {
        self.base().activations_shared()
    }

    /// The matrix this layer exposes to the previous layer's backward pass.
    fn bp_output(&self) -> SharedMat<T> {
        self.base().error_signal_shared()
    }

    /// Wires the forward-pass input to the previous layer's activations.
    /// Established once during network wiring, never mid-training.
    fn setup_fp_input(&mut self, fp_input: SharedMat<T>) {
        self.base_mut().set_fp_input(fp_input);
    }

    /// Wires the backward-pass input to the next layer's error signal.
    fn setup_bp_input(&mut self, bp_input: SharedMat<T>) {
        self.base_mut().set_bp_input(bp_input);
    }

    /// Serializes the owned persistent matrices (weights, then gradient) to
    /// a byte stream, adding the bytes written to `bytes`.
    fn save_to_checkpoint(&self, writer: &mut dyn Write, bytes: &mut u64) -> Result<()> {
        let base = self.base();
        checkpoint::write_matrix(writer, &base.weights, bytes)?;
        checkpoint::write_matrix(writer, &base.weights_gradient, bytes)?;
        Ok(())
    }

    /// Restores the matrices written by [`Layer::save_to_checkpoint`].
    /// Fails with [`LayerError::CheckpointShape`] if the stream's shapes do
    /// not match this layer's configuration.
    fn load_from_checkpoint(&mut self, reader: &mut dyn Read, bytes: &mut u64) -> Result<()> {
        let base = self.base_mut();
        checkpoint::read_matrix_into(reader, &mut base.weights, bytes)?;
        checkpoint::read_matrix_into(reader, &mut base.weights_gradient, bytes)?;
        Ok(())
    }

    /// Writes the weights (only) to `path`; the inference-export format.
    fn save_to_file(&self, path: &Path) -> Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        let mut bytes = 0u64;
        checkpoint::write_matrix(&mut file, &self.base().weights, &mut bytes)?;
        std::io::Write::flush(&mut file)?;
        Ok(())
    }

    /// Restores weights written by [`Layer::save_to_file`].
    fn load_from_file(&mut self, path: &Path) -> Result<()> {
        let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
        let mut bytes = 0u64;
        checkpoint::read_matrix_into(&mut file, &mut self.base_mut().weights, &mut bytes)?;
        Ok(())
    }

    /// Writes this layer's checkpoint artifact into a shared directory, one
    /// file per layer keyed by layer index.
    fn save_to_checkpoint_shared(&self, dir: &Path, bytes: &mut u64) -> Result<()> {
        let base = self.base();
        checkpoint::save_shared(
            dir,
            base.index(),
            &[
                ("weights", &base.weights),
                ("weights_gradient", &base.weights_gradient),
            ],
            bytes,
        )
    }

    /// Restores this layer's artifact from a shared checkpoint directory.
    fn load_from_checkpoint_shared(&mut self, dir: &Path, bytes: &mut u64) -> Result<()> {
        let base = self.base_mut();
        let index = base.index();
        let LayerBase {
            weights,
            weights_gradient,
            ..
        } = base;
        checkpoint::load_shared(
            dir,
            index,
            &mut [
                ("weights", weights),
                ("weights_gradient", weights_gradient),
            ],
            bytes,
        )
    }
}
