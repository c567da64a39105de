//! # gridnet
//!
//! `gridnet` is the layer core of a distributed deep-learning training toolkit:
//! dense network layers operating on block-distributed matrices across a
//! process grid, implemented in pure Rust on CPU.
//!
//! ## 🎓 The "Why" of a Process Grid
//!
//! Training a network on one machine is a loop: forward pass, backward pass,
//! weight update. To train on many workers at once we split the *mini-batch*
//! across them (data parallelism): every worker holds a full replica of the
//! weights and a slice of the batch columns. Forward and backward passes are
//! then purely local matrix products — the only moment workers must talk is
//! the gradient average, a single **All-Reduce** per layer per step.
//!
//! `gridnet` makes that structure explicit in the type of every matrix:
//!
//! - **Replicated** matrices (weights, gradients) exist in full on every rank.
//! - **Column-distributed** matrices (activations, error signals) are
//!   partitioned by mini-batch column across the grid.
//!
//! ## Modules
//!
//! - [`mat`]: the block-distributed dense matrix, its views and operations.
//! - [`distributed`]: the process grid and collective backends (single
//!   process, or a ring of worker threads over channels).
//! - [`nn`]: the layer contract ([`nn::Layer`]) and the fully-connected layer.
//! - [`optim`]: the optimizer contract plus SGD and Adam.
//! - [`regularizer`]: gradient-side weight regularization.
//! - [`summary`]: the scalar-statistics sink layers report into.
//! - [`checkpoint`]: matrix serialization for checkpoint/restart.
//!
//! ## Example
//!
//! ```rust
//! use gridnet::distributed::ProcessGrid;
//! use gridnet::nn::{Activation, FullyConnectedLayer, Layer, WeightInit};
//! use gridnet::optim::Sgd;
//!
//! let grid = ProcessGrid::local();
//! let mut layer = FullyConnectedLayer::<f32>::new(
//!     1,      // index in the network
//!     4,      // previous layer width
//!     8,      // neurons
//!     16,     // mini-batch size
//!     Activation::Sigmoid,
//!     WeightInit::GlorotNormal,
//!     grid,
//!     Some(Box::new(Sgd::new(0.01))),
//!     Vec::new(),
//! );
//! layer.setup(4).unwrap();
//! ```

pub mod checkpoint;
pub mod distributed;
pub mod mat;
pub mod nn;
pub mod optim;
pub mod regularizer;
pub mod summary;

pub use distributed::{Collective, ProcessGrid, RingComm, SelfComm};
pub use mat::{DistMat, Distribution, MatElem, MatError, MatView, Orientation, SharedMat};
pub use nn::{
    Activation, ExecutionMode, FullyConnectedLayer, Layer, LayerBase, LayerError, WeightInit,
};
pub use optim::{Adam, Optimizer, Sgd};
pub use regularizer::{L2WeightDecay, Regularizer};
pub use summary::{InMemorySummary, Summarizer};
