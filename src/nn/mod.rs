//! Network layers: the [`Layer`] contract and its concrete implementations.

pub mod activation;
pub mod fully_connected;
pub mod layer;

pub use activation::Activation;
pub use fully_connected::{FullyConnectedLayer, WeightInit};
pub use layer::{ExecutionMode, Layer, LayerBase, LayerError};
