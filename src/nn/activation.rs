//! Activation functions.
//!
//! The nonlinearity is consumed by the layer as a pluggable element-wise
//! transform: `apply` in the forward pass, `derivative` (evaluated at the
//! *pre-activation*) scaling the error signal in the backward pass.

use crate::mat::MatElem;

/// The element-wise nonlinearity a layer applies after its linear transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// $f(z) = z$. The layer reduces to its linearity.
    #[default]
    Identity,
    /// $f(z) = 1 / (1 + e^{-z})$
    Sigmoid,
    /// $f(z) = \tanh(z)$
    Tanh,
    /// $f(z) = \max(0, z)$
    Relu,
}

impl Activation {
    /// Applies the activation to a single pre-activation value.
    pub fn apply<T: MatElem>(self, z: T) -> T {
        match self {
            Activation::Identity => z,
            Activation::Sigmoid => sigmoid(z),
            Activation::Tanh => z.tanh(),
            Activation::Relu => {
                if z > T::zero() {
                    z
                } else {
                    T::zero()
                }
            }
        }
    }

    /// Derivative of the activation, evaluated at the pre-activation `z`.
    pub fn derivative<T: MatElem>(self, z: T) -> T {
        match self {
            Activation::Identity => T::one(),
            Activation::Sigmoid => {
                let s = sigmoid(z);
                s * (T::one() - s)
            }
            Activation::Tanh => T::one() - z.tanh().powi(2),
            Activation::Relu => {
                if z > T::zero() {
                    T::one()
                } else {
                    T::zero()
                }
            }
        }
    }
}

fn sigmoid<T: MatElem>(z: T) -> T {
    T::one() / (T::one() + (-z).exp())
}
