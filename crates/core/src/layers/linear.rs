//! Named child linears and the hook used to intercept them.
//!
//! Attention and MLP modules never call their child `Linear`s directly.
//! Every projection goes through a [`LinearHook`] together with the child's
//! name, so a wrapper can substitute its own computation for any child
//! without touching the wrapped module's weights.

use candle_core::{Module, Result, Tensor};
use candle_nn::Linear;

/// Intercepts calls to named child linears.
pub trait LinearHook {
    fn forward(&self, name: &str, linear: &Linear, xs: &Tensor) -> Result<Tensor>;
}

/// Calls the base linear unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseLinears;

impl LinearHook for BaseLinears {
    fn forward(&self, _name: &str, linear: &Linear, xs: &Tensor) -> Result<Tensor> {
        linear.forward(xs)
    }
}

/// A child linear and its name within the owning module.
#[derive(Debug, Clone, Copy)]
pub struct NamedLinear<'a> {
    pub name: &'static str,
    pub linear: &'a Linear,
}

impl<'a> NamedLinear<'a> {
    pub fn new(name: &'static str, linear: &'a Linear) -> Self {
        Self { name, linear }
    }

    /// `(in_features, out_features)` read from the weight shape.
    pub fn features(&self) -> Result<(usize, usize)> {
        let (out_features, in_features) = self.linear.weight().dims2()?;
        Ok((in_features, out_features))
    }
}

/// Run `linear` (registered as `name`) through `hook`.
pub fn hooked(hook: &dyn LinearHook, name: &str, linear: &Linear, xs: &Tensor) -> Result<Tensor> {
    hook.forward(name, linear, xs)
}
