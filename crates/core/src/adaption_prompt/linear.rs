//! Per-linear adapter parameters.

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::Linear;

use crate::layers::linear::{BaseLinears, LinearHook, NamedLinear};

/// Learned input scale and output bias around one base linear.
///
/// The forward computation is:
/// ```text
/// output = base_linear(x * adaption_scale) + adaption_bias
/// ```
/// With `adaption_scale = 1` and `adaption_bias = 0` at initialization the
/// output equals the base linear's exactly.
pub struct AdaptedLinear {
    adaption_scale: Option<Var>,
    adaption_bias: Option<Var>,
    in_features: usize,
    out_features: usize,
}

impl AdaptedLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        add_bias: bool,
        add_scale: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let adaption_scale = if add_scale {
            Some(Var::ones(in_features, dtype, device)?)
        } else {
            None
        };
        let adaption_bias = if add_bias {
            Some(Var::zeros(out_features, dtype, device)?)
        } else {
            None
        };
        Ok(Self {
            adaption_scale,
            adaption_bias,
            in_features,
            out_features,
        })
    }

    /// Adapter sized for `linear`, on the device and dtype of its weight.
    pub fn for_linear(linear: &NamedLinear<'_>, add_bias: bool, add_scale: bool) -> Result<Self> {
        let (in_features, out_features) = linear.features()?;
        let weight = linear.linear.weight();
        Self::new(
            in_features,
            out_features,
            add_bias,
            add_scale,
            weight.dtype(),
            weight.device(),
        )
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn scale(&self) -> Option<&Var> {
        self.adaption_scale.as_ref()
    }

    pub fn bias(&self) -> Option<&Var> {
        self.adaption_bias.as_ref()
    }

    /// Parameters by local name (`adaption_scale`, `adaption_bias`).
    pub fn named_vars(&self) -> Vec<(&'static str, &Var)> {
        let mut vars = Vec::with_capacity(2);
        if let Some(scale) = &self.adaption_scale {
            vars.push(("adaption_scale", scale));
        }
        if let Some(bias) = &self.adaption_bias {
            vars.push(("adaption_bias", bias));
        }
        vars
    }

    /// Apply the adapter around `inner`'s call of `linear`.
    pub fn forward_with(
        &self,
        inner: &dyn LinearHook,
        name: &str,
        linear: &Linear,
        xs: &Tensor,
    ) -> Result<Tensor> {
        let scaled;
        let xs = match &self.adaption_scale {
            Some(scale) => {
                scaled = xs.broadcast_mul(scale.as_tensor())?;
                &scaled
            }
            None => xs,
        };
        let out = inner.forward(name, linear, xs)?;
        match &self.adaption_bias {
            Some(bias) => out.broadcast_add(bias.as_tensor()),
            None => Ok(out),
        }
    }

    pub fn forward(&self, linear: &Linear, xs: &Tensor) -> Result<Tensor> {
        self.forward_with(&BaseLinears, "", linear, xs)
    }
}

/// Adapted linears of one module, keyed by child name in declaration order.
#[derive(Default)]
pub struct AdaptedLinears {
    linears: Vec<(&'static str, AdaptedLinear)>,
}

impl AdaptedLinears {
    /// One [`AdaptedLinear`] per child linear.
    pub fn for_linears(linears: &[NamedLinear<'_>], add_bias: bool, add_scale: bool) -> Result<Self> {
        let linears = linears
            .iter()
            .map(|l| Ok((l.name, AdaptedLinear::for_linear(l, add_bias, add_scale)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { linears })
    }

    pub fn get(&self, name: &str) -> Option<&AdaptedLinear> {
        self.linears
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, l)| l)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.linears.iter().map(|(n, _)| *n).collect()
    }

    pub fn len(&self) -> usize {
        self.linears.len()
    }

    pub fn is_empty(&self) -> bool {
        self.linears.is_empty()
    }

    /// Parameters as `linears.{child}.{param}`.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.linears
            .iter()
            .flat_map(|(child, linear)| {
                linear
                    .named_vars()
                    .into_iter()
                    .map(move |(param, var)| (format!("linears.{child}.{param}"), var.clone()))
            })
            .collect()
    }

    /// Hook that applies these adapters on top of `inner`.
    pub fn over<'a>(&'a self, inner: &'a dyn LinearHook) -> StackedHook<'a> {
        StackedHook {
            adapted: self,
            inner,
        }
    }
}

impl LinearHook for AdaptedLinears {
    fn forward(&self, name: &str, linear: &Linear, xs: &Tensor) -> Result<Tensor> {
        self.over(&BaseLinears).forward(name, linear, xs)
    }
}

/// [`AdaptedLinears`] layered over another hook.
pub struct StackedHook<'a> {
    adapted: &'a AdaptedLinears,
    inner: &'a dyn LinearHook,
}

impl LinearHook for StackedHook<'_> {
    fn forward(&self, name: &str, linear: &Linear, xs: &Tensor) -> Result<Tensor> {
        match self.adapted.get(name) {
            Some(adapted) => adapted.forward_with(self.inner, name, linear, xs),
            None => self.inner.forward(name, linear, xs),
        }
    }
}
