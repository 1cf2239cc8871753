use std::any::Any;

use candle_core::{Result, Tensor, Var};

use super::error::AdaptionPromptError;
use super::linear::AdaptedLinears;
use crate::layers::linear::{LinearHook, NamedLinear};
use crate::modules::MlpModule;

/// Adapter state of one MLP: an adapted linear per child linear.
pub struct MlpAdapter {
    linears: AdaptedLinears,
}

impl MlpAdapter {
    pub fn new(
        base: &dyn MlpModule,
        add_bias: bool,
        add_scale: bool,
    ) -> std::result::Result<Self, AdaptionPromptError> {
        if is_adapted_mlp(base) {
            return Err(AdaptionPromptError::AlreadyAdapted("mlp".to_string()));
        }
        Ok(Self {
            linears: AdaptedLinears::for_linears(&base.linears(), add_bias, add_scale)?,
        })
    }

    pub fn linears(&self) -> &AdaptedLinears {
        &self.linears
    }

    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.linears.named_vars()
    }
}

/// An MLP running with adapted linears in place of its own.
pub struct AdaptedMlp {
    base: Box<dyn MlpModule>,
    adapter: MlpAdapter,
}

impl AdaptedMlp {
    pub fn new(base: Box<dyn MlpModule>, adapter: MlpAdapter) -> Self {
        Self { base, adapter }
    }

    pub fn adapter(&self) -> &MlpAdapter {
        &self.adapter
    }

    pub fn into_parts(self) -> (Box<dyn MlpModule>, MlpAdapter) {
        (self.base, self.adapter)
    }
}

impl MlpModule for AdaptedMlp {
    fn linears(&self) -> Vec<NamedLinear<'_>> {
        self.base.linears()
    }

    fn forward(&self, xs: &Tensor, hook: &dyn LinearHook) -> Result<Tensor> {
        self.base.forward(xs, &self.adapter.linears.over(hook))
    }
}

pub fn is_adapted_mlp(module: &dyn MlpModule) -> bool {
    (module as &dyn Any).is::<AdaptedMlp>()
}

pub fn mlp_adapter(module: &dyn MlpModule) -> Option<&MlpAdapter> {
    (module as &dyn Any)
        .downcast_ref::<AdaptedMlp>()
        .map(AdaptedMlp::adapter)
}

/// Unwrap an [`AdaptedMlp`]; any other module is returned unchanged.
pub fn unwrap_adapted_mlp(module: Box<dyn MlpModule>) -> (Box<dyn MlpModule>, Option<MlpAdapter>) {
    if !is_adapted_mlp(module.as_ref()) {
        return (module, None);
    }
    let module: Box<dyn Any> = module;
    match module.downcast::<AdaptedMlp>() {
        Ok(adapted) => {
            let (base, adapter) = adapted.into_parts();
            (base, Some(adapter))
        }
        Err(_) => unreachable!("module type checked above"),
    }
}
