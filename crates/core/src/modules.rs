//! Module tree: named access to the substitutable parts of a model.
//!
//! A model exposes its structure as dotted paths (`model.layers.3.self_attn`).
//! Attention and MLP blocks live in [`ModuleSlot`]s so they can be moved out,
//! wrapped, and put back while the rest of the model stays untouched.

use std::any::Any;

use candle_core::{Result, Tensor};
use thiserror::Error;

use crate::cache::LayerKvCache;
use crate::config::ModelConfig;
use crate::layers::linear::{hooked, LinearHook, NamedLinear};

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module not found: '{0}'")]
    NotFound(String),
    #[error("module '{path}' is not a {expected} module")]
    WrongKind {
        path: String,
        expected: &'static str,
    },
    #[error("module slot '{0}' is detached")]
    Detached(String),
}

/// Inputs shared by every attention implementation.
#[derive(Debug, Clone, Copy)]
pub struct AttentionInput<'a> {
    pub hidden_states: &'a Tensor,
    pub attention_mask: Option<&'a Tensor>,
    pub output_attentions: bool,
}

impl<'a> AttentionInput<'a> {
    pub fn new(hidden_states: &'a Tensor, attention_mask: Option<&'a Tensor>) -> Self {
        Self {
            hidden_states,
            attention_mask,
            output_attentions: false,
        }
    }

    pub fn with_attentions(mut self) -> Self {
        self.output_attentions = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AttentionOutput {
    pub hidden_states: Tensor,
    pub attn_weights: Option<Tensor>,
}

/// Self-attention block of a decoder layer.
///
/// Every child linear is invoked through the supplied [`LinearHook`]; the
/// block appends its own keys and values to `cache`.
pub trait AttentionModule: Any + Send + Sync {
    fn hidden_size(&self) -> usize;
    fn num_heads(&self) -> usize;
    fn num_kv_heads(&self) -> usize;
    fn head_dim(&self) -> usize;

    /// Child linears in declaration order.
    fn linears(&self) -> Vec<NamedLinear<'_>>;

    /// Non-linear children (rotary tables and the like), by name.
    fn other_children(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn forward(
        &self,
        input: &AttentionInput<'_>,
        cache: &mut LayerKvCache,
        hook: &dyn LinearHook,
    ) -> Result<AttentionOutput>;

    /// Rotated query states `[b, num_heads, q_len, head_dim]` for
    /// `hidden_states` sitting after `past_len` cached positions.
    fn compute_query_states(
        &self,
        hidden_states: &Tensor,
        past_len: usize,
        hook: &dyn LinearHook,
    ) -> Result<Tensor>;

    /// Split the output of a fused QKV projection into `(q, k, v)`, each
    /// `[b, seq, heads * head_dim]`.
    fn split_fused_qkv(&self, _qkv: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        candle_core::bail!("attention module has no fused qkv projection")
    }

    /// Run `xs` through the child linear called `name`.
    fn project(&self, name: &str, xs: &Tensor, hook: &dyn LinearHook) -> Result<Tensor> {
        let linears = self.linears();
        let child = linears
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| candle_core::Error::Msg(format!("no child linear named '{name}'")))?;
        hooked(hook, child.name, child.linear, xs)
    }
}

/// Feed-forward block of a decoder layer.
pub trait MlpModule: Any + Send + Sync {
    fn linears(&self) -> Vec<NamedLinear<'_>>;

    fn forward(&self, xs: &Tensor, hook: &dyn LinearHook) -> Result<Tensor>;
}

/// Owned, replaceable child module.
///
/// The slot is only ever empty inside a single `&mut` borrow while its
/// module is being swapped.
pub struct ModuleSlot<T: ?Sized> {
    inner: Option<Box<T>>,
}

impl<T: ?Sized> ModuleSlot<T> {
    pub fn new(module: Box<T>) -> Self {
        Self {
            inner: Some(module),
        }
    }

    /// The held module, for use inside forward passes.
    pub fn get(&self) -> Result<&T> {
        self.inner
            .as_deref()
            .ok_or_else(|| candle_core::Error::Msg("module slot is detached".to_string()))
    }

    pub fn try_get(&self) -> Option<&T> {
        self.inner.as_deref()
    }

    pub fn take(&mut self) -> Option<Box<T>> {
        self.inner.take()
    }

    /// Install `module`, returning whatever was there before.
    pub fn put(&mut self, module: Box<T>) -> Option<Box<T>> {
        self.inner.replace(module)
    }

    /// Move the held module through `f`, which hands back the module to
    /// install plus a side value. Returns `None` if the slot is detached.
    pub fn replace_with<R>(&mut self, f: impl FnOnce(Box<T>) -> (Box<T>, R)) -> Option<R> {
        let module = self.inner.take()?;
        let (module, out) = f(module);
        self.inner = Some(module);
        Some(out)
    }
}

impl<T: ?Sized> std::fmt::Debug for ModuleSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSlot")
            .field("attached", &self.inner.is_some())
            .finish()
    }
}

/// Structural view of a model: named modules, substitutable children and
/// base parameters.
pub trait ModuleTree {
    fn model_config(&self) -> &ModelConfig;

    /// Every module path, pre-order, decoder layers in execution order.
    fn named_modules(&self) -> Vec<String>;

    fn attention(&self, parent: &str, child: &str) -> std::result::Result<&dyn AttentionModule, ModuleError>;

    fn mlp(&self, parent: &str, child: &str) -> std::result::Result<&dyn MlpModule, ModuleError>;

    fn attention_slot_mut(
        &mut self,
        parent: &str,
        child: &str,
    ) -> std::result::Result<&mut ModuleSlot<dyn AttentionModule>, ModuleError>;

    fn mlp_slot_mut(
        &mut self,
        parent: &str,
        child: &str,
    ) -> std::result::Result<&mut ModuleSlot<dyn MlpModule>, ModuleError>;

    /// Frozen base parameters by dotted path.
    fn named_parameters(&self) -> Vec<(String, Tensor)>;
}

/// Join non-empty path components with `.`.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}.{child}")
    }
}

/// Split `a.b.c` into `("a.b", "c")`; a top-level name has an empty parent.
pub fn split_module_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('.') {
        Some((parent, child)) => (parent, child),
        None => ("", path),
    }
}

/// True if the last component of `path` is exactly `target`.
pub fn path_targets(path: &str, target: &str) -> bool {
    split_module_path(path).1 == target
}

/// Resolve `{prefix}.{idx}` to a layer index below `num_layers`.
pub fn parse_layer_index(
    parent: &str,
    prefix: &str,
    num_layers: usize,
) -> std::result::Result<usize, ModuleError> {
    parent
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|idx| idx.parse::<usize>().ok())
        .filter(|idx| *idx < num_layers)
        .ok_or_else(|| ModuleError::NotFound(parent.to_string()))
}

/// Paths of a block and its children, as listed by `named_modules`.
pub fn block_paths(
    block_path: &str,
    linears: &[NamedLinear<'_>],
    others: &[&'static str],
) -> Vec<String> {
    let mut paths = Vec::with_capacity(1 + linears.len() + others.len());
    paths.push(block_path.to_string());
    paths.extend(linears.iter().map(|l| join_path(block_path, l.name)));
    paths.extend(others.iter().map(|o| join_path(block_path, o)));
    paths
}

/// Weight and bias of each child linear under `block_path`.
pub fn linear_parameters(block_path: &str, linears: &[NamedLinear<'_>]) -> Vec<(String, Tensor)> {
    let mut params = Vec::new();
    for l in linears {
        let base = join_path(block_path, l.name);
        params.push((format!("{base}.weight"), l.linear.weight().clone()));
        if let Some(bias) = l.linear.bias() {
            params.push((format!("{base}.bias"), bias.clone()));
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_paths() {
        assert_eq!(
            split_module_path("model.layers.3.self_attn"),
            ("model.layers.3", "self_attn")
        );
        assert_eq!(split_module_path("lm_head"), ("", "lm_head"));
    }

    #[test]
    fn join_paths() {
        assert_eq!(join_path("", "lm_head"), "lm_head");
        assert_eq!(join_path("model.layers.0", "mlp"), "model.layers.0.mlp");
    }

    #[test]
    fn path_targets_matches_whole_component() {
        assert!(path_targets("model.layers.0.self_attn", "self_attn"));
        assert!(!path_targets("model.layers.0.self_attn.q_proj", "self_attn"));
        assert!(!path_targets("model.layers.0.cross_self_attn", "self_attn"));
        assert!(path_targets("attention", "attention"));
    }

    #[test]
    fn parse_layer_indices() {
        assert_eq!(parse_layer_index("model.layers.2", "model.layers", 4).unwrap(), 2);
        assert!(parse_layer_index("model.layers.4", "model.layers", 4).is_err());
        assert!(parse_layer_index("model.layers", "model.layers", 4).is_err());
        assert!(parse_layer_index("model.layersx.1", "model.layers", 4).is_err());
        assert!(parse_layer_index("gpt_neox.layers.1", "model.layers", 4).is_err());
    }

    #[test]
    fn slot_take_and_put() {
        let mut slot: ModuleSlot<str> = ModuleSlot::new("base".into());
        assert_eq!(slot.get().unwrap(), "base");

        let taken = slot.take().unwrap();
        assert!(slot.get().is_err());
        assert!(slot.try_get().is_none());

        assert!(slot.put(taken).is_none());
        assert_eq!(slot.try_get(), Some("base"));
    }

    #[test]
    fn slot_replace_with() {
        let mut slot: ModuleSlot<str> = ModuleSlot::new("base".into());
        let len = slot.replace_with(|old| (format!("{old}+wrapped").into(), old.len()));
        assert_eq!(len, Some(4));
        assert_eq!(slot.try_get(), Some("base+wrapped"));

        slot.take();
        assert!(slot.replace_with(|m| (m, ())).is_none());
    }
}
