//! Attention wrapper that mixes learned prompt keys/values into a layer.

use std::any::Any;

use candle_core::{DType, Result, Tensor, Var, D};

use super::error::AdaptionPromptError;
use super::linear::AdaptedLinears;
use crate::cache::LayerKvCache;
use crate::layers::linear::{LinearHook, NamedLinear};
use crate::layers::repeat_kv;
use crate::models::registry::{ArchitectureInfo, QkvLayout};
use crate::modules::{AttentionInput, AttentionModule, AttentionOutput};

/// Adapter state of one attention layer, separable from the module it wraps.
pub struct AttentionAdapter {
    /// `[1, adapter_len, hidden_size]`, standard normal at init.
    adaption_prompt: Var,
    /// `[1]`, zero at init so the adapter starts as a no-op.
    adaption_gate: Var,
    linears: AdaptedLinears,
    adapter_len: usize,
}

impl AttentionAdapter {
    /// Fresh adapter for `base`, on the device and dtype of its weights.
    pub fn new(
        base: &dyn AttentionModule,
        adapter_len: usize,
        add_bias: bool,
        add_scale: bool,
    ) -> std::result::Result<Self, AdaptionPromptError> {
        if is_adapted_attention(base) {
            return Err(AdaptionPromptError::AlreadyAdapted("attention".to_string()));
        }
        let children = base.linears();
        let weight = children
            .first()
            .map(|l| l.linear.weight())
            .ok_or_else(|| {
                AdaptionPromptError::InvalidConfig("attention module has no linears".to_string())
            })?;
        let (dtype, device) = (weight.dtype(), weight.device().clone());

        let prompt = Tensor::randn(0f32, 1.0, (1, adapter_len, base.hidden_size()), &device)?
            .to_dtype(dtype)?;
        Ok(Self {
            adaption_prompt: Var::from_tensor(&prompt)?,
            adaption_gate: Var::zeros(1, dtype, &device)?,
            linears: AdaptedLinears::for_linears(&children, add_bias, add_scale)?,
            adapter_len,
        })
    }

    pub fn adapter_len(&self) -> usize {
        self.adapter_len
    }

    pub fn prompt(&self) -> &Var {
        &self.adaption_prompt
    }

    pub fn gate(&self) -> &Var {
        &self.adaption_gate
    }

    pub fn linears(&self) -> &AdaptedLinears {
        &self.linears
    }

    /// Parameters by local path: `adaption_prompt`, `adaption_gate` and
    /// `linears.{child}.{param}`.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let mut vars = vec![
            ("adaption_prompt".to_string(), self.adaption_prompt.clone()),
            ("adaption_gate".to_string(), self.adaption_gate.clone()),
        ];
        vars.extend(self.linears.named_vars());
        vars
    }

    /// Gated attention of the current queries over the adaption prompt,
    /// projected back to `[b, q_len, hidden]`.
    fn attend(
        &self,
        base: &dyn AttentionModule,
        arch: &ArchitectureInfo,
        hidden_states: &Tensor,
        past_len: usize,
        hook: &dyn LinearHook,
    ) -> Result<Tensor> {
        let b_sz = hidden_states.dim(0)?;
        let num_heads = base.num_heads();
        let num_kv_heads = base.num_kv_heads();
        let head_dim = base.head_dim();
        let prompt = self.adaption_prompt.as_tensor();

        let (key, value) = match arch.qkv_layout {
            QkvLayout::Separate => (
                base.project(arch.k_proj_layer, prompt, hook)?,
                base.project(arch.v_proj_layer, prompt, hook)?,
            ),
            QkvLayout::FusedPerHead => {
                let qkv = base.project(arch.k_proj_layer, prompt, hook)?;
                let (_, key, value) = base.split_fused_qkv(&qkv)?;
                (key, value)
            }
        };

        // (bsz, num_heads, adapter_len, head_dim)
        let to_heads = |t: Tensor| -> Result<Tensor> {
            let t = t
                .reshape((1, self.adapter_len, num_kv_heads, head_dim))?
                .repeat((b_sz, 1, 1, 1))?
                .transpose(1, 2)?;
            repeat_kv(t, num_heads / num_kv_heads)?.contiguous()
        };
        let adapter_k = to_heads(key)?;
        let adapter_v = to_heads(value)?;

        let query_states = base
            .compute_query_states(hidden_states, past_len, hook)?
            .to_dtype(adapter_k.dtype())?
            .contiguous()?;
        let (_, _, q_len, head_dim) = query_states.dims4()?;

        // (bsz, num_heads, q_len, adapter_len)
        let scores = (query_states.matmul(&adapter_k.transpose(2, 3)?)? / (head_dim as f64).sqrt())?;
        let scores = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?
            .to_dtype(query_states.dtype())?
            .broadcast_mul(self.adaption_gate.as_tensor())?;

        // (bsz, q_len, num_heads * head_dim)
        let adapter_output = scores
            .matmul(&adapter_v)?
            .transpose(1, 2)?
            .reshape((b_sz, q_len, num_heads * head_dim))?;
        base.project(arch.o_proj_layer, &adapter_output, hook)
    }
}

/// An attention module wrapped with an [`AttentionAdapter`].
///
/// The wrapped module runs with the adapted linears in place of its own,
/// then the gated adapter output is added to its result.
///
/// For fused QKV layouts the adapter keys, values and recomputed queries are
/// split per head with the architecture's own `split_fused_qkv`, the same
/// split the base attention applies to that linear. A contiguous split by
/// `hidden_size` would mix heads.
pub struct AdaptedAttention {
    base: Box<dyn AttentionModule>,
    adapter: AttentionAdapter,
    arch: &'static ArchitectureInfo,
}

impl AdaptedAttention {
    pub fn new(
        base: Box<dyn AttentionModule>,
        adapter: AttentionAdapter,
        arch: &'static ArchitectureInfo,
    ) -> Self {
        Self {
            base,
            adapter,
            arch,
        }
    }

    pub fn base(&self) -> &dyn AttentionModule {
        self.base.as_ref()
    }

    pub fn adapter(&self) -> &AttentionAdapter {
        &self.adapter
    }

    pub fn into_parts(self) -> (Box<dyn AttentionModule>, AttentionAdapter) {
        (self.base, self.adapter)
    }
}

impl AttentionModule for AdaptedAttention {
    fn hidden_size(&self) -> usize {
        self.base.hidden_size()
    }

    fn num_heads(&self) -> usize {
        self.base.num_heads()
    }

    fn num_kv_heads(&self) -> usize {
        self.base.num_kv_heads()
    }

    fn head_dim(&self) -> usize {
        self.base.head_dim()
    }

    fn linears(&self) -> Vec<NamedLinear<'_>> {
        self.base.linears()
    }

    fn other_children(&self) -> Vec<&'static str> {
        self.base.other_children()
    }

    fn forward(
        &self,
        input: &AttentionInput<'_>,
        cache: &mut LayerKvCache,
        hook: &dyn LinearHook,
    ) -> Result<AttentionOutput> {
        if input.output_attentions {
            candle_core::bail!("output_attentions is not supported by adapted attention");
        }
        let past_len = cache.seq_len();
        let hook = self.adapter.linears.over(hook);

        let output = self.base.forward(input, cache, &hook)?.hidden_states;
        let adapter_output = self.adapter.attend(
            self.base.as_ref(),
            self.arch,
            input.hidden_states,
            past_len,
            &hook,
        )?;

        Ok(AttentionOutput {
            hidden_states: (output + adapter_output)?,
            attn_weights: None,
        })
    }

    fn compute_query_states(
        &self,
        hidden_states: &Tensor,
        past_len: usize,
        hook: &dyn LinearHook,
    ) -> Result<Tensor> {
        let hook = self.adapter.linears.over(hook);
        self.base.compute_query_states(hidden_states, past_len, &hook)
    }

    fn split_fused_qkv(&self, qkv: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        self.base.split_fused_qkv(qkv)
    }
}

pub fn is_adapted_attention(module: &dyn AttentionModule) -> bool {
    (module as &dyn Any).is::<AdaptedAttention>()
}

/// The adapter installed in `module`, if it is an [`AdaptedAttention`].
pub fn attention_adapter(module: &dyn AttentionModule) -> Option<&AttentionAdapter> {
    (module as &dyn Any)
        .downcast_ref::<AdaptedAttention>()
        .map(AdaptedAttention::adapter)
}

/// Unwrap an [`AdaptedAttention`] into the module it wraps and its adapter.
/// Any other module is returned unchanged.
pub fn unwrap_adapted_attention(
    module: Box<dyn AttentionModule>,
) -> (Box<dyn AttentionModule>, Option<AttentionAdapter>) {
    if !is_adapted_attention(module.as_ref()) {
        return (module, None);
    }
    let module: Box<dyn Any> = module;
    match module.downcast::<AdaptedAttention>() {
        Ok(adapted) => {
            let (base, adapter) = adapted.into_parts();
            (base, Some(adapter))
        }
        Err(_) => unreachable!("module type checked above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::BaseLinears;
    use crate::models::registry::find_model_type;
    use crate::models::{GptNeoXForCausalLM, LlamaAttention};
    use crate::modules::ModuleTree;
    use crate::testing::{max_abs_diff, random_var_builder, tiny_gpt_neox_config, tiny_llama_config};
    use candle_core::Device;

    fn llama_attention() -> (candle_nn::VarMap, LlamaAttention) {
        let (varmap, vb) = random_var_builder(DType::F32);
        let attn = LlamaAttention::new(&tiny_llama_config(), vb).unwrap();
        (varmap, attn)
    }

    fn llama_arch() -> &'static ArchitectureInfo {
        find_model_type("llama").unwrap()
    }

    #[test]
    fn adapter_shapes() {
        let (_varmap, attn) = llama_attention();
        let adapter = AttentionAdapter::new(&attn, 5, true, true).unwrap();
        assert_eq!(adapter.prompt().dims(), &[1, 5, 32]);
        assert_eq!(adapter.gate().dims(), &[1]);
        let gate: Vec<f32> = adapter.gate().to_vec1().unwrap();
        assert_eq!(gate, vec![0.0]);
        assert_eq!(adapter.linears().names(), vec!["q_proj", "k_proj", "v_proj", "o_proj"]);

        let names: Vec<String> = adapter.named_vars().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names[0], "adaption_prompt");
        assert_eq!(names[1], "adaption_gate");
        assert!(names.contains(&"linears.k_proj.adaption_bias".to_string()));
    }

    #[test]
    fn zero_gate_matches_base_output() {
        let (_varmap, attn) = llama_attention();
        let adapter = AttentionAdapter::new(&attn, 4, true, true).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 32), &Device::Cpu).unwrap();

        let mut base_cache = LayerKvCache::new();
        let expected = attn
            .forward(&AttentionInput::new(&xs, None), &mut base_cache, &BaseLinears)
            .unwrap()
            .hidden_states;

        let adapted = AdaptedAttention::new(Box::new(attn), adapter, llama_arch());
        let mut cache = LayerKvCache::new();
        let actual = adapted
            .forward(&AttentionInput::new(&xs, None), &mut cache, &BaseLinears)
            .unwrap()
            .hidden_states;

        assert!(max_abs_diff(&expected, &actual) < 1e-6);
        assert_eq!(cache.seq_len(), 3);
    }

    #[test]
    fn open_gate_changes_output() {
        let (_varmap, attn) = llama_attention();
        let adapter = AttentionAdapter::new(&attn, 4, true, true).unwrap();
        adapter
            .gate()
            .set(&Tensor::new(&[1f32], &Device::Cpu).unwrap())
            .unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 2, 32), &Device::Cpu).unwrap();

        let mut base_cache = LayerKvCache::new();
        let base_out = attn
            .forward(&AttentionInput::new(&xs, None), &mut base_cache, &BaseLinears)
            .unwrap()
            .hidden_states;

        let adapted = AdaptedAttention::new(Box::new(attn), adapter, llama_arch());
        let out = adapted
            .forward(&AttentionInput::new(&xs, None), &mut LayerKvCache::new(), &BaseLinears)
            .unwrap()
            .hidden_states;
        assert_eq!(out.dims(), &[1, 2, 32]);
        assert!(max_abs_diff(&base_out, &out) > 1e-4);
    }

    #[test]
    fn output_attentions_is_rejected() {
        let (_varmap, attn) = llama_attention();
        let adapter = AttentionAdapter::new(&attn, 2, true, true).unwrap();
        let adapted = AdaptedAttention::new(Box::new(attn), adapter, llama_arch());
        let xs = Tensor::zeros((1, 2, 32), DType::F32, &Device::Cpu).unwrap();
        let result = adapted.forward(
            &AttentionInput::new(&xs, None).with_attentions(),
            &mut LayerKvCache::new(),
            &BaseLinears,
        );
        assert!(result.is_err());
    }

    #[test]
    fn wrapping_adapted_module_is_rejected() {
        let (_varmap, attn) = llama_attention();
        let adapter = AttentionAdapter::new(&attn, 2, true, true).unwrap();
        let adapted = AdaptedAttention::new(Box::new(attn), adapter, llama_arch());
        assert!(matches!(
            AttentionAdapter::new(&adapted, 2, true, true),
            Err(AdaptionPromptError::AlreadyAdapted(_))
        ));
    }

    #[test]
    fn unwrap_returns_base_and_adapter() {
        let (_varmap, attn) = llama_attention();
        let adapter = AttentionAdapter::new(&attn, 3, true, true).unwrap();
        let module: Box<dyn AttentionModule> =
            Box::new(AdaptedAttention::new(Box::new(attn), adapter, llama_arch()));
        assert!(attention_adapter(module.as_ref()).is_some());

        let (base, adapter) = unwrap_adapted_attention(module);
        assert!(!is_adapted_attention(base.as_ref()));
        assert_eq!(adapter.unwrap().adapter_len(), 3);

        let (same, none) = unwrap_adapted_attention(base);
        assert!(none.is_none());
        assert!(attention_adapter(same.as_ref()).is_none());
    }

    #[test]
    fn fused_qkv_adapter_on_gpt_neox() {
        let cfg = tiny_gpt_neox_config();
        let (_varmap, vb) = random_var_builder(DType::F32);
        let mut model = GptNeoXForCausalLM::new(&cfg, vb).unwrap();
        let arch = find_model_type("gpt_neox").unwrap();

        let slot = model.attention_slot_mut("gpt_neox.layers.1", "attention").unwrap();
        let base = slot.take().unwrap();
        let adapter = AttentionAdapter::new(base.as_ref(), 3, true, true).unwrap();
        adapter
            .gate()
            .set(&Tensor::new(&[0.5f32], &Device::Cpu).unwrap())
            .unwrap();
        assert_eq!(adapter.linears().names(), vec!["query_key_value", "dense"]);
        slot.put(Box::new(AdaptedAttention::new(base, adapter, arch)));

        let xs = Tensor::randn(0f32, 1.0, (2, 4, 32), &Device::Cpu).unwrap();
        let attn = model.attention("gpt_neox.layers.1", "attention").unwrap();
        let out = attn
            .forward(&AttentionInput::new(&xs, None), &mut LayerKvCache::new(), &BaseLinears)
            .unwrap();
        assert_eq!(out.hidden_states.dims(), &[2, 4, 32]);
    }

    #[test]
    fn gradients_reach_gate_and_prompt() {
        let (_varmap, attn) = llama_attention();
        let adapter = AttentionAdapter::new(&attn, 4, true, true).unwrap();
        adapter
            .gate()
            .set(&Tensor::new(&[0.1f32], &Device::Cpu).unwrap())
            .unwrap();
        let gate = adapter.gate().clone();
        let prompt = adapter.prompt().clone();
        let adapted = AdaptedAttention::new(Box::new(attn), adapter, llama_arch());

        let xs = Tensor::randn(0f32, 1.0, (1, 3, 32), &Device::Cpu).unwrap();
        let out = adapted
            .forward(&AttentionInput::new(&xs, None), &mut LayerKvCache::new(), &BaseLinears)
            .unwrap()
            .hidden_states;
        let loss = out.sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        assert!(grads.get(gate.as_tensor()).is_some());
        assert!(grads.get(prompt.as_tensor()).is_some());
    }
}
