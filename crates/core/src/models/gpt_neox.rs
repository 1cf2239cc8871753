use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, linear, linear_no_bias, Embedding, Linear, VarBuilder};

use super::CausalLm;
use crate::cache::{KvCache, LayerKvCache};
use crate::config::ModelConfig;
use crate::layers::{
    activation_from_name, causal_mask, hooked, layer_norm, scaled_dot_product_attention,
    BaseLinears, GeluMlp, LayerNorm, LinearHook, NamedLinear, RotaryEmbedding,
};
use crate::modules::{
    block_paths, join_path, linear_parameters, parse_layer_index, AttentionInput,
    AttentionModule, AttentionOutput, MlpModule, ModuleError, ModuleSlot, ModuleTree,
};

const LAYERS_PREFIX: &str = "gpt_neox.layers";

// ─── GPT-NeoX Config Extraction ──────────────────────────────────────────────

/// GPT-NeoX-specific fields carried in `ModelConfig::extra`.
struct GptNeoXConfig {
    use_parallel_residual: bool,
    rotary_pct: f64,
    layer_norm_eps: f64,
}

impl GptNeoXConfig {
    fn from_model_config(cfg: &ModelConfig) -> Self {
        Self {
            use_parallel_residual: cfg.extra_bool("use_parallel_residual").unwrap_or(true),
            rotary_pct: cfg.extra_f64("rotary_pct").unwrap_or(0.25),
            layer_norm_eps: cfg.extra_f64("layer_norm_eps").unwrap_or(1e-5),
        }
    }
}

// ─── Attention ───────────────────────────────────────────────────────────────

/// GPT-NeoX attention with a fused `query_key_value` projection.
///
/// The fused output is laid out per head: `[.., num_heads, 3 * head_dim]`,
/// with q, k and v occupying consecutive `head_dim` slices of each head.
pub struct GptNeoXAttention {
    query_key_value: Linear,
    dense: Linear,
    rotary_emb: RotaryEmbedding,
    hidden_size: usize,
    num_heads: usize,
    head_dim: usize,
}

impl GptNeoXAttention {
    fn new(cfg: &ModelConfig, neox_cfg: &GptNeoXConfig, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let head_dim = cfg.head_dim();

        let query_key_value = linear(
            cfg.hidden_size,
            3 * num_heads * head_dim,
            vb.pp("query_key_value"),
        )?;
        let dense = linear(num_heads * head_dim, cfg.hidden_size, vb.pp("dense"))?;

        let rotary_emb = RotaryEmbedding::new_partial(
            head_dim,
            cfg.max_position_embeddings,
            cfg.rope_theta,
            neox_cfg.rotary_pct,
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            query_key_value,
            dense,
            rotary_emb,
            hidden_size: cfg.hidden_size,
            num_heads,
            head_dim,
        })
    }

    fn to_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len, _) = x.dims3()?;
        x.reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)
    }
}

impl AttentionModule for GptNeoXAttention {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn num_kv_heads(&self) -> usize {
        self.num_heads
    }

    fn head_dim(&self) -> usize {
        self.head_dim
    }

    fn linears(&self) -> Vec<NamedLinear<'_>> {
        vec![
            NamedLinear::new("query_key_value", &self.query_key_value),
            NamedLinear::new("dense", &self.dense),
        ]
    }

    fn other_children(&self) -> Vec<&'static str> {
        vec!["rotary_emb"]
    }

    fn forward(
        &self,
        input: &AttentionInput<'_>,
        cache: &mut LayerKvCache,
        hook: &dyn LinearHook,
    ) -> Result<AttentionOutput> {
        let seqlen_offset = cache.seq_len();
        let qkv = hooked(
            hook,
            "query_key_value",
            &self.query_key_value,
            input.hidden_states,
        )?;
        let (q, k, v) = self.split_fused_qkv(&qkv)?;
        let q = self.rotary_emb.apply_one(&self.to_heads(&q)?, seqlen_offset)?;
        let k = self.rotary_emb.apply_one(&self.to_heads(&k)?, seqlen_offset)?;
        let v = self.to_heads(&v)?;
        let (k, v) = cache.append(&k, &v)?;

        let (attn_output, attn_probs) =
            scaled_dot_product_attention(&q, &k, &v, input.attention_mask, 1)?;

        Ok(AttentionOutput {
            hidden_states: hooked(hook, "dense", &self.dense, &attn_output)?,
            attn_weights: input.output_attentions.then_some(attn_probs),
        })
    }

    fn compute_query_states(
        &self,
        hidden_states: &Tensor,
        past_len: usize,
        hook: &dyn LinearHook,
    ) -> Result<Tensor> {
        let qkv = hooked(hook, "query_key_value", &self.query_key_value, hidden_states)?;
        let (q, _, _) = self.split_fused_qkv(&qkv)?;
        self.rotary_emb.apply_one(&self.to_heads(&q)?, past_len)
    }

    fn split_fused_qkv(&self, qkv: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b_sz, seq_len, _) = qkv.dims3()?;
        let qkv = qkv.reshape((b_sz, seq_len, self.num_heads, 3 * self.head_dim))?;
        let flat = |t: Tensor| t.reshape((b_sz, seq_len, self.num_heads * self.head_dim));
        Ok((
            flat(qkv.narrow(D::Minus1, 0, self.head_dim)?.contiguous()?)?,
            flat(qkv.narrow(D::Minus1, self.head_dim, self.head_dim)?.contiguous()?)?,
            flat(qkv.narrow(D::Minus1, 2 * self.head_dim, self.head_dim)?.contiguous()?)?,
        ))
    }
}

// ─── Decoder Layer ───────────────────────────────────────────────────────────

struct GptNeoXLayer {
    attention: ModuleSlot<dyn AttentionModule>,
    mlp: ModuleSlot<dyn MlpModule>,
    input_layernorm: LayerNorm,
    post_attention_layernorm: LayerNorm,
    use_parallel_residual: bool,
}

impl GptNeoXLayer {
    fn new(cfg: &ModelConfig, neox_cfg: &GptNeoXConfig, vb: VarBuilder) -> Result<Self> {
        let attention = GptNeoXAttention::new(cfg, neox_cfg, vb.pp("attention"))?;
        let mlp = GeluMlp::new(
            cfg.hidden_size,
            cfg.intermediate_size,
            activation_from_name(&cfg.hidden_act)?,
            vb.pp("mlp"),
        )?;
        let input_layernorm = layer_norm(
            cfg.hidden_size,
            neox_cfg.layer_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = layer_norm(
            cfg.hidden_size,
            neox_cfg.layer_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            attention: ModuleSlot::new(Box::new(attention)),
            mlp: ModuleSlot::new(Box::new(mlp)),
            input_layernorm,
            post_attention_layernorm,
            use_parallel_residual: neox_cfg.use_parallel_residual,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        cache: &mut LayerKvCache,
    ) -> Result<Tensor> {
        let hidden = self.input_layernorm.forward(xs)?;
        let attn_output = self
            .attention
            .get()?
            .forward(&AttentionInput::new(&hidden, attention_mask), cache, &BaseLinears)?
            .hidden_states;

        if self.use_parallel_residual {
            // x + attn(ln1(x)) + mlp(ln2(x))
            let mlp_input = self.post_attention_layernorm.forward(xs)?;
            let mlp_output = self.mlp.get()?.forward(&mlp_input, &BaseLinears)?;
            (mlp_output + attn_output)? + xs
        } else {
            let attn_output = (attn_output + xs)?;
            let mlp_input = self.post_attention_layernorm.forward(&attn_output)?;
            let mlp_output = self.mlp.get()?.forward(&mlp_input, &BaseLinears)?;
            mlp_output + attn_output
        }
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

pub struct GptNeoXForCausalLM {
    embed_in: Embedding,
    layers: Vec<GptNeoXLayer>,
    final_layer_norm: LayerNorm,
    embed_out: Linear,
    cfg: ModelConfig,
    device: Device,
    dtype: DType,
}

impl GptNeoXForCausalLM {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let neox_cfg = GptNeoXConfig::from_model_config(cfg);
        let vb_m = vb.pp("gpt_neox");

        let embed_in = embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("embed_in"))?;

        let vb_l = vb_m.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| GptNeoXLayer::new(cfg, &neox_cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let final_layer_norm = layer_norm(
            cfg.hidden_size,
            neox_cfg.layer_norm_eps,
            vb_m.pp("final_layer_norm"),
        )?;
        let embed_out = linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("embed_out"))?;

        Ok(Self {
            embed_in,
            layers,
            final_layer_norm,
            embed_out,
            cfg: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    fn layer(&self, parent: &str) -> std::result::Result<&GptNeoXLayer, ModuleError> {
        let idx = parse_layer_index(parent, LAYERS_PREFIX, self.layers.len())?;
        Ok(&self.layers[idx])
    }

    fn layer_mut(&mut self, parent: &str) -> std::result::Result<&mut GptNeoXLayer, ModuleError> {
        let idx = parse_layer_index(parent, LAYERS_PREFIX, self.layers.len())?;
        Ok(&mut self.layers[idx])
    }
}

impl CausalLm for GptNeoXForCausalLM {
    fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        let (_b_sz, seq_len) = input_ids.dims2()?;
        let seqlen_offset = cache.seq_len();
        let mask = causal_mask(seq_len, seqlen_offset, self.dtype, &self.device)?;

        let mut xs = self.embed_in.forward(input_ids)?;
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs, mask.as_ref(), cache.layer_mut(layer_idx)?)?;
        }

        self.final_layer_norm.forward(&xs)?.apply(&self.embed_out)
    }

    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

impl ModuleTree for GptNeoXForCausalLM {
    fn model_config(&self) -> &ModelConfig {
        &self.cfg
    }

    fn named_modules(&self) -> Vec<String> {
        let mut paths = vec![
            "gpt_neox".to_string(),
            "gpt_neox.embed_in".to_string(),
            LAYERS_PREFIX.to_string(),
        ];
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_path = join_path(LAYERS_PREFIX, &i.to_string());
            paths.push(layer_path.clone());
            paths.push(join_path(&layer_path, "input_layernorm"));
            paths.push(join_path(&layer_path, "post_attention_layernorm"));
            if let Some(attn) = layer.attention.try_get() {
                paths.extend(block_paths(
                    &join_path(&layer_path, "attention"),
                    &attn.linears(),
                    &attn.other_children(),
                ));
            }
            if let Some(mlp) = layer.mlp.try_get() {
                paths.extend(block_paths(&join_path(&layer_path, "mlp"), &mlp.linears(), &[]));
            }
        }
        paths.push("gpt_neox.final_layer_norm".to_string());
        paths.push("embed_out".to_string());
        paths
    }

    fn attention(
        &self,
        parent: &str,
        child: &str,
    ) -> std::result::Result<&dyn AttentionModule, ModuleError> {
        let layer = self.layer(parent)?;
        let path = join_path(parent, child);
        match child {
            "attention" => layer.attention.try_get().ok_or(ModuleError::Detached(path)),
            "mlp" | "input_layernorm" | "post_attention_layernorm" => {
                Err(ModuleError::WrongKind {
                    path,
                    expected: "attention",
                })
            }
            _ => Err(ModuleError::NotFound(path)),
        }
    }

    fn mlp(&self, parent: &str, child: &str) -> std::result::Result<&dyn MlpModule, ModuleError> {
        let layer = self.layer(parent)?;
        let path = join_path(parent, child);
        match child {
            "mlp" => layer.mlp.try_get().ok_or(ModuleError::Detached(path)),
            "attention" | "input_layernorm" | "post_attention_layernorm" => {
                Err(ModuleError::WrongKind {
                    path,
                    expected: "mlp",
                })
            }
            _ => Err(ModuleError::NotFound(path)),
        }
    }

    fn attention_slot_mut(
        &mut self,
        parent: &str,
        child: &str,
    ) -> std::result::Result<&mut ModuleSlot<dyn AttentionModule>, ModuleError> {
        let path = join_path(parent, child);
        let layer = self.layer_mut(parent)?;
        match child {
            "attention" => Ok(&mut layer.attention),
            "mlp" => Err(ModuleError::WrongKind {
                path,
                expected: "attention",
            }),
            _ => Err(ModuleError::NotFound(path)),
        }
    }

    fn mlp_slot_mut(
        &mut self,
        parent: &str,
        child: &str,
    ) -> std::result::Result<&mut ModuleSlot<dyn MlpModule>, ModuleError> {
        let path = join_path(parent, child);
        let layer = self.layer_mut(parent)?;
        match child {
            "mlp" => Ok(&mut layer.mlp),
            "attention" => Err(ModuleError::WrongKind {
                path,
                expected: "mlp",
            }),
            _ => Err(ModuleError::NotFound(path)),
        }
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let norm_params = |path: String, norm: &LayerNorm| {
            [
                (format!("{path}.weight"), norm.weight().clone()),
                (format!("{path}.bias"), norm.bias().clone()),
            ]
        };

        let mut params = vec![(
            "gpt_neox.embed_in.weight".to_string(),
            self.embed_in.embeddings().clone(),
        )];
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_path = join_path(LAYERS_PREFIX, &i.to_string());
            params.extend(norm_params(
                join_path(&layer_path, "input_layernorm"),
                &layer.input_layernorm,
            ));
            params.extend(norm_params(
                join_path(&layer_path, "post_attention_layernorm"),
                &layer.post_attention_layernorm,
            ));
            if let Some(attn) = layer.attention.try_get() {
                params.extend(linear_parameters(
                    &join_path(&layer_path, "attention"),
                    &attn.linears(),
                ));
            }
            if let Some(mlp) = layer.mlp.try_get() {
                params.extend(linear_parameters(&join_path(&layer_path, "mlp"), &mlp.linears()));
            }
        }
        params.extend(norm_params(
            "gpt_neox.final_layer_norm".to_string(),
            &self.final_layer_norm,
        ));
        params.push(("embed_out.weight".to_string(), self.embed_out.weight().clone()));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{max_abs_diff, random_var_builder, tiny_gpt_neox_config};

    fn tiny_model(cfg: &ModelConfig) -> (candle_nn::VarMap, GptNeoXForCausalLM) {
        let (varmap, vb) = random_var_builder(DType::F32);
        let model = GptNeoXForCausalLM::new(cfg, vb).expect("build tiny gpt-neox");
        (varmap, model)
    }

    #[test]
    fn forward_logits_shape() {
        let cfg = tiny_gpt_neox_config();
        let (_varmap, model) = tiny_model(&cfg);
        let input_ids = Tensor::new(&[[1u32, 2, 3], [4, 5, 6]], &Device::Cpu).unwrap();
        let mut cache = model.new_cache();
        let logits = model.forward(&input_ids, &mut cache).unwrap();
        assert_eq!(logits.dims(), &[2, 3, cfg.vocab_size]);
    }

    #[test]
    fn split_fused_qkv_is_per_head_interleaved() {
        let cfg = tiny_gpt_neox_config();
        let (_varmap, vb) = random_var_builder(DType::F32);
        let attn =
            GptNeoXAttention::new(&cfg, &GptNeoXConfig::from_model_config(&cfg), vb).unwrap();
        let heads = cfg.num_attention_heads;
        let head_dim = cfg.head_dim();

        // head h carries [q_h | k_h | v_h]; value = 100 * h + slot
        let data: Vec<f32> = (0..heads)
            .flat_map(|h| {
                (0..3).flat_map(move |slot| {
                    std::iter::repeat((100 * h + slot) as f32).take(head_dim)
                })
            })
            .collect();
        let qkv = Tensor::from_vec(data, (1, 1, 3 * heads * head_dim), &Device::Cpu).unwrap();
        let (q, k, v) = attn.split_fused_qkv(&qkv).unwrap();
        assert_eq!(q.dims(), &[1, 1, heads * head_dim]);

        let k: Vec<f32> = k.flatten_all().unwrap().to_vec1().unwrap();
        let v: Vec<f32> = v.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(k[0], 1.0);
        assert_eq!(k[head_dim], 101.0);
        assert_eq!(v[head_dim], 102.0);
    }

    #[test]
    fn sequential_residual_incremental_decode() {
        let mut cfg = tiny_gpt_neox_config();
        cfg.extra
            .insert("use_parallel_residual".into(), serde_json::Value::Bool(false));
        let (_varmap, model) = tiny_model(&cfg);
        let device = Device::Cpu;

        let mut cache = model.new_cache();
        let full = model
            .forward(&Tensor::new(&[[3u32, 1, 4]], &device).unwrap(), &mut cache)
            .unwrap();

        let mut cache = model.new_cache();
        model
            .forward(&Tensor::new(&[[3u32, 1]], &device).unwrap(), &mut cache)
            .unwrap();
        let last = model
            .forward(&Tensor::new(&[[4u32]], &device).unwrap(), &mut cache)
            .unwrap();

        assert!(max_abs_diff(&full.narrow(1, 2, 1).unwrap(), &last) < 1e-4);
    }

    #[test]
    fn module_tree_paths() {
        let cfg = tiny_gpt_neox_config();
        let (_varmap, model) = tiny_model(&cfg);
        let modules = model.named_modules();
        assert!(modules.contains(&"gpt_neox.layers.0.attention".to_string()));
        assert!(modules.contains(&"gpt_neox.layers.0.attention.query_key_value".to_string()));
        assert!(modules.contains(&"gpt_neox.layers.1.mlp.dense_4h_to_h".to_string()));

        assert!(model.attention("gpt_neox.layers.1", "attention").is_ok());
        assert!(model.attention("model.layers.1", "attention").is_err());

        let names: Vec<String> = model
            .named_parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert!(names.contains(&"gpt_neox.layers.0.attention.query_key_value.bias".to_string()));
        assert!(names.contains(&"gpt_neox.final_layer_norm.bias".to_string()));
    }
}
