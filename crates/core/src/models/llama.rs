use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};

use super::CausalLm;
use crate::cache::{KvCache, LayerKvCache};
use crate::config::ModelConfig;
use crate::layers::{
    causal_mask, hooked, rms_norm, scaled_dot_product_attention, BaseLinears, LinearHook,
    NamedLinear, RmsNorm, RotaryEmbedding, SwiGluMlp,
};
use crate::modules::{
    block_paths, join_path, linear_parameters, parse_layer_index, AttentionInput,
    AttentionModule, AttentionOutput, MlpModule, ModuleError, ModuleSlot, ModuleTree,
};

const LAYERS_PREFIX: &str = "model.layers";

// ─── Attention ───────────────────────────────────────────────────────────────

pub struct LlamaAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rotary_emb: RotaryEmbedding,
    hidden_size: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl LlamaAttention {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let num_heads = cfg.num_attention_heads;
        let num_kv_heads = cfg.num_kv_heads();
        let head_dim = cfg.head_dim();
        if num_heads % num_kv_heads != 0 {
            candle_core::bail!(
                "num_attention_heads ({num_heads}) must be a multiple of num_key_value_heads ({num_kv_heads})"
            );
        }

        let q_proj = linear_no_bias(cfg.hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(cfg.hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, cfg.hidden_size, vb.pp("o_proj"))?;

        let rotary_emb = RotaryEmbedding::new(
            head_dim,
            cfg.max_position_embeddings,
            cfg.rope_theta,
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary_emb,
            hidden_size: cfg.hidden_size,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }
}

impl AttentionModule for LlamaAttention {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    fn head_dim(&self) -> usize {
        self.head_dim
    }

    fn linears(&self) -> Vec<NamedLinear<'_>> {
        vec![
            NamedLinear::new("q_proj", &self.q_proj),
            NamedLinear::new("k_proj", &self.k_proj),
            NamedLinear::new("v_proj", &self.v_proj),
            NamedLinear::new("o_proj", &self.o_proj),
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
        let xs = input.hidden_states;
        let (b_sz, q_len, _) = xs.dims3()?;
        let seqlen_offset = cache.seq_len();

        let q = self.compute_query_states(xs, seqlen_offset, hook)?;
        let k = hooked(hook, "k_proj", &self.k_proj, xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = hooked(hook, "v_proj", &self.v_proj, xs)?
            .reshape((b_sz, q_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self.rotary_emb.apply_one(&k, seqlen_offset)?;
        let (k, v) = cache.append(&k, &v)?;

        let (attn_output, attn_probs) = scaled_dot_product_attention(
            &q,
            &k,
            &v,
            input.attention_mask,
            self.num_heads / self.num_kv_heads,
        )?;

        Ok(AttentionOutput {
            hidden_states: hooked(hook, "o_proj", &self.o_proj, &attn_output)?,
            attn_weights: input.output_attentions.then_some(attn_probs),
        })
    }

    fn compute_query_states(
        &self,
        hidden_states: &Tensor,
        past_len: usize,
        hook: &dyn LinearHook,
    ) -> Result<Tensor> {
        let (b_sz, q_len, _) = hidden_states.dims3()?;
        let q = hooked(hook, "q_proj", &self.q_proj, hidden_states)?
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        self.rotary_emb.apply_one(&q, past_len)
    }
}

// ─── Decoder Layer ───────────────────────────────────────────────────────────

struct LlamaDecoderLayer {
    self_attn: ModuleSlot<dyn AttentionModule>,
    mlp: ModuleSlot<dyn MlpModule>,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl LlamaDecoderLayer {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = LlamaAttention::new(cfg, vb.pp("self_attn"))?;
        let mlp = SwiGluMlp::new(cfg.hidden_size, cfg.intermediate_size, vb.pp("mlp"))?;
        let input_layernorm =
            rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = rms_norm(
            cfg.hidden_size,
            cfg.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            self_attn: ModuleSlot::new(Box::new(self_attn)),
            mlp: ModuleSlot::new(Box::new(mlp)),
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        cache: &mut LayerKvCache,
    ) -> Result<Tensor> {
        let residual = xs;
        let hidden = self.input_layernorm.forward(xs)?;
        let attn = self.self_attn.get()?.forward(
            &AttentionInput::new(&hidden, attention_mask),
            cache,
            &BaseLinears,
        )?;
        let xs = (attn.hidden_states + residual)?;
        let residual = &xs;
        let hidden = self.post_attention_layernorm.forward(&xs)?;
        let hidden = self.mlp.get()?.forward(&hidden, &BaseLinears)?;
        hidden + residual
    }
}

// ─── Model ───────────────────────────────────────────────────────────────────

pub struct LlamaForCausalLM {
    embed_tokens: Embedding,
    layers: Vec<LlamaDecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    tie_word_embeddings: bool,
    cfg: ModelConfig,
    device: Device,
    dtype: DType,
}

impl LlamaForCausalLM {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("model");

        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("embed_tokens"))?;

        let vb_l = vb_m.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| LlamaDecoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;

        let lm_head = if cfg.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            tie_word_embeddings: cfg.tie_word_embeddings,
            cfg: cfg.clone(),
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    fn layer(&self, parent: &str) -> std::result::Result<&LlamaDecoderLayer, ModuleError> {
        let idx = parse_layer_index(parent, LAYERS_PREFIX, self.layers.len())?;
        Ok(&self.layers[idx])
    }

    fn layer_mut(
        &mut self,
        parent: &str,
    ) -> std::result::Result<&mut LlamaDecoderLayer, ModuleError> {
        let idx = parse_layer_index(parent, LAYERS_PREFIX, self.layers.len())?;
        Ok(&mut self.layers[idx])
    }
}

impl CausalLm for LlamaForCausalLM {
    fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> Result<Tensor> {
        let (_b_sz, seq_len) = input_ids.dims2()?;
        let seqlen_offset = cache.seq_len();
        let mask = causal_mask(seq_len, seqlen_offset, self.dtype, &self.device)?;

        let mut xs = self.embed_tokens.forward(input_ids)?;
        for (layer_idx, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs, mask.as_ref(), cache.layer_mut(layer_idx)?)?;
        }

        self.norm.forward(&xs)?.apply(&self.lm_head)
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

impl ModuleTree for LlamaForCausalLM {
    fn model_config(&self) -> &ModelConfig {
        &self.cfg
    }

    fn named_modules(&self) -> Vec<String> {
        let mut paths = vec![
            "model".to_string(),
            "model.embed_tokens".to_string(),
            LAYERS_PREFIX.to_string(),
        ];
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_path = join_path(LAYERS_PREFIX, &i.to_string());
            paths.push(layer_path.clone());
            if let Some(attn) = layer.self_attn.try_get() {
                paths.extend(block_paths(
                    &join_path(&layer_path, "self_attn"),
                    &attn.linears(),
                    &attn.other_children(),
                ));
            }
            if let Some(mlp) = layer.mlp.try_get() {
                paths.extend(block_paths(&join_path(&layer_path, "mlp"), &mlp.linears(), &[]));
            }
            paths.push(join_path(&layer_path, "input_layernorm"));
            paths.push(join_path(&layer_path, "post_attention_layernorm"));
        }
        paths.push("model.norm".to_string());
        paths.push("lm_head".to_string());
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
            "self_attn" => layer.self_attn.try_get().ok_or(ModuleError::Detached(path)),
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
            "self_attn" | "input_layernorm" | "post_attention_layernorm" => {
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
            "self_attn" => Ok(&mut layer.self_attn),
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
            "self_attn" => Err(ModuleError::WrongKind {
                path,
                expected: "mlp",
            }),
            _ => Err(ModuleError::NotFound(path)),
        }
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = vec![(
            "model.embed_tokens.weight".to_string(),
            self.embed_tokens.embeddings().clone(),
        )];
        for (i, layer) in self.layers.iter().enumerate() {
            let layer_path = join_path(LAYERS_PREFIX, &i.to_string());
            if let Some(attn) = layer.self_attn.try_get() {
                params.extend(linear_parameters(
                    &join_path(&layer_path, "self_attn"),
                    &attn.linears(),
                ));
            }
            if let Some(mlp) = layer.mlp.try_get() {
                params.extend(linear_parameters(&join_path(&layer_path, "mlp"), &mlp.linears()));
            }
            params.push((
                format!("{layer_path}.input_layernorm.weight"),
                layer.input_layernorm.weight().clone(),
            ));
            params.push((
                format!("{layer_path}.post_attention_layernorm.weight"),
                layer.post_attention_layernorm.weight().clone(),
            ));
        }
        params.push(("model.norm.weight".to_string(), self.norm.weight().clone()));
        if !self.tie_word_embeddings {
            params.push(("lm_head.weight".to_string(), self.lm_head.weight().clone()));
        }
        params
    }
}
