pub mod gpt_neox;
pub mod llama;
pub mod registry;

pub use gpt_neox::{GptNeoXAttention, GptNeoXForCausalLM};
pub use llama::{LlamaAttention, LlamaForCausalLM};
pub use registry::{find_model_type, ArchitectureInfo, QkvLayout};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use thiserror::Error;

use crate::cache::KvCache;
use crate::config::ModelConfig;
use crate::modules::{AttentionModule, MlpModule, ModuleError, ModuleSlot, ModuleTree};

/// Decoder-only language model with an incremental KV cache.
pub trait CausalLm: Send {
    /// Logits `[b, seq, vocab]` for `input_ids` `[b, seq]` following the
    /// positions already held in `cache`.
    fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> candle_core::Result<Tensor>;

    fn num_layers(&self) -> usize;

    fn device(&self) -> &Device;

    fn dtype(&self) -> DType;

    fn new_cache(&self) -> KvCache {
        KvCache::new(self.num_layers())
    }
}

/// A model that can both run and be restructured by the adapter engine.
pub trait AdaptableModel: CausalLm + ModuleTree {}

impl<T: CausalLm + ModuleTree> AdaptableModel for T {}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unsupported model type: {0}")]
    UnsupportedModelType(String),
    #[error("model load error: {0}")]
    Load(#[from] candle_core::Error),
}

/// Construct the model matching `cfg.model_type`.
pub fn from_config(
    cfg: &ModelConfig,
    vb: VarBuilder,
) -> Result<Box<dyn AdaptableModel>, ModelError> {
    match cfg.model_type.as_str() {
        "llama" => Ok(Box::new(LlamaForCausalLM::new(cfg, vb)?)),
        "gpt_neox" => Ok(Box::new(GptNeoXForCausalLM::new(cfg, vb)?)),
        other => Err(ModelError::UnsupportedModelType(other.into())),
    }
}

impl CausalLm for Box<dyn AdaptableModel> {
    fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> candle_core::Result<Tensor> {
        (**self).forward(input_ids, cache)
    }

    fn num_layers(&self) -> usize {
        (**self).num_layers()
    }

    fn device(&self) -> &Device {
        (**self).device()
    }

    fn dtype(&self) -> DType {
        (**self).dtype()
    }
}

impl ModuleTree for Box<dyn AdaptableModel> {
    fn model_config(&self) -> &ModelConfig {
        (**self).model_config()
    }

    fn named_modules(&self) -> Vec<String> {
        (**self).named_modules()
    }

    fn attention(&self, parent: &str, child: &str) -> Result<&dyn AttentionModule, ModuleError> {
        (**self).attention(parent, child)
    }

    fn mlp(&self, parent: &str, child: &str) -> Result<&dyn MlpModule, ModuleError> {
        (**self).mlp(parent, child)
    }

    fn attention_slot_mut(
        &mut self,
        parent: &str,
        child: &str,
    ) -> Result<&mut ModuleSlot<dyn AttentionModule>, ModuleError> {
        (**self).attention_slot_mut(parent, child)
    }

    fn mlp_slot_mut(
        &mut self,
        parent: &str,
        child: &str,
    ) -> Result<&mut ModuleSlot<dyn MlpModule>, ModuleError> {
        (**self).mlp_slot_mut(parent, child)
    }

    fn named_parameters(&self) -> Vec<(String, Tensor)> {
        (**self).named_parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{tiny_gpt_neox_config, tiny_llama_config};

    #[test]
    fn from_config_dispatches_on_model_type() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let llama = from_config(&tiny_llama_config(), vb.clone()).unwrap();
        assert!(llama
            .named_modules()
            .contains(&"model.layers.0.self_attn".to_string()));

        let neox = from_config(&tiny_gpt_neox_config(), vb).unwrap();
        assert!(neox
            .named_modules()
            .contains(&"gpt_neox.layers.0.attention".to_string()));
        assert_eq!(neox.new_cache().num_layers(), neox.num_layers());
    }

    #[test]
    fn from_config_rejects_unknown_model_type() {
        let mut cfg = tiny_llama_config();
        cfg.model_type = "mistral".into();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        assert!(matches!(
            from_config(&cfg, vb),
            Err(ModelError::UnsupportedModelType(t)) if t == "mistral"
        ));
    }
}
