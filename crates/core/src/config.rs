use serde::{Deserialize, Serialize};

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

/// Base model configuration, as found in a HuggingFace `config.json`.
///
/// Only the fields the supported architectures read are typed; anything
/// architecture-specific lands in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,
    pub model_type: String,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta", alias = "rotary_emb_base")]
    pub rope_theta: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelConfig {
    /// Number of key/value heads, falling back to MHA.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Per-head dimension, falling back to `hidden_size / num_attention_heads`.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(|v| v.as_f64())
    }

    pub fn extra_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architectures: vec!["LlamaForCausalLM".to_string()],
            model_type: "llama".to_string(),
            hidden_size: 4096,
            num_attention_heads: 32,
            num_key_value_heads: Some(32),
            num_hidden_layers: 32,
            intermediate_size: 11008,
            vocab_size: 32000,
            max_position_embeddings: 2048,
            head_dim: None,
            hidden_act: default_hidden_act(),
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            tie_word_embeddings: false,
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LLAMA_7B_CONFIG: &str = r#"{
        "architectures": ["LlamaForCausalLM"],
        "bos_token_id": 1,
        "eos_token_id": 2,
        "hidden_act": "silu",
        "hidden_size": 4096,
        "initializer_range": 0.02,
        "intermediate_size": 11008,
        "max_position_embeddings": 2048,
        "model_type": "llama",
        "num_attention_heads": 32,
        "num_hidden_layers": 32,
        "pad_token_id": 0,
        "rms_norm_eps": 1e-06,
        "tie_word_embeddings": false,
        "torch_dtype": "float16",
        "use_cache": true,
        "vocab_size": 32000
    }"#;

    const PYTHIA_70M_CONFIG: &str = r#"{
        "architectures": ["GPTNeoXForCausalLM"],
        "bos_token_id": 0,
        "eos_token_id": 0,
        "hidden_act": "gelu",
        "hidden_size": 512,
        "initializer_range": 0.02,
        "intermediate_size": 2048,
        "layer_norm_eps": 1e-05,
        "max_position_embeddings": 2048,
        "model_type": "gpt_neox",
        "num_attention_heads": 8,
        "num_hidden_layers": 6,
        "rotary_emb_base": 10000,
        "rotary_pct": 0.25,
        "tie_word_embeddings": false,
        "torch_dtype": "float16",
        "use_cache": true,
        "use_parallel_residual": true,
        "vocab_size": 50304
    }"#;

    #[test]
    fn parse_llama_7b_config() {
        let config: ModelConfig =
            serde_json::from_str(LLAMA_7B_CONFIG).expect("failed to parse config");

        assert_eq!(config.model_type, "llama");
        assert_eq!(config.hidden_size, 4096);
        assert_eq!(config.num_attention_heads, 32);
        assert_eq!(config.num_kv_heads(), 32);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.rope_theta, 10000.0);
        assert!(!config.tie_word_embeddings);
        assert!(config.extra.contains_key("pad_token_id"));
    }

    #[test]
    fn parse_pythia_config_with_aliases() {
        let config: ModelConfig =
            serde_json::from_str(PYTHIA_70M_CONFIG).expect("failed to parse config");

        assert_eq!(config.model_type, "gpt_neox");
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.rope_theta, 10000.0);
        assert_eq!(config.extra_f64("rotary_pct"), Some(0.25));
        assert_eq!(config.extra_f64("layer_norm_eps"), Some(1e-5));
        assert_eq!(config.extra_bool("use_parallel_residual"), Some(true));
    }

    #[test]
    fn explicit_gqa_heads() {
        let mut config = ModelConfig::default();
        config.num_key_value_heads = Some(8);
        assert_eq!(config.num_attention_heads / config.num_kv_heads(), 4);
    }
}
