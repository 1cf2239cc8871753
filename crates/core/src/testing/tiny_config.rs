use crate::config::ModelConfig;

/// Tiny Llama config for tests: 2 layers, 32 hidden, 4 query heads sharing
/// 2 KV heads.
pub fn tiny_llama_config() -> ModelConfig {
    ModelConfig {
        architectures: vec!["LlamaForCausalLM".to_string()],
        model_type: "llama".to_string(),
        hidden_size: 32,
        num_attention_heads: 4,
        num_key_value_heads: Some(2),
        num_hidden_layers: 2,
        intermediate_size: 64,
        vocab_size: 64,
        max_position_embeddings: 64,
        head_dim: None,
        hidden_act: "silu".to_string(),
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        tie_word_embeddings: false,
        extra: serde_json::Map::new(),
    }
}

/// Tiny GPT-NeoX config for tests: 2 layers, 32 hidden, 2 heads, a quarter
/// of each head rotated.
pub fn tiny_gpt_neox_config() -> ModelConfig {
    let mut extra = serde_json::Map::new();
    extra.insert("rotary_pct".into(), serde_json::json!(0.25));
    extra.insert("use_parallel_residual".into(), serde_json::json!(true));
    extra.insert("layer_norm_eps".into(), serde_json::json!(1e-5));
    ModelConfig {
        architectures: vec!["GPTNeoXForCausalLM".to_string()],
        model_type: "gpt_neox".to_string(),
        hidden_size: 32,
        num_attention_heads: 2,
        num_key_value_heads: None,
        num_hidden_layers: 2,
        intermediate_size: 128,
        vocab_size: 64,
        max_position_embeddings: 64,
        head_dim: None,
        hidden_act: "gelu".to_string(),
        rms_norm_eps: 1e-6,
        rope_theta: 10000.0,
        tie_word_embeddings: false,
        extra,
    }
}
