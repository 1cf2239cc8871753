//! Static catalog of architectures that can carry adaption prompts.
//!
//! Each entry names the submodules the adapter engine targets and how query
//! states are recovered, so supporting a new architecture only requires a
//! single catalog entry plus its `AttentionModule` implementation.

/// How an architecture projects keys and values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QkvLayout {
    /// Separate `k_proj` / `v_proj` linears.
    Separate,
    /// One fused linear whose output is split per head into q, k and v.
    FusedPerHead,
}

/// Module names and layout for one supported `model_type`.
#[derive(Debug, Clone, Copy)]
pub struct ArchitectureInfo {
    /// HuggingFace `config.json` `model_type`.
    pub model_type: &'static str,
    /// Human-readable name for summaries and logs.
    pub display_name: &'static str,
    pub attention_module: &'static str,
    pub mlp_module: &'static str,
    pub k_proj_layer: &'static str,
    pub v_proj_layer: &'static str,
    pub o_proj_layer: &'static str,
    pub qkv_layout: QkvLayout,
}

// ─── Static Catalog ──────────────────────────────────────────────────────────

static ARCHITECTURES: &[ArchitectureInfo] = &[
    ArchitectureInfo {
        model_type: "llama",
        display_name: "Llama",
        attention_module: "self_attn",
        mlp_module: "mlp",
        k_proj_layer: "k_proj",
        v_proj_layer: "v_proj",
        o_proj_layer: "o_proj",
        qkv_layout: QkvLayout::Separate,
    },
    ArchitectureInfo {
        model_type: "gpt_neox",
        display_name: "GPT-NeoX",
        attention_module: "attention",
        mlp_module: "mlp",
        k_proj_layer: "query_key_value",
        v_proj_layer: "query_key_value",
        o_proj_layer: "dense",
        qkv_layout: QkvLayout::FusedPerHead,
    },
];

/// Look up an architecture by `model_type`.
pub fn find_model_type(model_type: &str) -> Option<&'static ArchitectureInfo> {
    ARCHITECTURES.iter().find(|a| a.model_type == model_type)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llama_uses_separate_projections() {
        let info = find_model_type("llama").expect("llama should be in the catalog");
        assert_eq!(info.attention_module, "self_attn");
        assert_eq!(info.k_proj_layer, "k_proj");
        assert_eq!(info.v_proj_layer, "v_proj");
        assert_eq!(info.o_proj_layer, "o_proj");
        assert_eq!(info.qkv_layout, QkvLayout::Separate);
        assert_eq!(info.display_name, "Llama");
    }

    #[test]
    fn gpt_neox_shares_fused_projection() {
        let info = find_model_type("gpt_neox").expect("gpt_neox should be in the catalog");
        assert_eq!(info.attention_module, "attention");
        assert_eq!(info.k_proj_layer, info.v_proj_layer);
        assert_eq!(info.o_proj_layer, "dense");
        assert_eq!(info.qkv_layout, QkvLayout::FusedPerHead);
    }

    #[test]
    fn unknown_model_type() {
        assert!(find_model_type("mistral").is_none());
    }
}
