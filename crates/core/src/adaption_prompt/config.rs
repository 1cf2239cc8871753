//! Adapter configuration, PEFT `adapter_config.json` compatible.

use serde::{Deserialize, Serialize};

use super::error::AdaptionPromptError;
use crate::config::ModelConfig;
use crate::models::registry::find_model_type;

/// PEFT method tag stored in `adapter_config.json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeftType {
    #[default]
    #[serde(rename = "ADAPTION_PROMPT_V2")]
    AdaptionPromptV2,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptionPromptV2Config {
    #[serde(default)]
    pub peft_type: PeftType,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    /// Adapters added in inference mode are frozen.
    #[serde(default)]
    pub inference_mode: bool,
    /// Name of the attention submodules to adapt. Filled from the
    /// architecture table when absent.
    #[serde(default)]
    pub attention_module: Option<String>,
    #[serde(default)]
    pub mlp_module: Option<String>,
    /// Number of adapter tokens inserted per adapted layer.
    pub adapter_len: usize,
    /// Number of adapted layers, counted from the top.
    pub adapter_layers: usize,
    #[serde(default = "default_true")]
    pub add_bias: bool,
    #[serde(default = "default_true")]
    pub add_scale: bool,
}

impl AdaptionPromptV2Config {
    pub fn new(adapter_len: usize, adapter_layers: usize) -> Self {
        Self {
            peft_type: PeftType::AdaptionPromptV2,
            task_type: None,
            base_model_name_or_path: None,
            inference_mode: false,
            attention_module: None,
            mlp_module: None,
            adapter_len,
            adapter_layers,
            add_bias: true,
            add_scale: true,
        }
    }

    pub fn with_bias(mut self, add_bias: bool) -> Self {
        self.add_bias = add_bias;
        self
    }

    pub fn with_scale(mut self, add_scale: bool) -> Self {
        self.add_scale = add_scale;
        self
    }

    pub fn with_inference_mode(mut self, inference_mode: bool) -> Self {
        self.inference_mode = inference_mode;
        self
    }

    /// `(attention_module, mlp_module)` of a prepared config.
    pub fn module_names(&self) -> Result<(&str, &str), AdaptionPromptError> {
        match (self.attention_module.as_deref(), self.mlp_module.as_deref()) {
            (Some(attn), Some(mlp)) => Ok((attn, mlp)),
            _ => Err(AdaptionPromptError::InvalidConfig(
                "config has not been prepared for a model".to_string(),
            )),
        }
    }
}

/// Fill module names for `model_config.model_type` and validate `config`.
pub fn prepare_config(
    mut config: AdaptionPromptV2Config,
    model_config: &ModelConfig,
) -> Result<AdaptionPromptV2Config, AdaptionPromptError> {
    let arch = find_model_type(&model_config.model_type)
        .ok_or_else(|| AdaptionPromptError::UnsupportedModelType(model_config.model_type.clone()))?;

    if config.attention_module.is_none() {
        config.attention_module = Some(arch.attention_module.to_string());
    }
    if config.mlp_module.is_none() {
        config.mlp_module = Some(arch.mlp_module.to_string());
    }

    if config.adapter_len == 0 {
        return Err(AdaptionPromptError::InvalidConfig(
            "adapter_len must be greater than 0".to_string(),
        ));
    }
    if config.adapter_layers == 0 {
        return Err(AdaptionPromptError::InvalidConfig(
            "adapter_layers must be greater than 0".to_string(),
        ));
    }
    let (attn, mlp) = config.module_names()?;
    for name in [attn, mlp] {
        if name.is_empty() || name.contains('.') {
            return Err(AdaptionPromptError::InvalidConfig(format!(
                "module name '{name}' must be a single path component"
            )));
        }
    }

    Ok(config)
}

/// True if `name` is an adapter parameter: its last dotted component starts
/// with `adaption_`.
pub fn is_adaption_param(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .is_some_and(|last| last.starts_with("adaption_"))
}
