//! Adaption Prompt v2: learned prompt keys/values gated into the top
//! attention layers, plus per-linear scale and bias adapters.
//!
//! [`AdaptionPromptV2Model`] owns the wrapped model and manages any number of
//! named adapters, of which at most one is installed at a time.

mod attention;
mod checkpoint;
mod config;
mod error;
mod linear;
mod mlp;
mod model;

pub use attention::{
    attention_adapter, is_adapted_attention, unwrap_adapted_attention, AdaptedAttention,
    AttentionAdapter,
};
pub use checkpoint::{
    from_pretrained, load_adapter, load_config, save_adapter, CheckpointError, CONFIG_FILE, WEIGHTS_FILE,
};
pub use config::{is_adaption_param, prepare_config, AdaptionPromptV2Config, PeftType};
pub use error::AdaptionPromptError;
pub use linear::{AdaptedLinear, AdaptedLinears, StackedHook};
pub use mlp::{is_adapted_mlp, mlp_adapter, unwrap_adapted_mlp, AdaptedMlp, MlpAdapter};
pub use model::{AdaptionPromptV2Model, LayerAdapter};
