pub mod attention;
pub mod linear;
pub mod mask;
pub mod mlp;
pub mod normalization;
pub mod rotary;

pub use attention::{repeat_kv, scaled_dot_product_attention};
pub use linear::{hooked, BaseLinears, LinearHook, NamedLinear};
pub use mask::causal_mask;
pub use mlp::{activation_from_name, GeluMlp, SwiGluMlp};
pub use normalization::{layer_norm, rms_norm, LayerNorm, RmsNorm};
pub use rotary::RotaryEmbedding;
