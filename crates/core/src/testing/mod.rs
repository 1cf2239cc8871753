//! Shared test utilities for adaption-core.
//!
//! Tiny model configurations and tensor helpers for unit and integration
//! tests. Everything runs on the CPU.

mod tiny_config;

pub use tiny_config::{tiny_gpt_neox_config, tiny_llama_config};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

/// Largest absolute elementwise difference between two tensors of the
/// same shape. Panics on shape or dtype conversion errors.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    assert_eq!(a.dims(), b.dims(), "shape mismatch");
    let a: Vec<f32> = a
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1())
        .expect("flatten lhs");
    let b: Vec<f32> = b
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1())
        .expect("flatten rhs");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// VarBuilder whose missing weights are freshly initialised `Var`s, giving
/// a randomly initialised model. Keep the `VarMap` to reach the weights.
pub fn random_var_builder(dtype: DType) -> (VarMap, VarBuilder<'static>) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, &Device::Cpu);
    (varmap, vb)
}

/// `[1, seq]` u32 token ids.
pub fn token_ids(ids: &[u32]) -> Tensor {
    Tensor::new(ids, &Device::Cpu)
        .and_then(|t| t.unsqueeze(0))
        .expect("token ids")
}
