//! Adapter checkpoints in the PEFT directory layout.
//!
//! ```text
//! adapter_dir/
//!   adapter_config.json        AdaptionPromptV2Config
//!   adapter_model.safetensors  adapter parameters keyed by module path
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use thiserror::Error;
use tracing::{info, warn};

use super::config::AdaptionPromptV2Config;
use super::error::AdaptionPromptError;
use super::model::AdaptionPromptV2Model;
use crate::models::AdaptableModel;

pub const CONFIG_FILE: &str = "adapter_config.json";
pub const WEIGHTS_FILE: &str = "adapter_model.safetensors";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("weights error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error(transparent)]
    Adapter(#[from] AdaptionPromptError),
    #[error("tensor '{0}' not found in checkpoint")]
    MissingTensor(String),
    #[error("shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("missing checkpoint file: {}", .0.display())]
    MissingFile(PathBuf),
}

/// Write `adapter_name`'s config and parameters to `dir`, creating it if
/// needed. Works for both the active adapter and cached ones.
pub fn save_adapter<M: AdaptableModel>(
    model: &AdaptionPromptV2Model<M>,
    adapter_name: &str,
    dir: impl AsRef<Path>,
) -> Result<(), CheckpointError> {
    let dir = dir.as_ref();
    let config = model
        .config(adapter_name)
        .ok_or_else(|| AdaptionPromptError::UnknownAdapter(adapter_name.to_string()))?;
    let params = model.adapter_parameters(adapter_name)?;

    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(config)?)?;

    let tensors: HashMap<String, Tensor> = params
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, dir.join(WEIGHTS_FILE))?;

    info!(
        adapter = adapter_name,
        dir = %dir.display(),
        tensors = tensors.len(),
        "saved adapter checkpoint"
    );
    Ok(())
}

/// Read `adapter_config.json` from `dir`.
pub fn load_config(dir: impl AsRef<Path>) -> Result<AdaptionPromptV2Config, CheckpointError> {
    let path = dir.as_ref().join(CONFIG_FILE);
    if !path.exists() {
        return Err(CheckpointError::MissingFile(path));
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Add the adapter stored in `dir` under `adapter_name` and make it active.
///
/// Every adapter parameter must be present in the checkpoint with a matching
/// shape; otherwise the adapter is not added. Tensors are converted to the
/// dtype and device of the model's weights.
pub fn load_adapter<M: AdaptableModel>(
    model: &mut AdaptionPromptV2Model<M>,
    adapter_name: &str,
    dir: impl AsRef<Path>,
) -> Result<(), CheckpointError> {
    let dir = dir.as_ref();
    let config = load_config(dir)?;

    let weights_path = dir.join(WEIGHTS_FILE);
    if !weights_path.exists() {
        return Err(CheckpointError::MissingFile(weights_path));
    }
    let tensors = candle_core::safetensors::load(&weights_path, &Device::Cpu)?;

    model.add_adapter_with_init(adapter_name, config, |params| {
        let mut used = HashSet::with_capacity(params.len());
        for (name, var) in params {
            let tensor = tensors
                .get(name)
                .ok_or_else(|| CheckpointError::MissingTensor(name.clone()))?;
            if tensor.dims() != var.dims() {
                return Err(CheckpointError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    actual: tensor.dims().to_vec(),
                });
            }
            var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
            used.insert(name.as_str());
        }

        let mut unexpected: Vec<&str> = tensors
            .keys()
            .map(String::as_str)
            .filter(|k| !used.contains(k))
            .collect();
        if !unexpected.is_empty() {
            unexpected.sort_unstable();
            warn!(adapter = adapter_name, keys = ?unexpected, "ignoring unexpected checkpoint tensors");
        }
        Ok(())
    })?;

    info!(adapter = adapter_name, dir = %dir.display(), "loaded adapter checkpoint");
    Ok(())
}

/// Wrap `model` with the adapter stored in `dir` as its only adapter.
pub fn from_pretrained<M: AdaptableModel>(
    model: M,
    adapter_name: &str,
    dir: impl AsRef<Path>,
) -> Result<AdaptionPromptV2Model<M>, CheckpointError> {
    let mut wrapped = AdaptionPromptV2Model::without_adapters(model)?;
    load_adapter(&mut wrapped, adapter_name, dir)?;
    Ok(wrapped)
}
