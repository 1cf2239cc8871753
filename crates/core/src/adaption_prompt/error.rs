use thiserror::Error;

use crate::modules::ModuleError;

#[derive(Error, Debug)]
pub enum AdaptionPromptError {
    #[error("unsupported model type for adaption prompt: '{0}'")]
    UnsupportedModelType(String),

    #[error("invalid adaption prompt config: {0}")]
    InvalidConfig(String),

    #[error("adapter with name '{0}' already exists")]
    DuplicateAdapter(String),

    #[error("adapter with name '{0}' does not exist")]
    UnknownAdapter(String),

    #[error("config specifies more adapter layers '{requested}' than the model has '{available}'")]
    TooManyAdapterLayers { requested: usize, available: usize },

    #[error("cannot delete the active adapter '{0}'")]
    DeleteActiveAdapter(String),

    #[error("module '{0}' is already adapted")]
    AlreadyAdapted(String),

    #[error("module '{0}' is not adapted")]
    NotAdapted(String),

    #[error("module tree error: {0}")]
    Module(#[from] ModuleError),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_too_many_layers() {
        let e = AdaptionPromptError::TooManyAdapterLayers {
            requested: 4,
            available: 2,
        };
        assert_eq!(
            e.to_string(),
            "config specifies more adapter layers '4' than the model has '2'"
        );
    }

    #[test]
    fn error_from_module_error() {
        let e: AdaptionPromptError = ModuleError::NotFound("model.layers.9".into()).into();
        assert!(e.to_string().contains("model.layers.9"));
    }
}
