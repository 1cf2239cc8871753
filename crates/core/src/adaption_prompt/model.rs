//! Multi-adapter lifecycle: creating, swapping, enabling and removing
//! adaption prompts on a wrapped model.
//!
//! The top `adapter_layers` attention and MLP modules of the model are
//! replaced with [`AdaptedAttention`] / [`AdaptedMlp`] wrappers. Only the
//! active adapter is ever installed; every other adapter's state lives in
//! the engine's cache. Switching adapters moves the installed state into the
//! cache and the requested state out of it, so the active adapter is never
//! present in both places. Disabling moves the active adapter into the cache
//! too, which leaves the model exactly as it was before wrapping.

use std::collections::{BTreeMap, HashSet};

use candle_core::{Tensor, Var};
use tracing::{debug, info};

use super::attention::{attention_adapter, unwrap_adapted_attention, AdaptedAttention, AttentionAdapter};
use super::config::{prepare_config, AdaptionPromptV2Config};
use super::error::AdaptionPromptError;
use super::mlp::{mlp_adapter, unwrap_adapted_mlp, AdaptedMlp, MlpAdapter};
use crate::cache::KvCache;
use crate::models::registry::{find_model_type, ArchitectureInfo};
use crate::models::AdaptableModel;
use crate::modules::{
    join_path, path_targets, split_module_path, AttentionModule, MlpModule, ModuleError,
};

type Result<T> = std::result::Result<T, AdaptionPromptError>;

/// Adapter state for one targeted decoder layer.
pub struct LayerAdapter {
    pub attention: AttentionAdapter,
    pub mlp: MlpAdapter,
}

/// Wraps a model with one or more named Adaption Prompt v2 adapters.
pub struct AdaptionPromptV2Model<M: AdaptableModel = Box<dyn AdaptableModel>> {
    model: M,
    arch: &'static ArchitectureInfo,
    /// Prepared adapter configs by name.
    configs: BTreeMap<String, AdaptionPromptV2Config>,
    /// Paths of the decoder layers each adapter targets, in layer order.
    parents: BTreeMap<String, Vec<String>>,
    /// Detached adapter state by name.
    cached_adapters: BTreeMap<String, Vec<LayerAdapter>>,
    active_adapter: String,
    enabled: bool,
    frozen: HashSet<String>,
}

impl<M: AdaptableModel> AdaptionPromptV2Model<M> {
    /// Wrap `model` and install `config` as the active adapter `adapter_name`.
    pub fn new(model: M, config: AdaptionPromptV2Config, adapter_name: &str) -> Result<Self> {
        let mut this = Self::without_adapters(model)?;
        this.add_adapter(adapter_name, config)?;
        Ok(this)
    }

    /// Wrapper with no adapter yet; the caller must add one before use.
    pub(crate) fn without_adapters(model: M) -> Result<Self> {
        let model_type = &model.model_config().model_type;
        let arch = find_model_type(model_type)
            .ok_or_else(|| AdaptionPromptError::UnsupportedModelType(model_type.clone()))?;
        Ok(Self {
            model,
            arch,
            configs: BTreeMap::new(),
            parents: BTreeMap::new(),
            cached_adapters: BTreeMap::new(),
            active_adapter: String::new(),
            enabled: true,
            frozen: HashSet::new(),
        })
    }

    /// Add an adapter and make it active.
    ///
    /// On failure the engine and the model are left as they were.
    pub fn add_adapter(&mut self, adapter_name: &str, config: AdaptionPromptV2Config) -> Result<()> {
        self.add_adapter_with_init(adapter_name, config, |_| Ok(()))
    }

    /// Add an adapter, letting `init` overwrite its freshly created
    /// parameters before it is installed. `init` receives every parameter
    /// under its module-tree path. If `init` fails, the adapter is discarded.
    pub fn add_adapter_with_init<E, F>(
        &mut self,
        adapter_name: &str,
        config: AdaptionPromptV2Config,
        init: F,
    ) -> std::result::Result<(), E>
    where
        E: From<AdaptionPromptError>,
        F: FnOnce(&[(String, Var)]) -> std::result::Result<(), E>,
    {
        let config = prepare_config(config, self.model.model_config())?;
        if self.configs.contains_key(adapter_name) {
            return Err(AdaptionPromptError::DuplicateAdapter(adapter_name.to_string()).into());
        }
        let (attention_module, mlp_module) = config.module_names()?;

        let parents: Vec<String> = self
            .model
            .named_modules()
            .iter()
            .filter(|path| path_targets(path, attention_module))
            .map(|path| split_module_path(path).0.to_string())
            .collect();
        if parents.len() < config.adapter_layers {
            return Err(AdaptionPromptError::TooManyAdapterLayers {
                requested: config.adapter_layers,
                available: parents.len(),
            }
            .into());
        }
        let parents = parents[parents.len() - config.adapter_layers..].to_vec();

        // Adapters are built from the unwrapped modules.
        let previous = (!self.configs.is_empty() && self.enabled).then(|| self.active_adapter.clone());
        if let Some(previous) = &previous {
            self.detach(previous)?;
        }

        let built = self.build_layer_adapters(&config, &parents).map_err(E::from).and_then(|layers| {
            let named = named_layer_vars(&parents, attention_module, mlp_module, &layers);
            init(&named).map(|()| layers)
        });
        let layers = match built {
            Ok(layers) => layers,
            Err(err) => {
                if let Some(previous) = &previous {
                    self.attach(previous)?;
                }
                return Err(err);
            }
        };

        info!(
            adapter = adapter_name,
            layers = ?parents,
            adapter_len = config.adapter_len,
            inference_mode = config.inference_mode,
            "added adaption prompt adapter"
        );

        let inference_mode = config.inference_mode;
        self.configs.insert(adapter_name.to_string(), config);
        self.parents.insert(adapter_name.to_string(), parents);
        self.cached_adapters.insert(adapter_name.to_string(), layers);
        self.active_adapter = adapter_name.to_string();
        if self.enabled {
            self.attach(adapter_name)?;
        }
        if inference_mode {
            self.frozen.insert(adapter_name.to_string());
        }
        Ok(())
    }

    /// Make `adapter_name` the active adapter.
    pub fn set_adapter(&mut self, adapter_name: &str) -> Result<()> {
        if self.active_adapter == adapter_name {
            return Ok(());
        }
        if !self.configs.contains_key(adapter_name) {
            return Err(AdaptionPromptError::UnknownAdapter(adapter_name.to_string()));
        }

        if self.enabled {
            let current = self.active_adapter.clone();
            self.detach(&current)?;
            if let Err(err) = self.attach(adapter_name) {
                self.attach(&current)?;
                return Err(err);
            }
        }

        info!(from = %self.active_adapter, to = adapter_name, "switched active adapter");
        self.active_adapter = adapter_name.to_string();
        Ok(())
    }

    /// Install the active adapter's modules. No-op when already enabled.
    pub fn enable_adapter_layers(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        let active = self.active_adapter.clone();
        self.attach(&active)?;
        self.enabled = true;
        info!(adapter = %active, "enabled adapter layers");
        Ok(())
    }

    /// Remove the active adapter's modules, restoring the base model.
    /// No-op when already disabled.
    pub fn disable_adapter_layers(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let active = self.active_adapter.clone();
        self.detach(&active)?;
        self.enabled = false;
        info!(adapter = %active, "disabled adapter layers");
        Ok(())
    }

    /// Forget a non-active adapter and its cached state.
    pub fn delete_adapter(&mut self, adapter_name: &str) -> Result<()> {
        if !self.configs.contains_key(adapter_name) {
            return Err(AdaptionPromptError::UnknownAdapter(adapter_name.to_string()));
        }
        if self.active_adapter == adapter_name {
            return Err(AdaptionPromptError::DeleteActiveAdapter(adapter_name.to_string()));
        }
        self.configs.remove(adapter_name);
        self.parents.remove(adapter_name);
        self.cached_adapters.remove(adapter_name);
        self.frozen.remove(adapter_name);
        info!(adapter = adapter_name, "deleted adapter");
        Ok(())
    }

    pub fn active_adapter(&self) -> &str {
        &self.active_adapter
    }

    pub fn architecture(&self) -> &'static ArchitectureInfo {
        self.arch
    }

    /// Names of all adapters, sorted.
    pub fn adapter_names(&self) -> Vec<&str> {
        self.configs.keys().map(String::as_str).collect()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_frozen(&self, adapter_name: &str) -> bool {
        self.frozen.contains(adapter_name)
    }

    pub fn config(&self, adapter_name: &str) -> Option<&AdaptionPromptV2Config> {
        self.configs.get(adapter_name)
    }

    /// Decoder layer paths targeted by `adapter_name`, in layer order.
    pub fn target_parents(&self, adapter_name: &str) -> Option<&[String]> {
        self.parents.get(adapter_name).map(Vec::as_slice)
    }

    /// Whether `adapter_name`'s state is detached into the cache.
    pub fn is_cached(&self, adapter_name: &str) -> bool {
        self.cached_adapters.contains_key(adapter_name)
    }

    /// Base parameters followed by the installed adapter's parameters, under
    /// their module-tree paths.
    pub fn named_parameters(&self) -> Result<Vec<(String, Tensor)>> {
        let mut params = self.model.named_parameters();
        if self.enabled {
            params.extend(
                self.adapter_parameters(&self.active_adapter)?
                    .into_iter()
                    .map(|(name, var)| (name, var.as_tensor().clone())),
            );
        }
        Ok(params)
    }

    /// Parameters an optimizer should update: those of the installed adapter
    /// unless it is frozen. Base weights are never included.
    pub fn trainable_parameters(&self) -> Result<Vec<Var>> {
        if !self.enabled || self.is_frozen(&self.active_adapter) {
            return Ok(Vec::new());
        }
        Ok(self
            .adapter_parameters(&self.active_adapter)?
            .into_iter()
            .map(|(_, var)| var)
            .collect())
    }

    /// Parameters of `adapter_name`, installed or cached, under the paths
    /// they have when installed.
    pub fn adapter_parameters(&self, adapter_name: &str) -> Result<Vec<(String, Var)>> {
        let config = self
            .configs
            .get(adapter_name)
            .ok_or_else(|| AdaptionPromptError::UnknownAdapter(adapter_name.to_string()))?;
        let (attention_module, mlp_module) = config.module_names()?;
        let parents = self.parents_of(adapter_name)?;

        if let Some(layers) = self.cached_adapters.get(adapter_name) {
            return Ok(named_layer_vars(parents, attention_module, mlp_module, layers));
        }

        let mut vars = Vec::new();
        for parent in parents {
            let attn_path = join_path(parent, attention_module);
            let attention = self.model.attention(parent, attention_module)?;
            let attention = attention_adapter(attention)
                .ok_or_else(|| AdaptionPromptError::NotAdapted(attn_path.clone()))?;
            vars.extend(prefixed(&attn_path, attention.named_vars()));

            let mlp_path = join_path(parent, mlp_module);
            let mlp = self.model.mlp(parent, mlp_module)?;
            let mlp = mlp_adapter(mlp).ok_or_else(|| AdaptionPromptError::NotAdapted(mlp_path.clone()))?;
            vars.extend(prefixed(&mlp_path, mlp.named_vars()));
        }
        Ok(vars)
    }

    /// `(trainable, total)` parameter element counts.
    pub fn trainable_parameter_counts(&self) -> Result<(usize, usize)> {
        let trainable: usize = self
            .trainable_parameters()?
            .iter()
            .map(|v| v.elem_count())
            .sum();
        let total: usize = self
            .named_parameters()?
            .iter()
            .map(|(_, t)| t.elem_count())
            .sum();
        info!(
            trainable_params = trainable,
            all_params = total,
            trainable_pct = 100.0 * trainable as f64 / total.max(1) as f64,
            "parameter counts"
        );
        Ok((trainable, total))
    }

    /// Run the wrapped model.
    pub fn forward(&self, input_ids: &Tensor, cache: &mut KvCache) -> candle_core::Result<Tensor> {
        self.model.forward(input_ids, cache)
    }

    pub fn new_cache(&self) -> KvCache {
        self.model.new_cache()
    }

    pub fn base_model(&self) -> &M {
        &self.model
    }

    /// Remove every adapter and return the unwrapped model.
    pub fn into_base_model(mut self) -> Result<M> {
        if self.enabled {
            let active = self.active_adapter.clone();
            self.detach(&active)?;
        }
        Ok(self.model)
    }

    fn parents_of(&self, adapter_name: &str) -> Result<&[String]> {
        self.parents
            .get(adapter_name)
            .map(Vec::as_slice)
            .ok_or_else(|| AdaptionPromptError::UnknownAdapter(adapter_name.to_string()))
    }

    fn build_layer_adapters(
        &self,
        config: &AdaptionPromptV2Config,
        parents: &[String],
    ) -> Result<Vec<LayerAdapter>> {
        let (attention_module, mlp_module) = config.module_names()?;
        parents
            .iter()
            .map(|parent| -> Result<LayerAdapter> {
                let attention = self.model.attention(parent, attention_module)?;
                let mlp = self.model.mlp(parent, mlp_module)?;
                Ok(LayerAdapter {
                    attention: AttentionAdapter::new(
                        attention,
                        config.adapter_len,
                        config.add_bias,
                        config.add_scale,
                    )
                    .map_err(|e| with_path(e, parent, attention_module))?,
                    mlp: MlpAdapter::new(mlp, config.add_bias, config.add_scale)
                        .map_err(|e| with_path(e, parent, mlp_module))?,
                })
            })
            .collect()
    }

    /// Move `adapter_name`'s cached state into the model.
    fn attach(&mut self, adapter_name: &str) -> Result<()> {
        let config = self
            .configs
            .get(adapter_name)
            .ok_or_else(|| AdaptionPromptError::UnknownAdapter(adapter_name.to_string()))?;
        let (attention_module, mlp_module) = config.module_names()?;
        let parents = self.parents_of(adapter_name)?.to_vec();

        // Every slot must be present and unwrapped before anything moves.
        for parent in &parents {
            let attention = self.model.attention(parent, attention_module)?;
            if attention_adapter(attention).is_some() {
                return Err(AdaptionPromptError::AlreadyAdapted(join_path(parent, attention_module)));
            }
            let mlp = self.model.mlp(parent, mlp_module)?;
            if mlp_adapter(mlp).is_some() {
                return Err(AdaptionPromptError::AlreadyAdapted(join_path(parent, mlp_module)));
            }
        }

        let (attention_module, mlp_module) = (attention_module.to_string(), mlp_module.to_string());
        let layers = self
            .cached_adapters
            .remove(adapter_name)
            .ok_or_else(|| AdaptionPromptError::UnknownAdapter(adapter_name.to_string()))?;
        let arch = self.arch;
        for (parent, layer) in parents.iter().zip(layers) {
            let LayerAdapter { attention, mlp } = layer;
            self.model
                .attention_slot_mut(parent, &attention_module)?
                .replace_with(|base| {
                    let wrapped: Box<dyn AttentionModule> =
                        Box::new(AdaptedAttention::new(base, attention, arch));
                    (wrapped, ())
                })
                .ok_or_else(|| ModuleError::Detached(join_path(parent, &attention_module)))?;
            self.model
                .mlp_slot_mut(parent, &mlp_module)?
                .replace_with(|base| {
                    let wrapped: Box<dyn MlpModule> = Box::new(AdaptedMlp::new(base, mlp));
                    (wrapped, ())
                })
                .ok_or_else(|| ModuleError::Detached(join_path(parent, &mlp_module)))?;
            debug!(adapter = adapter_name, layer = %parent, "attached adapted modules");
        }
        Ok(())
    }

    /// Move `adapter_name`'s installed state out of the model into the cache.
    fn detach(&mut self, adapter_name: &str) -> Result<()> {
        let config = self
            .configs
            .get(adapter_name)
            .ok_or_else(|| AdaptionPromptError::UnknownAdapter(adapter_name.to_string()))?;
        let (attention_module, mlp_module) = config.module_names()?;
        let parents = self.parents_of(adapter_name)?.to_vec();

        for parent in &parents {
            let attention = self.model.attention(parent, attention_module)?;
            if attention_adapter(attention).is_none() {
                return Err(AdaptionPromptError::NotAdapted(join_path(parent, attention_module)));
            }
            let mlp = self.model.mlp(parent, mlp_module)?;
            if mlp_adapter(mlp).is_none() {
                return Err(AdaptionPromptError::NotAdapted(join_path(parent, mlp_module)));
            }
        }

        let (attention_module, mlp_module) = (attention_module.to_string(), mlp_module.to_string());
        let mut layers = Vec::with_capacity(parents.len());
        for parent in &parents {
            let attn_path = join_path(parent, &attention_module);
            let attention = self
                .model
                .attention_slot_mut(parent, &attention_module)?
                .replace_with(unwrap_adapted_attention)
                .ok_or_else(|| ModuleError::Detached(attn_path.clone()))?
                .ok_or(AdaptionPromptError::NotAdapted(attn_path))?;

            let mlp_path = join_path(parent, &mlp_module);
            let mlp = self
                .model
                .mlp_slot_mut(parent, &mlp_module)?
                .replace_with(unwrap_adapted_mlp)
                .ok_or_else(|| ModuleError::Detached(mlp_path.clone()))?
                .ok_or(AdaptionPromptError::NotAdapted(mlp_path))?;

            layers.push(LayerAdapter { attention, mlp });
            debug!(adapter = adapter_name, layer = %parent, "detached adapted modules");
        }
        self.cached_adapters.insert(adapter_name.to_string(), layers);
        Ok(())
    }
}

fn prefixed(prefix: &str, vars: Vec<(String, Var)>) -> Vec<(String, Var)> {
    vars.into_iter()
        .map(|(name, var)| (join_path(prefix, &name), var))
        .collect()
}

fn named_layer_vars(
    parents: &[String],
    attention_module: &str,
    mlp_module: &str,
    layers: &[LayerAdapter],
) -> Vec<(String, Var)> {
    parents
        .iter()
        .zip(layers)
        .flat_map(|(parent, layer)| {
            let mut vars = prefixed(
                &join_path(parent, attention_module),
                layer.attention.named_vars(),
            );
            vars.extend(prefixed(&join_path(parent, mlp_module), layer.mlp.named_vars()));
            vars
        })
        .collect()
}

fn with_path(err: AdaptionPromptError, parent: &str, child: &str) -> AdaptionPromptError {
    match err {
        AdaptionPromptError::AlreadyAdapted(_) => {
            AdaptionPromptError::AlreadyAdapted(join_path(parent, child))
        }
        other => other,
    }
}
