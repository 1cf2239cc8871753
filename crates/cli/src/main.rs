mod config;
mod logging;

use std::path::{Path, PathBuf};

use adaption_core::adaption_prompt::{
    from_pretrained, load_adapter, prepare_config, AdaptionPromptError, AdaptionPromptV2Config,
    AdaptionPromptV2Model, CONFIG_FILE,
};
use adaption_core::config::ModelConfig;
use adaption_core::models::{self, AdaptableModel, CausalLm};
use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "adaption-prompt", about = "Adaption Prompt v2 adapter tools")]
struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write an adapter_config.json prepared for a model.
    Init {
        /// Model config.json.
        #[arg(long)]
        model_config: PathBuf,

        #[arg(long)]
        adapter_len: Option<usize>,

        #[arg(long)]
        adapter_layers: Option<usize>,

        /// Do not learn per-linear output biases.
        #[arg(long)]
        no_bias: bool,

        /// Do not learn per-linear input scales.
        #[arg(long)]
        no_scale: bool,

        /// Mark the adapter as frozen.
        #[arg(long)]
        inference_mode: bool,

        #[arg(long)]
        base_model_name_or_path: Option<String>,

        /// Output directory.
        #[arg(long)]
        out: PathBuf,
    },

    /// Load adapters onto a model and print what they touch.
    Inspect {
        #[arg(long)]
        model_config: PathBuf,

        /// Model safetensors files. Zero weights are used when omitted.
        #[arg(long = "weights")]
        weights: Vec<PathBuf>,

        /// Adapter to load, as `name=dir`. May be repeated.
        #[arg(long = "adapter", required = true)]
        adapters: Vec<String>,

        /// Adapter to activate after loading. Defaults to the last one.
        #[arg(long)]
        active: Option<String>,

        #[arg(long)]
        dtype: Option<String>,
    },

    /// Wrap a randomly initialised model and check adapter parity.
    Smoke {
        #[arg(long)]
        model_config: PathBuf,

        #[arg(long)]
        adapter_len: Option<usize>,

        #[arg(long)]
        adapter_layers: Option<usize>,
    },

    /// Show or update the persistent defaults.
    Config {
        #[arg(long)]
        adapter_len: Option<usize>,

        #[arg(long)]
        adapter_layers: Option<usize>,

        #[arg(long)]
        dtype: Option<String>,

        #[arg(long = "default-log-level")]
        default_log_level: Option<String>,

        /// Config file to use instead of the default location.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut file_config = CliConfig::load();
    file_config.merge(&CliConfig {
        log_level: cli.log_level.clone(),
        ..Default::default()
    });
    logging::init(file_config.log_level.as_deref(), logging::LogFormat::from_env());

    match cli.command {
        Command::Init {
            model_config,
            adapter_len,
            adapter_layers,
            no_bias,
            no_scale,
            inference_mode,
            base_model_name_or_path,
            out,
        } => {
            file_config.merge(&CliConfig {
                adapter_len,
                adapter_layers,
                ..Default::default()
            });
            let model_cfg = read_model_config(&model_config)?;
            let mut config =
                AdaptionPromptV2Config::new(file_config.adapter_len(), file_config.adapter_layers())
                    .with_bias(!no_bias)
                    .with_scale(!no_scale)
                    .with_inference_mode(inference_mode);
            config.base_model_name_or_path = base_model_name_or_path;
            let config = prepare_config(config, &model_cfg)?;
            if config.adapter_layers > model_cfg.num_hidden_layers {
                return Err(AdaptionPromptError::TooManyAdapterLayers {
                    requested: config.adapter_layers,
                    available: model_cfg.num_hidden_layers,
                }
                .into());
            }

            std::fs::create_dir_all(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let path = out.join(CONFIG_FILE);
            std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
            println!("Wrote {}", path.display());
        }

        Command::Inspect {
            model_config,
            weights,
            adapters,
            active,
            dtype,
        } => {
            file_config.merge(&CliConfig {
                dtype,
                ..Default::default()
            });
            let model_cfg = read_model_config(&model_config)?;
            let device = Device::cuda_if_available(0)?;
            let dtype = parse_dtype(file_config.dtype(), &device)?;
            let vb = if weights.is_empty() {
                info!("no weights given, using zero weights");
                VarBuilder::zeros(dtype, &device)
            } else {
                unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)? }
            };
            let model = models::from_config(&model_cfg, vb)?;

            let mut specs = adapters.iter().map(|arg| parse_adapter_arg(arg));
            let (name, dir) = specs.next().context("no adapters given")??;
            let mut adapted = from_pretrained(model, name, dir)?;
            for parsed in specs {
                let (name, dir) = parsed?;
                load_adapter(&mut adapted, name, dir)?;
            }
            if let Some(active) = active {
                adapted.set_adapter(&active)?;
            }
            print_summary(&adapted)?;
        }

        Command::Smoke {
            model_config,
            adapter_len,
            adapter_layers,
        } => {
            file_config.merge(&CliConfig {
                adapter_len,
                adapter_layers,
                ..Default::default()
            });
            let model_cfg = read_model_config(&model_config)?;
            let config =
                AdaptionPromptV2Config::new(file_config.adapter_len(), file_config.adapter_layers());
            smoke(&model_cfg, config)?;
        }

        Command::Config {
            adapter_len,
            adapter_layers,
            dtype,
            default_log_level,
            path,
        } => {
            let path = match path.or_else(CliConfig::default_path) {
                Some(path) => path,
                None => anyhow::bail!("no config directory available; pass --path"),
            };
            let mut stored = if path.exists() {
                CliConfig::load_from(&path)?
            } else {
                CliConfig::default()
            };
            let update = CliConfig {
                adapter_len,
                adapter_layers,
                dtype,
                log_level: default_log_level,
            };
            if update != CliConfig::default() {
                stored.merge(&update);
                stored.save_to(&path)?;
                eprintln!("Saved config to: {}", path.display());
            }
            print!("{}", toml::to_string_pretty(&stored)?);
        }
    }

    Ok(())
}

fn read_model_config(path: &Path) -> anyhow::Result<ModelConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_dtype(name: &str, device: &Device) -> anyhow::Result<DType> {
    Ok(match name {
        "auto" if device.is_cpu() => DType::F32,
        "auto" | "bf16" | "bfloat16" => DType::BF16,
        "fp16" | "float16" | "half" => DType::F16,
        "fp32" | "float32" | "float" => DType::F32,
        other => anyhow::bail!("Unknown dtype '{}'. Supported: auto, bf16, fp16, fp32", other),
    })
}

/// Split `name=dir`.
fn parse_adapter_arg(arg: &str) -> anyhow::Result<(&str, &Path)> {
    match arg.split_once('=') {
        Some((name, dir)) if !name.is_empty() && !dir.is_empty() => Ok((name, Path::new(dir))),
        _ => anyhow::bail!("invalid adapter '{}', expected name=dir", arg),
    }
}

fn adapter_param_count<M: AdaptableModel>(
    model: &AdaptionPromptV2Model<M>,
    name: &str,
) -> anyhow::Result<usize> {
    Ok(model
        .adapter_parameters(name)?
        .iter()
        .map(|(_, var)| var.elem_count())
        .sum())
}

fn print_summary<M: AdaptableModel>(model: &AdaptionPromptV2Model<M>) -> anyhow::Result<()> {
    let arch = model.architecture();
    println!("model: {} ({})", arch.display_name, arch.model_type);
    println!(
        "{:<2} {:<20} {:>6} {:>7} {:>10}  {}",
        "", "ADAPTER", "LEN", "LAYERS", "PARAMS", "TARGETS"
    );
    for name in model.adapter_names() {
        let config = model
            .config(name)
            .with_context(|| format!("adapter '{name}' has no config"))?;
        let targets = model.target_parents(name).unwrap_or_default();
        let span = match (targets.first(), targets.last()) {
            (Some(first), Some(last)) if first != last => format!("{first} .. {last}"),
            (Some(first), _) => first.clone(),
            _ => String::new(),
        };
        println!(
            "{:<2} {:<20} {:>6} {:>7} {:>10}  {}",
            if name == model.active_adapter() { "*" } else { "" },
            name,
            config.adapter_len,
            targets.len(),
            adapter_param_count(model, name)?,
            span
        );
    }

    let (trainable, total) = model.trainable_parameter_counts()?;
    println!(
        "trainable params: {} || all params: {} || trainable%: {:.4}",
        trainable,
        total,
        100.0 * trainable as f64 / total.max(1) as f64
    );
    Ok(())
}

fn logits<M: AdaptableModel>(model: &AdaptionPromptV2Model<M>, ids: &Tensor) -> anyhow::Result<Tensor> {
    let mut cache = model.new_cache();
    Ok(model.forward(ids, &mut cache)?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> anyhow::Result<f32> {
    Ok((a - b)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()?)
}

/// Build a randomly initialised model, wrap it and compare logits with and
/// without the adapter.
fn smoke(model_cfg: &ModelConfig, config: AdaptionPromptV2Config) -> anyhow::Result<()> {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = models::from_config(model_cfg, vb)?;

    let seq_len = model_cfg.vocab_size.clamp(1, 8) as u32;
    let ids = Tensor::arange(0u32, seq_len, &device)?.unsqueeze(0)?;
    let mut cache = model.new_cache();
    let base = model.forward(&ids, &mut cache)?;

    let mut wrapped = AdaptionPromptV2Model::new(model, config, "smoke")?;
    let zero_gate = max_abs_diff(&base, &logits(&wrapped, &ids)?)?;

    for (name, var) in wrapped.adapter_parameters("smoke")? {
        if name.ends_with("adaption_gate") {
            var.set(&Tensor::ones(1, var.dtype(), &device)?)?;
        }
    }
    let open_gate = max_abs_diff(&base, &logits(&wrapped, &ids)?)?;

    wrapped.disable_adapter_layers()?;
    let disabled = max_abs_diff(&base, &logits(&wrapped, &ids)?)?;
    wrapped.enable_adapter_layers()?;

    println!("model type:            {}", model_cfg.model_type);
    println!("adapted layers:        {}", wrapped.target_parents("smoke").unwrap_or_default().len());
    println!("zero gate max diff:    {zero_gate:.3e}");
    println!("open gate max diff:    {open_gate:.3e}");
    println!("disabled max diff:     {disabled:.3e}");
    let (trainable, total) = wrapped.trainable_parameter_counts()?;
    println!("trainable params:      {trainable} / {total}");

    if disabled != 0.0 {
        anyhow::bail!("disabled adapter changed the base model output (max diff {disabled})");
    }
    if open_gate == 0.0 {
        anyhow::bail!("opening the adapter gates had no effect");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_adapter_arg() {
        let (name, dir) = parse_adapter_arg("a=/tmp/adapter").unwrap();
        assert_eq!(name, "a");
        assert_eq!(dir, Path::new("/tmp/adapter"));
        assert!(parse_adapter_arg("missing").is_err());
        assert!(parse_adapter_arg("=dir").is_err());
        assert!(parse_adapter_arg("name=").is_err());
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!(parse_dtype("auto", &Device::Cpu).unwrap(), DType::F32);
        assert_eq!(parse_dtype("bf16", &Device::Cpu).unwrap(), DType::BF16);
        assert_eq!(parse_dtype("half", &Device::Cpu).unwrap(), DType::F16);
        assert!(parse_dtype("int8", &Device::Cpu).is_err());
    }

    fn write_llama_config(dir: &Path) -> PathBuf {
        let path = dir.join("config.json");
        let config = serde_json::json!({
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "hidden_size": 32,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "num_hidden_layers": 2,
            "intermediate_size": 64,
            "vocab_size": 64,
            "max_position_embeddings": 64,
            "hidden_act": "silu",
            "rms_norm_eps": 1e-6,
            "rope_theta": 10000.0,
            "tie_word_embeddings": false
        });
        std::fs::write(&path, config.to_string()).unwrap();
        path
    }

    #[test]
    fn test_read_model_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = read_model_config(&write_llama_config(dir.path())).unwrap();
        assert_eq!(cfg.model_type, "llama");
        assert_eq!(cfg.num_kv_heads(), 2);
        assert!(read_model_config(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_smoke_llama() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = read_model_config(&write_llama_config(dir.path())).unwrap();
        smoke(&cfg, AdaptionPromptV2Config::new(4, 2)).unwrap();
    }

    #[test]
    fn test_smoke_rejects_too_many_layers() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = read_model_config(&write_llama_config(dir.path())).unwrap();
        assert!(smoke(&cfg, AdaptionPromptV2Config::new(4, 5)).is_err());
    }
}
