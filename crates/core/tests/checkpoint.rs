//! Adapter checkpoint save/load against PEFT-style directories.

use std::collections::HashMap;

use adaption_core::adaption_prompt::{
    from_pretrained, load_adapter, load_config, save_adapter, AdaptionPromptV2Config, AdaptionPromptV2Model,
    CheckpointError, PeftType, CONFIG_FILE, WEIGHTS_FILE,
};
use adaption_core::models::{AdaptableModel, LlamaForCausalLM};
use adaption_core::testing::{max_abs_diff, random_var_builder, tiny_llama_config, token_ids};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;

fn adapted_llama(adapter_len: usize) -> (VarMap, AdaptionPromptV2Model<LlamaForCausalLM>) {
    let (varmap, vb) = random_var_builder(DType::F32);
    let model = LlamaForCausalLM::new(&tiny_llama_config(), vb).unwrap();
    let model =
        AdaptionPromptV2Model::new(model, AdaptionPromptV2Config::new(adapter_len, 2), "trained")
            .unwrap();
    for (name, var) in model.adapter_parameters("trained").unwrap() {
        if name.ends_with("adaption_gate") {
            var.set(&Tensor::new(&[0.5f32], &Device::Cpu).unwrap()).unwrap();
        }
    }
    (varmap, model)
}

fn logits<M: AdaptableModel>(model: &AdaptionPromptV2Model<M>) -> Tensor {
    let mut cache = model.new_cache();
    model.forward(&token_ids(&[5, 9, 2, 30]), &mut cache).unwrap()
}

#[test]
fn test_save_writes_peft_layout() {
    let (_varmap, model) = adapted_llama(4);
    let dir = tempfile::tempdir().unwrap();
    save_adapter(&model, "trained", dir.path()).unwrap();

    assert!(dir.path().join(CONFIG_FILE).exists());
    assert!(dir.path().join(WEIGHTS_FILE).exists());

    let config = load_config(dir.path()).unwrap();
    assert_eq!(config.peft_type, PeftType::AdaptionPromptV2);
    assert_eq!(config.adapter_len, 4);
    assert_eq!(config.adapter_layers, 2);
    assert_eq!(config.attention_module.as_deref(), Some("self_attn"));

    let raw = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
    assert!(raw.contains("\"ADAPTION_PROMPT_V2\""));

    let tensors = candle_core::safetensors::load(dir.path().join(WEIGHTS_FILE), &Device::Cpu).unwrap();
    assert_eq!(tensors.len(), model.adapter_parameters("trained").unwrap().len());
    let prompt = &tensors["model.layers.0.self_attn.adaption_prompt"];
    assert_eq!(prompt.dims(), &[1, 4, 32]);
    let gate: Vec<f32> = tensors["model.layers.1.self_attn.adaption_gate"].to_vec1().unwrap();
    assert_eq!(gate, vec![0.5]);
}

#[test]
fn test_load_reproduces_saved_adapter() {
    let (_varmap, mut model) = adapted_llama(4);
    let expected = logits(&model);

    let dir = tempfile::tempdir().unwrap();
    save_adapter(&model, "trained", dir.path()).unwrap();

    load_adapter(&mut model, "restored", dir.path()).unwrap();
    assert_eq!(model.active_adapter(), "restored");
    assert!(max_abs_diff(&expected, &logits(&model)) < 1e-6);

    let saved = model.adapter_parameters("trained").unwrap();
    let restored = model.adapter_parameters("restored").unwrap();
    for ((name_a, a), (name_b, b)) in saved.iter().zip(restored.iter()) {
        assert_eq!(name_a, name_b);
        assert_eq!(max_abs_diff(a.as_tensor(), b.as_tensor()), 0.0, "{name_a}");
    }
}

#[test]
fn test_save_cached_adapter() {
    let (_varmap, mut model) = adapted_llama(4);
    let expected = logits(&model);
    model.add_adapter("other", AdaptionPromptV2Config::new(2, 1)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    save_adapter(&model, "trained", dir.path()).unwrap();
    load_adapter(&mut model, "restored", dir.path()).unwrap();
    assert!(max_abs_diff(&expected, &logits(&model)) < 1e-6);
}

#[test]
fn test_load_missing_tensor_rolls_back() {
    let (_varmap, mut model) = adapted_llama(4);
    let expected = logits(&model);

    let dir = tempfile::tempdir().unwrap();
    save_adapter(&model, "trained", dir.path()).unwrap();

    let weights = dir.path().join(WEIGHTS_FILE);
    let mut tensors: HashMap<String, Tensor> =
        candle_core::safetensors::load(&weights, &Device::Cpu).unwrap();
    tensors.remove("model.layers.1.mlp.linears.up_proj.adaption_scale");
    candle_core::safetensors::save(&tensors, &weights).unwrap();

    let err = load_adapter(&mut model, "broken", dir.path()).unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::MissingTensor(name) if name == "model.layers.1.mlp.linears.up_proj.adaption_scale"
    ));
    assert_eq!(model.adapter_names(), vec!["trained"]);
    assert_eq!(model.active_adapter(), "trained");
    assert!(max_abs_diff(&expected, &logits(&model)) < 1e-6);
}

#[test]
fn test_load_ignores_unexpected_tensors() {
    let (_varmap, mut model) = adapted_llama(4);
    let expected = logits(&model);

    let dir = tempfile::tempdir().unwrap();
    save_adapter(&model, "trained", dir.path()).unwrap();

    let weights = dir.path().join(WEIGHTS_FILE);
    let mut tensors: HashMap<String, Tensor> =
        candle_core::safetensors::load(&weights, &Device::Cpu).unwrap();
    tensors.insert(
        "extra.junk".to_string(),
        Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&tensors, &weights).unwrap();

    load_adapter(&mut model, "extended", dir.path()).unwrap();
    assert_eq!(model.active_adapter(), "extended");
    assert_eq!(model.adapter_names(), vec!["extended", "trained"]);
    assert!(max_abs_diff(&expected, &logits(&model)) < 1e-6);
}

#[test]
fn test_load_shape_mismatch() {
    let (_varmap, model) = adapted_llama(4);
    let dir = tempfile::tempdir().unwrap();
    save_adapter(&model, "trained", dir.path()).unwrap();

    let mut config = load_config(dir.path()).unwrap();
    config.adapter_len = 8;
    std::fs::write(
        dir.path().join(CONFIG_FILE),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();

    let (_varmap, mut fresh) = adapted_llama(4);
    let err = load_adapter(&mut fresh, "resized", dir.path()).unwrap_err();
    match err {
        CheckpointError::ShapeMismatch {
            name,
            expected,
            actual,
        } => {
            assert!(name.ends_with("adaption_prompt"));
            assert_eq!(expected, vec![1, 8, 32]);
            assert_eq!(actual, vec![1, 4, 32]);
        }
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
    assert_eq!(fresh.adapter_names(), vec!["trained"]);
}

#[test]
fn test_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        load_config(dir.path()),
        Err(CheckpointError::MissingFile(path)) if path.ends_with(CONFIG_FILE)
    ));

    let config = AdaptionPromptV2Config::new(4, 1);
    std::fs::write(
        dir.path().join(CONFIG_FILE),
        serde_json::to_string(&config).unwrap(),
    )
    .unwrap();
    let (_varmap, mut model) = adapted_llama(4);
    assert!(matches!(
        load_adapter(&mut model, "no_weights", dir.path()),
        Err(CheckpointError::MissingFile(path)) if path.ends_with(WEIGHTS_FILE)
    ));
}

#[test]
fn test_save_unknown_adapter() {
    let (_varmap, model) = adapted_llama(4);
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        save_adapter(&model, "nope", dir.path()),
        Err(CheckpointError::Adapter(_))
    ));
}

#[test]
fn test_from_pretrained_on_fresh_model() {
    let (_varmap, model) = adapted_llama(4);
    let expected = logits(&model);
    let dir = tempfile::tempdir().unwrap();
    save_adapter(&model, "trained", dir.path()).unwrap();
    let base = model.into_base_model().unwrap();

    let restored = from_pretrained(base, "restored", dir.path()).unwrap();
    assert_eq!(restored.adapter_names(), vec!["restored"]);
    assert!(max_abs_diff(&expected, &logits(&restored)) < 1e-6);
}
