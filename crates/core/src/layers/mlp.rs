use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, linear_no_bias, Linear, VarBuilder};

use super::linear::{hooked, LinearHook, NamedLinear};
use crate::modules::MlpModule;

/// SwiGLU MLP used by Llama.
pub struct SwiGluMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl SwiGluMlp {
    pub fn new(hidden_size: usize, intermediate_size: usize, vb: VarBuilder) -> Result<Self> {
        let gate_proj = linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?;
        let up_proj = linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?;
        let down_proj = linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?;
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }
}

impl MlpModule for SwiGluMlp {
    fn linears(&self) -> Vec<NamedLinear<'_>> {
        vec![
            NamedLinear::new("gate_proj", &self.gate_proj),
            NamedLinear::new("up_proj", &self.up_proj),
            NamedLinear::new("down_proj", &self.down_proj),
        ]
    }

    fn forward(&self, xs: &Tensor, hook: &dyn LinearHook) -> Result<Tensor> {
        let gate = hooked(hook, "gate_proj", &self.gate_proj, xs)?
            .apply(&candle_nn::Activation::Silu)?;
        let up = hooked(hook, "up_proj", &self.up_proj, xs)?;
        hooked(hook, "down_proj", &self.down_proj, &(gate * up)?)
    }
}

/// Two-layer GELU MLP used by GPT-NeoX.
pub struct GeluMlp {
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
    act: candle_nn::Activation,
}

impl GeluMlp {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        act: candle_nn::Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let dense_h_to_4h = linear(hidden_size, intermediate_size, vb.pp("dense_h_to_4h"))?;
        let dense_4h_to_h = linear(intermediate_size, hidden_size, vb.pp("dense_4h_to_h"))?;
        Ok(Self {
            dense_h_to_4h,
            dense_4h_to_h,
            act,
        })
    }
}

impl MlpModule for GeluMlp {
    fn linears(&self) -> Vec<NamedLinear<'_>> {
        vec![
            NamedLinear::new("dense_h_to_4h", &self.dense_h_to_4h),
            NamedLinear::new("dense_4h_to_h", &self.dense_4h_to_h),
        ]
    }

    fn forward(&self, xs: &Tensor, hook: &dyn LinearHook) -> Result<Tensor> {
        let hidden = hooked(hook, "dense_h_to_4h", &self.dense_h_to_4h, xs)?;
        let hidden = self.act.forward(&hidden)?;
        hooked(hook, "dense_4h_to_h", &self.dense_4h_to_h, &hidden)
    }
}

/// Map a HuggingFace `hidden_act` string to a candle activation.
pub fn activation_from_name(name: &str) -> Result<candle_nn::Activation> {
    use candle_nn::Activation;
    Ok(match name {
        "silu" | "swish" => Activation::Silu,
        "gelu" => Activation::Gelu,
        "gelu_new" | "gelu_pytorch_tanh" => Activation::NewGelu,
        "relu" => Activation::Relu,
        other => candle_core::bail!("unsupported activation '{other}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::BaseLinears;
    use candle_core::{DType, Device};

    #[test]
    fn swiglu_shapes_and_linears() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mlp = SwiGluMlp::new(16, 32, vb).unwrap();
        let names: Vec<&str> = mlp.linears().iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["gate_proj", "up_proj", "down_proj"]);

        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &Device::Cpu).unwrap();
        let y = MlpModule::forward(&mlp, &x, &BaseLinears).unwrap();
        assert_eq!(y.dims(), &[2, 3, 16]);
    }

    #[test]
    fn gelu_mlp_has_biases() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mlp = GeluMlp::new(8, 32, candle_nn::Activation::Gelu, vb).unwrap();
        assert!(mlp.linears().iter().all(|l| l.linear.bias().is_some()));
    }

    #[test]
    fn activation_names() {
        assert!(activation_from_name("silu").is_ok());
        assert!(activation_from_name("gelu").is_ok());
        assert!(activation_from_name("mish").is_err());
    }
}
