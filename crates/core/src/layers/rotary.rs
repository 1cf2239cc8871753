use candle_core::{DType, Device, Result, Tensor, D};

/// Rotary position embedding in the rotate-half formulation.
///
/// Only the first `rotary_dim` channels of each head are rotated; the rest
/// pass through unchanged (GPT-NeoX `rotary_pct < 1`).
pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
    rotary_dim: usize,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Self::new_partial(head_dim, max_seq_len, rope_theta, 1.0, dtype, device)
    }

    /// Rotate `floor(head_dim * rotary_pct)` channels.
    pub fn new_partial(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        rotary_pct: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let rotary_dim = (head_dim as f64 * rotary_pct) as usize;
        if rotary_dim == 0 || rotary_dim % 2 != 0 {
            candle_core::bail!("rotary dim must be even and non-zero, got {rotary_dim}");
        }
        let inv_freq: Vec<f32> = (0..rotary_dim)
            .step_by(2)
            .map(|i| 1.0 / (rope_theta as f32).powf(i as f32 / rotary_dim as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq =
            Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?.to_dtype(DType::F32)?;
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
            rotary_dim,
        })
    }

    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    pub fn max_seq_len(&self) -> usize {
        self.cos.dim(0).unwrap_or(0)
    }

    /// Full-width `(cos, sin)` rows for positions `offset..offset + seq_len`,
    /// shaped `[seq_len, rotary_dim]`.
    fn tables(&self, seqlen_offset: usize, seq_len: usize) -> Result<(Tensor, Tensor)> {
        if seqlen_offset + seq_len > self.max_seq_len() {
            candle_core::bail!(
                "position {} exceeds rotary table of {} entries",
                seqlen_offset + seq_len,
                self.max_seq_len()
            );
        }
        let cos = self.cos.narrow(0, seqlen_offset, seq_len)?;
        let sin = self.sin.narrow(0, seqlen_offset, seq_len)?;
        Ok((
            Tensor::cat(&[&cos, &cos], D::Minus1)?,
            Tensor::cat(&[&sin, &sin], D::Minus1)?,
        ))
    }

    /// Rotate a single `[b, h, seq, head_dim]` tensor.
    pub fn apply_one(&self, x: &Tensor, seqlen_offset: usize) -> Result<Tensor> {
        let (_b, _h, seq_len, head_dim) = x.dims4()?;
        let (cos, sin) = self.tables(seqlen_offset, seq_len)?;
        let cos = cos.to_dtype(x.dtype())?;
        let sin = sin.to_dtype(x.dtype())?;
        if self.rotary_dim == head_dim {
            return rotate(x, &cos, &sin);
        }
        let x_rot = x.narrow(D::Minus1, 0, self.rotary_dim)?;
        let x_pass = x.narrow(D::Minus1, self.rotary_dim, head_dim - self.rotary_dim)?;
        let x_rot = rotate(&x_rot, &cos, &sin)?;
        Tensor::cat(&[&x_rot, &x_pass], D::Minus1)
    }
}

/// `[-x2, x1]` where `x1`, `x2` are the two halves of the last dim.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.dim(D::Minus1)?;
    let x1 = x.narrow(D::Minus1, 0, last / 2)?;
    let x2 = x.narrow(D::Minus1, last / 2, last - last / 2)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let x_cos = x.broadcast_mul(cos)?;
    let x_sin = rotate_half(x)?.broadcast_mul(sin)?;
    x_cos + x_sin
}
