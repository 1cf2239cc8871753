use candle_core::{DType, Result, Tensor, D};

/// Repeat KV heads for Grouped Query Attention.
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}

/// Scaled dot-product attention over already cached keys and values.
///
/// `q` is `[b, num_heads, q_len, head_dim]`, `k`/`v` are
/// `[b, num_kv_heads, kv_len, head_dim]`. Softmax runs in f32. Returns the
/// context `[b, q_len, num_heads * head_dim]` and the attention probabilities.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    attention_mask: Option<&Tensor>,
    num_kv_groups: usize,
) -> Result<(Tensor, Tensor)> {
    let (b_sz, num_heads, q_len, head_dim) = q.dims4()?;
    let k = repeat_kv(k.clone(), num_kv_groups)?.contiguous()?;
    let v = repeat_kv(v.clone(), num_kv_groups)?.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let attn_weights = (q.contiguous()?.matmul(&k.transpose(2, 3)?)? * scale)?;
    let attn_weights = match attention_mask {
        Some(mask) => attn_weights.broadcast_add(&mask.to_dtype(attn_weights.dtype())?)?,
        None => attn_weights,
    };
    let attn_probs =
        candle_nn::ops::softmax(&attn_weights.to_dtype(DType::F32)?, D::Minus1)?.to_dtype(q.dtype())?;
    let attn_output = attn_probs.matmul(&v)?;

    let attn_output = attn_output
        .transpose(1, 2)?
        .reshape((b_sz, q_len, num_heads * head_dim))?;
    Ok((attn_output, attn_probs))
}
