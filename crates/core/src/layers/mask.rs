use candle_core::{DType, Device, Result, Tensor};

/// Additive causal mask for `q_len` new positions following `past_len`
/// cached ones. Shape `[1, 1, q_len, past_len + q_len]`.
///
/// Returns `None` for single-token steps, which can see every cached key.
pub fn causal_mask(
    q_len: usize,
    past_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Option<Tensor>> {
    if q_len <= 1 {
        return Ok(None);
    }
    let total_len = q_len + past_len;
    let mask: Vec<f32> = (0..q_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| {
                if j > i + past_len {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, q_len, total_len), device)?;
    mask.to_dtype(dtype).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_has_no_mask() {
        let mask = causal_mask(1, 7, DType::F32, &Device::Cpu).unwrap();
        assert!(mask.is_none());
    }

    #[test]
    fn mask_hides_future_positions() {
        let mask = causal_mask(3, 2, DType::F32, &Device::Cpu)
            .unwrap()
            .unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 5]);

        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        // first new token sees the two cached ones and itself
        assert_eq!(&rows[0][..3], &[0.0, 0.0, 0.0]);
        assert!(rows[0][3].is_infinite() && rows[0][4].is_infinite());
        assert!(rows[2].iter().all(|v| *v == 0.0));
    }
}
