//! Contiguous key/value cache for incremental decoding.

use candle_core::{Result, Tensor};

/// Keys and values of one decoder layer, `[b, kv_heads, seq, head_dim]`.
#[derive(Debug, Clone, Default)]
pub struct LayerKvCache {
    kv: Option<(Tensor, Tensor)>,
}

impl LayerKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.kv
            .as_ref()
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }

    /// Append new keys and values and return the full history.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k, v) = match &self.kv {
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, k], 2)?.contiguous()?,
                Tensor::cat(&[prev_v, v], 2)?.contiguous()?,
            ),
            None => (k.contiguous()?, v.contiguous()?),
        };
        self.kv = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    pub fn reset(&mut self) {
        self.kv = None;
    }
}

/// One [`LayerKvCache`] per decoder layer.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerKvCache>,
}

impl KvCache {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![LayerKvCache::new(); num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_mut(&mut self, layer_idx: usize) -> Result<&mut LayerKvCache> {
        let num_layers = self.layers.len();
        self.layers.get_mut(layer_idx).ok_or_else(|| {
            candle_core::Error::Msg(format!(
                "cache has {num_layers} layers, layer {layer_idx} requested"
            ))
        })
    }

    /// Cached positions, read from the first layer.
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(LayerKvCache::seq_len).unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(LayerKvCache::reset);
    }
}
