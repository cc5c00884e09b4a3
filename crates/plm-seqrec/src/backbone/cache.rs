//! Past key/value cache threaded between backbone passes.
//!
//! One [`LayerKv`] per kept decoder layer, each key/value shaped
//! `[batch, heads, cache_len, head_dim]`. `cache_len` is identical across
//! layers; [`KvCache::new`] rejects anything else.

use candle_core::Tensor;

use crate::error::{SeqRecError, SeqRecResult};

/// Key/value pair of one decoder layer.
#[derive(Debug, Clone)]
pub struct LayerKv {
    pub key: Tensor,
    pub value: Tensor,
}

impl LayerKv {
    /// `(batch, heads, cache_len, head_dim)` of the key tensor.
    pub fn dims(&self) -> SeqRecResult<(usize, usize, usize, usize)> {
        self.key.dims4().map_err(map_candle)
    }
}

/// Per-layer key/value cache with a uniform sequence length.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerKv>,
    seq_len: usize,
}

impl KvCache {
    /// Build a cache, checking that all layers agree on shape.
    pub fn new(layers: Vec<LayerKv>) -> SeqRecResult<Self> {
        let first = layers
            .first()
            .ok_or_else(|| SeqRecError::consistency("kv cache layer count", 1, 0))?;
        let (batch, heads, seq_len, head_dim) = first.dims()?;

        for (idx, layer) in layers.iter().enumerate() {
            let key_dims = layer.dims()?;
            let value_dims = layer.value.dims4().map_err(map_candle)?;
            if key_dims != value_dims {
                return Err(SeqRecError::consistency(
                    format!("kv cache layer {} value length", idx),
                    key_dims.2,
                    value_dims.2,
                ));
            }
            if key_dims.2 != seq_len {
                return Err(SeqRecError::consistency(
                    format!("kv cache layer {} length", idx),
                    seq_len,
                    key_dims.2,
                ));
            }
            if key_dims.0 != batch {
                return Err(SeqRecError::consistency(
                    format!("kv cache layer {} batch", idx),
                    batch,
                    key_dims.0,
                ));
            }
            if (key_dims.1, key_dims.3) != (heads, head_dim) {
                return Err(SeqRecError::consistency(
                    format!("kv cache layer {} heads*head_dim", idx),
                    heads * head_dim,
                    key_dims.1 * key_dims.3,
                ));
            }
        }

        Ok(Self { layers, seq_len })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of cached positions (identical across layers).
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn batch_size(&self) -> SeqRecResult<usize> {
        Ok(self.layers[0].dims()?.0)
    }

    pub fn layer(&self, idx: usize) -> Option<&LayerKv> {
        self.layers.get(idx)
    }

    pub fn layers(&self) -> &[LayerKv] {
        &self.layers
    }

    /// Concatenate `suffix` after `self` along the sequence axis, layer by layer.
    ///
    /// Keys and values are concatenated independently. The result spans
    /// `self.seq_len() + suffix.seq_len()` positions.
    pub fn append(&self, suffix: &KvCache) -> SeqRecResult<KvCache> {
        if suffix.num_layers() != self.num_layers() {
            return Err(SeqRecError::consistency(
                "kv cache append layer count",
                self.num_layers(),
                suffix.num_layers(),
            ));
        }
        let batch = self.batch_size()?;
        let suffix_batch = suffix.batch_size()?;
        if batch != suffix_batch {
            return Err(SeqRecError::consistency(
                "kv cache append batch",
                batch,
                suffix_batch,
            ));
        }

        let layers = self
            .layers
            .iter()
            .zip(suffix.layers.iter())
            .map(|(past, next)| {
                Ok(LayerKv {
                    key: Tensor::cat(&[&past.key, &next.key], 2).map_err(map_candle)?,
                    value: Tensor::cat(&[&past.value, &next.value], 2).map_err(map_candle)?,
                })
            })
            .collect::<SeqRecResult<Vec<_>>>()?;

        let merged = KvCache::new(layers)?;
        let expected = self.seq_len + suffix.seq_len;
        if merged.seq_len() != expected {
            return Err(SeqRecError::consistency(
                "kv cache append length",
                expected,
                merged.seq_len(),
            ));
        }
        Ok(merged)
    }
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("KV cache error: {}", e),
    }
}
