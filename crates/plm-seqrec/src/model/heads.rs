//! Dense heads around the sequence encoder.

use candle_core::{Device, Tensor};

use crate::error::{SeqRecError, SeqRecResult};
use crate::layers::Dense;
use crate::params::{Param, ParamTag};

/// Item embedding -> sequence-encoder width, GELU between layers.
#[derive(Debug, Clone)]
pub struct ProjectionHead {
    layers: Vec<Dense>,
}

impl ProjectionHead {
    /// `inner_sizes.len() + 1` dense layers from `in_dim` to `out_dim`.
    pub fn new(in_dim: usize, inner_sizes: &[usize], out_dim: usize, device: &Device) -> SeqRecResult<Self> {
        let dims: Vec<usize> = std::iter::once(in_dim)
            .chain(inner_sizes.iter().copied())
            .chain(std::iter::once(out_dim))
            .collect();
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(idx, pair)| Dense::new(&format!("projection.{}", idx), pair[0], pair[1], ParamTag::Other, device))
            .collect::<SeqRecResult<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn forward(&self, x: &Tensor) -> SeqRecResult<Tensor> {
        let mut h = x.clone();
        for (idx, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if idx + 1 < self.layers.len() {
                h = h.gelu_erf().map_err(|e| SeqRecError::TensorError {
                    message: format!("Projection error: {}", e),
                })?;
            }
        }
        Ok(h)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn params(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }
}

/// Sequence representation -> per-item logits.
#[derive(Debug, Clone)]
pub struct ClassificationHead {
    dense: Dense,
}

impl ClassificationHead {
    pub fn new(hidden_size: usize, num_items: usize, device: &Device) -> SeqRecResult<Self> {
        if num_items == 0 {
            return Err(SeqRecError::config("num_items must be > 0"));
        }
        Ok(Self {
            dense: Dense::new("classification_head", hidden_size, num_items, ParamTag::Other, device)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> SeqRecResult<Tensor> {
        self.dense.forward(x)
    }

    pub fn num_items(&self) -> usize {
        self.dense.out_dim()
    }

    pub fn params(&self) -> Vec<&Param> {
        self.dense.params()
    }
}
