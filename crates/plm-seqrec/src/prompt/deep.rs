//! Cache-level prompt: one key/value pair per kept layer.
//!
//! A `(length, prompt_hidden)` table is projected to `layers * 2 * hidden`,
//! reshaped to `(batch, length, layers, heads, 2, head_dim)` and split on the
//! `2` axis into keys and values of shape `(batch, heads, length, head_dim)`.

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::backbone::{KvCache, LayerKv};
use crate::error::{SeqRecError, SeqRecResult};
use crate::layers::{Dense, LayerNorm};
use crate::params::{Init, Param, ParamRole, ParamTag};

use super::{PromptGeometry, PROMPT_INIT_STD};

/// Table-to-cache projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptProjection {
    /// Single linear map.
    Linear,
    /// linear -> GELU -> LayerNorm -> linear.
    #[default]
    Nonlinear,
}

#[derive(Debug, Clone)]
enum Projection {
    Linear(Dense),
    Nonlinear {
        fc_in: Dense,
        norm: LayerNorm,
        fc_out: Dense,
    },
}

impl Projection {
    fn forward(&self, x: &Tensor) -> SeqRecResult<Tensor> {
        match self {
            Self::Linear(dense) => dense.forward(x),
            Self::Nonlinear { fc_in, norm, fc_out } => {
                let h = fc_in.forward(x)?.gelu_erf().map_err(map_candle)?;
                fc_out.forward(&norm.forward(&h)?)
            }
        }
    }

    fn params(&self) -> Vec<&Param> {
        match self {
            Self::Linear(dense) => dense.params(),
            Self::Nonlinear { fc_in, norm, fc_out } => {
                let mut params = fc_in.params();
                params.extend(norm.params());
                params.extend(fc_out.params());
                params
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeepPromptEncoder {
    embedding: Param,
    projection: Projection,
    length: usize,
    geometry: PromptGeometry,
}

impl DeepPromptEncoder {
    pub fn new(
        name: &str,
        length: usize,
        prompt_hidden_size: usize,
        geometry: PromptGeometry,
        projection: PromptProjection,
        layer_norm_eps: f64,
        device: &Device,
    ) -> SeqRecResult<Self> {
        if length == 0 {
            return Err(SeqRecError::config(format!("{}: prompt length must be positive", name)));
        }
        if prompt_hidden_size == 0 {
            return Err(SeqRecError::config(format!(
                "{}: prompt_hidden_size must be positive",
                name
            )));
        }
        // re-check in case the geometry was built by hand
        let geometry = PromptGeometry::new(geometry.num_layers, geometry.hidden_size, geometry.num_heads)?;

        let embedding = Param::initialized(
            format!("{}.embedding.weight", name),
            &[length, prompt_hidden_size],
            Init::Uniform { std: PROMPT_INIT_STD },
            ParamTag::Other,
            ParamRole::Weight,
            device,
        )?;

        let kind = projection;
        let out_dim = geometry.num_layers * 2 * geometry.hidden_size;
        let projection = match kind {
            PromptProjection::Linear => Projection::Linear(Dense::new(
                &format!("{}.trans.0", name),
                prompt_hidden_size,
                out_dim,
                ParamTag::Other,
                device,
            )?),
            PromptProjection::Nonlinear => Projection::Nonlinear {
                fc_in: Dense::new(
                    &format!("{}.trans.0", name),
                    prompt_hidden_size,
                    prompt_hidden_size,
                    ParamTag::Other,
                    device,
                )?,
                norm: LayerNorm::new(
                    &format!("{}.trans.2", name),
                    prompt_hidden_size,
                    layer_norm_eps,
                    ParamTag::Other,
                    device,
                )?,
                fc_out: Dense::new(
                    &format!("{}.trans.3", name),
                    prompt_hidden_size,
                    out_dim,
                    ParamTag::Other,
                    device,
                )?,
            },
        };

        tracing::debug!(
            "{}: {} virtual tokens over {} layers ({:?} projection)",
            name,
            length,
            geometry.num_layers,
            kind
        );

        Ok(Self {
            embedding,
            projection,
            length,
            geometry,
        })
    }

    /// Cache of `length` positions on every kept layer.
    pub fn generate(&self, batch_size: usize) -> SeqRecResult<KvCache> {
        let PromptGeometry {
            num_layers,
            hidden_size,
            num_heads,
        } = self.geometry;
        let head_dim = self.geometry.head_dim();

        // projection is batch independent; broadcast afterwards
        let projected = self.projection.forward(&self.embedding.tensor())?;
        let projected = projected
            .unsqueeze(0)
            .and_then(|t| t.broadcast_as((batch_size, self.length, num_layers * 2 * hidden_size)))
            .and_then(|t| t.contiguous())
            .and_then(|t| t.reshape((batch_size, self.length, num_layers, num_heads, 2, head_dim)))
            .map_err(map_candle)?;

        let pick = |layer: usize, slot: usize| -> SeqRecResult<Tensor> {
            projected
                .narrow(2, layer, 1)
                .and_then(|t| t.narrow(4, slot, 1))
                .and_then(|t| t.reshape((batch_size, self.length, num_heads, head_dim)))
                .and_then(|t| t.transpose(1, 2))
                .and_then(|t| t.contiguous())
                .map_err(map_candle)
        };

        let layers = (0..num_layers)
            .map(|layer| {
                Ok(LayerKv {
                    key: pick(layer, 0)?,
                    value: pick(layer, 1)?,
                })
            })
            .collect::<SeqRecResult<Vec<_>>>()?;

        KvCache::new(layers)
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn geometry(&self) -> PromptGeometry {
        self.geometry
    }

    pub fn params(&self) -> Vec<&Param> {
        let mut params = vec![&self.embedding];
        params.extend(self.projection.params());
        params
    }
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Deep prompt error: {}", e),
    }
}
