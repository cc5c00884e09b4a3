//! OPT-family decoder used as the pretrained backbone.
//!
//! Only the pieces the adapter needs are modelled: token + learned positional
//! embeddings, the decoder layer stack and the final layer norm. The full
//! stack is held by [`OptDecoder`]; [`crate::backbone::BackboneAdapter`] takes
//! it apart into a window.

mod layers;
mod loader;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{SeqRecError, SeqRecResult};
use crate::layers::{LayerNorm, INIT_STD};
use crate::params::{Init, Param, ParamRole, ParamTag};

pub use layers::OptDecoderLayer;
pub use loader::load_opt_decoder;

/// OPT learned positional embeddings are offset by 2 (padding_idx + 1).
pub const POSITION_OFFSET: usize = 2;

/// Additive bias for masked attention scores.
const MASKED_BIAS: f32 = -1.0e9;

/// Backbone hyperparameters, deserialised from HuggingFace `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub ffn_dim: usize,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub word_embed_proj_dim: Option<usize>,
    #[serde(default = "default_do_layer_norm_before")]
    pub do_layer_norm_before: bool,
    #[serde(default = "default_activation")]
    pub activation_function: String,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_do_layer_norm_before() -> bool {
    true
}

fn default_activation() -> String {
    "relu".to_string()
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl OptConfig {
    /// Small configuration for tests and smoke runs.
    pub fn tiny(num_layers: usize, hidden_size: usize, num_heads: usize) -> Self {
        Self {
            vocab_size: 64,
            hidden_size,
            num_hidden_layers: num_layers,
            num_attention_heads: num_heads,
            ffn_dim: hidden_size * 2,
            max_position_embeddings: 64,
            word_embed_proj_dim: None,
            do_layer_norm_before: true,
            activation_function: default_activation(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn activation(&self) -> SeqRecResult<OptActivation> {
        match self.activation_function.as_str() {
            "relu" => Ok(OptActivation::Relu),
            "gelu" | "gelu_new" => Ok(OptActivation::Gelu),
            other => Err(SeqRecError::config(format!(
                "unsupported OPT activation_function '{}'",
                other
            ))),
        }
    }

    pub fn validate(&self) -> SeqRecResult<()> {
        if self.num_hidden_layers == 0 {
            return Err(SeqRecError::config("num_hidden_layers must be > 0"));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(SeqRecError::config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if let Some(proj) = self.word_embed_proj_dim {
            if proj != self.hidden_size {
                return Err(SeqRecError::config(format!(
                    "word_embed_proj_dim {} != hidden_size {} (project_in/out not supported)",
                    proj, self.hidden_size
                )));
            }
        }
        self.activation()?;
        Ok(())
    }
}

/// FFN activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptActivation {
    Relu,
    Gelu,
}

impl OptActivation {
    pub fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Relu => x.relu(),
            Self::Gelu => x.gelu_erf(),
        }
    }
}

/// Token and positional embedding tables.
#[derive(Debug, Clone)]
pub struct OptEmbeddings {
    pub embed_tokens: Param,
    pub embed_positions: Param,
}

impl OptEmbeddings {
    /// Look up token embeddings: `[batch, seq]` ids -> `[batch, seq, hidden]`.
    pub fn embed_ids(&self, input_ids: &Tensor) -> SeqRecResult<Tensor> {
        let (batch, seq_len) = input_ids.dims2().map_err(map_candle)?;
        let table = self.embed_tokens.tensor();
        let hidden = table.dim(1).map_err(map_candle)?;
        table
            .index_select(
                &input_ids
                    .to_dtype(DType::U32)
                    .map_err(map_candle)?
                    .flatten_all()
                    .map_err(map_candle)?,
                0,
            )
            .map_err(map_candle)?
            .reshape((batch, seq_len, hidden))
            .map_err(map_candle)
    }

    /// Positional embeddings for the `new_len` positions after `past_len`.
    ///
    /// Positions come from the full mask: `cumsum(mask) * mask - 1`, so masked
    /// slots fall back to the padding row and prefix positions shift real tokens.
    pub fn embed_positions(
        &self,
        attention_mask: &Tensor,
        past_len: usize,
        new_len: usize,
    ) -> SeqRecResult<Tensor> {
        let (batch, total_len) = attention_mask.dims2().map_err(map_candle)?;
        let table = self.embed_positions.tensor();
        let (num_positions, hidden) = table.dims2().map_err(map_candle)?;
        if total_len + POSITION_OFFSET > num_positions {
            return Err(SeqRecError::config(format!(
                "sequence of {} positions exceeds max_position_embeddings {}",
                total_len,
                num_positions - POSITION_OFFSET
            )));
        }

        let mask = attention_mask.to_dtype(DType::F32).map_err(map_candle)?;
        let positions = mask
            .cumsum(1)
            .map_err(map_candle)?
            .mul(&mask)
            .map_err(map_candle)?
            .affine(1.0, POSITION_OFFSET as f64 - 1.0)
            .map_err(map_candle)?
            .narrow(1, past_len, new_len)
            .map_err(map_candle)?
            .to_dtype(DType::U32)
            .map_err(map_candle)?
            .flatten_all()
            .map_err(map_candle)?;

        table
            .index_select(&positions, 0)
            .map_err(map_candle)?
            .reshape((batch, new_len, hidden))
            .map_err(map_candle)
    }

    pub fn params(&self) -> Vec<&Param> {
        vec![&self.embed_tokens, &self.embed_positions]
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.embed_tokens.set_trainable(trainable);
        self.embed_positions.set_trainable(trainable);
    }
}

/// Full decoder stack as loaded from disk.
#[derive(Debug, Clone)]
pub struct OptDecoder {
    pub config: OptConfig,
    pub embeddings: OptEmbeddings,
    pub layers: Vec<OptDecoderLayer>,
    /// Present only for pre-norm checkpoints.
    pub final_layer_norm: Option<LayerNorm>,
    pub device: Device,
}

impl OptDecoder {
    /// Decoder with deterministic synthetic weights.
    pub fn synthetic(config: OptConfig, device: &Device) -> SeqRecResult<Self> {
        config.validate()?;
        let activation = config.activation()?;
        let hidden = config.hidden_size;

        let embeddings = OptEmbeddings {
            embed_tokens: Param::initialized(
                "decoder.embed_tokens.weight",
                &[config.vocab_size, hidden],
                Init::Uniform { std: INIT_STD },
                ParamTag::Embedding,
                ParamRole::Weight,
                device,
            )?,
            embed_positions: Param::initialized(
                "decoder.embed_positions.weight",
                &[config.max_position_embeddings + POSITION_OFFSET, hidden],
                Init::Uniform { std: INIT_STD },
                ParamTag::Embedding,
                ParamRole::Weight,
                device,
            )?,
        };

        let layers = (0..config.num_hidden_layers)
            .map(|idx| {
                OptDecoderLayer::synthetic(
                    idx,
                    hidden,
                    config.ffn_dim,
                    config.num_attention_heads,
                    config.layer_norm_eps,
                    config.do_layer_norm_before,
                    activation,
                    device,
                )
            })
            .collect::<SeqRecResult<Vec<_>>>()?;

        let final_layer_norm = if config.do_layer_norm_before {
            Some(LayerNorm::new(
                "decoder.final_layer_norm",
                hidden,
                config.layer_norm_eps,
                ParamTag::Other,
                device,
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            embeddings,
            layers,
            final_layer_norm,
            device: device.clone(),
        })
    }
}

/// Additive attention bias `[batch, 1, new_len, past_len + new_len]`.
///
/// Query `i` (absolute position `past_len + i`) may attend key `j` iff
/// `j <= past_len + i` and `mask[j] == 1`.
pub fn attention_bias(
    attention_mask: &Tensor,
    past_len: usize,
    new_len: usize,
) -> SeqRecResult<Tensor> {
    let (batch, total_len) = attention_mask.dims2().map_err(map_candle)?;
    if total_len != past_len + new_len {
        return Err(SeqRecError::consistency(
            "attention bias mask length",
            past_len + new_len,
            total_len,
        ));
    }
    let device = attention_mask.device();

    let causal: Vec<f32> = (0..new_len)
        .flat_map(|i| {
            (0..total_len).map(move |j| if j <= past_len + i { 0.0 } else { MASKED_BIAS })
        })
        .collect();
    let causal = Tensor::from_vec(causal, (1, 1, new_len, total_len), device).map_err(map_candle)?;

    // (1 - mask) * MASKED_BIAS
    let padding = attention_mask
        .to_dtype(DType::F32)
        .map_err(map_candle)?
        .affine(-(MASKED_BIAS as f64), MASKED_BIAS as f64)
        .map_err(map_candle)?
        .reshape((batch, 1, 1, total_len))
        .map_err(map_candle)?;

    causal.broadcast_add(&padding).map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("OPT error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserializes_hf_json() {
        let json = r#"{
            "vocab_size": 50272, "hidden_size": 768, "num_hidden_layers": 12,
            "num_attention_heads": 12, "ffn_dim": 3072, "max_position_embeddings": 2048,
            "word_embed_proj_dim": 768, "do_layer_norm_before": true,
            "activation_function": "relu", "torch_dtype": "float16"
        }"#;
        let config: OptConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.head_dim(), 64);
        assert!((config.layer_norm_eps - 1e-5).abs() < 1e-12);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_rejects_projected_embeddings() {
        let mut config = OptConfig::tiny(2, 8, 2);
        config.word_embed_proj_dim = Some(4);
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_attention_bias_is_causal_over_past() {
        let device = Device::Cpu;
        let mask = Tensor::new(&[[1f32, 1.0, 1.0, 0.0]], &device).unwrap();
        let bias = attention_bias(&mask, 2, 2).unwrap();
        assert_eq!(bias.dims(), &[1, 1, 2, 4]);

        let rows: Vec<Vec<f32>> = bias.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        // query 0 sits at position 2: sees 0..=2
        assert_eq!(rows[0][..3], [0.0, 0.0, 0.0]);
        assert!(rows[0][3] < -1.0e8);
        // query 1 sits at position 3: causally allowed but padded
        assert_eq!(rows[1][..3], [0.0, 0.0, 0.0]);
        assert!(rows[1][3] < -1.0e8);
    }

    #[test]
    fn test_positions_shift_after_prefix() {
        let device = Device::Cpu;
        let decoder = OptDecoder::synthetic(OptConfig::tiny(1, 4, 1), &device).unwrap();
        let table = decoder.embeddings.embed_positions.tensor();

        // two prefix slots then three real tokens
        let mask = Tensor::new(&[[1u32, 1, 1, 1, 1]], &device).unwrap();
        let pos = decoder.embeddings.embed_positions(&mask, 2, 3).unwrap();
        let expected = table.narrow(0, 2 + POSITION_OFFSET, 3).unwrap().unsqueeze(0).unwrap();

        let diff: f32 = (pos - expected).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }
}
