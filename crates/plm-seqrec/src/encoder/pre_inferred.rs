//! Encoder over a backbone whose lower part is computed offline.
//!
//! With `plm_last_n_unfreeze = n`:
//!
//! | n | offline ([`HiddenStatePrecomputer`]) | online ([`PreInferredEncoder`]) |
//! |---|---|---|
//! | 0 | full backbone + pooling | pass-through |
//! | 1..L-1 | layers `[0, L-n)` with embeddings | layers `[L-n, L)` + pooling |
//! | L | embeddings only | every layer + pooling |

use candle_core::Tensor;

use crate::backbone::{BackboneAdapter, BackboneInput, LayerWindow, OptDecoder, OptEmbeddings};
use crate::config::{EncoderConfig, PoolingMethod, TuningMode};
use crate::error::{SeqRecError, SeqRecResult};
use crate::params::Param;

use super::pooling::{build_pooling, PoolingStrategy};
use super::segments::SegmentOutputs;
use super::{collapse_items, ItemEmbedder};

/// Online half: the trainable top window, if any.
#[derive(Debug)]
pub struct PreInferredEncoder {
    top: Option<BackboneAdapter>,
    pooling: Box<dyn PoolingStrategy>,
    hidden_size: usize,
}

/// Offline half: produces the inputs [`PreInferredEncoder`] expects.
#[derive(Debug)]
pub struct HiddenStatePrecomputer {
    stage: PrecomputeStage,
    pooling: Box<dyn PoolingStrategy>,
}

#[derive(Debug)]
enum PrecomputeStage {
    /// Whole backbone, pooled.
    Pooled(BackboneAdapter),
    /// Bottom window, raw hidden states.
    Hidden(BackboneAdapter),
    /// Token plus positional embeddings.
    Embeddings(OptEmbeddings),
}

impl PreInferredEncoder {
    /// Split `decoder` into the offline and online halves.
    pub fn split(decoder: OptDecoder, config: &EncoderConfig) -> SeqRecResult<(Self, HiddenStatePrecomputer)> {
        if config.tuning != TuningMode::PreInferred {
            return Err(SeqRecError::config(format!(
                "PreInferredEncoder needs tuning 'pre_inferred', got '{}'",
                config.tuning.as_str()
            )));
        }
        let total = decoder.config.num_hidden_layers;
        config.validate_for_backbone(total)?;

        let hidden_size = decoder.config.hidden_size;
        let device = decoder.device.clone();
        let pooling = || {
            build_pooling(
                config.pooling_method,
                TuningMode::PreInferred,
                hidden_size,
                config.layer_norm_eps,
                &device,
            )
        };

        // validate_for_backbone bounds n to 0..=total
        let n = config.plm_last_n_unfreeze as usize;
        let (top, stage) = if n == 0 {
            let mut full = BackboneAdapter::new(decoder, true, LayerWindow::full(total)?)?;
            full.freeze(0)?;
            (None, PrecomputeStage::Pooled(full))
        } else {
            let stage = if n == total {
                let mut embeddings = decoder.embeddings.clone();
                embeddings.set_trainable(false);
                PrecomputeStage::Embeddings(embeddings)
            } else {
                let mut bottom = BackboneAdapter::new(decoder.clone(), true, LayerWindow::bottom(total - n, total)?)?;
                bottom.freeze(0)?;
                PrecomputeStage::Hidden(bottom)
            };
            let mut top = BackboneAdapter::new(decoder, false, LayerWindow::top(n, total)?)?;
            top.freeze(-1)?;
            (Some(top), stage)
        };

        tracing::info!(
            "Pre-inferred encoder: {} of {} layers online, pooling={}",
            n,
            total,
            config.pooling_method
        );

        Ok((
            Self {
                top,
                pooling: pooling()?,
                hidden_size,
            },
            HiddenStatePrecomputer {
                stage,
                pooling: pooling()?,
            },
        ))
    }

    /// Online half only.
    pub fn new(decoder: OptDecoder, config: &EncoderConfig) -> SeqRecResult<Self> {
        Self::split(decoder, config).map(|(encoder, _)| encoder)
    }

    pub fn pooling_method(&self) -> PoolingMethod {
        self.pooling.method()
    }

    /// Kept online layers.
    pub fn num_online_layers(&self) -> usize {
        self.top.as_ref().map_or(0, |t| t.num_kept_layers())
    }
}

impl ItemEmbedder for PreInferredEncoder {
    /// Pooled `[items, hidden]` (pass-through) or hidden states
    /// `[items, tokens, hidden]` with their `[items, tokens]` mask.
    fn embed_items(&self, inputs: &Tensor, attention_mask: &Tensor) -> SeqRecResult<Tensor> {
        match &self.top {
            None => collapse_items(inputs, 2),
            Some(top) => {
                let hidden = collapse_items(inputs, 3)?;
                let mask = collapse_items(attention_mask, 2)?;
                let output = top.run(BackboneInput::Embeddings(&hidden), &mask, None)?;
                self.pooling.pool(&SegmentOutputs::single_pass(output), &mask)
            }
        }
    }

    fn output_size(&self) -> usize {
        self.hidden_size
    }

    fn backbone(&self) -> Option<&BackboneAdapter> {
        self.top.as_ref()
    }

    fn extra_params(&self) -> Vec<&Param> {
        self.pooling.params()
    }
}

impl HiddenStatePrecomputer {
    /// Inputs for [`PreInferredEncoder`] from `[items, tokens]` ids and mask.
    ///
    /// The result never carries gradients.
    pub fn precompute_hidden_states(&self, input_ids: &Tensor, attention_mask: &Tensor) -> SeqRecResult<Tensor> {
        let ids = collapse_items(input_ids, 2)?;
        let mask = collapse_items(attention_mask, 2)?;

        let out = match &self.stage {
            PrecomputeStage::Pooled(full) => {
                let output = full.run(BackboneInput::TokenIds(&ids), &mask, None)?;
                self.pooling.pool(&SegmentOutputs::single_pass(output), &mask)?
            }
            PrecomputeStage::Hidden(bottom) => {
                bottom.run(BackboneInput::TokenIds(&ids), &mask, None)?.hidden_states
            }
            PrecomputeStage::Embeddings(embeddings) => {
                let len = ids.dim(1).map_err(map_candle)?;
                embeddings
                    .embed_ids(&ids)?
                    .add(&embeddings.embed_positions(&mask, 0, len)?)
                    .map_err(map_candle)?
            }
        };
        Ok(out.detach())
    }
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Pre-inferred encoder error: {}", e),
    }
}
