//! Item encoders: token sequences in, one pooled vector per item out.
//!
//! - [`ItemEncoder`]: live backbone, plain fine-tuning or prompt-conditioned
//! - [`PreInferredEncoder`]: frozen bottom of the backbone computed offline
//!
//! Both implement [`ItemEmbedder`], which is what the recommendation model consumes.

mod pooling;
mod pre_inferred;
mod segments;

pub use pooling::{
    build_pooling, LastQueryPooling, LastTokenPooling, MeanLastFusion, MeanPooling, PoolingStrategy,
};
pub use pre_inferred::{HiddenStatePrecomputer, PreInferredEncoder};
pub use segments::{SegmentAssembler, SegmentOutputs, SegmentPlan};

use candle_core::Tensor;

use crate::backbone::{BackboneAdapter, BackboneInput, LayerWindow, OptDecoder};
use crate::config::{EncoderConfig, TuningMode};
use crate::error::{SeqRecError, SeqRecResult};
use crate::params::Param;
use crate::prompt::PromptGeometry;

/// Anything that turns per-item inputs into pooled item embeddings.
pub trait ItemEmbedder {
    /// `[items, hidden]` for flattened per-item inputs.
    ///
    /// Inputs with one extra leading axis (`[batch, seq_items, ...]`) are
    /// collapsed first.
    fn embed_items(&self, inputs: &Tensor, attention_mask: &Tensor) -> SeqRecResult<Tensor>;

    /// Width of the pooled embedding.
    fn output_size(&self) -> usize;

    /// Backbone parameters are grouped per layer by the optimizer builder.
    fn backbone(&self) -> Option<&BackboneAdapter>;

    /// Learned parameters outside the backbone (prompts, fusion MLP).
    fn extra_params(&self) -> Vec<&Param>;
}

/// Item encoder over a live backbone.
#[derive(Debug)]
pub struct ItemEncoder {
    backbone: BackboneAdapter,
    segments: Option<SegmentAssembler>,
    pooling: Box<dyn PoolingStrategy>,
    tuning: TuningMode,
}

impl ItemEncoder {
    /// Build the encoder described by `config` around the full `decoder`.
    pub fn new(decoder: OptDecoder, config: &EncoderConfig) -> SeqRecResult<Self> {
        let total_layers = decoder.config.num_hidden_layers;
        config.validate_for_backbone(total_layers)?;
        if config.tuning == TuningMode::PreInferred {
            return Err(SeqRecError::config(
                "tuning 'pre_inferred' is built with PreInferredEncoder",
            ));
        }

        let device = decoder.device.clone();
        let mut backbone = BackboneAdapter::new(decoder, true, LayerWindow::full(total_layers)?)?;
        backbone.freeze(config.plm_last_n_unfreeze)?;

        let segments = match config.tuning {
            TuningMode::Prompt if config.has_prompts() => Some(SegmentAssembler::new(
                config,
                PromptGeometry::of(&backbone)?,
                &device,
            )?),
            _ => None,
        };

        let pooling = build_pooling(
            config.pooling_method,
            config.tuning,
            backbone.hidden_size(),
            config.layer_norm_eps,
            &device,
        )?;
        let has_last_query = segments
            .as_ref()
            .is_some_and(|s| s.plan().has_second_pass());
        if pooling.needs_last_query() && !has_last_query {
            return Err(SeqRecError::config(format!(
                "pooling_method '{}' needs a last-query segment",
                pooling.method()
            )));
        }

        tracing::info!(
            "Item encoder: tuning={}, pooling={}, backbone layers={}, hidden={}",
            config.tuning.as_str(),
            pooling.method(),
            backbone.total_layers(),
            backbone.hidden_size()
        );

        Ok(Self {
            backbone,
            segments,
            pooling,
            tuning: config.tuning,
        })
    }

    /// Pooled embeddings for `[batch, tokens]` or `[batch, seq_items, tokens]` inputs.
    ///
    /// The output keeps the leading axes: `[batch, hidden]` or
    /// `[batch, seq_items, hidden]`.
    pub fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> SeqRecResult<Tensor> {
        let pooled = self.embed_items(input_ids, attention_mask)?;
        match input_ids.rank() {
            3 => {
                let (batch, items, _) = input_ids.dims3().map_err(map_candle)?;
                pooled
                    .reshape((batch, items, self.backbone.hidden_size()))
                    .map_err(map_candle)
            }
            _ => Ok(pooled),
        }
    }

    /// Hidden states of both passes, before pooling.
    pub fn forward_segments(&self, input_ids: &Tensor, attention_mask: &Tensor) -> SeqRecResult<SegmentOutputs> {
        match &self.segments {
            Some(segments) => segments.run(&self.backbone, input_ids, attention_mask),
            None => Ok(SegmentOutputs::single_pass(self.backbone.run(
                BackboneInput::TokenIds(input_ids),
                attention_mask,
                None,
            )?)),
        }
    }

    pub fn tuning(&self) -> TuningMode {
        self.tuning
    }

    pub fn segments(&self) -> Option<&SegmentAssembler> {
        self.segments.as_ref()
    }

    pub fn pooling(&self) -> &dyn PoolingStrategy {
        self.pooling.as_ref()
    }

    pub fn backbone_mut(&mut self) -> &mut BackboneAdapter {
        &mut self.backbone
    }
}

impl ItemEmbedder for ItemEncoder {
    fn embed_items(&self, input_ids: &Tensor, attention_mask: &Tensor) -> SeqRecResult<Tensor> {
        let ids = collapse_items(input_ids, 2)?;
        let mask = collapse_items(attention_mask, 2)?;

        let outputs = self.forward_segments(&ids, &mask)?;
        let pooled = self.pooling.pool(&outputs, &mask)?;

        // nothing upstream can learn: drop the graph
        if self.segments.is_none() && self.backbone.is_fully_frozen() {
            Ok(pooled.detach())
        } else {
            Ok(pooled)
        }
    }

    fn output_size(&self) -> usize {
        self.backbone.hidden_size()
    }

    fn backbone(&self) -> Option<&BackboneAdapter> {
        Some(&self.backbone)
    }

    fn extra_params(&self) -> Vec<&Param> {
        let mut params = self
            .segments
            .as_ref()
            .map(|s| s.params())
            .unwrap_or_default();
        params.extend(self.pooling.params());
        params
    }
}

/// Collapse `[batch, seq_items, ...]` into `[batch * seq_items, ...]` when the
/// tensor has one axis more than `item_rank`.
pub(crate) fn collapse_items(t: &Tensor, item_rank: usize) -> SeqRecResult<Tensor> {
    let dims = t.dims();
    if dims.len() == item_rank {
        return Ok(t.clone());
    }
    if dims.len() != item_rank + 1 {
        return Err(SeqRecError::TensorError {
            message: format!(
                "expected rank {} or {} item input, got shape {:?}",
                item_rank,
                item_rank + 1,
                dims
            ),
        });
    }
    let mut flat = Vec::with_capacity(item_rank);
    flat.push(dims[0] * dims[1]);
    flat.extend_from_slice(&dims[2..]);
    t.reshape(flat).map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Item encoder error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::OptConfig;
    use crate::config::PoolingMethod;
    use crate::ops::mean_pooling;
    use candle_core::{DType, Device};

    fn decoder(layers: usize) -> OptDecoder {
        OptDecoder::synthetic(OptConfig::tiny(layers, 8, 2), &Device::Cpu).unwrap()
    }

    fn ids(shape: &[usize]) -> Tensor {
        let count: usize = shape.iter().product();
        let data: Vec<u32> = (0..count).map(|i| (i % 30 + 4) as u32).collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_rank3_inputs_keep_leading_axes() {
        let config = EncoderConfig::prompt(PoolingMethod::Last, 2, 1, 1);
        let encoder = ItemEncoder::new(decoder(2), &config).unwrap();
        let input = ids(&[2, 3, 4]);
        let mask = Tensor::ones((2, 3, 4), DType::U32, &Device::Cpu).unwrap();

        let out = encoder.encode(&input, &mask).unwrap();
        assert_eq!(out.dims(), &[2, 3, 8]);
    }

    #[test]
    fn test_zero_prompts_mean_equals_plain_pooling() {
        let config = EncoderConfig::prompt(PoolingMethod::Mean, 0, 0, 0);
        let encoder = ItemEncoder::new(decoder(2), &config).unwrap();
        let input = ids(&[2, 5]);
        let mask = Tensor::new(&[[1u32, 1, 1, 0, 0], [1, 1, 1, 1, 1]], &Device::Cpu).unwrap();

        let pooled = encoder.encode(&input, &mask).unwrap();
        let hidden = encoder
            .backbone
            .run(BackboneInput::TokenIds(&input), &mask, None)
            .unwrap()
            .hidden_states;
        let expected = mean_pooling(&hidden, &mask).unwrap();

        let diff: f32 = (pooled - expected).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_last_pooling_without_last_query_rejected() {
        let config = EncoderConfig::prompt(PoolingMethod::Last, 3, 0, 0);
        assert!(ItemEncoder::new(decoder(2), &config).unwrap_err().is_configuration());
    }

    #[test]
    fn test_unfreeze_beyond_depth_rejected() {
        let config = EncoderConfig::finetune(PoolingMethod::Mean, 3);
        assert!(ItemEncoder::new(decoder(2), &config).unwrap_err().is_configuration());
    }

    #[test]
    fn test_frozen_finetune_is_detached() {
        let config = EncoderConfig::finetune(PoolingMethod::Mean, 0);
        let encoder = ItemEncoder::new(decoder(2), &config).unwrap();
        assert!(encoder.backbone().unwrap().is_fully_frozen());
        assert!(encoder.extra_params().is_empty());

        let mask = Tensor::ones((1, 3), DType::U32, &Device::Cpu).unwrap();
        let pooled = encoder.encode(&ids(&[1, 3]), &mask).unwrap();
        let grads = pooled.sum_all().unwrap().backward().unwrap();
        for param in encoder.backbone().unwrap().params() {
            assert!(grads.get(param.var().as_tensor()).is_none());
        }
    }

    #[test]
    fn test_prompt_gradients_reach_prompts_not_backbone() {
        let config = EncoderConfig::prompt(PoolingMethod::MeanLast, 2, 1, 1);
        let encoder = ItemEncoder::new(decoder(2), &config).unwrap();
        let mask = Tensor::ones((2, 3), DType::U32, &Device::Cpu).unwrap();

        let pooled = encoder.encode(&ids(&[2, 3]), &mask).unwrap();
        let grads = pooled.sqr().unwrap().sum_all().unwrap().backward().unwrap();

        let prompt_params = encoder.segments().unwrap().params();
        assert!(prompt_params.iter().any(|p| grads.get(p.var().as_tensor()).is_some()));
        for param in encoder.backbone().unwrap().params() {
            assert!(grads.get(param.var().as_tensor()).is_none(), "{}", param.name());
        }
    }

    #[test]
    fn test_collapse_items() {
        let t = Tensor::zeros((2, 3, 4, 5), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(collapse_items(&t, 3).unwrap().dims(), &[6, 4, 5]);
        assert_eq!(collapse_items(&t, 4).unwrap().dims(), &[2, 3, 4, 5]);
        assert!(collapse_items(&t, 2).is_err());
    }

    #[test]
    fn test_pre_inferred_mode_rejected_here() {
        let config = EncoderConfig::pre_inferred(PoolingMethod::Mean, 1);
        assert!(ItemEncoder::new(decoder(2), &config).unwrap_err().is_configuration());
    }
}
