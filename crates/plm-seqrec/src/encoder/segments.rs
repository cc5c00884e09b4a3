//! Segment plan and the two-pass forward protocol.
//!
//! Logical positions, in order:
//!
//! ```text
//! [ prefix | real tokens | postfix | last query ]
//!   cache    pass 1         cache    pass 2
//! ```
//!
//! Pass 1 feeds the real tokens with the prefix cache as past. Pass 2 (only
//! when a last-query segment exists) appends the postfix cache to the pass-1
//! cache and feeds the last-query embeddings. The attention mask always spans
//! `cache_len + new_positions`; any mismatch aborts with
//! [`SeqRecError::InternalConsistencyError`].

use candle_core::{Device, Tensor};

use crate::backbone::{BackboneAdapter, BackboneInput, BackboneOutput};
use crate::config::EncoderConfig;
use crate::error::{SeqRecError, SeqRecResult};
use crate::params::Param;
use crate::prompt::{DeepPromptEncoder, PromptGeometry, ShallowPromptEncoder};

/// Segment lengths; 0 means absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentPlan {
    pub pre_seq_len: usize,
    pub post_seq_len: usize,
    pub last_query_len: usize,
}

impl SegmentPlan {
    pub fn from_config(config: &EncoderConfig) -> SeqRecResult<Self> {
        let plan = Self {
            pre_seq_len: config.pre_seq_len,
            post_seq_len: config.post_seq_len,
            last_query_len: config.last_query_len,
        };
        if plan.post_seq_len > 0 && plan.last_query_len == 0 {
            return Err(SeqRecError::config(
                "last_query_len must be at least 1 when post_seq_len > 0",
            ));
        }
        Ok(plan)
    }

    pub fn has_second_pass(&self) -> bool {
        self.last_query_len > 0
    }

    pub fn is_empty(&self) -> bool {
        self.pre_seq_len == 0 && self.post_seq_len == 0 && self.last_query_len == 0
    }
}

/// Hidden states of each pass plus the splice lengths actually used.
#[derive(Debug, Clone)]
pub struct SegmentOutputs {
    /// `[batch, real_len, hidden]` from pass 1.
    pub first_pass: Tensor,
    /// `[batch, last_query_len, hidden]` from pass 2.
    pub second_pass: Option<Tensor>,
    /// Cache length after pass 1 (`pre + real`).
    pub first_cache_len: usize,
    /// Mask length of pass 2 (`pre + real + post + last_query`).
    pub second_mask_len: Option<usize>,
}

impl SegmentOutputs {
    /// Outputs of a plain single pass.
    pub fn single_pass(output: BackboneOutput) -> Self {
        let first_cache_len = output.cache.seq_len();
        Self {
            first_pass: output.hidden_states,
            second_pass: None,
            first_cache_len,
            second_mask_len: None,
        }
    }
}

/// Prompt encoders of each segment plus the protocol that splices them in.
#[derive(Debug, Clone)]
pub struct SegmentAssembler {
    plan: SegmentPlan,
    prefix: Option<DeepPromptEncoder>,
    postfix: Option<DeepPromptEncoder>,
    last_query: Option<ShallowPromptEncoder>,
}

impl SegmentAssembler {
    /// Build prompt encoders for every configured segment against `geometry`.
    pub fn new(config: &EncoderConfig, geometry: PromptGeometry, device: &Device) -> SeqRecResult<Self> {
        let plan = SegmentPlan::from_config(config)?;
        let deep = |name: &str, length: usize| -> SeqRecResult<Option<DeepPromptEncoder>> {
            if length == 0 {
                return Ok(None);
            }
            DeepPromptEncoder::new(
                name,
                length,
                config.prompt_hidden_size,
                geometry,
                config.prompt_projection,
                config.layer_norm_eps,
                device,
            )
            .map(Some)
        };

        let prefix = deep("prefix_encoder", plan.pre_seq_len)?;
        let postfix = deep("postfix_encoder", plan.post_seq_len)?;
        let last_query = if plan.last_query_len > 0 {
            Some(ShallowPromptEncoder::new(
                "last_query_encoder",
                plan.last_query_len,
                geometry.hidden_size,
                device,
            )?)
        } else {
            None
        };

        tracing::info!(
            "Prompt segments: prefix={}, postfix={}, last_query={} over {} layers",
            plan.pre_seq_len,
            plan.post_seq_len,
            plan.last_query_len,
            geometry.num_layers
        );

        Ok(Self {
            plan,
            prefix,
            postfix,
            last_query,
        })
    }

    pub fn plan(&self) -> SegmentPlan {
        self.plan
    }

    /// Run pass 1 and, if configured, pass 2.
    ///
    /// `input_ids` and `attention_mask` are `[batch, real_len]`.
    pub fn run(
        &self,
        backbone: &BackboneAdapter,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> SeqRecResult<SegmentOutputs> {
        let (batch, real_len) = attention_mask.dims2().map_err(map_candle)?;
        let device = attention_mask.device();
        let mask_dtype = attention_mask.dtype();

        // pass 1: [prefix | real]
        let (first, first_mask) = match &self.prefix {
            Some(prefix) => {
                let prefix_cache = prefix.generate(batch)?;
                let prefix_mask =
                    Tensor::ones((batch, prefix.len()), mask_dtype, device).map_err(map_candle)?;
                let mask = Tensor::cat(&[&prefix_mask, attention_mask], 1).map_err(map_candle)?;
                let out = backbone.run(BackboneInput::TokenIds(input_ids), &mask, Some(&prefix_cache))?;
                (out, mask)
            }
            None => (
                backbone.run(BackboneInput::TokenIds(input_ids), attention_mask, None)?,
                attention_mask.clone(),
            ),
        };

        let first_cache_len = first.cache.seq_len();
        let expected = self.plan.pre_seq_len + real_len;
        if first_cache_len != expected {
            return Err(SeqRecError::consistency("first pass cache", expected, first_cache_len));
        }

        let last_query = match &self.last_query {
            Some(last_query) => last_query,
            None => {
                return Ok(SegmentOutputs {
                    first_pass: first.hidden_states,
                    second_pass: None,
                    first_cache_len,
                    second_mask_len: None,
                })
            }
        };

        // pass 2: [prefix | real | postfix | last query]
        let cache = match &self.postfix {
            Some(postfix) => first.cache.append(&postfix.generate(batch)?)?,
            None => first.cache,
        };
        let extension = Tensor::ones(
            (batch, self.plan.post_seq_len + last_query.len()),
            mask_dtype,
            device,
        )
        .map_err(map_candle)?;
        let second_mask = Tensor::cat(&[&first_mask, &extension], 1).map_err(map_candle)?;

        let second_mask_len = second_mask.dim(1).map_err(map_candle)?;
        let expected = cache.seq_len() + last_query.len();
        if second_mask_len != expected {
            return Err(SeqRecError::consistency(
                "second pass attention mask",
                expected,
                second_mask_len,
            ));
        }

        let query_embeds = last_query.generate(batch)?;
        let second = backbone.run(BackboneInput::Embeddings(&query_embeds), &second_mask, Some(&cache))?;

        Ok(SegmentOutputs {
            first_pass: first.hidden_states,
            second_pass: Some(second.hidden_states),
            first_cache_len,
            second_mask_len: Some(second_mask_len),
        })
    }

    pub fn params(&self) -> Vec<&Param> {
        let mut params = Vec::new();
        if let Some(prefix) = &self.prefix {
            params.extend(prefix.params());
        }
        if let Some(postfix) = &self.postfix {
            params.extend(postfix.params());
        }
        if let Some(last_query) = &self.last_query {
            params.extend(last_query.params());
        }
        params
    }
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Segment error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::{LayerWindow, OptConfig, OptDecoder};
    use crate::config::PoolingMethod;
    use candle_core::DType;

    fn backbone(layers: usize) -> BackboneAdapter {
        let decoder = OptDecoder::synthetic(OptConfig::tiny(layers, 8, 2), &Device::Cpu).unwrap();
        BackboneAdapter::new(decoder, true, LayerWindow::full(layers).unwrap()).unwrap()
    }

    fn batch(rows: usize, len: usize) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let ids: Vec<u32> = (0..rows * len).map(|i| (i % 40 + 2) as u32).collect();
        (
            Tensor::from_vec(ids, (rows, len), &device).unwrap(),
            Tensor::ones((rows, len), DType::U32, &device).unwrap(),
        )
    }

    #[test]
    fn test_prefix_and_last_query_lengths() {
        let backbone = backbone(4);
        let config = EncoderConfig::prompt(PoolingMethod::Last, 2, 0, 1);
        let assembler = SegmentAssembler::new(&config, PromptGeometry::of(&backbone).unwrap(), &Device::Cpu).unwrap();
        let (ids, mask) = batch(3, 5);

        let out = assembler.run(&backbone, &ids, &mask).unwrap();
        assert_eq!(out.first_cache_len, 7);
        assert_eq!(out.second_mask_len, Some(8));
        assert_eq!(out.first_pass.dims(), &[3, 5, 8]);
        assert_eq!(out.second_pass.unwrap().dims(), &[3, 1, 8]);
    }

    #[test]
    fn test_postfix_extends_second_pass() {
        let backbone = backbone(2);
        let config = EncoderConfig::prompt(PoolingMethod::MeanLast, 3, 4, 2);
        let assembler = SegmentAssembler::new(&config, PromptGeometry::of(&backbone).unwrap(), &Device::Cpu).unwrap();
        let (ids, mask) = batch(2, 5);

        let out = assembler.run(&backbone, &ids, &mask).unwrap();
        assert_eq!(out.first_cache_len, 8);
        assert_eq!(out.second_mask_len, Some(3 + 5 + 4 + 2));
        assert_eq!(out.second_pass.unwrap().dims(), &[2, 2, 8]);
    }

    #[test]
    fn test_no_prompts_is_single_pass() {
        let backbone = backbone(2);
        let config = EncoderConfig::prompt(PoolingMethod::Mean, 0, 0, 0);
        let assembler = SegmentAssembler::new(&config, PromptGeometry::of(&backbone).unwrap(), &Device::Cpu).unwrap();
        assert!(assembler.params().is_empty());

        let (ids, mask) = batch(2, 4);
        let out = assembler.run(&backbone, &ids, &mask).unwrap();
        assert_eq!(out.first_cache_len, 4);
        assert!(out.second_pass.is_none());
    }

    #[test]
    fn test_prompts_generated_for_wrong_window_rejected() {
        let backbone = backbone(4);
        let geometry = PromptGeometry::new(3, 8, 2).unwrap();
        let config = EncoderConfig::prompt(PoolingMethod::Mean, 2, 0, 0);
        let assembler = SegmentAssembler::new(&config, geometry, &Device::Cpu).unwrap();
        let (ids, mask) = batch(1, 3);

        let err = assembler.run(&backbone, &ids, &mask).unwrap_err();
        assert!(err.is_consistency());
    }

    #[test]
    fn test_postfix_requires_last_query() {
        let config = EncoderConfig::prompt(PoolingMethod::Mean, 0, 2, 0);
        let geometry = PromptGeometry::new(1, 8, 2).unwrap();
        assert!(SegmentAssembler::new(&config, geometry, &Device::Cpu).unwrap_err().is_configuration());
    }
}
