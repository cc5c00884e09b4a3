//! Reduction of backbone outputs to one vector per item.

use std::fmt::Debug;

use candle_core::{Device, Tensor};

use crate::config::{PoolingMethod, TuningMode};
use crate::error::{SeqRecError, SeqRecResult};
use crate::layers::{Dense, LayerNorm};
use crate::ops::{last_token_pooling, mean_pooling};
use crate::params::{Param, ParamTag};

use super::segments::SegmentOutputs;

/// Pools [`SegmentOutputs`] into `[batch, hidden]`.
pub trait PoolingStrategy: Debug + Send + Sync {
    /// `real_mask` is the `[batch, real_len]` mask of the real tokens only.
    fn pool(&self, outputs: &SegmentOutputs, real_mask: &Tensor) -> SeqRecResult<Tensor>;

    /// Whether the strategy reads the second (last-query) pass.
    fn needs_last_query(&self) -> bool;

    fn method(&self) -> PoolingMethod;

    /// Learned parameters owned by the strategy.
    fn params(&self) -> Vec<&Param> {
        Vec::new()
    }
}

/// Masked mean of the first-pass hidden states over the real tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanPooling;

impl PoolingStrategy for MeanPooling {
    fn pool(&self, outputs: &SegmentOutputs, real_mask: &Tensor) -> SeqRecResult<Tensor> {
        mean_pooling(&outputs.first_pass, real_mask)
    }

    fn needs_last_query(&self) -> bool {
        false
    }

    fn method(&self) -> PoolingMethod {
        PoolingMethod::Mean
    }
}

/// Last real token of the first pass (right padding).
#[derive(Debug, Clone, Copy, Default)]
pub struct LastTokenPooling;

impl PoolingStrategy for LastTokenPooling {
    fn pool(&self, outputs: &SegmentOutputs, real_mask: &Tensor) -> SeqRecResult<Tensor> {
        last_token_pooling(&outputs.first_pass, real_mask)
    }

    fn needs_last_query(&self) -> bool {
        false
    }

    fn method(&self) -> PoolingMethod {
        PoolingMethod::Last
    }
}

/// Final position of the last-query pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastQueryPooling;

impl PoolingStrategy for LastQueryPooling {
    fn pool(&self, outputs: &SegmentOutputs, _real_mask: &Tensor) -> SeqRecResult<Tensor> {
        last_query_state(outputs)
    }

    fn needs_last_query(&self) -> bool {
        true
    }

    fn method(&self) -> PoolingMethod {
        PoolingMethod::Last
    }
}

/// `concat(mean, last) -> Linear(2H,H) -> GELU -> Linear(H,H) -> GELU -> Linear(H,H) -> LayerNorm`.
#[derive(Debug, Clone)]
pub struct MeanLastFusion {
    fc1: Dense,
    fc2: Dense,
    fc3: Dense,
    norm: LayerNorm,
}

impl MeanLastFusion {
    pub fn new(hidden_size: usize, layer_norm_eps: f64, device: &Device) -> SeqRecResult<Self> {
        Ok(Self {
            fc1: Dense::new("fusion_mlp.0", 2 * hidden_size, hidden_size, ParamTag::Other, device)?,
            fc2: Dense::new("fusion_mlp.2", hidden_size, hidden_size, ParamTag::Other, device)?,
            fc3: Dense::new("fusion_mlp.4", hidden_size, hidden_size, ParamTag::Other, device)?,
            norm: LayerNorm::new("fusion_mlp.5", hidden_size, layer_norm_eps, ParamTag::Other, device)?,
        })
    }
}

impl PoolingStrategy for MeanLastFusion {
    fn pool(&self, outputs: &SegmentOutputs, real_mask: &Tensor) -> SeqRecResult<Tensor> {
        let mean = mean_pooling(&outputs.first_pass, real_mask)?;
        let last = last_query_state(outputs)?;
        let fused = Tensor::cat(&[&mean, &last], 1).map_err(map_candle)?;

        let h = self.fc1.forward(&fused)?.gelu_erf().map_err(map_candle)?;
        let h = self.fc2.forward(&h)?.gelu_erf().map_err(map_candle)?;
        self.norm.forward(&self.fc3.forward(&h)?)
    }

    fn needs_last_query(&self) -> bool {
        true
    }

    fn method(&self) -> PoolingMethod {
        PoolingMethod::MeanLast
    }

    fn params(&self) -> Vec<&Param> {
        let mut params = self.fc1.params();
        params.extend(self.fc2.params());
        params.extend(self.fc3.params());
        params.extend(self.norm.params());
        params
    }
}

/// Pick the strategy for `method` under `tuning`.
///
/// `last` means the last real token without prompts and the last
/// last-query position with them.
pub fn build_pooling(
    method: PoolingMethod,
    tuning: TuningMode,
    hidden_size: usize,
    layer_norm_eps: f64,
    device: &Device,
) -> SeqRecResult<Box<dyn PoolingStrategy>> {
    let strategy: Box<dyn PoolingStrategy> = match (method, tuning) {
        (PoolingMethod::Mean, _) => Box::new(MeanPooling),
        (PoolingMethod::Last, TuningMode::Prompt) => Box::new(LastQueryPooling),
        (PoolingMethod::Last, _) => Box::new(LastTokenPooling),
        (PoolingMethod::MeanLast, TuningMode::Prompt) => {
            Box::new(MeanLastFusion::new(hidden_size, layer_norm_eps, device)?)
        }
        (PoolingMethod::MeanLast, other) => {
            return Err(SeqRecError::config(format!(
                "pooling_method 'mean_last' is not available for tuning '{}'",
                other.as_str()
            )))
        }
    };
    Ok(strategy)
}

fn last_query_state(outputs: &SegmentOutputs) -> SeqRecResult<Tensor> {
    let second = outputs.second_pass.as_ref().ok_or_else(|| {
        SeqRecError::config("pooling needs the last-query pass but none was run")
    })?;
    let len = second.dim(1).map_err(map_candle)?;
    second
        .narrow(1, len - 1, 1)
        .and_then(|t| t.squeeze(1))
        .map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Pooling error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn outputs(second: Option<Tensor>) -> SegmentOutputs {
        let device = Device::Cpu;
        let first = Tensor::new(&[[[1f32, 2.0], [3.0, 4.0], [9.0, 9.0]]], &device).unwrap();
        SegmentOutputs {
            first_pass: first,
            second_pass: second,
            first_cache_len: 3,
            second_mask_len: None,
        }
    }

    #[test]
    fn test_mean_uses_real_mask() {
        let mask = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap();
        let pooled: Vec<Vec<f32>> = MeanPooling.pool(&outputs(None), &mask).unwrap().to_vec2().unwrap();
        assert_eq!(pooled, vec![vec![2.0, 3.0]]);
    }

    #[test]
    fn test_last_token_vs_last_query() {
        let device = Device::Cpu;
        let mask = Tensor::new(&[[1u32, 1, 0]], &device).unwrap();
        let pooled: Vec<Vec<f32>> = LastTokenPooling.pool(&outputs(None), &mask).unwrap().to_vec2().unwrap();
        assert_eq!(pooled, vec![vec![3.0, 4.0]]);

        let second = Tensor::new(&[[[5f32, 5.0], [7.0, 8.0]]], &device).unwrap();
        let pooled: Vec<Vec<f32>> = LastQueryPooling.pool(&outputs(Some(second)), &mask).unwrap().to_vec2().unwrap();
        assert_eq!(pooled, vec![vec![7.0, 8.0]]);
    }

    #[test]
    fn test_last_query_missing_pass_rejected() {
        let mask = Tensor::ones((1, 3), DType::U32, &Device::Cpu).unwrap();
        assert!(LastQueryPooling.pool(&outputs(None), &mask).unwrap_err().is_configuration());
    }

    #[test]
    fn test_fusion_shape_and_params() {
        let device = Device::Cpu;
        let fusion = MeanLastFusion::new(2, 1e-5, &device).unwrap();
        assert_eq!(fusion.params().len(), 8);

        let mask = Tensor::ones((1, 3), DType::U32, &device).unwrap();
        let second = Tensor::ones((1, 1, 2), DType::F32, &device).unwrap();
        let pooled = fusion.pool(&outputs(Some(second)), &mask).unwrap();
        assert_eq!(pooled.dims(), &[1, 2]);
    }

    #[test]
    fn test_build_pooling_per_mode() {
        let device = Device::Cpu;
        let prompt_last = build_pooling(PoolingMethod::Last, TuningMode::Prompt, 4, 1e-5, &device).unwrap();
        assert!(prompt_last.needs_last_query());
        let plain_last = build_pooling(PoolingMethod::Last, TuningMode::Finetune, 4, 1e-5, &device).unwrap();
        assert!(!plain_last.needs_last_query());
        assert!(build_pooling(PoolingMethod::MeanLast, TuningMode::PreInferred, 4, 1e-5, &device).is_err());
    }
}
