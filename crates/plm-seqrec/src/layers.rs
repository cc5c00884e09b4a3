//! Parameterised building blocks: dense projection and layer normalization.

use candle_core::{Device, Tensor};

use crate::error::SeqRecResult;
use crate::ops::{layer_norm, linear};
use crate::params::{Init, Param, ParamRole, ParamTag};

/// Standard deviation used for freshly initialised weights.
pub const INIT_STD: f64 = 0.02;

/// Dense projection `[in] -> [out]` with bias.
#[derive(Debug, Clone)]
pub struct Dense {
    pub weight: Param,
    pub bias: Param,
}

impl Dense {
    /// New layer with deterministic small weights and zero bias.
    pub fn new(
        prefix: &str,
        in_dim: usize,
        out_dim: usize,
        tag: ParamTag,
        device: &Device,
    ) -> SeqRecResult<Self> {
        Ok(Self {
            weight: Param::initialized(
                format!("{}.weight", prefix),
                &[out_dim, in_dim],
                Init::Uniform { std: INIT_STD },
                tag,
                ParamRole::Weight,
                device,
            )?,
            bias: Param::initialized(
                format!("{}.bias", prefix),
                &[out_dim],
                Init::Zeros,
                tag,
                ParamRole::Bias,
                device,
            )?,
        })
    }

    /// Wrap pretrained tensors.
    pub fn from_tensors(
        prefix: &str,
        weight: &Tensor,
        bias: &Tensor,
        tag: ParamTag,
    ) -> SeqRecResult<Self> {
        Ok(Self {
            weight: Param::from_tensor(format!("{}.weight", prefix), weight, tag, ParamRole::Weight)?,
            bias: Param::from_tensor(format!("{}.bias", prefix), bias, tag, ParamRole::Bias)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> SeqRecResult<Tensor> {
        linear(x, &self.weight.tensor(), Some(&self.bias.tensor()))
    }

    pub fn out_dim(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn params(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// LayerNorm with affine scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Param,
    pub bias: Param,
    pub eps: f64,
}

impl LayerNorm {
    /// New norm with unit scale and zero shift.
    pub fn new(prefix: &str, dim: usize, eps: f64, tag: ParamTag, device: &Device) -> SeqRecResult<Self> {
        Ok(Self {
            weight: Param::initialized(format!("{}.weight", prefix), &[dim], Init::Ones, tag, ParamRole::Norm, device)?,
            bias: Param::initialized(format!("{}.bias", prefix), &[dim], Init::Zeros, tag, ParamRole::Bias, device)?,
            eps,
        })
    }

    /// Wrap pretrained tensors.
    pub fn from_tensors(
        prefix: &str,
        weight: &Tensor,
        bias: &Tensor,
        eps: f64,
        tag: ParamTag,
    ) -> SeqRecResult<Self> {
        Ok(Self {
            weight: Param::from_tensor(format!("{}.weight", prefix), weight, tag, ParamRole::Norm)?,
            bias: Param::from_tensor(format!("{}.bias", prefix), bias, tag, ParamRole::Bias)?,
            eps,
        })
    }

    pub fn forward(&self, x: &Tensor) -> SeqRecResult<Tensor> {
        layer_norm(x, &self.weight.tensor(), &self.bias.tensor(), self.eps)
    }

    pub fn params(&self) -> Vec<&Param> {
        vec![&self.weight, &self.bias]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weight, &mut self.bias]
    }
}
