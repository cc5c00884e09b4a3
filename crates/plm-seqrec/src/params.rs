//! Learned parameters with structural metadata.
//!
//! Every learned tensor in the crate is a [`Param`]: a candle [`Var`] plus the
//! metadata the optimizer builder needs. The metadata is attached when the
//! parameter is constructed so learning-rate and weight-decay assignment never
//! depends on naming conventions.
//!
//! ```text
//! Param
//!  ├── name       "decoder.layers.3.self_attn.q_proj.weight"
//!  ├── tag        Embedding | Layer(i) | Other      (i = index in the kept window)
//!  ├── role       Weight | Bias | Norm              (Bias/Norm never decay)
//!  └── trainable  frozen params are read detached from the autograd graph
//! ```

use candle_core::{DType, Device, Tensor, Var};

use crate::error::{SeqRecError, SeqRecResult};

/// Structural position of a parameter inside the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamTag {
    /// Token or positional embedding table.
    Embedding,
    /// Decoder layer, indexed from the start of the kept window.
    Layer(usize),
    /// Anything else (final norm, heads, prompt tables).
    Other,
}

/// What the parameter is used for; decides weight-decay eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamRole {
    /// Projection matrix or embedding table.
    Weight,
    /// Additive bias.
    Bias,
    /// Normalization scale.
    Norm,
}

/// Initial value for a freshly constructed parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Deterministic pseudo-random values in `[-std, std]`.
    Uniform { std: f64 },
    /// All zeros (biases).
    Zeros,
    /// All ones (normalization scales).
    Ones,
}

/// A trainable tensor with its metadata.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    var: Var,
    tag: ParamTag,
    role: ParamRole,
    trainable: bool,
}

impl Param {
    /// Wrap an existing tensor (e.g. a pretrained weight) as a parameter.
    pub fn from_tensor(
        name: impl Into<String>,
        tensor: &Tensor,
        tag: ParamTag,
        role: ParamRole,
    ) -> SeqRecResult<Self> {
        let var = Var::from_tensor(&tensor.to_dtype(DType::F32).map_err(map_candle)?)
            .map_err(map_candle)?;
        Ok(Self {
            name: name.into(),
            var,
            tag,
            role,
            trainable: true,
        })
    }

    /// Create a parameter with the given initial value.
    pub fn initialized(
        name: impl Into<String>,
        shape: &[usize],
        init: Init,
        tag: ParamTag,
        role: ParamRole,
        device: &Device,
    ) -> SeqRecResult<Self> {
        let name = name.into();
        let tensor = match init {
            Init::Uniform { std } => deterministic_uniform(&name, shape, std, device)?,
            Init::Zeros => Tensor::zeros(shape, DType::F32, device).map_err(map_candle)?,
            Init::Ones => Tensor::ones(shape, DType::F32, device).map_err(map_candle)?,
        };
        Self::from_tensor(name, &tensor, tag, role)
    }

    /// Tensor to use in a forward pass.
    ///
    /// Frozen parameters are detached so no gradient is recorded for them.
    pub fn tensor(&self) -> Tensor {
        if self.trainable {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        }
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> ParamTag {
        self.tag
    }

    pub fn role(&self) -> ParamRole {
        self.role
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Re-tag a parameter, used when a layer is re-indexed inside a window.
    pub fn set_tag(&mut self, tag: ParamTag) {
        self.tag = tag;
    }

    /// Rename a parameter, used when a layer is re-indexed inside a window.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Whether weight decay applies (biases and norm scales are exempt).
    pub fn decays(&self) -> bool {
        self.role == ParamRole::Weight
    }

    pub fn num_elements(&self) -> usize {
        self.var.as_tensor().elem_count()
    }

    pub fn dims(&self) -> &[usize] {
        self.var.as_tensor().dims()
    }
}

/// Count trainable and total elements over a parameter list.
pub fn count_params(params: &[&Param]) -> (usize, usize) {
    params.iter().fold((0, 0), |(trainable, total), p| {
        let n = p.num_elements();
        (trainable + if p.is_trainable() { n } else { 0 }, total + n)
    })
}

/// Deterministic pseudo-random tensor in `[-std, std]`.
///
/// The phase is derived from the parameter name so that two parameters of the
/// same shape do not start identical.
fn deterministic_uniform(
    name: &str,
    shape: &[usize],
    std: f64,
    device: &Device,
) -> SeqRecResult<Tensor> {
    let count: usize = shape.iter().product();
    let phase = name_phase(name);
    let data: Vec<f32> = (0..count)
        .map(|i| {
            let x = ((i as f64 * 0.618_033_988_749 + phase) % 1.0) * 2.0 - 1.0;
            (x * std) as f32
        })
        .collect();
    Tensor::from_vec(data, shape, device).map_err(map_candle)
}

/// FNV-1a hash of the name mapped into `[0, 1)`.
fn name_phase(name: &str) -> f64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % 1_000_003) as f64 / 1_000_003.0
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Param error: {}", e),
    }
}
