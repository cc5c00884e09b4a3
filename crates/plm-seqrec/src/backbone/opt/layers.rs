//! OPT decoder layer.
//!
//! Layer structure (`do_layer_norm_before = true`):
//! 1. LayerNorm (self_attn_layer_norm)
//! 2. Multi-head self-attention over `[past ; new]` keys/values
//! 3. Residual connection
//! 4. LayerNorm (final_layer_norm)
//! 5. fc1 -> activation -> fc2
//! 6. Residual connection
//!
//! With `do_layer_norm_before = false` the norms move after each residual.

use candle_core::{Device, Tensor, D};

use crate::backbone::cache::LayerKv;
use crate::error::{SeqRecError, SeqRecResult};
use crate::layers::{Dense, LayerNorm};
use crate::params::{Param, ParamTag};

use super::OptActivation;

/// Weights and geometry of one decoder layer.
#[derive(Debug, Clone)]
pub struct OptDecoderLayer {
    pub q_proj: Dense,
    pub k_proj: Dense,
    pub v_proj: Dense,
    pub out_proj: Dense,
    pub self_attn_layer_norm: LayerNorm,
    pub fc1: Dense,
    pub fc2: Dense,
    pub final_layer_norm: LayerNorm,
    pub num_heads: usize,
    pub head_dim: usize,
    pub pre_norm: bool,
    pub activation: OptActivation,
}

impl OptDecoderLayer {
    /// Layer with deterministic synthetic weights.
    #[allow(clippy::too_many_arguments)]
    pub fn synthetic(
        idx: usize,
        hidden_size: usize,
        ffn_dim: usize,
        num_heads: usize,
        eps: f64,
        pre_norm: bool,
        activation: OptActivation,
        device: &Device,
    ) -> SeqRecResult<Self> {
        let prefix = format!("decoder.layers.{}", idx);
        let tag = ParamTag::Layer(idx);
        let dense = |name: &str, i: usize, o: usize| {
            Dense::new(&format!("{}.{}", prefix, name), i, o, tag, device)
        };
        Ok(Self {
            q_proj: dense("self_attn.q_proj", hidden_size, hidden_size)?,
            k_proj: dense("self_attn.k_proj", hidden_size, hidden_size)?,
            v_proj: dense("self_attn.v_proj", hidden_size, hidden_size)?,
            out_proj: dense("self_attn.out_proj", hidden_size, hidden_size)?,
            self_attn_layer_norm: LayerNorm::new(
                &format!("{}.self_attn_layer_norm", prefix),
                hidden_size,
                eps,
                tag,
                device,
            )?,
            fc1: dense("fc1", hidden_size, ffn_dim)?,
            fc2: dense("fc2", ffn_dim, hidden_size)?,
            final_layer_norm: LayerNorm::new(
                &format!("{}.final_layer_norm", prefix),
                hidden_size,
                eps,
                tag,
                device,
            )?,
            num_heads,
            head_dim: hidden_size / num_heads,
            pre_norm,
            activation,
        })
    }

    /// Parameters with their name suffix inside the layer.
    fn named_params_mut(&mut self) -> Vec<(&'static str, &mut Param)> {
        vec![
            ("self_attn.q_proj.weight", &mut self.q_proj.weight),
            ("self_attn.q_proj.bias", &mut self.q_proj.bias),
            ("self_attn.k_proj.weight", &mut self.k_proj.weight),
            ("self_attn.k_proj.bias", &mut self.k_proj.bias),
            ("self_attn.v_proj.weight", &mut self.v_proj.weight),
            ("self_attn.v_proj.bias", &mut self.v_proj.bias),
            ("self_attn.out_proj.weight", &mut self.out_proj.weight),
            ("self_attn.out_proj.bias", &mut self.out_proj.bias),
            ("self_attn_layer_norm.weight", &mut self.self_attn_layer_norm.weight),
            ("self_attn_layer_norm.bias", &mut self.self_attn_layer_norm.bias),
            ("fc1.weight", &mut self.fc1.weight),
            ("fc1.bias", &mut self.fc1.bias),
            ("fc2.weight", &mut self.fc2.weight),
            ("fc2.bias", &mut self.fc2.bias),
            ("final_layer_norm.weight", &mut self.final_layer_norm.weight),
            ("final_layer_norm.bias", &mut self.final_layer_norm.bias),
        ]
    }

    /// Re-index the layer inside a kept window: renames and re-tags every param.
    pub fn reindex(&mut self, idx: usize) {
        for (suffix, param) in self.named_params_mut() {
            param.set_name(format!("decoder.layers.{}.{}", idx, suffix));
            param.set_tag(ParamTag::Layer(idx));
        }
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        for (_, param) in self.named_params_mut() {
            param.set_trainable(trainable);
        }
    }

    pub fn params(&self) -> Vec<&Param> {
        let mut params = Vec::with_capacity(16);
        params.extend(self.q_proj.params());
        params.extend(self.k_proj.params());
        params.extend(self.v_proj.params());
        params.extend(self.out_proj.params());
        params.extend(self.self_attn_layer_norm.params());
        params.extend(self.fc1.params());
        params.extend(self.fc2.params());
        params.extend(self.final_layer_norm.params());
        params
    }

    /// Run the layer over `hidden_states` (`[batch, q_len, hidden]`).
    ///
    /// `attention_bias` is `[batch, 1, q_len, past_len + q_len]`. Returns the new
    /// hidden states and this layer's key/value spanning past and new positions.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        past: Option<&LayerKv>,
        layer_idx: usize,
    ) -> SeqRecResult<(Tensor, LayerKv)> {
        let residual = hidden_states;
        let normed = if self.pre_norm {
            self.self_attn_layer_norm.forward(hidden_states)?
        } else {
            hidden_states.clone()
        };

        let (attn_out, present) = self.self_attention(&normed, attention_bias, past, layer_idx)?;
        let mut hidden = residual
            .add(&attn_out)
            .map_err(|e| layer_err(layer_idx, "attention residual", e))?;
        if !self.pre_norm {
            hidden = self.self_attn_layer_norm.forward(&hidden)?;
        }

        let residual = hidden.clone();
        let normed = if self.pre_norm {
            self.final_layer_norm.forward(&hidden)?
        } else {
            hidden
        };
        let ffn = self.fc1.forward(&normed)?;
        let ffn = self.activation.apply(&ffn).map_err(|e| layer_err(layer_idx, "activation", e))?;
        let ffn = self.fc2.forward(&ffn)?;
        let mut hidden = residual
            .add(&ffn)
            .map_err(|e| layer_err(layer_idx, "ffn residual", e))?;
        if !self.pre_norm {
            hidden = self.final_layer_norm.forward(&hidden)?;
        }

        Ok((hidden, present))
    }

    fn self_attention(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        past: Option<&LayerKv>,
        layer_idx: usize,
    ) -> SeqRecResult<(Tensor, LayerKv)> {
        let (batch, q_len, hidden_size) = hidden_states
            .dims3()
            .map_err(|e| layer_err(layer_idx, "get dims", e))?;
        let scaling = (self.head_dim as f64).powf(-0.5);

        let query = self
            .q_proj
            .forward(hidden_states)?
            .affine(scaling, 0.0)
            .map_err(|e| layer_err(layer_idx, "Q scale", e))?;
        let query = self.split_heads(&query, batch, q_len, layer_idx, "Q")?;
        let key = self.split_heads(&self.k_proj.forward(hidden_states)?, batch, q_len, layer_idx, "K")?;
        let value = self.split_heads(&self.v_proj.forward(hidden_states)?, batch, q_len, layer_idx, "V")?;

        let (key, value) = match past {
            Some(past) => (
                Tensor::cat(&[&past.key, &key], 2).map_err(|e| layer_err(layer_idx, "K cache concat", e))?,
                Tensor::cat(&[&past.value, &value], 2).map_err(|e| layer_err(layer_idx, "V cache concat", e))?,
            ),
            None => (key, value),
        };

        let kv_len = key.dim(2).map_err(|e| layer_err(layer_idx, "K dims", e))?;
        let bias_len = attention_bias.dim(D::Minus1).map_err(|e| layer_err(layer_idx, "bias dims", e))?;
        if kv_len != bias_len {
            return Err(SeqRecError::consistency(
                format!("decoder layer {} key length vs attention mask", layer_idx),
                bias_len,
                kv_len,
            ));
        }

        let key_t = key
            .t()
            .and_then(|k| k.contiguous())
            .map_err(|e| layer_err(layer_idx, "K transpose", e))?;
        let scores = query
            .matmul(&key_t)
            .map_err(|e| layer_err(layer_idx, "QK matmul", e))?
            .broadcast_add(attention_bias)
            .map_err(|e| layer_err(layer_idx, "mask add", e))?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)
            .map_err(|e| layer_err(layer_idx, "softmax", e))?;

        let context = probs
            .matmul(&value)
            .map_err(|e| layer_err(layer_idx, "PV matmul", e))?
            .transpose(1, 2)
            .map_err(|e| layer_err(layer_idx, "context transpose", e))?
            .contiguous()
            .map_err(|e| layer_err(layer_idx, "context contiguous", e))?
            .reshape((batch, q_len, hidden_size))
            .map_err(|e| layer_err(layer_idx, "context reshape", e))?;

        let output = self.out_proj.forward(&context)?;
        Ok((output, LayerKv { key, value }))
    }

    /// `[batch, seq, hidden]` -> `[batch, heads, seq, head_dim]`.
    fn split_heads(
        &self,
        x: &Tensor,
        batch: usize,
        seq_len: usize,
        layer_idx: usize,
        name: &str,
    ) -> SeqRecResult<Tensor> {
        x.reshape((batch, seq_len, self.num_heads, self.head_dim))
            .and_then(|t| t.transpose(1, 2))
            .and_then(|t| t.contiguous())
            .map_err(|e| layer_err(layer_idx, &format!("{} split heads", name), e))
    }
}

fn layer_err(layer_idx: usize, what: &str, e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("OPT layer {} {} failed: {}", layer_idx, what, e),
    }
}
