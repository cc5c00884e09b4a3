//! Tensor operations shared by the backbone, prompt encoders and heads.
//!
//! - `linear`: `x @ W^T + b` over the last dimension of a rank-2 or rank-3 input
//! - `layer_norm`: mean/variance normalization with affine scale and shift
//! - `mean_pooling`: mask-weighted mean over the sequence axis
//! - `last_token_pooling`: hidden state at `sum(mask) - 1` per row (right padding)

use candle_core::{DType, Tensor, D};

use crate::error::{SeqRecError, SeqRecResult};

/// Linear projection: `x @ W^T + b`.
///
/// `weight` is `[out, in]`. Rank-3 inputs are flattened to `[batch*seq, in]` for
/// the matmul and reshaped back.
pub fn linear(x: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> SeqRecResult<Tensor> {
    let out_dim = weight.dim(0).map_err(map_candle)?;
    let w_t = weight.t().map_err(map_candle)?;

    let projected = match x.rank() {
        2 => x.matmul(&w_t).map_err(map_candle)?,
        3 => {
            let (batch, seq, in_dim) = x.dims3().map_err(map_candle)?;
            x.reshape((batch * seq, in_dim))
                .map_err(map_candle)?
                .matmul(&w_t)
                .map_err(map_candle)?
                .reshape((batch, seq, out_dim))
                .map_err(map_candle)?
        }
        rank => {
            return Err(SeqRecError::TensorError {
                message: format!("linear expects rank 2 or 3 input, got rank {}", rank),
            })
        }
    };

    match bias {
        Some(b) => projected.broadcast_add(b).map_err(map_candle),
        None => Ok(projected),
    }
}

/// LayerNorm over the last dimension.
pub fn layer_norm(x: &Tensor, weight: &Tensor, bias: &Tensor, eps: f64) -> SeqRecResult<Tensor> {
    let mean = x.mean_keepdim(D::Minus1).map_err(map_candle)?;
    let centered = x.broadcast_sub(&mean).map_err(map_candle)?;
    let variance = centered
        .sqr()
        .map_err(map_candle)?
        .mean_keepdim(D::Minus1)
        .map_err(map_candle)?;
    let denom = (variance + eps)
        .map_err(map_candle)?
        .sqrt()
        .map_err(map_candle)?;

    centered
        .broadcast_div(&denom)
        .map_err(map_candle)?
        .broadcast_mul(weight)
        .map_err(map_candle)?
        .broadcast_add(bias)
        .map_err(map_candle)
}

/// Mask-weighted mean over the sequence axis.
///
/// * `hidden_states` - `[batch, seq, hidden]`
/// * `attention_mask` - `[batch, seq]`, 1 for real tokens
///
/// Returns `[batch, hidden]`.
pub fn mean_pooling(hidden_states: &Tensor, attention_mask: &Tensor) -> SeqRecResult<Tensor> {
    let mask = attention_mask
        .to_dtype(hidden_states.dtype())
        .map_err(map_candle)?
        .unsqueeze(2)
        .map_err(map_candle)?;

    let summed = hidden_states
        .broadcast_mul(&mask)
        .map_err(map_candle)?
        .sum(1)
        .map_err(map_candle)?;

    // clamp(min=1e-9) on the token count
    let counts = mask
        .sum(1)
        .map_err(map_candle)?
        .maximum(1e-9)
        .map_err(map_candle)?;

    summed.broadcast_div(&counts).map_err(map_candle)
}

/// Hidden state of the last real token of every row.
///
/// Rows are assumed right-padded, so the last real token sits at
/// `sum(mask) - 1`. A row with an empty mask selects position 0.
pub fn last_token_pooling(hidden_states: &Tensor, attention_mask: &Tensor) -> SeqRecResult<Tensor> {
    let lengths: Vec<f32> = attention_mask
        .to_dtype(DType::F32)
        .map_err(map_candle)?
        .sum(1)
        .map_err(map_candle)?
        .to_vec1()
        .map_err(map_candle)?;
    let positions: Vec<usize> = lengths
        .iter()
        .map(|&len| (len.round() as usize).saturating_sub(1))
        .collect();
    gather_positions(hidden_states, &positions)
}

/// Select one sequence position per row: `[batch, seq, hidden]` -> `[batch, hidden]`.
pub fn gather_positions(hidden_states: &Tensor, positions: &[usize]) -> SeqRecResult<Tensor> {
    let (batch, seq, hidden) = hidden_states.dims3().map_err(map_candle)?;
    if positions.len() != batch {
        return Err(SeqRecError::consistency(
            "gather_positions rows",
            batch,
            positions.len(),
        ));
    }
    if let Some(&bad) = positions.iter().find(|&&p| p >= seq) {
        return Err(SeqRecError::TensorError {
            message: format!("position {} out of range for sequence length {}", bad, seq),
        });
    }

    let flat_index: Vec<u32> = positions
        .iter()
        .enumerate()
        .map(|(row, &pos)| (row * seq + pos) as u32)
        .collect();
    let index = Tensor::from_vec(flat_index, batch, hidden_states.device()).map_err(map_candle)?;

    hidden_states
        .reshape((batch * seq, hidden))
        .map_err(map_candle)?
        .index_select(&index, 0)
        .map_err(map_candle)
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Op error: {}", e),
    }
}
