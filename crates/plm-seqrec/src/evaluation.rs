//! Ranking glue between model outputs and an external metric accumulator.

use candle_core::{DType, Tensor};

use crate::error::{SeqRecError, SeqRecResult};

/// Consumer of per-sequence target ranks (HR@k, NDCG@k, ... live outside the crate).
pub trait RankingAccumulator {
    /// `ranks[i]` is the 1-based rank of sequence `i`'s target, `None` when it
    /// falls outside the evaluated cutoff. `count` is the number of sequences.
    fn update(&mut self, ranks: &[Option<usize>], count: usize);
}

/// Index of the last valid item per sequence: `sum(mask) - 1`.
///
/// Empty rows map to position 0.
pub fn last_valid_positions(item_seq_mask: &Tensor) -> SeqRecResult<Vec<usize>> {
    let lengths: Vec<f32> = item_seq_mask
        .to_dtype(DType::F32)
        .and_then(|m| m.sum(1))
        .and_then(|s| s.to_vec1())
        .map_err(map_candle)?;
    Ok(lengths
        .iter()
        .map(|&len| (len.round() as usize).saturating_sub(1))
        .collect())
}

/// Rank of each target among its row's scores, kept only within `topk`.
///
/// Rank is `1 + #(scores strictly greater than the target's)`.
pub fn topk_ranks(scores: &Tensor, targets: &[usize], topk: usize) -> SeqRecResult<Vec<Option<usize>>> {
    let rows: Vec<Vec<f32>> = scores
        .to_dtype(DType::F32)
        .and_then(|s| s.to_vec2())
        .map_err(map_candle)?;
    if rows.len() != targets.len() {
        return Err(SeqRecError::consistency("ranking targets", rows.len(), targets.len()));
    }

    rows.iter()
        .zip(targets)
        .map(|(row, &target)| {
            let target_score = *row.get(target).ok_or_else(|| SeqRecError::TensorError {
                message: format!("target item {} out of range for {} scores", target, row.len()),
            })?;
            let rank = 1 + row.iter().filter(|&&s| s > target_score).count();
            Ok((rank <= topk).then_some(rank))
        })
        .collect()
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Evaluation error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_last_valid_positions() {
        let mask = Tensor::new(&[[1u32, 1, 1, 0], [1, 0, 0, 0], [0, 0, 0, 0]], &Device::Cpu).unwrap();
        assert_eq!(last_valid_positions(&mask).unwrap(), vec![2, 0, 0]);
    }

    #[test]
    fn test_topk_ranks() {
        let scores = Tensor::new(&[[0.1f32, 0.5, 0.4], [0.7, 0.2, 0.1]], &Device::Cpu).unwrap();
        assert_eq!(topk_ranks(&scores, &[2, 0], 2).unwrap(), vec![Some(2), Some(1)]);
        assert_eq!(topk_ranks(&scores, &[0, 2], 2).unwrap(), vec![None, None]);
    }

    #[test]
    fn test_target_out_of_range() {
        let scores = Tensor::new(&[[0.1f32, 0.5]], &Device::Cpu).unwrap();
        assert!(topk_ranks(&scores, &[5], 1).is_err());
    }
}
