//! Sequential recommendation model around an item encoder.
//!
//! ```text
//! input_ids [B, L, T] ─► ItemEmbedder ─► [B*L, H_plm]
//!                         ─► ProjectionHead ─► [B, L, H_seq]
//!                         ─► SequenceEncoder(item_seq_mask) ─► [B, L, H_seq]
//!                         ─► ClassificationHead ─► [B, L, num_items]
//! ```

mod heads;

pub use heads::{ClassificationHead, ProjectionHead};

use candle_core::{DType, Device, Tensor};

use crate::config::SeqRecConfig;
use crate::encoder::ItemEmbedder;
use crate::error::{SeqRecError, SeqRecResult};
use crate::evaluation::{last_valid_positions, topk_ranks, RankingAccumulator};
use crate::ops::gather_positions;
use crate::params::{count_params, Param};
use crate::training::{AdamW, AdamWConfig, LayerwiseOptimizerBuilder};

/// Sequence model consuming item embeddings (SASRec and friends live outside the crate).
pub trait SequenceEncoder {
    /// `[batch, seq_items, hidden]` embeddings and `[batch, seq_items]` mask
    /// in, `[batch, seq_items, hidden]` out.
    fn encode(&self, item_embs: &Tensor, item_seq_mask: &Tensor) -> SeqRecResult<Tensor>;

    fn params(&self) -> Vec<&Param>;
}

/// Zeroes padded positions and otherwise passes embeddings through.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskedPassThrough;

impl SequenceEncoder for MaskedPassThrough {
    fn encode(&self, item_embs: &Tensor, item_seq_mask: &Tensor) -> SeqRecResult<Tensor> {
        item_seq_mask
            .to_dtype(item_embs.dtype())
            .and_then(|m| m.unsqueeze(2))
            .and_then(|m| item_embs.broadcast_mul(&m))
            .map_err(map_candle)
    }

    fn params(&self) -> Vec<&Param> {
        Vec::new()
    }
}

/// One batch of user sequences.
#[derive(Debug, Clone)]
pub struct SeqRecBatch {
    /// `[batch, seq_items]` next-item targets.
    pub target_seq: Tensor,
    /// `[batch, seq_items]`, 1 for real items.
    pub item_seq_mask: Tensor,
    /// `[batch, seq_items, tokens]` item token ids (or precomputed inputs).
    pub input_ids: Tensor,
    /// `[batch, seq_items, tokens]`.
    pub attention_mask: Tensor,
}

pub struct SeqRecModel<E, S> {
    encoder: E,
    projection: ProjectionHead,
    sequence_encoder: S,
    head: ClassificationHead,
    config: SeqRecConfig,
}

impl<E: ItemEmbedder, S: SequenceEncoder> SeqRecModel<E, S> {
    pub fn new(
        encoder: E,
        sequence_encoder: S,
        num_items: usize,
        config: SeqRecConfig,
        device: &Device,
    ) -> SeqRecResult<Self> {
        config.validate()?;
        let projection = ProjectionHead::new(
            encoder.output_size(),
            &config.head.projection_inner_sizes,
            config.head.sasrec_hidden_size,
            device,
        )?;
        let head = ClassificationHead::new(config.head.sasrec_hidden_size, num_items, device)?;

        let model = Self {
            encoder,
            projection,
            sequence_encoder,
            head,
            config,
        };
        let (trainable, total) = count_params(&model.all_params());
        tracing::info!(
            "SeqRec model: {} items, {} / {} parameters trainable",
            num_items,
            trainable,
            total
        );
        Ok(model)
    }

    /// Per-position item logits `[batch, seq_items, num_items]`.
    pub fn forward(&self, item_seq_mask: &Tensor, input_ids: &Tensor, attention_mask: &Tensor) -> SeqRecResult<Tensor> {
        let (batch, seq_items) = item_seq_mask.dims2().map_err(map_candle)?;
        if seq_items != self.config.head.sasrec_seq_len {
            return Err(SeqRecError::consistency(
                "item sequence length",
                self.config.head.sasrec_seq_len,
                seq_items,
            ));
        }

        let items = self.encoder.embed_items(input_ids, attention_mask)?;
        let rows = items.dim(0).map_err(map_candle)?;
        if rows != batch * seq_items {
            return Err(SeqRecError::consistency("pooled item rows", batch * seq_items, rows));
        }

        let projected = self
            .projection
            .forward(&items)?
            .reshape((batch, seq_items, self.config.head.sasrec_hidden_size))
            .map_err(map_candle)?;
        let sequence = self.sequence_encoder.encode(&projected, item_seq_mask)?;
        self.head.forward(&sequence)
    }

    /// Cross entropy over every position.
    pub fn training_loss(&self, batch: &SeqRecBatch) -> SeqRecResult<Tensor> {
        let logits = self.forward(&batch.item_seq_mask, &batch.input_ids, &batch.attention_mask)?;
        let (b, l, n) = logits.dims3().map_err(map_candle)?;
        let logits = logits.reshape((b * l, n)).map_err(map_candle)?;
        let targets = batch
            .target_seq
            .to_dtype(DType::U32)
            .and_then(|t| t.reshape(b * l))
            .map_err(map_candle)?;
        candle_nn::loss::cross_entropy(&logits, &targets).map_err(map_candle)
    }

    /// Loss, backward and one optimizer update. Returns the loss value.
    pub fn train_step(&self, batch: &SeqRecBatch, optimizer: &mut AdamW) -> SeqRecResult<f32> {
        let loss = self.training_loss(batch)?;
        optimizer.step(&loss)?;
        loss.to_scalar::<f32>().map_err(map_candle)
    }

    /// Rank each sequence's last target and hand the ranks to `accumulator`.
    pub fn evaluate(&self, batch: &SeqRecBatch, accumulator: &mut dyn RankingAccumulator) -> SeqRecResult<()> {
        let logits = self.forward(&batch.item_seq_mask, &batch.input_ids, &batch.attention_mask)?;
        let last = last_valid_positions(&batch.item_seq_mask)?;

        let last_logits = gather_positions(&logits, &last)?.detach();
        let scores = candle_nn::ops::softmax(&last_logits, 1).map_err(map_candle)?;

        let targets: Vec<Vec<u32>> = batch
            .target_seq
            .to_dtype(DType::U32)
            .and_then(|t| t.to_vec2())
            .map_err(map_candle)?;
        let last_targets: Vec<usize> = targets
            .iter()
            .zip(&last)
            .map(|(row, &pos)| row[pos] as usize)
            .collect();

        let ranks = topk_ranks(&scores, &last_targets, self.config.head.max_topk())?;
        accumulator.update(&ranks, last_targets.len());
        Ok(())
    }

    /// Layer-wise groups for the backbone, one flat group for everything else.
    pub fn configure_optimizer(&self) -> SeqRecResult<AdamW> {
        let builder = LayerwiseOptimizerBuilder::from_config(&self.config.optim)?;
        let (num_layers, backbone) = match self.encoder.backbone() {
            Some(backbone) => (backbone.num_kept_layers(), backbone.params()),
            None => (0, Vec::new()),
        };
        let groups = builder.build(num_layers, &backbone, &self.non_backbone_params())?;
        AdamW::new(groups, AdamWConfig::from(&self.config.optim))
    }

    /// Every learned parameter outside the backbone.
    pub fn non_backbone_params(&self) -> Vec<&Param> {
        let mut params = self.encoder.extra_params();
        params.extend(self.projection.params());
        params.extend(self.sequence_encoder.params());
        params.extend(self.head.params());
        params
    }

    pub fn all_params(&self) -> Vec<&Param> {
        let mut params = self
            .encoder
            .backbone()
            .map(|b| b.params())
            .unwrap_or_default();
        params.extend(self.non_backbone_params());
        params
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn config(&self) -> &SeqRecConfig {
        &self.config
    }
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Model error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::{OptConfig, OptDecoder};
    use crate::config::{EncoderConfig, PoolingMethod};
    use crate::encoder::ItemEncoder;

    #[derive(Default)]
    struct Recorder {
        ranks: Vec<Option<usize>>,
        count: usize,
    }

    impl RankingAccumulator for Recorder {
        fn update(&mut self, ranks: &[Option<usize>], count: usize) {
            self.ranks.extend_from_slice(ranks);
            self.count += count;
        }
    }

    fn config(encoder: EncoderConfig) -> SeqRecConfig {
        let mut config = SeqRecConfig::default();
        config.encoder = encoder;
        config.head.sasrec_seq_len = 3;
        config.head.sasrec_hidden_size = 6;
        config.head.projection_inner_sizes = vec![10];
        config.head.topk_list = vec![1, 5];
        config.optim.lr = 1e-2;
        config
    }

    fn model(encoder: EncoderConfig) -> SeqRecModel<ItemEncoder, MaskedPassThrough> {
        let device = Device::Cpu;
        let config = config(encoder);
        let decoder = OptDecoder::synthetic(OptConfig::tiny(2, 8, 2), &device).unwrap();
        let item_encoder = ItemEncoder::new(decoder, &config.encoder).unwrap();
        SeqRecModel::new(item_encoder, MaskedPassThrough, 12, config, &device).unwrap()
    }

    fn batch() -> SeqRecBatch {
        let device = Device::Cpu;
        let ids: Vec<u32> = (0..2 * 3 * 4).map(|i| (i % 20 + 3) as u32).collect();
        SeqRecBatch {
            target_seq: Tensor::new(&[[1u32, 2, 3], [4, 5, 0]], &device).unwrap(),
            item_seq_mask: Tensor::new(&[[1u32, 1, 1], [1, 1, 0]], &device).unwrap(),
            input_ids: Tensor::from_vec(ids, (2, 3, 4), &device).unwrap(),
            attention_mask: Tensor::ones((2, 3, 4), DType::U32, &device).unwrap(),
        }
    }

    #[test]
    fn test_forward_shape() {
        let model = model(EncoderConfig::prompt(PoolingMethod::Mean, 2, 0, 0));
        let b = batch();
        let logits = model.forward(&b.item_seq_mask, &b.input_ids, &b.attention_mask).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 12]);
    }

    #[test]
    fn test_wrong_sequence_length_rejected() {
        let model = model(EncoderConfig::prompt(PoolingMethod::Mean, 2, 0, 0));
        let b = batch();
        let mask = Tensor::ones((2, 4), DType::U32, &Device::Cpu).unwrap();
        let err = model.forward(&mask, &b.input_ids, &b.attention_mask).unwrap_err();
        assert!(err.is_consistency());
    }

    #[test]
    fn test_evaluate_reports_every_sequence() {
        let model = model(EncoderConfig::finetune(PoolingMethod::Last, 0));
        let mut recorder = Recorder::default();
        model.evaluate(&batch(), &mut recorder).unwrap();
        assert_eq!(recorder.count, 2);
        assert_eq!(recorder.ranks.len(), 2);
        assert!(recorder.ranks.iter().flatten().all(|&r| (1..=5).contains(&r)));
    }

    #[test]
    fn test_prompt_training_leaves_backbone_unchanged() {
        let model = model(EncoderConfig::prompt(PoolingMethod::Last, 2, 1, 1));
        let mut optimizer = model.configure_optimizer().unwrap();
        // backbone fully frozen: only the_rest
        assert_eq!(optimizer.groups().len(), 1);
        assert_eq!(optimizer.groups()[0].name, "the_rest");

        let backbone_before: Vec<f32> = model.encoder().backbone().unwrap().params()[0]
            .tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let first = model.train_step(&batch(), &mut optimizer).unwrap();
        assert!(first.is_finite());

        let backbone_after: Vec<f32> = model.encoder().backbone().unwrap().params()[0]
            .tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(backbone_before, backbone_after);
    }

    #[test]
    fn test_loss_decreases_on_repeated_batch() {
        let model = model(EncoderConfig::finetune(PoolingMethod::Mean, 1));
        let mut optimizer = model.configure_optimizer().unwrap();
        let b = batch();
        let first = model.train_step(&b, &mut optimizer).unwrap();
        let mut last = first;
        for _ in 0..20 {
            last = model.train_step(&b, &mut optimizer).unwrap();
        }
        assert!(last < first, "loss {} -> {}", first, last);
    }
}
