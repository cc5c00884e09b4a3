//! Windowed view of the pretrained decoder.
//!
//! [`BackboneAdapter`] owns a contiguous window `[start, end)` of decoder layers,
//! optionally without the embedding sub-layer. It still reports the geometry of
//! the full backbone (`total_layers`, `hidden_size`, heads) so prompt encoders
//! and the optimizer builder can size themselves against it.
//!
//! # Freezing
//!
//! | `unfreeze_count` | Trainable |
//! |------------------|-----------|
//! | `-1` | everything |
//! | `0` | nothing |
//! | `n > 0` | last `min(n, kept)` kept layers |

pub mod cache;
pub mod opt;

use candle_core::{DType, Tensor};

use crate::error::{SeqRecError, SeqRecResult};
use crate::layers::LayerNorm;
use crate::params::{count_params, Param};

pub use cache::{KvCache, LayerKv};
pub use opt::{attention_bias, load_opt_decoder, OptConfig, OptDecoder, OptDecoderLayer, OptEmbeddings};

/// Contiguous range `[start, end)` of decoder layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerWindow {
    pub start: usize,
    pub end: usize,
}

impl LayerWindow {
    /// Checked window over a backbone with `total_layers` layers.
    pub fn new(start: usize, end: usize, total_layers: usize) -> SeqRecResult<Self> {
        if start >= end || end > total_layers {
            return Err(SeqRecError::config(format!(
                "layer window [{}, {}) is empty or outside 0..{}",
                start, end, total_layers
            )));
        }
        Ok(Self { start, end })
    }

    /// Every layer.
    pub fn full(total_layers: usize) -> SeqRecResult<Self> {
        Self::new(0, total_layers, total_layers)
    }

    /// The last `n` layers.
    pub fn top(n: usize, total_layers: usize) -> SeqRecResult<Self> {
        Self::new(total_layers.saturating_sub(n), total_layers, total_layers)
    }

    /// The first `n` layers.
    pub fn bottom(n: usize, total_layers: usize) -> SeqRecResult<Self> {
        Self::new(0, n, total_layers)
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// What enters the first kept layer.
#[derive(Debug, Clone, Copy)]
pub enum BackboneInput<'a> {
    /// `[batch, seq]` token ids; needs the embedding sub-layer.
    TokenIds(&'a Tensor),
    /// `[batch, seq, hidden]` embeddings or lower-layer hidden states.
    Embeddings(&'a Tensor),
}

/// Hidden states of the last kept layer plus the cache spanning past and new positions.
#[derive(Debug, Clone)]
pub struct BackboneOutput {
    pub hidden_states: Tensor,
    pub cache: KvCache,
}

/// Truncated view of an [`OptDecoder`].
#[derive(Debug, Clone)]
pub struct BackboneAdapter {
    config: OptConfig,
    embeddings: Option<OptEmbeddings>,
    layers: Vec<OptDecoderLayer>,
    final_layer_norm: Option<LayerNorm>,
    window: LayerWindow,
}

impl BackboneAdapter {
    /// Take ownership of the layers in `window`; the rest of the decoder is dropped.
    ///
    /// Kept layers are re-indexed from 0 so their [`crate::params::ParamTag`]s
    /// are positions inside the window.
    pub fn new(decoder: OptDecoder, keep_embedding: bool, window: LayerWindow) -> SeqRecResult<Self> {
        let total = decoder.config.num_hidden_layers;
        let window = LayerWindow::new(window.start, window.end, total)?;

        let layers: Vec<OptDecoderLayer> = decoder
            .layers
            .into_iter()
            .skip(window.start)
            .take(window.len())
            .enumerate()
            .map(|(idx, mut layer)| {
                layer.reindex(idx);
                layer
            })
            .collect();

        let final_layer_norm = if window.end == total {
            decoder.final_layer_norm
        } else {
            None
        };

        tracing::debug!(
            "Backbone window [{}, {}) of {} layers, embedding={}",
            window.start,
            window.end,
            total,
            keep_embedding
        );

        Ok(Self {
            config: decoder.config,
            embeddings: keep_embedding.then_some(decoder.embeddings),
            layers,
            final_layer_norm,
            window,
        })
    }

    /// Run the kept layers.
    ///
    /// `attention_mask` is `[batch, past_len + new_len]` and covers every
    /// position the new queries may attend, cached ones included.
    pub fn run(
        &self,
        input: BackboneInput<'_>,
        attention_mask: &Tensor,
        past: Option<&KvCache>,
    ) -> SeqRecResult<BackboneOutput> {
        let (batch, new_len) = match input {
            BackboneInput::TokenIds(ids) => ids.dims2().map_err(map_candle)?,
            BackboneInput::Embeddings(x) => {
                let (b, s, _) = x.dims3().map_err(map_candle)?;
                (b, s)
            }
        };
        if matches!(input, BackboneInput::TokenIds(_)) && self.embeddings.is_none() {
            return Err(SeqRecError::config(
                "backbone has no embedding layer: supply embeddings instead of token ids",
            ));
        }

        let past_len = match past {
            Some(cache) => {
                if cache.num_layers() != self.layers.len() {
                    return Err(SeqRecError::consistency(
                        "past cache layer count",
                        self.layers.len(),
                        cache.num_layers(),
                    ));
                }
                let cache_batch = cache.batch_size()?;
                if cache_batch != batch {
                    return Err(SeqRecError::consistency("past cache batch", batch, cache_batch));
                }
                cache.seq_len()
            }
            None => 0,
        };

        let (mask_batch, mask_len) = attention_mask.dims2().map_err(map_candle)?;
        if mask_len != past_len + new_len {
            return Err(SeqRecError::consistency(
                "backbone attention mask",
                past_len + new_len,
                mask_len,
            ));
        }
        if mask_batch != batch {
            return Err(SeqRecError::consistency("attention mask batch", batch, mask_batch));
        }

        let mut hidden = match (input, &self.embeddings) {
            (BackboneInput::TokenIds(ids), Some(emb)) => emb
                .embed_ids(ids)?
                .add(&emb.embed_positions(attention_mask, past_len, new_len)?)
                .map_err(map_candle)?,
            (BackboneInput::Embeddings(x), Some(emb)) => x
                .to_dtype(DType::F32)
                .map_err(map_candle)?
                .add(&emb.embed_positions(attention_mask, past_len, new_len)?)
                .map_err(map_candle)?,
            (BackboneInput::Embeddings(x), None) => x.to_dtype(DType::F32).map_err(map_candle)?,
            (BackboneInput::TokenIds(_), None) => {
                return Err(SeqRecError::config("backbone has no embedding layer"))
            }
        };

        let bias = attention_bias(attention_mask, past_len, new_len)?;
        let mut present = Vec::with_capacity(self.layers.len());
        for (idx, layer) in self.layers.iter().enumerate() {
            let layer_past = past.and_then(|cache| cache.layer(idx));
            let (next, kv) = layer.forward(&hidden, &bias, layer_past, idx)?;
            hidden = next;
            present.push(kv);
        }

        if let Some(norm) = &self.final_layer_norm {
            hidden = norm.forward(&hidden)?;
        }

        Ok(BackboneOutput {
            hidden_states: hidden,
            cache: KvCache::new(present)?,
        })
    }

    /// Apply the freezing policy.
    ///
    /// `unfreeze_count` ranges over `[-1, total_layers]`; see the module table.
    pub fn freeze(&mut self, unfreeze_count: i64) -> SeqRecResult<()> {
        let total = self.total_layers() as i64;
        if unfreeze_count < -1 || unfreeze_count > total {
            return Err(SeqRecError::config(format!(
                "plm_last_n_unfreeze {} is not supported (expected -1..={})",
                unfreeze_count, total
            )));
        }

        let everything = unfreeze_count == -1;
        if let Some(emb) = &mut self.embeddings {
            emb.set_trainable(everything);
        }
        if let Some(norm) = &mut self.final_layer_norm {
            for param in norm.params_mut() {
                param.set_trainable(everything);
            }
        }

        let kept = self.layers.len();
        let first_trainable = if everything {
            0
        } else {
            kept.saturating_sub(unfreeze_count as usize)
        };
        for (idx, layer) in self.layers.iter_mut().enumerate() {
            layer.set_trainable(idx >= first_trainable);
        }

        let (trainable, total_params) = count_params(&self.params());
        tracing::info!(
            "Backbone freeze policy {}: {} / {} parameters trainable ({} of {} kept layers)",
            unfreeze_count,
            trainable,
            total_params,
            kept - first_trainable,
            kept
        );
        Ok(())
    }

    /// Layer count of the full backbone, not of the window.
    pub fn total_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    pub fn num_kept_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn window(&self) -> LayerWindow {
        self.window
    }

    pub fn has_embedding_layer(&self) -> bool {
        self.embeddings.is_some()
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    pub fn num_heads(&self) -> usize {
        self.config.num_attention_heads
    }

    pub fn head_dim(&self) -> usize {
        self.config.head_dim()
    }

    pub fn config(&self) -> &OptConfig {
        &self.config
    }

    /// Every backbone parameter in the window, frozen ones included.
    pub fn params(&self) -> Vec<&Param> {
        let mut params = Vec::new();
        if let Some(emb) = &self.embeddings {
            params.extend(emb.params());
        }
        for layer in &self.layers {
            params.extend(layer.params());
        }
        if let Some(norm) = &self.final_layer_norm {
            params.extend(norm.params());
        }
        params
    }

    /// True when no backbone parameter would receive a gradient.
    pub fn is_fully_frozen(&self) -> bool {
        self.params().iter().all(|p| !p.is_trainable())
    }
}

fn map_candle(e: candle_core::Error) -> SeqRecError {
    SeqRecError::TensorError {
        message: format!("Backbone error: {}", e),
    }
}
