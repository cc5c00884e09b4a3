//! Pretrained causal-LM item encoder for sequential recommendation.
//!
//! Items are described by text. Each item's tokens run through an OPT-style
//! decoder, optionally conditioned on learned prompts, and are pooled into a
//! single vector. Those vectors feed a sequence model and a classification
//! head over the item catalogue.
//!
//! # Architecture
//!
//! - **BackboneAdapter**: window of decoder layers with freezing and KV-cache plumbing
//! - **ShallowPromptEncoder / DeepPromptEncoder**: learned prompt embeddings and per-layer key/values
//! - **ItemEncoder**: two-pass prompt-conditioned forward and pooling
//! - **PreInferredEncoder**: frozen bottom layers computed once, top layers online
//! - **LayerwiseOptimizerBuilder**: per-layer learning-rate decay groups for AdamW
//! - **SeqRecModel**: projection, sequence encoder and classification head
//!
//! # Example
//!
//! ```rust
//! use candle_core::Device;
//! use plm_seqrec::{EncoderConfig, ItemEncoder, ItemEmbedder, OptConfig, OptDecoder, PoolingMethod};
//!
//! let decoder = OptDecoder::synthetic(OptConfig::tiny(2, 8, 2), &Device::Cpu).unwrap();
//! let config = EncoderConfig::prompt(PoolingMethod::Last, 4, 2, 1);
//! let encoder = ItemEncoder::new(decoder, &config).unwrap();
//! assert_eq!(encoder.output_size(), 8);
//! ```

pub mod backbone;
pub mod config;
pub mod encoder;
pub mod error;
pub mod evaluation;
pub mod layers;
pub mod model;
pub mod ops;
pub mod params;
pub mod prompt;
pub mod training;

pub use backbone::{
    load_opt_decoder, BackboneAdapter, BackboneInput, BackboneOutput, KvCache, LayerKv, LayerWindow,
    OptConfig, OptDecoder,
};
pub use config::{EncoderConfig, HeadConfig, OptimConfig, PoolingMethod, SeqRecConfig, TuningMode};
pub use encoder::{
    HiddenStatePrecomputer, ItemEmbedder, ItemEncoder, PoolingStrategy, PreInferredEncoder,
    SegmentAssembler,
};
pub use error::{SeqRecError, SeqRecResult};
pub use evaluation::RankingAccumulator;
pub use model::{MaskedPassThrough, SeqRecBatch, SeqRecModel, SequenceEncoder};
pub use params::{Param, ParamRole, ParamTag};
pub use prompt::{DeepPromptEncoder, PromptGeometry, PromptProjection, ShallowPromptEncoder};
pub use training::{AdamW, AdamWConfig, LayerwiseOptimizerBuilder, ParamGroup, REST_GROUP};
