//! Optimizer construction and AdamW.

pub mod layerwise;
pub mod optimizer;

pub use layerwise::{LayerwiseOptimizerBuilder, ParamGroup, REST_GROUP};
pub use optimizer::{AdamW, AdamWConfig, GroupSettings};
