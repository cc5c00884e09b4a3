//! Configuration for the item encoder, optimizer and recommendation head.
//!
//! # Configuration Sources
//!
//! 1. TOML file via [`SeqRecConfig::from_file`]
//! 2. Environment overrides via [`SeqRecConfig::with_env_overrides`] (`SEQREC_*`)
//! 3. Defaults for every omitted field
//!
//! # Example TOML
//!
//! ```toml
//! [encoder]
//! tuning = "prompt"
//! pooling_method = "mean_last"
//! pre_seq_len = 20
//! post_seq_len = 10
//! last_query_len = 1
//!
//! [optim]
//! plm_lr = 1e-5
//! plm_lr_layer_decay = 0.8
//!
//! [head]
//! topk_list = [5, 10]
//! ```

use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SeqRecError, SeqRecResult};

pub use crate::prompt::PromptProjection;

// ============================================================================
// ENUMS
// ============================================================================

/// How token-level hidden states are reduced to one vector per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMethod {
    /// Masked mean over the real tokens.
    #[default]
    Mean,
    /// Last real token (fine-tuning) or last last-query position (prompt tuning).
    Last,
    /// Fusion MLP over the concatenation of `mean` and `last`.
    MeanLast,
}

impl PoolingMethod {
    pub fn all() -> &'static [PoolingMethod] {
        &[PoolingMethod::Mean, PoolingMethod::Last, PoolingMethod::MeanLast]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolingMethod::Mean => "mean",
            PoolingMethod::Last => "last",
            PoolingMethod::MeanLast => "mean_last",
        }
    }
}

impl FromStr for PoolingMethod {
    type Err = SeqRecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| SeqRecError::config(format!("unknown pooling_method '{}'", s)))
    }
}

impl fmt::Display for PoolingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of the model learns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TuningMode {
    /// Plain single-pass encoder; trailing backbone layers may be unfrozen.
    Finetune,
    /// Prefix/postfix/last-query prompts around a (usually frozen) backbone.
    #[default]
    Prompt,
    /// Frozen bottom of the backbone precomputed offline.
    PreInferred,
}

impl TuningMode {
    pub fn all() -> &'static [TuningMode] {
        &[TuningMode::Finetune, TuningMode::Prompt, TuningMode::PreInferred]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TuningMode::Finetune => "finetune",
            TuningMode::Prompt => "prompt",
            TuningMode::PreInferred => "pre_inferred",
        }
    }
}

impl FromStr for TuningMode {
    type Err = SeqRecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| SeqRecError::config(format!("unknown tuning mode '{}'", s)))
    }
}

impl PromptProjection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptProjection::Linear => "linear",
            PromptProjection::Nonlinear => "nonlinear",
        }
    }
}

impl FromStr for PromptProjection {
    type Err = SeqRecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(PromptProjection::Linear),
            "nonlinear" => Ok(PromptProjection::Nonlinear),
            other => Err(SeqRecError::config(format!("unknown prompt_projection '{}'", other))),
        }
    }
}

// ============================================================================
// ENCODER CONFIG
// ============================================================================

/// Item encoder: tuning mode, prompt segments, pooling and freezing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default)]
    pub tuning: TuningMode,

    #[serde(default)]
    pub pooling_method: PoolingMethod,

    #[serde(default)]
    pub prompt_projection: PromptProjection,

    /// Virtual tokens injected before the real tokens (0 = absent).
    #[serde(default = "default_pre_seq_len")]
    pub pre_seq_len: usize,

    /// Virtual tokens injected after the real tokens (0 = absent).
    #[serde(default = "default_post_seq_len")]
    pub post_seq_len: usize,

    /// Input-level virtual tokens of the second pass (0 = single pass).
    #[serde(default = "default_last_query_len")]
    pub last_query_len: usize,

    /// Width of the deep prompt tables before projection.
    #[serde(default = "default_prompt_hidden_size")]
    pub prompt_hidden_size: usize,

    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// `-1` all, `0` none, `n` last n decoder layers trainable.
    #[serde(default)]
    pub plm_last_n_unfreeze: i64,
}

fn default_pre_seq_len() -> usize {
    20
}

fn default_post_seq_len() -> usize {
    10
}

fn default_last_query_len() -> usize {
    1
}

fn default_prompt_hidden_size() -> usize {
    128
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            tuning: TuningMode::default(),
            pooling_method: PoolingMethod::default(),
            prompt_projection: PromptProjection::default(),
            pre_seq_len: default_pre_seq_len(),
            post_seq_len: default_post_seq_len(),
            last_query_len: default_last_query_len(),
            prompt_hidden_size: default_prompt_hidden_size(),
            layer_norm_eps: default_layer_norm_eps(),
            plm_last_n_unfreeze: 0,
        }
    }
}

impl EncoderConfig {
    /// Plain fine-tuning with no prompts.
    pub fn finetune(pooling_method: PoolingMethod, plm_last_n_unfreeze: i64) -> Self {
        Self {
            tuning: TuningMode::Finetune,
            pooling_method,
            pre_seq_len: 0,
            post_seq_len: 0,
            last_query_len: 0,
            plm_last_n_unfreeze,
            ..Self::default()
        }
    }

    /// Prompt tuning with the given segment lengths.
    pub fn prompt(
        pooling_method: PoolingMethod,
        pre_seq_len: usize,
        post_seq_len: usize,
        last_query_len: usize,
    ) -> Self {
        Self {
            tuning: TuningMode::Prompt,
            pooling_method,
            pre_seq_len,
            post_seq_len,
            last_query_len,
            ..Self::default()
        }
    }

    /// Pre-inferred encoder over the top `plm_last_n_unfreeze` layers.
    pub fn pre_inferred(pooling_method: PoolingMethod, plm_last_n_unfreeze: i64) -> Self {
        Self {
            tuning: TuningMode::PreInferred,
            ..Self::finetune(pooling_method, plm_last_n_unfreeze)
        }
    }

    /// True when any prompt segment is configured.
    pub fn has_prompts(&self) -> bool {
        self.pre_seq_len > 0 || self.post_seq_len > 0 || self.last_query_len > 0
    }

    /// Static checks; the unfreeze upper bound needs the backbone and is
    /// checked by [`EncoderConfig::validate_for_backbone`].
    pub fn validate(&self) -> SeqRecResult<()> {
        if self.layer_norm_eps <= 0.0 {
            return Err(SeqRecError::config(format!(
                "layer_norm_eps must be > 0, got {}",
                self.layer_norm_eps
            )));
        }
        if self.plm_last_n_unfreeze < -1 {
            return Err(SeqRecError::config(format!(
                "plm_last_n_unfreeze {} is not supported (minimum -1)",
                self.plm_last_n_unfreeze
            )));
        }

        match self.tuning {
            TuningMode::Prompt => {
                if self.post_seq_len > 0 && self.last_query_len == 0 {
                    return Err(SeqRecError::config(
                        "last_query_len must be at least 1 when post_seq_len > 0",
                    ));
                }
                if self.pooling_method != PoolingMethod::Mean && self.last_query_len == 0 {
                    return Err(SeqRecError::config(format!(
                        "pooling_method '{}' needs a last-query segment (last_query_len >= 1)",
                        self.pooling_method
                    )));
                }
                if (self.pre_seq_len > 0 || self.post_seq_len > 0) && self.prompt_hidden_size == 0 {
                    return Err(SeqRecError::config("prompt_hidden_size must be at least 1"));
                }
            }
            TuningMode::Finetune | TuningMode::PreInferred => {
                if self.has_prompts() {
                    return Err(SeqRecError::config(format!(
                        "tuning '{}' takes no prompts (pre_seq_len={}, post_seq_len={}, last_query_len={})",
                        self.tuning.as_str(),
                        self.pre_seq_len,
                        self.post_seq_len,
                        self.last_query_len
                    )));
                }
                if self.pooling_method == PoolingMethod::MeanLast {
                    return Err(SeqRecError::config(format!(
                        "pooling_method 'mean_last' requires prompt tuning, not '{}'",
                        self.tuning.as_str()
                    )));
                }
                if self.tuning == TuningMode::PreInferred && self.plm_last_n_unfreeze == -1 {
                    return Err(SeqRecError::config(
                        "plm_last_n_unfreeze -1 cannot be pre-inferred (backbone must be frozen below the window)",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Range checks that depend on the backbone depth.
    pub fn validate_for_backbone(&self, total_layers: usize) -> SeqRecResult<()> {
        self.validate()?;
        if self.plm_last_n_unfreeze > total_layers as i64 {
            return Err(SeqRecError::config(format!(
                "plm_last_n_unfreeze {} exceeds backbone depth {}",
                self.plm_last_n_unfreeze, total_layers
            )));
        }
        Ok(())
    }
}

// ============================================================================
// OPTIM CONFIG
// ============================================================================

/// Learning rates and AdamW settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimConfig {
    /// Base learning rate of the backbone, before layer decay.
    #[serde(default = "default_plm_lr")]
    pub plm_lr: f64,

    #[serde(default = "default_plm_lr_layer_decay")]
    pub plm_lr_layer_decay: f64,

    #[serde(default)]
    pub plm_weight_decay: f64,

    /// Learning rate of every non-backbone parameter.
    #[serde(default = "default_lr")]
    pub lr: f64,

    #[serde(default)]
    pub weight_decay: f64,

    #[serde(default = "default_beta1")]
    pub beta1: f64,

    #[serde(default = "default_beta2")]
    pub beta2: f64,

    #[serde(default = "default_adam_eps")]
    pub eps: f64,

    /// Global gradient-norm clip; disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_grad_norm: Option<f64>,
}

fn default_plm_lr() -> f64 {
    1e-5
}

fn default_plm_lr_layer_decay() -> f64 {
    0.8
}

fn default_lr() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            plm_lr: default_plm_lr(),
            plm_lr_layer_decay: default_plm_lr_layer_decay(),
            plm_weight_decay: 0.0,
            lr: default_lr(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_adam_eps(),
            max_grad_norm: None,
        }
    }
}

impl OptimConfig {
    pub fn validate(&self) -> SeqRecResult<()> {
        if self.plm_lr < 0.0 || self.lr < 0.0 {
            return Err(SeqRecError::config(format!(
                "learning rates must be >= 0 (plm_lr={}, lr={})",
                self.plm_lr, self.lr
            )));
        }
        if self.plm_lr_layer_decay <= 0.0 {
            return Err(SeqRecError::config(format!(
                "plm_lr_layer_decay must be > 0, got {}",
                self.plm_lr_layer_decay
            )));
        }
        if self.plm_weight_decay < 0.0 || self.weight_decay < 0.0 {
            return Err(SeqRecError::config("weight decay must be >= 0"));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(SeqRecError::config(format!(
                "betas must be in [0, 1), got ({}, {})",
                self.beta1, self.beta2
            )));
        }
        if self.eps <= 0.0 {
            return Err(SeqRecError::config("eps must be > 0"));
        }
        if let Some(norm) = self.max_grad_norm {
            if norm <= 0.0 {
                return Err(SeqRecError::config(format!("max_grad_norm must be > 0, got {}", norm)));
            }
        }
        Ok(())
    }
}

// ============================================================================
// HEAD CONFIG
// ============================================================================

/// Projection into the sequence encoder, sequence length and evaluation cutoffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Items per user sequence.
    #[serde(default = "default_sasrec_seq_len")]
    pub sasrec_seq_len: usize,

    #[serde(default = "default_sasrec_hidden_size")]
    pub sasrec_hidden_size: usize,

    /// Dense layers between the item encoder and the sequence encoder.
    #[serde(default = "default_projection_n_layers")]
    pub projection_n_layers: usize,

    /// Widths between projection layers (`projection_n_layers - 1` entries).
    #[serde(default = "default_projection_inner_sizes")]
    pub projection_inner_sizes: Vec<usize>,

    #[serde(default = "default_topk_list")]
    pub topk_list: Vec<usize>,
}

fn default_sasrec_seq_len() -> usize {
    20
}

fn default_sasrec_hidden_size() -> usize {
    64
}

fn default_projection_n_layers() -> usize {
    2
}

fn default_projection_inner_sizes() -> Vec<usize> {
    vec![256]
}

fn default_topk_list() -> Vec<usize> {
    vec![5, 10]
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            sasrec_seq_len: default_sasrec_seq_len(),
            sasrec_hidden_size: default_sasrec_hidden_size(),
            projection_n_layers: default_projection_n_layers(),
            projection_inner_sizes: default_projection_inner_sizes(),
            topk_list: default_topk_list(),
        }
    }
}

impl HeadConfig {
    pub fn validate(&self) -> SeqRecResult<()> {
        if self.sasrec_seq_len == 0 || self.sasrec_hidden_size == 0 {
            return Err(SeqRecError::config("sasrec_seq_len and sasrec_hidden_size must be > 0"));
        }
        if self.projection_n_layers == 0 {
            return Err(SeqRecError::config("projection_n_layers must be >= 1"));
        }
        if self.projection_inner_sizes.len() != self.projection_n_layers - 1 {
            return Err(SeqRecError::config(format!(
                "projection_inner_sizes has {} entries, expected {}",
                self.projection_inner_sizes.len(),
                self.projection_n_layers - 1
            )));
        }
        if self.projection_inner_sizes.contains(&0) {
            return Err(SeqRecError::config("projection_inner_sizes entries must be > 0"));
        }
        if self.topk_list.is_empty() || self.topk_list.contains(&0) {
            return Err(SeqRecError::config(format!(
                "topk_list must be non-empty with positive entries, got {:?}",
                self.topk_list
            )));
        }
        Ok(())
    }

    /// Largest cutoff in `topk_list`.
    pub fn max_topk(&self) -> usize {
        self.topk_list.iter().copied().max().unwrap_or(0)
    }
}

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeqRecConfig {
    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub optim: OptimConfig,

    #[serde(default)]
    pub head: HeadConfig,
}

impl SeqRecConfig {
    /// Load from a TOML file. Does not validate.
    pub fn from_file(path: impl AsRef<Path>) -> SeqRecResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| SeqRecError::ConfigurationError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        toml::from_str(&contents).map_err(|e| SeqRecError::ConfigurationError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    pub fn from_toml_str(toml: &str) -> SeqRecResult<Self> {
        toml::from_str(toml).map_err(|e| SeqRecError::ConfigurationError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    pub fn to_toml_string(&self) -> SeqRecResult<String> {
        toml::to_string_pretty(self).map_err(|e| SeqRecError::SerializationError {
            message: format!("Failed to serialize to TOML: {}", e),
        })
    }

    /// Validate every section, returning the first error with its section prefix.
    pub fn validate(&self) -> SeqRecResult<()> {
        self.encoder.validate().map_err(|e| section_error("encoder", e))?;
        self.optim.validate().map_err(|e| section_error("optim", e))?;
        self.head.validate().map_err(|e| section_error("head", e))?;
        Ok(())
    }

    /// [`SeqRecConfig::validate`] plus the checks that need the backbone depth.
    pub fn validate_for_backbone(&self, total_layers: usize) -> SeqRecResult<()> {
        self.validate()?;
        self.encoder
            .validate_for_backbone(total_layers)
            .map_err(|e| section_error("encoder", e))
    }

    /// Apply `SEQREC_*` environment overrides. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<TuningMode>("SEQREC_TUNING") {
            self.encoder.tuning = v;
        }
        if let Some(v) = env_parse::<PoolingMethod>("SEQREC_POOLING_METHOD") {
            self.encoder.pooling_method = v;
        }
        if let Some(v) = env_parse::<PromptProjection>("SEQREC_PROMPT_PROJECTION") {
            self.encoder.prompt_projection = v;
        }
        if let Some(v) = env_parse::<usize>("SEQREC_PRE_SEQ_LEN") {
            self.encoder.pre_seq_len = v;
        }
        if let Some(v) = env_parse::<usize>("SEQREC_POST_SEQ_LEN") {
            self.encoder.post_seq_len = v;
        }
        if let Some(v) = env_parse::<usize>("SEQREC_LAST_QUERY_LEN") {
            self.encoder.last_query_len = v;
        }
        if let Some(v) = env_parse::<i64>("SEQREC_PLM_LAST_N_UNFREEZE") {
            self.encoder.plm_last_n_unfreeze = v;
        }
        if let Some(v) = env_parse::<f64>("SEQREC_PLM_LR") {
            self.optim.plm_lr = v;
        }
        if let Some(v) = env_parse::<f64>("SEQREC_PLM_LR_LAYER_DECAY") {
            self.optim.plm_lr_layer_decay = v;
        }
        if let Some(v) = env_parse::<f64>("SEQREC_LR") {
            self.optim.lr = v;
        }
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn section_error(section: &str, e: SeqRecError) -> SeqRecError {
    match e {
        SeqRecError::ConfigurationError { message } => SeqRecError::ConfigurationError {
            message: format!("[{}] {}", section, message),
        },
        other => other,
    }
}

// ============================================================================
// TESTS
// ============================================================================
