//! Learned virtual-token prompts.
//!
//! - [`ShallowPromptEncoder`]: embeddings fed as ordinary input (last-query segment)
//! - [`DeepPromptEncoder`]: per-layer key/value pairs spliced into the attention
//!   cache (prefix and postfix segments)

mod deep;
mod shallow;

pub use deep::{DeepPromptEncoder, PromptProjection};
pub use shallow::ShallowPromptEncoder;

use crate::backbone::BackboneAdapter;
use crate::error::{SeqRecError, SeqRecResult};

/// Initial scale of the prompt tables.
pub const PROMPT_INIT_STD: f64 = 1.0;

/// Backbone geometry a prompt must be generated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptGeometry {
    /// Kept decoder layers (one key/value pair each).
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
}

impl PromptGeometry {
    pub fn new(num_layers: usize, hidden_size: usize, num_heads: usize) -> SeqRecResult<Self> {
        if num_layers == 0 {
            return Err(SeqRecError::config("prompt geometry needs at least one layer"));
        }
        if num_heads == 0 || hidden_size % num_heads != 0 {
            return Err(SeqRecError::config(format!(
                "hidden_size {} is not divisible by {} heads",
                hidden_size, num_heads
            )));
        }
        Ok(Self {
            num_layers,
            hidden_size,
            num_heads,
        })
    }

    /// Geometry of the layers `backbone` keeps.
    pub fn of(backbone: &BackboneAdapter) -> SeqRecResult<Self> {
        Self::new(
            backbone.num_kept_layers(),
            backbone.hidden_size(),
            backbone.num_heads(),
        )
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }
}
