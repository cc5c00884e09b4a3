//! Input-level prompt: a learned `(length, hidden)` table broadcast over the batch.

use candle_core::{Device, Tensor};

use crate::error::{SeqRecError, SeqRecResult};
use crate::params::{Init, Param, ParamRole, ParamTag};

use super::PROMPT_INIT_STD;

#[derive(Debug, Clone)]
pub struct ShallowPromptEncoder {
    embedding: Param,
    length: usize,
    hidden_size: usize,
}

impl ShallowPromptEncoder {
    pub fn new(name: &str, length: usize, hidden_size: usize, device: &Device) -> SeqRecResult<Self> {
        if length == 0 || hidden_size == 0 {
            return Err(SeqRecError::config(format!(
                "{}: prompt length and hidden size must be positive (got {} x {})",
                name, length, hidden_size
            )));
        }
        let embedding = Param::initialized(
            format!("{}.embedding.weight", name),
            &[length, hidden_size],
            Init::Uniform { std: PROMPT_INIT_STD },
            ParamTag::Other,
            ParamRole::Weight,
            device,
        )?;
        Ok(Self {
            embedding,
            length,
            hidden_size,
        })
    }

    /// `[batch, length, hidden]`, identical rows.
    pub fn generate(&self, batch_size: usize) -> SeqRecResult<Tensor> {
        self.embedding
            .tensor()
            .unsqueeze(0)
            .and_then(|t| t.broadcast_as((batch_size, self.length, self.hidden_size)))
            .and_then(|t| t.contiguous())
            .map_err(|e| SeqRecError::TensorError {
                message: format!("Shallow prompt error: {}", e),
            })
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn params(&self) -> Vec<&Param> {
        vec![&self.embedding]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_broadcasts_table() {
        let prompt = ShallowPromptEncoder::new("last_query_encoder", 2, 4, &Device::Cpu).unwrap();
        let out = prompt.generate(3).unwrap();
        assert_eq!(out.dims(), &[3, 2, 4]);

        let rows: Vec<Vec<Vec<f32>>> = out.to_vec3().unwrap();
        assert_eq!(rows[0], rows[2]);
    }

    #[test]
    fn test_generate_is_repeatable() {
        let prompt = ShallowPromptEncoder::new("q", 1, 8, &Device::Cpu).unwrap();
        let a: Vec<f32> = prompt.generate(2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = prompt.generate(2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_length_rejected() {
        assert!(ShallowPromptEncoder::new("q", 0, 8, &Device::Cpu).unwrap_err().is_configuration());
    }
}
