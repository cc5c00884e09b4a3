//! Load an OPT decoder from a HuggingFace model directory.
//!
//! Expects `config.json` plus one or more `*.safetensors` shards. Weights may be
//! stored under `model.decoder.*` (causal LM export) or `decoder.*` (bare model).

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::error::{SeqRecError, SeqRecResult};
use crate::layers::{Dense, LayerNorm};
use crate::params::{Param, ParamRole, ParamTag};

use super::{OptConfig, OptDecoder, OptDecoderLayer, OptEmbeddings, POSITION_OFFSET};

/// Load config and weights from `model_dir`.
pub fn load_opt_decoder(model_dir: &Path, device: &Device) -> SeqRecResult<OptDecoder> {
    let config = load_config(model_dir)?;
    let shards = safetensor_shards(model_dir)?;

    // SAFETY: the shards are memory-mapped read-only for the lifetime of the builder.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&shards, DType::F32, device) }
        .map_err(|e| SeqRecError::WeightLoadError {
            name: model_dir.display().to_string(),
            message: format!("failed to map safetensors: {}", e),
        })?;

    let vb = if vb.contains_tensor("model.decoder.embed_tokens.weight") {
        vb.pp("model.decoder")
    } else if vb.contains_tensor("decoder.embed_tokens.weight") {
        vb.pp("decoder")
    } else {
        return Err(SeqRecError::WeightLoadError {
            name: "embed_tokens.weight".to_string(),
            message: format!(
                "no decoder weights under 'model.decoder' or 'decoder' in {}",
                model_dir.display()
            ),
        });
    };

    let hidden = config.hidden_size;
    let eps = config.layer_norm_eps;
    let activation = config.activation()?;

    let embeddings = OptEmbeddings {
        embed_tokens: Param::from_tensor(
            "decoder.embed_tokens.weight",
            &get_tensor(&vb, "embed_tokens.weight", &[config.vocab_size, hidden])?,
            ParamTag::Embedding,
            ParamRole::Weight,
        )?,
        embed_positions: Param::from_tensor(
            "decoder.embed_positions.weight",
            &get_tensor(
                &vb,
                "embed_positions.weight",
                &[config.max_position_embeddings + POSITION_OFFSET, hidden],
            )?,
            ParamTag::Embedding,
            ParamRole::Weight,
        )?,
    };

    let layers = (0..config.num_hidden_layers)
        .map(|idx| load_layer(&vb.pp(format!("layers.{}", idx)), &config, idx))
        .collect::<SeqRecResult<Vec<_>>>()?;

    let final_layer_norm = if config.do_layer_norm_before {
        Some(LayerNorm::from_tensors(
            "decoder.final_layer_norm",
            &get_tensor(&vb, "final_layer_norm.weight", &[hidden])?,
            &get_tensor(&vb, "final_layer_norm.bias", &[hidden])?,
            eps,
            ParamTag::Other,
        )?)
    } else {
        None
    };

    tracing::info!(
        "Loaded OPT backbone from {}: hidden_size={}, layers={}, heads={}, activation={:?}",
        model_dir.display(),
        hidden,
        config.num_hidden_layers,
        config.num_attention_heads,
        activation
    );

    Ok(OptDecoder {
        config,
        embeddings,
        layers,
        final_layer_norm,
        device: device.clone(),
    })
}

fn load_config(model_dir: &Path) -> SeqRecResult<OptConfig> {
    let config_path = model_dir.join("config.json");
    let content = std::fs::read_to_string(&config_path)?;
    let config: OptConfig =
        serde_json::from_str(&content).map_err(|e| SeqRecError::SerializationError {
            message: format!("{}: {}", config_path.display(), e),
        })?;
    config.validate()?;
    Ok(config)
}

fn safetensor_shards(model_dir: &Path) -> SeqRecResult<Vec<PathBuf>> {
    let mut shards: Vec<PathBuf> = std::fs::read_dir(model_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    if shards.is_empty() {
        return Err(SeqRecError::WeightLoadError {
            name: model_dir.display().to_string(),
            message: "no .safetensors files found".to_string(),
        });
    }
    shards.sort();
    Ok(shards)
}

fn load_layer(vb: &VarBuilder, config: &OptConfig, idx: usize) -> SeqRecResult<OptDecoderLayer> {
    let hidden = config.hidden_size;
    let ffn = config.ffn_dim;
    let tag = ParamTag::Layer(idx);
    let prefix = format!("decoder.layers.{}", idx);

    let dense = |name: &str, in_dim: usize, out_dim: usize| -> SeqRecResult<Dense> {
        Dense::from_tensors(
            &format!("{}.{}", prefix, name),
            &get_tensor(vb, &format!("{}.weight", name), &[out_dim, in_dim])?,
            &get_tensor(vb, &format!("{}.bias", name), &[out_dim])?,
            tag,
        )
    };
    let norm = |name: &str| -> SeqRecResult<LayerNorm> {
        LayerNorm::from_tensors(
            &format!("{}.{}", prefix, name),
            &get_tensor(vb, &format!("{}.weight", name), &[hidden])?,
            &get_tensor(vb, &format!("{}.bias", name), &[hidden])?,
            config.layer_norm_eps,
            tag,
        )
    };

    Ok(OptDecoderLayer {
        q_proj: dense("self_attn.q_proj", hidden, hidden)?,
        k_proj: dense("self_attn.k_proj", hidden, hidden)?,
        v_proj: dense("self_attn.v_proj", hidden, hidden)?,
        out_proj: dense("self_attn.out_proj", hidden, hidden)?,
        self_attn_layer_norm: norm("self_attn_layer_norm")?,
        fc1: dense("fc1", hidden, ffn)?,
        fc2: dense("fc2", ffn, hidden)?,
        final_layer_norm: norm("final_layer_norm")?,
        num_heads: config.num_attention_heads,
        head_dim: config.head_dim(),
        pre_norm: config.do_layer_norm_before,
        activation: config.activation()?,
    })
}

/// Fetch a tensor and check its shape exactly.
fn get_tensor(vb: &VarBuilder, name: &str, expected_shape: &[usize]) -> SeqRecResult<Tensor> {
    let tensor = vb
        .get(expected_shape, name)
        .map_err(|e| SeqRecError::WeightLoadError {
            name: name.to_string(),
            message: e.to_string(),
        })?;
    if tensor.dims() != expected_shape {
        return Err(SeqRecError::WeightLoadError {
            name: name.to_string(),
            message: format!("expected shape {:?}, got {:?}", expected_shape, tensor.dims()),
        });
    }
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_opt_decoder(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, SeqRecError::IoError(_)));
    }

    #[test]
    fn test_missing_shards_is_weight_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = serde_json::to_string(&OptConfig::tiny(2, 8, 2)).unwrap();
        std::fs::write(dir.path().join("config.json"), config).unwrap();

        let err = load_opt_decoder(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, SeqRecError::WeightLoadError { .. }));
    }

    #[test]
    fn test_loads_causal_lm_export() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let config = OptConfig::tiny(2, 8, 2);
        let decoder = OptDecoder::synthetic(config.clone(), &device).unwrap();

        let mut params: Vec<&Param> = decoder.embeddings.params();
        for layer in &decoder.layers {
            params.extend(layer.params());
        }
        if let Some(norm) = &decoder.final_layer_norm {
            params.extend(norm.params());
        }
        let tensors: std::collections::HashMap<String, Tensor> = params
            .iter()
            .map(|p| (format!("model.{}", p.name()), p.tensor()))
            .collect();
        candle_core::safetensors::save(&tensors, dir.path().join("model.safetensors")).unwrap();
        std::fs::write(dir.path().join("config.json"), serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = load_opt_decoder(dir.path(), &device).unwrap();
        assert_eq!(loaded.layers.len(), 2);
        assert_eq!(loaded.layers[1].fc1.weight.name(), "decoder.layers.1.fc1.weight");
        assert_eq!(loaded.layers[1].fc1.weight.tag(), ParamTag::Layer(1));

        let original: Vec<f32> = decoder.layers[1].fc1.weight.tensor().flatten_all().unwrap().to_vec1().unwrap();
        let reloaded: Vec<f32> = loaded.layers[1].fc1.weight.tensor().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(original, reloaded);
    }

    #[test]
    fn test_malformed_config_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        let err = load_opt_decoder(dir.path(), &Device::Cpu).unwrap_err();
        assert!(matches!(err, SeqRecError::SerializationError { .. }));
    }
}
