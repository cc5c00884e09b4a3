//! End-to-end checks of the prompt-conditioned item encoder.

use candle_core::{DType, Device, Tensor};
use plm_seqrec::{
    BackboneAdapter, BackboneInput, EncoderConfig, ItemEmbedder, ItemEncoder, LayerWindow, OptConfig,
    OptDecoder, PoolingMethod, PreInferredEncoder, SeqRecConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn decoder(layers: usize) -> OptDecoder {
    OptDecoder::synthetic(OptConfig::tiny(layers, 16, 4), &Device::Cpu).unwrap()
}

fn batch(rows: usize, tokens: usize) -> (Tensor, Tensor) {
    let ids: Vec<u32> = (0..rows * tokens).map(|i| (i * 7 % 50 + 2) as u32).collect();
    let ids = Tensor::from_vec(ids, (rows, tokens), &Device::Cpu).unwrap();
    let mask = Tensor::ones((rows, tokens), DType::U32, &Device::Cpu).unwrap();
    (ids, mask)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    a.sub(b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

#[test]
fn test_two_pass_segment_lengths() {
    init_tracing();
    let config = EncoderConfig::prompt(PoolingMethod::Last, 2, 0, 1);
    let encoder = ItemEncoder::new(decoder(4), &config).unwrap();
    let (ids, mask) = batch(3, 5);

    let outputs = encoder.forward_segments(&ids, &mask).unwrap();
    assert_eq!(outputs.first_cache_len, 7);
    assert_eq!(outputs.second_mask_len, Some(8));
    assert_eq!(outputs.second_pass.as_ref().unwrap().dims(), &[3, 1, 16]);

    let items = encoder.embed_items(&ids, &mask).unwrap();
    assert_eq!(items.dims(), &[3, 16]);
}

#[test]
fn test_prompt_forward_is_deterministic() {
    let config = EncoderConfig::prompt(PoolingMethod::MeanLast, 3, 2, 1);
    let encoder = ItemEncoder::new(decoder(2), &config).unwrap();
    let (ids, mask) = batch(2, 6);

    let first = encoder.embed_items(&ids, &mask).unwrap();
    let second = encoder.embed_items(&ids, &mask).unwrap();
    assert_eq!(max_abs_diff(&first, &second), 0.0);
}

#[test]
fn test_zero_prompts_match_plain_mean_pooling() {
    let prompted = ItemEncoder::new(decoder(3), &EncoderConfig::prompt(PoolingMethod::Mean, 0, 0, 0)).unwrap();
    let plain = ItemEncoder::new(decoder(3), &EncoderConfig::finetune(PoolingMethod::Mean, 0)).unwrap();
    let (ids, mask) = batch(4, 5);

    let a = prompted.embed_items(&ids, &mask).unwrap();
    let b = plain.embed_items(&ids, &mask).unwrap();
    assert!(max_abs_diff(&a, &b) < 1e-6);
}

#[test]
fn test_window_split_matches_full_backbone() {
    let full_decoder = decoder(4);
    let (ids, mask) = batch(2, 5);

    let full = BackboneAdapter::new(full_decoder.clone(), true, LayerWindow::full(4).unwrap()).unwrap();
    let bottom = BackboneAdapter::new(full_decoder.clone(), true, LayerWindow::bottom(2, 4).unwrap()).unwrap();
    let top = BackboneAdapter::new(full_decoder, false, LayerWindow::top(2, 4).unwrap()).unwrap();

    let expected = full.run(BackboneInput::TokenIds(&ids), &mask, None).unwrap();
    let lower = bottom.run(BackboneInput::TokenIds(&ids), &mask, None).unwrap();
    let upper = top
        .run(BackboneInput::Embeddings(&lower.hidden_states), &mask, None)
        .unwrap();

    assert_eq!(upper.hidden_states.dims(), &[2, 5, 16]);
    assert!(max_abs_diff(&expected.hidden_states, &upper.hidden_states) < 1e-4);
}

#[test]
fn test_pre_inferred_matches_live_encoder() {
    let (ids, mask) = batch(3, 4);
    let live = ItemEncoder::new(decoder(3), &EncoderConfig::finetune(PoolingMethod::Last, -1)).unwrap();
    let expected = live.embed_items(&ids, &mask).unwrap();

    let (online, offline) =
        PreInferredEncoder::split(decoder(3), &EncoderConfig::pre_inferred(PoolingMethod::Last, 1)).unwrap();
    let hidden = offline.precompute_hidden_states(&ids, &mask).unwrap();
    let actual = online.embed_items(&hidden, &mask).unwrap();

    assert!(max_abs_diff(&expected, &actual) < 1e-4);
}

#[test]
fn test_invalid_configurations_rejected() {
    let rejected = [
        EncoderConfig::prompt(PoolingMethod::Last, 2, 0, 0),
        EncoderConfig::prompt(PoolingMethod::Mean, 2, 3, 0),
        EncoderConfig::finetune(PoolingMethod::Mean, 5),
        EncoderConfig::finetune(PoolingMethod::MeanLast, 0),
    ];
    for config in rejected {
        let err = ItemEncoder::new(decoder(4), &config).unwrap_err();
        assert!(err.is_configuration(), "{:?} gave {}", config, err);
    }
}

#[test]
fn test_config_file_round_trip() {
    use std::io::Write;

    let mut config = SeqRecConfig::default();
    config.encoder = EncoderConfig::prompt(PoolingMethod::MeanLast, 8, 4, 2);
    config.optim.plm_lr_layer_decay = 0.65;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(config.to_toml_string().unwrap().as_bytes()).unwrap();

    let loaded = SeqRecConfig::from_file(file.path()).unwrap();
    assert_eq!(loaded, config);
    loaded.validate_for_backbone(4).unwrap();
}
