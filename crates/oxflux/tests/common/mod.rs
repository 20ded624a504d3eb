#![allow(dead_code)]

use std::path::{Path, PathBuf};

use oxflux::nn::autoencoder::{AutoEncoder, AutoEncoderParams};
use oxflux::nn::flux::{Flux, FluxParams};
use oxflux::nn::Init;
use oxflux::LoaderConfig;
use tempfile::TempDir;
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::WhitespaceSplit;

pub const VAE_YAML: &str = "\
model:
  target: flux.modules.autoencoder.AutoEncoder
params:
  resolution: 32
  in_channels: 3
  ch: 4
  out_ch: 3
  ch_mult: [1, 2]
  num_res_blocks: 1
  z_channels: 2
  scale_factor: 0.3611
  shift_factor: 0.1159
  extra_unused_field: 99
";

pub const FLUX_YAML: &str = "\
params:
  in_channels: 4
  vec_in_dim: 6
  context_in_dim: 10
  hidden_size: 8
  mlp_ratio: 4.0
  num_heads: 2
  depth: 1
  depth_single_blocks: 1
  axes_dim: [2, 2]
  theta: 10000
  qkv_bias: true
  guidance_embed: false
  out_channels: 4
";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A temporary root with `configs/` and `models/` laid out like an install.
pub struct Fixture {
    pub dir: TempDir,
    pub app: LoaderConfig,
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let app = LoaderConfig::with_root(dir.path());
        std::fs::create_dir_all(app.legacy_conf_path().join("flux")).unwrap();
        std::fs::create_dir_all(app.models_path()).unwrap();
        Self { dir, app }
    }

    pub fn write_legacy(&self, name: &str, yaml: &str) -> PathBuf {
        let rel = PathBuf::from("flux").join(name);
        std::fs::write(self.app.legacy_conf_path().join(&rel), yaml).unwrap();
        rel
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.app.models_path().join(name)
    }
}

pub fn vae_params() -> AutoEncoderParams {
    AutoEncoderParams {
        resolution: 32,
        in_channels: 3,
        ch: 4,
        out_ch: 3,
        ch_mult: vec![1, 2],
        num_res_blocks: 1,
        z_channels: 2,
        scale_factor: 0.3611,
        shift_factor: 0.1159,
    }
}

pub fn flux_params() -> FluxParams {
    FluxParams {
        in_channels: 4,
        vec_in_dim: 6,
        context_in_dim: 10,
        hidden_size: 8,
        mlp_ratio: 4.0,
        num_heads: 2,
        depth: 1,
        depth_single_blocks: 1,
        axes_dim: vec![2, 2],
        theta: 10_000,
        qkv_bias: true,
        guidance_embed: false,
    }
}

pub fn random_vae(seed: u64) -> AutoEncoder {
    AutoEncoder::new(vae_params(), Init::Random { seed }).unwrap()
}

pub fn random_flux(seed: u64) -> Flux {
    Flux::new(flux_params(), Init::Random { seed }).unwrap()
}

/// Save a whitespace word-level `tokenizer.json` whose ids follow `words`.
pub fn write_word_level_tokenizer(dir: &Path, words: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    let vocab: ahash::AHashMap<String, u32> = words
        .iter()
        .enumerate()
        .map(|(i, w)| (w.to_string(), i as u32))
        .collect();
    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("<unk>".to_string())
        .build()
        .unwrap();
    let mut tokenizer = tokenizers::Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(WhitespaceSplit));
    tokenizer.save(dir.join("tokenizer.json"), false).unwrap();
}
