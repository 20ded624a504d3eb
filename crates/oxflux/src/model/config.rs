use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Base architecture family a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseModelType {
    Any,
    #[serde(rename = "sd-1")]
    StableDiffusion1,
    #[serde(rename = "sd-2")]
    StableDiffusion2,
    #[serde(rename = "sdxl")]
    StableDiffusionXL,
    Flux,
}

impl fmt::Display for BaseModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Any => "any",
            Self::StableDiffusion1 => "sd-1",
            Self::StableDiffusion2 => "sd-2",
            Self::StableDiffusionXL => "sdxl",
            Self::Flux => "flux",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Main,
    Vae,
    ClipEmbed,
    T5Encoder,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Main => "main",
            Self::Vae => "vae",
            Self::ClipEmbed => "clip_embed",
            Self::T5Encoder => "t5_encoder",
        })
    }
}

/// On-disk storage format of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    Checkpoint,
    Diffusers,
    #[serde(rename = "bnb_quantized_nf4b")]
    BnbQuantizedNf4b,
    T5Encoder,
    #[serde(rename = "t5_encoder_8b")]
    T5Encoder8b,
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Checkpoint => "checkpoint",
            Self::Diffusers => "diffusers",
            Self::BnbQuantizedNf4b => "bnb_quantized_nf4b",
            Self::T5Encoder => "t5_encoder",
            Self::T5Encoder8b => "t5_encoder_8b",
        })
    }
}

/// Named constituent of a multi-part model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubModelType {
    Transformer,
    TextEncoder,
    #[serde(rename = "text_encoder_2")]
    TextEncoder2,
    Tokenizer,
    #[serde(rename = "tokenizer_2")]
    Tokenizer2,
    Vae,
    Scheduler,
}

impl fmt::Display for SubModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transformer => "transformer",
            Self::TextEncoder => "text_encoder",
            Self::TextEncoder2 => "text_encoder_2",
            Self::Tokenizer => "tokenizer",
            Self::Tokenizer2 => "tokenizer_2",
            Self::Vae => "vae",
            Self::Scheduler => "scheduler",
        })
    }
}

fn flux() -> BaseModelType {
    BaseModelType::Flux
}

fn any() -> BaseModelType {
    BaseModelType::Any
}

/// Single-file checkpoint paired with a legacy architecture YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "flux")]
    pub base: BaseModelType,
    /// Relative to the legacy config root.
    pub config_path: PathBuf,
}

/// Pretrained directory (config.json + safetensors, tokenizer files, subfolders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "any")]
    pub base: BaseModelType,
}

/// Configuration record of one installed model, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnyModelConfig {
    VaeCheckpoint(CheckpointConfig),
    MainCheckpoint(CheckpointConfig),
    #[serde(rename = "main_bnb_quantized_4b_checkpoint")]
    MainBnbQuantized4bCheckpoint(CheckpointConfig),
    MainDiffusers(DirectoryConfig),
    ClipEmbedDiffusers(DirectoryConfig),
    T5Encoder(DirectoryConfig),
    #[serde(rename = "t5_encoder_8b")]
    T5Encoder8b(DirectoryConfig),
}

impl AnyModelConfig {
    pub fn key(&self) -> &str {
        match self {
            Self::VaeCheckpoint(c) | Self::MainCheckpoint(c) | Self::MainBnbQuantized4bCheckpoint(c) => &c.key,
            Self::MainDiffusers(c) | Self::ClipEmbedDiffusers(c) | Self::T5Encoder(c) | Self::T5Encoder8b(c) => {
                &c.key
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::VaeCheckpoint(c) | Self::MainCheckpoint(c) | Self::MainBnbQuantized4bCheckpoint(c) => &c.name,
            Self::MainDiffusers(c) | Self::ClipEmbedDiffusers(c) | Self::T5Encoder(c) | Self::T5Encoder8b(c) => {
                &c.name
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::VaeCheckpoint(c) | Self::MainCheckpoint(c) | Self::MainBnbQuantized4bCheckpoint(c) => &c.path,
            Self::MainDiffusers(c) | Self::ClipEmbedDiffusers(c) | Self::T5Encoder(c) | Self::T5Encoder8b(c) => {
                &c.path
            }
        }
    }

    pub(crate) fn path_mut(&mut self) -> &mut PathBuf {
        match self {
            Self::VaeCheckpoint(c) | Self::MainCheckpoint(c) | Self::MainBnbQuantized4bCheckpoint(c) => {
                &mut c.path
            }
            Self::MainDiffusers(c) | Self::ClipEmbedDiffusers(c) | Self::T5Encoder(c) | Self::T5Encoder8b(c) => {
                &mut c.path
            }
        }
    }

    pub fn base(&self) -> BaseModelType {
        match self {
            Self::VaeCheckpoint(c) | Self::MainCheckpoint(c) | Self::MainBnbQuantized4bCheckpoint(c) => c.base,
            Self::MainDiffusers(c) | Self::ClipEmbedDiffusers(c) | Self::T5Encoder(c) | Self::T5Encoder8b(c) => {
                c.base
            }
        }
    }

    pub fn model_type(&self) -> ModelType {
        match self {
            Self::VaeCheckpoint(_) => ModelType::Vae,
            Self::MainCheckpoint(_) | Self::MainBnbQuantized4bCheckpoint(_) | Self::MainDiffusers(_) => {
                ModelType::Main
            }
            Self::ClipEmbedDiffusers(_) => ModelType::ClipEmbed,
            Self::T5Encoder(_) | Self::T5Encoder8b(_) => ModelType::T5Encoder,
        }
    }

    pub fn format(&self) -> ModelFormat {
        match self {
            Self::VaeCheckpoint(_) | Self::MainCheckpoint(_) => ModelFormat::Checkpoint,
            Self::MainBnbQuantized4bCheckpoint(_) => ModelFormat::BnbQuantizedNf4b,
            Self::MainDiffusers(_) | Self::ClipEmbedDiffusers(_) => ModelFormat::Diffusers,
            Self::T5Encoder(_) => ModelFormat::T5Encoder,
            Self::T5Encoder8b(_) => ModelFormat::T5Encoder8b,
        }
    }

    /// Name of the concrete variant, for diagnostics.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::VaeCheckpoint(_) => "VaeCheckpointConfig",
            Self::MainCheckpoint(_) => "MainCheckpointConfig",
            Self::MainBnbQuantized4bCheckpoint(_) => "MainBnbQuantized4bCheckpointConfig",
            Self::MainDiffusers(_) => "MainDiffusersConfig",
            Self::ClipEmbedDiffusers(_) => "ClipEmbedDiffusersConfig",
            Self::T5Encoder(_) => "T5EncoderConfig",
            Self::T5Encoder8b(_) => "T5Encoder8bConfig",
        }
    }

    /// The legacy architecture YAML, for checkpoint variants.
    pub fn config_path(&self) -> Option<&Path> {
        match self {
            Self::VaeCheckpoint(c) | Self::MainCheckpoint(c) | Self::MainBnbQuantized4bCheckpoint(c) => {
                Some(&c.config_path)
            }
            _ => None,
        }
    }
}
