use serde::Deserialize;

use crate::error::{FluxError, Result};
use crate::model::pretrained::PretrainedModel;
use crate::nn::module::{Init, LayerBuilder, Layers, Module};
use crate::nn::tensor::DType;

/// `config.json` of a CLIP text encoder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClipTextConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub hidden_act: Option<String>,
    #[serde(default)]
    pub layer_norm_eps: Option<f64>,
}

fn default_vocab_size() -> usize {
    49408
}

fn default_hidden_size() -> usize {
    512
}

fn default_intermediate_size() -> usize {
    2048
}

fn default_num_hidden_layers() -> usize {
    12
}

fn default_num_attention_heads() -> usize {
    8
}

fn default_max_position_embeddings() -> usize {
    77
}

pub struct ClipTextModel {
    pub config: ClipTextConfig,
    layers: Layers,
}

impl Module for ClipTextModel {
    fn layers(&self) -> &Layers {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut Layers {
        &mut self.layers
    }
}

impl PretrainedModel for ClipTextModel {
    type Config = ClipTextConfig;

    const NAME: &'static str = "CLIPTextModel";

    fn from_config(config: ClipTextConfig, init: Init) -> Result<Self> {
        let hidden = config.hidden_size;
        if config.num_attention_heads == 0 || hidden % config.num_attention_heads != 0 {
            return Err(FluxError::InvalidArchitecture(format!(
                "hidden_size {hidden} must be divisible by num_attention_heads {}",
                config.num_attention_heads
            )));
        }

        let mut b = LayerBuilder::new(init, DType::F32);
        b.scope("text_model", |b| {
            b.scope("embeddings", |b| {
                b.embedding("token_embedding", config.vocab_size, hidden);
                b.embedding("position_embedding", config.max_position_embeddings, hidden);
            });
            b.scope("encoder.layers", |b| {
                for i in 0..config.num_hidden_layers {
                    b.scope(i, |b| {
                        b.scope("self_attn", |b| {
                            for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
                                b.linear(proj, hidden, hidden, true);
                            }
                        });
                        b.layer_norm("layer_norm1", hidden);
                        b.scope("mlp", |b| {
                            b.linear("fc1", hidden, config.intermediate_size, true);
                            b.linear("fc2", config.intermediate_size, hidden, true);
                        });
                        b.layer_norm("layer_norm2", hidden);
                    });
                }
            });
            b.layer_norm("final_layer_norm", hidden);
        });

        Ok(Self {
            config,
            layers: b.finish(),
        })
    }
}
