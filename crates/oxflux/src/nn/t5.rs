use serde::Deserialize;

use crate::error::{FluxError, Result};
use crate::model::pretrained::PretrainedModel;
use tracing::debug;

use crate::model::weights::StateDict;
use crate::nn::module::{Init, LayerBuilder, Layers, Module};
use crate::nn::tensor::DType;

const SHARED: &str = "shared";
const EMBED_TOKENS: &str = "encoder.embed_tokens";

/// `config.json` of a T5 encoder.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct T5Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_feed_forward_proj")]
    pub feed_forward_proj: String,
    #[serde(default)]
    pub layer_norm_epsilon: Option<f64>,
}

fn default_num_buckets() -> usize {
    32
}

fn default_feed_forward_proj() -> String {
    "relu".to_string()
}

impl T5Config {
    /// `gated-gelu` style projections use two input matrices.
    pub fn is_gated(&self) -> bool {
        self.feed_forward_proj.starts_with("gated-")
    }
}

pub struct T5EncoderModel {
    pub config: T5Config,
    layers: Layers,
}

impl Module for T5EncoderModel {
    fn layers(&self) -> &Layers {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut Layers {
        &mut self.layers
    }
}

impl PretrainedModel for T5EncoderModel {
    type Config = T5Config;

    const NAME: &'static str = "T5EncoderModel";

    fn from_config(config: T5Config, init: Init) -> Result<Self> {
        let act = config.feed_forward_proj.trim_start_matches("gated-");
        if !matches!(act, "relu" | "gelu" | "gelu_new") {
            return Err(FluxError::InvalidArchitecture(format!(
                "unsupported feed_forward_proj \"{}\"",
                config.feed_forward_proj
            )));
        }

        let d_model = config.d_model;
        let inner = config.num_heads * config.d_kv;

        let mut b = LayerBuilder::new(init, DType::F32);
        b.embedding(SHARED, config.vocab_size, d_model);
        b.scope("encoder", |b| {
            b.embedding("embed_tokens", config.vocab_size, d_model);
            for i in 0..config.num_layers {
                b.scope(format!("block.{i}.layer"), |b| {
                    b.scope(0, |b| {
                        b.scope("SelfAttention", |b| {
                            b.linear("q", d_model, inner, false);
                            b.linear("k", d_model, inner, false);
                            b.linear("v", d_model, inner, false);
                            b.linear("o", inner, d_model, false);
                            if i == 0 {
                                b.embedding(
                                    "relative_attention_bias",
                                    config.relative_attention_num_buckets,
                                    config.num_heads,
                                );
                            }
                        });
                        b.rms_norm("layer_norm", "weight", d_model);
                    });
                    b.scope(1, |b| {
                        b.scope("DenseReluDense", |b| {
                            if config.is_gated() {
                                b.linear("wi_0", d_model, config.d_ff, false);
                                b.linear("wi_1", d_model, config.d_ff, false);
                            } else {
                                b.linear("wi", d_model, config.d_ff, false);
                            }
                            b.linear("wo", config.d_ff, d_model, false);
                        });
                        b.rms_norm("layer_norm", "weight", d_model);
                    });
                });
            }
            b.rms_norm("final_layer_norm", "weight", d_model);
        });

        Ok(Self {
            config,
            layers: b.finish(),
        })
    }

    /// Checkpoints usually store the token embedding once, as `shared.weight`.
    fn tie_weights(&self, weights: &mut StateDict) {
        let shared = format!("{SHARED}.weight");
        let embed = format!("{EMBED_TOKENS}.weight");
        let (from, to) = match (weights.contains(&shared), weights.contains(&embed)) {
            (true, false) => (shared, embed),
            (false, true) => (embed, shared),
            _ => return,
        };
        if let Some(tensor) = weights.get(&from).cloned() {
            weights.insert(to.as_str(), tensor);
            debug!("tied {to} to {from}");
        }
    }
}
