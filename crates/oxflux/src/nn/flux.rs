use serde::{Deserialize, Serialize};

use crate::error::{FluxError, Result};
use crate::model::arch::ArchitectureParams;
use crate::nn::module::{Init, LayerBuilder, Layers, Module};
use crate::nn::tensor::DType;

/// Width of the sinusoidal timestep/guidance embedding.
const TIMESTEP_DIM: usize = 256;

/// FLUX transformer shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluxParams {
    pub in_channels: usize,
    pub vec_in_dim: usize,
    pub context_in_dim: usize,
    pub hidden_size: usize,
    pub mlp_ratio: f32,
    pub num_heads: usize,
    pub depth: usize,
    pub depth_single_blocks: usize,
    pub axes_dim: Vec<usize>,
    pub theta: u32,
    pub qkv_bias: bool,
    pub guidance_embed: bool,
}

impl ArchitectureParams for FluxParams {
    const FIELDS: &'static [&'static str] = &[
        "in_channels",
        "vec_in_dim",
        "context_in_dim",
        "hidden_size",
        "mlp_ratio",
        "num_heads",
        "depth",
        "depth_single_blocks",
        "axes_dim",
        "theta",
        "qkv_bias",
        "guidance_embed",
    ];
}

impl FluxParams {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    pub fn mlp_hidden_dim(&self) -> usize {
        (self.hidden_size as f32 * self.mlp_ratio) as usize
    }
}

/// Rectified-flow transformer: double-stream blocks over image and text
/// tokens followed by single-stream blocks over their concatenation.
pub struct Flux {
    pub params: FluxParams,
    layers: Layers,
}

impl Flux {
    pub fn new(params: FluxParams, init: Init) -> Result<Self> {
        if params.num_heads == 0 || params.hidden_size % params.num_heads != 0 {
            return Err(FluxError::InvalidArchitecture(format!(
                "hidden_size {} must be divisible by num_heads {}",
                params.hidden_size, params.num_heads
            )));
        }
        let pe_dim = params.head_dim();
        if params.axes_dim.iter().sum::<usize>() != pe_dim {
            return Err(FluxError::InvalidArchitecture(format!(
                "axes_dim {:?} must sum to head dim {pe_dim}",
                params.axes_dim
            )));
        }

        let hidden = params.hidden_size;
        let mlp_hidden = params.mlp_hidden_dim();

        let mut b = LayerBuilder::new(init, DType::F32);
        b.linear("img_in", params.in_channels, hidden, true);
        b.scope("time_in", |b| mlp_embedder(b, TIMESTEP_DIM, hidden));
        b.scope("vector_in", |b| mlp_embedder(b, params.vec_in_dim, hidden));
        if params.guidance_embed {
            b.scope("guidance_in", |b| mlp_embedder(b, TIMESTEP_DIM, hidden));
        }
        b.linear("txt_in", params.context_in_dim, hidden, true);

        b.scope("double_blocks", |b| {
            for i in 0..params.depth {
                b.scope(i, |b| {
                    for stream in ["img", "txt"] {
                        b.scope(format!("{stream}_mod"), |b| b.linear("lin", hidden, 6 * hidden, true));
                        b.scope(format!("{stream}_attn"), |b| {
                            self_attention(b, hidden, pe_dim, params.qkv_bias)
                        });
                        b.scope(format!("{stream}_mlp"), |b| {
                            b.linear(0, hidden, mlp_hidden, true);
                            b.linear(2, mlp_hidden, hidden, true);
                        });
                    }
                });
            }
        });

        b.scope("single_blocks", |b| {
            for i in 0..params.depth_single_blocks {
                b.scope(i, |b| {
                    b.linear("linear1", hidden, 3 * hidden + mlp_hidden, true);
                    b.linear("linear2", hidden + mlp_hidden, hidden, true);
                    qk_norm(b, pe_dim);
                    b.scope("modulation", |b| b.linear("lin", hidden, 3 * hidden, true));
                });
            }
        });

        b.scope("final_layer", |b| {
            b.linear("linear", hidden, params.in_channels, true);
            b.scope("adaLN_modulation", |b| b.linear(1, hidden, 2 * hidden, true));
        });

        Ok(Self {
            params,
            layers: b.finish(),
        })
    }
}

impl Module for Flux {
    fn layers(&self) -> &Layers {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut Layers {
        &mut self.layers
    }
}

fn mlp_embedder(b: &mut LayerBuilder, in_dim: usize, hidden: usize) {
    b.linear("in_layer", in_dim, hidden, true);
    b.linear("out_layer", hidden, hidden, true);
}

fn qk_norm(b: &mut LayerBuilder, head_dim: usize) {
    b.scope("norm", |b| {
        b.rms_norm("query_norm", "scale", head_dim);
        b.rms_norm("key_norm", "scale", head_dim);
    });
}

fn self_attention(b: &mut LayerBuilder, dim: usize, head_dim: usize, qkv_bias: bool) {
    b.linear("qkv", dim, 3 * dim, qkv_bias);
    qk_norm(b, head_dim);
    b.linear("proj", dim, dim, true);
}
