use serde::{Deserialize, Serialize};

use crate::error::{FluxError, Result};
use crate::model::arch::ArchitectureParams;
use crate::nn::module::{Init, LayerBuilder, Layers, Module};
use crate::nn::tensor::DType;

/// FLUX VAE shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoEncoderParams {
    pub resolution: usize,
    pub in_channels: usize,
    pub ch: usize,
    pub out_ch: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub z_channels: usize,
    pub scale_factor: f32,
    pub shift_factor: f32,
}

impl ArchitectureParams for AutoEncoderParams {
    const FIELDS: &'static [&'static str] = &[
        "resolution",
        "in_channels",
        "ch",
        "out_ch",
        "ch_mult",
        "num_res_blocks",
        "z_channels",
        "scale_factor",
        "shift_factor",
    ];
}

/// Convolutional VAE: `encoder.*` maps images to 2·z_channels moments,
/// `decoder.*` maps z_channels latents back.
pub struct AutoEncoder {
    pub params: AutoEncoderParams,
    layers: Layers,
}

impl AutoEncoder {
    pub fn new(params: AutoEncoderParams, init: Init) -> Result<Self> {
        if params.ch_mult.is_empty() || params.ch_mult.contains(&0) {
            return Err(FluxError::InvalidArchitecture(format!(
                "ch_mult must be non-empty and positive, got {:?}",
                params.ch_mult
            )));
        }
        if params.ch == 0 || params.z_channels == 0 || params.num_res_blocks == 0 {
            return Err(FluxError::InvalidArchitecture(
                "ch, z_channels and num_res_blocks must be positive".to_string(),
            ));
        }

        let mut b = LayerBuilder::new(init, DType::F32);
        b.scope("encoder", |b| encoder(b, &params));
        b.scope("decoder", |b| decoder(b, &params));

        Ok(Self {
            params,
            layers: b.finish(),
        })
    }
}

impl Module for AutoEncoder {
    fn layers(&self) -> &Layers {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut Layers {
        &mut self.layers
    }
}

fn resnet_block(b: &mut LayerBuilder, in_ch: usize, out_ch: usize) {
    b.group_norm("norm1", in_ch);
    b.conv2d("conv1", in_ch, out_ch, 3);
    b.group_norm("norm2", out_ch);
    b.conv2d("conv2", out_ch, out_ch, 3);
    if in_ch != out_ch {
        b.conv2d("nin_shortcut", in_ch, out_ch, 1);
    }
}

fn attn_block(b: &mut LayerBuilder, ch: usize) {
    b.group_norm("norm", ch);
    b.conv2d("q", ch, ch, 1);
    b.conv2d("k", ch, ch, 1);
    b.conv2d("v", ch, ch, 1);
    b.conv2d("proj_out", ch, ch, 1);
}

fn mid(b: &mut LayerBuilder, ch: usize) {
    b.scope("mid", |b| {
        b.scope("block_1", |b| resnet_block(b, ch, ch));
        b.scope("attn_1", |b| attn_block(b, ch));
        b.scope("block_2", |b| resnet_block(b, ch, ch));
    });
}

fn encoder(b: &mut LayerBuilder, p: &AutoEncoderParams) {
    let levels = p.ch_mult.len();
    b.conv2d("conv_in", p.in_channels, p.ch, 3);

    let mut block_in = p.ch;
    for level in 0..levels {
        let block_out = p.ch * p.ch_mult[level];
        b.scope("down", |b| {
            b.scope(level, |b| {
                for i in 0..p.num_res_blocks {
                    b.scope("block", |b| b.scope(i, |b| resnet_block(b, block_in, block_out)));
                    block_in = block_out;
                }
                if level != levels - 1 {
                    b.scope("downsample", |b| b.conv2d("conv", block_in, block_in, 3));
                }
            });
        });
    }

    mid(b, block_in);
    b.group_norm("norm_out", block_in);
    b.conv2d("conv_out", block_in, 2 * p.z_channels, 3);
}

fn decoder(b: &mut LayerBuilder, p: &AutoEncoderParams) {
    let levels = p.ch_mult.len();
    let mut block_in = p.ch * p.ch_mult[levels - 1];
    b.conv2d("conv_in", p.z_channels, block_in, 3);
    mid(b, block_in);

    for level in (0..levels).rev() {
        let block_out = p.ch * p.ch_mult[level];
        b.scope("up", |b| {
            b.scope(level, |b| {
                for i in 0..=p.num_res_blocks {
                    b.scope("block", |b| b.scope(i, |b| resnet_block(b, block_in, block_out)));
                    block_in = block_out;
                }
                if level != 0 {
                    b.scope("upsample", |b| b.conv2d("conv", block_in, block_in, 3));
                }
            });
        });
    }

    b.group_norm("norm_out", block_in);
    b.conv2d("conv_out", block_in, p.out_ch, 3);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::module::LayerKind;

    fn tiny_params() -> AutoEncoderParams {
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

    #[test]
    fn test_fields_match_struct() {
        let value = serde_yaml::to_value(tiny_params()).unwrap();
        let mut keys: Vec<&str> = value
            .as_mapping()
            .unwrap()
            .keys()
            .map(|k| k.as_str().unwrap())
            .collect();
        keys.sort_unstable();
        let mut fields = AutoEncoderParams::FIELDS.to_vec();
        fields.sort_unstable();
        assert_eq!(keys, fields);
    }

    #[test]
    fn test_layer_names_and_shapes() {
        let vae = AutoEncoder::new(tiny_params(), Init::Empty).unwrap();
        let layers = vae.layers();

        assert_eq!(layers.param("encoder.conv_in.weight").unwrap().shape(), &[4, 3, 3, 3]);
        assert_eq!(
            layers.param("encoder.down.1.block.0.nin_shortcut.weight").unwrap().shape(),
            &[8, 4, 1, 1]
        );
        assert!(layers.param("encoder.down.0.downsample.conv.weight").is_some());
        assert!(layers.param("encoder.down.1.downsample.conv.weight").is_none());
        assert_eq!(layers.param("encoder.conv_out.weight").unwrap().shape(), &[4, 8, 3, 3]);
        assert_eq!(layers.param("decoder.conv_in.weight").unwrap().shape(), &[8, 2, 3, 3]);
        assert!(layers.param("decoder.up.1.block.1.conv2.weight").is_some());
        assert!(layers.param("decoder.up.1.upsample.conv.weight").is_some());
        assert!(layers.param("decoder.up.0.upsample.conv.weight").is_none());
        assert_eq!(layers.param("decoder.conv_out.weight").unwrap().shape(), &[3, 4, 3, 3]);
        assert_eq!(
            layers.layer("decoder.mid.attn_1.q").unwrap().kind(),
            LayerKind::Conv2d {
                in_channels: 8,
                out_channels: 8,
                kernel_size: 1
            }
        );
    }

    #[test]
    fn test_rejects_empty_ch_mult() {
        let mut p = tiny_params();
        p.ch_mult.clear();
        assert!(matches!(
            AutoEncoder::new(p, Init::Empty),
            Err(FluxError::InvalidArchitecture(_))
        ));
    }
}
