//! 4-bit NormalFloat (NF4) block quantization.
//!
//! Each block of `blocksize` consecutive weights shares one f32 absmax.
//! Values are normalized by the absmax and snapped to the nearest of 16
//! quantiles of a unit normal, stored as packed nibbles (first element in
//! the high nibble), the layout bitsandbytes checkpoints use.
//!
//! bitsandbytes can also store the absmax itself compressed ("double
//! quantization"): u8 codes into `nested_quant_map`, scaled per block of
//! `nested_blocksize` by `nested_absmax` and shifted by `nested_offset`.

use std::collections::HashSet;

use ahash::AHashMap;
use serde::Deserialize;
use tracing::debug;

use crate::error::{FluxError, Result};
use crate::nn::module::{Module, QuantScheme};
use crate::nn::tensor::{numel, DType, Tensor};

pub const NF4_BLOCKSIZE: usize = 64;

/// Compute dtype for NF4 layers.
pub const NF4_COMPUTE_DTYPE: DType = DType::BF16;

/// Suffix of the packed JSON quant state bitsandbytes stores next to a weight.
pub const QUANT_STATE_SUFFIX: &str = "quant_state.bitsandbytes__nf4";

pub const NF4_CODE: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

#[derive(Debug, Clone, PartialEq)]
pub struct Nf4Tensor {
    shape: Vec<usize>,
    packed: Vec<u8>,
    absmax: Vec<f32>,
    blocksize: usize,
    compute_dtype: DType,
}

impl Nf4Tensor {
    pub fn quantize(values: &[f32], shape: Vec<usize>, blocksize: usize, compute_dtype: DType) -> Result<Self> {
        let n = numel(&shape);
        if values.len() != n {
            return Err(FluxError::ShapeMismatch {
                name: "<nf4>".to_string(),
                expected: shape,
                found: vec![values.len()],
            });
        }
        if blocksize == 0 {
            return Err(FluxError::Quantization("blocksize must be positive".into()));
        }

        let mut absmax = Vec::with_capacity(n.div_ceil(blocksize));
        let mut codes = Vec::with_capacity(n);
        for block in values.chunks(blocksize) {
            let max = block.iter().fold(0f32, |m, v| m.max(v.abs()));
            absmax.push(max);
            let inv = if max > 0.0 { 1.0 / max } else { 0.0 };
            codes.extend(block.iter().map(|&v| nearest_code(v * inv)));
        }

        let packed = codes
            .chunks(2)
            .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
            .collect();

        Ok(Self {
            shape,
            packed,
            absmax,
            blocksize,
            compute_dtype,
        })
    }

    /// Wrap an already-quantized weight and its per-block absmax.
    pub fn from_packed(
        shape: Vec<usize>,
        packed: &Tensor,
        absmax: &Tensor,
        blocksize: usize,
        compute_dtype: DType,
    ) -> Result<Self> {
        let n = numel(&shape);
        if packed.dtype() != DType::U8 {
            return Err(FluxError::Quantization(format!(
                "packed NF4 weight must be u8, got {}",
                packed.dtype()
            )));
        }
        if packed.numel() != n.div_ceil(2) {
            return Err(FluxError::Quantization(format!(
                "packed NF4 weight has {} bytes, shape {shape:?} needs {}",
                packed.numel(),
                n.div_ceil(2)
            )));
        }
        if !absmax.dtype().is_float() {
            return Err(FluxError::Quantization(format!(
                "NF4 absmax must be a float tensor, got {} (compressed statistics need their nested entries)",
                absmax.dtype()
            )));
        }
        let absmax = absmax.to_f32_vec()?;
        if absmax.len() != n.div_ceil(blocksize) {
            return Err(FluxError::Quantization(format!(
                "NF4 absmax has {} blocks, expected {}",
                absmax.len(),
                n.div_ceil(blocksize)
            )));
        }
        Ok(Self {
            shape,
            packed: packed.as_bytes().to_vec(),
            absmax,
            blocksize,
            compute_dtype,
        })
    }

    pub fn dequantize(&self) -> Result<Tensor> {
        let n = numel(&self.shape);
        let values: Vec<f32> = (0..n)
            .map(|i| {
                let byte = self.packed[i / 2];
                let code = if i % 2 == 0 { byte >> 4 } else { byte & 0x0F };
                NF4_CODE[code as usize] * self.absmax[i / self.blocksize]
            })
            .collect();
        Tensor::from_f32(self.compute_dtype, self.shape.clone(), &values)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn nbytes(&self) -> usize {
        self.packed.len() + self.absmax.len() * 4
    }

    pub(crate) fn packed_tensor(&self) -> Result<Tensor> {
        Tensor::from_bytes(DType::U8, vec![self.packed.len(), 1], self.packed.clone())
    }

    pub(crate) fn absmax_tensor(&self) -> Result<Tensor> {
        Tensor::from_f32(DType::F32, vec![self.absmax.len()], &self.absmax)
    }
}

#[derive(Debug, Deserialize)]
struct PackedQuantState {
    nested_blocksize: Option<usize>,
    #[serde(default)]
    nested_offset: f32,
}

/// Take the per-block absmax of the packed weight `key` out of its
/// auxiliary checkpoint entries, expanding compressed statistics.
pub(crate) fn take_absmax(key: &str, aux: &mut AHashMap<String, Tensor>) -> Result<Tensor> {
    let missing = |what: &str| FluxError::Quantization(format!("\"{key}\" is packed but has no {what}"));

    let absmax = aux.remove(&format!("{key}.absmax")).ok_or_else(|| missing("absmax"))?;
    if absmax.dtype().is_float() {
        return Ok(absmax);
    }
    if absmax.dtype() != DType::U8 {
        return Err(FluxError::Quantization(format!(
            "\"{key}.absmax\" has unsupported dtype {}",
            absmax.dtype()
        )));
    }

    let nested_absmax = aux
        .remove(&format!("{key}.nested_absmax"))
        .ok_or_else(|| missing("nested_absmax"))?;
    let nested_map = aux
        .remove(&format!("{key}.nested_quant_map"))
        .ok_or_else(|| missing("nested_quant_map"))?;
    let state = aux
        .remove(&format!("{key}.{QUANT_STATE_SUFFIX}"))
        .ok_or_else(|| missing(QUANT_STATE_SUFFIX))?;
    let state: PackedQuantState = serde_json::from_slice(state.as_bytes())
        .map_err(|e| FluxError::Quantization(format!("\"{key}\": bad quant state: {e}")))?;

    let nested_blocksize = state
        .nested_blocksize
        .filter(|&b| b > 0)
        .ok_or_else(|| FluxError::Quantization(format!("\"{key}\": quant state has no nested_blocksize")))?;
    if !nested_absmax.dtype().is_float() || !nested_map.dtype().is_float() {
        return Err(FluxError::Quantization(format!(
            "\"{key}\": nested statistics must be float tensors"
        )));
    }
    let nested_absmax = nested_absmax.to_f32_vec()?;
    let nested_map = nested_map.to_f32_vec()?;

    let codes = absmax.as_bytes();
    if nested_map.len() != 256 || nested_absmax.len() < codes.len().div_ceil(nested_blocksize) {
        return Err(FluxError::Quantization(format!(
            "\"{key}\": {} absmax codes do not fit {} nested blocks of {nested_blocksize} and a {}-entry map",
            codes.len(),
            nested_absmax.len(),
            nested_map.len()
        )));
    }

    let values: Vec<f32> = codes
        .iter()
        .enumerate()
        .map(|(i, &c)| nested_map[c as usize] * nested_absmax[i / nested_blocksize] + state.nested_offset)
        .collect();
    debug!("{key}: expanded {} compressed absmax values", values.len());
    Tensor::from_f32(DType::F32, vec![values.len()], &values)
}

fn nearest_code(x: f32) -> u8 {
    let mut best = 0usize;
    let mut best_dist = f32::INFINITY;
    for (i, c) in NF4_CODE.iter().enumerate() {
        let d = (x - c).abs();
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best as u8
}

fn is_excluded(module: &str, modules_to_not_convert: &HashSet<String>) -> bool {
    modules_to_not_convert.iter().any(|m| {
        module == m
            || module
                .strip_prefix(m.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

/// Convert every linear weight of `model` to NF4, except modules under a
/// path in `modules_to_not_convert`. Returns the number of layers converted.
///
/// Run this on an [`Init::Empty`](crate::nn::module::Init::Empty) skeleton:
/// converted layers then allocate their packed storage only when weights are
/// assigned by `load_state_dict`.
pub fn quantize_model_nf4<M: Module + ?Sized>(
    model: &mut M,
    modules_to_not_convert: &HashSet<String>,
    compute_dtype: DType,
) -> Result<usize> {
    let scheme = QuantScheme::Nf4 {
        blocksize: NF4_BLOCKSIZE,
        compute_dtype,
    };
    let mut converted = 0;
    for layer in model.layers_mut().iter_mut() {
        if !layer.is_linear() || is_excluded(layer.name(), modules_to_not_convert) {
            continue;
        }
        let key = format!("{}.weight", layer.name());
        if let Some(weight) = layer.param_mut("weight") {
            weight.quantize(&key, scheme)?;
            converted += 1;
        }
    }
    debug!("nf4: converted {converted} linear layers");
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::module::{Init, LayerBuilder, Layers, Storage};
    use crate::model::weights::StateDict;

    #[test]
    fn test_quantize_exact_codes() {
        // Values sitting on code points survive exactly.
        let values = [1.0, -1.0, 0.0, 0.5626170039176941, -0.39491748809814453, 0.0, 0.0, 0.0];
        let q = Nf4Tensor::quantize(&values, vec![2, 4], 64, DType::F32).unwrap();
        assert_eq!(q.absmax, vec![1.0]);
        assert_eq!(q.packed[0], 0xF0);
        let back = q.dequantize().unwrap().to_f32_vec().unwrap();
        for (a, b) in values.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_quantize_error_bounded() {
        let values: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.37).sin() * 3.0).collect();
        let q = Nf4Tensor::quantize(&values, vec![16, 16], 64, DType::F32).unwrap();
        assert_eq!(q.absmax.len(), 4);
        assert_eq!(q.packed.len(), 128);
        let back = q.dequantize().unwrap().to_f32_vec().unwrap();
        for (a, b) in values.iter().zip(back.iter()) {
            // Widest NF4 gap is ~0.30 of absmax (between -1.0 and -0.696).
            assert!((a - b).abs() <= 3.0 * 0.16, "{a} vs {b}");
        }
    }

    #[test]
    fn test_odd_length_and_zero_block() {
        let q = Nf4Tensor::quantize(&[0.0; 3], vec![3], 2, DType::F32).unwrap();
        assert_eq!(q.packed.len(), 2);
        assert_eq!(q.absmax, vec![0.0, 0.0]);
        assert_eq!(q.dequantize().unwrap().to_f32_vec().unwrap(), vec![0.0; 3]);
    }

    #[test]
    fn test_from_packed_validates_sizes() {
        let packed = Tensor::zeros(DType::U8, vec![3, 1]);
        let absmax = Tensor::zeros(DType::F32, vec![1]);
        assert!(Nf4Tensor::from_packed(vec![2, 4], &packed, &absmax, 64, DType::BF16).is_err());

        let packed = Tensor::zeros(DType::F32, vec![4]);
        assert!(Nf4Tensor::from_packed(vec![2, 4], &packed, &absmax, 64, DType::BF16).is_err());
    }

    struct Net {
        layers: Layers,
    }

    impl Module for Net {
        fn layers(&self) -> &Layers {
            &self.layers
        }

        fn layers_mut(&mut self) -> &mut Layers {
            &mut self.layers
        }
    }

    fn net(init: Init) -> Net {
        let mut b = LayerBuilder::new(init, DType::F32);
        b.scope("blocks", |b| {
            b.scope(0, |b| {
                b.linear("proj", 8, 8, true);
                b.rms_norm("norm", "scale", 8);
            });
            b.scope(1, |b| b.linear("proj", 8, 8, true));
        });
        b.linear("final", 8, 4, false);
        Net { layers: b.finish() }
    }

    #[test]
    fn test_exclusion_matches_path_prefix() {
        let mut model = net(Init::Empty);
        let skip: HashSet<String> = ["blocks.1".to_string(), "fin".to_string()].into();
        let converted = quantize_model_nf4(&mut model, &skip, DType::BF16).unwrap();
        assert_eq!(converted, 2);

        let layers = model.layers();
        assert!(layers.param("blocks.0.proj.weight").unwrap().scheme().is_some());
        assert!(layers.param("blocks.0.proj.bias").unwrap().scheme().is_none());
        assert!(layers.param("blocks.1.proj.weight").unwrap().scheme().is_none());
        assert!(layers.param("final.weight").unwrap().scheme().is_some());
        assert!(layers.param("blocks.0.norm.scale").unwrap().scheme().is_none());
    }

    #[test]
    fn test_empty_quantize_then_load_allocates_lazily() {
        let source = net(Init::Random { seed: 5 }).state_dict().unwrap();
        let full_bytes: usize = source.keys().map(|k| source.get(k).unwrap().nbytes()).sum();

        let mut model = net(Init::Empty);
        quantize_model_nf4(&mut model, &HashSet::new(), NF4_COMPUTE_DTYPE).unwrap();
        assert_eq!(model.layers().materialized_bytes(), 0);

        let report = model.load_state_dict(source).unwrap();
        assert!(report.is_clean());

        let weight = model.layers().param("blocks.0.proj.weight").unwrap();
        assert!(matches!(weight.storage(), Storage::Nf4(_)));
        assert_eq!(weight.dtype(), DType::BF16);
        assert!(model.layers().materialized_bytes() < full_bytes);
    }

    #[test]
    fn test_prequantized_checkpoint_round_trip() {
        let mut quantized = net(Init::Random { seed: 11 });
        quantize_model_nf4(&mut quantized, &HashSet::new(), NF4_COMPUTE_DTYPE).unwrap();
        let sd = quantized.state_dict().unwrap();
        assert_eq!(sd.get("final.weight").unwrap().dtype(), DType::U8);
        assert!(sd.contains("final.weight.absmax"));

        let mut model = net(Init::Empty);
        quantize_model_nf4(&mut model, &HashSet::new(), NF4_COMPUTE_DTYPE).unwrap();
        let report = model.load_state_dict(sd).unwrap();
        assert!(report.is_clean(), "{report:?}");

        let a = quantized.layers().param("final.weight").unwrap().storage().clone();
        let b = model.layers().param("final.weight").unwrap().storage().clone();
        match (a, b) {
            (Storage::Nf4(a), Storage::Nf4(b)) => assert_eq!(a, b),
            other => panic!("expected nf4 storage, got {other:?}"),
        }
    }

    fn linear_map() -> Tensor {
        let map: Vec<f32> = (0..256).map(|i| i as f32 / 255.0).collect();
        Tensor::from_f32(DType::F32, vec![256], &map).unwrap()
    }

    fn quant_state(json: &str) -> Tensor {
        Tensor::from_bytes(DType::U8, vec![json.len()], json.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn test_from_packed_rejects_integer_absmax() {
        let packed = Tensor::zeros(DType::U8, vec![4, 1]);
        let absmax = Tensor::full(DType::U8, vec![1], 200.0);
        assert!(matches!(
            Nf4Tensor::from_packed(vec![2, 4], &packed, &absmax, 64, DType::BF16),
            Err(FluxError::Quantization(_))
        ));
    }

    #[test]
    fn test_take_absmax_expands_nested_statistics() {
        let codes = Tensor::from_bytes(DType::U8, vec![3], vec![0, 51, 255]).unwrap();
        let mut aux: AHashMap<String, Tensor> = [
            ("w.absmax".to_string(), codes),
            ("w.nested_absmax".to_string(), Tensor::from_f32(DType::F32, vec![2], &[2.0, 4.0]).unwrap()),
            ("w.nested_quant_map".to_string(), linear_map()),
            (
                format!("w.{QUANT_STATE_SUFFIX}"),
                quant_state(r#"{"quant_type": "nf4", "nested_blocksize": 2, "nested_offset": 0.5}"#),
            ),
        ]
        .into_iter()
        .collect();

        let absmax = take_absmax("w", &mut aux).unwrap().to_f32_vec().unwrap();
        let expected = [0.5, 0.2 * 2.0 + 0.5, 4.0 + 0.5];
        for (a, b) in absmax.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
        assert!(aux.is_empty());
    }

    #[test]
    fn test_take_absmax_requires_nested_entries() {
        let mut aux: AHashMap<String, Tensor> = [
            ("w.absmax".to_string(), Tensor::full(DType::U8, vec![1], 200.0)),
            ("w.nested_absmax".to_string(), Tensor::full(DType::F32, vec![1], 1.0)),
        ]
        .into_iter()
        .collect();
        let err = take_absmax("w", &mut aux).unwrap_err();
        assert!(matches!(err, FluxError::Quantization(m) if m.contains("nested_quant_map")));
    }

    #[test]
    fn test_load_compressed_statistics() {
        let mut quantized = net(Init::Random { seed: 4 });
        quantize_model_nf4(&mut quantized, &HashSet::new(), NF4_COMPUTE_DTYPE).unwrap();
        let mut sd = quantized.state_dict().unwrap();
        let packed = sd.get("final.weight").unwrap().clone();

        // One block, absmax = map[255] * 0.75 + 0.25 = 1.0.
        sd.insert("final.weight.absmax", Tensor::full(DType::U8, vec![1], 255.0));
        sd.insert("final.weight.nested_absmax", Tensor::full(DType::F32, vec![1], 0.75));
        sd.insert("final.weight.nested_quant_map", linear_map());
        sd.insert("final.weight.quant_map", Tensor::from_f32(DType::F32, vec![16], &NF4_CODE).unwrap());
        sd.insert(
            format!("final.weight.{QUANT_STATE_SUFFIX}"),
            quant_state(r#"{"nested_blocksize": 256, "nested_offset": 0.25}"#),
        );

        let mut model = net(Init::Empty);
        quantize_model_nf4(&mut model, &HashSet::new(), NF4_COMPUTE_DTYPE).unwrap();
        let report = model.load_state_dict(sd).unwrap();
        assert!(report.is_clean(), "{report:?}");

        let one = Tensor::full(DType::F32, vec![1], 1.0);
        let expected = Nf4Tensor::from_packed(vec![4, 8], &packed, &one, NF4_BLOCKSIZE, NF4_COMPUTE_DTYPE).unwrap();
        match model.layers().param("final.weight").unwrap().storage() {
            Storage::Nf4(q) => assert_eq!(q, &expected),
            other => panic!("expected nf4 storage, got {other:?}"),
        }
    }

    #[test]
    fn test_packed_without_absmax_fails() {
        let mut model = net(Init::Empty);
        quantize_model_nf4(&mut model, &HashSet::new(), NF4_COMPUTE_DTYPE).unwrap();
        let mut sd = StateDict::new();
        sd.insert("final.weight", Tensor::zeros(DType::U8, vec![16, 1]));
        assert!(matches!(
            model.load_state_dict(sd),
            Err(FluxError::Quantization(_))
        ));
    }
}
