//! Per-channel int8 weights and quantized pretrained-directory loading.
//!
//! A quantized pretrained directory is a regular one (`config.json` plus
//! safetensors weights) with an extra `quanto_qmap.json` naming the modules
//! whose weights are stored as `<module>.weight._data` (int8) and
//! `<module>.weight._scale` (one scale per output row).

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{FluxError, Result};
use crate::model::pretrained::{load_pretrained_weights, read_json, PretrainedModel, CONFIG_FILE};
use crate::nn::module::{Init, Layers, Module, QuantScheme};
use crate::nn::tensor::{numel, DType, Tensor};
use crate::silence::SilenceWarnings;

pub const QMAP_FILE: &str = "quanto_qmap.json";

const QINT8_MAX: f32 = 127.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Int8Tensor {
    data: Tensor,
    scale: Tensor,
}

impl Int8Tensor {
    /// Symmetric per-row quantization of a 2-d weight.
    pub fn quantize(values: &[f32], shape: Vec<usize>, scale_dtype: DType) -> Result<Self> {
        if shape.len() != 2 || values.len() != numel(&shape) {
            return Err(FluxError::Quantization(format!(
                "int8 quantization needs a 2-d weight matching {} values, got shape {shape:?}",
                values.len()
            )));
        }
        let (rows, cols) = (shape[0], shape[1]);

        let mut scales = Vec::with_capacity(rows);
        let mut q: Vec<i8> = Vec::with_capacity(values.len());
        for row in values.chunks(cols.max(1)).take(rows) {
            let max = row.iter().fold(0f32, |m, v| m.max(v.abs()));
            let scale = if max > 0.0 { max / QINT8_MAX } else { 1.0 };
            scales.push(scale);
            q.extend(
                row.iter()
                    .map(|&v| (v / scale).round().clamp(-QINT8_MAX, QINT8_MAX) as i8),
            );
        }

        let data = Tensor::from_bytes(DType::I8, shape, bytemuck::cast_slice::<i8, u8>(&q).to_vec())?;
        let scale = Tensor::from_f32(scale_dtype, vec![rows, 1], &scales)?;
        Ok(Self { data, scale })
    }

    pub fn from_parts(data: Tensor, scale: Tensor) -> Result<Self> {
        if data.dtype() != DType::I8 || data.shape().len() != 2 {
            return Err(FluxError::Quantization(format!(
                "int8 data must be a 2-d i8 tensor, got {:?} {}",
                data.shape(),
                data.dtype()
            )));
        }
        if !scale.dtype().is_float() || scale.numel() != data.shape()[0] {
            return Err(FluxError::Quantization(format!(
                "int8 scale {:?} {} does not match {} output rows",
                scale.shape(),
                scale.dtype(),
                data.shape()[0]
            )));
        }
        Ok(Self { data, scale })
    }

    pub fn dequantize(&self) -> Result<Tensor> {
        let cols = self.data.shape()[1];
        let scales = self.scale.to_f32_vec()?;
        let values: Vec<f32> = self
            .data
            .to_f32_vec()?
            .into_iter()
            .enumerate()
            .map(|(i, v)| v * scales[i / cols.max(1)])
            .collect();
        Tensor::from_f32(self.scale.dtype(), self.data.shape().to_vec(), &values)
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    pub fn nbytes(&self) -> usize {
        self.data.nbytes() + self.scale.nbytes()
    }
}

/// One entry of `quanto_qmap.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantizationSpec {
    pub weights: String,
    #[serde(default)]
    pub activations: Option<String>,
}

/// Convert the linear layers named in `qmap` to int8 storage.
pub fn requantize<M: Module + ?Sized>(
    model: &mut M,
    qmap: &BTreeMap<String, QuantizationSpec>,
    scale_dtype: DType,
) -> Result<()> {
    for (module, spec) in qmap {
        if spec.weights != "qint8" {
            return Err(FluxError::Quantization(format!(
                "{module}: unsupported weight type \"{}\"",
                spec.weights
            )));
        }
        if let Some(act) = spec.activations.as_deref().filter(|a| *a != "none") {
            return Err(FluxError::Quantization(format!(
                "{module}: activation quantization \"{act}\" is not supported"
            )));
        }

        let layer = model
            .layers_mut()
            .layer_mut(module)
            .filter(|l| l.is_linear())
            .ok_or_else(|| FluxError::Quantization(format!("no linear layer named \"{module}\"")))?;
        let key = format!("{module}.weight");
        if let Some(weight) = layer.param_mut("weight") {
            weight.quantize(&key, QuantScheme::Int8 { scale_dtype })?;
        }
    }
    debug!("int8: requantized {} modules", qmap.len());
    Ok(())
}

/// A pretrained model whose linear layers were saved as qint8.
pub struct QuantizedTransformersModel<M> {
    model: M,
}

impl<M: PretrainedModel> QuantizedTransformersModel<M> {
    pub fn from_pretrained(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config: M::Config = read_json(&dir.join(CONFIG_FILE))?;
        let qmap: BTreeMap<String, QuantizationSpec> = read_json(&dir.join(QMAP_FILE))?;

        let mut model = M::from_config(config, Init::Empty)?;
        requantize(&mut model, &qmap, DType::BF16)?;

        let mut weights = load_pretrained_weights(dir)?;
        model.tie_weights(&mut weights);
        {
            let _silence = SilenceWarnings::new();
            model.load_state_dict(weights)?;
        }

        info!(
            "loaded quantized {} from {} ({} int8 modules)",
            M::NAME,
            dir.display(),
            qmap.len()
        );
        Ok(Self { model })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_inner(self) -> M {
        self.model
    }
}

impl<M: Module> Module for QuantizedTransformersModel<M> {
    fn layers(&self) -> &Layers {
        self.model.layers()
    }

    fn layers_mut(&mut self) -> &mut Layers {
        self.model.layers_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::module::{LayerBuilder, Storage};

    #[test]
    fn test_quantize_per_row_scale() {
        let values = [1.0, -0.5, 0.25, 127.0, 0.0, -63.5];
        let q = Int8Tensor::quantize(&values, vec![2, 3], DType::F32).unwrap();
        assert_eq!(q.scale().to_f32_vec().unwrap(), vec![1.0 / 127.0, 1.0]);
        assert_eq!(q.data().to_f32_vec().unwrap(), vec![127.0, -64.0, 32.0, 127.0, 0.0, -64.0]);

        let back = q.dequantize().unwrap().to_f32_vec().unwrap();
        for (a, b) in values.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 0.5 + 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_from_parts_rejects_bad_scale() {
        let data = Tensor::zeros(DType::I8, vec![4, 2]);
        let scale = Tensor::zeros(DType::F32, vec![2, 1]);
        assert!(Int8Tensor::from_parts(data, scale).is_err());
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
        b.linear("q", 4, 4, false);
        b.linear("k", 4, 4, false);
        b.rms_norm("norm", "weight", 4);
        Net { layers: b.finish() }
    }

    fn qmap(entries: &[(&str, &str)]) -> BTreeMap<String, QuantizationSpec> {
        entries
            .iter()
            .map(|(m, w)| {
                (
                    m.to_string(),
                    QuantizationSpec {
                        weights: w.to_string(),
                        activations: Some("none".into()),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_requantize_then_load_quanto_layout() {
        let mut source = net(Init::Random { seed: 2 });
        requantize(&mut source, &qmap(&[("q", "qint8")]), DType::BF16).unwrap();
        let mut sd = source.state_dict().unwrap();
        assert!(sd.contains("q.weight._data"));
        assert!(sd.contains("q.weight._scale"));
        sd.insert("q.input_scale", Tensor::full(DType::F32, vec![], 1.0));

        let mut model = net(Init::Empty);
        requantize(&mut model, &qmap(&[("q", "qint8")]), DType::BF16).unwrap();
        assert_eq!(model.layers().materialized_bytes(), 0);

        let report = model.load_state_dict(sd).unwrap();
        assert!(report.is_clean(), "{report:?}");
        let q = model.layers().param("q.weight").unwrap();
        assert!(matches!(q.storage(), Storage::Int8(_)));
        assert_eq!(q.dtype(), DType::BF16);
        assert!(matches!(
            model.layers().param("k.weight").unwrap().storage(),
            Storage::Dense(_)
        ));
    }

    #[test]
    fn test_requantize_rejects_unknown_module() {
        let mut model = net(Init::Empty);
        let err = requantize(&mut model, &qmap(&[("norm", "qint8")]), DType::BF16).unwrap_err();
        assert!(matches!(err, FluxError::Quantization(_)));

        let err = requantize(&mut model, &qmap(&[("missing", "qint8")]), DType::BF16).unwrap_err();
        assert!(matches!(err, FluxError::Quantization(_)));
    }

    #[test]
    fn test_requantize_rejects_other_weight_types() {
        let mut model = net(Init::Empty);
        let err = requantize(&mut model, &qmap(&[("q", "qfloat8")]), DType::BF16).unwrap_err();
        assert!(matches!(err, FluxError::Quantization(_)));
    }
}
