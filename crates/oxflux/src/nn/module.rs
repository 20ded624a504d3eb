use std::fmt;

use ahash::AHashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::error::{FluxError, Result};
use crate::model::weights::StateDict;
use crate::nn::tensor::{DType, Tensor};
use crate::quant::int8::Int8Tensor;
use crate::quant::nf4::{self, Nf4Tensor};
use crate::silence::notice;

/// How a skeleton's parameters get their initial storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Init {
    /// Shapes and dtypes only, no backing memory.
    Empty,
    /// Zero-filled weights, unit norm scales.
    Zeros,
    /// Seeded uniform weights, unit norm scales.
    Random { seed: u64 },
}

/// Backing storage of a [`Parameter`].
#[derive(Debug, Clone)]
pub enum Storage {
    Meta,
    Dense(Tensor),
    Nf4(Nf4Tensor),
    Int8(Int8Tensor),
}

/// Reduced-precision layout a parameter is stored in once materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantScheme {
    Nf4 { blocksize: usize, compute_dtype: DType },
    Int8 { scale_dtype: DType },
}

#[derive(Debug, Clone)]
pub struct Parameter {
    name: &'static str,
    shape: Vec<usize>,
    dtype: DType,
    storage: Storage,
    scheme: Option<QuantScheme>,
    /// Defaults to ones rather than zeros (norm scales).
    unit: bool,
}

impl Parameter {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Dtype of the dense tensor, or the compute dtype for quantized storage.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn scheme(&self) -> Option<QuantScheme> {
        self.scheme
    }

    pub fn is_materialized(&self) -> bool {
        !matches!(self.storage, Storage::Meta)
    }

    pub fn dense(&self) -> Option<&Tensor> {
        match &self.storage {
            Storage::Dense(t) => Some(t),
            _ => None,
        }
    }

    pub fn nbytes(&self) -> usize {
        match &self.storage {
            Storage::Meta => 0,
            Storage::Dense(t) => t.nbytes(),
            Storage::Nf4(q) => q.nbytes(),
            Storage::Int8(q) => q.nbytes(),
        }
    }

    /// Switch to a quantized layout. Dense storage is converted now,
    /// meta storage stays unallocated until weights are assigned.
    pub(crate) fn quantize(&mut self, key: &str, scheme: QuantScheme) -> Result<()> {
        if self.shape.len() != 2 {
            return Err(FluxError::Quantization(format!(
                "\"{key}\" has shape {:?}, only 2-d weights can be quantized",
                self.shape
            )));
        }
        self.storage = match std::mem::replace(&mut self.storage, Storage::Meta) {
            Storage::Meta => Storage::Meta,
            Storage::Dense(t) => quantize_dense(key, &t, scheme)?,
            already @ (Storage::Nf4(_) | Storage::Int8(_)) => already,
        };
        self.dtype = match scheme {
            QuantScheme::Nf4 { compute_dtype, .. } => compute_dtype,
            QuantScheme::Int8 { scale_dtype } => scale_dtype,
        };
        self.scheme = Some(scheme);
        Ok(())
    }

    /// Pull this parameter's tensors out of `sd`. Returns false when the
    /// checkpoint has nothing for it.
    fn take_from(&mut self, key: &str, sd: &mut StateDict) -> Result<bool> {
        match self.scheme {
            None => {
                let Some(tensor) = sd.remove(key) else {
                    return Ok(false);
                };
                self.check_shape(key, tensor.shape())?;
                // Assign: the loaded tensor replaces the skeleton's storage.
                self.dtype = tensor.dtype();
                self.storage = Storage::Dense(tensor);
                Ok(true)
            }
            Some(scheme @ QuantScheme::Nf4 { blocksize, compute_dtype }) => {
                let Some(tensor) = sd.remove(key) else {
                    return Ok(false);
                };
                if tensor.dtype() == DType::U8 {
                    let mut aux: AHashMap<String, Tensor> =
                        sd.drain_prefix(&format!("{key}.")).into_iter().collect();
                    let absmax = nf4::take_absmax(key, &mut aux)?;
                    self.storage = Storage::Nf4(Nf4Tensor::from_packed(
                        self.shape.clone(),
                        &tensor,
                        &absmax,
                        blocksize,
                        compute_dtype,
                    )?);
                    if !aux.is_empty() {
                        let mut rest: Vec<_> = aux.into_keys().collect();
                        rest.sort();
                        debug!("{key}: ignored {rest:?}");
                    }
                } else {
                    self.check_shape(key, tensor.shape())?;
                    self.storage = quantize_dense(key, &tensor, scheme)?;
                }
                Ok(true)
            }
            Some(scheme @ QuantScheme::Int8 { .. }) => {
                if let Some(tensor) = sd.remove(key) {
                    self.check_shape(key, tensor.shape())?;
                    self.storage = quantize_dense(key, &tensor, scheme)?;
                    return Ok(true);
                }
                let data_key = format!("{key}._data");
                let scale_key = format!("{key}._scale");
                let Some(data) = sd.remove(&data_key) else {
                    return Ok(false);
                };
                let scale = sd.remove(&scale_key).ok_or_else(|| {
                    FluxError::Quantization(format!("\"{data_key}\" has no matching _scale"))
                })?;
                self.check_shape(key, data.shape())?;
                self.dtype = scale.dtype();
                self.storage = Storage::Int8(Int8Tensor::from_parts(data, scale)?);
                Ok(true)
            }
        }
    }

    /// Allocate the default value for a parameter no checkpoint entry was
    /// assigned to. Quantized parameters are allocated in their quantized layout.
    fn materialize_default(&mut self, key: &str) -> Result<bool> {
        if self.is_materialized() {
            return Ok(false);
        }
        let value = if self.unit { 1.0 } else { 0.0 };
        let dense = Tensor::full(self.dtype, self.shape.clone(), value);
        self.storage = match self.scheme {
            None => Storage::Dense(dense),
            Some(scheme) => quantize_dense(key, &dense, scheme)?,
        };
        Ok(true)
    }

    fn check_shape(&self, key: &str, found: &[usize]) -> Result<()> {
        if found != self.shape.as_slice() {
            return Err(FluxError::ShapeMismatch {
                name: key.to_string(),
                expected: self.shape.clone(),
                found: found.to_vec(),
            });
        }
        Ok(())
    }

    fn export(&self, key: &str, sd: &mut StateDict) -> Result<()> {
        match &self.storage {
            Storage::Meta => {}
            Storage::Dense(t) => {
                sd.insert(key, t.clone());
            }
            Storage::Nf4(q) => {
                sd.insert(key, q.packed_tensor()?);
                sd.insert(format!("{key}.absmax"), q.absmax_tensor()?);
            }
            Storage::Int8(q) => {
                sd.insert(format!("{key}._data"), q.data().clone());
                sd.insert(format!("{key}._scale"), q.scale().clone());
            }
        }
        Ok(())
    }
}

fn quantize_dense(key: &str, tensor: &Tensor, scheme: QuantScheme) -> Result<Storage> {
    let values = tensor.to_f32_vec()?;
    let shape = tensor.shape().to_vec();
    let storage = match scheme {
        QuantScheme::Nf4 {
            blocksize,
            compute_dtype,
        } => Storage::Nf4(Nf4Tensor::quantize(&values, shape, blocksize, compute_dtype)?),
        QuantScheme::Int8 { scale_dtype } => {
            Storage::Int8(Int8Tensor::quantize(&values, shape, scale_dtype)?)
        }
    };
    debug!("quantized {key} ({} -> {:?})", tensor.dtype(), scheme);
    Ok(storage)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Linear {
        in_features: usize,
        out_features: usize,
    },
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    },
    GroupNorm {
        num_channels: usize,
    },
    LayerNorm {
        dim: usize,
    },
    RmsNorm {
        dim: usize,
    },
    Embedding {
        num_embeddings: usize,
        dim: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Layer {
    name: String,
    kind: LayerKind,
    params: Vec<Parameter>,
}

impl Layer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    pub(crate) fn param_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.name == name)
    }

    pub fn is_linear(&self) -> bool {
        matches!(self.kind, LayerKind::Linear { .. })
    }

    fn key(&self, param: &Parameter) -> String {
        format!("{}.{}", self.name, param.name)
    }
}

/// Outcome of a non-strict state dict overlay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Skeleton parameters the checkpoint did not provide.
    pub missing_keys: Vec<String>,
    /// Checkpoint entries with no matching parameter.
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

/// Ordered parameter table of a network skeleton.
#[derive(Debug, Clone, Default)]
pub struct Layers {
    layers: Vec<Layer>,
    index: AHashMap<String, usize>,
}

impl Layers {
    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.index.get(name).map(|&i| &self.layers[i])
    }

    pub(crate) fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.index.get(name).map(|&i| &mut self.layers[i])
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.layers.iter_mut()
    }

    /// Look up a parameter by its full dotted key.
    pub fn param(&self, key: &str) -> Option<&Parameter> {
        let (layer, name) = key.rsplit_once('.')?;
        self.layer(layer)?.param(name)
    }

    pub fn keys(&self) -> Vec<String> {
        self.layers
            .iter()
            .flat_map(|l| l.params.iter().map(move |p| l.key(p)))
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| l.params.iter())
            .map(|p| p.shape.iter().product::<usize>())
            .sum()
    }

    /// Bytes of storage actually allocated across all parameters.
    pub fn materialized_bytes(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| l.params.iter())
            .map(Parameter::nbytes)
            .sum()
    }

    /// Overlay `sd` onto the skeleton, tolerating missing and extra keys.
    /// Loaded tensors replace skeleton storage outright. A missing parameter
    /// keeps its skeleton value; on an empty skeleton it is allocated as
    /// zeros (ones for norm scales), so every parameter is materialized on return.
    pub fn load_state_dict(&mut self, mut sd: StateDict) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let mut defaulted = 0;

        for layer in &mut self.layers {
            let mut quantized_int8 = false;
            for i in 0..layer.params.len() {
                let key = layer.key(&layer.params[i]);
                let param = &mut layer.params[i];
                if !param.take_from(&key, &mut sd)? {
                    if param.materialize_default(&key)? {
                        defaulted += 1;
                    }
                    report.missing_keys.push(key);
                }
                quantized_int8 |= matches!(param.scheme, Some(QuantScheme::Int8 { .. }));
            }
            if quantized_int8 {
                sd.remove(&format!("{}.input_scale", layer.name));
                sd.remove(&format!("{}.output_scale", layer.name));
            }
        }

        report.unexpected_keys = sd.into_keys().collect();
        if defaulted > 0 {
            debug!("allocated defaults for {defaulted} unassigned parameters");
        }

        if !report.is_clean() {
            debug!(
                "missing keys: {:?}; unexpected keys: {:?}",
                report.missing_keys, report.unexpected_keys
            );
            notice!(
                "state dict mismatch: {} missing, {} unexpected keys",
                report.missing_keys.len(),
                report.unexpected_keys.len()
            );
        }

        Ok(report)
    }

    pub fn state_dict(&self) -> Result<StateDict> {
        let mut sd = StateDict::new();
        for layer in &self.layers {
            for p in &layer.params {
                p.export(&layer.key(p), &mut sd)?;
            }
        }
        Ok(sd)
    }
}

/// A network skeleton whose parameters can be overlaid from a checkpoint.
pub trait Module {
    fn layers(&self) -> &Layers;

    fn layers_mut(&mut self) -> &mut Layers;

    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<LoadReport> {
        self.layers_mut().load_state_dict(state_dict)
    }

    fn state_dict(&self) -> Result<StateDict> {
        self.layers().state_dict()
    }

    fn num_parameters(&self) -> usize {
        self.layers().num_parameters()
    }
}

enum Fill {
    Uniform(f32),
    Ones,
    Zeros,
}

/// Incrementally declares the layers of a skeleton under dotted scopes.
pub struct LayerBuilder {
    layers: Vec<Layer>,
    prefix: Vec<String>,
    init: Init,
    dtype: DType,
    rng: StdRng,
}

impl LayerBuilder {
    pub fn new(init: Init, dtype: DType) -> Self {
        let seed = match init {
            Init::Random { seed } => seed,
            _ => 0,
        };
        Self {
            layers: Vec::new(),
            prefix: Vec::new(),
            init,
            dtype,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Declare the layers added by `f` under `name.`.
    pub fn scope(&mut self, name: impl fmt::Display, f: impl FnOnce(&mut Self)) {
        self.prefix.push(name.to_string());
        f(self);
        self.prefix.pop();
    }

    pub fn linear(&mut self, name: impl fmt::Display, in_features: usize, out_features: usize, bias: bool) {
        let bound = 1.0 / (in_features as f32).sqrt();
        let mut params = vec![self.param("weight", vec![out_features, in_features], Fill::Uniform(bound))];
        if bias {
            params.push(self.param("bias", vec![out_features], Fill::Uniform(bound)));
        }
        self.push(
            name,
            LayerKind::Linear {
                in_features,
                out_features,
            },
            params,
        );
    }

    pub fn conv2d(&mut self, name: impl fmt::Display, in_channels: usize, out_channels: usize, kernel_size: usize) {
        let fan_in = in_channels * kernel_size * kernel_size;
        let bound = 1.0 / (fan_in as f32).sqrt();
        let params = vec![
            self.param(
                "weight",
                vec![out_channels, in_channels, kernel_size, kernel_size],
                Fill::Uniform(bound),
            ),
            self.param("bias", vec![out_channels], Fill::Uniform(bound)),
        ];
        self.push(
            name,
            LayerKind::Conv2d {
                in_channels,
                out_channels,
                kernel_size,
            },
            params,
        );
    }

    pub fn group_norm(&mut self, name: impl fmt::Display, num_channels: usize) {
        let params = vec![
            self.param("weight", vec![num_channels], Fill::Ones),
            self.param("bias", vec![num_channels], Fill::Zeros),
        ];
        self.push(name, LayerKind::GroupNorm { num_channels }, params);
    }

    pub fn layer_norm(&mut self, name: impl fmt::Display, dim: usize) {
        let params = vec![
            self.param("weight", vec![dim], Fill::Ones),
            self.param("bias", vec![dim], Fill::Zeros),
        ];
        self.push(name, LayerKind::LayerNorm { dim }, params);
    }

    /// RMS norm with a single learned vector named `param` ("scale" or "weight").
    pub fn rms_norm(&mut self, name: impl fmt::Display, param: &'static str, dim: usize) {
        let params = vec![self.param(param, vec![dim], Fill::Ones)];
        self.push(name, LayerKind::RmsNorm { dim }, params);
    }

    pub fn embedding(&mut self, name: impl fmt::Display, num_embeddings: usize, dim: usize) {
        let params = vec![self.param("weight", vec![num_embeddings, dim], Fill::Uniform(1.0))];
        self.push(
            name,
            LayerKind::Embedding {
                num_embeddings,
                dim,
            },
            params,
        );
    }

    pub fn finish(self) -> Layers {
        let index = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, l)| (l.name.clone(), i))
            .collect();
        Layers {
            layers: self.layers,
            index,
        }
    }

    fn param(&mut self, name: &'static str, shape: Vec<usize>, fill: Fill) -> Parameter {
        let unit = matches!(fill, Fill::Ones);
        let storage = match (self.init, fill) {
            (Init::Empty, _) => Storage::Meta,
            (_, Fill::Ones) => Storage::Dense(Tensor::full(self.dtype, shape.clone(), 1.0)),
            (Init::Zeros, _) | (_, Fill::Zeros) => Storage::Dense(Tensor::zeros(self.dtype, shape.clone())),
            (Init::Random { .. }, Fill::Uniform(bound)) => {
                Storage::Dense(Tensor::rand_uniform(self.dtype, shape.clone(), bound, &mut self.rng))
            }
        };
        Parameter {
            name,
            shape,
            dtype: self.dtype,
            storage,
            scheme: None,
            unit,
        }
    }

    fn push(&mut self, name: impl fmt::Display, kind: LayerKind, params: Vec<Parameter>) {
        let mut full = self.prefix.join(".");
        if !full.is_empty() {
            full.push('.');
        }
        full.push_str(&name.to_string());
        self.layers.push(Layer {
            name: full,
            kind,
            params,
        });
    }
}
