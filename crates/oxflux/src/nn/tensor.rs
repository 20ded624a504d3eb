use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use half::{bf16, f16};
use rand::Rng;
use safetensors::{Dtype, View};

use crate::error::{FluxError, Result};

/// Element type of a [`Tensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    U8,
    I8,
    I16,
    I32,
    I64,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::I16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Bool => "bool",
            DType::U8 => "u8",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        f.write_str(s)
    }
}

impl TryFrom<Dtype> for DType {
    type Error = FluxError;

    fn try_from(dtype: Dtype) -> Result<Self> {
        match dtype {
            Dtype::BOOL => Ok(DType::Bool),
            Dtype::U8 => Ok(DType::U8),
            Dtype::I8 => Ok(DType::I8),
            Dtype::I16 => Ok(DType::I16),
            Dtype::I32 => Ok(DType::I32),
            Dtype::I64 => Ok(DType::I64),
            Dtype::F16 => Ok(DType::F16),
            Dtype::BF16 => Ok(DType::BF16),
            Dtype::F32 => Ok(DType::F32),
            Dtype::F64 => Ok(DType::F64),
            other => Err(FluxError::UnsupportedDType(format!("{other:?}"))),
        }
    }
}

impl From<DType> for Dtype {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::Bool => Dtype::BOOL,
            DType::U8 => Dtype::U8,
            DType::I8 => Dtype::I8,
            DType::I16 => Dtype::I16,
            DType::I32 => Dtype::I32,
            DType::I64 => Dtype::I64,
            DType::F16 => Dtype::F16,
            DType::BF16 => Dtype::BF16,
            DType::F32 => Dtype::F32,
            DType::F64 => Dtype::F64,
        }
    }
}

/// Dense host tensor: little-endian element bytes plus shape and dtype.
/// Clones share the byte buffer.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Arc<[u8]>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("nbytes", &self.data.len())
            .finish()
    }
}

impl Tensor {
    pub fn from_bytes(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = numel(&shape) * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(FluxError::InvalidArchitecture(format!(
                "tensor of shape {shape:?} ({dtype}) needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            data: data.into(),
        })
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let data = vec![0u8; numel(&shape) * dtype.size_in_bytes()];
        Self {
            dtype,
            shape,
            data: data.into(),
        }
    }

    pub fn full(dtype: DType, shape: Vec<usize>, value: f32) -> Self {
        if !dtype.is_float() {
            let mut data = vec![0u8; numel(&shape) * dtype.size_in_bytes()];
            if dtype.size_in_bytes() == 1 {
                data.fill(value as u8);
            }
            return Self {
                dtype,
                shape,
                data: data.into(),
            };
        }
        let values = vec![value; numel(&shape)];
        Self {
            dtype,
            data: encode_f32(&values, dtype).into(),
            shape,
        }
    }

    /// Uniform values in `[-bound, bound)`. Non-float dtypes are zero-filled.
    pub fn rand_uniform<R: Rng>(dtype: DType, shape: Vec<usize>, bound: f32, rng: &mut R) -> Self {
        if !dtype.is_float() || bound <= 0.0 {
            return Self::zeros(dtype, shape);
        }
        let values: Vec<f32> = (0..numel(&shape))
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        Self {
            dtype,
            data: encode_f32(&values, dtype).into(),
            shape,
        }
    }

    pub fn from_f32(dtype: DType, shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        if values.len() != numel(&shape) {
            return Err(FluxError::ShapeMismatch {
                name: "<from_f32>".to_string(),
                expected: shape,
                found: vec![values.len()],
            });
        }
        if !dtype.is_float() {
            return Err(FluxError::UnsupportedDType(format!(
                "cannot encode f32 values as {dtype}"
            )));
        }
        Ok(Self {
            dtype,
            data: encode_f32(values, dtype).into(),
            shape,
        })
    }

    /// Decode to f32. Integer dtypes are widened, bool/i64 are rejected.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let n = self.numel();
        let out = match self.dtype {
            DType::F32 => {
                let mut out = vec![0f32; n];
                LittleEndian::read_f32_into(&self.data, &mut out);
                out
            }
            DType::F64 => {
                let mut wide = vec![0f64; n];
                LittleEndian::read_f64_into(&self.data, &mut wide);
                wide.into_iter().map(|v| v as f32).collect()
            }
            DType::F16 => self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_bits(LittleEndian::read_u16(c)).to_f32())
                .collect(),
            DType::BF16 => self
                .data
                .chunks_exact(2)
                .map(|c| bf16::from_bits(LittleEndian::read_u16(c)).to_f32())
                .collect(),
            DType::I8 => bytemuck::cast_slice::<u8, i8>(&self.data[..])
                .iter()
                .map(|&v| v as f32)
                .collect(),
            DType::U8 => self.data.iter().map(|&v| v as f32).collect(),
            DType::I16 => {
                let mut out = vec![0i16; n];
                LittleEndian::read_i16_into(&self.data, &mut out);
                out.into_iter().map(|v| v as f32).collect()
            }
            DType::I32 => {
                let mut out = vec![0i32; n];
                LittleEndian::read_i32_into(&self.data, &mut out);
                out.into_iter().map(|v| v as f32).collect()
            }
            DType::Bool | DType::I64 => {
                return Err(FluxError::UnsupportedDType(format!(
                    "cannot decode {} as f32",
                    self.dtype
                )))
            }
        };
        Ok(out)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// True when both tensors read the same buffer.
    pub fn shares_data(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl View for &Tensor {
    fn dtype(&self) -> Dtype {
        self.dtype.into()
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data[..])
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

pub(crate) fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

pub(crate) fn encode_f32(values: &[f32], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::F16 => values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_bits().to_le_bytes())
            .collect(),
        DType::BF16 => values
            .iter()
            .flat_map(|&v| bf16::from_f32(v).to_bits().to_le_bytes())
            .collect(),
        DType::F64 => values
            .iter()
            .flat_map(|&v| (v as f64).to_le_bytes())
            .collect(),
        _ => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}
