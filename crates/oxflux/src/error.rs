use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::config::{BaseModelType, ModelFormat, ModelType, SubModelType};

#[derive(Error, Debug)]
pub enum FluxError {
    #[error("No loader registered for base={base}, type={model_type}, format={format}")]
    UnsupportedVariant {
        base: BaseModelType,
        model_type: ModelType,
        format: ModelFormat,
    },

    #[error("{loader} does not support submodel {}", display_submodel(.submodel))]
    UnsupportedSubPart {
        loader: &'static str,
        submodel: Option<SubModelType>,
    },

    #[error("{loader} expects a {expected} config, got {found}")]
    ConfigTypeMismatch {
        loader: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Failed to parse config {}: {reason}", .path.display())]
    ConfigParse { path: PathBuf, reason: String },

    #[error("Invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("Failed to read safetensors {}: {source}", .path.display())]
    SafeTensors {
        path: PathBuf,
        #[source]
        source: safetensors::SafeTensorError,
    },

    #[error("Shape mismatch for \"{name}\": expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Unsupported dtype: {0}")]
    UnsupportedDType(String),

    #[error("Quantization error: {0}")]
    Quantization(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Missing file: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{loader} failed to load {} from {}: {source}", display_submodel(.submodel), .path.display())]
    Load {
        loader: &'static str,
        submodel: Option<SubModelType>,
        path: PathBuf,
        #[source]
        source: Box<FluxError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FluxError {
    /// Map a failed read of `path`; a missing file becomes [`FluxError::MissingFile`].
    pub(crate) fn read(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::MissingFile(path.to_path_buf())
        } else {
            Self::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    /// The innermost error, looking through [`FluxError::Load`] context.
    pub fn root_cause(&self) -> &FluxError {
        match self {
            Self::Load { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn display_submodel(submodel: &Option<SubModelType>) -> String {
    match submodel {
        Some(s) => s.to_string(),
        None => "<none>".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, FluxError>;
