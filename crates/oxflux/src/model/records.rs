//! YAML-backed store of installed model records.
//!
//! ```yaml
//! models:
//!   - kind: vae_checkpoint
//!     key: flux-ae
//!     path: ae.safetensors
//!     config_path: flux/flux1-vae.yaml
//!   - kind: t5_encoder
//!     key: t5-xxl
//!     path: /opt/models/t5_bf16
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{FluxError, Result};
use crate::model::config::AnyModelConfig;
use crate::settings::LoaderConfig;

#[derive(Debug, Deserialize)]
struct RecordsFile {
    #[serde(default)]
    models: Vec<AnyModelConfig>,
}

#[derive(Debug, Default, Clone)]
pub struct ModelRecords {
    records: BTreeMap<String, AnyModelConfig>,
}

impl ModelRecords {
    /// Read records from `path`. Relative model paths are resolved against
    /// the models directory of `app_config`.
    pub fn from_yaml_file(path: impl AsRef<Path>, app_config: &LoaderConfig) -> Result<Self> {
        let path = path.as_ref();
        let parse_err = |reason: String| FluxError::ConfigParse {
            path: path.to_path_buf(),
            reason,
        };

        let text = std::fs::read_to_string(path).map_err(|e| parse_err(e.to_string()))?;
        let file: RecordsFile = serde_yaml::from_str(&text).map_err(|e| parse_err(e.to_string()))?;

        let models_path = app_config.models_path();
        let mut records = Self::default();
        for mut config in file.models {
            if config.path().is_relative() {
                let resolved = models_path.join(config.path());
                *config.path_mut() = resolved;
            }
            let key = config.key().to_string();
            if records.records.insert(key.clone(), config).is_some() {
                return Err(parse_err(format!("duplicate model key \"{key}\"")));
            }
        }

        debug!("{}: {} model records", path.display(), records.len());
        Ok(records)
    }

    pub fn get(&self, key: &str) -> Option<&AnyModelConfig> {
        self.records.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnyModelConfig> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
