use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FluxError, Result};

/// Environment variable overriding the default root directory.
pub const ROOT_ENV: &str = "OXFLUX_ROOT";

/// Application-level paths the loaders resolve against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub root: PathBuf,
    /// Directory of legacy architecture YAML files. Relative to `root` unless absolute.
    pub legacy_conf_dir: PathBuf,
    /// Directory model record paths are relative to. Relative to `root` unless absolute.
    pub models_dir: PathBuf,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::with_root(default_root())
    }
}

fn default_root() -> PathBuf {
    if let Some(root) = std::env::var_os(ROOT_ENV) {
        return PathBuf::from(root);
    }
    dirs::data_dir()
        .map(|d| d.join("oxflux"))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl LoaderConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            legacy_conf_dir: PathBuf::from("configs"),
            models_dir: PathBuf::from("models"),
        }
    }

    /// Read a YAML config file. Absent fields keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| FluxError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).map_err(|e| FluxError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn legacy_conf_path(&self) -> PathBuf {
        self.root.join(&self.legacy_conf_dir)
    }

    pub fn models_path(&self) -> PathBuf {
        self.root.join(&self.models_dir)
    }
}
