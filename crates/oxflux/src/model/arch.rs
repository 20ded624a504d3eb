//! Architecture metadata resolution.
//!
//! Checkpoint configs point at a YAML side file under the legacy config
//! root whose `params` mapping carries constructor arguments. Only the keys
//! a constructor declares are kept; everything else is dropped so documents
//! written for older or newer architectures still load.

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{FluxError, Result};

/// Constructor parameters of a network, deserializable from a `params` mapping.
pub trait ArchitectureParams: DeserializeOwned {
    /// Every field name the constructor accepts.
    const FIELDS: &'static [&'static str];
}

pub fn read_legacy_config(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|e| FluxError::ConfigParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_yaml::from_str(&text).map_err(|e| FluxError::ConfigParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Keep only the entries of `params` whose key is in `fields`, sorted by key.
pub fn filter_keys(params: &Mapping, fields: &[&str]) -> Mapping {
    let kept: BTreeMap<&str, &Value> = params
        .iter()
        .filter_map(|(k, v)| k.as_str().filter(|k| fields.contains(k)).map(|k| (k, v)))
        .collect();
    kept.into_iter()
        .map(|(k, v)| (Value::String(k.to_string()), v.clone()))
        .collect()
}

/// Build `P` from the `params` section of a parsed legacy config.
pub fn filter_params<P: ArchitectureParams>(doc: &Value, path: &Path) -> Result<P> {
    let params = doc
        .get("params")
        .and_then(Value::as_mapping)
        .ok_or_else(|| FluxError::ConfigParse {
            path: path.to_path_buf(),
            reason: "missing `params` mapping".to_string(),
        })?;

    let filtered = filter_keys(params, P::FIELDS);
    if filtered.len() != params.len() {
        debug!(
            "{}: dropped {} unknown params",
            path.display(),
            params.len() - filtered.len()
        );
    }

    serde_yaml::from_value(Value::Mapping(filtered)).map_err(|e| FluxError::ConfigParse {
        path: path.to_path_buf(),
        reason: format!("invalid params: {e}"),
    })
}

/// Read `<legacy_root>/<config_path>` and build `P` from it.
pub fn resolve_params<P: ArchitectureParams>(legacy_root: &Path, config_path: &Path) -> Result<P> {
    let path = legacy_root.join(config_path);
    let doc = read_legacy_config(&path)?;
    filter_params(&doc, &path)
}
