use std::collections::BTreeMap;
use std::path::Path;

use safetensors::SafeTensors;
use tracing::debug;

use crate::error::{FluxError, Result};
use crate::nn::tensor::{DType, Tensor};

/// Flat mapping from dotted parameter name to tensor, as read from a checkpoint.
#[derive(Debug, Default, Clone)]
pub struct StateDict {
    tensors: BTreeMap<String, Tensor>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every tensor of a safetensors file into memory.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buffer = std::fs::read(path).map_err(|e| FluxError::read(path, e))?;
        let st = SafeTensors::deserialize(&buffer).map_err(|source| FluxError::SafeTensors {
            path: path.to_path_buf(),
            source,
        })?;

        let mut tensors = BTreeMap::new();
        for (name, view) in st.tensors() {
            let dtype = DType::try_from(view.dtype())?;
            let tensor = Tensor::from_bytes(dtype, view.shape().to_vec(), view.data().to_vec())?;
            tensors.insert(name, tensor);
        }

        debug!("{}: {} tensors", path.display(), tensors.len());
        Ok(Self { tensors })
    }

    /// Write all tensors to a safetensors file.
    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        safetensors::serialize_to_file(
            self.tensors.iter().map(|(k, v)| (k.as_str(), v)),
            &None,
            path,
        )
        .map_err(|source| FluxError::SafeTensors {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.tensors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn drain_prefix(&mut self, prefix: &str) -> Vec<(String, Tensor)> {
        let keys: Vec<String> = self
            .tensors
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| self.tensors.remove(&k).map(|t| (k, t)))
            .collect()
    }

    /// Move all tensors of `other` into `self`; later shards win on collision.
    pub fn extend(&mut self, other: StateDict) {
        self.tensors.extend(other.tensors);
    }

    pub fn into_keys(self) -> impl Iterator<Item = String> {
        self.tensors.into_keys()
    }
}

impl FromIterator<(String, Tensor)> for StateDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.safetensors");

        let mut sd = StateDict::new();
        sd.insert("a.weight", Tensor::from_f32(DType::F32, vec![2], &[1.0, 2.0]).unwrap());
        sd.insert("a.bias", Tensor::zeros(DType::BF16, vec![3]));
        sd.save_file(&path).unwrap();

        let loaded = StateDict::load_file(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("a.bias").unwrap().dtype(), DType::BF16);
        assert_eq!(
            loaded.get("a.weight").unwrap().to_f32_vec().unwrap(),
            vec![1.0, 2.0]
        );
    }

    #[test]
    fn test_load_corrupt_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.safetensors");
        std::fs::write(&path, b"definitely not safetensors").unwrap();

        match StateDict::load_file(&path) {
            Err(FluxError::SafeTensors { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected SafeTensors error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = StateDict::load_file("/nonexistent/model.safetensors").unwrap_err();
        assert!(matches!(&err, FluxError::MissingFile(p) if p.ends_with("model.safetensors")));
        assert!(err.to_string().contains("/nonexistent/model.safetensors"));
    }

    #[test]
    fn test_load_unreadable_path_names_path() {
        let dir = TempDir::new().unwrap();
        let err = StateDict::load_file(dir.path()).unwrap_err();
        assert!(err.to_string().contains(&dir.path().display().to_string()), "{err}");
    }

    #[test]
    fn test_drain_prefix() {
        let mut sd = StateDict::new();
        sd.insert("x.weight", Tensor::zeros(DType::U8, vec![1]));
        sd.insert("x.weight.absmax", Tensor::zeros(DType::F32, vec![1]));
        sd.insert("x.weight.quant_map", Tensor::zeros(DType::F32, vec![16]));
        sd.insert("y.weight", Tensor::zeros(DType::F32, vec![1]));

        let drained = sd.drain_prefix("x.weight.");
        assert_eq!(drained.len(), 2);
        assert!(sd.contains("x.weight"));
        assert!(sd.contains("y.weight"));
    }
}
