use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{FluxError, Result};
use crate::model::weights::StateDict;
use crate::nn::module::{Init, Module};
use crate::silence::SilenceWarnings;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Subfolders of a multi-part bundle.
pub const TOKENIZER_2_DIR: &str = "tokenizer_2";
pub const TEXT_ENCODER_2_DIR: &str = "text_encoder_2";

#[derive(Debug, Deserialize)]
struct WeightsIndex {
    weight_map: BTreeMap<String, String>,
}

/// A network loadable from a pretrained directory
/// (`config.json` + `model.safetensors` or a sharded index).
pub trait PretrainedModel: Module + Sized {
    type Config: DeserializeOwned;

    const NAME: &'static str;

    fn from_config(config: Self::Config, init: Init) -> Result<Self>;

    /// Fill in entries the checkpoint stores only once, before the weights
    /// are assigned. Tied parameters end up sharing one buffer.
    fn tie_weights(&self, _weights: &mut StateDict) {}

    fn from_pretrained(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config: Self::Config = read_json(&dir.join(CONFIG_FILE))?;
        let mut model = Self::from_config(config, Init::Empty)?;
        let mut weights = load_pretrained_weights(dir)?;
        model.tie_weights(&mut weights);
        {
            let _silence = SilenceWarnings::new();
            model.load_state_dict(weights)?;
        }
        info!(
            "loaded {} from {} ({} parameters)",
            Self::NAME,
            dir.display(),
            model.num_parameters()
        );
        Ok(model)
    }
}

/// Parse a JSON file, reporting the path on failure.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(FluxError::MissingFile(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|e| FluxError::read(path, e))?;
    serde_json::from_str(&text).map_err(|e| FluxError::ConfigParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Read the safetensors weights of a pretrained directory, single-file or sharded.
pub fn load_pretrained_weights(dir: &Path) -> Result<StateDict> {
    let single = dir.join(WEIGHTS_FILE);
    if single.is_file() {
        return StateDict::load_file(&single);
    }

    let index_path = dir.join(WEIGHTS_INDEX_FILE);
    if !index_path.is_file() {
        return Err(FluxError::MissingFile(single));
    }
    let index: WeightsIndex = read_json(&index_path)?;
    let shards: BTreeSet<PathBuf> = index.weight_map.values().map(|f| dir.join(f)).collect();

    let mut sd = StateDict::new();
    for shard in &shards {
        sd.extend(StateDict::load_file(shard)?);
    }
    debug!("{}: {} shards, {} tensors", dir.display(), shards.len(), sd.len());
    Ok(sd)
}
