//! Concrete loaders for the FLUX model family.
//!
//! Every loader checks the config variant, then the requested sub-part,
//! before it touches the filesystem.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{FluxError, Result};
use crate::model::arch::resolve_params;
use crate::model::config::{AnyModelConfig, CheckpointConfig, DirectoryConfig, SubModelType};
use crate::model::pretrained::{PretrainedModel, TEXT_ENCODER_2_DIR, TOKENIZER_2_DIR};
use crate::model::weights::StateDict;
use crate::nn::autoencoder::{AutoEncoder, AutoEncoderParams};
use crate::nn::clip::ClipTextModel;
use crate::nn::flux::{Flux, FluxParams};
use crate::nn::module::{Init, Module};
use crate::nn::t5::T5EncoderModel;
use crate::quant::int8::QuantizedTransformersModel;
use crate::quant::nf4::{quantize_model_nf4, NF4_COMPUTE_DTYPE};
use crate::settings::LoaderConfig;
use crate::silence::SilenceWarnings;
use crate::tokenizer::{ClipTokenizer, T5Tokenizer, CLIP_MAX_LENGTH, T5_MAX_LENGTH};

/// A constructed model, owned by the caller.
pub enum AnyModel {
    Vae(AutoEncoder),
    Transformer(Flux),
    ClipTokenizer(ClipTokenizer),
    ClipTextEncoder(ClipTextModel),
    T5Tokenizer(T5Tokenizer),
    T5Encoder(T5EncoderModel),
    QuantizedT5Encoder(QuantizedTransformersModel<T5EncoderModel>),
}

impl AnyModel {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Vae(_) => "vae",
            Self::Transformer(_) => "transformer",
            Self::ClipTokenizer(_) => "clip_tokenizer",
            Self::ClipTextEncoder(_) => "clip_text_encoder",
            Self::T5Tokenizer(_) => "t5_tokenizer",
            Self::T5Encoder(_) => "t5_encoder",
            Self::QuantizedT5Encoder(_) => "quantized_t5_encoder",
        }
    }

    /// The weight container, for every variant that has one.
    pub fn as_module(&self) -> Option<&dyn Module> {
        match self {
            Self::Vae(m) => Some(m),
            Self::Transformer(m) => Some(m),
            Self::ClipTextEncoder(m) => Some(m),
            Self::T5Encoder(m) => Some(m),
            Self::QuantizedT5Encoder(m) => Some(m),
            Self::ClipTokenizer(_) | Self::T5Tokenizer(_) => None,
        }
    }
}

pub trait ModelLoader {
    fn name(&self) -> &'static str;

    fn load_model(&self, config: &AnyModelConfig, submodel: Option<SubModelType>) -> Result<AnyModel>;
}

fn config_mismatch(loader: &'static str, expected: &'static str, config: &AnyModelConfig) -> FluxError {
    FluxError::ConfigTypeMismatch {
        loader,
        expected,
        found: config.variant_name(),
    }
}

/// Attach the loader, sub-part and source path to an error raised after dispatch.
fn load_failed<'a>(
    loader: &'static str,
    submodel: Option<SubModelType>,
    path: &'a Path,
) -> impl FnOnce(FluxError) -> FluxError + 'a {
    move |source| FluxError::Load {
        loader,
        submodel,
        path: path.to_path_buf(),
        source: Box::new(source),
    }
}

fn load_checkpoint<M: Module>(model: &mut M, path: &Path) -> Result<()> {
    let sd = StateDict::load_file(path)?;
    let report = model.load_state_dict(sd)?;
    debug!(
        "{}: {} missing, {} unexpected keys",
        path.display(),
        report.missing_keys.len(),
        report.unexpected_keys.len()
    );
    Ok(())
}

/// FLUX VAE from a single-file checkpoint.
pub struct FluxVaeLoader {
    app_config: LoaderConfig,
}

impl FluxVaeLoader {
    pub fn new(app_config: &LoaderConfig) -> Self {
        Self {
            app_config: app_config.clone(),
        }
    }
}

impl FluxVaeLoader {
    fn load_from_single_file(&self, config: &CheckpointConfig) -> Result<AutoEncoder> {
        let params: AutoEncoderParams =
            resolve_params(&self.app_config.legacy_conf_path(), &config.config_path)?;
        debug!("vae params: {params:?}");

        let _silence = SilenceWarnings::new();
        let mut model = AutoEncoder::new(params, Init::Zeros)?;
        load_checkpoint(&mut model, &config.path)?;
        Ok(model)
    }
}

impl ModelLoader for FluxVaeLoader {
    fn name(&self) -> &'static str {
        "FluxVaeLoader"
    }

    fn load_model(&self, config: &AnyModelConfig, submodel: Option<SubModelType>) -> Result<AnyModel> {
        let AnyModelConfig::VaeCheckpoint(config) = config else {
            return Err(config_mismatch(self.name(), "VaeCheckpointConfig", config));
        };
        if !matches!(submodel, None | Some(SubModelType::Vae)) {
            return Err(FluxError::UnsupportedSubPart {
                loader: self.name(),
                submodel,
            });
        }

        let model = self
            .load_from_single_file(config)
            .map_err(load_failed(self.name(), submodel, &config.path))?;

        info!(
            "loaded FLUX VAE from {} ({} parameters)",
            config.path.display(),
            model.num_parameters()
        );
        Ok(AnyModel::Vae(model))
    }
}

/// FLUX transformer from a single-file checkpoint.
pub struct FluxCheckpointLoader {
    app_config: LoaderConfig,
}

impl FluxCheckpointLoader {
    pub fn new(app_config: &LoaderConfig) -> Self {
        Self {
            app_config: app_config.clone(),
        }
    }

    fn load_from_single_file(&self, config: &CheckpointConfig) -> Result<Flux> {
        let params: FluxParams = resolve_params(&self.app_config.legacy_conf_path(), &config.config_path)?;
        debug!("transformer params: {params:?}");

        let _silence = SilenceWarnings::new();
        let mut model = Flux::new(params, Init::Zeros)?;
        load_checkpoint(&mut model, &config.path)?;
        Ok(model)
    }
}

impl ModelLoader for FluxCheckpointLoader {
    fn name(&self) -> &'static str {
        "FluxCheckpointLoader"
    }

    fn load_model(&self, config: &AnyModelConfig, submodel: Option<SubModelType>) -> Result<AnyModel> {
        let AnyModelConfig::MainCheckpoint(config) = config else {
            return Err(config_mismatch(self.name(), "MainCheckpointConfig", config));
        };
        match submodel {
            Some(SubModelType::Transformer) => {
                let model = self
                    .load_from_single_file(config)
                    .map_err(load_failed(self.name(), submodel, &config.path))?;
                info!(
                    "loaded FLUX transformer from {} ({} parameters)",
                    config.path.display(),
                    model.num_parameters()
                );
                Ok(AnyModel::Transformer(model))
            }
            _ => Err(FluxError::UnsupportedSubPart {
                loader: self.name(),
                submodel,
            }),
        }
    }
}

/// FLUX transformer from a checkpoint, converted to NF4 before the weights land.
pub struct FluxBnbQuantizedNf4bLoader {
    app_config: LoaderConfig,
    modules_to_not_convert: HashSet<String>,
}

impl FluxBnbQuantizedNf4bLoader {
    pub fn new(app_config: &LoaderConfig) -> Self {
        Self {
            app_config: app_config.clone(),
            modules_to_not_convert: HashSet::new(),
        }
    }

    /// Keep the linear layers under these module paths at full precision.
    pub fn with_modules_to_not_convert<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules_to_not_convert = modules.into_iter().map(Into::into).collect();
        self
    }

    fn load_from_single_file(&self, config: &CheckpointConfig) -> Result<Flux> {
        let params: FluxParams = resolve_params(&self.app_config.legacy_conf_path(), &config.config_path)?;

        let _silence = SilenceWarnings::new();
        let mut model = Flux::new(params, Init::Empty)?;
        let converted = quantize_model_nf4(&mut model, &self.modules_to_not_convert, NF4_COMPUTE_DTYPE)?;
        debug!(
            "nf4 skeleton: {converted} layers converted, {} bytes materialized",
            model.layers().materialized_bytes()
        );
        load_checkpoint(&mut model, &config.path)?;
        Ok(model)
    }
}

impl ModelLoader for FluxBnbQuantizedNf4bLoader {
    fn name(&self) -> &'static str {
        "FluxBnbQuantizedNf4bLoader"
    }

    fn load_model(&self, config: &AnyModelConfig, submodel: Option<SubModelType>) -> Result<AnyModel> {
        let AnyModelConfig::MainBnbQuantized4bCheckpoint(config) = config else {
            return Err(config_mismatch(self.name(), "MainBnbQuantized4bCheckpointConfig", config));
        };
        match submodel {
            Some(SubModelType::Transformer) => {
                let model = self
                    .load_from_single_file(config)
                    .map_err(load_failed(self.name(), submodel, &config.path))?;
                info!(
                    "loaded NF4 FLUX transformer from {} ({} bytes)",
                    config.path.display(),
                    model.layers().materialized_bytes()
                );
                Ok(AnyModel::Transformer(model))
            }
            _ => Err(FluxError::UnsupportedSubPart {
                loader: self.name(),
                submodel,
            }),
        }
    }
}

/// CLIP tokenizer and text encoder from a pretrained directory.
pub struct ClipLoader;

impl ClipLoader {
    pub fn new(_app_config: &LoaderConfig) -> Self {
        Self
    }
}

impl ModelLoader for ClipLoader {
    fn name(&self) -> &'static str {
        "ClipLoader"
    }

    fn load_model(&self, config: &AnyModelConfig, submodel: Option<SubModelType>) -> Result<AnyModel> {
        let AnyModelConfig::ClipEmbedDiffusers(config) = config else {
            return Err(config_mismatch(self.name(), "ClipEmbedDiffusersConfig", config));
        };
        let model = match submodel {
            Some(SubModelType::Tokenizer) => {
                ClipTokenizer::from_pretrained(&config.path, CLIP_MAX_LENGTH).map(AnyModel::ClipTokenizer)
            }
            Some(SubModelType::TextEncoder) => {
                ClipTextModel::from_pretrained(&config.path).map(AnyModel::ClipTextEncoder)
            }
            _ => {
                return Err(FluxError::UnsupportedSubPart {
                    loader: self.name(),
                    submodel,
                })
            }
        };
        model.map_err(load_failed(self.name(), submodel, &config.path))
    }
}

/// Which T5 encoder construction path a [`T5EncoderLoader`] takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum T5Weights {
    Full,
    Int8,
}

/// T5 tokenizer and encoder from the `tokenizer_2` / `text_encoder_2`
/// subfolders of a bundle.
pub struct T5EncoderLoader {
    weights: T5Weights,
}

impl T5EncoderLoader {
    pub fn new(_app_config: &LoaderConfig) -> Self {
        Self {
            weights: T5Weights::Full,
        }
    }

    /// Loads the encoder through its qint8 quantization map.
    pub fn quantized(_app_config: &LoaderConfig) -> Self {
        Self {
            weights: T5Weights::Int8,
        }
    }

    fn directory<'a>(&self, config: &'a AnyModelConfig) -> Option<&'a DirectoryConfig> {
        match (self.weights, config) {
            (T5Weights::Full, AnyModelConfig::T5Encoder(c)) => Some(c),
            (T5Weights::Int8, AnyModelConfig::T5Encoder8b(c)) => Some(c),
            _ => None,
        }
    }
}

impl ModelLoader for T5EncoderLoader {
    fn name(&self) -> &'static str {
        match self.weights {
            T5Weights::Full => "T5EncoderLoader",
            T5Weights::Int8 => "T5Encoder8bLoader",
        }
    }

    fn load_model(&self, config: &AnyModelConfig, submodel: Option<SubModelType>) -> Result<AnyModel> {
        let Some(dir) = self.directory(config) else {
            let expected = match self.weights {
                T5Weights::Full => "T5EncoderConfig",
                T5Weights::Int8 => "T5Encoder8bConfig",
            };
            return Err(config_mismatch(self.name(), expected, config));
        };
        let (path, model) = match submodel {
            Some(SubModelType::Tokenizer2) => {
                let path = dir.path.join(TOKENIZER_2_DIR);
                let model = T5Tokenizer::from_pretrained(&path, T5_MAX_LENGTH).map(AnyModel::T5Tokenizer);
                (path, model)
            }
            Some(SubModelType::TextEncoder2) => {
                let path = dir.path.join(TEXT_ENCODER_2_DIR);
                let model = match self.weights {
                    T5Weights::Full => T5EncoderModel::from_pretrained(&path).map(AnyModel::T5Encoder),
                    T5Weights::Int8 => {
                        QuantizedTransformersModel::from_pretrained(&path).map(AnyModel::QuantizedT5Encoder)
                    }
                };
                (path, model)
            }
            _ => {
                return Err(FluxError::UnsupportedSubPart {
                    loader: self.name(),
                    submodel,
                })
            }
        };
        model.map_err(load_failed(self.name(), submodel, &path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::BaseModelType;
    use std::path::PathBuf;

    fn checkpoint(path: &str) -> CheckpointConfig {
        CheckpointConfig {
            key: "k".into(),
            name: "n".into(),
            path: PathBuf::from(path),
            base: BaseModelType::Flux,
            config_path: PathBuf::from("missing.yaml"),
        }
    }

    fn directory(path: &str) -> DirectoryConfig {
        DirectoryConfig {
            key: "k".into(),
            name: "n".into(),
            path: PathBuf::from(path),
            base: BaseModelType::Any,
        }
    }

    #[test]
    fn test_vae_config_to_transformer_loader() {
        let app = LoaderConfig::with_root("/nonexistent");
        let loader = FluxCheckpointLoader::new(&app);
        let config = AnyModelConfig::VaeCheckpoint(checkpoint("/nonexistent/ae.safetensors"));

        match loader.load_model(&config, Some(SubModelType::Transformer)) {
            Err(FluxError::ConfigTypeMismatch { expected, found, .. }) => {
                assert_eq!(expected, "MainCheckpointConfig");
                assert_eq!(found, "VaeCheckpointConfig");
            }
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(model) => panic!("unexpected model: {}", model.kind()),
        }
    }

    #[test]
    fn test_subpart_checked_before_io() {
        let app = LoaderConfig::with_root("/nonexistent");
        let config = AnyModelConfig::MainBnbQuantized4bCheckpoint(checkpoint("/nonexistent/f.safetensors"));
        let loader = FluxBnbQuantizedNf4bLoader::new(&app);
        assert!(matches!(
            loader.load_model(&config, None),
            Err(FluxError::UnsupportedSubPart { submodel: None, .. })
        ));

        let vae = FluxVaeLoader::new(&app);
        let config = AnyModelConfig::VaeCheckpoint(checkpoint("/nonexistent/ae.safetensors"));
        assert!(matches!(
            vae.load_model(&config, Some(SubModelType::Scheduler)),
            Err(FluxError::UnsupportedSubPart { .. })
        ));
    }

    #[test]
    fn test_t5_loaders_reject_each_others_configs() {
        let app = LoaderConfig::with_root("/nonexistent");
        let full = AnyModelConfig::T5Encoder(directory("/nonexistent/t5"));
        let int8 = AnyModelConfig::T5Encoder8b(directory("/nonexistent/t5"));

        assert!(matches!(
            T5EncoderLoader::quantized(&app).load_model(&full, Some(SubModelType::TextEncoder2)),
            Err(FluxError::ConfigTypeMismatch { expected: "T5Encoder8bConfig", .. })
        ));
        assert!(matches!(
            T5EncoderLoader::new(&app).load_model(&int8, Some(SubModelType::TextEncoder2)),
            Err(FluxError::ConfigTypeMismatch { expected: "T5EncoderConfig", .. })
        ));
        assert!(matches!(
            T5EncoderLoader::new(&app).load_model(&full, Some(SubModelType::TextEncoder)),
            Err(FluxError::UnsupportedSubPart { .. })
        ));
    }

    #[test]
    fn test_clip_rejects_tokenizer_2() {
        let app = LoaderConfig::with_root("/nonexistent");
        let config = AnyModelConfig::ClipEmbedDiffusers(directory("/nonexistent/clip"));
        assert!(matches!(
            ClipLoader::new(&app).load_model(&config, Some(SubModelType::Tokenizer2)),
            Err(FluxError::UnsupportedSubPart { loader: "ClipLoader", .. })
        ));
    }

    #[test]
    fn test_missing_legacy_config_is_parse_error() {
        let app = LoaderConfig::with_root("/nonexistent");
        let config = AnyModelConfig::MainCheckpoint(checkpoint("/nonexistent/f.safetensors"));
        let err = FluxCheckpointLoader::new(&app)
            .load_model(&config, Some(SubModelType::Transformer))
            .err()
            .unwrap();
        assert!(matches!(err.root_cause(), FluxError::ConfigParse { .. }));
    }

    #[test]
    fn test_missing_checkpoint_names_loader_subpart_and_path() {
        let root = tempfile::TempDir::new().unwrap();
        let app = LoaderConfig::with_root(root.path());
        std::fs::create_dir_all(app.legacy_conf_path()).unwrap();
        std::fs::write(
            app.legacy_conf_path().join("vae.yaml"),
            "params:\n  resolution: 32\n  in_channels: 3\n  ch: 4\n  out_ch: 3\n  ch_mult: [1, 2]\n  num_res_blocks: 1\n  z_channels: 2\n  scale_factor: 0.3611\n  shift_factor: 0.1159\n",
        )
        .unwrap();
        let mut ckpt = checkpoint("/nonexistent/absent.safetensors");
        ckpt.config_path = PathBuf::from("vae.yaml");
        let config = AnyModelConfig::VaeCheckpoint(ckpt);

        let err = FluxVaeLoader::new(&app)
            .load_model(&config, Some(SubModelType::Vae))
            .err()
            .unwrap();
        match &err {
            FluxError::Load { loader, submodel, path, source } => {
                assert_eq!(*loader, "FluxVaeLoader");
                assert_eq!(*submodel, Some(SubModelType::Vae));
                assert_eq!(path, &PathBuf::from("/nonexistent/absent.safetensors"));
                assert!(matches!(**source, FluxError::MissingFile(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let message = err.to_string();
        assert!(message.contains("/nonexistent/absent.safetensors"), "{message}");
        assert!(message.contains("vae"), "{message}");
    }
}
