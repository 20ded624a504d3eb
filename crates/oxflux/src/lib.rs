//! # oxflux
//!
//! Load FLUX model parts (VAE, transformer, CLIP and T5 text encoders and
//! their tokenizers) from single-file checkpoints, NF4-quantized checkpoints
//! and pretrained directories.
//!
//! ```no_run
//! use oxflux::{load_model, LoaderConfig, ModelRecords, SubModelType};
//!
//! # fn example() -> oxflux::Result<()> {
//! let app = LoaderConfig::from_yaml_file("oxflux.yaml")?;
//! let records = ModelRecords::from_yaml_file("models.yaml", &app)?;
//!
//! if let Some(config) = records.get("flux-dev") {
//!     let model = load_model(&app, config, Some(SubModelType::Transformer))?;
//!     println!("loaded {}", model.kind());
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod model;
pub mod nn;
pub mod quant;
pub mod settings;
pub mod silence;
pub mod tokenizer;

pub use error::{FluxError, Result};
pub use model::config::{AnyModelConfig, BaseModelType, ModelFormat, ModelType, SubModelType};
pub use model::loader::{AnyModel, ModelLoader};
pub use model::records::ModelRecords;
pub use model::registry::ModelLoaderRegistry;
pub use settings::LoaderConfig;
pub use silence::SilenceWarnings;
pub use tokenizer::{ClipTokenizer, T5Tokenizer};

/// Load `submodel` of the model described by `config` with the registered loader.
pub fn load_model(
    app_config: &LoaderConfig,
    config: &AnyModelConfig,
    submodel: Option<SubModelType>,
) -> Result<AnyModel> {
    ModelLoaderRegistry::global()
        .get_implementation(app_config, config)?
        .load_model(config, submodel)
}
