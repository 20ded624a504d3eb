use std::sync::OnceLock;

use ahash::AHashMap;
use tracing::debug;

use crate::error::{FluxError, Result};
use crate::model::config::{AnyModelConfig, BaseModelType, ModelFormat, ModelType};
use crate::model::loader::{
    ClipLoader, FluxBnbQuantizedNf4bLoader, FluxCheckpointLoader, FluxVaeLoader, ModelLoader, T5EncoderLoader,
};
use crate::settings::LoaderConfig;

pub type LoaderFactory = fn(&LoaderConfig) -> Box<dyn ModelLoader>;

type RegistryKey = (BaseModelType, ModelType, ModelFormat);

/// Maps (base, type, format) to the loader that handles it.
pub struct ModelLoaderRegistry {
    entries: AHashMap<RegistryKey, LoaderFactory>,
}

static REGISTRY: OnceLock<ModelLoaderRegistry> = OnceLock::new();

impl ModelLoaderRegistry {
    /// The built-in table, created on first use.
    pub fn global() -> &'static Self {
        REGISTRY.get_or_init(Self::builtin)
    }

    pub fn empty() -> Self {
        Self {
            entries: AHashMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut r = Self::empty();
        r.register(BaseModelType::Flux, ModelType::Vae, ModelFormat::Checkpoint, |c| {
            Box::new(FluxVaeLoader::new(c))
        });
        r.register(BaseModelType::Flux, ModelType::Main, ModelFormat::Checkpoint, |c| {
            Box::new(FluxCheckpointLoader::new(c))
        });
        r.register(BaseModelType::Flux, ModelType::Main, ModelFormat::BnbQuantizedNf4b, |c| {
            Box::new(FluxBnbQuantizedNf4bLoader::new(c))
        });
        r.register(BaseModelType::Any, ModelType::ClipEmbed, ModelFormat::Diffusers, |c| {
            Box::new(ClipLoader::new(c))
        });
        r.register(BaseModelType::Any, ModelType::T5Encoder, ModelFormat::T5Encoder, |c| {
            Box::new(T5EncoderLoader::new(c))
        });
        r.register(BaseModelType::Any, ModelType::T5Encoder, ModelFormat::T5Encoder8b, |c| {
            Box::new(T5EncoderLoader::quantized(c))
        });
        r
    }

    /// Register `factory`, replacing any previous entry for the same key.
    pub fn register(&mut self, base: BaseModelType, model_type: ModelType, format: ModelFormat, factory: LoaderFactory) {
        self.entries.insert((base, model_type, format), factory);
    }

    pub fn contains(&self, base: BaseModelType, model_type: ModelType, format: ModelFormat) -> bool {
        self.lookup(base, model_type, format).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact match first, then the base-agnostic entry.
    fn lookup(&self, base: BaseModelType, model_type: ModelType, format: ModelFormat) -> Option<LoaderFactory> {
        self.entries
            .get(&(base, model_type, format))
            .or_else(|| self.entries.get(&(BaseModelType::Any, model_type, format)))
            .copied()
    }

    /// Build the loader registered for `config`.
    pub fn get_implementation(&self, app_config: &LoaderConfig, config: &AnyModelConfig) -> Result<Box<dyn ModelLoader>> {
        let (base, model_type, format) = (config.base(), config.model_type(), config.format());
        let factory = self
            .lookup(base, model_type, format)
            .ok_or(FluxError::UnsupportedVariant {
                base,
                model_type,
                format,
            })?;
        let loader = factory(app_config);
        debug!("{}: {base}/{model_type}/{format} -> {}", config.key(), loader.name());
        Ok(loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_entries() {
        let r = ModelLoaderRegistry::builtin();
        assert_eq!(r.len(), 6);
        assert!(r.contains(BaseModelType::Flux, ModelType::Vae, ModelFormat::Checkpoint));
        assert!(!r.contains(BaseModelType::StableDiffusionXL, ModelType::Vae, ModelFormat::Checkpoint));
        assert!(!r.contains(BaseModelType::Flux, ModelType::Main, ModelFormat::Diffusers));
    }

    #[test]
    fn test_any_base_fallback() {
        let r = ModelLoaderRegistry::global();
        assert!(r.contains(BaseModelType::Flux, ModelType::T5Encoder, ModelFormat::T5Encoder8b));
        assert!(r.contains(BaseModelType::StableDiffusion1, ModelType::ClipEmbed, ModelFormat::Diffusers));
    }

    #[test]
    fn test_register_replaces() {
        let mut r = ModelLoaderRegistry::empty();
        assert!(r.is_empty());
        r.register(BaseModelType::Any, ModelType::Vae, ModelFormat::Checkpoint, |c| {
            Box::new(FluxVaeLoader::new(c))
        });
        r.register(BaseModelType::Any, ModelType::Vae, ModelFormat::Checkpoint, |c| {
            Box::new(FluxCheckpointLoader::new(c))
        });
        assert_eq!(r.len(), 1);
        assert!(r.contains(BaseModelType::Flux, ModelType::Vae, ModelFormat::Checkpoint));
    }
}
