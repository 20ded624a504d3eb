pub mod arch;
pub mod config;
pub mod loader;
pub mod pretrained;
pub mod records;
pub mod registry;
pub mod weights;

pub use config::{AnyModelConfig, BaseModelType, ModelFormat, ModelType, SubModelType};
pub use loader::{AnyModel, ModelLoader};
pub use registry::ModelLoaderRegistry;
pub use weights::StateDict;
