pub mod autoencoder;
pub mod clip;
pub mod flux;
pub mod module;
pub mod t5;
pub mod tensor;

pub use module::{Init, LoadReport, Module};
pub use tensor::{DType, Tensor};
