pub mod int8;
pub mod nf4;
