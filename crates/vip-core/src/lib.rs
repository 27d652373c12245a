//! # vip-core
//!
//! Minimal tensor type and parameter trait shared by the vip crates.
//! CPU-only, f32-only, no autograd: models write their own backward passes.

pub mod error;
pub mod module;
pub mod shape;
pub mod tensor;

pub use error::CoreError;
pub use module::{grad_norm, Gradients, Module};
pub use shape::Shape;
pub use tensor::{argmax, softmax_in_place, Tensor};

pub type Result<T> = std::result::Result<T, CoreError>;
