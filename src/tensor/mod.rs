//! Tensors, shapes and element types

pub mod dtype;
pub mod shape;
#[allow(clippy::module_inception)]
pub mod tensor;

pub use dtype::{DataType, TensorElement};
pub use shape::TensorShape;
pub use tensor::{required_bytes, Tensor};
