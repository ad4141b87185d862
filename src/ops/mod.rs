//! Reference operator math shared by the providers' kernels
//!
//! Functions here work on plain slices and shapes. Kernels copy their inputs
//! out of the arena, call into this module, and write the result to the
//! output tensor.

pub mod activation;
pub mod dispatch;
pub mod elementwise;
pub mod hardmax;
pub mod matmul;
pub mod zipmap;

pub use activation::{relu, scale, sigmoid, FloatElement};
pub use dispatch::{
    binary_into, binary_output_shape, copy_into, hardmax_into, matmul_into, matmul_output_shape,
    unary_into, BinaryOp, UnaryOp,
};
pub use elementwise::broadcast_binary;
pub use hardmax::{hardmax_axis, hardmax_coerced};
pub use matmul::{matmul, matmul_shape};
pub use zipmap::{zipmap, ClassLabels};
