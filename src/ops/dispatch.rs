//! Typed dispatch from tensors to the slice functions
//!
//! Each `*_into` function copies its inputs out of their buffers, computes,
//! and writes the result into an already allocated output tensor. The output
//! may alias an input (in-place reuse): inputs are always read completely
//! before the output is written.

use std::ops::{Add, Mul, Sub};

use crate::error::{ForgeError, ForgeResult};
use crate::ops::activation::{relu, scale, sigmoid, FloatElement};
use crate::ops::elementwise::broadcast_binary;
use crate::ops::hardmax::{hardmax_axis, hardmax_coerced};
use crate::ops::matmul::{matmul, matmul_shape};
use crate::tensor::{DataType, Tensor, TensorElement, TensorShape};
use half::f16;

/// Element-wise binary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    pub fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::Mul => "Mul",
        }
    }

    fn apply<T>(self, x: T, y: T) -> T
    where
        T: Add<Output = T> + Sub<Output = T> + Mul<Output = T>,
    {
        match self {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
        }
    }
}

/// Element-wise unary float operator
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Scale(f32),
}

fn unsupported(op: &str, dtype: DataType) -> ForgeError {
    ForgeError::InvalidArgument(format!("{} does not support {}", op, dtype))
}

fn check_same_dtype(op: &str, a: &Tensor, b: &Tensor) -> ForgeResult<()> {
    if a.dtype() != b.dtype() {
        return Err(ForgeError::InvalidArgument(format!(
            "{} operands differ in type: {} and {}",
            op,
            a.dtype(),
            b.dtype()
        )));
    }
    Ok(())
}

/// Broadcast shape of a binary op
pub fn binary_output_shape(a: &Tensor, b: &Tensor) -> ForgeResult<TensorShape> {
    a.shape().broadcast(b.shape()).ok_or_else(|| {
        ForgeError::InvalidArgument(format!(
            "shapes {} and {} cannot be broadcast",
            a.shape(),
            b.shape()
        ))
    })
}

fn binary_typed<T>(op: BinaryOp, a: &Tensor, b: &Tensor, out: &Tensor) -> ForgeResult<()>
where
    T: TensorElement + Add<Output = T> + Sub<Output = T> + Mul<Output = T>,
{
    let lhs = a.to_vec::<T>()?;
    let rhs = b.to_vec::<T>()?;
    let (data, _) = broadcast_binary(&lhs, a.shape(), &rhs, b.shape(), |x, y| op.apply(x, y))?;
    out.write_from(&data)
}

/// `out = a <op> b` with broadcasting (f32, f64, i32, i64)
pub fn binary_into(op: BinaryOp, a: &Tensor, b: &Tensor, out: &Tensor) -> ForgeResult<()> {
    check_same_dtype(op.name(), a, b)?;
    match a.dtype() {
        DataType::F32 => binary_typed::<f32>(op, a, b, out),
        DataType::F64 => binary_typed::<f64>(op, a, b, out),
        DataType::I32 => binary_typed::<i32>(op, a, b, out),
        DataType::I64 => binary_typed::<i64>(op, a, b, out),
        other => Err(unsupported(op.name(), other)),
    }
}

fn unary_typed<T: FloatElement>(op: UnaryOp, x: &Tensor, out: &Tensor) -> ForgeResult<()> {
    let data = x.to_vec::<T>()?;
    let result = match op {
        UnaryOp::Relu => relu(&data),
        UnaryOp::Sigmoid => sigmoid(&data),
        UnaryOp::Scale(alpha) => scale(&data, alpha),
    };
    out.write_from(&result)
}

/// `out = op(x)` (f32, f64, f16)
pub fn unary_into(op: UnaryOp, x: &Tensor, out: &Tensor) -> ForgeResult<()> {
    match x.dtype() {
        DataType::F32 => unary_typed::<f32>(op, x, out),
        DataType::F64 => unary_typed::<f64>(op, x, out),
        DataType::F16 => unary_typed::<f16>(op, x, out),
        other => Err(unsupported(&format!("{:?}", op), other)),
    }
}

/// Output shape of MatMul
pub fn matmul_output_shape(a: &Tensor, b: &Tensor) -> ForgeResult<TensorShape> {
    matmul_shape(a.shape(), b.shape())
}

fn matmul_typed<T>(a: &Tensor, b: &Tensor, out: &Tensor) -> ForgeResult<()>
where
    T: TensorElement + Default + Add<Output = T> + Mul<Output = T>,
{
    let lhs = a.to_vec::<T>()?;
    let rhs = b.to_vec::<T>()?;
    let (data, _) = matmul(&lhs, a.shape(), &rhs, b.shape())?;
    out.write_from(&data)
}

/// `out = a × b` (f32, f64)
pub fn matmul_into(a: &Tensor, b: &Tensor, out: &Tensor) -> ForgeResult<()> {
    check_same_dtype("MatMul", a, b)?;
    match a.dtype() {
        DataType::F32 => matmul_typed::<f32>(a, b, out),
        DataType::F64 => matmul_typed::<f64>(a, b, out),
        other => Err(unsupported("MatMul", other)),
    }
}

fn hardmax_typed<T: FloatElement>(x: &Tensor, axis: i64, coerced: bool, out: &Tensor) -> ForgeResult<()> {
    let data = x.to_vec::<T>()?;
    let result = if coerced {
        hardmax_coerced(&data, x.shape(), axis)?
    } else {
        hardmax_axis(&data, x.shape(), axis)?
    };
    out.write_from(&result)
}

/// Hardmax along `axis`, or over the 2-D coercion at `axis` when `coerced`
pub fn hardmax_into(x: &Tensor, axis: i64, coerced: bool, out: &Tensor) -> ForgeResult<()> {
    match x.dtype() {
        DataType::F32 => hardmax_typed::<f32>(x, axis, coerced, out),
        DataType::F64 => hardmax_typed::<f64>(x, axis, coerced, out),
        DataType::F16 => hardmax_typed::<f16>(x, axis, coerced, out),
        other => Err(unsupported("Hardmax", other)),
    }
}

/// Byte copy between tensors of identical type and shape
pub fn copy_into(src: &Tensor, out: &Tensor) -> ForgeResult<()> {
    if src.dtype() != out.dtype() || src.shape() != out.shape() {
        return Err(ForgeError::InvalidArgument(format!(
            "cannot copy {} {} into {} {}",
            src.dtype(),
            src.shape(),
            out.dtype(),
            out.shape()
        )));
    }
    if src.shares_buffer_with(out) {
        return Ok(());
    }
    out.copy_from_bytes(&src.to_bytes())
}
