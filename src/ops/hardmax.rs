//! Hardmax: 1 at the first maximum, 0 elsewhere
//!
//! Opset 1-12 coerces the input to 2-D at `axis` (`[prod(dims[..axis]),
//! prod(dims[axis..])]`) and takes the max over each row. Opset 13 takes the
//! max along the single axis `axis`.

use crate::error::{ForgeError, ForgeResult};
use crate::ops::activation::FloatElement;
use crate::tensor::TensorShape;

fn resolve_axis(shape: &TensorShape, axis: i64) -> ForgeResult<usize> {
    shape.normalize_axis(axis).ok_or_else(|| {
        ForgeError::InvalidArgument(format!("axis {} out of range for shape {}", axis, shape))
    })
}

/// Mark the first maximum of every run of `len` elements spaced `inner` apart
fn mark_max<T: FloatElement>(data: &[T], out: &mut [T], outer: usize, len: usize, inner: usize) {
    let one = T::from_f64(1.0);
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| o * len * inner + j * inner + i;
            let mut best = 0;
            for j in 1..len {
                if data[at(j)] > data[at(best)] {
                    best = j;
                }
            }
            if len > 0 {
                out[at(best)] = one;
            }
        }
    }
}

/// Opset 13+: along one axis
pub fn hardmax_axis<T: FloatElement>(data: &[T], shape: &TensorShape, axis: i64) -> ForgeResult<Vec<T>> {
    let axis = resolve_axis(shape, axis)?;
    let dims = shape.dims();
    let outer: usize = dims[..axis].iter().product();
    let len = dims[axis];
    let inner: usize = dims[axis + 1..].iter().product();

    let mut out = vec![T::from_f64(0.0); data.len()];
    mark_max(data, &mut out, outer, len, inner);
    Ok(out)
}

/// Opset 1-12: coerce to 2-D at `axis`
pub fn hardmax_coerced<T: FloatElement>(data: &[T], shape: &TensorShape, axis: i64) -> ForgeResult<Vec<T>> {
    let axis = resolve_axis(shape, axis)?;
    let dims = shape.dims();
    let rows: usize = dims[..axis].iter().product();
    let cols: usize = dims[axis..].iter().product();

    let mut out = vec![T::from_f64(0.0); data.len()];
    mark_max(data, &mut out, rows, cols, 1);
    Ok(out)
}
