//! CPU matrix multiplication (row-major)

use std::ops::{Add, Mul};

use crate::error::{ForgeError, ForgeResult};
use crate::tensor::TensorShape;

/// Output shape of `A × B`, validating ranks, inner and batch dimensions
pub fn matmul_shape(a_shape: &TensorShape, b_shape: &TensorShape) -> ForgeResult<TensorShape> {
    if a_shape.rank() < 2 || b_shape.rank() < 2 {
        return Err(ForgeError::InvalidArgument(format!(
            "matmul needs rank >= 2 operands, got {} and {}",
            a_shape, b_shape
        )));
    }

    let a_dims = a_shape.dims();
    let b_dims = b_shape.dims();
    let (m, k) = (a_dims[a_dims.len() - 2], a_dims[a_dims.len() - 1]);
    let (kb, n) = (b_dims[b_dims.len() - 2], b_dims[b_dims.len() - 1]);
    if k != kb {
        return Err(ForgeError::InvalidArgument(format!(
            "matmul inner dimensions differ: {} x {}",
            a_shape, b_shape
        )));
    }

    let a_batch = &a_dims[..a_dims.len() - 2];
    let b_batch = &b_dims[..b_dims.len() - 2];
    if !b_batch.is_empty() && a_batch != b_batch {
        return Err(ForgeError::InvalidArgument(format!(
            "matmul batch dimensions differ: {} x {}",
            a_shape, b_shape
        )));
    }

    let mut out_dims = a_batch.to_vec();
    out_dims.extend([m, n]);
    Ok(TensorShape::new(out_dims))
}

/// `C = A × B`.
///
/// `A` is `[..., m, k]` (leading dimensions are batch), `B` is `[k, n]` or
/// has the same batch dimensions as `A`.
pub fn matmul<T>(a: &[T], a_shape: &TensorShape, b: &[T], b_shape: &TensorShape) -> ForgeResult<(Vec<T>, TensorShape)>
where
    T: Copy + Default + Add<Output = T> + Mul<Output = T>,
{
    let out_shape = matmul_shape(a_shape, b_shape)?;
    let a_dims = a_shape.dims();
    let (m, k) = (a_dims[a_dims.len() - 2], a_dims[a_dims.len() - 1]);
    let n = out_shape.dims()[out_shape.rank() - 1];
    let a_batch = &a_dims[..a_dims.len() - 2];
    let shared_b = b_shape.rank() == 2;

    let batches: usize = a_batch.iter().product();
    let mut out = vec![T::default(); batches * m * n];
    for batch in 0..batches {
        let a_base = batch * m * k;
        let b_base = if shared_b { 0 } else { batch * k * n };
        let c_base = batch * m * n;
        for i in 0..m {
            for p in 0..k {
                let a_ip = a[a_base + i * k + p];
                let b_row = &b[b_base + p * n..b_base + (p + 1) * n];
                let c_row = &mut out[c_base + i * n..c_base + (i + 1) * n];
                for (c, &b_pj) in c_row.iter_mut().zip(b_row) {
                    *c = *c + a_ip * b_pj;
                }
            }
        }
    }

    Ok((out, out_shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_2x3_by_3x2() {
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0];
        let (c, shape) = matmul(&a, &TensorShape::new([2, 3]), &b, &TensorShape::new([3, 2])).unwrap();
        assert_eq!(shape, TensorShape::new([2, 2]));
        assert_eq!(c, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_batched_with_shared_rhs() {
        let a = [1.0f64, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0];
        let b = [1.0f64, 2.0, 3.0, 4.0];
        let (c, shape) = matmul(&a, &TensorShape::new([2, 2, 2]), &b, &TensorShape::new([2, 2])).unwrap();
        assert_eq!(shape, TensorShape::new([2, 2, 2]));
        assert_eq!(c, vec![1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = matmul(&[1.0f32; 6], &TensorShape::new([2, 3]), &[1.0; 4], &TensorShape::new([2, 2]));
        assert!(matches!(err, Err(ForgeError::InvalidArgument(_))));
    }
}
