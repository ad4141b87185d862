//! Broadcasting element-wise binary operations

use crate::error::{ForgeError, ForgeResult};
use crate::tensor::TensorShape;

/// Row-major strides of `shape` aligned to `rank`, with 0 for broadcast axes
fn broadcast_strides(shape: &TensorShape, out: &TensorShape) -> Vec<usize> {
    let rank = out.rank();
    let offset = rank - shape.rank();
    let mut strides = vec![0; rank];
    let mut stride = 1;
    for axis in (0..shape.rank()).rev() {
        let dim = shape.dims()[axis];
        strides[axis + offset] = if dim == 1 { 0 } else { stride };
        stride *= dim;
    }
    strides
}

/// Apply `f` pairwise with numpy broadcasting
pub fn broadcast_binary<T, F>(
    a: &[T],
    a_shape: &TensorShape,
    b: &[T],
    b_shape: &TensorShape,
    f: F,
) -> ForgeResult<(Vec<T>, TensorShape)>
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    let out_shape = a_shape.broadcast(b_shape).ok_or_else(|| {
        ForgeError::InvalidArgument(format!(
            "shapes {} and {} cannot be broadcast",
            a_shape, b_shape
        ))
    })?;

    // Fast path: identical shapes
    if a_shape == b_shape {
        let out = a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect();
        return Ok((out, out_shape));
    }

    let a_strides = broadcast_strides(a_shape, &out_shape);
    let b_strides = broadcast_strides(b_shape, &out_shape);
    let dims = out_shape.dims();
    let total = out_shape.size();

    let mut out = Vec::with_capacity(total);
    let mut index = vec![0usize; dims.len()];
    for _ in 0..total {
        let a_off: usize = index.iter().zip(&a_strides).map(|(i, s)| i * s).sum();
        let b_off: usize = index.iter().zip(&b_strides).map(|(i, s)| i * s).sum();
        out.push(f(a[a_off], b[b_off]));

        for axis in (0..dims.len()).rev() {
            index[axis] += 1;
            if index[axis] < dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok((out, out_shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_shape() {
        let shape = TensorShape::new([3]);
        let (out, out_shape) =
            broadcast_binary(&[1.0f32, 2.0, 3.0], &shape, &[4.0, 5.0, 6.0], &shape, |x, y| x + y).unwrap();
        assert_eq!(out, vec![5.0, 7.0, 9.0]);
        assert_eq!(out_shape, shape);
    }

    #[test]
    fn test_row_broadcast() {
        let (out, shape) = broadcast_binary(
            &[1i32, 2, 3, 4, 5, 6],
            &TensorShape::new([2, 3]),
            &[10, 20, 30],
            &TensorShape::new([3]),
            |x, y| x + y,
        )
        .unwrap();
        assert_eq!(shape, TensorShape::new([2, 3]));
        assert_eq!(out, vec![11, 22, 33, 14, 25, 36]);
    }

    #[test]
    fn test_column_and_scalar_broadcast() {
        let (out, _) = broadcast_binary(
            &[1.0f32, 2.0],
            &TensorShape::new([2, 1]),
            &[10.0, 20.0, 30.0],
            &TensorShape::new([1, 3]),
            |x, y| x * y,
        )
        .unwrap();
        assert_eq!(out, vec![10.0, 20.0, 30.0, 20.0, 40.0, 60.0]);

        let (out, shape) = broadcast_binary(
            &[2.0f32],
            &TensorShape::scalar(),
            &[1.0, 2.0],
            &TensorShape::new([2]),
            |x, y| x - y,
        )
        .unwrap();
        assert_eq!(shape, TensorShape::new([2]));
        assert_eq!(out, vec![1.0, 0.0]);
    }

    #[test]
    fn test_incompatible_shapes() {
        let err = broadcast_binary(
            &[1.0f32, 2.0],
            &TensorShape::new([2]),
            &[1.0, 2.0, 3.0],
            &TensorShape::new([3]),
            |x, y| x + y,
        );
        assert!(matches!(err, Err(ForgeError::InvalidArgument(_))));
    }
}
