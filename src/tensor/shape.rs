//! Tensor shapes

use std::fmt;

use serde::{Deserialize, Serialize};

/// Dimensions of a tensor. A rank-0 shape is a scalar with one element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape(Vec<usize>);

impl TensorShape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements (product of dimensions)
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.0.get(axis).copied()
    }

    /// Resolve a possibly negative axis against the rank
    pub fn normalize_axis(&self, axis: i64) -> Option<usize> {
        let rank = self.rank() as i64;
        let resolved = if axis < 0 { axis + rank } else { axis };
        (0..rank).contains(&resolved).then_some(resolved as usize)
    }

    /// Numpy-style broadcast of two shapes
    pub fn broadcast(&self, other: &TensorShape) -> Option<TensorShape> {
        let rank = self.rank().max(other.rank());
        let mut dims = vec![0; rank];
        for i in 0..rank {
            let a = self.from_back(rank - 1 - i);
            let b = other.from_back(rank - 1 - i);
            dims[i] = match (a, b) {
                (x, y) if x == y => x,
                (1, y) => y,
                (x, 1) => x,
                _ => return None,
            };
        }
        Some(TensorShape(dims))
    }

    fn from_back(&self, offset: usize) -> usize {
        if offset < self.rank() {
            self.0[self.rank() - 1 - offset]
        } else {
            1
        }
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for TensorShape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for TensorShape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
