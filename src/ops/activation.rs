//! Unary float activations

use half::f16;

use crate::tensor::TensorElement;

/// Floating point element that round-trips through `f64`
pub trait FloatElement: TensorElement + PartialOrd {
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

impl FloatElement for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl FloatElement for f64 {
    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

impl FloatElement for f16 {
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

pub fn relu<T: FloatElement>(data: &[T]) -> Vec<T> {
    let zero = T::from_f64(0.0);
    data.iter()
        .map(|&x| if x > zero { x } else { zero })
        .collect()
}

pub fn sigmoid<T: FloatElement>(data: &[T]) -> Vec<T> {
    data.iter()
        .map(|&x| T::from_f64(1.0 / (1.0 + (-x.to_f64()).exp())))
        .collect()
}

/// `alpha * x`
pub fn scale<T: FloatElement>(data: &[T], alpha: f32) -> Vec<T> {
    let alpha = alpha as f64;
    data.iter()
        .map(|&x| T::from_f64(x.to_f64() * alpha))
        .collect()
}
