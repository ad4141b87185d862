//! Tensor element types

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F64,
    F16,
    I32,
    I64,
    U8,
    Bool,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::F32,
        DataType::F64,
        DataType::F16,
        DataType::I32,
        DataType::I64,
        DataType::U8,
        DataType::Bool,
    ];

    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::F16 => 2,
            DataType::U8 | DataType::Bool => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64 | DataType::F16)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::F32 => "float32",
            DataType::F64 => "float64",
            DataType::F16 => "float16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::U8 => "uint8",
            DataType::Bool => "bool",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust scalar stored in a tensor buffer (little endian)
pub trait TensorElement: Copy + Send + Sync + fmt::Debug + PartialEq + 'static {
    const DTYPE: DataType;

    fn read_le(bytes: &[u8]) -> Self;

    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr) => {
        impl TensorElement for $ty {
            const DTYPE: DataType = $dtype;

            fn read_le(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(raw)
            }

            fn write_le(self, out: &mut [u8]) {
                out[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_element!(f32, DataType::F32);
impl_element!(f64, DataType::F64);
impl_element!(f16, DataType::F16);
impl_element!(i32, DataType::I32);
impl_element!(i64, DataType::I64);
impl_element!(u8, DataType::U8);

impl TensorElement for bool {
    const DTYPE: DataType = DataType::Bool;

    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write_le(self, out: &mut [u8]) {
        out[0] = self as u8;
    }
}
