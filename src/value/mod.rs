//! Runtime values held in the execution frame
//!
//! A [`Value`] carries exactly one datum: nothing (unallocated), a tensor, or
//! one of the non-tensor kinds. Replacing the datum drops the previous one,
//! which releases its buffer reference.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::provider::fence::{no_fence, FencePtr};
use crate::tensor::{DataType, Tensor};

/// Non-tensor value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NonTensorType {
    MapStringToFloat,
    MapInt64ToFloat,
    SequenceOfFloat,
}

impl NonTensorType {
    /// Construct an empty datum of this kind
    pub fn create(&self) -> NonTensorValue {
        match self {
            NonTensorType::MapStringToFloat => NonTensorValue::MapStringToFloat(BTreeMap::new()),
            NonTensorType::MapInt64ToFloat => NonTensorValue::MapInt64ToFloat(BTreeMap::new()),
            NonTensorType::SequenceOfFloat => NonTensorValue::SequenceOfFloat(Vec::new()),
        }
    }
}

/// Non-tensor datum
#[derive(Debug, Clone, PartialEq)]
pub enum NonTensorValue {
    MapStringToFloat(BTreeMap<String, f32>),
    MapInt64ToFloat(BTreeMap<i64, f32>),
    SequenceOfFloat(Vec<f32>),
}

impl NonTensorValue {
    pub fn value_type(&self) -> NonTensorType {
        match self {
            NonTensorValue::MapStringToFloat(_) => NonTensorType::MapStringToFloat,
            NonTensorValue::MapInt64ToFloat(_) => NonTensorType::MapInt64ToFloat,
            NonTensorValue::SequenceOfFloat(_) => NonTensorType::SequenceOfFloat,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            NonTensorValue::MapStringToFloat(m) => m.len(),
            NonTensorValue::MapInt64ToFloat(m) => m.len(),
            NonTensorValue::SequenceOfFloat(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Declared type of a graph value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Tensor(DataType),
    NonTensor(NonTensorType),
}

impl ValueType {
    pub fn is_tensor(&self) -> bool {
        matches!(self, ValueType::Tensor(_))
    }

    pub fn element_type(&self) -> Option<DataType> {
        match self {
            ValueType::Tensor(dtype) => Some(*dtype),
            ValueType::NonTensor(_) => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Tensor(dtype) => write!(f, "tensor({})", dtype),
            ValueType::NonTensor(kind) => write!(f, "{:?}", kind),
        }
    }
}

/// Datum stored in a value slot
#[derive(Debug, Clone, Default)]
pub enum ValueData {
    #[default]
    Unallocated,
    Tensor(Tensor),
    NonTensor(NonTensorValue),
}

/// One slot of the value store
#[derive(Clone)]
pub struct Value {
    data: ValueData,
    fence: FencePtr,
}

impl Default for Value {
    fn default() -> Self {
        Self {
            data: ValueData::Unallocated,
            fence: no_fence(),
        }
    }
}

impl Value {
    pub fn from_tensor(tensor: Tensor) -> Self {
        Self {
            data: ValueData::Tensor(tensor),
            fence: no_fence(),
        }
    }

    pub fn from_non_tensor(value: NonTensorValue) -> Self {
        Self {
            data: ValueData::NonTensor(value),
            fence: no_fence(),
        }
    }

    pub fn is_allocated(&self) -> bool {
        !matches!(self.data, ValueData::Unallocated)
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.data, ValueData::Tensor(_))
    }

    pub fn data(&self) -> &ValueData {
        &self.data
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match &self.data {
            ValueData::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn non_tensor(&self) -> Option<&NonTensorValue> {
        match &self.data {
            ValueData::NonTensor(v) => Some(v),
            _ => None,
        }
    }

    pub fn non_tensor_mut(&mut self) -> Option<&mut NonTensorValue> {
        match &mut self.data {
            ValueData::NonTensor(v) => Some(v),
            _ => None,
        }
    }

    /// Replace the datum; the previous one is dropped
    pub fn set_data(&mut self, data: ValueData) {
        self.data = data;
    }

    pub fn fence(&self) -> &FencePtr {
        &self.fence
    }

    pub fn set_fence(&mut self, fence: FencePtr) {
        self.fence = fence;
    }

    /// Copy of this value without its fence (what callers receive as output)
    pub fn detached(&self) -> Self {
        Self {
            data: self.data.clone(),
            fence: no_fence(),
        }
    }

    /// Back to the unallocated state with the no-op fence
    pub fn reset(&mut self) {
        self.data = ValueData::Unallocated;
        self.fence = no_fence();
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::from_tensor(tensor)
    }
}

impl From<NonTensorValue> for Value {
    fn from(value: NonTensorValue) -> Self {
        Value::from_non_tensor(value)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("data", &self.data)
            .field("fenced", &!self.fence.is_noop())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Allocator, AllocatorInfo, ArenaAllocator};

    #[test]
    fn test_default_is_unallocated() {
        let value = Value::default();
        assert!(!value.is_allocated());
        assert!(value.fence().is_noop());
        assert!(value.tensor().is_none());
    }

    #[test]
    fn test_non_tensor_constructors() {
        let map = NonTensorType::MapInt64ToFloat.create();
        assert!(map.is_empty());
        assert_eq!(map.value_type(), NonTensorType::MapInt64ToFloat);
        let seq = NonTensorType::SequenceOfFloat.create();
        assert_eq!(seq.value_type(), NonTensorType::SequenceOfFloat);
    }

    #[test]
    fn test_reset_drops_buffer() {
        let allocator = ArenaAllocator::new(AllocatorInfo::cpu());
        let tensor = Tensor::from_vec(&allocator, [4], &[1.0f32; 4]).unwrap();
        let mut value = Value::from_tensor(tensor);
        assert_eq!(allocator.stats().live_buffers, 1);

        value.reset();
        assert!(!value.is_allocated());
        assert_eq!(allocator.stats().live_buffers, 0);
    }

    #[test]
    fn test_value_type_display() {
        assert_eq!(ValueType::Tensor(DataType::F32).to_string(), "tensor(float32)");
        assert!(ValueType::Tensor(DataType::I64).is_tensor());
        assert_eq!(
            ValueType::NonTensor(NonTensorType::MapStringToFloat).element_type(),
            None
        );
    }
}
