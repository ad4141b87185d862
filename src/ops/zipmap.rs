//! ZipMap: pair class labels with scores into a map

use std::collections::BTreeMap;

use crate::error::{ForgeError, ForgeResult};
use crate::tensor::TensorShape;
use crate::value::NonTensorValue;

/// Class labels of a ZipMap node
#[derive(Debug, Clone, PartialEq)]
pub enum ClassLabels {
    Strings(Vec<String>),
    Ints(Vec<i64>),
}

impl ClassLabels {
    pub fn len(&self) -> usize {
        match self {
            ClassLabels::Strings(v) => v.len(),
            ClassLabels::Ints(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Zip one row of scores (`[C]` or `[1, C]`) with the labels
pub fn zipmap(scores: &[f32], shape: &TensorShape, labels: &ClassLabels) -> ForgeResult<NonTensorValue> {
    let classes = match shape.dims() {
        [c] => *c,
        [1, c] => *c,
        _ => {
            return Err(ForgeError::InvalidArgument(format!(
                "ZipMap expects scores of shape [C] or [1, C], got {}",
                shape
            )))
        }
    };
    if classes != labels.len() {
        return Err(ForgeError::InvalidArgument(format!(
            "ZipMap has {} labels for {} scores",
            labels.len(),
            classes
        )));
    }

    Ok(match labels {
        ClassLabels::Strings(names) => NonTensorValue::MapStringToFloat(
            names.iter().cloned().zip(scores.iter().copied()).collect::<BTreeMap<_, _>>(),
        ),
        ClassLabels::Ints(ids) => NonTensorValue::MapInt64ToFloat(
            ids.iter().copied().zip(scores.iter().copied()).collect::<BTreeMap<_, _>>(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_labels() {
        let labels = ClassLabels::Strings(vec!["cat".into(), "dog".into()]);
        let map = zipmap(&[0.25, 0.75], &TensorShape::new([1, 2]), &labels).unwrap();
        match map {
            NonTensorValue::MapStringToFloat(m) => {
                assert_eq!(m.get("cat"), Some(&0.25));
                assert_eq!(m.get("dog"), Some(&0.75));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_label_count_mismatch() {
        let labels = ClassLabels::Ints(vec![1, 2, 3]);
        assert!(zipmap(&[0.5, 0.5], &TensorShape::new([2]), &labels).is_err());
        assert!(zipmap(&[0.5; 4], &TensorShape::new([2, 2]), &labels).is_err());
    }
}
