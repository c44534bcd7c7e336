//! Dynamically shaped tensors exchanged by name.

use crate::signature::ElementType;
use std::collections::BTreeMap;
use ndarray::ArrayD;

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
}

impl TensorData {
    pub fn element_type(&self) -> ElementType {
        match self {
            TensorData::I64(_) => ElementType::I64,
            TensorData::F32(_) => ElementType::F32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorData::I64(array) => array.shape(),
            TensorData::F32(array) => array.shape(),
        }
    }

    pub fn as_i64(&self) -> Option<&ArrayD<i64>> {
        match self {
            TensorData::I64(array) => Some(array),
            TensorData::F32(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            TensorData::F32(array) => Some(array),
            TensorData::I64(_) => None,
        }
    }

    pub fn into_f32(self) -> Option<ArrayD<f32>> {
        match self {
            TensorData::F32(array) => Some(array),
            TensorData::I64(_) => None,
        }
    }
}

pub type NamedTensors = BTreeMap<String, TensorData>;
