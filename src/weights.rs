//! Named parameter tensors and the stores that resolve a model id to them.
//!
//! A weight blob is JSON of the form
//! `{"tensors": {"kg_net.fc_in.0.linear_real.weight": {"shape": [18, 9], "data": [...]}, ...}}`,
//! with tensor data in row-major order and names following the state-dict
//! layout of the trained gain network.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{AecError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TensorMap {
    tensors: BTreeMap<String, Tensor>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Total number of scalar parameters across all tensors.
    pub fn num_params(&self) -> usize {
        self.tensors.values().map(Tensor::numel).sum()
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(io::BufReader::new(reader))?)
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn checked(&self, name: &str, expected: &[usize]) -> Result<&Tensor> {
        let tensor = self
            .get(name)
            .ok_or_else(|| AecError::MissingTensor(name.to_string()))?;
        if tensor.shape != expected {
            return Err(AecError::TensorShape {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.shape.clone(),
            });
        }
        let needed: usize = expected.iter().product();
        if tensor.data.len() != needed {
            return Err(AecError::TensorData {
                name: name.to_string(),
                expected: needed,
                actual: tensor.data.len(),
            });
        }
        Ok(tensor)
    }

    /// Fetches a row-major `[rows, cols]` tensor as a matrix.
    pub fn matrix(&self, name: &str, rows: usize, cols: usize) -> Result<DMatrix<f32>> {
        let tensor = self.checked(name, &[rows, cols])?;
        Ok(DMatrix::from_row_slice(rows, cols, &tensor.data))
    }

    /// Fetches a `[len]` tensor as a vector.
    pub fn vector(&self, name: &str, len: usize) -> Result<DVector<f32>> {
        let tensor = self.checked(name, &[len])?;
        Ok(DVector::from_column_slice(&tensor.data))
    }

    /// Fetches a single-element tensor.
    pub fn scalar(&self, name: &str) -> Result<f32> {
        Ok(self.checked(name, &[1])?.data[0])
    }
}

/// Resolves a weight-blob identifier to its tensors.
///
/// Loading the same id twice must yield the same tensors.
pub trait WeightStore {
    fn load(&self, id: &str) -> Result<TensorMap>;
}

/// Reads `<root>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonWeightStore {
    root: PathBuf,
}

impl JsonWeightStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Loads a blob from an explicit file path.
    pub fn load_file(path: &Path) -> Result<TensorMap> {
        match fs::File::open(path) {
            Ok(file) => TensorMap::from_json_reader(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(AecError::WeightsNotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl WeightStore for JsonWeightStore {
    fn load(&self, id: &str) -> Result<TensorMap> {
        Self::load_file(&self.path_for(id))
    }
}

impl WeightStore for HashMap<String, TensorMap> {
    fn load(&self, id: &str) -> Result<TensorMap> {
        self.get(id)
            .cloned()
            .ok_or_else(|| AecError::WeightsNotFound(id.to_string()))
    }
}
