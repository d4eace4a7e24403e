//! Tensor abstractions for specbatch
//!
//! Executors exchange fixed-shape host arrays: `int64` ids, positions and
//! batch indices going in, floating point logits coming out. Tensors here are
//! plain row-major host buffers addressed by name through [`NamedTensors`].

use crate::config::DataType;
use crate::error::{Error, Result};
use crate::types::TokenId;
use half::f16;
use std::collections::BTreeMap;

/// Tensor shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    /// Get the number of dimensions
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Get the dimensions
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Get a specific dimension
    pub fn dim(&self, index: usize) -> usize {
        self.0[index]
    }

    /// Get the total number of elements
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Check if the shape is empty (has zero elements)
    pub fn is_empty(&self) -> bool {
        self.0.iter().any(|&d| d == 0)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self::new(dims.to_vec())
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", dim)?;
        }
        write!(f, "]")
    }
}

/// Typed backing storage
#[derive(Debug, Clone, PartialEq)]
enum Storage {
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float16(Vec<f16>),
}

impl Storage {
    fn dtype(&self) -> DataType {
        match self {
            Storage::Int64(_) => DataType::Int64,
            Storage::Float32(_) => DataType::Float32,
            Storage::Float16(_) => DataType::Float16,
        }
    }
}

/// A fixed-shape, row-major host tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    /// Shape of the tensor
    shape: Shape,

    /// Element storage
    storage: Storage,
}

impl Tensor {
    /// Create a new tensor with zeros
    pub fn zeros(shape: impl Into<Shape>, dtype: DataType) -> Self {
        let shape = shape.into();
        let n = shape.numel();
        let storage = match dtype {
            DataType::Int64 => Storage::Int64(vec![0; n]),
            DataType::Float32 => Storage::Float32(vec![0.0; n]),
            DataType::Float16 => Storage::Float16(vec![f16::ZERO; n]),
        };
        Self { shape, storage }
    }

    /// Create an `int64` tensor filled with a single value
    pub fn full_i64(shape: impl Into<Shape>, value: i64) -> Self {
        let shape = shape.into();
        let n = shape.numel();
        Self {
            shape,
            storage: Storage::Int64(vec![value; n]),
        }
    }

    /// Create an `int64` tensor from owned values
    pub fn from_i64(data: Vec<i64>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        check_len(data.len(), &shape)?;
        Ok(Self {
            shape,
            storage: Storage::Int64(data),
        })
    }

    /// Create a tensor from a slice of f32 values
    pub fn from_f32(data: &[f32], shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        check_len(data.len(), &shape)?;
        Ok(Self {
            shape,
            storage: Storage::Float32(data.to_vec()),
        })
    }

    /// Create a tensor from a slice of f16 values
    pub fn from_f16(data: &[f16], shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        check_len(data.len(), &shape)?;
        Ok(Self {
            shape,
            storage: Storage::Float16(data.to_vec()),
        })
    }

    /// Get the shape
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Get the dimensions
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Get the number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Get the total number of elements
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Get the data type
    pub fn dtype(&self) -> DataType {
        self.storage.dtype()
    }

    /// Get the size in bytes
    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype().size_bytes()
    }

    /// Raw little-endian bytes, for executors that copy buffers to a device
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Int64(data) => bytemuck::cast_slice(data),
            Storage::Float32(data) => bytemuck::cast_slice(data),
            Storage::Float16(data) => bytemuck::cast_slice(data),
        }
    }

    /// Fail unless the tensor has exactly the given dimensions
    pub fn expect_dims(&self, name: &str, expected: &[usize]) -> Result<()> {
        if self.dims() != expected {
            return Err(Error::ShapeMismatch {
                buffer: name.to_string(),
                expected: expected.to_vec(),
                actual: self.dims().to_vec(),
            });
        }
        Ok(())
    }

    /// Get the data as an `int64` slice
    pub fn as_i64(&self) -> Result<&[i64]> {
        match &self.storage {
            Storage::Int64(data) => Ok(data),
            other => Err(dtype_error(DataType::Int64, other.dtype())),
        }
    }

    /// Get the data as a mutable `int64` slice
    pub fn as_i64_mut(&mut self) -> Result<&mut [i64]> {
        match &mut self.storage {
            Storage::Int64(data) => Ok(data),
            other => Err(dtype_error(DataType::Int64, other.dtype())),
        }
    }

    /// Get the data as an f32 slice
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.storage {
            Storage::Float32(data) => Ok(data),
            other => Err(dtype_error(DataType::Float32, other.dtype())),
        }
    }

    /// Read one element of a 2-D `int64` tensor
    pub fn get_i64(&self, row: usize, col: usize) -> Result<i64> {
        let offset = self.offset2(row, col)?;
        Ok(self.as_i64()?[offset])
    }

    /// Write one element of a 2-D `int64` tensor
    pub fn set_i64(&mut self, row: usize, col: usize, value: i64) -> Result<()> {
        let offset = self.offset2(row, col)?;
        self.as_i64_mut()?[offset] = value;
        Ok(())
    }

    /// One row of a 2-D `int64` tensor
    pub fn row_i64(&self, row: usize) -> Result<&[i64]> {
        let start = self.offset2(row, 0)?;
        let cols = self.dims()[1];
        Ok(&self.as_i64()?[start..start + cols])
    }

    /// One mutable row of a 2-D `int64` tensor
    pub fn row_i64_mut(&mut self, row: usize) -> Result<&mut [i64]> {
        let start = self.offset2(row, 0)?;
        let cols = self.dims()[1];
        Ok(&mut self.as_i64_mut()?[start..start + cols])
    }

    /// Split a 2-D tensor into two equal halves along the column axis.
    pub fn split_columns(&self) -> Result<(Tensor, Tensor)> {
        if self.ndim() != 2 {
            return Err(Error::Tensor(format!(
                "column split needs a 2-D tensor, got shape {}",
                self.shape
            )));
        }
        let (rows, cols) = (self.dims()[0], self.dims()[1]);
        if cols % 2 != 0 {
            return Err(Error::Tensor(format!(
                "cannot split {} columns into equal halves",
                cols
            )));
        }
        let half_shape = Shape::new(vec![rows, cols / 2]);
        let (left, right) = match &self.storage {
            Storage::Int64(data) => {
                let (l, r) = split_rows(data, rows, cols);
                (Storage::Int64(l), Storage::Int64(r))
            }
            Storage::Float32(data) => {
                let (l, r) = split_rows(data, rows, cols);
                (Storage::Float32(l), Storage::Float32(r))
            }
            Storage::Float16(data) => {
                let (l, r) = split_rows(data, rows, cols);
                (Storage::Float16(l), Storage::Float16(r))
            }
        };
        Ok((
            Tensor {
                shape: half_shape.clone(),
                storage: left,
            },
            Tensor {
                shape: half_shape,
                storage: right,
            },
        ))
    }

    /// Greedy argmax over the last axis.
    ///
    /// Returns an `int64` tensor with the last axis removed. Ties resolve to
    /// the lowest index and NaN never wins.
    pub fn argmax(&self) -> Result<Tensor> {
        let dims = self.dims();
        let Some((&vocab, outer)) = dims.split_last() else {
            return Err(Error::Tensor("argmax of a scalar".to_string()));
        };
        if vocab == 0 {
            return Err(Error::Tensor("argmax over an empty axis".to_string()));
        }
        let indices: Vec<i64> = match &self.storage {
            Storage::Float32(data) => data
                .chunks_exact(vocab)
                .map(|row| first_max(row.iter().copied()) as i64)
                .collect(),
            Storage::Float16(data) => data
                .chunks_exact(vocab)
                .map(|row| first_max(row.iter().map(|v| v.to_f32())) as i64)
                .collect(),
            Storage::Int64(_) => {
                return Err(Error::Tensor("argmax of an int64 tensor".to_string()));
            }
        };
        Tensor::from_i64(indices, outer.to_vec())
    }

    fn offset2(&self, row: usize, col: usize) -> Result<usize> {
        if self.ndim() != 2 {
            return Err(Error::Tensor(format!(
                "2-D access into tensor of shape {}",
                self.shape
            )));
        }
        let (rows, cols) = (self.dims()[0], self.dims()[1]);
        if row >= rows || col >= cols {
            return Err(Error::Tensor(format!(
                "index ({}, {}) out of bounds for shape {}",
                row, col, self.shape
            )));
        }
        Ok(row * cols + col)
    }
}

/// Convert an `int64` tensor element into a token id
pub(crate) fn token_id(value: i64) -> Result<TokenId> {
    TokenId::try_from(value)
        .map_err(|_| Error::Tensor(format!("{} is not a valid token id", value)))
}

fn check_len(len: usize, shape: &Shape) -> Result<()> {
    if len != shape.numel() {
        return Err(Error::Tensor(format!(
            "Data length {} doesn't match shape {}",
            len, shape
        )));
    }
    Ok(())
}

fn dtype_error(expected: DataType, actual: DataType) -> Error {
    Error::Tensor(format!(
        "dtype mismatch: expected {:?}, got {:?}",
        expected, actual
    ))
}

fn split_rows<T: Copy>(data: &[T], rows: usize, cols: usize) -> (Vec<T>, Vec<T>) {
    let half = cols / 2;
    let mut left = Vec::with_capacity(rows * half);
    let mut right = Vec::with_capacity(rows * half);
    for row in data.chunks_exact(cols) {
        left.extend_from_slice(&row[..half]);
        right.extend_from_slice(&row[half..]);
    }
    (left, right)
}

fn first_max(values: impl Iterator<Item = f32>) -> usize {
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    let mut seen = false;
    for (idx, value) in values.enumerate() {
        if (!seen && !value.is_nan()) || value > best {
            best = value;
            best_idx = idx;
            seen = true;
        }
    }
    best_idx
}

/// Named mapping of tensors exchanged with an executor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedTensors(BTreeMap<String, Tensor>);

impl NamedTensors {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor, returning the one it replaced
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.0.insert(name.into(), tensor)
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    /// Look up a tensor by name
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.0
            .get(name)
            .ok_or_else(|| Error::MissingBuffer(name.to_string()))
    }

    /// Look up a tensor by name for in-place mutation
    pub fn get_mut(&mut self, name: &str) -> Result<&mut Tensor> {
        self.0
            .get_mut(name)
            .ok_or_else(|| Error::MissingBuffer(name.to_string()))
    }

    /// Remove a tensor by name
    pub fn remove(&mut self, name: &str) -> Result<Tensor> {
        self.0
            .remove(name)
            .ok_or_else(|| Error::MissingBuffer(name.to_string()))
    }

    /// Check whether a name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Bound names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Iterate over `(name, tensor)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of bound tensors
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if no tensor is bound
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Tensor)> for NamedTensors {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape() {
        let shape = Shape::new(vec![2, 3, 4]);
        assert_eq!(shape.ndim(), 3);
        assert_eq!(shape.numel(), 24);
        assert_eq!(shape.dim(1), 3);
        assert_eq!(shape.to_string(), "[2, 3, 4]");
        assert!(Shape::from([2, 0]).is_empty());
    }

    #[test]
    fn test_tensor_creation() {
        let tensor = Tensor::zeros([2, 3], DataType::Float32);
        assert_eq!(tensor.numel(), 6);
        assert_eq!(tensor.dtype(), DataType::Float32);
        assert_eq!(tensor.size_bytes(), 24);
        assert_eq!(tensor.as_bytes().len(), 24);

        let ids = Tensor::full_i64([2, 1], 7);
        assert_eq!(ids.as_i64().unwrap(), &[7, 7]);
        assert!(ids.as_f32().is_err());
    }

    #[test]
    fn test_tensor_from_data_checks_length() {
        assert!(Tensor::from_i64(vec![1, 2, 3], [2, 2]).is_err());
        assert!(Tensor::from_f32(&[1.0, 2.0], [2]).is_ok());
        assert!(Tensor::from_f16(&[f16::ONE], [1, 1, 2]).is_err());
    }

    #[test]
    fn test_2d_access() {
        let mut t = Tensor::from_i64(vec![0, 1, 2, 3, 4, 5], [2, 3]).unwrap();
        assert_eq!(t.get_i64(1, 2).unwrap(), 5);
        t.set_i64(0, 1, 42).unwrap();
        assert_eq!(t.row_i64(0).unwrap(), &[0, 42, 2]);
        t.row_i64_mut(1).unwrap()[0] = -1;
        assert_eq!(t.as_i64().unwrap(), &[0, 42, 2, -1, 4, 5]);
        assert!(t.get_i64(2, 0).is_err());
        assert!(t.get_i64(0, 3).is_err());
    }

    #[test]
    fn test_split_columns() {
        let t = Tensor::from_i64(vec![1, 2, 3, 4, 5, 6, 7, 8], [2, 4]).unwrap();
        let (left, right) = t.split_columns().unwrap();
        assert_eq!(left.dims(), &[2, 2]);
        assert_eq!(left.as_i64().unwrap(), &[1, 2, 5, 6]);
        assert_eq!(right.as_i64().unwrap(), &[3, 4, 7, 8]);

        let odd = Tensor::zeros([2, 3], DataType::Int64);
        assert!(odd.split_columns().is_err());
    }

    #[test]
    fn test_argmax_last_axis() {
        let logits = Tensor::from_f32(
            &[0.1, 0.9, 0.0, 0.5, 0.2, 0.3, 1.0, 1.0, 0.0, -1.0, -2.0, -0.5],
            [2, 2, 3],
        )
        .unwrap();
        let ids = logits.argmax().unwrap();
        assert_eq!(ids.dims(), &[2, 2]);
        assert_eq!(ids.as_i64().unwrap(), &[1, 0, 0, 2]);
    }

    #[test]
    fn test_argmax_ties_take_lowest_index() {
        let logits = Tensor::from_f32(&[0.0, 3.0, 3.0, 3.0], [1, 4]).unwrap();
        assert_eq!(logits.argmax().unwrap().as_i64().unwrap(), &[1]);
    }

    #[test]
    fn test_argmax_skips_nan() {
        let logits = Tensor::from_f32(&[f32::NAN, -5.0, f32::NAN, -4.0], [1, 4]).unwrap();
        assert_eq!(logits.argmax().unwrap().as_i64().unwrap(), &[3]);
    }

    #[test]
    fn test_argmax_f16() {
        let data: Vec<f16> = [0.25f32, 2.0, -1.0]
            .iter()
            .map(|&v| f16::from_f32(v))
            .collect();
        let logits = Tensor::from_f16(&data, [1, 1, 3]).unwrap();
        assert_eq!(logits.argmax().unwrap().as_i64().unwrap(), &[1]);
    }

    #[test]
    fn test_expect_dims() {
        let t = Tensor::zeros([1, 4], DataType::Int64);
        assert!(t.expect_dims("input_ids", &[1, 4]).is_ok());
        let err = t.expect_dims("input_ids", &[1, 5]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_token_id_conversion() {
        assert_eq!(token_id(17).unwrap(), 17);
        assert!(token_id(-1).is_err());
        assert!(token_id(i64::MAX).is_err());
    }

    #[test]
    fn test_named_tensors() {
        let mut map = NamedTensors::new()
            .with("input_ids", Tensor::full_i64([1, 2], 3))
            .with("position_ids", Tensor::full_i64([1, 2], 0));

        assert_eq!(map.len(), 2);
        assert!(map.contains("input_ids"));
        assert_eq!(
            map.names().collect::<Vec<_>>(),
            vec!["input_ids", "position_ids"]
        );
        map.get_mut("position_ids").unwrap().set_i64(0, 1, 1).unwrap();
        assert_eq!(map.get("position_ids").unwrap().as_i64().unwrap(), &[0, 1]);
        assert!(matches!(map.get("logits"), Err(Error::MissingBuffer(_))));
        assert!(map.remove("input_ids").is_ok());
        assert_eq!(map.len(), 1);
    }
}
