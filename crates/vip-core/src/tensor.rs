use std::fmt;
use std::ops::Range;
use std::slice::{Chunks, ChunksMut};

use rayon::prelude::*;

use crate::error::CoreError;
use crate::shape::Shape;
use crate::Result;

/// A dense, row-major f32 array.
///
/// Axis 0 is always the batch axis: images are `(batch, channels, height, width)`,
/// masks and scores `(batch, num_patches)`, logits `(batch, num_classes)`.
/// Tensors own their data; every operation returns a new tensor unless it is
/// suffixed `_mut`.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Wrap `data` with the given shape, checking the element count.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(CoreError::LengthMismatch {
                shape: shape.to_vec(),
                expected: s.numel(),
                got: data.len(),
            });
        }
        Ok(Self { data, shape: s })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: &[usize], value: f32) -> Self {
        let s = Shape::new(shape);
        Self {
            data: vec![value; s.numel()],
            shape: s,
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of axis 0.
    pub fn batch_size(&self) -> usize {
        self.shape.dim(0).unwrap_or(0)
    }

    /// Elements per batch row.
    pub fn row_len(&self) -> usize {
        self.shape.row_len()
    }

    pub fn expect_dims(&self, expected: &[usize]) -> Result<()> {
        if self.dims() != expected {
            return Err(CoreError::ShapeMismatch {
                expected: expected.to_vec(),
                got: self.dims().to_vec(),
            });
        }
        Ok(())
    }

    pub fn expect_rank(&self, expected: usize) -> Result<()> {
        if self.ndim() != expected {
            return Err(CoreError::RankMismatch {
                expected,
                got: self.ndim(),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Data access
    // =========================================================================

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Row `index` along the batch axis.
    pub fn row(&self, index: usize) -> Result<&[f32]> {
        let len = self.row_len();
        let batch = self.batch_size();
        if index >= batch {
            return Err(CoreError::IndexOutOfBounds {
                index,
                axis: 0,
                size: batch,
            });
        }
        Ok(&self.data[index * len..(index + 1) * len])
    }

    /// Copy of the samples in `range` along the batch axis.
    ///
    /// Panics if `range` is out of bounds, like slice indexing.
    pub fn batch_range(&self, range: Range<usize>) -> Tensor {
        let len = self.row_len();
        let mut dims = self.shape.dims().to_vec();
        if let Some(b) = dims.first_mut() {
            *b = range.len();
        }
        Tensor {
            data: self.data[range.start * len..range.end * len].to_vec(),
            shape: Shape::new(&dims),
        }
    }

    pub fn rows(&self) -> Chunks<'_, f32> {
        self.data.chunks(self.row_len().max(1))
    }

    pub fn rows_mut(&mut self) -> ChunksMut<'_, f32> {
        let len = self.row_len().max(1);
        self.data.chunks_mut(len)
    }

    /// Data-parallel mutable rows; rows never alias, so no synchronisation is needed.
    pub fn par_rows_mut(&mut self) -> rayon::slice::ChunksMut<'_, f32> {
        let len = self.row_len().max(1);
        self.data.par_chunks_mut(len)
    }

    // =========================================================================
    // Shape operations
    // =========================================================================

    pub fn reshape(self, new_shape: &[isize]) -> Result<Tensor> {
        let resolved = self.shape.resolve_reshape(new_shape).ok_or_else(|| {
            CoreError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.iter().map(|&d| d.max(0) as usize).collect(),
            }
        })?;
        Ok(Tensor {
            data: self.data,
            shape: resolved,
        })
    }

    /// View a batched tensor as `(batch, row_len)`.
    pub fn flatten_rows(self) -> Tensor {
        let batch = self.batch_size();
        let len = self.row_len();
        Tensor {
            data: self.data,
            shape: Shape::new(&[batch, len]),
        }
    }

    // =========================================================================
    // Element-wise and row-wise math
    // =========================================================================

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            data: self.data.iter().map(|&v| f(v)).collect(),
            shape: self.shape.clone(),
        }
    }

    pub fn zip_map(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        other.expect_dims(self.dims())?;
        Ok(Tensor {
            data: self
                .data
                .iter()
                .zip(other.data.iter())
                .map(|(&a, &b)| f(a, b))
                .collect(),
            shape: self.shape.clone(),
        })
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_map(other, |a, b| a + b)
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    pub fn sum_squares(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Index of the largest entry of each row. Ties resolve to the lowest index.
    pub fn argmax_rows(&self) -> Vec<usize> {
        self.rows().map(argmax).collect()
    }

    /// Numerically stable softmax over each row. Rows that are entirely `-inf`
    /// come back as all zeros.
    pub fn softmax_rows(&self) -> Tensor {
        let mut out = self.clone();
        out.par_rows_mut().for_each(softmax_in_place);
        out
    }
}

/// Index of the largest finite-or-infinite value; ties resolve to the lowest index.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = i;
        }
    }
    best
}

/// In-place softmax of one row.
pub fn softmax_in_place(row: &mut [f32]) {
    let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max_val == f32::NEG_INFINITY {
        row.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={})", self.shape)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.numel();
        if n <= 20 {
            write!(f, "tensor({:?}, shape={})", self.data, self.shape)
        } else {
            write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                self.data[0],
                self.data[1],
                self.data[n - 1],
                self.shape
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Tensor::from_vec(vec![0.0; 5], &[2, 3]).is_err());
        let t = Tensor::from_vec(vec![0.0; 6], &[2, 3]).unwrap();
        assert_eq!(t.batch_size(), 2);
        assert_eq!(t.row_len(), 3);
    }

    #[test]
    fn test_row_out_of_bounds() {
        let t = Tensor::zeros(&[2, 3]);
        assert!(t.row(1).is_ok());
        assert!(matches!(
            t.row(2),
            Err(CoreError::IndexOutOfBounds { index: 2, axis: 0, size: 2 })
        ));
    }

    #[test]
    fn test_batch_range() {
        let t = Tensor::from_vec((0..8).map(|i| i as f32).collect(), &[4, 1, 2]).unwrap();
        let b = t.batch_range(1..3);
        assert_eq!(b.dims(), &[2, 1, 2]);
        assert_eq!(b.data(), &[2.0, 3.0, 4.0, 5.0]);
        assert_eq!(t.batch_range(4..4).dims(), &[0, 1, 2]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0], &[2, 3]).unwrap();
        let p = t.softmax_rows();
        for row in p.rows() {
            let s: f32 = row.iter().sum();
            assert!((s - 1.0).abs() < 1e-6, "row sum should be 1, got {}", s);
        }
    }

    #[test]
    fn test_softmax_all_neg_inf_row_is_zero() {
        let t = Tensor::from_vec(vec![f32::NEG_INFINITY; 3], &[1, 3]).unwrap();
        let p = t.softmax_rows();
        assert!(p.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_argmax_ties_pick_lowest_index() {
        assert_eq!(argmax(&[0.5, 0.9, 0.9, 0.1]), 1);
        let t = Tensor::from_vec(vec![3.0, 1.0, 0.0, 7.0], &[2, 2]).unwrap();
        assert_eq!(t.argmax_rows(), vec![0, 1]);
    }

    #[test]
    fn test_reshape_and_flatten() {
        let t = Tensor::zeros(&[2, 1, 4, 4]);
        let f = t.clone().flatten_rows();
        assert_eq!(f.dims(), &[2, 16]);
        let r = t.reshape(&[-1, 8]).unwrap();
        assert_eq!(r.dims(), &[4, 8]);
    }
}
