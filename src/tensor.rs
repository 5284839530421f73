use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("incompatible tensor shapes: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

/// A contiguous row-major buffer of `f32` values plus its shape.
///
/// Tensors are value-like: operations allocate and return new buffers, and
/// no layer holds a view into another layer's data. The only in-place
/// mutation happens through explicitly in-place primitives (e.g. scaling)
/// and the optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    blob: Vec<f32>,
    shape: Vec<usize>,
}

impl Tensor {
    pub fn raw(shape: &[usize], blob: Vec<f32>) -> Result<Self, TensorError> {
        let size = shape.iter().product::<usize>();
        if size != blob.len() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![blob.len()],
            });
        }
        Ok(Self {
            blob,
            shape: shape.to_vec(),
        })
    }

    /// A zero-element placeholder, used for gradient buffers that are
    /// rewritten before first use.
    pub fn empty() -> Self {
        Self {
            blob: Vec::new(),
            shape: vec![0],
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            blob: vec![0.; shape.iter().product()],
            shape: shape.to_vec(),
        }
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self {
            blob: vec![1.; shape.iter().product()],
            shape: shape.to_vec(),
        }
    }

    pub fn rand<R: Rng>(rng: &mut R, shape: &[usize]) -> Self {
        let normal = Normal::new(0.0f32, 0.02).unwrap();
        Self {
            blob: (0..shape.iter().product())
                .map(|_| normal.sample(rng))
                .collect(),
            shape: shape.to_vec(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn size(&self) -> usize {
        self.blob.len()
    }

    pub fn blob(&self) -> &[f32] {
        &self.blob
    }

    pub fn blob_mut(&mut self) -> &mut [f32] {
        &mut self.blob
    }

    /// Number of rows when the tensor is viewed as a 2-D matrix, i.e. the
    /// product of all dimensions except the last.
    pub fn rows(&self) -> usize {
        self.shape[..self.shape.len() - 1].iter().product()
    }

    /// Width of the last dimension.
    pub fn cols(&self) -> usize {
        *self.shape.last().expect("scalar tensors have no columns")
    }

    pub fn expect_shape(&self, shape: &[usize]) -> Result<(), TensorError> {
        if self.shape != shape {
            return Err(TensorError::ShapeMismatch {
                expected: shape.to_vec(),
                got: self.shape.clone(),
            });
        }
        Ok(())
    }

    /// Expects a 2-D view with the given column width, any number of rows.
    pub fn expect_cols(&self, cols: usize) -> Result<usize, TensorError> {
        if self.shape.len() < 2 || self.cols() != cols {
            return Err(TensorError::ShapeMismatch {
                expected: vec![0, cols],
                got: self.shape.clone(),
            });
        }
        Ok(self.rows())
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        other.expect_shape(&self.shape)?;
        Ok(Tensor {
            blob: self
                .blob
                .iter()
                .zip(other.blob.iter())
                .map(|(a, b)| a + b)
                .collect(),
            shape: self.shape.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_rejects_wrong_sizes() {
        assert!(Tensor::raw(&[2, 3], vec![0.; 6]).is_ok());
        assert!(Tensor::raw(&[2, 3], vec![0.; 5]).is_err());
    }

    #[test]
    fn add_requires_matching_shapes() {
        let a = Tensor::raw(&[2, 2], vec![1., 2., 3., 4.]).unwrap();
        let b = Tensor::raw(&[2, 2], vec![4., 3., 2., 1.]).unwrap();
        assert_eq!(a.add(&b).unwrap().blob(), &[5.; 4]);
        let c = Tensor::zeros(&[4]);
        assert!(a.add(&c).is_err());
    }
}
