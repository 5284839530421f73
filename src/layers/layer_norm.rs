use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::optimizer::Sgd;
use crate::tensor::{Tensor, TensorError};

pub const EPS: f32 = 1e-5;

/// Per-row normalization with learnable scale and shift:
/// `y = gamma * (x - mean) / sqrt(var + eps) + beta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerNorm {
    pub dim: usize,
    pub gamma: Tensor,
    pub beta: Tensor,
    #[serde(skip, default = "Tensor::empty")]
    grad_gamma: Tensor,
    #[serde(skip, default = "Tensor::empty")]
    grad_beta: Tensor,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            gamma: Tensor::ones(&[dim]),
            beta: Tensor::zeros(&[dim]),
            grad_gamma: Tensor::zeros(&[dim]),
            grad_beta: Tensor::zeros(&[dim]),
        }
    }

    pub fn from_weights(gamma: Tensor, beta: Tensor) -> Result<Self, TensorError> {
        let dim = gamma.size();
        beta.expect_shape(gamma.shape())?;
        Ok(Self {
            dim,
            grad_gamma: Tensor::zeros(&[dim]),
            grad_beta: Tensor::zeros(&[dim]),
            gamma,
            beta,
        })
    }

    pub fn forward(&self, device: &Device, x: &Tensor) -> Result<Tensor, TensorError> {
        let rows = x.expect_cols(self.dim)?;
        let (xhat, _, _) = device.layer_norm_forward(x.blob(), rows, self.dim, EPS);
        let mut y = xhat;
        for row in y.chunks_mut(self.dim) {
            for ((v, g), b) in row
                .iter_mut()
                .zip(self.gamma.blob().iter())
                .zip(self.beta.blob().iter())
            {
                *v = *v * g + b;
            }
        }
        Tensor::raw(x.shape(), y)
    }

    /// Recomputes the normalization statistics, accumulates gamma/beta
    /// gradients and returns the input gradient via the closed form.
    pub fn backward(&mut self, device: &Device, x: &Tensor, dy: &Tensor) -> Result<Tensor, TensorError> {
        let rows = x.expect_cols(self.dim)?;
        dy.expect_shape(x.shape())?;
        let (xhat, mean, inv_std) = device.layer_norm_forward(x.blob(), rows, self.dim, EPS);

        let mut gg = vec![0.; self.dim];
        let mut gb = vec![0.; self.dim];
        let mut d_xhat = vec![0.; rows * self.dim];
        for i in 0..rows {
            for j in 0..self.dim {
                let dyv = dy.blob()[i * self.dim + j];
                gg[j] += dyv * xhat[i * self.dim + j];
                gb[j] += dyv;
                d_xhat[i * self.dim + j] = dyv * self.gamma.blob()[j];
            }
        }
        self.grad_gamma = Tensor::raw(&[self.dim], gg)?;
        self.grad_beta = Tensor::raw(&[self.dim], gb)?;

        let dx = device.layer_norm_backward(x.blob(), &d_xhat, &mean, &inv_std, rows, self.dim);
        Tensor::raw(x.shape(), dx)
    }

    pub fn sgd_step(&mut self, sgd: &Sgd) {
        sgd.step(self.gamma.blob_mut(), self.grad_gamma.blob());
        sgd.step(self.beta.blob_mut(), self.grad_beta.blob());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_params_normalize_rows() {
        let device = Device::cpu();
        let norm = LayerNorm::new(4);
        let x = Tensor::raw(&[2, 4], vec![1., 2., 3., 4., -2., 0., 2., 4.]).unwrap();
        let y = norm.forward(&device, &x).unwrap();
        for row in y.blob().chunks(4) {
            let mean = row.iter().sum::<f32>() / 4.;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.).abs() < 1e-3);
        }
    }

    #[test]
    fn gamma_beta_scale_and_shift() {
        let device = Device::cpu();
        let mut norm = LayerNorm::new(2);
        norm.gamma = Tensor::raw(&[2], vec![2., 2.]).unwrap();
        norm.beta = Tensor::raw(&[2], vec![1., 1.]).unwrap();
        let x = Tensor::raw(&[1, 2], vec![-1., 1.]).unwrap();
        let y = norm.forward(&device, &x).unwrap();
        // xhat is close to [-1, 1], so y is close to [-1, 3].
        assert!((y.blob()[0] + 1.).abs() < 1e-2);
        assert!((y.blob()[1] - 3.).abs() < 1e-2);
    }

    #[test]
    fn backward_gradients_have_param_shapes() {
        let device = Device::cpu();
        let mut norm = LayerNorm::new(3);
        let x = Tensor::raw(&[2, 3], vec![0.5, -1., 2., 3., 0., -0.5]).unwrap();
        let dy = Tensor::raw(&[2, 3], vec![1.; 6]).unwrap();
        let dx = norm.backward(&device, &x, &dy).unwrap();
        assert_eq!(dx.shape(), &[2, 3]);
        assert_eq!(norm.grad_gamma.shape(), &[3]);
        // Sum of dy over rows lands in grad_beta.
        assert_eq!(norm.grad_beta.blob(), &[2., 2., 2.]);
    }
}
