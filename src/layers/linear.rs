use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::optimizer::Sgd;
use crate::tensor::{Tensor, TensorError};

/// Affine layer `y = x·Wᵀ + b` with weights stored `[out_features ×
/// in_features]`. Gradient buffers live alongside the weights and are
/// rewritten by every backward call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Tensor,
    pub bias: Tensor,
    #[serde(skip, default = "Tensor::empty")]
    grad_weight: Tensor,
    #[serde(skip, default = "Tensor::empty")]
    grad_bias: Tensor,
}

impl Linear {
    pub fn new<R: Rng>(rng: &mut R, in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
            weight: Tensor::rand(rng, &[out_features, in_features]),
            bias: Tensor::zeros(&[out_features]),
            grad_weight: Tensor::zeros(&[out_features, in_features]),
            grad_bias: Tensor::zeros(&[out_features]),
        }
    }

    pub fn from_weights(weight: Tensor, bias: Tensor) -> Result<Self, TensorError> {
        if weight.shape().len() != 2 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![0, 0],
                got: weight.shape().to_vec(),
            });
        }
        let out_features = weight.shape()[0];
        let in_features = weight.shape()[1];
        bias.expect_shape(&[out_features])?;
        Ok(Self {
            in_features,
            out_features,
            grad_weight: Tensor::zeros(&[out_features, in_features]),
            grad_bias: Tensor::zeros(&[out_features]),
            weight,
            bias,
        })
    }

    pub fn forward(&self, device: &Device, x: &Tensor) -> Result<Tensor, TensorError> {
        let batch = x.expect_cols(self.in_features)?;
        let w_t = device.transpose(self.weight.blob(), self.out_features, self.in_features);
        let mut out = device.matmul(x.blob(), &w_t, batch, self.in_features, self.out_features);
        for row in out.chunks_mut(self.out_features) {
            for (o, b) in row.iter_mut().zip(self.bias.blob().iter()) {
                *o += b;
            }
        }
        Tensor::raw(&[batch, self.out_features], out)
    }

    /// Computes batch-mean weight/bias gradients and returns the input
    /// gradient. The mean keeps the effective learning rate independent of
    /// batch size.
    pub fn backward(
        &mut self,
        device: &Device,
        x: &Tensor,
        grad_output: &Tensor,
    ) -> Result<Tensor, TensorError> {
        let batch = x.expect_cols(self.in_features)?;
        grad_output.expect_shape(&[batch, self.out_features])?;

        let dy_t = device.transpose(grad_output.blob(), batch, self.out_features);
        let mut gw = device.matmul(&dy_t, x.blob(), self.out_features, batch, self.in_features);
        device.scale_in_place(&mut gw, 1. / batch as f32, self.out_features, self.in_features);
        self.grad_weight = Tensor::raw(&[self.out_features, self.in_features], gw)?;

        let mut gb = vec![0.; self.out_features];
        for row in grad_output.blob().chunks(self.out_features) {
            for (g, dy) in gb.iter_mut().zip(row.iter()) {
                *g += dy;
            }
        }
        for g in gb.iter_mut() {
            *g /= batch as f32;
        }
        self.grad_bias = Tensor::raw(&[self.out_features], gb)?;

        let dx = device.matmul(
            grad_output.blob(),
            self.weight.blob(),
            batch,
            self.out_features,
            self.in_features,
        );
        Tensor::raw(&[batch, self.in_features], dx)
    }

    pub fn sgd_step(&mut self, sgd: &Sgd) {
        sgd.step(self.weight.blob_mut(), self.grad_weight.blob());
        sgd.step(self.bias.blob_mut(), self.grad_bias.blob());
    }

    pub fn grad_weight(&self) -> &Tensor {
        &self.grad_weight
    }

    pub fn grad_bias(&self) -> &Tensor {
        &self.grad_bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn forward_shape_and_bias() {
        let device = Device::cpu();
        let mut lin = Linear::new(&mut StdRng::seed_from_u64(7), 3, 2);
        lin.weight = Tensor::zeros(&[2, 3]);
        lin.bias = Tensor::raw(&[2], vec![1., -1.]).unwrap();
        let x = Tensor::raw(&[2, 3], vec![1.; 6]).unwrap();
        let y = lin.forward(&device, &x).unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        assert_eq!(y.blob(), &[1., -1., 1., -1.]);
    }

    #[test]
    fn backward_matches_finite_difference() {
        let device = Device::cpu();
        let mut rng = StdRng::seed_from_u64(42);
        let mut lin = Linear::new(&mut rng, 4, 3);
        let x = Tensor::rand(&mut rng, &[2, 4]);
        let dy = Tensor::raw(&[2, 3], (0..6).map(|i| (i as f32 * 0.9).sin()).collect()).unwrap();

        lin.backward(&device, &x, &dy).unwrap();
        let analytic = lin.grad_weight().blob().to_vec();

        // loss = sum(forward(x) * dy) / batch, so d loss / d w == grad_weight
        let batch = 2.;
        let h = 1e-3;
        for idx in 0..analytic.len() {
            let orig = lin.weight.blob()[idx];
            lin.weight.blob_mut()[idx] = orig + h;
            let lp: f32 = lin
                .forward(&device, &x)
                .unwrap()
                .blob()
                .iter()
                .zip(dy.blob())
                .map(|(a, b)| a * b)
                .sum();
            lin.weight.blob_mut()[idx] = orig - h;
            let lm: f32 = lin
                .forward(&device, &x)
                .unwrap()
                .blob()
                .iter()
                .zip(dy.blob())
                .map(|(a, b)| a * b)
                .sum();
            lin.weight.blob_mut()[idx] = orig;
            let numeric = (lp - lm) / (2. * h) / batch;
            assert!(
                (numeric - analytic[idx]).abs() < 1e-3,
                "w[{}]: analytic {} vs numeric {}",
                idx,
                analytic[idx],
                numeric
            );
        }
    }
}
