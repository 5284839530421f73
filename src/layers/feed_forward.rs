use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::optimizer::Sgd;
use crate::tensor::{Tensor, TensorError};

/// Two-layer MLP with a ReLU between, hidden width four times the model
/// width. Neither projection carries a bias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedForward {
    pub d_model: usize,
    pub hidden: usize,
    pub w1: Tensor,
    pub w2: Tensor,
    #[serde(skip, default = "Tensor::empty")]
    grad_w1: Tensor,
    #[serde(skip, default = "Tensor::empty")]
    grad_w2: Tensor,
}

impl FeedForward {
    pub fn new<R: Rng>(rng: &mut R, d_model: usize, hidden: usize) -> Self {
        Self {
            d_model,
            hidden,
            w1: Tensor::rand(rng, &[d_model, hidden]),
            w2: Tensor::rand(rng, &[hidden, d_model]),
            grad_w1: Tensor::empty(),
            grad_w2: Tensor::empty(),
        }
    }

    pub fn from_weights(w1: Tensor, w2: Tensor) -> Result<Self, TensorError> {
        if w1.shape().len() != 2 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![0, 0],
                got: w1.shape().to_vec(),
            });
        }
        let d_model = w1.shape()[0];
        let hidden = w1.shape()[1];
        w2.expect_shape(&[hidden, d_model])?;
        Ok(Self {
            d_model,
            hidden,
            w1,
            w2,
            grad_w1: Tensor::empty(),
            grad_w2: Tensor::empty(),
        })
    }

    pub fn forward(&self, device: &Device, x: &Tensor) -> Result<Tensor, TensorError> {
        let seq_len = x.expect_cols(self.d_model)?;
        let mut h = device.matmul(x.blob(), self.w1.blob(), seq_len, self.d_model, self.hidden);
        for v in h.iter_mut() {
            *v = v.max(0.);
        }
        let out = device.matmul(&h, self.w2.blob(), seq_len, self.hidden, self.d_model);
        Tensor::raw(&[seq_len, self.d_model], out)
    }

    /// Recomputes the hidden pre-activation and masks the gradient through
    /// the ReLU.
    pub fn backward(
        &mut self,
        device: &Device,
        x: &Tensor,
        d_out: &Tensor,
    ) -> Result<Tensor, TensorError> {
        let seq_len = x.expect_cols(self.d_model)?;
        d_out.expect_shape(&[seq_len, self.d_model])?;

        let h = device.matmul(x.blob(), self.w1.blob(), seq_len, self.d_model, self.hidden);
        let relu_h: Vec<f32> = h.iter().map(|v| v.max(0.)).collect();

        let relu_h_t = device.transpose(&relu_h, seq_len, self.hidden);
        let d_w2 = device.matmul(&relu_h_t, d_out.blob(), self.hidden, seq_len, self.d_model);

        let w2_t = device.transpose(self.w2.blob(), self.hidden, self.d_model);
        let mut d_h = device.matmul(d_out.blob(), &w2_t, seq_len, self.d_model, self.hidden);
        for (g, pre) in d_h.iter_mut().zip(h.iter()) {
            if *pre <= 0. {
                *g = 0.;
            }
        }

        let x_t = device.transpose(x.blob(), seq_len, self.d_model);
        let d_w1 = device.matmul(&x_t, &d_h, self.d_model, seq_len, self.hidden);
        self.grad_w1 = Tensor::raw(&[self.d_model, self.hidden], d_w1)?;
        self.grad_w2 = Tensor::raw(&[self.hidden, self.d_model], d_w2)?;

        let w1_t = device.transpose(self.w1.blob(), self.d_model, self.hidden);
        let dx = device.matmul(&d_h, &w1_t, seq_len, self.hidden, self.d_model);
        Tensor::raw(&[seq_len, self.d_model], dx)
    }

    pub fn sgd_step(&mut self, sgd: &Sgd) {
        sgd.step(self.w1.blob_mut(), self.grad_w1.blob());
        sgd.step(self.w2.blob_mut(), self.grad_w2.blob());
    }
}
