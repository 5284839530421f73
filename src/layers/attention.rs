use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::layers::Rotary;
use crate::optimizer::Sgd;
use crate::tensor::{Tensor, TensorError};

/// Multi-head scaled dot-product attention with rotary position encoding.
///
/// Heads are laid out stacked: the `[seq_len × d_model]` projections are
/// rearranged into `[num_heads·seq_len × head_dim]` where head `h`, position
/// `i`, feature `j` comes from flat column `h·head_dim + j`. Queries and keys
/// are rotated in that stacked layout before the score matmul.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiHeadAttention {
    pub d_model: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub wq: Tensor,
    pub wk: Tensor,
    pub wv: Tensor,
    pub wo: Tensor,
    rope: Rotary,
    #[serde(skip, default = "Tensor::empty")]
    grad_wq: Tensor,
    #[serde(skip, default = "Tensor::empty")]
    grad_wk: Tensor,
    #[serde(skip, default = "Tensor::empty")]
    grad_wv: Tensor,
    #[serde(skip, default = "Tensor::empty")]
    grad_wo: Tensor,
}

impl MultiHeadAttention {
    pub fn new<R: Rng>(rng: &mut R, d_model: usize, num_heads: usize) -> Self {
        assert_eq!(d_model % num_heads, 0, "d_model must be divisible by num_heads");
        let head_dim = d_model / num_heads;
        Self {
            d_model,
            num_heads,
            head_dim,
            wq: Tensor::rand(rng, &[d_model, d_model]),
            wk: Tensor::rand(rng, &[d_model, d_model]),
            wv: Tensor::rand(rng, &[d_model, d_model]),
            wo: Tensor::rand(rng, &[d_model, d_model]),
            rope: Rotary::new(head_dim),
            grad_wq: Tensor::empty(),
            grad_wk: Tensor::empty(),
            grad_wv: Tensor::empty(),
            grad_wo: Tensor::empty(),
        }
    }

    pub fn from_weights(
        num_heads: usize,
        wq: Tensor,
        wk: Tensor,
        wv: Tensor,
        wo: Tensor,
    ) -> Result<Self, TensorError> {
        if wq.shape().len() != 2 || wq.shape()[0] != wq.shape()[1] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![0, 0],
                got: wq.shape().to_vec(),
            });
        }
        let d_model = wq.shape()[0];
        wk.expect_shape(&[d_model, d_model])?;
        wv.expect_shape(&[d_model, d_model])?;
        wo.expect_shape(&[d_model, d_model])?;
        assert_eq!(d_model % num_heads, 0, "d_model must be divisible by num_heads");
        let head_dim = d_model / num_heads;
        Ok(Self {
            d_model,
            num_heads,
            head_dim,
            wq,
            wk,
            wv,
            wo,
            rope: Rotary::new(head_dim),
            grad_wq: Tensor::empty(),
            grad_wk: Tensor::empty(),
            grad_wv: Tensor::empty(),
            grad_wo: Tensor::empty(),
        })
    }

    fn split_heads(&self, flat: &[f32], seq_len: usize) -> Vec<f32> {
        let mut out = vec![0.; self.num_heads * seq_len * self.head_dim];
        for h in 0..self.num_heads {
            for i in 0..seq_len {
                for j in 0..self.head_dim {
                    out[(h * seq_len + i) * self.head_dim + j] =
                        flat[i * self.d_model + h * self.head_dim + j];
                }
            }
        }
        out
    }

    fn merge_heads(&self, heads: &[f32], seq_len: usize) -> Vec<f32> {
        let mut out = vec![0.; seq_len * self.d_model];
        for h in 0..self.num_heads {
            for i in 0..seq_len {
                for j in 0..self.head_dim {
                    out[i * self.d_model + h * self.head_dim + j] =
                        heads[(h * seq_len + i) * self.head_dim + j];
                }
            }
        }
        out
    }

    pub fn forward(&self, device: &Device, x: &Tensor) -> Result<Tensor, TensorError> {
        let seq_len = x.expect_cols(self.d_model)?;
        let d = self.d_model;
        let rows = self.num_heads * seq_len;
        let scale = 1. / (self.head_dim as f32).sqrt();

        let q = device.matmul(x.blob(), self.wq.blob(), seq_len, d, d);
        let k = device.matmul(x.blob(), self.wk.blob(), seq_len, d, d);
        let v = device.matmul(x.blob(), self.wv.blob(), seq_len, d, d);

        let mut qh = self.split_heads(&q, seq_len);
        let mut kh = self.split_heads(&k, seq_len);
        let vh = self.split_heads(&v, seq_len);

        self.rope.apply(device, &mut qh, rows);
        self.rope.apply(device, &mut kh, rows);

        let kt = device.transpose(&kh, rows, self.head_dim);
        let mut scores = device.matmul(&qh, &kt, rows, self.head_dim, rows);
        device.scale_in_place(&mut scores, scale, rows, rows);
        let attn = device.row_softmax(&scores, rows, rows);

        let weighted = device.matmul(&attn, &vh, rows, rows, self.head_dim);
        let merged = self.merge_heads(&weighted, seq_len);
        let out = device.matmul(&merged, self.wo.blob(), seq_len, d, d);
        Tensor::raw(&[seq_len, d], out)
    }

    /// Recomputes the forward intermediates, then threads the output gradient
    /// back through the projection, attention-weight, softmax and query/key
    /// stages. Rotary angles are fixed, so no gradient flows through them.
    pub fn backward(
        &mut self,
        device: &Device,
        x: &Tensor,
        d_out: &Tensor,
    ) -> Result<Tensor, TensorError> {
        let seq_len = x.expect_cols(self.d_model)?;
        d_out.expect_shape(&[seq_len, self.d_model])?;
        let d = self.d_model;
        let rows = self.num_heads * seq_len;
        let scale = 1. / (self.head_dim as f32).sqrt();

        let q = device.matmul(x.blob(), self.wq.blob(), seq_len, d, d);
        let k = device.matmul(x.blob(), self.wk.blob(), seq_len, d, d);
        let v = device.matmul(x.blob(), self.wv.blob(), seq_len, d, d);

        let mut qh = self.split_heads(&q, seq_len);
        let mut kh = self.split_heads(&k, seq_len);
        let vh = self.split_heads(&v, seq_len);

        self.rope.apply(device, &mut qh, rows);
        self.rope.apply(device, &mut kh, rows);

        let kt = device.transpose(&kh, rows, self.head_dim);
        let mut scores = device.matmul(&qh, &kt, rows, self.head_dim, rows);
        device.scale_in_place(&mut scores, scale, rows, rows);
        let attn = device.row_softmax(&scores, rows, rows);
        let z = device.matmul(&attn, &vh, rows, rows, self.head_dim);
        let merged = self.merge_heads(&z, seq_len);

        // Output projection.
        let merged_t = device.transpose(&merged, seq_len, d);
        let d_wo = device.matmul(&merged_t, d_out.blob(), d, seq_len, d);
        let wo_t = device.transpose(self.wo.blob(), d, d);
        let d_merged = device.matmul(d_out.blob(), &wo_t, seq_len, d, d);
        let dz = self.split_heads(&d_merged, seq_len);

        // Weighted sum: z = attn · vh.
        let attn_t = device.transpose(&attn, rows, rows);
        let d_vh = device.matmul(&attn_t, &dz, rows, rows, self.head_dim);
        let z_t = device.transpose(&z, rows, self.head_dim);
        let d_attn = device.matmul(&dz, &z_t, rows, self.head_dim, rows);

        // Softmax, then the score scaling.
        let mut d_scores = device.row_softmax_backward(&attn, &d_attn, rows, rows);
        device.scale_in_place(&mut d_scores, scale, rows, rows);

        // scores = qh · khᵀ.
        let d_qh = device.matmul(&d_scores, &kh, rows, rows, self.head_dim);
        let d_scores_t = device.transpose(&d_scores, rows, rows);
        let d_kh = device.matmul(&d_scores_t, &qh, rows, rows, self.head_dim);

        let d_q = self.merge_heads(&d_qh, seq_len);
        let d_k = self.merge_heads(&d_kh, seq_len);
        let d_v = self.merge_heads(&d_vh, seq_len);

        // Projections: q = x · wq, and likewise for k, v.
        let x_t = device.transpose(x.blob(), seq_len, d);
        self.grad_wq = Tensor::raw(&[d, d], device.matmul(&x_t, &d_q, d, seq_len, d))?;
        self.grad_wk = Tensor::raw(&[d, d], device.matmul(&x_t, &d_k, d, seq_len, d))?;
        self.grad_wv = Tensor::raw(&[d, d], device.matmul(&x_t, &d_v, d, seq_len, d))?;
        self.grad_wo = Tensor::raw(&[d, d], d_wo)?;

        let wq_t = device.transpose(self.wq.blob(), d, d);
        let wk_t = device.transpose(self.wk.blob(), d, d);
        let wv_t = device.transpose(self.wv.blob(), d, d);
        let d_xq = device.matmul(&d_q, &wq_t, seq_len, d, d);
        let d_xk = device.matmul(&d_k, &wk_t, seq_len, d, d);
        let d_xv = device.matmul(&d_v, &wv_t, seq_len, d, d);

        let dx: Vec<f32> = d_xq
            .iter()
            .zip(d_xk.iter())
            .zip(d_xv.iter())
            .map(|((a, b), c)| a + b + c)
            .collect();
        Tensor::raw(&[seq_len, d], dx)
    }

    pub fn sgd_step(&mut self, sgd: &Sgd) {
        sgd.step(self.wq.blob_mut(), self.grad_wq.blob());
        sgd.step(self.wk.blob_mut(), self.grad_wk.blob());
        sgd.step(self.wv.blob_mut(), self.grad_wv.blob());
        sgd.step(self.wo.blob_mut(), self.grad_wo.blob());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn forward_preserves_sequence_shape() {
        let device = Device::cpu();
        let mut rng = StdRng::seed_from_u64(3);
        let mha = MultiHeadAttention::new(&mut rng, 8, 2);
        let x = Tensor::rand(&mut rng, &[5, 8]);
        let y = mha.forward(&device, &x).unwrap();
        assert_eq!(y.shape(), &[5, 8]);
        assert!(y.blob().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn split_and_merge_are_inverse() {
        let mut rng = StdRng::seed_from_u64(5);
        let mha = MultiHeadAttention::new(&mut rng, 6, 3);
        let flat: Vec<f32> = (0..4 * 6).map(|i| i as f32).collect();
        let heads = mha.split_heads(&flat, 4);
        assert_eq!(mha.merge_heads(&heads, 4), flat);
    }

    #[test]
    fn backward_produces_input_shaped_gradient() {
        let device = Device::cpu();
        let mut rng = StdRng::seed_from_u64(11);
        let mut mha = MultiHeadAttention::new(&mut rng, 8, 2);
        let x = Tensor::rand(&mut rng, &[4, 8]);
        let dy = Tensor::rand(&mut rng, &[4, 8]);
        let dx = mha.backward(&device, &x, &dy).unwrap();
        assert_eq!(dx.shape(), &[4, 8]);
        assert_eq!(mha.grad_wq.shape(), &[8, 8]);
        assert!(mha.grad_wo.blob().iter().any(|v| *v != 0.));
    }

    #[test]
    #[should_panic]
    fn indivisible_head_count_is_rejected() {
        MultiHeadAttention::new(&mut StdRng::seed_from_u64(0), 10, 3);
    }
}
