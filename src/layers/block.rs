use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::layers::{FeedForward, LayerNorm, MultiHeadAttention};
use crate::optimizer::Sgd;
use crate::tensor::{Tensor, TensorError};

/// Post-norm transformer block:
/// `norm2(norm1(x + attn(x)) + ffn(norm1(x + attn(x))))`.
///
/// Forward intermediates are not cached; the backward pass recomputes them
/// from the block input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerBlock {
    pub attn: MultiHeadAttention,
    pub ffn: FeedForward,
    pub norm1: LayerNorm,
    pub norm2: LayerNorm,
}

impl TransformerBlock {
    pub fn new<R: Rng>(rng: &mut R, d_model: usize, num_heads: usize) -> Self {
        Self {
            attn: MultiHeadAttention::new(rng, d_model, num_heads),
            ffn: FeedForward::new(rng, d_model, d_model * 4),
            norm1: LayerNorm::new(d_model),
            norm2: LayerNorm::new(d_model),
        }
    }

    pub fn forward(&self, device: &Device, x: &Tensor) -> Result<Tensor, TensorError> {
        let attn_out = self.attn.forward(device, x)?;
        let add1 = x.add(&attn_out)?;
        let norm1_out = self.norm1.forward(device, &add1)?;

        let ffn_out = self.ffn.forward(device, &norm1_out)?;
        let add2 = norm1_out.add(&ffn_out)?;
        self.norm2.forward(device, &add2)
    }

    /// Mirrors the forward composition in reverse and leaves each sub-layer's
    /// parameter gradients behind for [`sgd_step`](Self::sgd_step).
    pub fn backward(&mut self, device: &Device, x: &Tensor, dy: &Tensor) -> Result<Tensor, TensorError> {
        let attn_out = self.attn.forward(device, x)?;
        let add1 = x.add(&attn_out)?;
        let norm1_out = self.norm1.forward(device, &add1)?;
        let ffn_out = self.ffn.forward(device, &norm1_out)?;
        let add2 = norm1_out.add(&ffn_out)?;

        let d_add2 = self.norm2.backward(device, &add2, dy)?;
        let d_ffn_in = self.ffn.backward(device, &norm1_out, &d_add2)?;
        let d_norm1 = d_add2.add(&d_ffn_in)?;

        let d_add1 = self.norm1.backward(device, &add1, &d_norm1)?;
        let d_attn_in = self.attn.backward(device, x, &d_add1)?;
        d_add1.add(&d_attn_in)
    }

    pub fn sgd_step(&mut self, sgd: &Sgd) {
        self.attn.sgd_step(sgd);
        self.ffn.sgd_step(sgd);
        self.norm1.sgd_step(sgd);
        self.norm2.sgd_step(sgd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn forward_and_backward_keep_shapes() {
        let device = Device::cpu();
        let mut rng = StdRng::seed_from_u64(21);
        let mut block = TransformerBlock::new(&mut rng, 8, 2);
        let x = Tensor::rand(&mut rng, &[6, 8]);
        let y = block.forward(&device, &x).unwrap();
        assert_eq!(y.shape(), &[6, 8]);

        let dy = Tensor::rand(&mut rng, &[6, 8]);
        let dx = block.backward(&device, &x, &dy).unwrap();
        assert_eq!(dx.shape(), &[6, 8]);
        assert!(dx.blob().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn output_rows_are_normalized() {
        let device = Device::cpu();
        let mut rng = StdRng::seed_from_u64(8);
        let block = TransformerBlock::new(&mut rng, 16, 4);
        let x = Tensor::rand(&mut rng, &[4, 16]);
        let y = block.forward(&device, &x).unwrap();
        // Fresh gamma/beta are identity, so the post-norm output is
        // row-normalized.
        for row in y.blob().chunks(16) {
            let mean = row.iter().sum::<f32>() / 16.;
            assert!(mean.abs() < 1e-4);
        }
    }
}
