use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::device::Device;
use crate::layers::{layer_norm, Linear, TransformerBlock};
use crate::optimizer::Sgd;
use crate::tensor::{Tensor, TensorError};

/// Decoder-only transformer: token embedding, a stack of post-norm blocks, a
/// parameter-free final row normalization and a linear head to vocabulary
/// logits.
#[derive(Debug, Serialize, Deserialize)]
pub struct GptModel {
    pub config: Config,
    pub embedding: Tensor,
    pub blocks: Vec<TransformerBlock>,
    pub head: Linear,
}

impl GptModel {
    pub fn new<R: Rng>(rng: &mut R, config: Config) -> Self {
        let blocks = (0..config.num_layers)
            .map(|_| TransformerBlock::new(rng, config.d_model, config.num_heads))
            .collect();
        Self {
            embedding: Tensor::rand(rng, &[config.vocab_size, config.d_model]),
            head: Linear::new(rng, config.d_model, config.vocab_size),
            blocks,
            config,
        }
    }

    pub fn num_params(&self) -> usize {
        let per_block: usize = self
            .blocks
            .iter()
            .map(|b| {
                b.attn.wq.size() * 4
                    + b.ffn.w1.size()
                    + b.ffn.w2.size()
                    + b.norm1.gamma.size() * 2
                    + b.norm2.gamma.size() * 2
            })
            .sum();
        self.embedding.size() + per_block + self.head.weight.size() + self.head.bias.size()
    }

    /// Token ids to embedding rows. Out-of-vocabulary ids are clamped to the
    /// last row.
    pub fn embed(&self, device: &Device, tokens: &[usize]) -> Result<Tensor, TensorError> {
        let clamped: Vec<usize> = tokens
            .iter()
            .map(|t| (*t).min(self.config.vocab_size - 1))
            .collect();
        let out = device.embedding_gather(&clamped, self.embedding.blob(), self.config.d_model);
        Tensor::raw(&[tokens.len(), self.config.d_model], out)
    }

    /// The parameter-free normalization between the last block and the head.
    pub fn final_norm(&self, device: &Device, x: &Tensor) -> Result<Tensor, TensorError> {
        let rows = x.expect_cols(self.config.d_model)?;
        let (y, _, _) = device.layer_norm_forward(x.blob(), rows, self.config.d_model, layer_norm::EPS);
        Tensor::raw(x.shape(), y)
    }

    pub fn final_norm_backward(
        &self,
        device: &Device,
        x: &Tensor,
        dy: &Tensor,
    ) -> Result<Tensor, TensorError> {
        let rows = x.expect_cols(self.config.d_model)?;
        dy.expect_shape(x.shape())?;
        let (_, mean, inv_std) =
            device.layer_norm_forward(x.blob(), rows, self.config.d_model, layer_norm::EPS);
        let dx = device.layer_norm_backward(
            x.blob(),
            dy.blob(),
            &mean,
            &inv_std,
            rows,
            self.config.d_model,
        );
        Tensor::raw(x.shape(), dx)
    }

    /// Full forward pass: `[seq_len]` token ids to `[seq_len × vocab]` logits.
    pub fn forward(&self, device: &Device, tokens: &[usize]) -> Result<Tensor, TensorError> {
        let mut x = self.embed(device, tokens)?;
        for block in &self.blocks {
            x = block.forward(device, &x)?;
        }
        let normed = self.final_norm(device, &x)?;
        self.head.forward(device, &normed)
    }

    /// Scatter-adds the embedding gradient and applies one SGD step to the
    /// table. Duplicate token ids accumulate additively.
    pub fn embedding_step(
        &mut self,
        tokens: &[usize],
        d_x: &Tensor,
        sgd: &Sgd,
    ) -> Result<(), TensorError> {
        let dim = self.config.d_model;
        d_x.expect_shape(&[tokens.len(), dim])?;
        let mut d_table = vec![0.; self.embedding.size()];
        for (i, t) in tokens.iter().enumerate() {
            let t = (*t).min(self.config.vocab_size - 1);
            for j in 0..dim {
                d_table[t * dim + j] += d_x.blob()[i * dim + j];
            }
        }
        sgd.step(self.embedding.blob_mut(), &d_table);
        Ok(())
    }

    /// Most likely next token after the given context.
    pub fn predict_next(&self, device: &Device, tokens: &[usize]) -> Result<usize, TensorError> {
        let logits = self.forward(device, tokens)?;
        let vocab = self.config.vocab_size;
        let last = &logits.blob()[(tokens.len() - 1) * vocab..];
        let mut best = 0;
        for (i, v) in last.iter().enumerate() {
            if *v > last[best] {
                best = i;
            }
        }
        Ok(best)
    }

    /// Samples `count` tokens after `prompt`, feeding each sample back in.
    /// The context window slides once it exceeds the configured size.
    pub fn generate<R: Rng>(
        &self,
        device: &Device,
        rng: &mut R,
        prompt: &[usize],
        count: usize,
        temperature: f32,
    ) -> Result<Vec<usize>, TensorError> {
        let vocab = self.config.vocab_size;
        let mut context = prompt.to_vec();
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            if context.len() > self.config.context_size {
                context.drain(..context.len() - self.config.context_size);
            }
            let logits = self.forward(device, &context)?;
            let last = &logits.blob()[(context.len() - 1) * vocab..];
            let next = sample_row(rng, last, temperature);
            context.push(next);
            out.push(next);
        }
        Ok(out)
    }
}

fn sample_row<R: Rng>(rng: &mut R, logits: &[f32], temperature: f32) -> usize {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, b| a.max(*b));
    let probs: Vec<f32> = logits
        .iter()
        .map(|l| ((l - max) / temperature.max(1e-6)).exp())
        .collect();
    let sum = probs.iter().sum::<f32>();
    let mut pick = rng.gen::<f32>() * sum;
    for (i, p) in probs.iter().enumerate() {
        pick -= p;
        if pick <= 0. {
            return i;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_config() -> Config {
        Config {
            vocab_size: 12,
            d_model: 8,
            num_heads: 2,
            num_layers: 2,
            context_size: 16,
            learning_rate: 0.01,
            device_preference: None,
        }
    }

    #[test]
    fn forward_emits_vocab_logits_per_position() {
        let device = Device::cpu();
        let mut rng = StdRng::seed_from_u64(1);
        let model = GptModel::new(&mut rng, tiny_config());
        let logits = model.forward(&device, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(logits.shape(), &[5, 12]);
    }

    #[test]
    fn embedding_step_accumulates_duplicates() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut model = GptModel::new(&mut rng, tiny_config());
        model.embedding = Tensor::zeros(&[12, 8]);
        let d_x = Tensor::ones(&[3, 8]);
        // Token 5 appears twice, so its row accumulates twice the gradient.
        model
            .embedding_step(&[5, 1, 5], &d_x, &Sgd::new(1.))
            .unwrap();
        let row5 = &model.embedding.blob()[5 * 8..6 * 8];
        let row1 = &model.embedding.blob()[8..16];
        assert!(row5.iter().all(|v| (*v + 2.).abs() < 1e-6));
        assert!(row1.iter().all(|v| (*v + 1.).abs() < 1e-6));
    }

    #[test]
    fn generate_respects_count_and_vocab() {
        let device = Device::cpu();
        let mut rng = StdRng::seed_from_u64(3);
        let model = GptModel::new(&mut rng, tiny_config());
        let out = model.generate(&device, &mut rng, &[0, 1], 10, 1.0).unwrap();
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|t| *t < 12));
    }
}
