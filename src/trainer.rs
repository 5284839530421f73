use crate::device::Device;
use crate::loss;
use crate::model::GptModel;
use crate::optimizer::Sgd;
use crate::tensor::{Tensor, TensorError};

/// Drives one forward/backward/update cycle per batch.
///
/// Sequences in a batch are flattened to `[batch·seq_len × d_model]` rows and
/// flow through the blocks as one matrix. Each block's weights are stepped as
/// soon as its gradients materialize during the reverse walk.
pub struct Trainer {
    sgd: Sgd,
    pub loss_only_last: bool,
}

impl Trainer {
    pub fn new(learning_rate: f32, loss_only_last: bool) -> Self {
        Self {
            sgd: Sgd::new(learning_rate),
            loss_only_last,
        }
    }

    /// One training step over a batch of equal-length sequences. Returns the
    /// average cross-entropy over the scored positions.
    pub fn train_batch(
        &self,
        device: &Device,
        model: &mut GptModel,
        batch: &[Vec<usize>],
    ) -> Result<f32, TensorError> {
        if batch.is_empty() {
            return Ok(0.);
        }
        let b = batch.len();
        let t = batch[0].len();
        let vocab = model.config.vocab_size;

        // Next-token pairs: inputs are the sequences as-is, targets shifted
        // left by one with the final token repeated.
        let mut inputs = Vec::with_capacity(b * t);
        let mut targets = Vec::with_capacity(b);
        for seq in batch {
            if seq.len() != t {
                return Err(TensorError::ShapeMismatch {
                    expected: vec![t],
                    got: vec![seq.len()],
                });
            }
            inputs.extend_from_slice(seq);
            let mut tgt = Vec::with_capacity(t);
            for i in 0..t {
                tgt.push(if i + 1 < t { seq[i + 1] } else { seq[i] });
            }
            targets.push(tgt);
        }

        let mut x = model.embed(device, &inputs)?;
        let mut block_inputs = Vec::with_capacity(model.blocks.len());
        for block in &model.blocks {
            block_inputs.push(x.clone());
            x = block.forward(device, &x)?;
        }
        let normed = model.final_norm(device, &x)?;
        let logits = model.head.forward(device, &normed)?;

        let (loss, d_logits) = loss::cross_entropy_seq_batch(
            logits.blob(),
            b,
            t,
            vocab,
            &targets,
            self.loss_only_last,
        );
        let d_logits = Tensor::raw(&[b * t, vocab], d_logits)?;

        let d_normed = model.head.backward(device, &normed, &d_logits)?;
        let mut d_x = model.final_norm_backward(device, &x, &d_normed)?;

        for (block, input) in model.blocks.iter_mut().zip(block_inputs.iter()).rev() {
            d_x = block.backward(device, input, &d_x)?;
            block.sgd_step(&self.sgd);
        }

        model.embedding_step(&inputs, &d_x, &self.sgd)?;
        model.head.sgd_step(&self.sgd);

        Ok(loss)
    }

    /// Runs `sequences` through [`train_batch`](Self::train_batch) in chunks
    /// of `batch_size`, reporting each batch's loss through `on_batch`.
    pub fn train_epoch<F>(
        &self,
        device: &Device,
        model: &mut GptModel,
        sequences: &[Vec<usize>],
        batch_size: usize,
        mut on_batch: F,
    ) -> Result<(), TensorError>
    where
        F: FnMut(usize, f32),
    {
        for (i, chunk) in sequences.chunks(batch_size).enumerate() {
            let loss = self.train_batch(device, model, chunk)?;
            on_batch(i + 1, loss);
        }
        Ok(())
    }
}
