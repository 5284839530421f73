//! Cross-entropy loss over next-token logits, with its analytic gradient
//! `softmax(logits) - onehot(target)` computed in the same pass.

/// Loss and logit gradient for a single vocabulary row. Max-subtracted for
/// numerical stability.
pub fn cross_entropy(logits: &[f32], target: usize) -> (f32, Vec<f32>) {
    let vocab = logits.len();
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, b| a.max(*b));
    let sum_exp = logits.iter().map(|l| (l - max).exp()).sum::<f32>();
    let loss = -(logits[target] - max - sum_exp.ln());
    let mut d_logits = Vec::with_capacity(vocab);
    for l in logits {
        d_logits.push((l - max).exp() / sum_exp);
    }
    d_logits[target] -= 1.;
    (loss, d_logits)
}

/// Batched sequence loss over `[batch * seq_len, vocab]` logits.
///
/// With `only_last` set, only the final position of each sequence is scored.
/// The total is divided by the number of scored positions. Target ids outside
/// `[0, vocab)` are skipped and contribute neither loss nor gradient.
pub fn cross_entropy_seq_batch(
    logits: &[f32],
    batch: usize,
    seq_len: usize,
    vocab: usize,
    targets: &[Vec<usize>],
    only_last: bool,
) -> (f32, Vec<f32>) {
    debug_assert_eq!(logits.len(), batch * seq_len * vocab);
    let mut d_logits = vec![0.; batch * seq_len * vocab];
    let mut total = 0.;
    let mut scored = 0usize;
    for b in 0..batch {
        for t in 0..seq_len {
            if only_last && t != seq_len - 1 {
                continue;
            }
            let target = targets[b][t];
            if target >= vocab {
                continue;
            }
            let off = (b * seq_len + t) * vocab;
            let (loss, d_row) = cross_entropy(&logits[off..off + vocab], target);
            total += loss;
            d_logits[off..off + vocab].copy_from_slice(&d_row);
            scored += 1;
        }
    }
    (total / scored.max(1) as f32, d_logits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_logits_give_log_vocab_loss() {
        let (loss, d) = cross_entropy(&[0., 0., 0., 0.], 2);
        assert!((loss - 4f32.ln()).abs() < 1e-6);
        // Gradient sums to zero: softmax mass minus the one-hot.
        assert!(d.iter().sum::<f32>().abs() < 1e-6);
        assert!(d[2] < 0.);
    }

    #[test]
    fn confident_correct_prediction_has_low_loss() {
        let (loss, _) = cross_entropy(&[10., -10., -10.], 0);
        assert!(loss < 1e-3);
    }

    #[test]
    fn only_last_scores_one_position_per_sequence() {
        let logits = vec![0.; 2 * 3 * 4];
        let targets = vec![vec![0, 1, 2], vec![3, 0, 1]];
        let (loss, d) = cross_entropy_seq_batch(&logits, 2, 3, 4, &targets, true);
        assert!((loss - 4f32.ln()).abs() < 1e-5);
        // Only the last row of each sequence carries gradient.
        assert!(d[..2 * 4].iter().all(|v| *v == 0.));
        assert!(d[2 * 4..3 * 4].iter().any(|v| *v != 0.));
    }

    #[test]
    fn out_of_range_targets_are_skipped() {
        let logits = vec![0.; 2 * 4];
        let targets = vec![vec![9, 1]];
        let (loss, d) = cross_entropy_seq_batch(&logits, 1, 2, 4, &targets, false);
        assert!((loss - 4f32.ln()).abs() < 1e-5);
        assert!(d[..4].iter().all(|v| *v == 0.));
    }
}
