//! CPU reference implementations of every compute primitive.
//!
//! These are the ground truth the accelerated path is checked against, and
//! the fallback whenever a device is missing or has failed. Row-level work
//! is spread across threads with rayon; the inner loops are kept as plain
//! as possible.

use rayon::prelude::*;

/// `C[m×p] = A[m×n] · B[n×p]`, row-major.
pub fn matmul(a: &[f32], b: &[f32], m: usize, n: usize, p: usize) -> Vec<f32> {
    assert_eq!(a.len(), m * n);
    assert_eq!(b.len(), n * p);
    let mut out = vec![0.; m * p];
    out.par_chunks_mut(p).enumerate().for_each(|(i, row)| {
        for k in 0..n {
            let aik = a[i * n + k];
            for j in 0..p {
                row[j] += aik * b[k * p + j];
            }
        }
    });
    out
}

/// Numerically stable softmax over each row.
pub fn row_softmax(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    assert_eq!(x.len(), rows * cols);
    let mut out = vec![0.; rows * cols];
    out.par_chunks_mut(cols).enumerate().for_each(|(i, row)| {
        let inp = &x[i * cols..(i + 1) * cols];
        let max = inp.iter().fold(f32::NEG_INFINITY, |a, b| a.max(*b));
        let sum = inp.iter().map(|v| (v - max).exp()).sum::<f32>();
        for (o, v) in row.iter_mut().zip(inp.iter()) {
            *o = (v - max).exp() / sum;
        }
    });
    out
}

/// Given softmax output `a` and its upstream gradient `da`, computes the
/// gradient w.r.t. the softmax input: `dx = (da - Σ(da·a)) · a` per row.
pub fn row_softmax_backward(a: &[f32], da: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    assert_eq!(a.len(), rows * cols);
    assert_eq!(da.len(), rows * cols);
    let mut out = vec![0.; rows * cols];
    out.par_chunks_mut(cols).enumerate().for_each(|(i, row)| {
        let ar = &a[i * cols..(i + 1) * cols];
        let dar = &da[i * cols..(i + 1) * cols];
        let dot = ar.iter().zip(dar.iter()).map(|(y, dy)| y * dy).sum::<f32>();
        for j in 0..cols {
            row[j] = (dar[j] - dot) * ar[j];
        }
    });
    out
}

pub fn transpose(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    assert_eq!(x.len(), rows * cols);
    let mut out = vec![0.; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = x[i * cols + j];
        }
    }
    out
}

pub fn scale_in_place(x: &mut [f32], s: f32) {
    for v in x.iter_mut() {
        *v *= s;
    }
}

/// Copies one `dim`-wide embedding row per token id into the output.
pub fn embedding_gather(ids: &[usize], table: &[f32], dim: usize) -> Vec<f32> {
    let mut out = vec![0.; ids.len() * dim];
    for (i, &t) in ids.iter().enumerate() {
        out[i * dim..(i + 1) * dim].copy_from_slice(&table[t * dim..(t + 1) * dim]);
    }
    out
}

/// Rotates each even/odd feature pair of every row by an angle that grows
/// with the row position: `angle = pos / 10000^(2i/dim)`.
pub fn rotary(buf: &mut [f32], rows: usize, dim: usize) {
    assert_eq!(buf.len(), rows * dim);
    for pos in 0..rows {
        let row = &mut buf[pos * dim..(pos + 1) * dim];
        let mut i = 0;
        while i < dim {
            let angle = pos as f32 / 10000f32.powf(2. * i as f32 / dim as f32);
            let (s, c) = angle.sin_cos();
            let even = row[i];
            let odd = if i + 1 < dim { row[i + 1] } else { 0. };
            row[i] = even * c - odd * s;
            if i + 1 < dim {
                row[i + 1] = even * s + odd * c;
            }
            i += 2;
        }
    }
}

/// Per-row normalization. Returns the normalized rows along with each row's
/// mean and inverse standard deviation, which the backward pass reuses.
pub fn layer_norm_forward(
    x: &[f32],
    rows: usize,
    cols: usize,
    eps: f32,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    assert_eq!(x.len(), rows * cols);
    let mut y = vec![0.; rows * cols];
    let mut mean = vec![0.; rows];
    let mut inv_std = vec![0.; rows];
    y.par_chunks_mut(cols)
        .zip(mean.par_iter_mut())
        .zip(inv_std.par_iter_mut())
        .enumerate()
        .for_each(|(i, ((row, mu), inv))| {
            let inp = &x[i * cols..(i + 1) * cols];
            *mu = inp.iter().sum::<f32>() / cols as f32;
            let var = inp.iter().map(|v| (v - *mu).powi(2)).sum::<f32>() / cols as f32;
            *inv = 1. / (var + eps).sqrt();
            for (o, v) in row.iter_mut().zip(inp.iter()) {
                *o = (v - *mu) * *inv;
            }
        });
    (y, mean, inv_std)
}

/// Closed-form layer-norm input gradient:
/// `dx_j = (1/C)·invStd·(C·dy_j - Σdy - xhat_j·Σ(dy·xhat))`.
pub fn layer_norm_backward(
    x: &[f32],
    dy: &[f32],
    mean: &[f32],
    inv_std: &[f32],
    rows: usize,
    cols: usize,
) -> Vec<f32> {
    assert_eq!(x.len(), rows * cols);
    assert_eq!(dy.len(), rows * cols);
    let mut dx = vec![0.; rows * cols];
    dx.par_chunks_mut(cols).enumerate().for_each(|(i, row)| {
        let xr = &x[i * cols..(i + 1) * cols];
        let dyr = &dy[i * cols..(i + 1) * cols];
        let mu = mean[i];
        let inv = inv_std[i];
        let mut sum_dy = 0.;
        let mut sum_dy_xhat = 0.;
        for j in 0..cols {
            let xhat = (xr[j] - mu) * inv;
            sum_dy += dyr[j];
            sum_dy_xhat += dyr[j] * xhat;
        }
        let cf = cols as f32;
        for j in 0..cols {
            let xhat = (xr[j] - mu) * inv;
            row[j] = 1. / cf * inv * (cf * dyr[j] - sum_dy - xhat * sum_dy_xhat);
        }
    });
    dx
}
