/// Minimal tensor utilities for the masked autoencoder.
///
/// All operations are free functions on flat f32 slices with explicit dimensions.
/// Row-major layout throughout. `Tensor` only exists at the public boundary,
/// where shapes have to be checked against the configuration.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{check_len, MaeError, MaeResult};

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; n],
            shape: shape.to_vec(),
        }
    }

    /// Wrap `data` with `shape`, failing if the element counts disagree.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> MaeResult<Self> {
        let n: usize = shape.iter().product();
        check_len("tensor construction", n, data.len())?;
        Ok(Tensor { data, shape: shape.to_vec() })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Interpret as a 2-D `[rows, cols]` batch. Extra unit axes are allowed
    /// between the two (so `[B, 1, N]` reads as `[B, N]`).
    pub fn as_batch(&self) -> MaeResult<(usize, usize)> {
        let rows = *self.shape.first().ok_or(MaeError::EmptyBatch)?;
        if rows == 0 {
            return Err(MaeError::EmptyBatch);
        }
        if self.shape.len() < 2 || self.shape[1..self.shape.len() - 1].iter().any(|&d| d != 1) {
            return Err(MaeError::InvalidConfig(format!(
                "expected a [batch, features] tensor, got shape {:?}", self.shape
            )));
        }
        Ok((rows, self.shape[self.shape.len() - 1]))
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Dense layer: out[R, D_out] = x[R, D_in] @ W^T + b.
/// `w` is stored `[d_out, d_in]` (PyTorch layout), `b` is `[d_out]`.
pub fn linear_f32(
    x: &[f32],
    w: &[f32],
    b: &[f32],
    out: &mut [f32],
    rows: usize,
    d_in: usize,
    d_out: usize,
) {
    debug_assert_eq!(x.len(), rows * d_in);
    debug_assert_eq!(w.len(), d_out * d_in);
    debug_assert_eq!(b.len(), d_out);
    debug_assert_eq!(out.len(), rows * d_out);

    for r in 0..rows {
        let xr = &x[r * d_in..(r + 1) * d_in];
        for o in 0..d_out {
            let wo = &w[o * d_in..(o + 1) * d_in];
            let mut sum = b[o];
            for i in 0..d_in {
                sum += xr[i] * wo[i];
            }
            out[r * d_out + o] = sum;
        }
    }
}

/// Row-wise softmax: each row of length `cols` in `scores` gets softmaxed into `out`.
/// `rows` * `cols` elements.
pub fn softmax_f32(scores: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(scores.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);

    for r in 0..rows {
        let base = r * cols;
        let row = &scores[base..base + cols];

        // Numerically stable: subtract max
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for c in 0..cols {
            let e = (row[c] - max_val).exp();
            out[base + c] = e;
            sum_exp += e;
        }
        if sum_exp > 0.0 {
            for c in 0..cols {
                out[base + c] /= sum_exp;
            }
        }
    }
}

/// Layer normalization over the last axis: each of `rows` rows of length `dim`
/// is normalized to zero mean / unit variance, then scaled by `gamma` and
/// shifted by `beta`. Biased variance, like torch.nn.LayerNorm.
pub fn layer_norm_f32(
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    out: &mut [f32],
    rows: usize,
    dim: usize,
    eps: f32,
) {
    debug_assert_eq!(x.len(), rows * dim);
    debug_assert_eq!(out.len(), rows * dim);
    debug_assert_eq!(gamma.len(), dim);
    debug_assert_eq!(beta.len(), dim);

    for r in 0..rows {
        let row = &x[r * dim..(r + 1) * dim];
        let mean = row.iter().sum::<f32>() / dim as f32;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
        let inv_std = 1.0 / (var + eps).sqrt();
        for i in 0..dim {
            out[r * dim + i] = (row[i] - mean) * inv_std * gamma[i] + beta[i];
        }
    }
}

/// Element-wise add: out[i] = a[i] + b[i].
pub fn add_f32(a: &[f32], b: &[f32], out: &mut [f32]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for i in 0..a.len() {
        out[i] = a[i] + b[i];
    }
}

/// In-place accumulate: acc[i] += b[i].
pub fn add_assign_f32(acc: &mut [f32], b: &[f32]) {
    debug_assert_eq!(acc.len(), b.len());
    for (a, &v) in acc.iter_mut().zip(b) {
        *a += v;
    }
}

/// GELU, tanh approximation (matches torch `approximate="tanh"`, not the
/// default erf form).
#[inline]
pub fn gelu_f32(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_6;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
}

// ── Initialization ───────────────────────────────────────────────────

/// Fill slice with uniform random values in [-scale, scale].
pub fn fill_uniform<R: Rng + ?Sized>(rng: &mut R, buf: &mut [f32], scale: f32) {
    if scale <= 0.0 {
        buf.fill(0.0);
        return;
    }
    for v in buf.iter_mut() {
        *v = rng.gen_range(-scale..=scale);
    }
}

/// Fill slice from N(0, std²) truncated to [-2·std, 2·std] by rejection.
pub fn fill_trunc_normal<R: Rng + ?Sized>(rng: &mut R, buf: &mut [f32], std: f32) {
    let normal = match Normal::new(0.0f32, std) {
        Ok(n) if std > 0.0 => n,
        _ => {
            buf.fill(0.0);
            return;
        }
    };
    let bound = 2.0 * std;
    for v in buf.iter_mut() {
        *v = loop {
            let s = normal.sample(rng);
            if s.abs() <= bound {
                break s;
            }
        };
    }
}
