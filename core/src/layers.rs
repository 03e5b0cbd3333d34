//! Learnable dense and normalization layers.
//!
//! Weights are flat `Vec<f32>`, row-major, `[d_out, d_in]` for dense layers.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{check_len, MaeResult};
use crate::tensor::{fill_uniform, layer_norm_f32, linear_f32};

pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Dense layer `y = x W^T + b`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub d_in: usize,
    pub d_out: usize,
    /// [d_out, d_in]
    pub weight: Vec<f32>,
    /// [d_out]
    pub bias: Vec<f32>,
}

impl Linear {
    /// U(±1/sqrt(d_in)) for weights and bias, the torch default.
    pub fn init<R: Rng + ?Sized>(d_in: usize, d_out: usize, rng: &mut R) -> Self {
        let bound = if d_in > 0 { 1.0 / (d_in as f32).sqrt() } else { 0.0 };
        let mut weight = vec![0.0f32; d_out * d_in];
        fill_uniform(rng, &mut weight, bound);
        let mut bias = vec![0.0f32; d_out];
        fill_uniform(rng, &mut bias, bound);
        Linear { d_in, d_out, weight, bias }
    }

    pub fn zeros(d_in: usize, d_out: usize) -> Self {
        Linear {
            d_in,
            d_out,
            weight: vec![0.0; d_out * d_in],
            bias: vec![0.0; d_out],
        }
    }

    /// Apply to `rows` stacked inputs of width `d_in`.
    pub fn forward(&self, x: &[f32], rows: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; rows * self.d_out];
        linear_f32(x, &self.weight, &self.bias, &mut out, rows, self.d_in, self.d_out);
        out
    }

    pub fn num_params(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub(crate) fn check(&self, context: &'static str, d_in: usize, d_out: usize) -> MaeResult<()> {
        check_len(context, d_in, self.d_in)?;
        check_len(context, d_out, self.d_out)?;
        check_len(context, d_out * d_in, self.weight.len())?;
        check_len(context, d_out, self.bias.len())
    }
}

/// Layer normalization with learned scale and shift.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerNorm {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
}

impl LayerNorm {
    pub fn new(dim: usize) -> Self {
        LayerNorm { gamma: vec![1.0; dim], beta: vec![0.0; dim] }
    }

    pub fn dim(&self) -> usize {
        self.gamma.len()
    }

    pub fn forward(&self, x: &[f32], rows: usize) -> Vec<f32> {
        let dim = self.dim();
        let mut out = vec![0.0f32; rows * dim];
        layer_norm_f32(x, &self.gamma, &self.beta, &mut out, rows, dim, LAYER_NORM_EPS);
        out
    }

    pub fn num_params(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    pub(crate) fn check(&self, context: &'static str, dim: usize) -> MaeResult<()> {
        check_len(context, dim, self.gamma.len())?;
        check_len(context, dim, self.beta.len())
    }
}
