/// Multi-head self-attention block, the transformer primitive shared by
/// both encoders and both decoders.
///
/// Pre-norm layout:
///   x = x + proj(MHSA(LN1(x)))
///   x = x + fc2(GELU(fc1(LN2(x))))
///
/// Attention is full and bidirectional: every token sees every other token of
/// the same sample. Q/K/V are [len, num_heads * head_dim]; head h owns the
/// column slice [h*head_dim, (h+1)*head_dim). Scale is 1/sqrt(head_dim).

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{check_len, MaeError, MaeResult};
use crate::layers::{LayerNorm, Linear};
use crate::reindex::{batch_to_tokens_major, tokens_to_batch_major};
use crate::tensor::{add_assign_f32, gelu_f32, softmax_f32};

/// Scaled dot-product attention, queries over keys, no masking.
///
/// Inputs (row-major flat slices):
///   q: [q_len, num_heads * head_dim]
///   k: [k_len, num_heads * head_dim]
///   v: [k_len, num_heads * head_dim]
///
/// Output:
///   out: [q_len, num_heads * head_dim]
///   attn_weights: [num_heads, q_len, k_len], softmax weights
#[allow(clippy::too_many_arguments)]
pub fn attention_forward(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    out: &mut [f32],
    attn_weights: &mut [f32],
    q_len: usize,
    k_len: usize,
    num_heads: usize,
    head_dim: usize,
) {
    let total_dim = num_heads * head_dim;
    debug_assert_eq!(q.len(), q_len * total_dim);
    debug_assert_eq!(k.len(), k_len * total_dim);
    debug_assert_eq!(v.len(), k_len * total_dim);
    debug_assert_eq!(out.len(), q_len * total_dim);
    debug_assert_eq!(attn_weights.len(), num_heads * q_len * k_len);

    let scale = 1.0 / (head_dim as f32).sqrt();

    out.fill(0.0);
    let mut scores = vec![0.0f32; k_len];

    for h in 0..num_heads {
        let h_offset = h * head_dim;

        for q_pos in 0..q_len {
            for k_pos in 0..k_len {
                let mut dot = 0.0f32;
                for d in 0..head_dim {
                    dot += q[q_pos * total_dim + h_offset + d]
                         * k[k_pos * total_dim + h_offset + d];
                }
                scores[k_pos] = dot * scale;
            }

            let aw_base = (h * q_len + q_pos) * k_len;
            softmax_f32(&scores, &mut attn_weights[aw_base..aw_base + k_len], 1, k_len);

            // Weighted sum of values
            for k_pos in 0..k_len {
                let weight = attn_weights[aw_base + k_pos];
                for d in 0..head_dim {
                    out[q_pos * total_dim + h_offset + d] +=
                        weight * v[k_pos * total_dim + h_offset + d];
                }
            }
        }
    }
}

/// Weights for one transformer block. MLP hidden width is `fc1.d_out`.
///
/// Not weight-compatible with a timm ViT `Block` built with `qkv_bias=False`:
/// `qkv` here carries a bias, and the MLP uses the tanh approximation of GELU
/// rather than the exact erf form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockParams {
    pub norm1: LayerNorm,
    /// [3*dim, dim]: rows 0..dim → Q, dim..2dim → K, 2dim..3dim → V.
    pub qkv: Linear,
    pub proj: Linear,
    pub norm2: LayerNorm,
    pub fc1: Linear,
    pub fc2: Linear,
}

impl BlockParams {
    pub fn init<R: Rng + ?Sized>(dim: usize, mlp_hidden: usize, rng: &mut R) -> Self {
        BlockParams {
            norm1: LayerNorm::new(dim),
            qkv: Linear::init(dim, 3 * dim, rng),
            proj: Linear::init(dim, dim, rng),
            norm2: LayerNorm::new(dim),
            fc1: Linear::init(dim, mlp_hidden, rng),
            fc2: Linear::init(mlp_hidden, dim, rng),
        }
    }

    pub fn num_params(&self) -> usize {
        self.norm1.num_params() + self.qkv.num_params() + self.proj.num_params()
            + self.norm2.num_params() + self.fc1.num_params() + self.fc2.num_params()
    }

    pub(crate) fn check(&self, dim: usize, mlp_hidden: usize) -> MaeResult<()> {
        self.norm1.check("block norm1", dim)?;
        self.qkv.check("block qkv", dim, 3 * dim)?;
        self.proj.check("block proj", dim, dim)?;
        self.norm2.check("block norm2", dim)?;
        self.fc1.check("block fc1", dim, mlp_hidden)?;
        self.fc2.check("block fc2", mlp_hidden, dim)
    }
}

/// Multi-head self-attention over one sample `x: [len, dim]`, including the
/// qkv and output projections.
pub fn self_attention(params: &BlockParams, x: &[f32], len: usize, num_heads: usize) -> Vec<f32> {
    let dim = params.proj.d_out;
    let head_dim = dim / num_heads;

    let qkv = params.qkv.forward(x, len);
    let mut q = vec![0.0f32; len * dim];
    let mut k = vec![0.0f32; len * dim];
    let mut v = vec![0.0f32; len * dim];
    for t in 0..len {
        let row = &qkv[t * 3 * dim..(t + 1) * 3 * dim];
        q[t * dim..(t + 1) * dim].copy_from_slice(&row[..dim]);
        k[t * dim..(t + 1) * dim].copy_from_slice(&row[dim..2 * dim]);
        v[t * dim..(t + 1) * dim].copy_from_slice(&row[2 * dim..]);
    }

    let mut attn_out = vec![0.0f32; len * dim];
    let mut attn_weights = vec![0.0f32; num_heads * len * len];
    attention_forward(&q, &k, &v, &mut attn_out, &mut attn_weights, len, len, num_heads, head_dim);

    params.proj.forward(&attn_out, len)
}

/// One pre-norm block over one sample `x: [len, dim]`.
pub fn block_forward(params: &BlockParams, x: &[f32], len: usize, num_heads: usize) -> Vec<f32> {
    let mut h = x.to_vec();

    let normed = params.norm1.forward(&h, len);
    let attn = self_attention(params, &normed, len, num_heads);
    add_assign_f32(&mut h, &attn);

    let normed = params.norm2.forward(&h, len);
    let mut hidden = params.fc1.forward(&normed, len);
    for x in hidden.iter_mut() {
        *x = gelu_f32(*x);
    }
    let mlp = params.fc2.forward(&hidden, len);
    add_assign_f32(&mut h, &mlp);

    h
}

/// Run a block stack over a `[tokens, batch, dim]` sequence, each sample
/// independently. Returns the same layout.
pub fn run_blocks(
    blocks: &[BlockParams],
    seq: &[f32],
    tokens: usize,
    batch: usize,
    dim: usize,
    num_heads: usize,
) -> MaeResult<Vec<f32>> {
    check_len("block stack input", tokens * batch * dim, seq.len())?;
    if num_heads == 0 || dim % num_heads != 0 {
        return Err(MaeError::InvalidConfig(format!(
            "embedding dim {dim} is not divisible by {num_heads} heads"
        )));
    }
    if blocks.is_empty() {
        return Ok(seq.to_vec());
    }

    let mut per_sample = tokens_to_batch_major(seq, tokens, batch, dim);
    let span = tokens * dim;
    for b in 0..batch {
        let mut x = per_sample[b * span..(b + 1) * span].to_vec();
        for block in blocks {
            x = block_forward(block, &x, tokens, num_heads);
        }
        per_sample[b * span..(b + 1) * span].copy_from_slice(&x);
    }
    Ok(batch_to_tokens_major(&per_sample, tokens, batch, dim))
}
