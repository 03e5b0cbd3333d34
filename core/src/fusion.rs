//! Cross-modality fusion through the summary tokens.
//!
//! Each modality's summary token queries the other modality's summary token
//! (single-token attention, scale 1/sqrt(emb_dim)) and the LayerNormed result
//! replaces row 0 of that modality's encoded sequence. The substituted
//! sequence is then added to the pre-fusion sequence, so:
//!   row 0  = fused + original summary
//!   rows ≥1 = 2 × original token
//! Only the summary position receives cross-modal signal.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attention::attention_forward;
use crate::encoder::EncoderOutput;
use crate::error::{check_len, MaeError, MaeResult};
use crate::layers::{LayerNorm, Linear};
use crate::tensor::add_f32;

/// Query/key/value projections and output norm for one direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrossAttentionParams {
    pub query: Linear,
    pub key: Linear,
    pub value: Linear,
    pub norm: LayerNorm,
}

impl CrossAttentionParams {
    pub fn init<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Self {
        CrossAttentionParams {
            query: Linear::init(dim, dim, rng),
            key: Linear::init(dim, dim, rng),
            value: Linear::init(dim, dim, rng),
            norm: LayerNorm::new(dim),
        }
    }

    pub fn num_params(&self) -> usize {
        self.query.num_params() + self.key.num_params() + self.value.num_params()
            + self.norm.num_params()
    }

    pub(crate) fn check(&self, dim: usize) -> MaeResult<()> {
        self.query.check("cross-attention query", dim, dim)?;
        self.key.check("cross-attention key", dim, dim)?;
        self.value.check("cross-attention value", dim, dim)?;
        self.norm.check("cross-attention norm", dim)
    }
}

/// Both fusion directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusionParams {
    /// Modality A's summary attends to modality B.
    pub a_from_b: CrossAttentionParams,
    /// Modality B's summary attends to modality A.
    pub b_from_a: CrossAttentionParams,
}

impl FusionParams {
    pub fn init<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Self {
        FusionParams {
            a_from_b: CrossAttentionParams::init(dim, rng),
            b_from_a: CrossAttentionParams::init(dim, rng),
        }
    }

    pub fn num_params(&self) -> usize {
        self.a_from_b.num_params() + self.b_from_a.num_params()
    }

    pub(crate) fn check(&self, dim: usize) -> MaeResult<()> {
        self.a_from_b.check(dim)?;
        self.b_from_a.check(dim)
    }
}

/// Single-head cross attention per sample.
///
/// query:   [batch, q_len, dim]
/// context: [batch, k_len, dim] (keys and values)
/// returns  [batch, q_len, dim], LayerNormed.
pub fn cross_attention(
    params: &CrossAttentionParams,
    query: &[f32],
    context: &[f32],
    batch: usize,
    q_len: usize,
    k_len: usize,
) -> MaeResult<Vec<f32>> {
    let dim = params.norm.dim();
    check_len("cross-attention query", batch * q_len * dim, query.len())?;
    check_len("cross-attention context", batch * k_len * dim, context.len())?;

    let q = params.query.forward(query, batch * q_len);
    let k = params.key.forward(context, batch * k_len);
    let v = params.value.forward(context, batch * k_len);

    let mut attended = vec![0.0f32; batch * q_len * dim];
    let mut weights = vec![0.0f32; q_len * k_len];
    for b in 0..batch {
        let qs = b * q_len * dim..(b + 1) * q_len * dim;
        let ks = b * k_len * dim..(b + 1) * k_len * dim;
        attention_forward(
            &q[qs.clone()], &k[ks.clone()], &v[ks],
            &mut attended[qs], &mut weights,
            q_len, k_len, 1, dim,
        );
    }

    Ok(params.norm.forward(&attended, batch * q_len))
}

/// Build `substitute(encoded, row0 = fused) + encoded` as a new buffer.
///
/// `encoded`: [tokens, batch, dim]; `fused`: [batch, dim].
pub fn residual_fuse(encoded: &[f32], fused: &[f32], batch: usize, dim: usize) -> MaeResult<Vec<f32>> {
    let head = batch * dim;
    check_len("fused summary", head, fused.len())?;
    if encoded.len() < head || encoded.len() % head != 0 {
        return Err(MaeError::ShapeMismatch {
            context: "encoded sequence for fusion",
            expected: head * (encoded.len() / head).max(1),
            actual: encoded.len(),
        });
    }

    let mut substituted = Vec::with_capacity(encoded.len());
    substituted.extend_from_slice(fused);
    substituted.extend_from_slice(&encoded[head..]);

    let mut out = vec![0.0f32; encoded.len()];
    add_f32(&substituted, encoded, &mut out);
    Ok(out)
}

/// Fused sequences for both modalities, ready for their decoders.
#[derive(Clone, Debug)]
pub struct FusionOutput {
    /// [visible_a + 1, batch, dim]
    pub seq_a: Vec<f32>,
    /// [visible_b + 1, batch, dim]
    pub seq_b: Vec<f32>,
    /// Cross-attention output for A (before the residual add), [batch, dim].
    pub summary_a: Vec<f32>,
    /// Cross-attention output for B (before the residual add), [batch, dim].
    pub summary_b: Vec<f32>,
}

/// Exchange summaries between the two encoded modalities.
pub fn fuse(params: &FusionParams, enc_a: &EncoderOutput, enc_b: &EncoderOutput) -> MaeResult<FusionOutput> {
    if enc_a.batch != enc_b.batch {
        return Err(MaeError::BatchMismatch { a: enc_a.batch, b: enc_b.batch });
    }
    check_len("fusion emb_dim", enc_a.emb_dim, enc_b.emb_dim)?;
    let batch = enc_a.batch;
    let dim = enc_a.emb_dim;

    let summary_a = cross_attention(&params.a_from_b, enc_a.summary(), enc_b.summary(), batch, 1, 1)?;
    let summary_b = cross_attention(&params.b_from_a, enc_b.summary(), enc_a.summary(), batch, 1, 1)?;

    let seq_a = residual_fuse(&enc_a.features, &summary_a, batch, dim)?;
    let seq_b = residual_fuse(&enc_b.features, &summary_b, batch, dim)?;

    Ok(FusionOutput { seq_a, seq_b, summary_a, summary_b })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permutation::BatchIndexes;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn fake_encoded(visible: usize, batch: usize, dim: usize, offset: f32) -> EncoderOutput {
        let len = (visible + 1) * batch * dim;
        EncoderOutput {
            features: (0..len).map(|i| (i as f32 * 0.13 + offset).cos()).collect(),
            visible,
            batch,
            emb_dim: dim,
            indexes: BatchIndexes { forward: vec![], backward: vec![], tokens: 0, batch },
        }
    }

    #[test]
    fn test_single_token_attention_ignores_query() {
        // One key → weight 1 → output is LN(value(context)) whatever the query.
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let dim = 6;
        let p = CrossAttentionParams::init(dim, &mut rng);
        let ctx: Vec<f32> = (0..dim).map(|i| i as f32 * 0.2).collect();
        let q1: Vec<f32> = (0..dim).map(|i| -(i as f32)).collect();
        let q2 = vec![3.0f32; dim];
        let o1 = cross_attention(&p, &q1, &ctx, 1, 1, 1).unwrap();
        let o2 = cross_attention(&p, &q2, &ctx, 1, 1, 1).unwrap();
        assert_eq!(o1, o2);
        let expected = p.norm.forward(&p.value.forward(&ctx, 1), 1);
        for (a, b) in o1.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_multi_key_cross_attention_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let dim = 4;
        let p = CrossAttentionParams::init(dim, &mut rng);
        let q = vec![0.5f32; 2 * 3 * dim];
        let ctx: Vec<f32> = (0..2 * 5 * dim).map(|i| (i as f32).sin()).collect();
        let out = cross_attention(&p, &q, &ctx, 2, 3, 5).unwrap();
        assert_eq!(out.len(), 2 * 3 * dim);
        assert!(out.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_residual_fuse_layout() {
        // tokens=2, batch=2, dim=1
        let encoded = vec![1.0, 2.0, 3.0, 4.0f32];
        let fused = vec![10.0, 20.0f32];
        let out = residual_fuse(&encoded, &fused, 2, 1).unwrap();
        assert_eq!(out, vec![11.0, 22.0, 6.0, 8.0]);
        // input untouched
        assert_eq!(encoded, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_fuse_residual_property_both_ways() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let (batch, dim) = (3, 8);
        let params = FusionParams::init(dim, &mut rng);
        let enc_a = fake_encoded(4, batch, dim, 0.0);
        let enc_b = fake_encoded(1, batch, dim, 1.0);

        let out = fuse(&params, &enc_a, &enc_b).unwrap();
        assert_eq!(out.seq_a.len(), enc_a.features.len());
        assert_eq!(out.seq_b.len(), enc_b.features.len());
        assert_eq!(out.summary_a.len(), batch * dim);

        for (seq, enc, summary) in [(&out.seq_a, &enc_a, &out.summary_a), (&out.seq_b, &enc_b, &out.summary_b)] {
            let head = batch * dim;
            for i in 0..head {
                assert!((seq[i] - (summary[i] + enc.features[i])).abs() < 1e-6);
            }
            for i in head..seq.len() {
                assert!((seq[i] - 2.0 * enc.features[i]).abs() < 1e-6);
            }
        }

        // Swapping the roles swaps the outputs when the weights are swapped too.
        let swapped_params = FusionParams {
            a_from_b: params.b_from_a.clone(),
            b_from_a: params.a_from_b.clone(),
        };
        let swapped = fuse(&swapped_params, &enc_b, &enc_a).unwrap();
        assert_eq!(swapped.seq_a, out.seq_b);
        assert_eq!(swapped.seq_b, out.seq_a);
        assert_eq!(swapped.summary_a, out.summary_b);
    }

    #[test]
    fn test_fuse_batch_mismatch() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let params = FusionParams::init(4, &mut rng);
        let enc_a = fake_encoded(2, 2, 4, 0.0);
        let enc_b = fake_encoded(2, 3, 4, 0.0);
        assert!(matches!(fuse(&params, &enc_a, &enc_b), Err(MaeError::BatchMismatch { a: 2, b: 3 })));
    }
}
