//! Modality decoder: fused sequence → reconstructed raw features + mask.
//!
//! The encoder dropped every shuffled position ≥ `visible`. Here the
//! sequence is padded back to `components + 1` rows with the learned
//! placeholder token and gathered by the backward permutation (widened by
//! one row so the summary stays at row 0). After the blocks, row 0 is
//! returned as the decoder summary and rows 1.. are projected back to
//! `sub_dim` values each.
//!
//! The mask is built in shuffled order (1 for rows ≥ `visible`) and gathered
//! by the same backward permutation, so it lines up with the reconstruction
//! entry for entry. Per sample it sums to `(components - visible) * sub_dim`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attention::{run_blocks, BlockParams};
use crate::config::{MaeConfig, ModalityConfig};
use crate::error::{check_len, MaeError, MaeResult};
use crate::layers::Linear;
use crate::permutation::BatchIndexes;
use crate::reindex::{pad_tokens, take_indexes, tokens_to_batch_major};
use crate::encoder::TOKEN_INIT_STD;
use crate::tensor::fill_trunc_normal;

/// Learnable decoder state for one modality.
///
/// Layout (row-major):
///   mask_token:    [C]
///   pos_embedding: [T + 1, C] (row 0 belongs to the summary position)
///   decoding:      Linear [S, C]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecoderParams {
    pub mask_token: Vec<f32>,
    pub pos_embedding: Vec<f32>,
    pub blocks: Vec<BlockParams>,
    pub decoding: Linear,
}

impl DecoderParams {
    pub fn init<R: Rng + ?Sized>(cfg: &MaeConfig, modality: &ModalityConfig, rng: &mut R) -> Self {
        let c = cfg.emb_dim;
        let mut mask_token = vec![0.0f32; c];
        fill_trunc_normal(rng, &mut mask_token, TOKEN_INIT_STD);
        let mut pos_embedding = vec![0.0f32; (modality.components + 1) * c];
        fill_trunc_normal(rng, &mut pos_embedding, TOKEN_INIT_STD);

        let blocks = (0..cfg.decoder_layers)
            .map(|_| BlockParams::init(c, cfg.mlp_hidden(), rng))
            .collect();
        let decoding = Linear::init(c, modality.sub_dim, rng);

        DecoderParams { mask_token, pos_embedding, blocks, decoding }
    }

    pub fn num_params(&self) -> usize {
        self.mask_token.len()
            + self.pos_embedding.len()
            + self.blocks.iter().map(|b| b.num_params()).sum::<usize>()
            + self.decoding.num_params()
    }

    pub fn check(&self, cfg: &MaeConfig, modality: &ModalityConfig) -> MaeResult<()> {
        let c = cfg.emb_dim;
        check_len("decoder mask_token", c, self.mask_token.len())?;
        check_len("decoder pos_embedding", (modality.components + 1) * c, self.pos_embedding.len())?;
        check_len("decoder layers", cfg.decoder_layers, self.blocks.len())?;
        for block in &self.blocks {
            block.check(c, cfg.mlp_hidden())?;
        }
        self.decoding.check("decoder projection", c, modality.sub_dim)
    }
}

#[derive(Clone, Debug)]
pub struct DecoderOutput {
    /// [batch, raw_features]
    pub reconstruction: Vec<f32>,
    /// [batch, raw_features], 1.0 where the component was masked.
    pub mask: Vec<f32>,
    /// Decoder output at the summary position, [batch, emb_dim].
    pub summary: Vec<f32>,
}

/// Decode one modality.
///
/// `seq`: fused sequence `[visible + 1, batch, emb_dim]`.
pub fn decoder_forward(
    params: &DecoderParams,
    cfg: &MaeConfig,
    modality: &ModalityConfig,
    seq: &[f32],
    visible: usize,
    indexes: &BatchIndexes,
) -> MaeResult<DecoderOutput> {
    let t = modality.components;
    let s = modality.sub_dim;
    let c = cfg.emb_dim;
    let batch = indexes.batch;
    if batch == 0 {
        return Err(MaeError::EmptyBatch);
    }
    check_len("decoder index tokens", t, indexes.tokens)?;
    if visible > t {
        return Err(MaeError::ShapeMismatch { context: "decoder visible count", expected: t, actual: visible });
    }
    let len_in = visible + 1;
    let full = t + 1;
    check_len("decoder input sequence", len_in * batch * c, seq.len())?;

    // Stage 1+2+3: pad with placeholders, restore natural order
    let ext = indexes.backward_with_summary();
    let padded = pad_tokens(seq, &params.mask_token, len_in, full - len_in, batch, c)?;
    let mut restored = take_indexes(&padded, &ext, full, batch, c)?;

    // Stage 4: positional bias
    for row in 0..full {
        let bias = &params.pos_embedding[row * c..(row + 1) * c];
        for b in 0..batch {
            let base = (row * batch + b) * c;
            for i in 0..c {
                restored[base + i] += bias[i];
            }
        }
    }

    // Stage 5: blocks
    let hidden = run_blocks(&params.blocks, &restored, full, batch, c, cfg.decoder_heads)?;

    // Stage 6: split off the summary, project components to raw sub-dims
    let summary = hidden[..batch * c].to_vec();
    let patches = params.decoding.forward(&hidden[batch * c..], t * batch);

    // Stage 7: mask in shuffled order, then align with the restored order
    let mut shuffled_mask = vec![0.0f32; t * batch * s];
    shuffled_mask[visible * batch * s..].fill(1.0);
    let mask = take_indexes(&shuffled_mask, &indexes.backward, t, batch, s)?;

    // Stage 8: [T, B, S] → [B, T*S]
    Ok(DecoderOutput {
        reconstruction: tokens_to_batch_major(&patches, t, batch, s),
        mask: tokens_to_batch_major(&mask, t, batch, s),
        summary,
    })
}
