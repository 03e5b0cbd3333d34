//! Modality encoder: raw features → masked, summarised token sequence.
//!
//! Pipeline per call:
//!   raw [B, N] → token mix Linear(N, N) → view [B, T, S] → Linear(S, C)
//!   → + positional bias [T, C] → [T, B, C] → shuffle per sample
//!   → keep first `visible` tokens → prepend summary token
//!   → self-attention blocks → LayerNorm
//!
//! Output sequence is `[visible + 1, B, C]` with the summary token at row 0,
//! plus the index pair needed to undo the shuffle in the decoder.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::attention::{run_blocks, BlockParams};
use crate::config::{MaeConfig, ModalityConfig};
use crate::error::{check_len, MaeError, MaeResult};
use crate::layers::{LayerNorm, Linear};
use crate::permutation::{visible_count, BatchIndexes};
use crate::reindex::{batch_to_tokens_major, take_indexes};
use crate::tensor::fill_trunc_normal;

pub(crate) const TOKEN_INIT_STD: f32 = 0.02;

/// Learnable encoder state for one modality.
///
/// Layout (row-major):
///   tokens:        Linear [N, N]
///   embedding:     Linear [C, S]
///   summary_token: [C]
///   pos_embedding: [T, C]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncoderParams {
    pub tokens: Linear,
    pub embedding: Linear,
    pub summary_token: Vec<f32>,
    pub pos_embedding: Vec<f32>,
    pub blocks: Vec<BlockParams>,
    pub norm: LayerNorm,
}

impl EncoderParams {
    pub fn init<R: Rng + ?Sized>(cfg: &MaeConfig, modality: &ModalityConfig, rng: &mut R) -> Self {
        let c = cfg.emb_dim;
        let tokens = Linear::init(modality.raw_features, modality.raw_features, rng);
        let embedding = Linear::init(modality.sub_dim, c, rng);

        let mut summary_token = vec![0.0f32; c];
        fill_trunc_normal(rng, &mut summary_token, TOKEN_INIT_STD);
        let mut pos_embedding = vec![0.0f32; modality.components * c];
        fill_trunc_normal(rng, &mut pos_embedding, TOKEN_INIT_STD);

        let blocks = (0..cfg.encoder_layers)
            .map(|_| BlockParams::init(c, cfg.mlp_hidden(), rng))
            .collect();

        EncoderParams {
            tokens,
            embedding,
            summary_token,
            pos_embedding,
            blocks,
            norm: LayerNorm::new(c),
        }
    }

    pub fn num_params(&self) -> usize {
        self.tokens.num_params()
            + self.embedding.num_params()
            + self.summary_token.len()
            + self.pos_embedding.len()
            + self.blocks.iter().map(|b| b.num_params()).sum::<usize>()
            + self.norm.num_params()
    }

    /// Verify every buffer against the configuration.
    pub fn check(&self, cfg: &MaeConfig, modality: &ModalityConfig) -> MaeResult<()> {
        let c = cfg.emb_dim;
        self.tokens.check("encoder tokens", modality.raw_features, modality.raw_features)?;
        self.embedding.check("encoder embedding", modality.sub_dim, c)?;
        check_len("encoder summary_token", c, self.summary_token.len())?;
        check_len("encoder pos_embedding", modality.components * c, self.pos_embedding.len())?;
        check_len("encoder layers", cfg.encoder_layers, self.blocks.len())?;
        for block in &self.blocks {
            block.check(c, cfg.mlp_hidden())?;
        }
        self.norm.check("encoder norm", c)
    }
}

/// Encoded sequence plus the bookkeeping to undo the shuffle.
#[derive(Clone, Debug)]
pub struct EncoderOutput {
    /// [visible + 1, batch, emb_dim], summary token at row 0.
    pub features: Vec<f32>,
    pub visible: usize,
    pub batch: usize,
    pub emb_dim: usize,
    pub indexes: BatchIndexes,
}

impl EncoderOutput {
    /// Sequence length including the summary token.
    pub fn seq_len(&self) -> usize {
        self.visible + 1
    }

    /// Row 0: the summary token of every sample, [batch, emb_dim].
    pub fn summary(&self) -> &[f32] {
        &self.features[..self.batch * self.emb_dim]
    }
}

/// Encode one modality's raw batch `[batch, raw_features]`.
pub fn encoder_forward<R: Rng + ?Sized>(
    params: &EncoderParams,
    cfg: &MaeConfig,
    modality: &ModalityConfig,
    raw: &[f32],
    batch: usize,
    rng: &mut R,
) -> MaeResult<EncoderOutput> {
    if batch == 0 {
        return Err(MaeError::EmptyBatch);
    }
    let n = modality.raw_features;
    let t = modality.components;
    let c = cfg.emb_dim;
    check_len("encoder tokenization", t * modality.sub_dim, n)?;
    check_len("encoder raw batch", batch * n, raw.len())?;

    // Stage 1: token mix across the whole raw vector
    let mixed = params.tokens.forward(raw, batch);

    // Stage 2+3: [B, N] is already [B, T, S] row-major; embed each component
    let mut embedded = params.embedding.forward(&mixed, batch * t);

    // Stage 4: positional bias per component
    for b in 0..batch {
        for comp in 0..t {
            let row = (b * t + comp) * c;
            for i in 0..c {
                embedded[row + i] += params.pos_embedding[comp * c + i];
            }
        }
    }

    // Stage 5: shuffle along the token axis and keep the visible prefix
    let seq = batch_to_tokens_major(&embedded, t, batch, c);
    let indexes = BatchIndexes::draw(t, batch, rng);
    let visible = visible_count(t, modality.mask_ratio);
    if visible == 0 {
        debug!(modality = %modality.name, components = t, "no visible tokens; encoding summary only");
    }
    let mut shuffled = take_indexes(&seq, &indexes.forward, t, batch, c)?;
    shuffled.truncate(visible * batch * c);

    // Stage 6: prepend the summary token
    let len = visible + 1;
    let mut with_summary = Vec::with_capacity(len * batch * c);
    for _ in 0..batch {
        with_summary.extend_from_slice(&params.summary_token);
    }
    with_summary.extend_from_slice(&shuffled);

    // Stage 7+8: blocks, final norm
    let hidden = run_blocks(&params.blocks, &with_summary, len, batch, c, cfg.encoder_heads)?;
    let features = params.norm.forward(&hidden, len * batch);

    Ok(EncoderOutput { features, visible, batch, emb_dim: c, indexes })
}
