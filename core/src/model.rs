/// Joint masked cross-modal autoencoder: parameters and the end-to-end
/// forward pass.
///
/// Wiring per call:
///   raw_a → encoder_a ─┐            ┌→ decoder_a → (recon_a, mask_a, summary_a)
///                      ├→ fusion ───┤
///   raw_b → encoder_b ─┘            └→ decoder_b → (recon_b, mask_b, summary_b)
///
/// The only state is the parameter set. Permutations are drawn fresh from the
/// caller's RNG on every call; nothing carries over between calls.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MaeConfig;
use crate::decoder::{decoder_forward, DecoderParams};
use crate::encoder::{encoder_forward, EncoderOutput, EncoderParams};
use crate::error::{MaeError, MaeResult};
use crate::fusion::{fuse, FusionParams};
use crate::loss::{forward_loss, LossReport};
use crate::permutation::BatchIndexes;
use crate::tensor::Tensor;

/// All learnable parameters, owned by the joint model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointParams {
    pub encoder_a: EncoderParams,
    pub encoder_b: EncoderParams,
    pub fusion: FusionParams,
    pub decoder_a: DecoderParams,
    pub decoder_b: DecoderParams,
}

impl JointParams {
    /// Deterministic initialization from a seed. Rejects invalid configs.
    pub fn init(cfg: &MaeConfig, seed: u64) -> MaeResult<Self> {
        cfg.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Ok(JointParams {
            encoder_a: EncoderParams::init(cfg, &cfg.modality_a, &mut rng),
            encoder_b: EncoderParams::init(cfg, &cfg.modality_b, &mut rng),
            fusion: FusionParams::init(cfg.emb_dim, &mut rng),
            decoder_a: DecoderParams::init(cfg, &cfg.modality_a, &mut rng),
            decoder_b: DecoderParams::init(cfg, &cfg.modality_b, &mut rng),
        })
    }

    /// Total number of parameters.
    pub fn num_params(&self) -> usize {
        self.encoder_a.num_params()
            + self.encoder_b.num_params()
            + self.fusion.num_params()
            + self.decoder_a.num_params()
            + self.decoder_b.num_params()
    }

    /// Verify every buffer against `cfg`.
    pub fn check(&self, cfg: &MaeConfig) -> MaeResult<()> {
        self.encoder_a.check(cfg, &cfg.modality_a)?;
        self.encoder_b.check(cfg, &cfg.modality_b)?;
        self.fusion.check(cfg.emb_dim)?;
        self.decoder_a.check(cfg, &cfg.modality_a)?;
        self.decoder_b.check(cfg, &cfg.modality_b)
    }
}

/// Everything one forward pass produces.
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    /// [batch, 1, raw_features_a]
    pub reconstruction_a: Tensor,
    /// [batch, 1, raw_features_b]
    pub reconstruction_b: Tensor,
    /// Same shape as `reconstruction_a`; 1.0 on masked entries.
    pub mask_a: Tensor,
    pub mask_b: Tensor,
    /// Decoder output at the summary position, [batch, emb_dim].
    pub summary_a: Tensor,
    pub summary_b: Tensor,
    /// Cross-attention summaries from the fusion step, [batch, emb_dim].
    pub fused_summary_a: Tensor,
    pub fused_summary_b: Tensor,
    /// Permutations drawn for this pass.
    pub indexes_a: BatchIndexes,
    pub indexes_b: BatchIndexes,
    pub visible_a: usize,
    pub visible_b: usize,
}

/// Fused summaries only (no decoding).
#[derive(Clone, Debug)]
pub struct JointEmbedding {
    /// [batch, emb_dim]
    pub summary_a: Tensor,
    pub summary_b: Tensor,
}

/// Check both raw batches against the configuration and each other.
fn check_batches(cfg: &MaeConfig, raw_a: &Tensor, raw_b: &Tensor) -> MaeResult<usize> {
    let (batch_a, n_a) = raw_a.as_batch()?;
    let (batch_b, n_b) = raw_b.as_batch()?;
    if batch_a != batch_b {
        return Err(MaeError::BatchMismatch { a: batch_a, b: batch_b });
    }
    if n_a != cfg.modality_a.raw_features {
        return Err(MaeError::ShapeMismatch {
            context: "modality a raw features",
            expected: cfg.modality_a.raw_features,
            actual: n_a,
        });
    }
    if n_b != cfg.modality_b.raw_features {
        return Err(MaeError::ShapeMismatch {
            context: "modality b raw features",
            expected: cfg.modality_b.raw_features,
            actual: n_b,
        });
    }
    Ok(batch_a)
}

fn encode_both<R: Rng + ?Sized>(
    params: &JointParams,
    cfg: &MaeConfig,
    raw_a: &Tensor,
    raw_b: &Tensor,
    rng: &mut R,
) -> MaeResult<(usize, EncoderOutput, EncoderOutput)> {
    let batch = check_batches(cfg, raw_a, raw_b)?;
    let enc_a = encoder_forward(&params.encoder_a, cfg, &cfg.modality_a, &raw_a.data, batch, rng)?;
    let enc_b = encoder_forward(&params.encoder_b, cfg, &cfg.modality_b, &raw_b.data, batch, rng)?;
    debug!(
        batch,
        visible_a = enc_a.visible,
        visible_b = enc_b.visible,
        "encoded both modalities"
    );
    Ok((batch, enc_a, enc_b))
}

/// Full forward pass: encode, fuse, decode both modalities.
///
/// `cfg` and `params` are validated against each other before anything runs.
pub fn forward<R: Rng + ?Sized>(
    params: &JointParams,
    cfg: &MaeConfig,
    raw_a: &Tensor,
    raw_b: &Tensor,
    rng: &mut R,
) -> MaeResult<ForwardOutput> {
    cfg.validate()?;
    params.check(cfg)?;
    run_forward(params, cfg, raw_a, raw_b, rng)
}

/// Encoder + fusion only: the fused per-sample summaries.
pub fn encode<R: Rng + ?Sized>(
    params: &JointParams,
    cfg: &MaeConfig,
    raw_a: &Tensor,
    raw_b: &Tensor,
    rng: &mut R,
) -> MaeResult<JointEmbedding> {
    cfg.validate()?;
    params.check(cfg)?;
    run_encode(params, cfg, raw_a, raw_b, rng)
}

// Callers must have validated `cfg` and checked `params` against it.
fn run_forward<R: Rng + ?Sized>(
    params: &JointParams,
    cfg: &MaeConfig,
    raw_a: &Tensor,
    raw_b: &Tensor,
    rng: &mut R,
) -> MaeResult<ForwardOutput> {
    let (batch, enc_a, enc_b) = encode_both(params, cfg, raw_a, raw_b, rng)?;
    let fused = fuse(&params.fusion, &enc_a, &enc_b)?;

    let dec_a = decoder_forward(&params.decoder_a, cfg, &cfg.modality_a, &fused.seq_a, enc_a.visible, &enc_a.indexes)?;
    let dec_b = decoder_forward(&params.decoder_b, cfg, &cfg.modality_b, &fused.seq_b, enc_b.visible, &enc_b.indexes)?;

    let n_a = cfg.modality_a.raw_features;
    let n_b = cfg.modality_b.raw_features;
    let c = cfg.emb_dim;
    Ok(ForwardOutput {
        reconstruction_a: Tensor::from_vec(dec_a.reconstruction, &[batch, 1, n_a])?,
        reconstruction_b: Tensor::from_vec(dec_b.reconstruction, &[batch, 1, n_b])?,
        mask_a: Tensor::from_vec(dec_a.mask, &[batch, 1, n_a])?,
        mask_b: Tensor::from_vec(dec_b.mask, &[batch, 1, n_b])?,
        summary_a: Tensor::from_vec(dec_a.summary, &[batch, c])?,
        summary_b: Tensor::from_vec(dec_b.summary, &[batch, c])?,
        fused_summary_a: Tensor::from_vec(fused.summary_a, &[batch, c])?,
        fused_summary_b: Tensor::from_vec(fused.summary_b, &[batch, c])?,
        visible_a: enc_a.visible,
        visible_b: enc_b.visible,
        indexes_a: enc_a.indexes,
        indexes_b: enc_b.indexes,
    })
}

fn run_encode<R: Rng + ?Sized>(
    params: &JointParams,
    cfg: &MaeConfig,
    raw_a: &Tensor,
    raw_b: &Tensor,
    rng: &mut R,
) -> MaeResult<JointEmbedding> {
    let (batch, enc_a, enc_b) = encode_both(params, cfg, raw_a, raw_b, rng)?;
    let fused = fuse(&params.fusion, &enc_a, &enc_b)?;
    Ok(JointEmbedding {
        summary_a: Tensor::from_vec(fused.summary_a, &[batch, cfg.emb_dim])?,
        summary_b: Tensor::from_vec(fused.summary_b, &[batch, cfg.emb_dim])?,
    })
}

/// Modalities whose mask ratio leaves no visible components.
pub fn summary_only_modalities(cfg: &MaeConfig) -> Vec<&str> {
    [&cfg.modality_a, &cfg.modality_b]
        .into_iter()
        .filter(|m| m.visible_components() == 0)
        .map(|m| m.name.as_str())
        .collect()
}

/// Logged once per model; the encoder only reports this at debug level per call.
fn warn_summary_only(cfg: &MaeConfig) {
    for name in summary_only_modalities(cfg) {
        warn!(modality = %name, "no visible tokens; encoder will see the summary token only");
    }
}

/// Configuration plus the parameters it describes. Both are fixed at
/// construction, so the forward path never re-validates them.
#[derive(Clone, Debug)]
pub struct JointModel {
    cfg: MaeConfig,
    params: JointParams,
}

impl JointModel {
    /// Validate `cfg` and initialize parameters from `seed`.
    pub fn new(cfg: MaeConfig, seed: u64) -> MaeResult<Self> {
        let params = JointParams::init(&cfg, seed)?;
        warn_summary_only(&cfg);
        Ok(JointModel { cfg, params })
    }

    /// Wrap externally restored parameters after checking their shapes.
    pub fn from_params(cfg: MaeConfig, params: JointParams) -> MaeResult<Self> {
        cfg.validate()?;
        params.check(&cfg)?;
        warn_summary_only(&cfg);
        Ok(JointModel { cfg, params })
    }

    pub fn config(&self) -> &MaeConfig {
        &self.cfg
    }

    pub fn params(&self) -> &JointParams {
        &self.params
    }

    /// Hand the parameters back, e.g. to an external optimizer that
    /// rebuilds the model with `from_params` after its update.
    pub fn into_params(self) -> JointParams {
        self.params
    }

    pub fn num_params(&self) -> usize {
        self.params.num_params()
    }

    pub fn forward<R: Rng + ?Sized>(&self, raw_a: &Tensor, raw_b: &Tensor, rng: &mut R) -> MaeResult<ForwardOutput> {
        run_forward(&self.params, &self.cfg, raw_a, raw_b, rng)
    }

    /// Forward with permutations drawn from a fresh `ChaCha8Rng` seeded by `seed`.
    pub fn forward_seeded(&self, raw_a: &Tensor, raw_b: &Tensor, seed: u64) -> MaeResult<ForwardOutput> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.forward(raw_a, raw_b, &mut rng)
    }

    pub fn encode<R: Rng + ?Sized>(&self, raw_a: &Tensor, raw_b: &Tensor, rng: &mut R) -> MaeResult<JointEmbedding> {
        run_encode(&self.params, &self.cfg, raw_a, raw_b, rng)
    }

    /// Weighted masked loss using this model's mask ratios and loss settings.
    pub fn loss(&self, out: &ForwardOutput, raw_a: &Tensor, raw_b: &Tensor) -> MaeResult<LossReport> {
        check_batches(&self.cfg, raw_a, raw_b)?;
        forward_loss(
            out,
            raw_a,
            raw_b,
            self.cfg.modality_a.mask_ratio,
            self.cfg.modality_b.mask_ratio,
            &self.cfg.loss,
        )
    }
}
