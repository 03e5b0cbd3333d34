//! Masked reconstruction loss.
//!
//! Per modality:
//!   NominalRatio: mean((recon - target)^2 * mask) / mask_ratio
//!   MaskedCount:  sum((recon - target)^2 * mask) / sum(mask)
//! Total = weight_a * loss_a + weight_b * loss_b.
//!
//! With nothing masked (mask_ratio 0, or an all-zero mask) a modality
//! contributes 0 under either normalization.

use crate::config::{LossConfig, LossNormalization};
use crate::error::{check_len, MaeError, MaeResult};
use crate::model::ForwardOutput;
use crate::tensor::Tensor;

/// Scalar loss plus its two components (for logging).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossReport {
    pub total: f32,
    pub loss_a: f32,
    pub loss_b: f32,
}

fn check_inputs(recon: &[f32], target: &[f32], mask: &[f32]) -> MaeResult<()> {
    if recon.is_empty() {
        return Err(MaeError::EmptyBatch);
    }
    check_len("loss target", recon.len(), target.len())?;
    check_len("loss mask", recon.len(), mask.len())
}

/// Denominator applied to the masked squared-error sum, or None when no
/// position contributes.
fn denominator(n: usize, mask: &[f32], mask_ratio: f32, normalization: LossNormalization) -> Option<f32> {
    match normalization {
        LossNormalization::NominalRatio => {
            if mask_ratio > 0.0 {
                Some(n as f32 * mask_ratio)
            } else {
                None
            }
        }
        LossNormalization::MaskedCount => {
            let count: f32 = mask.iter().sum();
            if count > 0.0 {
                Some(count)
            } else {
                None
            }
        }
    }
}

/// Masked mean squared error for one modality.
pub fn masked_mse(
    recon: &[f32],
    target: &[f32],
    mask: &[f32],
    mask_ratio: f32,
    normalization: LossNormalization,
) -> MaeResult<f32> {
    check_inputs(recon, target, mask)?;
    let Some(denom) = denominator(recon.len(), mask, mask_ratio, normalization) else {
        return Ok(0.0);
    };
    let mut sum = 0.0f32;
    for i in 0..recon.len() {
        let diff = recon[i] - target[i];
        sum += diff * diff * mask[i];
    }
    Ok(sum / denom)
}

/// d masked_mse / d recon. Zero wherever the mask is zero.
pub fn masked_mse_backward(
    recon: &[f32],
    target: &[f32],
    mask: &[f32],
    mask_ratio: f32,
    normalization: LossNormalization,
) -> MaeResult<Vec<f32>> {
    check_inputs(recon, target, mask)?;
    let mut grad = vec![0.0f32; recon.len()];
    let Some(denom) = denominator(recon.len(), mask, mask_ratio, normalization) else {
        return Ok(grad);
    };
    let scale = 2.0 / denom;
    for i in 0..recon.len() {
        grad[i] = scale * (recon[i] - target[i]) * mask[i];
    }
    Ok(grad)
}

/// Weighted two-modality loss from raw buffers.
#[allow(clippy::too_many_arguments)]
pub fn reconstruction_loss(
    recon_a: &[f32],
    recon_b: &[f32],
    mask_a: &[f32],
    mask_b: &[f32],
    target_a: &[f32],
    target_b: &[f32],
    mask_ratio_a: f32,
    mask_ratio_b: f32,
    cfg: &LossConfig,
) -> MaeResult<LossReport> {
    let loss_a = masked_mse(recon_a, target_a, mask_a, mask_ratio_a, cfg.normalization)?;
    let loss_b = masked_mse(recon_b, target_b, mask_b, mask_ratio_b, cfg.normalization)?;
    Ok(LossReport {
        total: cfg.weight_a * loss_a + cfg.weight_b * loss_b,
        loss_a,
        loss_b,
    })
}

/// Loss entry point over a forward pass and the original raw batches.
pub fn forward_loss(
    out: &ForwardOutput,
    raw_a: &Tensor,
    raw_b: &Tensor,
    mask_ratio_a: f32,
    mask_ratio_b: f32,
    cfg: &LossConfig,
) -> MaeResult<LossReport> {
    reconstruction_loss(
        &out.reconstruction_a.data,
        &out.reconstruction_b.data,
        &out.mask_a.data,
        &out.mask_b.data,
        &raw_a.data,
        &raw_b.data,
        mask_ratio_a,
        mask_ratio_b,
        cfg,
    )
}

/// Gradient of the total loss w.r.t. both reconstructions, the seed for any
/// external backward pass.
#[allow(clippy::too_many_arguments)]
pub fn reconstruction_loss_backward(
    recon_a: &[f32],
    recon_b: &[f32],
    mask_a: &[f32],
    mask_b: &[f32],
    target_a: &[f32],
    target_b: &[f32],
    mask_ratio_a: f32,
    mask_ratio_b: f32,
    cfg: &LossConfig,
) -> MaeResult<(Vec<f32>, Vec<f32>)> {
    let mut grad_a = masked_mse_backward(recon_a, target_a, mask_a, mask_ratio_a, cfg.normalization)?;
    let mut grad_b = masked_mse_backward(recon_b, target_b, mask_b, mask_ratio_b, cfg.normalization)?;
    grad_a.iter_mut().for_each(|g| *g *= cfg.weight_a);
    grad_b.iter_mut().for_each(|g| *g *= cfg.weight_b);
    Ok((grad_a, grad_b))
}
