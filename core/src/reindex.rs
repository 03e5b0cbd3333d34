//! Token reindexer: gather along the token axis of a `[T, B, C]` sequence.
//!
//! `out[i, b, :] = seq[index[i, b], b, :]`. The index tensor may be longer
//! than the source sequence only if the caller has already padded the source
//! to cover every referenced position; an index past the end is an error.

use tracing::trace;

use crate::error::{check_len, MaeError, MaeResult};

/// Gather `seq: [src_tokens, batch, channels]` by `index: [out_tokens, batch]`.
/// Returns `[out_tokens, batch, channels]`.
pub fn take_indexes(
    seq: &[f32],
    index: &[usize],
    src_tokens: usize,
    batch: usize,
    channels: usize,
) -> MaeResult<Vec<f32>> {
    check_len("reindex source", src_tokens * batch * channels, seq.len())?;
    if batch == 0 {
        return Ok(Vec::new());
    }
    if index.len() % batch != 0 {
        return Err(MaeError::ShapeMismatch {
            context: "reindex index (not a multiple of batch)",
            expected: (index.len() / batch + 1) * batch,
            actual: index.len(),
        });
    }
    let out_tokens = index.len() / batch;
    trace!(src_tokens, out_tokens, batch, channels, "take_indexes");

    let mut out = vec![0.0f32; out_tokens * batch * channels];
    for i in 0..out_tokens {
        for b in 0..batch {
            let src = index[i * batch + b];
            if src >= src_tokens {
                return Err(MaeError::IndexOutOfRange { index: src, len: src_tokens });
            }
            let from = (src * batch + b) * channels;
            let to = (i * batch + b) * channels;
            out[to..to + channels].copy_from_slice(&seq[from..from + channels]);
        }
    }
    Ok(out)
}

/// Append `fill_tokens` copies of `fill` (length `channels`) for every sample,
/// extending a `[tokens, batch, channels]` sequence along the token axis.
pub fn pad_tokens(
    seq: &[f32],
    fill: &[f32],
    tokens: usize,
    fill_tokens: usize,
    batch: usize,
    channels: usize,
) -> MaeResult<Vec<f32>> {
    check_len("pad source", tokens * batch * channels, seq.len())?;
    check_len("pad token", channels, fill.len())?;
    let mut out = Vec::with_capacity((tokens + fill_tokens) * batch * channels);
    out.extend_from_slice(seq);
    for _ in 0..fill_tokens * batch {
        out.extend_from_slice(fill);
    }
    Ok(out)
}

/// `[tokens, batch, channels]` → `[batch, tokens, channels]`.
pub fn tokens_to_batch_major(seq: &[f32], tokens: usize, batch: usize, channels: usize) -> Vec<f32> {
    debug_assert_eq!(seq.len(), tokens * batch * channels);
    let mut out = vec![0.0f32; seq.len()];
    for t in 0..tokens {
        for b in 0..batch {
            let from = (t * batch + b) * channels;
            let to = (b * tokens + t) * channels;
            out[to..to + channels].copy_from_slice(&seq[from..from + channels]);
        }
    }
    out
}

/// `[batch, tokens, channels]` → `[tokens, batch, channels]`.
pub fn batch_to_tokens_major(seq: &[f32], tokens: usize, batch: usize, channels: usize) -> Vec<f32> {
    debug_assert_eq!(seq.len(), tokens * batch * channels);
    let mut out = vec![0.0f32; seq.len()];
    for b in 0..batch {
        for t in 0..tokens {
            let from = (b * tokens + t) * channels;
            let to = (t * batch + b) * channels;
            out[to..to + channels].copy_from_slice(&seq[from..from + channels]);
        }
    }
    out
}
