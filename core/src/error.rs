//! Error types for the masked cross-modal autoencoder.
//!
//! Every failure here is a shape or configuration mismatch. There is no
//! partial-failure state: an error aborts the whole forward pass.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaeError {
    /// A buffer or tensor did not have the size the operation needs.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Configuration rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The two modality batches disagree on batch size.
    #[error("batch size mismatch between modalities: a={a}, b={b}")]
    BatchMismatch { a: usize, b: usize },

    #[error("empty batch")]
    EmptyBatch,

    /// A reindex position pointed past the end of the source sequence.
    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MaeResult<T> = Result<T, MaeError>;

/// Fail with `ShapeMismatch` unless `actual == expected`.
#[inline]
pub(crate) fn check_len(context: &'static str, expected: usize, actual: usize) -> MaeResult<()> {
    if expected != actual {
        return Err(MaeError::ShapeMismatch { context, expected, actual });
    }
    Ok(())
}
