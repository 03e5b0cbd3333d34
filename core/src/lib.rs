//! Masked cross-modal autoencoder for paired single-cell measurements.

pub mod error;
pub mod tensor;
pub mod layers;
pub mod attention;
pub mod permutation;
pub mod reindex;
pub mod config;
pub mod encoder;
pub mod fusion;
pub mod decoder;
pub mod loss;
pub mod model;

pub use config::{LossConfig, LossNormalization, MaeConfig, ModalityConfig};
pub use error::{MaeError, MaeResult};
pub use loss::LossReport;
pub use model::{ForwardOutput, JointEmbedding, JointModel, JointParams};
pub use tensor::Tensor;
