//! Model configuration. Immutable after construction.
//!
//! Two modalities ("a" and "b") each carry their own tokenization and mask
//! ratio; everything else (embedding width, block depth, heads) is shared.
//! All structs round-trip through JSON so runs can be described in a file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MaeError, MaeResult};
use crate::permutation::visible_count;

/// Tokenization and masking for one modality.
///
/// The raw vector of `raw_features` values is reshaped into `components`
/// tokens of `sub_dim` values each, so `raw_features == components * sub_dim`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModalityConfig {
    pub name: String,
    pub raw_features: usize,
    pub components: usize,
    pub sub_dim: usize,
    /// Fraction of components hidden from the encoder, in [0, 1).
    pub mask_ratio: f32,
}

impl ModalityConfig {
    pub fn new(name: &str, components: usize, sub_dim: usize, mask_ratio: f32) -> Self {
        ModalityConfig {
            name: name.to_string(),
            raw_features: components * sub_dim,
            components,
            sub_dim,
            mask_ratio,
        }
    }

    /// Components the encoder actually sees.
    pub fn visible_components(&self) -> usize {
        visible_count(self.components, self.mask_ratio)
    }

    /// Components replaced by placeholders and scored by the loss.
    pub fn masked_components(&self) -> usize {
        self.components - self.visible_components()
    }

    pub fn validate(&self) -> MaeResult<()> {
        if self.components == 0 || self.sub_dim == 0 {
            return Err(MaeError::InvalidConfig(format!(
                "modality '{}': components ({}) and sub_dim ({}) must be >= 1",
                self.name, self.components, self.sub_dim
            )));
        }
        if self.raw_features != self.components * self.sub_dim {
            return Err(MaeError::InvalidConfig(format!(
                "modality '{}': raw_features {} is not components {} x sub_dim {}",
                self.name, self.raw_features, self.components, self.sub_dim
            )));
        }
        if !self.mask_ratio.is_finite() || !(0.0..1.0).contains(&self.mask_ratio) {
            return Err(MaeError::InvalidConfig(format!(
                "modality '{}': mask_ratio {} must lie in [0, 1)",
                self.name, self.mask_ratio
            )));
        }
        Ok(())
    }
}

/// How a modality's masked squared error is normalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LossNormalization {
    /// mean over every position, divided by the configured mask ratio.
    #[default]
    NominalRatio,
    /// sum over masked positions, divided by the number of masked positions.
    MaskedCount,
}

/// Weighted combination of the two modality losses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    pub weight_a: f32,
    pub weight_b: f32,
    #[serde(default)]
    pub normalization: LossNormalization,
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig {
            weight_a: 0.7,
            weight_b: 0.3,
            normalization: LossNormalization::NominalRatio,
        }
    }
}

impl LossConfig {
    pub fn validate(&self) -> MaeResult<()> {
        for (label, w) in [("weight_a", self.weight_a), ("weight_b", self.weight_b)] {
            if !w.is_finite() || w < 0.0 {
                return Err(MaeError::InvalidConfig(format!(
                    "loss {label} must be finite and >= 0, got {w}"
                )));
            }
        }
        Ok(())
    }
}

fn default_mlp_ratio() -> usize {
    4
}

/// Full joint-model configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaeConfig {
    pub emb_dim: usize,
    pub encoder_layers: usize,
    pub encoder_heads: usize,
    pub decoder_layers: usize,
    pub decoder_heads: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: usize,
    pub modality_a: ModalityConfig,
    pub modality_b: ModalityConfig,
    #[serde(default)]
    pub loss: LossConfig,
}

impl MaeConfig {
    /// Tiny configuration for fast tests.
    pub fn test_config() -> Self {
        MaeConfig {
            emb_dim: 16,
            encoder_layers: 2,
            encoder_heads: 2,
            decoder_layers: 1,
            decoder_heads: 2,
            mlp_ratio: 4,
            modality_a: ModalityConfig::new("rna", 8, 3, 0.25),
            modality_b: ModalityConfig::new("protein", 4, 1, 0.5),
            loss: LossConfig::default(),
        }
    }

    /// CITE-seq sized setup: 4000 RNA features as 400 tokens of 10, 14
    /// surface proteins as one token each.
    pub fn cite_seq_reference() -> Self {
        MaeConfig {
            emb_dim: 128,
            encoder_layers: 6,
            encoder_heads: 2,
            decoder_layers: 4,
            decoder_heads: 2,
            mlp_ratio: 4,
            modality_a: ModalityConfig::new("rna", 400, 10, 0.15),
            modality_b: ModalityConfig::new("adt", 14, 1, 0.15),
            loss: LossConfig::default(),
        }
    }

    pub fn mlp_hidden(&self) -> usize {
        self.mlp_ratio * self.emb_dim
    }

    pub fn validate(&self) -> MaeResult<()> {
        if self.emb_dim == 0 {
            return Err(MaeError::InvalidConfig("emb_dim must be >= 1".into()));
        }
        if self.mlp_ratio == 0 {
            return Err(MaeError::InvalidConfig("mlp_ratio must be >= 1".into()));
        }
        for (label, heads) in [("encoder", self.encoder_heads), ("decoder", self.decoder_heads)] {
            if heads == 0 || self.emb_dim % heads != 0 {
                return Err(MaeError::InvalidConfig(format!(
                    "{label}_heads {heads} must divide emb_dim {}",
                    self.emb_dim
                )));
            }
        }
        self.modality_a.validate()?;
        self.modality_b.validate()?;
        self.loss.validate()
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> MaeResult<Self> {
        let cfg: MaeConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn load(path: &Path) -> MaeResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
