//! Configuration for CUT-STN training.
//!
//! Two structs are loaded/validated here:
//!
//! - [`ModelConfig`] — architecture and loss hyper-parameters consumed at
//!   model construction time (channel widths, block counts, NCE settings).
//! - [`TrainOptions`] — run-level options owned by the driver (image size,
//!   batch size, optimiser hyper-parameters, directories, seed).
//!
//! Both are serializable via [`serde`] so they can be stored to / restored
//! from JSON files alongside checkpoints.
//!
//! # Example
//!
//! ```rust
//! use cutstn_train::config::ModelConfig;
//!
//! let cfg = ModelConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.num_downsamples, 2);
//! assert_eq!(cfg.nce_layers, vec![0, 1, 2, 3]);
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Activation / normalization kinds
// ---------------------------------------------------------------------------

/// Activation applied inside conv and dense blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Rectified linear unit.
    Relu,
    /// Leaky ReLU with negative slope 0.2.
    Lrelu,
    /// Hyperbolic tangent (bounded to `[-1, 1]`).
    Tanh,
    /// Identity (no activation).
    Linear,
}

impl Activation {
    /// Apply the activation to a tensor.
    pub fn apply(self, x: &tch::Tensor) -> tch::Tensor {
        match self {
            Activation::Relu => x.relu(),
            Activation::Lrelu => {
                let scaled = x * 0.2;
                x.maximum(&scaled)
            }
            Activation::Tanh => x.tanh(),
            Activation::Linear => x.shallow_clone(),
        }
    }
}

/// Normalization applied after convolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
    /// No normalization.
    None,
    /// Batch normalization (running statistics, train/eval behaviour).
    Batch,
    /// Non-affine instance normalization (per-sample spatial moments).
    Instance,
}

// ---------------------------------------------------------------------------
// ModelConfig
// ---------------------------------------------------------------------------

/// Architecture and loss hyper-parameters for the CUT-STN model.
///
/// All fields have documented defaults. Use [`ModelConfig::default()`] as a
/// starting point, then override individual fields as needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Activation kind used in conv and dense blocks. Default: **relu**.
    pub act: Activation,

    /// Whether convolutions carry a bias term. Default: **true**.
    pub use_bias: bool,

    /// Normalization kind for conv blocks. Default: **instance**.
    pub norm: NormKind,

    /// Initial channel width of the generator / localizer stem. Default: **64**.
    pub base: i64,

    /// Number of stride-2 downsampling blocks in the generator encoder
    /// (mirrored by the decoder's upsampling blocks). Default: **2**.
    pub num_downsamples: i64,

    /// Number of residual blocks at the encoder bottleneck. Default: **4**.
    pub num_resblocks: i64,

    /// Width of the localizer's hidden dense layer. Default: **512**.
    pub max_filters: i64,

    /// Ordered encoder depth indices whose activations feed the projection
    /// head. Index 0 is the stem, `1..=num_downsamples` the downsampling
    /// blocks, and the following `num_resblocks` indices the residual
    /// blocks. Default: **[0, 1, 2, 3]**.
    pub nce_layers: Vec<usize>,

    /// Weight of the contrastive term in the generator loss. Default: **1.0**.
    pub lambda_nce: f64,

    /// Temperature for the contrastive similarity logits. Default: **0.07**.
    pub tau: f64,

    /// Embedding width of the patch projection head. Default: **256**.
    pub units: i64,

    /// Patch sampling budget per feature depth. Default: **256**.
    pub num_patches: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            act: Activation::Relu,
            use_bias: true,
            norm: NormKind::Instance,
            base: 64,
            num_downsamples: 2,
            num_resblocks: 4,
            max_filters: 512,
            nce_layers: vec![0, 1, 2, 3],
            lambda_nce: 1.0,
            tau: 0.07,
            units: 256,
            num_patches: 256,
        }
    }
}

impl ModelConfig {
    /// Number of blocks in the generator encoder (stem + downsamples +
    /// residual blocks). This is the exclusive upper bound for entries of
    /// [`ModelConfig::nce_layers`].
    pub fn encoder_depth(&self) -> usize {
        1 + self.num_downsamples as usize + self.num_resblocks as usize
    }

    /// Channel width of the encoder block at `idx`.
    ///
    /// The stem produces `base` channels, each downsampling block doubles
    /// the width up to `max_filters`, and residual blocks keep the
    /// bottleneck width.
    pub fn encoder_channels(&self, idx: usize) -> i64 {
        let n = self.num_downsamples as usize;
        let stage = idx.min(n) as u32;
        (self.base * (1 << stage)).min(self.max_filters)
    }

    /// Load a [`ModelConfig`] from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileRead`] if the file cannot be opened and
    /// [`ConfigError::InvalidValue`] if the JSON is malformed or the loaded
    /// values fail [`ModelConfig::validate`].
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: ModelConfig = serde_json::from_str(&contents)
            .map_err(|e| ConfigError::invalid_value("(file)", e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON at `path`,
    /// creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileRead {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validate all fields and return an error describing the first problem
    /// found, or `Ok(())` if the configuration is coherent.
    ///
    /// # Validated invariants
    ///
    /// - `base`, `max_filters`, `units` and `num_patches` must be positive.
    /// - `num_downsamples` and `num_resblocks` must be positive.
    /// - `nce_layers` must be non-empty, strictly increasing, and every
    ///   index must fall inside the encoder block list.
    /// - `tau` must be strictly positive.
    /// - `lambda_nce` must be non-negative.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base <= 0 {
            return Err(ConfigError::invalid_value("base", "must be > 0"));
        }
        if self.num_downsamples <= 0 {
            return Err(ConfigError::invalid_value("num_downsamples", "must be > 0"));
        }
        if self.num_resblocks <= 0 {
            return Err(ConfigError::invalid_value("num_resblocks", "must be > 0"));
        }
        if self.max_filters <= 0 {
            return Err(ConfigError::invalid_value("max_filters", "must be > 0"));
        }
        if self.units <= 0 {
            return Err(ConfigError::invalid_value("units", "must be > 0"));
        }
        if self.num_patches <= 0 {
            return Err(ConfigError::invalid_value("num_patches", "must be > 0"));
        }
        if self.tau <= 0.0 {
            return Err(ConfigError::invalid_value("tau", "must be > 0.0"));
        }
        if self.lambda_nce < 0.0 {
            return Err(ConfigError::invalid_value("lambda_nce", "must be >= 0.0"));
        }

        if self.nce_layers.is_empty() {
            return Err(ConfigError::invalid_value("nce_layers", "must not be empty"));
        }
        let depth = self.encoder_depth();
        let mut prev: Option<usize> = None;
        for &idx in &self.nce_layers {
            if idx >= depth {
                return Err(ConfigError::invalid_value(
                    "nce_layers",
                    format!("index {idx} exceeds encoder depth {depth}"),
                ));
            }
            if let Some(p) = prev {
                if idx <= p {
                    return Err(ConfigError::invalid_value(
                        "nce_layers",
                        "indices must be strictly increasing",
                    ));
                }
            }
            prev = Some(idx);
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TrainOptions
// ---------------------------------------------------------------------------

/// Run-level options owned by the training driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainOptions {
    /// Side length of the square input images. Must be a multiple of 16
    /// (the localizer applies four stride-2 downsamples). Default: **256**.
    pub image_size: i64,

    /// Number of image channels. Default: **3**.
    pub num_channels: i64,

    /// Mini-batch size. Default: **3**.
    pub batch_size: usize,

    /// Adam learning rate, shared by all three optimizers. Default: **1e-4**.
    pub lr: f64,

    /// Adam first-moment decay. Default: **0.5**.
    pub beta_1: f64,

    /// Adam second-moment decay. Default: **0.999**.
    pub beta_2: f64,

    /// Total number of training epochs. Default: **10**.
    pub num_epochs: usize,

    /// Number of preview samples synthesized at the end of each epoch.
    /// Default: **3**.
    pub num_samples: usize,

    /// Directory where model checkpoints are saved.
    pub ckpt_dir: PathBuf,

    /// Directory where preview images are written.
    pub output_dir: PathBuf,

    /// Use a CUDA GPU when available. Default: **false**.
    pub use_gpu: bool,

    /// Global random seed (dataset shuffle, parameter init, patch
    /// sampling). Default: **42**.
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        TrainOptions {
            image_size: 256,
            num_channels: 3,
            batch_size: 3,
            lr: 1e-4,
            beta_1: 0.5,
            beta_2: 0.999,
            num_epochs: 10,
            num_samples: 3,
            ckpt_dir: PathBuf::from("checkpoints"),
            output_dir: PathBuf::from("outputs"),
            use_gpu: false,
            seed: 42,
        }
    }
}

impl TrainOptions {
    /// Validate all fields, first problem wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_size <= 0 || self.image_size % 16 != 0 {
            return Err(ConfigError::invalid_value(
                "image_size",
                "must be a positive multiple of 16",
            ));
        }
        if self.num_channels <= 0 {
            return Err(ConfigError::invalid_value("num_channels", "must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid_value("batch_size", "must be > 0"));
        }
        if self.lr <= 0.0 {
            return Err(ConfigError::invalid_value("lr", "must be > 0.0"));
        }
        if !(0.0..1.0).contains(&self.beta_1) {
            return Err(ConfigError::invalid_value("beta_1", "must be in [0.0, 1.0)"));
        }
        if !(0.0..1.0).contains(&self.beta_2) {
            return Err(ConfigError::invalid_value("beta_2", "must be in [0.0, 1.0)"));
        }
        if self.num_epochs == 0 {
            return Err(ConfigError::invalid_value("num_epochs", "must be > 0"));
        }
        if self.num_samples == 0 {
            return Err(ConfigError::invalid_value("num_samples", "must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
