//! Unpaired image-to-image translation with a contrastive objective and an
//! embedded spatial-transformer warp.
//!
//! The generator first warps its input with a self-predicted affine
//! transform, then translates the warped view with a resnet encoder/decoder.
//! A patch-based critic drives a least-squares adversarial loss, and a
//! patch-wise InfoNCE term ties encoder features of the translation back to
//! the same spatial locations of the source.
//!
//! ```text
//!            source ──► localizer ──► theta
//!               │                       │
//!               └──► bilinear warp ◄────┘
//!                        │
//!                 encoder ──► decoder ──► translation ──► critic
//!                    │                        │
//!                    └── patch sampler ◄──────┘
//!                              │
//!                          InfoNCE
//! ```
//!
//! Training keeps the three networks in disjoint variable stores, builds
//! one autograd graph per step, and differentiates it once per network so
//! the three Adam optimizers never share gradient state.
//!
//! # Example
//!
//! ```no_run
//! use cutstn_train::{CutStn, ModelConfig, SyntheticImageDataset, TrainOptions, Trainer};
//!
//! # fn main() -> Result<(), cutstn_train::TrainError> {
//! let config = ModelConfig::default();
//! let opts = TrainOptions::default();
//! let dataset = SyntheticImageDataset::new(64, opts.image_size, opts.num_channels);
//! let model = CutStn::new(config, opts, tch::Device::Cpu)?;
//! let mut trainer = Trainer::new(model, &dataset);
//! let summary = trainer.run()?;
//! println!("trained {} steps", summary.steps);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dataset;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod grid;
pub mod localizer;
pub mod losses;
pub mod model;
pub mod modules;
pub mod optim;
pub mod patch;
pub mod sampler;
pub mod trainer;

pub use config::{Activation, ModelConfig, NormKind, TrainOptions};
pub use dataset::{DataLoader, FolderDataset, ImageDataset, ImagePair, SyntheticImageDataset};
pub use discriminator::Discriminator;
pub use error::{ConfigError, DatasetError, TrainError, TrainResult};
pub use generator::{Generator, SpatialTransformer};
pub use localizer::Localizer;
pub use model::{CutStn, SynthesisPreview};
pub use optim::Adam;
pub use patch::PatchSampler;
pub use sampler::BilinearSampler;
pub use trainer::{Trainer, TrainingSummary};

/// Crate version, taken from the package manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
