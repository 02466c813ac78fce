//! Patch-based discriminator.
//!
//! A 70x70-receptive-field convolutional critic: every spatial position of
//! the single-channel output map scores one overlapping patch of the input.
//! The first block carries no normalisation; intermediate blocks use the
//! configured norm with leaky-ReLU activations; the final projection is
//! linear so the least-squares loss sees raw scores.

use std::borrow::Borrow;

use tch::nn::{self, ModuleT};
use tch::Tensor;

use crate::config::{Activation, ModelConfig, NormKind, TrainOptions};
use crate::modules::ConvBlock;

/// PatchGAN critic producing `[B, 1, H', W']` score maps.
#[derive(Debug)]
pub struct Discriminator {
    blocks: Vec<ConvBlock>,
}

impl Discriminator {
    /// Build the five-block critic stack.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        config: &ModelConfig,
        opts: &TrainOptions,
    ) -> Self {
        let vs = vs.borrow();
        let b = config.base;
        let blocks = vec![
            ConvBlock::new(
                vs / "block0",
                opts.num_channels,
                b,
                4,
                2,
                1,
                NormKind::None,
                Activation::Lrelu,
                config.use_bias,
            ),
            ConvBlock::new(
                vs / "block1",
                b,
                b * 2,
                4,
                2,
                1,
                config.norm,
                Activation::Lrelu,
                config.use_bias,
            ),
            ConvBlock::new(
                vs / "block2",
                b * 2,
                b * 4,
                4,
                2,
                1,
                config.norm,
                Activation::Lrelu,
                config.use_bias,
            ),
            ConvBlock::new(
                vs / "block3",
                b * 4,
                (b * 8).min(config.max_filters),
                4,
                1,
                1,
                config.norm,
                Activation::Lrelu,
                config.use_bias,
            ),
            ConvBlock::new(
                vs / "score",
                (b * 8).min(config.max_filters),
                1,
                4,
                1,
                1,
                NormKind::None,
                Activation::Linear,
                config.use_bias,
            ),
        ];
        Discriminator { blocks }
    }
}

impl ModuleT for Discriminator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut x = xs.shallow_clone();
        for block in &self.blocks {
            x = block.forward_t(&x, train);
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device, Kind};

    #[test]
    fn produces_single_channel_patch_scores() {
        let mut config = ModelConfig::default();
        config.base = 8;
        config.max_filters = 32;
        let mut opts = TrainOptions::default();
        opts.image_size = 32;
        opts.num_channels = 3;

        let vs = VarStore::new(Device::Cpu);
        let disc = Discriminator::new(vs.root(), &config, &opts);
        let x = Tensor::rand([2, 3, 32, 32], (Kind::Float, Device::Cpu));
        let scores = disc.forward_t(&x, true);
        let size = scores.size();
        assert_eq!(size[0], 2);
        assert_eq!(size[1], 1);
        // Three stride-2 blocks plus two unpadded-by-1 stride-1 blocks.
        assert!(size[2] > 1 && size[2] < 8);
    }

    #[test]
    fn scores_are_unbounded() {
        let mut config = ModelConfig::default();
        config.base = 8;
        config.max_filters = 32;
        let mut opts = TrainOptions::default();
        opts.image_size = 32;

        let vs = VarStore::new(Device::Cpu);
        let disc = Discriminator::new(vs.root(), &config, &opts);
        // A linear head means scores scale with input magnitude rather than
        // saturating through a sigmoid.
        let small = Tensor::rand([1, 3, 32, 32], (Kind::Float, Device::Cpu));
        let big = &small * 100.0;
        let s_small: f64 = disc.forward_t(&small, false).abs().max().double_value(&[]);
        let s_big: f64 = disc.forward_t(&big, false).abs().max().double_value(&[]);
        assert!(s_big > s_small);
    }
}
