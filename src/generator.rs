//! Generator with an embedded spatial-transformer front end.
//!
//! The input batch is first warped by the spatial transformer, then passed
//! through a resnet-style encoder/decoder. Contrastive feature extraction
//! taps the encoder at configurable depths and sees exactly the same warped
//! view as the translation path.

use std::borrow::Borrow;

use tch::nn::{self, ModuleT};
use tch::Tensor;

use crate::config::{Activation, ModelConfig, NormKind, TrainOptions};
use crate::localizer::Localizer;
use crate::modules::{ConvBlock, ConvTransposeBlock, ResBlock};
use crate::sampler::BilinearSampler;

// ---------------------------------------------------------------------------
// Spatial transformer
// ---------------------------------------------------------------------------

/// Localizer plus resampler. Predicts an affine matrix from the input and
/// warps the input with it.
#[derive(Debug)]
pub struct SpatialTransformer {
    localizer: Localizer,
    sampler: BilinearSampler,
}

impl SpatialTransformer {
    /// Build the localizer and a sampler matching the training resolution.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        config: &ModelConfig,
        opts: &TrainOptions,
    ) -> Self {
        let vs = vs.borrow();
        SpatialTransformer {
            localizer: Localizer::new(vs / "localizer", config, opts),
            sampler: BilinearSampler::new(opts.image_size, opts.image_size, vs.device()),
        }
    }

    /// Warp `xs` with its own predicted affine matrix, returning the warped
    /// batch and the `[B, 2, 3]` matrix that produced it.
    pub fn warp(&self, xs: &Tensor, train: bool) -> (Tensor, Tensor) {
        let theta = self.localizer.forward_t(xs, train);
        (self.sampler.warp(xs, &theta), theta)
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// One encoder stage. Indexing matters for the contrastive taps: stage 0 is
/// the stem, the next `num_downsamples` stages are strided convs, and the
/// remaining stages are residual blocks.
#[derive(Debug)]
enum EncoderStage {
    Conv(ConvBlock),
    Res(ResBlock),
}

impl EncoderStage {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            EncoderStage::Conv(b) => b.forward_t(xs, train),
            EncoderStage::Res(b) => b.forward_t(xs, train),
        }
    }
}

/// Warp + encode + decode image-to-image generator.
#[derive(Debug)]
pub struct Generator {
    stn: SpatialTransformer,
    encoder: Vec<EncoderStage>,
    upsamples: Vec<ConvTransposeBlock>,
    output: ConvBlock,
}

impl Generator {
    /// Build the warp, encoder, and decoder under one variable path.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        config: &ModelConfig,
        opts: &TrainOptions,
    ) -> Self {
        let vs = vs.borrow();
        let stn = SpatialTransformer::new(vs / "stn", config, opts);

        let mut encoder = Vec::with_capacity(config.encoder_depth());
        encoder.push(EncoderStage::Conv(ConvBlock::new(
            vs / "enc_stem",
            opts.num_channels,
            config.base,
            7,
            1,
            3,
            config.norm,
            config.act,
            config.use_bias,
        )));
        let mut channels = config.base;
        for i in 0..config.num_downsamples {
            let out_c = (channels * 2).min(config.max_filters);
            encoder.push(EncoderStage::Conv(ConvBlock::new(
                vs / format!("enc_down{i}"),
                channels,
                out_c,
                3,
                2,
                1,
                config.norm,
                config.act,
                config.use_bias,
            )));
            channels = out_c;
        }
        for i in 0..config.num_resblocks {
            encoder.push(EncoderStage::Res(ResBlock::new(
                vs / format!("enc_res{i}"),
                channels,
                config.norm,
                config.act,
                config.use_bias,
            )));
        }

        let mut upsamples = Vec::with_capacity(config.num_downsamples as usize);
        for i in 0..config.num_downsamples {
            let out_c = (channels / 2).max(config.base);
            upsamples.push(ConvTransposeBlock::new(
                vs / format!("dec_up{i}"),
                channels,
                out_c,
                3,
                config.norm,
                config.act,
                config.use_bias,
            ));
            channels = out_c;
        }
        let output = ConvBlock::new(
            vs / "dec_out",
            channels,
            opts.num_channels,
            7,
            1,
            3,
            NormKind::None,
            Activation::Tanh,
            config.use_bias,
        );

        Generator { stn, encoder, upsamples, output }
    }

    /// The embedded spatial transformer.
    pub fn stn(&self) -> &SpatialTransformer {
        &self.stn
    }

    /// Translate a batch, returning the output image and the affine matrix
    /// predicted for the warp.
    pub fn forward_with_theta(&self, xs: &Tensor, train: bool) -> (Tensor, Tensor) {
        let (warped, theta) = self.stn.warp(xs, train);
        let mut x = warped;
        for stage in &self.encoder {
            x = stage.forward_t(&x, train);
        }
        for up in &self.upsamples {
            x = up.forward_t(&x, train);
        }
        (self.output.forward_t(&x, train), theta)
    }

    /// Encoder activations at the requested stage indices, in ascending
    /// order. The input passes through the same warp as the full forward
    /// pass, so contrastive features always describe the warped view.
    pub fn encoder_features(&self, xs: &Tensor, layers: &[usize], train: bool) -> Vec<Tensor> {
        let (warped, _theta) = self.stn.warp(xs, train);
        let mut feats = Vec::with_capacity(layers.len());
        let mut x = warped;
        for (idx, stage) in self.encoder.iter().enumerate() {
            x = stage.forward_t(&x, train);
            if layers.contains(&idx) {
                feats.push(x.shallow_clone());
            }
            if feats.len() == layers.len() {
                break;
            }
        }
        feats
    }
}

impl ModuleT for Generator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.forward_with_theta(xs, train).0
    }
}
