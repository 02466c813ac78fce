//! Shared convolutional building blocks.
//!
//! All blocks follow the same construction recipe: reflection padding where
//! spatial padding is needed, weights drawn from `N(0, 0.02)`, an optional
//! normalisation layer, and a configurable activation. Instance
//! normalisation is the non-affine functional variant with `eps = 1e-5`.

use std::borrow::Borrow;

use tch::nn::{self, Init, ModuleT};
use tch::Tensor;

use crate::config::{Activation, NormKind};

/// Weight initialisation used by every conv and linear layer in the model.
pub(crate) fn weight_init() -> Init {
    Init::Randn { mean: 0.0, stdev: 0.02 }
}

const INSTANCE_NORM_EPS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Per-block normalisation layer. Batch norm owns running statistics;
/// instance norm is stateless and non-affine.
#[derive(Debug)]
enum Norm {
    None,
    Batch(nn::BatchNorm),
    Instance,
}

impl Norm {
    fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, kind: NormKind, channels: i64) -> Self {
        match kind {
            NormKind::None => Norm::None,
            NormKind::Batch => Norm::Batch(nn::batch_norm2d(vs, channels, Default::default())),
            NormKind::Instance => Norm::Instance,
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            Norm::None => xs.shallow_clone(),
            Norm::Batch(bn) => bn.forward_t(xs, train),
            Norm::Instance => xs.instance_norm::<Tensor>(
                None,
                None,
                None,
                None,
                true,
                0.0,
                INSTANCE_NORM_EPS,
                false,
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// ConvBlock
// ---------------------------------------------------------------------------

/// Reflection pad, conv, norm, activation.
#[derive(Debug)]
pub struct ConvBlock {
    pad: i64,
    conv: nn::Conv2D,
    norm: Norm,
    act: Activation,
}

impl ConvBlock {
    /// `pad` is the symmetric reflection-padding amount applied before the
    /// convolution; the convolution itself never pads.
    #[allow(clippy::too_many_arguments)]
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        in_c: i64,
        out_c: i64,
        ksize: i64,
        stride: i64,
        pad: i64,
        norm: NormKind,
        act: Activation,
        bias: bool,
    ) -> Self {
        let vs = vs.borrow();
        let conv_cfg = nn::ConvConfig {
            stride,
            padding: 0,
            bias,
            ws_init: weight_init(),
            ..Default::default()
        };
        ConvBlock {
            pad,
            conv: nn::conv2d(vs / "conv", in_c, out_c, ksize, conv_cfg),
            norm: Norm::new(vs / "norm", norm, out_c),
            act,
        }
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let padded = if self.pad > 0 {
            xs.reflection_pad2d([self.pad, self.pad, self.pad, self.pad])
        } else {
            xs.shallow_clone()
        };
        let out = self.norm.forward_t(&padded.apply(&self.conv), train);
        self.act.apply(&out)
    }
}

// ---------------------------------------------------------------------------
// ConvTransposeBlock
// ---------------------------------------------------------------------------

/// Stride-2 transposed conv, norm, activation. Doubles the spatial size.
#[derive(Debug)]
pub struct ConvTransposeBlock {
    conv: nn::ConvTranspose2D,
    norm: Norm,
    act: Activation,
}

impl ConvTransposeBlock {
    /// Upsampling block with keep-size padding for odd kernel sizes.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        in_c: i64,
        out_c: i64,
        ksize: i64,
        norm: NormKind,
        act: Activation,
        bias: bool,
    ) -> Self {
        let vs = vs.borrow();
        let cfg = nn::ConvTransposeConfig {
            stride: 2,
            padding: 1,
            output_padding: 1,
            bias,
            ws_init: weight_init(),
            ..Default::default()
        };
        ConvTransposeBlock {
            conv: nn::conv_transpose2d(vs / "conv", in_c, out_c, ksize, cfg),
            norm: Norm::new(vs / "norm", norm, out_c),
            act,
        }
    }
}

impl ModuleT for ConvTransposeBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = self.norm.forward_t(&xs.apply(&self.conv), train);
        self.act.apply(&out)
    }
}

// ---------------------------------------------------------------------------
// ResBlock
// ---------------------------------------------------------------------------

/// Two 3x3 conv blocks with a skip connection. The second block carries no
/// activation so the residual sum is taken on pre-activation values.
#[derive(Debug)]
pub struct ResBlock {
    block1: ConvBlock,
    block2: ConvBlock,
}

impl ResBlock {
    /// Residual block at a fixed channel width.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        channels: i64,
        norm: NormKind,
        act: Activation,
        bias: bool,
    ) -> Self {
        let vs = vs.borrow();
        ResBlock {
            block1: ConvBlock::new(vs / "block1", channels, channels, 3, 1, 1, norm, act, bias),
            block2: ConvBlock::new(
                vs / "block2",
                channels,
                channels,
                3,
                1,
                1,
                norm,
                Activation::Linear,
                bias,
            ),
        }
    }
}

impl ModuleT for ResBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs + self.block2.forward_t(&self.block1.forward_t(xs, train), train)
    }
}

// ---------------------------------------------------------------------------
// LinearBlock
// ---------------------------------------------------------------------------

/// Fully-connected layer with the shared weight init and an activation.
#[derive(Debug)]
pub struct LinearBlock {
    linear: nn::Linear,
    act: Activation,
}

impl LinearBlock {
    /// Dense layer of `in_dim -> out_dim` followed by `act`.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        in_dim: i64,
        out_dim: i64,
        act: Activation,
    ) -> Self {
        let cfg = nn::LinearConfig { ws_init: weight_init(), ..Default::default() };
        LinearBlock { linear: nn::linear(vs, in_dim, out_dim, cfg), act }
    }
}

impl ModuleT for LinearBlock {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        self.act.apply(&xs.apply(&self.linear))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
