//! Localizer network: predicts a per-sample `[2, 3]` affine matrix.
//!
//! A small strided CNN followed by a dense head. The head's weights start
//! at zero and its bias at the identity transform, so a freshly built
//! localizer always predicts identity and the warp starts as a no-op.

use std::borrow::Borrow;

use tch::nn::{self, ModuleT};
use tch::Tensor;

use crate::config::{ModelConfig, TrainOptions};
use crate::modules::{ConvBlock, LinearBlock};

/// Row-major identity affine parameters `[[1, 0, 0], [0, 1, 0]]`.
pub const IDENTITY_THETA: [f32; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

/// Number of stride-2 stages; fixes the total downsampling factor at 16.
const NUM_DOWNSAMPLES: usize = 4;

/// Affine-parameter regressor.
#[derive(Debug)]
pub struct Localizer {
    stem: ConvBlock,
    downs: Vec<ConvBlock>,
    hidden: LinearBlock,
    head: nn::Linear,
    flat_dim: i64,
}

impl Localizer {
    /// Build for square `opts.image_size` inputs with `opts.num_channels`
    /// channels. The spatial size must be divisible by 16.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(
        vs: P,
        config: &ModelConfig,
        opts: &TrainOptions,
    ) -> Self {
        let vs = vs.borrow();
        let stem = ConvBlock::new(
            vs / "stem",
            opts.num_channels,
            config.base,
            7,
            1,
            3,
            config.norm,
            config.act,
            config.use_bias,
        );

        // Widths double per stage but saturate at `max_filters`, so for
        // `base >= 64` the deepest stages stay at the cap rather than
        // growing unbounded.
        let mut downs = Vec::with_capacity(NUM_DOWNSAMPLES);
        let mut in_c = config.base;
        for i in 0..NUM_DOWNSAMPLES {
            let out_c = (in_c * 2).min(config.max_filters);
            downs.push(ConvBlock::new(
                vs / format!("down{i}"),
                in_c,
                out_c,
                3,
                2,
                1,
                config.norm,
                config.act,
                config.use_bias,
            ));
            in_c = out_c;
        }

        let side = opts.image_size >> NUM_DOWNSAMPLES;
        let flat_dim = in_c * side * side;
        let hidden = LinearBlock::new(vs / "hidden", flat_dim, config.max_filters, config.act);

        // Identity start: zero weights, identity bias.
        let head_cfg = nn::LinearConfig {
            ws_init: nn::Init::Const(0.0),
            bs_init: Some(nn::Init::Const(0.0)),
            ..Default::default()
        };
        let mut head = nn::linear(vs / "head", config.max_filters, 6, head_cfg);
        if let Some(bs) = &mut head.bs {
            tch::no_grad(|| {
                bs.copy_(&Tensor::from_slice(&IDENTITY_THETA).to_device(bs.device()));
            });
        }

        Localizer { stem, downs, hidden, head, flat_dim }
    }
}

impl ModuleT for Localizer {
    /// `[B, C, H, W]` image batch to `[B, 2, 3]` affine matrices.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut x = self.stem.forward_t(xs, train);
        for down in &self.downs {
            x = down.forward_t(&x, train);
        }
        let b = x.size()[0];
        let flat = x.reshape([b, self.flat_dim]);
        let theta = self.hidden.forward_t(&flat, train).apply(&self.head);
        theta.reshape([b, 2, 3])
    }
}
