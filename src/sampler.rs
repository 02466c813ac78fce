//! Differentiable bilinear resampler (spatial-transformer warp).
//!
//! Two-stage algorithm:
//!
//! 1. **Transform**: multiply the predicted `[B, 2, 3]` affine matrix by
//!    the cached homogeneous grid to obtain transformed `(x, y)` sampling
//!    coordinates in normalized `[-1, 1]` space.
//! 2. **Sample**: denormalise to source pixel space, gather the four
//!    nearest integer-coordinate neighbours per output location, and blend
//!    them with bilinear weights.
//!
//! Every integer corner coordinate and every continuous coordinate is
//! clamped to `[0, dim-1]`. This is a deliberate border policy: gathers can
//! never index out of range and the gradient stays defined at the image
//! boundary, at the cost of weight mass saturating onto a single corner
//! exactly at a clamped border.
//!
//! The warp is differentiable with respect to both the source image and the
//! affine parameters and has no learnable parameters of its own.

use tch::{Device, Kind, Tensor};

use crate::grid::homogeneous_grid;

/// Resampler with a fixed output resolution.
///
/// The output spatial size always equals the configured `(height, width)`
/// regardless of the source image's spatial size, so a single warp can
/// resize and align simultaneously.
#[derive(Debug)]
pub struct BilinearSampler {
    height: i64,
    width: i64,
    /// Cached `[3, height·width]` homogeneous grid, built once.
    grid: Tensor,
}

impl BilinearSampler {
    /// Create a sampler producing `h × w` outputs on `device`.
    pub fn new(h: i64, w: i64, device: Device) -> Self {
        BilinearSampler { height: h, width: w, grid: homogeneous_grid(h, w, device) }
    }

    /// Configured output height.
    pub fn height(&self) -> i64 {
        self.height
    }

    /// Configured output width.
    pub fn width(&self) -> i64 {
        self.width
    }

    /// Warp `images` (`[B, C, Hs, Ws]`) with per-sample affine matrices
    /// `theta` (`[B, 2, 3]`), producing `[B, C, height, width]`.
    pub fn warp(&self, images: &Tensor, theta: &Tensor) -> Tensor {
        let size = images.size();
        let (bs, c, hs, ws) = (size[0], size[1], size[2], size[3]);
        let n = self.height * self.width;

        // [B, 2, 3] x [3, n] -> [B, 2, n]
        let transformed = theta.matmul(&self.grid);
        let x_norm = transformed.select(1, 0); // [B, n]
        let y_norm = transformed.select(1, 1);

        // Denormalise into source pixel space, scaling by the full
        // dimension (not dim - 1).
        let x = (&x_norm + 1.0) * (ws as f64) * 0.5;
        let y = (&y_norm + 1.0) * (hs as f64) * 0.5;

        let x_max = (ws - 1) as f64;
        let y_max = (hs - 1) as f64;

        let x0 = x.floor().clamp(0.0, x_max);
        let x1 = (x.floor() + 1.0).clamp(0.0, x_max);
        let y0 = y.floor().clamp(0.0, y_max);
        let y1 = (y.floor() + 1.0).clamp(0.0, y_max);
        let x = x.clamp(0.0, x_max);
        let y = y.clamp(0.0, y_max);

        // Four corner gathers from the flattened source.
        let flat = images.reshape([bs, c, hs * ws]);
        let gather_at = |xi: &Tensor, yi: &Tensor| -> Tensor {
            let idx = (yi * (ws as f64) + xi)
                .to_kind(Kind::Int64)
                .unsqueeze(1)
                .expand([bs, c, n], true);
            flat.gather(2, &idx, false)
        };
        let ia = gather_at(&x0, &y0);
        let ib = gather_at(&x0, &y1);
        let ic = gather_at(&x1, &y0);
        let id = gather_at(&x1, &y1);

        // Bilinear weights from fractional distances to the clamped corners.
        // They sum to 1 at interior locations; at clamped borders the mass
        // can saturate onto a single corner.
        let wa = ((&x1 - &x) * (&y1 - &y)).unsqueeze(1);
        let wb = ((&x1 - &x) * (&y - &y0)).unsqueeze(1);
        let wc = ((&x - &x0) * (&y1 - &y)).unsqueeze(1);
        let wd = ((&x - &x0) * (&y - &y0)).unsqueeze(1);

        (wa * ia + wb * ib + wc * ic + wd * id).reshape([bs, c, self.height, self.width])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Identity affine matrices for a batch of `b`.
    fn identity_theta(b: i64) -> Tensor {
        Tensor::from_slice(&[1f32, 0., 0., 0., 1., 0.])
            .reshape([1, 2, 3])
            .expand([b, 2, 3], true)
            .contiguous()
    }

    #[test]
    fn constant_image_is_preserved_by_identity() {
        let sampler = BilinearSampler::new(8, 8, Device::Cpu);
        let img = Tensor::full([2, 3, 8, 8], 0.25, (Kind::Float, Device::Cpu));
        let out = sampler.warp(&img, &identity_theta(2));
        assert_eq!(out.size(), [2, 3, 8, 8]);
        // Weights sum to 1 everywhere a constant image is concerned, so the
        // constant must come through exactly (up to float rounding).
        let max_err: f64 = (&out - 0.25).abs().max().double_value(&[]);
        assert!(max_err < 1e-6, "constant image distorted by {max_err}");
    }

    #[test]
    fn output_size_is_independent_of_source_size() {
        let sampler = BilinearSampler::new(16, 12, Device::Cpu);
        let small = Tensor::zeros([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let large = Tensor::zeros([1, 3, 64, 48], (Kind::Float, Device::Cpu));
        assert_eq!(sampler.warp(&small, &identity_theta(1)).size(), [1, 3, 16, 12]);
        assert_eq!(sampler.warp(&large, &identity_theta(1)).size(), [1, 3, 16, 12]);
    }

    #[test]
    fn translation_shifts_sampling_window() {
        let sampler = BilinearSampler::new(16, 16, Device::Cpu);
        // Horizontal ramp: brightness grows with x.
        let ramp = Tensor::linspace(-1.0, 1.0, 16, (Kind::Float, Device::Cpu))
            .reshape([1, 1, 1, 16])
            .expand([1, 1, 16, 16], true)
            .contiguous();

        let base = sampler.warp(&ramp, &identity_theta(1)).mean(Kind::Float);
        let shifted_theta = Tensor::from_slice(&[1f32, 0., 0.5, 0., 1., 0.]).reshape([1, 2, 3]);
        let shifted = sampler.warp(&ramp, &shifted_theta).mean(Kind::Float);

        // Sampling at x + 0.5 gathers brighter pixels.
        assert!(
            shifted.double_value(&[]) > base.double_value(&[]),
            "positive x translation should increase the sampled mean"
        );
    }

    #[test]
    fn strong_zoom_out_saturates_at_borders_without_panicking() {
        let sampler = BilinearSampler::new(8, 8, Device::Cpu);
        let img = Tensor::rand([1, 3, 8, 8], (Kind::Float, Device::Cpu));
        // Scale 3 pushes most sampling coordinates outside [-1, 1]; every
        // gather must stay in bounds and the output must stay in range.
        let theta = Tensor::from_slice(&[3f32, 0., 0., 0., 3., 0.]).reshape([1, 2, 3]);
        let out = sampler.warp(&img, &theta);
        let min: f64 = out.min().double_value(&[]);
        let max: f64 = out.max().double_value(&[]);
        assert!(min.is_finite() && max.is_finite());
        assert!(min >= 0.0 - 1e-6 && max <= 1.0 + 1e-6);
    }

    #[test]
    fn warp_is_differentiable_wrt_theta() {
        let sampler = BilinearSampler::new(8, 8, Device::Cpu);
        let img = Tensor::rand([1, 1, 8, 8], (Kind::Float, Device::Cpu));
        let theta = identity_theta(1).set_requires_grad(true);
        let loss = sampler.warp(&img, &theta).sum(Kind::Float);
        let grads = Tensor::run_backward(&[loss], &[theta.shallow_clone()], false, false);
        assert_eq!(grads[0].size(), [1, 2, 3]);
        let norm: f64 = grads[0].abs().sum(Kind::Float).double_value(&[]);
        assert!(norm.is_finite());
    }
}
