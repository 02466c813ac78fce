//! Homogeneous sampling-grid construction.
//!
//! The resampler evaluates the predicted affine transform on a fixed grid of
//! normalized output coordinates. The grid depends only on the output
//! resolution, so it is built once per `(height, width)` pair and reused for
//! every batch via broadcast matmul.

use tch::{Device, Kind, Tensor};

/// Build the homogeneous coordinate grid for an `h × w` output.
///
/// # Layout
///
/// Returns a `[3, h·w]` tensor whose columns enumerate output pixels in
/// row-major order (x varies fastest):
///
/// - row 0: x coordinates, `w` values linearly spaced over `[-1, 1]`,
///   tiled `h` times,
/// - row 1: y coordinates, `h` values linearly spaced over `[-1, 1]`,
///   each repeated `w` times,
/// - row 2: ones (homogeneous coordinate).
///
/// Pure function of two positive integers; broadcastable across the batch
/// dimension by matmul with a `[B, 2, 3]` transform.
pub fn homogeneous_grid(h: i64, w: i64, device: Device) -> Tensor {
    let xs = Tensor::linspace(-1.0, 1.0, w, (Kind::Float, device));
    let ys = Tensor::linspace(-1.0, 1.0, h, (Kind::Float, device));

    // meshgrid, flattened row-major: for each y, all x values.
    let xx = xs.unsqueeze(0).expand([h, w], true).reshape([-1]);
    let yy = ys.unsqueeze(1).expand([h, w], true).reshape([-1]);
    let ones = Tensor::ones([h * w], (Kind::Float, device));

    Tensor::stack(&[xx, yy, ones], 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn value_at(grid: &Tensor, row: i64, col: i64) -> f64 {
        grid.get(row).get(col).double_value(&[])
    }

    #[test]
    fn grid_has_hw_columns() {
        let g = homogeneous_grid(5, 7, Device::Cpu);
        assert_eq!(g.size(), [3, 35]);
    }

    #[test]
    fn x_row_attains_extremes() {
        let (h, w) = (4i64, 9i64);
        let g = homogeneous_grid(h, w, Device::Cpu);
        // First column of every row block is x = -1, last is x = 1.
        assert_eq!(value_at(&g, 0, 0), -1.0);
        assert_eq!(value_at(&g, 0, w - 1), 1.0);
        assert_eq!(value_at(&g, 0, h * w - 1), 1.0);
    }

    #[test]
    fn y_row_attains_extremes_and_repeats_per_row() {
        let (h, w) = (4i64, 9i64);
        let g = homogeneous_grid(h, w, Device::Cpu);
        assert_eq!(value_at(&g, 1, 0), -1.0);
        assert_eq!(value_at(&g, 1, w - 1), -1.0); // same output row
        assert_eq!(value_at(&g, 1, h * w - 1), 1.0);
    }

    #[test]
    fn ones_row_is_all_ones() {
        let g = homogeneous_grid(3, 3, Device::Cpu);
        let min: f64 = g.get(2).min().double_value(&[]);
        let max: f64 = g.get(2).max().double_value(&[]);
        assert_eq!(min, 1.0);
        assert_eq!(max, 1.0);
    }
}
