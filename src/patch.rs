//! Patch feature sampler for the contrastive objective.
//!
//! Takes encoder activations at several depths, samples the same spatial
//! locations from each batch element, and projects the sampled vectors
//! through a per-depth two-layer MLP followed by L2 normalisation. Reusing
//! the location indices from a previous call is what makes source and
//! translated features positionally comparable.

use std::borrow::Borrow;

use tch::nn::{self, ModuleT};
use tch::{Device, Kind, Tensor};

use crate::config::ModelConfig;
use crate::error::{TrainError, TrainResult};
use crate::modules::{weight_init, LinearBlock};

/// Per-depth projection head.
#[derive(Debug)]
struct PatchMlp {
    hidden: LinearBlock,
    out: nn::Linear,
}

impl PatchMlp {
    fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, in_dim: i64, units: i64, config: &ModelConfig) -> Self {
        let vs = vs.borrow();
        let cfg = nn::LinearConfig { ws_init: weight_init(), ..Default::default() };
        PatchMlp {
            hidden: LinearBlock::new(vs / "hidden", in_dim, units, config.act),
            out: nn::linear(vs / "out", units, units, cfg),
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.hidden.forward_t(xs, train).apply(&self.out)
    }
}

/// Samples and embeds patch features from a stack of encoder activations.
#[derive(Debug)]
pub struct PatchSampler {
    mlps: Vec<PatchMlp>,
    num_patches: i64,
    device: Device,
}

impl PatchSampler {
    /// Build one projection head per contrastive depth. Input widths come
    /// from the generator's encoder channel progression.
    pub fn new<'a, P: Borrow<nn::Path<'a>>>(vs: P, config: &ModelConfig) -> Self {
        let vs = vs.borrow();
        let mlps = config
            .nce_layers
            .iter()
            .enumerate()
            .map(|(i, &layer)| {
                PatchMlp::new(
                    vs / format!("mlp{i}"),
                    config.encoder_channels(layer),
                    config.units,
                    config,
                )
            })
            .collect();
        PatchSampler { mlps, num_patches: config.num_patches, device: vs.device() }
    }

    /// Sample, project, and normalise features from each depth.
    ///
    /// With `ids: None` fresh random locations are drawn per depth; pass the
    /// ids returned by an earlier call to sample the same locations again.
    /// Returns `(features, ids)` where each feature tensor is
    /// `[B·num_patches, units]` with unit-norm rows.
    pub fn forward(
        &self,
        feats: &[Tensor],
        ids: Option<&[Tensor]>,
        train: bool,
    ) -> TrainResult<(Vec<Tensor>, Vec<Tensor>)> {
        if feats.len() != self.mlps.len() {
            return Err(TrainError::training_step(format!(
                "expected activations for {} depths, got {}",
                self.mlps.len(),
                feats.len()
            )));
        }
        if let Some(ids) = ids {
            if ids.len() != feats.len() {
                return Err(TrainError::training_step(format!(
                    "expected {} id tensors, got {}",
                    feats.len(),
                    ids.len()
                )));
            }
        }

        let mut out_feats = Vec::with_capacity(feats.len());
        let mut out_ids = Vec::with_capacity(feats.len());
        for (depth, (feat, mlp)) in feats.iter().zip(&self.mlps).enumerate() {
            let size = feat.size();
            let (b, c, h, w) = (size[0], size[1], size[2], size[3]);
            let hw = h * w;
            // [B, C, H, W] -> [B, HW, C]
            let flat = feat.reshape([b, c, hw]).transpose(1, 2);

            let depth_ids = match ids {
                Some(ids) => ids[depth].shallow_clone(),
                None => {
                    let n = self.num_patches.min(hw);
                    Tensor::randperm(hw, (Kind::Int64, self.device)).slice(0, 0, n, 1)
                }
            };
            let n = depth_ids.size()[0];

            let sampled = flat.index_select(1, &depth_ids).reshape([b * n, c]);
            let projected = mlp.forward_t(&sampled, train);
            out_feats.push(l2_normalize(&projected));
            out_ids.push(depth_ids);
        }
        Ok((out_feats, out_ids))
    }
}

/// Row-wise L2 normalisation with a small stabiliser in the denominator.
fn l2_normalize(x: &Tensor) -> Tensor {
    let norm = (x.square().sum_dim_intlist([-1i64].as_slice(), true, Kind::Float) + 1e-10).sqrt();
    x / norm
}
