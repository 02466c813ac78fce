//! Full training model: generator, critic, patch sampler, and their
//! optimizers, driven by a single-forward-pass training step.
//!
//! The three networks live in three disjoint [`VarStore`]s. One forward
//! pass builds a shared autograd graph, and [`Tensor::run_backward`] is
//! invoked once per network against that network's own parameter list.
//! Gradients are returned explicitly and handed to per-network [`Adam`]
//! instances, so an update for one network can never leak gradient into
//! another.

use std::collections::HashMap;
use std::path::Path;

use tch::nn::{ModuleT, VarStore};
use tch::{Device, Tensor};

use crate::config::{ModelConfig, TrainOptions};
use crate::discriminator::Discriminator;
use crate::error::{TrainError, TrainResult};
use crate::generator::Generator;
use crate::losses::{discriminator_loss, generator_gan_loss, patch_nce_loss};
use crate::optim::Adam;
use crate::patch::PatchSampler;

const GENERATOR_WEIGHTS: &str = "generator.ot";
const DISCRIMINATOR_WEIGHTS: &str = "discriminator.ot";
const PATCH_SAMPLER_WEIGHTS: &str = "patch_sampler.ot";

/// Inference-for-preview capability consumed by the training driver. Any
/// model kind that can render a translated sample for monitoring implements
/// this; the driver never dispatches on a concrete model type.
pub trait SynthesisPreview {
    /// Translate a source batch in inference mode.
    fn preview(&self, source: &Tensor) -> TrainResult<Tensor>;
}

/// Contrastive unpaired translation model with an embedded warp.
#[derive(Debug)]
pub struct CutStn {
    config: ModelConfig,
    opts: TrainOptions,
    device: Device,
    vs_g: VarStore,
    vs_d: VarStore,
    vs_f: VarStore,
    generator: Generator,
    discriminator: Discriminator,
    patch_sampler: PatchSampler,
    opt_g: Adam,
    opt_d: Adam,
    opt_f: Adam,
}

impl CutStn {
    /// Build all three networks on `device` and capture their parameter
    /// lists. Both configs are validated up front.
    pub fn new(config: ModelConfig, opts: TrainOptions, device: Device) -> TrainResult<Self> {
        config.validate()?;
        opts.validate()?;

        let vs_g = VarStore::new(device);
        let vs_d = VarStore::new(device);
        let vs_f = VarStore::new(device);

        let generator = Generator::new(vs_g.root(), &config, &opts);
        let discriminator = Discriminator::new(vs_d.root(), &config, &opts);
        let patch_sampler = PatchSampler::new(vs_f.root(), &config);

        // Parameter order is captured once per store; each optimizer pairs
        // gradients with parameters by this order for its whole lifetime.
        let opt_g = Adam::new(vs_g.trainable_variables(), opts.lr, opts.beta_1, opts.beta_2);
        let opt_d = Adam::new(vs_d.trainable_variables(), opts.lr, opts.beta_1, opts.beta_2);
        let opt_f = Adam::new(vs_f.trainable_variables(), opts.lr, opts.beta_1, opts.beta_2);

        Ok(CutStn {
            config,
            opts,
            device,
            vs_g,
            vs_d,
            vs_f,
            generator,
            discriminator,
            patch_sampler,
            opt_g,
            opt_d,
            opt_f,
        })
    }

    /// Model hyperparameters.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Training options the model was built with.
    pub fn opts(&self) -> &TrainOptions {
        &self.opts
    }

    /// The device all three networks live on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// The generator network.
    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    /// Total trainable parameter count across the three networks.
    pub fn num_parameters(&self) -> i64 {
        [&self.opt_g, &self.opt_d, &self.opt_f]
            .iter()
            .flat_map(|opt| opt.params())
            .map(Tensor::numel)
            .map(|n| n as i64)
            .sum()
    }

    fn check_batch(&self, batch: &Tensor) -> TrainResult<()> {
        let size = batch.size();
        let s = self.opts.image_size;
        let ok = size.len() == 4
            && size[1] == self.opts.num_channels
            && size[2] == s
            && size[3] == s;
        if !ok {
            let b = size.first().copied().unwrap_or(0);
            return Err(TrainError::shape_mismatch(
                vec![b, self.opts.num_channels, s, s],
                size,
            ));
        }
        Ok(())
    }

    /// Forward, losses, and gradients for source and warped-feature pairs,
    /// shared by train and eval. Returns `(g_total, d_loss, nce, g_gan)`.
    fn compute_losses(
        &self,
        source: &Tensor,
        target: &Tensor,
        train: bool,
    ) -> TrainResult<(Tensor, Tensor, Tensor, Tensor)> {
        let fake = self.generator.forward_t(source, train);

        let real_scores = self.discriminator.forward_t(target, train);
        let fake_scores = self.discriminator.forward_t(&fake, train);
        let g_gan = generator_gan_loss(&fake_scores);
        let d_loss = discriminator_loss(&real_scores, &fake_scores);

        // Keys come from the source, queries from the translation, sampled
        // at identical spatial locations.
        let layers = &self.config.nce_layers;
        let source_feats = self.generator.encoder_features(source, layers, train);
        let (keys, ids) = self.patch_sampler.forward(&source_feats, None, train)?;
        let fake_feats = self.generator.encoder_features(&fake, layers, train);
        let (queries, _) = self.patch_sampler.forward(&fake_feats, Some(&ids), train)?;
        // The contrastive term stays unweighted. `lambda_nce` only enters
        // the generator objective; the projection head trains on, and the
        // metrics report, the raw InfoNCE mean.
        let nce = patch_nce_loss(&queries, &keys, self.config.tau)?;

        let g_total = &g_gan + &nce * self.config.lambda_nce;
        Ok((g_total, d_loss, nce, g_gan))
    }

    /// One optimization step over a `(source, target)` batch pair.
    ///
    /// Builds a single shared graph, differentiates it three times (once
    /// per network, against that network's parameters only), then applies
    /// the three Adam updates. Returns scalar metrics.
    pub fn train_step(
        &mut self,
        source: &Tensor,
        target: &Tensor,
    ) -> TrainResult<HashMap<String, f64>> {
        self.check_batch(source)?;
        self.check_batch(target)?;

        let (g_total, d_loss, nce, g_gan) = self.compute_losses(source, target, true)?;

        // Three backward passes over the one graph. The graph is kept alive
        // until the final pass releases it.
        let g_grads =
            Tensor::run_backward(&[g_total.shallow_clone()], self.opt_g.params(), true, false);
        let d_grads =
            Tensor::run_backward(&[d_loss.shallow_clone()], self.opt_d.params(), true, false);
        let f_grads =
            Tensor::run_backward(&[nce.shallow_clone()], self.opt_f.params(), false, false);

        self.opt_g.step(&g_grads)?;
        self.opt_d.step(&d_grads)?;
        self.opt_f.step(&f_grads)?;

        let mut metrics = HashMap::new();
        metrics.insert("g_loss".to_string(), g_gan.double_value(&[]));
        metrics.insert("g_total".to_string(), g_total.double_value(&[]));
        metrics.insert("d_loss".to_string(), d_loss.double_value(&[]));
        metrics.insert("nce".to_string(), nce.double_value(&[]));
        Ok(metrics)
    }

    /// Monitoring pass: the contrastive loss on a batch pair, without
    /// gradient tracking or parameter updates.
    pub fn eval_step(
        &self,
        source: &Tensor,
        target: &Tensor,
    ) -> TrainResult<HashMap<String, f64>> {
        self.check_batch(source)?;
        self.check_batch(target)?;

        tch::no_grad(|| {
            let (_g_total, _d_loss, nce, _g_gan) = self.compute_losses(source, target, false)?;
            let mut metrics = HashMap::new();
            metrics.insert("nce".to_string(), nce.double_value(&[]));
            Ok(metrics)
        })
    }

    /// Translate a source batch in inference mode.
    pub fn translate(&self, source: &Tensor) -> TrainResult<Tensor> {
        self.check_batch(source)?;
        Ok(tch::no_grad(|| self.generator.forward_t(source, false)))
    }

    /// Save all three networks' weights under `dir`.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> TrainResult<()> {
        let dir = dir.as_ref();
        for (vs, name) in [
            (&self.vs_g, GENERATOR_WEIGHTS),
            (&self.vs_d, DISCRIMINATOR_WEIGHTS),
            (&self.vs_f, PATCH_SAMPLER_WEIGHTS),
        ] {
            let path = dir.join(name);
            vs.save(&path)
                .map_err(|e| TrainError::checkpoint(e.to_string(), path))?;
        }
        Ok(())
    }

    /// Restore all three networks' weights from `dir`. The model must have
    /// been built with the same configuration as the saved one.
    pub fn load<P: AsRef<Path>>(&mut self, dir: P) -> TrainResult<()> {
        let dir = dir.as_ref();
        for (vs, name) in [
            (&mut self.vs_g, GENERATOR_WEIGHTS),
            (&mut self.vs_d, DISCRIMINATOR_WEIGHTS),
            (&mut self.vs_f, PATCH_SAMPLER_WEIGHTS),
        ] {
            let path = dir.join(name);
            vs.load(&path)
                .map_err(|e| TrainError::checkpoint(e.to_string(), path))?;
        }
        Ok(())
    }
}

impl SynthesisPreview for CutStn {
    fn preview(&self, source: &Tensor) -> TrainResult<Tensor> {
        self.translate(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn small_model() -> CutStn {
        let mut config = ModelConfig::default();
        config.base = 8;
        config.max_filters = 32;
        config.num_downsamples = 2;
        config.num_resblocks = 2;
        config.units = 16;
        config.num_patches = 32;
        config.nce_layers = vec![0, 1, 2];
        let mut opts = TrainOptions::default();
        opts.image_size = 32;
        opts.num_channels = 3;
        CutStn::new(config, opts, Device::Cpu).unwrap()
    }

    fn batch(b: i64) -> Tensor {
        Tensor::rand([b, 3, 32, 32], (Kind::Float, Device::Cpu)) * 2.0 - 1.0
    }

    #[test]
    fn train_step_returns_finite_metrics() {
        tch::manual_seed(7);
        let mut model = small_model();
        let metrics = model.train_step(&batch(2), &batch(2)).unwrap();
        for key in ["g_loss", "g_total", "d_loss", "nce"] {
            let value = metrics[key];
            assert!(value.is_finite(), "{key} = {value}");
        }
        // A fresh critic cannot separate real from fake.
        assert!(metrics["d_loss"] > 0.0);
        assert!(metrics["nce"] > 0.0);
    }

    #[test]
    fn train_step_updates_all_three_networks() {
        tch::manual_seed(11);
        let mut model = small_model();
        let before: Vec<Tensor> = [&model.opt_g, &model.opt_d, &model.opt_f]
            .iter()
            .map(|opt| opt.params()[0].copy())
            .collect();
        model.train_step(&batch(2), &batch(2)).unwrap();
        for (i, (opt, old)) in [&model.opt_g, &model.opt_d, &model.opt_f]
            .iter()
            .zip(&before)
            .enumerate()
        {
            let delta: f64 = (&opt.params()[0] - old).abs().max().double_value(&[]);
            assert!(delta > 0.0, "network {i} parameters did not move");
        }
    }

    #[test]
    fn eval_step_leaves_parameters_untouched() {
        tch::manual_seed(13);
        let model = small_model();
        let before = model.opt_g.params()[0].copy();
        model.eval_step(&batch(2), &batch(2)).unwrap();
        let delta: f64 = (&model.opt_g.params()[0] - before).abs().max().double_value(&[]);
        assert_eq!(delta, 0.0);
    }

    #[test]
    fn eval_nce_ignores_the_generator_weighting() {
        tch::manual_seed(23);
        let unweighted = small_model();
        tch::manual_seed(23);
        let mut weighted = small_model();
        weighted.config.lambda_nce = 10.0;

        tch::manual_seed(29);
        let source = batch(2);
        let target = batch(2);

        // Reseed before each pass so both draw the same patch indices.
        tch::manual_seed(31);
        let a = unweighted.eval_step(&source, &target).unwrap();
        tch::manual_seed(31);
        let b = weighted.eval_step(&source, &target).unwrap();
        assert!(
            (a["nce"] - b["nce"]).abs() < 1e-6,
            "reported nce depends on the weighting: {} vs {}",
            a["nce"],
            b["nce"]
        );
    }

    #[test]
    fn lambda_weights_only_the_generator_objective() {
        tch::manual_seed(37);
        let mut model = small_model();
        model.config.lambda_nce = 10.0;
        let metrics = model.train_step(&batch(2), &batch(2)).unwrap();
        let expected = metrics["g_loss"] + 10.0 * metrics["nce"];
        assert!(
            (metrics["g_total"] - expected).abs() < 1e-5,
            "g_total {} != g_loss {} + 10 * nce {}",
            metrics["g_total"],
            metrics["g_loss"],
            metrics["nce"]
        );
    }

    #[test]
    fn wrong_batch_shape_is_a_shape_mismatch() {
        let mut model = small_model();
        let bad = Tensor::rand([2, 3, 16, 16], (Kind::Float, Device::Cpu));
        match model.train_step(&bad, &batch(2)) {
            Err(TrainError::ShapeMismatch { .. }) => {}
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn save_then_load_restores_weights() {
        tch::manual_seed(17);
        let mut model = small_model();
        model.train_step(&batch(2), &batch(2)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        model.save(dir.path()).unwrap();

        tch::manual_seed(99);
        let mut restored = small_model();
        let differs: f64 = (&restored.opt_g.params()[0] - &model.opt_g.params()[0])
            .abs()
            .max()
            .double_value(&[]);
        assert!(differs > 0.0);

        restored.load(dir.path()).unwrap();
        let delta: f64 = (&restored.opt_g.params()[0] - &model.opt_g.params()[0])
            .abs()
            .max()
            .double_value(&[]);
        assert!(delta < 1e-7);
    }

    #[test]
    fn translate_matches_image_geometry() {
        tch::manual_seed(19);
        let model = small_model();
        let out = model.translate(&batch(3)).unwrap();
        assert_eq!(out.size(), [3, 3, 32, 32]);
    }
}
