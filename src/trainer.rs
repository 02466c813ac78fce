//! Epoch-level training driver.
//!
//! Owns the model and iterates a dataset for the configured number of
//! epochs: shuffle, step over every batch, log mean losses, write a
//! checkpoint, and render a handful of preview translations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tch::{Kind, Tensor};
use tracing::{debug, info};

use crate::dataset::{DataLoader, ImageDataset, ImagePair};
use crate::error::{TrainError, TrainResult};
use crate::model::{CutStn, SynthesisPreview};

/// Outcome of a completed [`Trainer::run`].
#[derive(Debug)]
pub struct TrainingSummary {
    /// Number of epochs completed.
    pub epochs: usize,
    /// Total number of optimization steps taken.
    pub steps: usize,
    /// Mean metrics of the final epoch.
    pub final_metrics: HashMap<String, f64>,
}

/// Runs the training loop for a [`CutStn`] model.
pub struct Trainer<'a, D: ImageDataset> {
    model: CutStn,
    dataset: &'a D,
}

impl<'a, D: ImageDataset> Trainer<'a, D> {
    /// Take ownership of the model and borrow the dataset for the run.
    pub fn new(model: CutStn, dataset: &'a D) -> Self {
        Trainer { model, dataset }
    }

    /// The model being trained.
    pub fn model(&self) -> &CutStn {
        &self.model
    }

    /// Train for `num_epochs` epochs. Checkpoints and previews are written
    /// under the directories named in the model's training options.
    pub fn run(&mut self) -> TrainResult<TrainingSummary> {
        let opts = self.model.opts().clone();
        tch::manual_seed(opts.seed as i64);

        create_dir(&opts.ckpt_dir)?;
        create_dir(&opts.output_dir)?;

        let mut loader =
            DataLoader::new(self.dataset, opts.batch_size, self.model.device(), opts.seed)?;
        info!(
            dataset = self.dataset.name(),
            samples = self.dataset.len(),
            batches = loader.num_batches(),
            parameters = self.model.num_parameters(),
            "starting training"
        );

        let mut steps = 0;
        let mut final_metrics = HashMap::new();
        for epoch in 1..=opts.num_epochs {
            loader.shuffle();
            let mut sums: HashMap<String, f64> = HashMap::new();
            let mut batches = 0usize;
            for batch in &mut loader {
                let (source, target) = batch?;
                let metrics = self.model.train_step(&source, &target)?;
                for (k, v) in &metrics {
                    *sums.entry(k.clone()).or_default() += v;
                }
                batches += 1;
                steps += 1;
                debug!(
                    epoch,
                    step = batches,
                    g_loss = metrics["g_loss"],
                    d_loss = metrics["d_loss"],
                    nce = metrics["nce"],
                    "train step"
                );
            }

            let means: HashMap<String, f64> =
                sums.into_iter().map(|(k, v)| (k, v / batches as f64)).collect();
            info!(
                epoch,
                g_loss = means["g_loss"],
                d_loss = means["d_loss"],
                nce = means["nce"],
                "epoch complete"
            );

            let (eval_source, eval_target) = self.monitor_batch(opts.num_samples)?;
            let eval = self.model.eval_step(&eval_source, &eval_target)?;
            info!(epoch, nce = eval["nce"], "eval");

            let ckpt = opts.ckpt_dir.join(format!("epoch_{epoch:03}"));
            create_dir(&ckpt)?;
            self.model.save(&ckpt)?;
            self.save_previews(epoch, &opts.output_dir, &eval_source)?;
            final_metrics = means;
        }

        Ok(TrainingSummary { epochs: opts.num_epochs, steps, final_metrics })
    }

    /// Collate the first `count` dataset samples into a fixed monitoring
    /// batch, used for both the per-epoch eval pass and the previews.
    fn monitor_batch(&self, count: usize) -> TrainResult<(Tensor, Tensor)> {
        let count = count.min(self.dataset.len());
        let pairs: Vec<ImagePair> = (0..count)
            .map(|i| self.dataset.get(i))
            .collect::<Result<_, _>>()?;

        let (c, h, w) = pairs[0].source.dim();
        let dims = [count as i64, c as i64, h as i64, w as i64];
        let mut sources = Vec::with_capacity(count * c * h * w);
        let mut targets = Vec::with_capacity(sources.capacity());
        for pair in &pairs {
            sources.extend(pair.source.iter().copied());
            targets.extend(pair.target.iter().copied());
        }
        let device = self.model.device();
        Ok((
            Tensor::from_slice(&sources).reshape(dims).to_device(device),
            Tensor::from_slice(&targets).reshape(dims).to_device(device),
        ))
    }

    /// Translate the monitoring batch and write each sample as a PNG.
    fn save_previews(&self, epoch: usize, dir: &Path, source: &Tensor) -> TrainResult<()> {
        let translated = self.model.preview(source)?;
        for i in 0..translated.size()[0] {
            let path = dir.join(format!("epoch_{epoch:03}_sample_{i}.png"));
            let image = ((translated.get(i) + 1.0) * 127.5)
                .clamp(0.0, 255.0)
                .to_kind(Kind::Uint8);
            tch::vision::image::save(&image, &path)
                .map_err(|e| TrainError::checkpoint(e.to_string(), &path))?;
        }
        Ok(())
    }
}

fn create_dir(path: &Path) -> TrainResult<()> {
    fs::create_dir_all(path)
        .map_err(|e| TrainError::checkpoint(e.to_string(), PathBuf::from(path)))
}
