//! `train` binary — entry point for the translation training pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin train -- --source-dir data/horses --target-dir data/zebras
//! cargo run --bin train -- --config model.json --dry-run
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use cutstn_train::config::{ModelConfig, TrainOptions};
use cutstn_train::dataset::{FolderDataset, ImageDataset, SyntheticImageDataset};
use cutstn_train::model::CutStn;
use cutstn_train::trainer::Trainer;

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    version,
    about = "Contrastive unpaired translation training pipeline",
    long_about = None
)]
struct Args {
    /// Path to a JSON model configuration file.
    ///
    /// If not provided, the default `ModelConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory of source-domain images.
    #[arg(long, value_name = "DIR")]
    source_dir: Option<PathBuf>,

    /// Directory of target-domain images.
    #[arg(long, value_name = "DIR")]
    target_dir: Option<PathBuf>,

    /// Override the checkpoint directory.
    #[arg(long, value_name = "DIR")]
    ckpt_dir: Option<PathBuf>,

    /// Override the preview output directory.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Square image side length.
    #[arg(long, default_value_t = 256)]
    image_size: i64,

    /// Mini-batch size.
    #[arg(long, default_value_t = 3)]
    batch_size: usize,

    /// Number of training epochs.
    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Adam learning rate for all three optimizers.
    #[arg(long, default_value_t = 1e-4)]
    lr: f64,

    /// Global random seed.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Enable CUDA training when a GPU is available.
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Use the deterministic synthetic dataset instead of image folders.
    ///
    /// This is intended for pipeline smoke-tests only, not real training.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Number of synthetic samples when `--dry-run` is active.
    #[arg(long, default_value_t = 64)]
    dry_run_samples: usize,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("CUT-STN training pipeline v{}", cutstn_train::VERSION);

    let config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading model configuration from {}", path.display());
            match ModelConfig::from_json(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    error!("Failed to load configuration: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            info!("No configuration file provided — using defaults");
            ModelConfig::default()
        }
    };

    let mut opts = TrainOptions::default();
    opts.image_size = args.image_size;
    opts.batch_size = args.batch_size;
    opts.num_epochs = args.epochs;
    opts.lr = args.lr;
    opts.seed = args.seed;
    opts.use_gpu = args.cuda;
    if let Some(dir) = args.ckpt_dir {
        opts.ckpt_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        opts.output_dir = dir;
    }

    if let Err(e) = config.validate().and_then(|_| opts.validate()) {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }

    info!("Configuration validated");
    info!("  image size   : {}", opts.image_size);
    info!("  batch size   : {}", opts.batch_size);
    info!("  learning rate: {}", opts.lr);
    info!("  epochs       : {}", opts.num_epochs);
    info!("  nce layers   : {:?}", config.nce_layers);
    info!("  device       : {}", if opts.use_gpu { "GPU" } else { "CPU" });

    let device = if opts.use_gpu {
        tch::Device::cuda_if_available()
    } else {
        tch::Device::Cpu
    };

    if args.dry_run {
        info!(
            "DRY RUN — using synthetic dataset ({} samples)",
            args.dry_run_samples
        );
        let dataset =
            SyntheticImageDataset::new(args.dry_run_samples, opts.image_size, opts.num_channels);
        run_trainer(config, opts, device, &dataset);
    } else {
        let (source_dir, target_dir) = match (args.source_dir, args.target_dir) {
            (Some(s), Some(t)) => (s, t),
            _ => {
                error!("--source-dir and --target-dir are required unless --dry-run is set");
                std::process::exit(1);
            }
        };
        let dataset = match FolderDataset::discover(&source_dir, &target_dir, opts.image_size) {
            Ok(ds) => ds,
            Err(e) => {
                error!("Failed to load dataset: {e}");
                std::process::exit(1);
            }
        };
        info!("Folder dataset: {} samples", dataset.len());
        run_trainer(config, opts, device, &dataset);
    }
}

/// Run the training loop with the provided config and dataset.
fn run_trainer<D: ImageDataset>(
    config: ModelConfig,
    opts: TrainOptions,
    device: tch::Device,
    dataset: &D,
) {
    let model = match CutStn::new(config, opts, device) {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to build model: {e}");
            std::process::exit(1);
        }
    };
    info!("Model built: {} trainable parameters", model.num_parameters());

    let mut trainer = Trainer::new(model, dataset);
    match trainer.run() {
        Ok(summary) => {
            info!(
                "Training complete: {} epochs, {} steps, final g_loss {:.4}",
                summary.epochs,
                summary.steps,
                summary.final_metrics.get("g_loss").copied().unwrap_or(f64::NAN)
            );
        }
        Err(e) => {
            error!("Training failed: {e}");
            std::process::exit(1);
        }
    }
}
