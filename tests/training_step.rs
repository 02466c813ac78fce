//! Integration tests for the end-to-end training step.
//!
//! All tests run on a reduced model (32px images, narrow channels) so a
//! full step stays cheap on CPU. Randomness is pinned with
//! `tch::manual_seed`; tests that write files use [`tempfile::TempDir`].

use tch::{Device, Kind, Tensor};

use cutstn_train::config::{ModelConfig, TrainOptions};
use cutstn_train::dataset::SyntheticImageDataset;
use cutstn_train::localizer::IDENTITY_THETA;
use cutstn_train::model::CutStn;
use cutstn_train::trainer::Trainer;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn small_config() -> ModelConfig {
    let mut config = ModelConfig::default();
    config.base = 8;
    config.max_filters = 32;
    config.num_downsamples = 2;
    config.num_resblocks = 2;
    config.units = 16;
    config.num_patches = 32;
    config.nce_layers = vec![0, 1, 2];
    config
}

fn small_opts() -> TrainOptions {
    let mut opts = TrainOptions::default();
    opts.image_size = 32;
    opts.num_channels = 3;
    opts.batch_size = 2;
    opts
}

fn image_batch(b: i64, seed: i64) -> Tensor {
    tch::manual_seed(seed);
    Tensor::rand([b, 3, 32, 32], (Kind::Float, Device::Cpu)) * 2.0 - 1.0
}

// ---------------------------------------------------------------------------
// Training-step behaviour
// ---------------------------------------------------------------------------

/// A fresh model's first step must produce finite, positive losses: the
/// critic cannot yet separate domains and the contrastive logits start near
/// uniform.
#[test]
fn first_step_losses_are_finite_and_positive() {
    tch::manual_seed(1);
    let mut model = CutStn::new(small_config(), small_opts(), Device::Cpu).unwrap();
    let metrics = model
        .train_step(&image_batch(2, 2), &image_batch(2, 3))
        .unwrap();
    for key in ["g_loss", "g_total", "d_loss", "nce"] {
        assert!(metrics[key].is_finite(), "{key} = {}", metrics[key]);
        assert!(metrics[key] > 0.0, "{key} should be positive at init");
    }
}

/// All-zero 64px batches are the degenerate extreme: instance statistics
/// collapse and the contrastive embeddings lean on the epsilon guard. The
/// step must still return finite scalars and move parameters.
#[test]
fn zero_images_produce_finite_losses_and_an_update() {
    tch::manual_seed(4);
    let mut opts = small_opts();
    opts.image_size = 64;
    let mut model = CutStn::new(small_config(), opts, Device::Cpu).unwrap();

    let zeros = Tensor::zeros([2, 3, 64, 64], (Kind::Float, Device::Cpu));
    let first = model.train_step(&zeros, &zeros).unwrap();
    for key in ["g_loss", "d_loss", "nce"] {
        assert!(first[key].is_finite(), "{key} = {}", first[key]);
    }
    // A second step on the same input sees the first update's effect.
    let second = model.train_step(&zeros, &zeros).unwrap();
    assert!(
        (first["d_loss"] - second["d_loss"]).abs() > 0.0,
        "parameters should have moved between steps"
    );
}

/// Repeated steps on a fixed batch must drive the critic loss down: the
/// critic is learning against a slowly-moving generator.
#[test]
fn critic_improves_on_a_fixed_batch() {
    tch::manual_seed(5);
    let mut opts = small_opts();
    opts.lr = 1e-3;
    let mut model = CutStn::new(small_config(), opts, Device::Cpu).unwrap();
    let source = image_batch(2, 6);
    let target = image_batch(2, 7);

    let first = model.train_step(&source, &target).unwrap()["d_loss"];
    let mut last = first;
    for _ in 0..10 {
        last = model.train_step(&source, &target).unwrap()["d_loss"];
    }
    assert!(
        last < first,
        "critic loss should fall on a fixed batch: {first} -> {last}"
    );
}

/// The warp must start as a no-op: before any update the localizer predicts
/// the identity transform for every input.
#[test]
fn warp_starts_at_identity() {
    tch::manual_seed(9);
    let model = CutStn::new(small_config(), small_opts(), Device::Cpu).unwrap();
    let (_, theta) = model.generator().stn().warp(&image_batch(2, 10), false);
    let identity = Tensor::from_slice(&IDENTITY_THETA)
        .reshape([1, 2, 3])
        .expand([2, 2, 3], true);
    let err: f64 = (&theta - identity).abs().max().double_value(&[]);
    assert!(err < 1e-6, "initial warp deviates from identity by {err}");
}

/// Identical seeds must give identical first-step metrics; patch index
/// sampling and parameter draws are the only randomness in a step.
#[test]
fn training_is_deterministic_under_a_seed() {
    let run = || {
        tch::manual_seed(21);
        let mut model = CutStn::new(small_config(), small_opts(), Device::Cpu).unwrap();
        model
            .train_step(&image_batch(2, 22), &image_batch(2, 23))
            .unwrap()
    };
    let a = run();
    let b = run();
    for key in ["g_loss", "d_loss", "nce"] {
        assert!(
            (a[key] - b[key]).abs() < 1e-9,
            "{key} differs between seeded runs: {} vs {}",
            a[key],
            b[key]
        );
    }
}

/// Mismatched image geometry must surface as a shape error, not a panic.
#[test]
fn wrong_image_size_is_rejected() {
    let mut model = CutStn::new(small_config(), small_opts(), Device::Cpu).unwrap();
    let bad = Tensor::zeros([2, 3, 48, 48], (Kind::Float, Device::Cpu));
    assert!(model.train_step(&bad, &image_batch(2, 30)).is_err());
}

// ---------------------------------------------------------------------------
// Full pipeline
// ---------------------------------------------------------------------------

/// Two epochs over the synthetic dataset must complete, checkpoint each
/// epoch, and render previews.
#[test]
fn two_epoch_synthetic_run_completes() {
    let ckpt = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();

    let mut opts = small_opts();
    opts.num_epochs = 2;
    opts.num_samples = 1;
    opts.ckpt_dir = ckpt.path().to_path_buf();
    opts.output_dir = out.path().to_path_buf();

    let model = CutStn::new(small_config(), opts, Device::Cpu).unwrap();
    let dataset = SyntheticImageDataset::new(4, 32, 3);
    let mut trainer = Trainer::new(model, &dataset);

    let summary = trainer.run().unwrap();
    assert_eq!(summary.epochs, 2);
    assert_eq!(summary.steps, 4);
    assert!(summary.final_metrics["g_loss"].is_finite());

    for epoch in 1..=2 {
        let dir = ckpt.path().join(format!("epoch_{epoch:03}"));
        assert!(dir.join("generator.ot").exists());
        assert!(dir.join("discriminator.ot").exists());
        assert!(dir.join("patch_sampler.ot").exists());
        assert!(out
            .path()
            .join(format!("epoch_{epoch:03}_sample_0.png"))
            .exists());
    }
}

/// Checkpoints must round-trip: a freshly built model that loads saved
/// weights reports the same eval metrics as the model that saved them.
#[test]
fn checkpoint_round_trip_preserves_eval_metrics() {
    tch::manual_seed(41);
    let mut model = CutStn::new(small_config(), small_opts(), Device::Cpu).unwrap();
    let source = image_batch(2, 42);
    let target = image_batch(2, 43);
    model.train_step(&source, &target).unwrap();

    let dir = tempfile::tempdir().unwrap();
    model.save(dir.path()).unwrap();

    tch::manual_seed(44);
    let mut restored = CutStn::new(small_config(), small_opts(), Device::Cpu).unwrap();
    restored.load(dir.path()).unwrap();

    // Pin patch sampling so both models draw the same indices.
    tch::manual_seed(45);
    let a = model.eval_step(&source, &target).unwrap();
    tch::manual_seed(45);
    let b = restored.eval_step(&source, &target).unwrap();
    assert!(
        (a["nce"] - b["nce"]).abs() < 1e-6,
        "nce differs after checkpoint restore: {} vs {}",
        a["nce"],
        b["nce"]
    );
}
