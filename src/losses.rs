//! Adversarial and contrastive loss terms.
//!
//! The adversarial objective is the least-squares variant: the critic
//! regresses real patches towards 1 and synthetic patches towards 0, and
//! the generator pushes its outputs' scores towards 1. The contrastive
//! term is a patch-wise InfoNCE over embedded feature pairs.

use tch::{Kind, Reduction, Tensor};

use crate::error::{TrainError, TrainResult};

/// Critic loss over patch score maps: mean of the real and fake
/// least-squares terms.
pub fn discriminator_loss(real_scores: &Tensor, fake_scores: &Tensor) -> Tensor {
    let real = real_scores.mse_loss(&Tensor::ones_like(real_scores), Reduction::Mean);
    let fake = fake_scores.mse_loss(&Tensor::zeros_like(fake_scores), Reduction::Mean);
    (real + fake) * 0.5
}

/// Generator-side adversarial loss: synthetic scores regressed towards 1.
pub fn generator_gan_loss(fake_scores: &Tensor) -> Tensor {
    fake_scores.mse_loss(&Tensor::ones_like(fake_scores), Reduction::Mean)
}

/// Patch-wise InfoNCE averaged over depths.
///
/// `queries[d]` and `keys[d]` are `[N, units]` unit-norm embeddings sampled
/// at the same spatial locations of the translated and source views. For
/// each depth the `[N, N]` similarity matrix `q · kᵀ / tau` is scored with
/// a cross entropy whose targets are the diagonal: each query's only
/// positive is the key from its own location.
pub fn patch_nce_loss(queries: &[Tensor], keys: &[Tensor], tau: f64) -> TrainResult<Tensor> {
    if queries.len() != keys.len() || queries.is_empty() {
        return Err(TrainError::training_step(format!(
            "contrastive depth mismatch: {} query sets vs {} key sets",
            queries.len(),
            keys.len()
        )));
    }

    let mut total = Tensor::zeros([], (Kind::Float, queries[0].device()));
    for (q, k) in queries.iter().zip(keys) {
        if q.size() != k.size() {
            return Err(TrainError::shape_mismatch(q.size(), k.size()));
        }
        let n = q.size()[0];
        let logits = q.matmul(&k.transpose(0, 1)) / tau;
        let labels = Tensor::arange(n, (Kind::Int64, q.device()));
        total += logits.cross_entropy_loss::<Tensor>(&labels, None, Reduction::Mean, -100, 0.0);
    }
    Ok(total / queries.len() as f64)
}
