//! Adam optimizer over an explicit parameter list.
//!
//! Gradients are passed in rather than read from autograd buffers, so one
//! backward graph can feed several optimizers without any cross-network
//! gradient accumulation. Each optimizer owns shallow clones of the
//! variables it updates; ordering is fixed at construction and must match
//! the gradient list handed to [`Adam::step`].

use tch::Tensor;

use crate::error::{TrainError, TrainResult};

/// Adam with bias correction, no weight decay.
#[derive(Debug)]
pub struct Adam {
    params: Vec<Tensor>,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step_count: i64,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
}

impl Adam {
    /// Take ownership of the parameter list to update. Moment buffers are
    /// allocated lazily on the first step.
    pub fn new(params: Vec<Tensor>, lr: f64, beta1: f64, beta2: f64) -> Self {
        Adam {
            params,
            lr,
            beta1,
            beta2,
            eps: 1e-8,
            step_count: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// The tracked parameters, in update order. This is the order gradients
    /// must be supplied in, and the tensor list to differentiate against.
    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    /// Apply one update from `grads`, which must align one-to-one with
    /// [`Adam::params`].
    pub fn step(&mut self, grads: &[Tensor]) -> TrainResult<()> {
        if grads.len() != self.params.len() {
            return Err(TrainError::training_step(format!(
                "optimizer holds {} parameters but received {} gradients",
                self.params.len(),
                grads.len()
            )));
        }
        if self.m.is_empty() {
            self.m = self.params.iter().map(|p| Tensor::zeros_like(p)).collect();
            self.v = self.params.iter().map(|p| Tensor::zeros_like(p)).collect();
        }

        self.step_count += 1;
        let bc1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let bc2 = 1.0 - self.beta2.powi(self.step_count as i32);

        tch::no_grad(|| {
            for i in 0..self.params.len() {
                let g = &grads[i];
                self.m[i] *= self.beta1;
                self.m[i] += g * (1.0 - self.beta1);
                self.v[i] *= self.beta2;
                self.v[i] += g.square() * (1.0 - self.beta2);

                let m_hat = &self.m[i] / bc1;
                let v_hat = &self.v[i] / bc2;
                self.params[i] -= m_hat * self.lr / (v_hat.sqrt() + self.eps);
            }
        });
        Ok(())
    }
}
