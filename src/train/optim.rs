//! Adam optimizer with checkpointable state
//!
//! Same update rule as `torch.optim.Adam` (no weight decay, no amsgrad), but
//! the first/second moment tensors and the step count are owned here so they
//! can be written into and restored from a checkpoint.

use anyhow::Result;
use tch::{Kind, Tensor, nn};

use crate::error::TrainError;

/// Adam over every trainable variable of a [`nn::VarStore`]
#[derive(Debug)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step_count: u64,
    /// Trainable variables sorted by name (shallow clones sharing storage)
    params: Vec<(String, Tensor)>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
}

impl Adam {
    /// Create an optimizer for the trainable variables of `vs`
    pub fn new(vs: &nn::VarStore, learning_rate: f64) -> Self {
        Self::with_betas(vs, learning_rate, 0.9, 0.999, 1e-8)
    }

    /// Create an optimizer with explicit moment decay rates
    pub fn with_betas(vs: &nn::VarStore, learning_rate: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        let mut params: Vec<(String, Tensor)> =
            vs.variables().into_iter().filter(|(_, t)| t.requires_grad()).collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let exp_avg = params.iter().map(|(_, p)| p.zeros_like()).collect();
        let exp_avg_sq = params.iter().map(|(_, p)| p.zeros_like()).collect();

        Self { learning_rate, beta1, beta2, eps, step_count: 0, params, exp_avg, exp_avg_sq }
    }

    /// Clear the gradients of every parameter
    pub fn zero_grad(&mut self) {
        for (_, p) in self.params.iter_mut() {
            p.zero_grad();
        }
    }

    /// Rescale gradients so their global L2 norm is at most `max_norm`
    ///
    /// Returns the norm before clipping. A non-finite norm leaves the
    /// gradients untouched.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        let norm = tch::no_grad(|| {
            let mut total = 0.0f64;
            for (_, p) in &self.params {
                let grad = p.grad();
                if grad.defined() {
                    total += f64::try_from(&grad.square().sum(Kind::Double)).unwrap_or(f64::NAN);
                }
            }
            total.sqrt()
        });

        if norm.is_finite() && norm > max_norm {
            let coef = max_norm / (norm + 1e-6);
            tch::no_grad(|| {
                for (_, p) in &self.params {
                    let mut grad = p.grad();
                    if grad.defined() {
                        grad *= coef;
                    }
                }
            });
        }
        norm
    }

    /// Apply one Adam update to every parameter with a gradient
    pub fn step(&mut self) {
        self.step_count += 1;
        let bias_correction1 = 1.0 - self.beta1.powf(self.step_count as f64);
        let bias_correction2 = 1.0 - self.beta2.powf(self.step_count as f64);
        let step_size = self.learning_rate / bias_correction1;

        tch::no_grad(|| {
            for (((_, p), m), v) in
                self.params.iter_mut().zip(self.exp_avg.iter_mut()).zip(self.exp_avg_sq.iter_mut())
            {
                let grad = p.grad();
                if !grad.defined() {
                    continue;
                }
                *m *= self.beta1;
                *m += &grad * (1.0 - self.beta1);
                *v *= self.beta2;
                *v += grad.square() * (1.0 - self.beta2);

                let denom = (&*v / bias_correction2).sqrt() + self.eps;
                *p -= &*m / denom * step_size;
            }
        });
    }

    /// Number of updates applied so far
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Change the learning rate
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Moment tensors keyed `exp_avg.<var>` / `exp_avg_sq.<var>`
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::with_capacity(2 * self.params.len());
        for (((name, _), m), v) in self.params.iter().zip(&self.exp_avg).zip(&self.exp_avg_sq) {
            out.push((format!("exp_avg.{name}"), m.detach().copy()));
            out.push((format!("exp_avg_sq.{name}"), v.detach().copy()));
        }
        out
    }

    /// Restore moments and step count written by [`Adam::state_tensors`]
    ///
    /// Every moment must be present with the shape of its variable.
    pub fn load_state(&mut self, named: Vec<(String, Tensor)>, step_count: u64) -> Result<()> {
        let lookup: std::collections::HashMap<String, Tensor> = named.into_iter().collect();

        let mut exp_avg = Vec::with_capacity(self.params.len());
        let mut exp_avg_sq = Vec::with_capacity(self.params.len());
        for (name, p) in &self.params {
            for (prefix, out) in [("exp_avg", &mut exp_avg), ("exp_avg_sq", &mut exp_avg_sq)] {
                let key = format!("{prefix}.{name}");
                let Some(t) = lookup.get(&key) else {
                    return Err(TrainError::CheckpointMismatch {
                        name: key,
                        expected: format!("{:?}", p.size()),
                        actual: "missing".to_string(),
                    }
                    .into());
                };
                if t.size() != p.size() {
                    return Err(TrainError::CheckpointMismatch {
                        name: key,
                        expected: format!("{:?}", p.size()),
                        actual: format!("{:?}", t.size()),
                    }
                    .into());
                }
                out.push(t.to_device(p.device()).to_kind(p.kind()));
            }
        }

        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.step_count = step_count;
        Ok(())
    }
}
