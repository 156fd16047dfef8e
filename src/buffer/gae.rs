//! Advantage and return estimation
//!
//! Every environment column of a rollout is processed independently over the
//! time axis, backwards from the bootstrap row:
//!
//! ```text
//! delta_t = r_t + gamma * V_{t+1} * (1 - d_t) - V_t
//! A_t     = delta_t + gamma * lambda * (1 - d_t) * A_{t+1},   A_H = 0
//! R_t     = A_t + V_t
//! ```
//!
//! `V_{t+1}` for the last step is the bootstrap value of the rollout's final
//! observation. Because the pool auto-resets, `V_{t+1}` after a done step is
//! the value of a reset observation; the `(1 - d_t)` factor removes it.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{buffer::rollout::Rollout, error::TrainError};

/// How advantage and return targets are built from a rollout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnsEstimator {
    /// Generalized Advantage Estimation with `gae_lambda`
    #[default]
    Gae,

    /// Bootstrapped discounted return, advantage = return - value
    NStep,

    /// One-step TD error
    OneStep,
}

/// Per-(time, env) advantages and returns aligned with a rollout's actions
#[derive(Debug, Clone, PartialEq)]
pub struct AdvantageBuffer {
    /// Advantages: [H, num_envs]
    advantages: Vec<Vec<f32>>,

    /// Return targets: [H, num_envs]
    returns: Vec<Vec<f32>>,
}

impl AdvantageBuffer {
    /// Advantage rows
    pub fn advantages(&self) -> &[Vec<f32>] {
        &self.advantages
    }

    /// Return rows
    pub fn returns(&self) -> &[Vec<f32>] {
        &self.returns
    }

    /// Number of time steps
    pub fn len(&self) -> usize {
        self.advantages.len()
    }

    /// Check if the buffer holds no step
    pub fn is_empty(&self) -> bool {
        self.advantages.is_empty()
    }

    /// Advantages flattened time-major (sample `t * num_envs + i`)
    pub fn flat_advantages(&self) -> Vec<f32> {
        self.advantages.iter().flatten().copied().collect()
    }

    /// Returns flattened time-major (sample `t * num_envs + i`)
    pub fn flat_returns(&self) -> Vec<f32> {
        self.returns.iter().flatten().copied().collect()
    }
}

/// Turns rewards, values and done flags into advantage/return targets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdvantageEstimator {
    /// Discount factor
    pub gamma: f32,

    /// GAE trace decay
    pub gae_lambda: f32,

    /// Estimator family
    pub estimator: ReturnsEstimator,

    /// Normalize advantages across the whole (time x env) batch
    pub normalize: bool,

    /// Floor added to the standard deviation when normalizing
    pub epsilon: f32,
}

impl AdvantageEstimator {
    /// GAE estimator without normalization
    pub fn new(gamma: f32, gae_lambda: f32) -> Self {
        Self {
            gamma,
            gae_lambda,
            estimator: ReturnsEstimator::Gae,
            normalize: false,
            epsilon: 1e-8,
        }
    }

    /// Select the estimator family
    pub fn with_estimator(mut self, estimator: ReturnsEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Enable or disable advantage normalization
    pub fn with_normalization(mut self, normalize: bool, epsilon: f32) -> Self {
        self.normalize = normalize;
        self.epsilon = epsilon;
        self
    }

    /// Estimate advantages for a finished rollout using its recorded values
    pub fn estimate(&self, rollout: &Rollout) -> Result<AdvantageBuffer> {
        if !rollout.is_finished() {
            bail!("advantage estimation needs bootstrap values; call Rollout::finish first");
        }
        self.estimate_from(rollout.rewards(), rollout.values(), rollout.dones())
    }

    /// Estimate advantages from raw rows
    ///
    /// `values` must hold `rewards.len() + 1` rows, the last being the
    /// bootstrap values.
    pub fn estimate_from(
        &self,
        rewards: &[Vec<f32>],
        values: &[Vec<f32>],
        dones: &[Vec<bool>],
    ) -> Result<AdvantageBuffer> {
        let horizon = rewards.len();
        check_len("value rows", horizon + 1, values.len())?;
        check_len("done rows", horizon, dones.len())?;
        let num_envs = values.first().map_or(0, Vec::len);
        for t in 0..horizon {
            check_len("rewards per step", num_envs, rewards[t].len())?;
            check_len("dones per step", num_envs, dones[t].len())?;
            check_len("values per step", num_envs, values[t].len())?;
        }
        check_len("bootstrap values", num_envs, values[horizon].len())?;

        let mut advantages = vec![vec![0.0; num_envs]; horizon];
        let mut returns = vec![vec![0.0; num_envs]; horizon];

        let mut env_rewards = vec![0.0; horizon];
        let mut env_values = vec![0.0; horizon + 1];
        let mut env_dones = vec![false; horizon];
        for env_id in 0..num_envs {
            for t in 0..horizon {
                env_rewards[t] = rewards[t][env_id];
                env_dones[t] = dones[t][env_id];
                env_values[t] = values[t][env_id];
            }
            env_values[horizon] = values[horizon][env_id];

            let (env_adv, env_ret) = match self.estimator {
                ReturnsEstimator::Gae => compute_gae_single_env(
                    &env_rewards,
                    &env_values,
                    &env_dones,
                    self.gamma,
                    self.gae_lambda,
                ),
                ReturnsEstimator::NStep => {
                    compute_nstep_single_env(&env_rewards, &env_values, &env_dones, self.gamma)
                }
                ReturnsEstimator::OneStep => {
                    compute_gae_single_env(&env_rewards, &env_values, &env_dones, self.gamma, 0.0)
                }
            };

            for t in 0..horizon {
                advantages[t][env_id] = env_adv[t];
                returns[t][env_id] = env_ret[t];
            }
        }

        if self.normalize {
            normalize_advantages(&mut advantages, self.epsilon);
        }

        Ok(AdvantageBuffer { advantages, returns })
    }
}

/// Compute GAE for a single environment
///
/// `values` has one more entry than `rewards` (the bootstrap value).
fn compute_gae_single_env(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    gamma: f32,
    gae_lambda: f32,
) -> (Vec<f32>, Vec<f32>) {
    let horizon = rewards.len();
    let mut advantages = vec![0.0; horizon];
    let mut returns = vec![0.0; horizon];
    let mut last_gae = 0.0;

    // Iterate backwards through the trajectory
    for t in (0..horizon).rev() {
        let not_done = if dones[t] { 0.0 } else { 1.0 };
        let delta = rewards[t] + gamma * values[t + 1] * not_done - values[t];
        last_gae = delta + gamma * gae_lambda * not_done * last_gae;
        advantages[t] = last_gae;
        returns[t] = last_gae + values[t];
    }

    (advantages, returns)
}

/// Bootstrapped discounted returns for a single environment
fn compute_nstep_single_env(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    gamma: f32,
) -> (Vec<f32>, Vec<f32>) {
    let horizon = rewards.len();
    let mut advantages = vec![0.0; horizon];
    let mut returns = vec![0.0; horizon];
    let mut running = values[horizon];

    for t in (0..horizon).rev() {
        let not_done = if dones[t] { 0.0 } else { 1.0 };
        running = rewards[t] + gamma * not_done * running;
        returns[t] = running;
        advantages[t] = running - values[t];
    }

    (advantages, returns)
}

/// Normalize advantages in place across every (time, env) entry
///
/// Uses `(x - mean) / (std + epsilon)` with the population standard deviation.
pub fn normalize_advantages(advantages: &mut [Vec<f32>], epsilon: f32) {
    let count = advantages.iter().map(Vec::len).sum::<usize>();
    if count == 0 {
        return;
    }

    let mean = advantages.iter().flatten().map(|&a| a as f64).sum::<f64>() / count as f64;
    let var = advantages
        .iter()
        .flatten()
        .map(|&a| (a as f64 - mean).powi(2))
        .sum::<f64>()
        / count as f64;
    let std = var.sqrt();
    if std < epsilon as f64 {
        warn!(std, "advantage batch has near-zero spread; normalization only centers it");
    }

    let denom = std + epsilon as f64;
    for row in advantages.iter_mut() {
        for a in row.iter_mut() {
            *a = ((*a as f64 - mean) / denom) as f32;
        }
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(TrainError::ShapeMismatch { what, expected, actual }.into());
    }
    Ok(())
}
