//! Rollout storage for on-policy training
//!
//! A [`Rollout`] is the fixed-horizon record of one collection pass across
//! all environments of a pool, kept time-major:
//! - `observations`: `[H + 1][num_envs][obs_dim]` (the last row is the
//!   bootstrap observation)
//! - `actions`, `rewards`, `dones`, `log_probs`: `[H][num_envs]`
//! - `values`: `[H + 1][num_envs]` once the rollout is finished
//!
//! `actions[t]`, `rewards[t]` and `dones[t]` always describe the transition
//! taken from `observations[t]`. Rows are append-only; nothing already
//! recorded is rewritten.

use anyhow::{Result, bail};
use tch::{Device, Tensor};

use crate::{
    env::{Action, ActionBatch},
    error::TrainError,
};

/// One environment's one-step record, borrowed from a [`Rollout`]
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<'a> {
    /// Observation the action was taken from
    pub observation: &'a [f32],
    /// Action taken
    pub action: Action,
    /// Reward received (after shaping/normalization)
    pub reward: f32,
    /// Whether the transition ended the episode
    pub done: bool,
    /// Log-probability of the action under the acting snapshot
    pub log_prob: f32,
    /// Value estimate of `observation` under the acting snapshot
    pub value: f32,
}

/// Time-major rollout across `num_envs` environments
#[derive(Debug, Clone)]
pub struct Rollout {
    /// Number of parallel environments
    num_envs: usize,

    /// Observation dimensionality
    obs_dim: usize,

    /// Observations: [H + 1, num_envs, obs_dim]
    observations: Vec<Vec<Vec<f32>>>,

    /// Actions: [H] batches of num_envs
    actions: Vec<ActionBatch>,

    /// Rewards: [H, num_envs]
    rewards: Vec<Vec<f32>>,

    /// Episode end flags: [H, num_envs]
    dones: Vec<Vec<bool>>,

    /// Log probabilities: [H, num_envs]
    log_probs: Vec<Vec<f32>>,

    /// Value estimates: [H + 1, num_envs] after `finish`
    values: Vec<Vec<f32>>,

    /// Whether bootstrap values have been recorded
    finished: bool,
}

impl Rollout {
    /// Start a rollout from the first observation batch
    pub fn new(initial_observations: Vec<Vec<f32>>) -> Result<Self> {
        let num_envs = initial_observations.len();
        if num_envs == 0 {
            bail!("rollout needs at least one environment");
        }
        let obs_dim = initial_observations[0].len();
        check_observations(&initial_observations, num_envs, obs_dim)?;

        Ok(Self {
            num_envs,
            obs_dim,
            observations: vec![initial_observations],
            actions: Vec::new(),
            rewards: Vec::new(),
            dones: Vec::new(),
            log_probs: Vec::new(),
            values: Vec::new(),
            finished: false,
        })
    }

    /// Append one time step
    ///
    /// `log_probs` and `values` belong to the current (last) observation row,
    /// `next_observations` becomes the new last row.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        actions: ActionBatch,
        log_probs: Vec<f32>,
        values: Vec<f32>,
        rewards: Vec<f32>,
        dones: Vec<bool>,
        next_observations: Vec<Vec<f32>>,
    ) -> Result<()> {
        if self.finished {
            bail!("cannot append to a finished rollout");
        }
        let n = self.num_envs;
        check_len("actions", n, actions.len())?;
        check_len("log_probs", n, log_probs.len())?;
        check_len("values", n, values.len())?;
        check_len("rewards", n, rewards.len())?;
        check_len("dones", n, dones.len())?;
        check_observations(&next_observations, n, self.obs_dim)?;

        self.actions.push(actions);
        self.log_probs.push(log_probs);
        self.values.push(values);
        self.rewards.push(rewards);
        self.dones.push(dones);
        self.observations.push(next_observations);
        Ok(())
    }

    /// Record value estimates of the bootstrap observation and seal the rollout
    pub fn finish(&mut self, bootstrap_values: Vec<f32>) -> Result<()> {
        if self.finished {
            bail!("rollout already finished");
        }
        check_len("bootstrap values", self.num_envs, bootstrap_values.len())?;
        self.values.push(bootstrap_values);
        self.finished = true;
        Ok(())
    }

    /// Number of recorded time steps (H)
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Check if no step has been recorded
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Whether bootstrap values have been recorded
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of parallel environments
    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    /// Observation dimensionality
    pub fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    /// Total number of transitions (H * num_envs)
    pub fn num_samples(&self) -> usize {
        self.len() * self.num_envs
    }

    /// Observation rows, `H + 1` of them
    pub fn observations(&self) -> &[Vec<Vec<f32>>] {
        &self.observations
    }

    /// Action rows
    pub fn actions(&self) -> &[ActionBatch] {
        &self.actions
    }

    /// Reward rows
    pub fn rewards(&self) -> &[Vec<f32>] {
        &self.rewards
    }

    /// Done rows
    pub fn dones(&self) -> &[Vec<bool>] {
        &self.dones
    }

    /// Log-probability rows
    pub fn log_probs(&self) -> &[Vec<f32>] {
        &self.log_probs
    }

    /// Value rows (`H + 1` once finished)
    pub fn values(&self) -> &[Vec<f32>] {
        &self.values
    }

    /// The bootstrap observation batch
    pub fn last_observations(&self) -> &[Vec<f32>] {
        // new() guarantees at least one row
        &self.observations[self.observations.len() - 1]
    }

    /// Borrow the transition of environment `env_id` at step `t`
    pub fn transition(&self, t: usize, env_id: usize) -> Option<Transition<'_>> {
        if t >= self.len() || env_id >= self.num_envs {
            return None;
        }
        Some(Transition {
            observation: &self.observations[t][env_id],
            action: self.actions[t].get(env_id),
            reward: self.rewards[t][env_id],
            done: self.dones[t][env_id],
            log_prob: self.log_probs[t][env_id],
            value: self.values[t][env_id],
        })
    }

    /// Verify the data-model invariants
    pub fn validate(&self) -> Result<()> {
        let h = self.len();
        check_len("observation rows", h + 1, self.observations.len())?;
        check_len("reward rows", h, self.rewards.len())?;
        check_len("done rows", h, self.dones.len())?;
        check_len("log_prob rows", h, self.log_probs.len())?;
        let expected_values = if self.finished { h + 1 } else { h };
        check_len("value rows", expected_values, self.values.len())?;
        Ok(())
    }

    /// Observations `0..H` flattened to a `[H * num_envs, obs_dim]` tensor
    ///
    /// Sample `t * num_envs + i` is environment `i` at step `t`.
    pub fn observations_tensor(&self, device: Device) -> Tensor {
        let flat: Vec<f32> = self.observations[..self.len()]
            .iter()
            .flatten()
            .flatten()
            .copied()
            .collect();
        Tensor::from_slice(&flat)
            .view([self.num_samples() as i64, self.obs_dim as i64])
            .to_device(device)
    }

    /// Bootstrap observations as a `[num_envs, obs_dim]` tensor
    pub fn last_observations_tensor(&self, device: Device) -> Tensor {
        let flat: Vec<f32> = self.last_observations().iter().flatten().copied().collect();
        Tensor::from_slice(&flat)
            .view([self.num_envs as i64, self.obs_dim as i64])
            .to_device(device)
    }

    /// All actions flattened in the same order as [`Self::observations_tensor`]
    pub fn flat_actions(&self) -> Result<ActionBatch> {
        ActionBatch::concat(&self.actions)
    }
}

/// Flatten `[H][num_envs]` rows into a single time-major vector
pub fn flatten_rows<T: Copy>(rows: &[Vec<T>]) -> Vec<T> {
    rows.iter().flatten().copied().collect()
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(TrainError::ShapeMismatch { what, expected, actual }.into());
    }
    Ok(())
}

fn check_observations(observations: &[Vec<f32>], num_envs: usize, obs_dim: usize) -> Result<()> {
    check_len("observations", num_envs, observations.len())?;
    for obs in observations {
        check_len("observation dimension", obs_dim, obs.len())?;
    }
    Ok(())
}
