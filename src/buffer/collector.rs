//! Rollout collection
//!
//! [`RolloutCollector`] drives an [`EnvPool`] for a fixed horizon with the
//! acting policy and records a time-major [`Rollout`]. Each step is a single
//! pass: query the policy once, step the pool once, record the result.
//!
//! Observations handed to the collector are already normalized; the
//! collector normalizes every new observation batch with the run's
//! [`Normalizer`] and returns the final (normalized) batch so the next
//! rollout can start from it. Rewards are multiplied by `reward_scale` and
//! then normalized before storage. Episode returns are tracked on the raw
//! environment rewards.

use anyhow::Result;
use tracing::debug;

use crate::{
    buffer::rollout::Rollout,
    env::{ActionBatch, Environment, pool::EnvPool},
    error::TrainError,
    utils::normalize::Normalizer,
};

/// Output of one acting query
#[derive(Debug, Clone, PartialEq)]
pub struct ActStep {
    /// One action per environment
    pub actions: ActionBatch,

    /// Log-probability of each action
    pub log_probs: Vec<f32>,

    /// Value estimate of each observation
    pub values: Vec<f32>,
}

/// Acting capability the collector needs
///
/// Implementations must answer the whole rollout from one frozen parameter
/// set.
pub trait RolloutPolicy {
    /// Choose actions for a batch of observations
    fn act(&self, observations: &[Vec<f32>]) -> Result<ActStep>;

    /// Value estimates for a batch of observations
    fn values(&self, observations: &[Vec<f32>]) -> Result<Vec<f32>>;
}

/// A finished training episode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeRecord {
    /// Environment slot the episode ran in
    pub env_id: usize,

    /// Sum of raw environment rewards
    pub total_reward: f32,

    /// Number of steps
    pub length: usize,
}

/// Fixed-horizon rollout collector
#[derive(Debug, Clone)]
pub struct RolloutCollector {
    rollout_len: usize,
    reward_scale: f32,
    episode_returns: Vec<f32>,
    episode_lengths: Vec<usize>,
    finished: Vec<EpisodeRecord>,
}

impl RolloutCollector {
    /// Create a collector for `num_envs` environments
    pub fn new(num_envs: usize, rollout_len: usize, reward_scale: f32) -> Self {
        Self {
            rollout_len,
            reward_scale,
            episode_returns: vec![0.0; num_envs],
            episode_lengths: vec![0; num_envs],
            finished: Vec::new(),
        }
    }

    /// Rollout horizon
    pub fn rollout_len(&self) -> usize {
        self.rollout_len
    }

    /// Episodes finished since the last call to this method
    pub fn drain_finished(&mut self) -> Vec<EpisodeRecord> {
        std::mem::take(&mut self.finished)
    }

    /// Collect one rollout starting from `observations`
    ///
    /// Returns the final observation batch and the finished rollout (with
    /// bootstrap values recorded).
    pub fn collect<E, P>(
        &mut self,
        pool: &mut EnvPool<E>,
        policy: &P,
        normalizer: &mut Normalizer,
        observations: Vec<Vec<f32>>,
    ) -> Result<(Vec<Vec<f32>>, Rollout)>
    where
        E: Environment + Send,
        P: RolloutPolicy + ?Sized,
    {
        let num_envs = pool.num_envs();
        if observations.len() != num_envs || self.episode_returns.len() != num_envs {
            return Err(TrainError::ShapeMismatch {
                what: "observations per rollout start",
                expected: num_envs,
                actual: observations.len(),
            }
            .into());
        }

        let mut rollout = Rollout::new(observations)?;
        for _ in 0..self.rollout_len {
            let act = policy.act(rollout.last_observations())?;
            let step = pool.step(&act.actions)?;

            for env_id in 0..num_envs {
                self.episode_returns[env_id] += step.rewards[env_id];
                self.episode_lengths[env_id] += 1;
                if step.dones[env_id] {
                    self.finished.push(EpisodeRecord {
                        env_id,
                        total_reward: self.episode_returns[env_id],
                        length: self.episode_lengths[env_id],
                    });
                    self.episode_returns[env_id] = 0.0;
                    self.episode_lengths[env_id] = 0;
                }
            }

            let scaled: Vec<f32> = step.rewards.iter().map(|r| r * self.reward_scale).collect();
            let rewards = normalizer.rewards(&scaled, true)?;
            let next_observations = normalizer.observations(&step.observations, true)?;

            rollout.push(
                act.actions,
                act.log_probs,
                act.values,
                rewards,
                step.dones,
                next_observations,
            )?;
        }

        let bootstrap = policy.values(rollout.last_observations())?;
        rollout.finish(bootstrap)?;
        debug!(steps = rollout.len(), envs = num_envs, "rollout collected");

        Ok((rollout.last_observations().to_vec(), rollout))
    }
}
