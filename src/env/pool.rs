//! Vectorized environment pool with automatic episode reset
//!
//! This module provides parallel environment execution using Rayon. Every
//! call to [`EnvPool::step`] advances all environments with one action each;
//! any environment whose episode ends is reset immediately, and its fresh
//! initial observation is returned in place of the terminal one. The reward
//! and done flag still describe the transition that ended the episode.
//!
//! # Failure policy
//!
//! A failing `step` or `reset` in any slot is fatal to the whole pool call:
//! every slot runs to completion, then the lowest failing index is reported
//! as [`TrainError::EnvStep`] and no partial batch is returned.
//!
//! # Example
//!
//! ```rust,ignore
//! use lockstep_rl::env::{ActionBatch, pool::EnvPool};
//!
//! let mut pool = EnvPool::new(|| MyEnv::new(), 4);
//! let observations = pool.reset()?;
//! let step = pool.step(&ActionBatch::Discrete(vec![0, 1, 0, 1]))?;
//! assert_eq!(step.observations.len(), 4);
//! ```

use anyhow::Result;
use rayon::prelude::*;

use crate::{
    env::{ActionBatch, Environment, SpaceInfo},
    error::TrainError,
};

/// A pool of environments stepped in lock-step
///
/// Index `i` identifies the same environment instance for the whole
/// lifetime of the pool.
pub struct EnvPool<E: Environment> {
    /// Vector of environment instances
    envs: Vec<E>,

    /// Number of environments
    num_envs: usize,
}

/// Result of stepping an environment pool
///
/// Contains observations, rewards, and done flags for all environments.
#[derive(Debug, Clone)]
pub struct PoolStep {
    /// Next observation per environment (a reset observation where `dones[i]`)
    pub observations: Vec<Vec<f32>>,

    /// Reward of the transition per environment
    pub rewards: Vec<f32>,

    /// Whether the transition ended the episode (terminated or truncated)
    pub dones: Vec<bool>,

    /// Whether the episode end came from truncation only
    pub truncated: Vec<bool>,
}

impl<E: Environment + Send> EnvPool<E> {
    /// Create a new environment pool
    ///
    /// # Arguments
    ///
    /// * `env_fn` - Factory function to create environment instances
    /// * `num_envs` - Number of parallel environments
    pub fn new<F>(env_fn: F, num_envs: usize) -> Self
    where
        F: Fn() -> E,
    {
        let envs = (0..num_envs).map(|_| env_fn()).collect();
        Self { envs, num_envs }
    }

    /// Create a pool from already-built environments
    pub fn from_envs(envs: Vec<E>) -> Self {
        let num_envs = envs.len();
        Self { envs, num_envs }
    }

    /// Reset all environments in parallel
    ///
    /// Returns a vector of initial observations, one per environment.
    pub fn reset(&mut self) -> Result<Vec<Vec<f32>>> {
        let observations = self
            .envs
            .par_iter_mut()
            .enumerate()
            .map(|(env_id, env)| {
                env.reset()
                    .map_err(|e| TrainError::EnvStep { env_id, message: format!("{e:#}") })
            })
            .collect::<Vec<_>>();
        first_error(observations)
    }

    /// Step all environments in parallel with given actions
    ///
    /// Environments reporting the end of an episode are reset before this
    /// call returns.
    ///
    /// # Errors
    ///
    /// [`TrainError::ShapeMismatch`] if the number of actions does not match
    /// the number of environments; [`TrainError::EnvStep`] if any environment
    /// fails.
    pub fn step(&mut self, actions: &ActionBatch) -> Result<PoolStep> {
        if actions.len() != self.num_envs {
            return Err(TrainError::ShapeMismatch {
                what: "actions per pool step",
                expected: self.num_envs,
                actual: actions.len(),
            }
            .into());
        }

        let results = self
            .envs
            .par_iter_mut()
            .enumerate()
            .map(|(env_id, env)| {
                let fail = |e: anyhow::Error| TrainError::EnvStep {
                    env_id,
                    message: format!("{e:#}"),
                };
                let result = env.step(&actions.get(env_id)).map_err(fail)?;
                let done = result.done();
                let observation = if done { env.reset().map_err(fail)? } else { result.observation };
                Ok((observation, result.reward, done, result.truncated && !result.terminated))
            })
            .collect::<Vec<_>>();
        let results = first_error(results)?;

        let mut observations = Vec::with_capacity(self.num_envs);
        let mut rewards = Vec::with_capacity(self.num_envs);
        let mut dones = Vec::with_capacity(self.num_envs);
        let mut truncated = Vec::with_capacity(self.num_envs);

        for (observation, reward, done, trunc) in results {
            observations.push(observation);
            rewards.push(reward);
            dones.push(done);
            truncated.push(trunc);
        }

        Ok(PoolStep { observations, rewards, dones, truncated })
    }

    /// Get the number of environments in the pool
    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    /// Get observation space information from first environment
    pub fn observation_space(&self) -> Option<SpaceInfo> {
        self.envs.first().map(|env| env.observation_space())
    }

    /// Get action space information from first environment
    pub fn action_space(&self) -> Option<SpaceInfo> {
        self.envs.first().map(|env| env.action_space())
    }

    /// Reset a specific environment by index
    pub fn reset_env(&mut self, env_id: usize) -> Result<Vec<f32>> {
        let num_envs = self.num_envs;
        let env = self.envs.get_mut(env_id).ok_or(TrainError::ShapeMismatch {
            what: "environment index",
            expected: num_envs,
            actual: env_id,
        })?;
        let observation = env
            .reset()
            .map_err(|e| TrainError::EnvStep { env_id, message: format!("{e:#}") })?;
        Ok(observation)
    }
}

/// Unwrap per-slot results, reporting the lowest failing slot
///
/// Rayon's `Result` collect keeps whichever error finishes first, so the
/// slots are scanned in index order instead.
fn first_error<T>(results: Vec<Result<T, TrainError>>) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(results.len());
    for result in results {
        out.push(result?);
    }
    Ok(out)
}
