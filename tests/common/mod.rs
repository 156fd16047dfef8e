//! Fixture environments shared by the integration tests

#![allow(dead_code)]

use anyhow::{Result, bail};
use lockstep_rl::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Contextual bandit: observation is 0 or 1, reward 1 when the action
/// matches it. Episodes last `max_steps` steps.
pub struct ContextBandit {
    state: f32,
    steps: usize,
    max_steps: usize,
    rng: StdRng,
}

impl ContextBandit {
    pub fn new(seed: u64, max_steps: usize) -> Self {
        Self { state: 0.0, steps: 0, max_steps, rng: StdRng::seed_from_u64(seed) }
    }
}

impl Environment for ContextBandit {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.state = self.rng.gen_range(0..2) as f32;
        self.steps = 0;
        Ok(vec![self.state])
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        let Action::Discrete(action) = action else {
            bail!("bandit expects a discrete action");
        };
        let reward = if *action == self.state as i64 { 1.0 } else { 0.0 };
        self.steps += 1;
        self.state = self.rng.gen_range(0..2) as f32;

        Ok(StepResult {
            observation: vec![self.state],
            reward,
            terminated: self.steps >= self.max_steps,
            truncated: false,
        })
    }

    fn observation_space(&self) -> SpaceInfo {
        SpaceInfo { shape: vec![1], dtype: SpaceType::Continuous }
    }

    fn action_space(&self) -> SpaceInfo {
        SpaceInfo { shape: vec![], dtype: SpaceType::Discrete(2) }
    }
}

/// Deterministic corridor of `length` cells; action 1 moves right, reward 1
/// on reaching the end
pub struct Corridor {
    position: usize,
    length: usize,
}

impl Corridor {
    pub fn new(length: usize) -> Self {
        Self { position: 0, length }
    }

    fn observation(&self) -> Vec<f32> {
        vec![self.position as f32 / self.length as f32, 1.0]
    }
}

impl Environment for Corridor {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.position = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        if *action == Action::Discrete(1) {
            self.position += 1;
        }
        let terminated = self.position >= self.length;
        Ok(StepResult {
            observation: self.observation(),
            reward: if terminated { 1.0 } else { 0.0 },
            terminated,
            truncated: false,
        })
    }

    fn observation_space(&self) -> SpaceInfo {
        SpaceInfo { shape: vec![2], dtype: SpaceType::Continuous }
    }

    fn action_space(&self) -> SpaceInfo {
        SpaceInfo { shape: vec![], dtype: SpaceType::Discrete(2) }
    }
}

/// Trainer over 2 training corridors and 1 test corridor
pub fn corridor_trainer(config: TrainConfig) -> Result<Trainer<Corridor, MlpPolicy>> {
    let head = PolicyHead::Categorical { n: 2 };
    Trainer::new(
        config,
        EnvPool::new(|| Corridor::new(5), 2),
        EnvPool::new(|| Corridor::new(5), 1),
        MlpPolicy::new(2, head, tch::Device::Cpu),
        MlpPolicy::new(2, head, tch::Device::Cpu),
    )
}

/// Small, fast configuration
pub fn small_config() -> TrainConfig {
    TrainConfig::new()
        .rollout_len(8)
        .n_step_per_epoch(2)
        .n_epoch(2)
        .n_tests_per_epoch(1)
        .eval_max_steps(50)
        .ppo_n_epoch(2)
        .ppo_n_mini_batches(2)
        .seed(11)
}
