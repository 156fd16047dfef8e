//! Composable environment wrappers
//!
//! Training runs commonly repeat actions, cap episode length, and penalise
//! early termination. These wrappers implement [`Environment`] themselves, so
//! they nest freely:
//!
//! ```rust,ignore
//! let env = DiePenalty::new(TimeLimit::new(ActionRepeat::new(MyEnv::new(), 4), 1000), 10.0);
//! ```

use anyhow::Result;

use crate::env::{Action, Environment, SpaceInfo, StepResult};

/// Repeats each action `repeat` times, summing the rewards
///
/// Stops early if the episode ends during the repeat.
#[derive(Debug)]
pub struct ActionRepeat<E> {
    inner: E,
    repeat: usize,
}

impl<E: Environment> ActionRepeat<E> {
    /// Wrap `inner`; a `repeat` of 0 or 1 leaves behaviour unchanged
    pub fn new(inner: E, repeat: usize) -> Self {
        Self { inner, repeat: repeat.max(1) }
    }

    /// Access the wrapped environment
    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: Environment> Environment for ActionRepeat<E> {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.inner.reset()
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        let mut total_reward = 0.0;
        let mut result = self.inner.step(action)?;
        total_reward += result.reward;

        for _ in 1..self.repeat {
            if result.done() {
                break;
            }
            result = self.inner.step(action)?;
            total_reward += result.reward;
        }

        result.reward = total_reward;
        Ok(result)
    }

    fn observation_space(&self) -> SpaceInfo {
        self.inner.observation_space()
    }

    fn action_space(&self) -> SpaceInfo {
        self.inner.action_space()
    }
}

/// Truncates episodes after `max_len` steps (0 disables the limit)
#[derive(Debug)]
pub struct TimeLimit<E> {
    inner: E,
    max_len: usize,
    elapsed: usize,
}

impl<E: Environment> TimeLimit<E> {
    /// Wrap `inner` with an episode length cap
    pub fn new(inner: E, max_len: usize) -> Self {
        Self { inner, max_len, elapsed: 0 }
    }

    /// Steps taken in the current episode
    pub fn elapsed(&self) -> usize {
        self.elapsed
    }
}

impl<E: Environment> Environment for TimeLimit<E> {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.elapsed = 0;
        self.inner.reset()
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        let mut result = self.inner.step(action)?;
        self.elapsed += 1;
        if self.max_len > 0 && self.elapsed >= self.max_len && !result.terminated {
            result.truncated = true;
        }
        Ok(result)
    }

    fn observation_space(&self) -> SpaceInfo {
        self.inner.observation_space()
    }

    fn action_space(&self) -> SpaceInfo {
        self.inner.action_space()
    }
}

/// Subtracts `penalty` from the reward of a terminating (not truncated) step
#[derive(Debug)]
pub struct DiePenalty<E> {
    inner: E,
    penalty: f32,
}

impl<E: Environment> DiePenalty<E> {
    /// Wrap `inner`; a zero penalty leaves rewards unchanged
    pub fn new(inner: E, penalty: f32) -> Self {
        Self { inner, penalty }
    }
}

impl<E: Environment> Environment for DiePenalty<E> {
    fn reset(&mut self) -> Result<Vec<f32>> {
        self.inner.reset()
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        let mut result = self.inner.step(action)?;
        if result.terminated && !result.truncated {
            result.reward -= self.penalty;
        }
        Ok(result)
    }

    fn observation_space(&self) -> SpaceInfo {
        self.inner.observation_space()
    }

    fn action_space(&self) -> SpaceInfo {
        self.inner.action_space()
    }
}
