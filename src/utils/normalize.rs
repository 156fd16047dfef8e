//! Observation and reward normalization for stable RL training
//!
//! [`RunningMeanStd`] tracks per-dimension mean and variance with Welford's
//! online algorithm, one sample at a time. [`Normalizer`] owns the
//! observation and reward accumulators of a training run and applies
//! `(x - mean) / sqrt(var + eps)` followed by the optional clip bound.
//! Both are serializable so they can be stored with checkpoints.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{error::TrainError, train::config::TrainConfig};

/// Running mean and variance accumulator
///
/// Tracks mean and variance using Welford's online algorithm
/// for numerical stability. Before any sample is seen the statistics are
/// mean 0 and variance 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningMeanStd {
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: u64,
}

impl RunningMeanStd {
    /// Create an empty accumulator of dimension `size`
    pub fn new(size: usize) -> Self {
        Self { mean: vec![0.0; size], m2: vec![0.0; size], count: 0 }
    }

    /// Dimension of the tracked samples
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Fold one sample into the statistics
    pub fn update(&mut self, sample: &[f32]) -> Result<()> {
        check_dim(self.dim(), sample.len())?;
        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), &x) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(sample) {
            let x = x as f64;
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        }
        Ok(())
    }

    /// Fold every sample of a batch, in order
    pub fn update_batch(&mut self, samples: &[Vec<f32>]) -> Result<()> {
        for sample in samples {
            self.update(sample)?;
        }
        Ok(())
    }

    /// Normalize one sample with the current statistics
    pub fn normalize(&self, sample: &[f32], epsilon: f64) -> Vec<f32> {
        sample
            .iter()
            .zip(&self.mean)
            .zip(self.var())
            .map(|((&x, &mean), var)| ((x as f64 - mean) / (var + epsilon).sqrt()) as f32)
            .collect()
    }

    /// Get current mean
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Get current (population) variance
    pub fn var(&self) -> Vec<f64> {
        if self.count == 0 {
            return vec![1.0; self.dim()];
        }
        self.m2.iter().map(|m2| m2 / self.count as f64).collect()
    }

    /// Get number of samples seen
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Running-statistics transform for observations and rewards
///
/// Each stream is toggled independently; a disabled stream passes through
/// untouched (and is never clipped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    obs_stats: Option<RunningMeanStd>,
    reward_stats: Option<RunningMeanStd>,
    obs_clip: Option<f32>,
    reward_clip: Option<f32>,
    epsilon: f64,
}

impl Normalizer {
    /// Create a normalizer for observations of dimension `obs_dim`
    pub fn new(obs_dim: usize, normalize_obs: bool, normalize_reward: bool, epsilon: f64) -> Self {
        Self {
            obs_stats: normalize_obs.then(|| RunningMeanStd::new(obs_dim)),
            reward_stats: normalize_reward.then(|| RunningMeanStd::new(1)),
            obs_clip: None,
            reward_clip: None,
            epsilon,
        }
    }

    /// A normalizer that changes nothing
    pub fn identity() -> Self {
        Self::new(0, false, false, 1e-8)
    }

    /// Build from the normalization options of a training config
    pub fn from_config(config: &TrainConfig, obs_dim: usize) -> Self {
        Self::new(obs_dim, config.normalize_obs, config.normalize_reward, config.norm_epsilon)
            .with_obs_clip(config.obs_clip)
            .with_reward_clip(config.reward_clip)
    }

    /// Clamp normalized observations to `[-c, c]`
    pub fn with_obs_clip(mut self, clip: Option<f32>) -> Self {
        self.obs_clip = clip.map(f32::abs);
        self
    }

    /// Clamp normalized rewards to `[-c, c]`
    pub fn with_reward_clip(mut self, clip: Option<f32>) -> Self {
        self.reward_clip = clip.map(f32::abs);
        self
    }

    /// Observation statistics, if observations are normalized
    pub fn observation_stats(&self) -> Option<&RunningMeanStd> {
        self.obs_stats.as_ref()
    }

    /// Reward statistics, if rewards are normalized
    pub fn reward_stats(&self) -> Option<&RunningMeanStd> {
        self.reward_stats.as_ref()
    }

    /// Normalize an observation batch, folding it into the statistics first
    /// when `update` is set
    pub fn observations(&mut self, batch: &[Vec<f32>], update: bool) -> Result<Vec<Vec<f32>>> {
        let Some(stats) = self.obs_stats.as_mut() else {
            return Ok(batch.to_vec());
        };
        if update {
            stats.update_batch(batch)?;
        } else {
            for obs in batch {
                check_dim(stats.dim(), obs.len())?;
            }
        }
        Ok(batch
            .iter()
            .map(|obs| {
                let mut normalized = stats.normalize(obs, self.epsilon);
                clip(&mut normalized, self.obs_clip);
                normalized
            })
            .collect())
    }

    /// Normalize a reward batch, folding it into the statistics first when
    /// `update` is set
    pub fn rewards(&mut self, rewards: &[f32], update: bool) -> Result<Vec<f32>> {
        let Some(stats) = self.reward_stats.as_mut() else {
            return Ok(rewards.to_vec());
        };
        let mut normalized = Vec::with_capacity(rewards.len());
        for &r in rewards {
            if update {
                stats.update(&[r])?;
            }
            normalized.push(stats.normalize(&[r], self.epsilon)[0]);
        }
        clip(&mut normalized, self.reward_clip);
        Ok(normalized)
    }

    /// Check that restored statistics match this run's observation size
    pub fn check_compatible(&self, other: &Normalizer) -> Result<()> {
        let dims = |n: &Normalizer| n.obs_stats.as_ref().map(RunningMeanStd::dim);
        if dims(self) != dims(other) || self.reward_stats.is_some() != other.reward_stats.is_some()
        {
            return Err(TrainError::CheckpointMismatch {
                name: "normalizer".to_string(),
                expected: format!("{:?}", dims(self)),
                actual: format!("{:?}", dims(other)),
            }
            .into());
        }
        Ok(())
    }
}

fn clip(values: &mut [f32], bound: Option<f32>) {
    if let Some(c) = bound {
        for v in values {
            *v = v.clamp(-c, c);
        }
    }
}

fn check_dim(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(TrainError::ShapeMismatch { what: "normalized sample dimension", expected, actual }
            .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welford_matches_batch_statistics() {
        let mut stats = RunningMeanStd::new(2);
        let data = vec![vec![1.0, 2.0], vec![2.0, 4.0], vec![3.0, 6.0], vec![6.0, -4.0]];
        stats.update_batch(&data).unwrap();

        assert_eq!(stats.count(), 4);
        assert!((stats.mean()[0] - 3.0).abs() < 1e-12);
        assert!((stats.mean()[1] - 2.0).abs() < 1e-12);
        // population variance
        assert!((stats.var()[0] - 3.5).abs() < 1e-12);
        assert!((stats.var()[1] - 14.0).abs() < 1e-12);
    }

    #[test]
    fn test_incremental_update() {
        let mut stats = RunningMeanStd::new(1);
        stats.update(&[1.0]).unwrap();
        stats.update(&[2.0]).unwrap();
        stats.update(&[3.0]).unwrap();
        assert!((stats.mean()[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_fresh_stats_are_identity() {
        let stats = RunningMeanStd::new(3);
        let out = stats.normalize(&[1.0, -2.0, 0.5], 0.0);
        assert_eq!(out, vec![1.0, -2.0, 0.5]);
    }

    #[test]
    fn test_update_rejects_wrong_dim() {
        let mut stats = RunningMeanStd::new(2);
        assert!(stats.update(&[1.0]).is_err());
    }

    #[test]
    fn test_observation_normalization_and_clip() {
        let mut normalizer = Normalizer::new(1, true, false, 1e-8).with_obs_clip(Some(-1.0));
        let batch = vec![vec![0.0], vec![10.0]];
        let out = normalizer.observations(&batch, true).unwrap();
        // mean 5, std 5: raw (-1, 1), inside the clip
        assert!((out[0][0] + 1.0).abs() < 1e-5);
        assert!((out[1][0] - 1.0).abs() < 1e-5);

        let outlier = normalizer.observations(&[vec![100.0]], false).unwrap();
        assert_eq!(outlier[0][0], 1.0);
        assert_eq!(normalizer.observation_stats().unwrap().count(), 2);
    }

    #[test]
    fn test_disabled_streams_pass_through() {
        let mut normalizer = Normalizer::identity().with_reward_clip(Some(0.1));
        assert_eq!(normalizer.rewards(&[5.0, -3.0], true).unwrap(), vec![5.0, -3.0]);
        let obs = vec![vec![1.0, 2.0, 3.0]];
        assert_eq!(normalizer.observations(&obs, true).unwrap(), obs);
    }

    #[test]
    fn test_reward_normalization() {
        let mut normalizer = Normalizer::new(4, false, true, 1e-8);
        for _ in 0..100 {
            normalizer.rewards(&[1.0, 3.0], true).unwrap();
        }
        let out = normalizer.rewards(&[2.0, 4.0], false).unwrap();
        assert!(out[0].abs() < 1e-3);
        assert!((out[1] - 2.0).abs() < 1e-3);
        assert_eq!(normalizer.reward_stats().unwrap().count(), 200);
    }

    #[test]
    fn test_frozen_update_leaves_stats() {
        let mut normalizer = Normalizer::new(1, true, true, 1e-8);
        normalizer.observations(&[vec![1.0]], false).unwrap();
        normalizer.rewards(&[1.0], false).unwrap();
        assert_eq!(normalizer.observation_stats().unwrap().count(), 0);
        assert_eq!(normalizer.reward_stats().unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_reward_statistics_are_reported() {
        // reward statistics restored with the wrong width
        let json = r#"{
            "obs_stats": null,
            "reward_stats": { "mean": [0.0, 0.0], "m2": [0.0, 0.0], "count": 0 },
            "obs_clip": null,
            "reward_clip": null,
            "epsilon": 1e-8
        }"#;
        let mut normalizer: Normalizer = serde_json::from_str(json).unwrap();
        let err = normalizer.rewards(&[1.0], true).unwrap_err();
        assert!(matches!(err.downcast_ref::<TrainError>(), Some(TrainError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_serde_round_trip_keeps_statistics() {
        let mut normalizer = Normalizer::new(2, true, true, 1e-8).with_obs_clip(Some(5.0));
        normalizer.observations(&[vec![1.0, 2.0], vec![3.0, 5.0]], true).unwrap();
        normalizer.rewards(&[0.5], true).unwrap();

        let json = serde_json::to_string(&normalizer).unwrap();
        let restored: Normalizer = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, normalizer);
        normalizer.check_compatible(&restored).unwrap();
        assert!(normalizer.check_compatible(&Normalizer::new(3, true, true, 1e-8)).is_err());
    }
}
