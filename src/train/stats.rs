//! Training statistics
//!
//! This module defines structures for tracking and aggregating
//! metrics of optimizer updates and whole epochs.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::buffer::collector::EpisodeRecord;

/// Training statistics for one or more gradient steps
///
/// Tracks various metrics from a single training step including
/// losses, KL divergence, and other diagnostic information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    /// Policy loss
    pub policy_loss: f64,

    /// Value function loss
    pub value_loss: f64,

    /// Mean entropy of the action distribution
    pub entropy: f64,

    /// Total loss (weighted sum of policy, value, and entropy losses)
    pub total_loss: f64,

    /// Fraction of samples outside the trust region
    pub clip_fraction: f64,

    /// Approximate KL divergence between acting and current policies
    pub approx_kl: f64,

    /// Explained variance of value function predictions
    pub explained_var: f64,

    /// Global gradient norm before clipping
    pub grad_norm: f64,

    /// Augmentation consistency penalty, before its weight
    #[serde(default)]
    pub consistency_loss: f64,

    /// Number of gradient steps performed
    pub num_updates: usize,
}

impl TrainingStats {
    /// Create zero-initialized statistics
    pub fn zeros() -> Self {
        Self::default()
    }

    /// Add another statistics instance to this one
    pub fn add(&mut self, other: &TrainingStats) {
        self.policy_loss += other.policy_loss;
        self.value_loss += other.value_loss;
        self.entropy += other.entropy;
        self.total_loss += other.total_loss;
        self.clip_fraction += other.clip_fraction;
        self.approx_kl += other.approx_kl;
        self.explained_var += other.explained_var;
        self.grad_norm += other.grad_norm;
        self.consistency_loss += other.consistency_loss;
        self.num_updates += other.num_updates;
    }

    /// Compute average statistics across multiple updates
    ///
    /// The result keeps the total `num_updates`.
    pub fn average(&self) -> Self {
        let scale = self.num_updates as f64;
        if scale == 0.0 {
            return Self::zeros();
        }

        Self {
            policy_loss: self.policy_loss / scale,
            value_loss: self.value_loss / scale,
            entropy: self.entropy / scale,
            total_loss: self.total_loss / scale,
            clip_fraction: self.clip_fraction / scale,
            approx_kl: self.approx_kl / scale,
            explained_var: self.explained_var / scale,
            grad_norm: self.grad_norm / scale,
            consistency_loss: self.consistency_loss / scale,
            num_updates: self.num_updates,
        }
    }
}

impl TrainingStats {
    /// Mean of already-averaged per-update statistics
    ///
    /// Each entry weighs the same regardless of how many gradient steps it
    /// covers; `num_updates` is the total over all entries.
    pub fn mean_of(stats: &[TrainingStats]) -> Self {
        let mut total = Self::zeros();
        for s in stats {
            total += s;
        }
        let num_updates = total.num_updates;
        total.num_updates = stats.len();
        let mut mean = total.average();
        mean.num_updates = num_updates;
        mean
    }
}

impl AddAssign<&TrainingStats> for TrainingStats {
    fn add_assign(&mut self, other: &TrainingStats) {
        self.add(other);
    }
}

/// What happened during one trainer epoch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Index of the finished epoch (0-based)
    pub epoch: usize,

    /// Optimizer updates since the start of training
    pub updates: u64,

    /// Environment transitions since the start of training
    pub global_step: u64,

    /// Training episodes finished during the epoch
    pub train_episodes: usize,

    /// Mean raw return of those episodes
    pub mean_train_return: Option<f32>,

    /// Mean length of those episodes
    pub mean_train_length: Option<f32>,

    /// Raw return of every evaluation episode
    pub eval_returns: Vec<f32>,

    /// Mean evaluation return
    pub mean_eval_return: Option<f32>,

    /// Update statistics averaged over the epoch
    pub stats: TrainingStats,
}

impl EpochSummary {
    /// Fill the episode fields from finished training and evaluation episodes
    pub fn with_episodes(mut self, train: &[EpisodeRecord], eval_returns: Vec<f32>) -> Self {
        self.train_episodes = train.len();
        self.mean_train_return = mean(train.iter().map(|e| e.total_reward));
        self.mean_train_length = mean(train.iter().map(|e| e.length as f32));
        self.mean_eval_return = mean(eval_returns.iter().copied());
        self.eval_returns = eval_returns;
        self
    }
}

fn mean(values: impl Iterator<Item = f32>) -> Option<f32> {
    let (sum, count) = values.fold((0.0f64, 0usize), |(s, c), v| (s + v as f64, c + 1));
    (count > 0).then(|| (sum / count as f64) as f32)
}
