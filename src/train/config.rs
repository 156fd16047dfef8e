//! Training configuration and hyperparameters
//!
//! This module defines the configuration surface of a training run and
//! provides validation, builder methods and JSON (de)serialization.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{buffer::gae::ReturnsEstimator, error::TrainError};

/// Policy-gradient objective
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Clipped surrogate, several epochs of mini-batches per rollout
    #[default]
    Ppo,

    /// Vanilla actor-critic, one full-batch step per rollout
    A2c,
}

/// Training configuration parameters
///
/// Missing fields fall back to their defaults when deserializing, so a JSON
/// file only needs the options it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// PPO or A2C
    pub algorithm: Algorithm,

    /// Advantage/return estimator
    pub returns_estimator: ReturnsEstimator,

    /// Discount factor (gamma)
    pub gamma: f64,

    /// GAE lambda parameter
    pub gae_lambda: f64,

    /// Learning rate for policy and value function
    pub learning_rate: f64,

    /// Entropy bonus coefficient
    pub entropy: f64,

    /// Value function loss coefficient
    pub value_loss_coef: f64,

    /// Maximum gradient norm for clipping
    pub clip_grad: f64,

    /// PPO clipping parameter (epsilon); infinity disables the clip and is
    /// written to JSON as `null`
    #[serde(with = "unbounded")]
    pub ppo_epsilon: f64,

    /// Rollback slope outside the trust region; 0 uses the hard clip
    pub rollback_alpha: f64,

    /// Clip the value prediction around the old estimate
    pub use_ppo_value_loss: bool,

    /// Weight of the random-shift consistency penalty for `[C, H, W]`
    /// observations; 0 disables augmentation
    pub image_aug_alpha: f64,

    /// Refresh log-probs, values and advantages at every PPO epoch
    pub recompute_advantage: bool,

    /// Number of PPO epochs per rollout
    pub ppo_n_epoch: usize,

    /// Number of mini-batches per PPO epoch
    pub ppo_n_mini_batches: usize,

    /// Normalize advantages over the whole rollout
    pub normalize_adv: bool,

    /// Floor added to the advantage standard deviation
    pub adv_epsilon: f64,

    /// Normalize observations with running statistics
    pub normalize_obs: bool,

    /// Normalize rewards with running statistics
    pub normalize_reward: bool,

    /// Symmetric clip magnitude for normalized observations (`None` = no clip)
    pub obs_clip: Option<f32>,

    /// Symmetric clip magnitude for normalized rewards (`None` = no clip)
    pub reward_clip: Option<f32>,

    /// Variance floor of the running statistics
    pub norm_epsilon: f64,

    /// Multiplicative reward shaping applied before storage
    pub reward_scale: f32,

    /// Keep running statistics fixed during evaluation episodes
    pub freeze_stats_during_eval: bool,

    /// Optimizer updates between online/training parameter syncs
    pub update_period: usize,

    /// Rollout horizon
    pub rollout_len: usize,

    /// Updates (collect + optimize) per epoch
    pub n_step_per_epoch: usize,

    /// Number of epochs
    pub n_epoch: usize,

    /// Evaluation episodes after each epoch
    pub n_tests_per_epoch: usize,

    /// Step cap for one evaluation episode
    pub eval_max_steps: usize,

    /// Seed for torch and the mini-batch shuffler
    pub seed: Option<u64>,

    /// Where periodic checkpoints go
    pub checkpoint_dir: Option<PathBuf>,

    /// Epochs between periodic checkpoints (0 = never)
    pub checkpoint_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Ppo,
            returns_estimator: ReturnsEstimator::Gae,
            gamma: 0.99,
            gae_lambda: 0.9,
            learning_rate: 3e-4,
            entropy: 1e-3,
            value_loss_coef: 1.0,
            clip_grad: 0.5,
            ppo_epsilon: 0.2,
            rollback_alpha: 0.0,
            use_ppo_value_loss: false,
            image_aug_alpha: 0.0,
            recompute_advantage: false,
            ppo_n_epoch: 4,
            ppo_n_mini_batches: 4,
            normalize_adv: false,
            adv_epsilon: 1e-8,
            normalize_obs: false,
            normalize_reward: false,
            obs_clip: None,
            reward_clip: None,
            norm_epsilon: 1e-8,
            reward_scale: 1.0,
            freeze_stats_during_eval: false,
            update_period: 1,
            rollout_len: 128,
            n_step_per_epoch: 10,
            n_epoch: 10,
            n_tests_per_epoch: 1,
            eval_max_steps: 10_000,
            seed: None,
            checkpoint_dir: None,
            checkpoint_every: 0,
        }
    }
}

fn invalid(message: &str) -> anyhow::Error {
    TrainError::InvalidConfig(message.to_string()).into()
}

fn is_positive(x: f64) -> bool {
    x.is_finite() && x > 0.0
}

fn is_non_negative(x: f64) -> bool {
    x.is_finite() && x >= 0.0
}

/// Finite values become symmetric magnitudes, infinities disable the clip
fn clip_bound(clip: f32) -> Option<f32> {
    clip.is_finite().then(|| clip.abs())
}

impl TrainConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if !is_positive(self.learning_rate) {
            return Err(invalid("learning_rate must be positive"));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(invalid("gamma must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.gae_lambda) {
            return Err(invalid("gae_lambda must be in [0, 1]"));
        }
        if self.ppo_epsilon.is_nan() || self.ppo_epsilon <= 0.0 {
            return Err(invalid("ppo_epsilon must be positive"));
        }
        if !is_non_negative(self.rollback_alpha) {
            return Err(invalid("rollback_alpha must be non-negative"));
        }
        if !is_non_negative(self.image_aug_alpha) {
            return Err(invalid("image_aug_alpha must be non-negative"));
        }
        if !is_non_negative(self.entropy) {
            return Err(invalid("entropy must be non-negative"));
        }
        if !is_non_negative(self.value_loss_coef) {
            return Err(invalid("value_loss_coef must be non-negative"));
        }
        if !is_positive(self.clip_grad) {
            return Err(invalid("clip_grad must be positive"));
        }
        if !is_positive(self.adv_epsilon) || !is_positive(self.norm_epsilon) {
            return Err(invalid("adv_epsilon and norm_epsilon must be positive"));
        }
        if !self.reward_scale.is_finite() {
            return Err(invalid("reward_scale must be finite"));
        }
        if self.ppo_n_epoch == 0 {
            return Err(invalid("ppo_n_epoch must be positive"));
        }
        if self.ppo_n_mini_batches == 0 {
            return Err(invalid("ppo_n_mini_batches must be positive"));
        }
        if self.update_period == 0 {
            return Err(invalid("update_period must be positive"));
        }
        if self.rollout_len == 0 {
            return Err(invalid("rollout_len must be positive"));
        }
        if self.n_step_per_epoch == 0 {
            return Err(invalid("n_step_per_epoch must be positive"));
        }
        if self.eval_max_steps == 0 {
            return Err(invalid("eval_max_steps must be positive"));
        }
        if self.checkpoint_every > 0 && self.checkpoint_dir.is_none() {
            return Err(invalid("checkpoint_every requires checkpoint_dir"));
        }
        Ok(())
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: TrainConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty JSON representation
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Set the objective
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the advantage estimator
    pub fn returns_estimator(mut self, estimator: ReturnsEstimator) -> Self {
        self.returns_estimator = estimator;
        self
    }

    /// Set discount factor
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    /// Set GAE lambda
    pub fn gae_lambda(mut self, lambda: f64) -> Self {
        self.gae_lambda = lambda;
        self
    }

    /// Set learning rate
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set entropy bonus coefficient
    pub fn entropy(mut self, coef: f64) -> Self {
        self.entropy = coef;
        self
    }

    /// Set value function loss coefficient
    pub fn value_loss_coef(mut self, coef: f64) -> Self {
        self.value_loss_coef = coef;
        self
    }

    /// Set maximum gradient norm
    pub fn clip_grad(mut self, norm: f64) -> Self {
        self.clip_grad = norm;
        self
    }

    /// Set PPO clipping parameter
    pub fn ppo_epsilon(mut self, eps: f64) -> Self {
        self.ppo_epsilon = eps;
        self
    }

    /// Set rollback slope
    pub fn rollback_alpha(mut self, alpha: f64) -> Self {
        self.rollback_alpha = alpha;
        self
    }

    /// Set the augmentation consistency weight
    pub fn image_aug_alpha(mut self, alpha: f64) -> Self {
        self.image_aug_alpha = alpha;
        self
    }

    /// Enable the clipped value loss
    pub fn use_ppo_value_loss(mut self, enabled: bool) -> Self {
        self.use_ppo_value_loss = enabled;
        self
    }

    /// Enable per-epoch advantage recomputation
    pub fn recompute_advantage(mut self, enabled: bool) -> Self {
        self.recompute_advantage = enabled;
        self
    }

    /// Set number of PPO epochs
    pub fn ppo_n_epoch(mut self, epochs: usize) -> Self {
        self.ppo_n_epoch = epochs;
        self
    }

    /// Set number of mini-batches
    pub fn ppo_n_mini_batches(mut self, n: usize) -> Self {
        self.ppo_n_mini_batches = n;
        self
    }

    /// Enable advantage normalization
    pub fn normalize_adv(mut self, enabled: bool) -> Self {
        self.normalize_adv = enabled;
        self
    }

    /// Enable observation normalization
    pub fn normalize_obs(mut self, enabled: bool) -> Self {
        self.normalize_obs = enabled;
        self
    }

    /// Enable reward normalization
    pub fn normalize_reward(mut self, enabled: bool) -> Self {
        self.normalize_reward = enabled;
        self
    }

    /// Clip normalized observations to `[-|clip|, |clip|]`; infinity disables
    pub fn obs_clip(mut self, clip: f32) -> Self {
        self.obs_clip = clip_bound(clip);
        self
    }

    /// Clip normalized rewards to `[-|clip|, |clip|]`; infinity disables
    pub fn reward_clip(mut self, clip: f32) -> Self {
        self.reward_clip = clip_bound(clip);
        self
    }

    /// Set the reward shaping factor
    pub fn reward_scale(mut self, scale: f32) -> Self {
        self.reward_scale = scale;
        self
    }

    /// Keep running statistics fixed during evaluation
    pub fn freeze_stats_during_eval(mut self, frozen: bool) -> Self {
        self.freeze_stats_during_eval = frozen;
        self
    }

    /// Set updates between parameter syncs
    pub fn update_period(mut self, period: usize) -> Self {
        self.update_period = period;
        self
    }

    /// Set rollout horizon
    pub fn rollout_len(mut self, len: usize) -> Self {
        self.rollout_len = len;
        self
    }

    /// Set updates per epoch
    pub fn n_step_per_epoch(mut self, n: usize) -> Self {
        self.n_step_per_epoch = n;
        self
    }

    /// Set number of epochs
    pub fn n_epoch(mut self, n: usize) -> Self {
        self.n_epoch = n;
        self
    }

    /// Set evaluation episodes per epoch
    pub fn n_tests_per_epoch(mut self, n: usize) -> Self {
        self.n_tests_per_epoch = n;
        self
    }

    /// Set the evaluation episode step cap
    pub fn eval_max_steps(mut self, n: usize) -> Self {
        self.eval_max_steps = n;
        self
    }

    /// Set the random seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Write a checkpoint to `dir` every `every` epochs
    pub fn checkpoint(mut self, dir: impl Into<PathBuf>, every: usize) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self.checkpoint_every = every;
        self
    }
}

/// JSON has no infinity: `+inf` is written as `null` and read back
mod unbounded {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if *value == f64::INFINITY {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrainConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.learning_rate, 3e-4);
        assert_eq!(config.gae_lambda, 0.9);
        assert_eq!(config.update_period, 1);
        assert_eq!(config.value_loss_coef, 1.0);
        assert_eq!(config.obs_clip, None);
    }

    #[test]
    fn test_config_validation() {
        assert!(TrainConfig::new().learning_rate(-1.0).validate().is_err());
        assert!(TrainConfig::new().learning_rate(f64::NAN).validate().is_err());
        assert!(TrainConfig::new().gamma(1.5).validate().is_err());
        assert!(TrainConfig::new().gae_lambda(-0.1).validate().is_err());
        assert!(TrainConfig::new().ppo_n_epoch(0).validate().is_err());
        assert!(TrainConfig::new().ppo_n_mini_batches(0).validate().is_err());
        assert!(TrainConfig::new().update_period(0).validate().is_err());
        assert!(TrainConfig::new().rollback_alpha(-0.3).validate().is_err());
        assert!(TrainConfig::new().image_aug_alpha(-0.1).validate().is_err());
        assert!(TrainConfig::new().ppo_epsilon(f64::NAN).validate().is_err());

        // an unbounded trust region is allowed
        assert!(TrainConfig::new().ppo_epsilon(f64::INFINITY).validate().is_ok());

        // value_loss_coef may be zero
        assert!(TrainConfig::new().value_loss_coef(0.0).validate().is_ok());

        let mut config = TrainConfig::new();
        config.checkpoint_every = 2;
        let err = config.validate().unwrap_err();
        assert!(matches!(err.downcast_ref::<TrainError>(), Some(TrainError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_builder() {
        let config = TrainConfig::new()
            .algorithm(Algorithm::A2c)
            .learning_rate(1e-3)
            .gamma(0.95)
            .ppo_epsilon(0.1)
            .image_aug_alpha(0.1)
            .reward_scale(0.3);

        assert_eq!(config.algorithm, Algorithm::A2c);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.gamma, 0.95);
        assert_eq!(config.ppo_epsilon, 0.1);
        assert_eq!(config.reward_scale, 0.3);
        assert_eq!(config.image_aug_alpha, 0.1);

        // Other values should remain default
        assert_eq!(config.gae_lambda, 0.9);
        assert_eq!(config.entropy, 1e-3);
    }

    #[test]
    fn test_clip_bounds_are_symmetric() {
        let config = TrainConfig::new().obs_clip(-5.0).reward_clip(f32::INFINITY);
        assert_eq!(config.obs_clip, Some(5.0));
        assert_eq!(config.reward_clip, None);

        let config = TrainConfig::new().obs_clip(f32::NEG_INFINITY).reward_clip(10.0);
        assert_eq!(config.obs_clip, None);
        assert_eq!(config.reward_clip, Some(10.0));
    }

    #[test]
    fn test_json_round_trip_and_partial_file() {
        let config = TrainConfig::new()
            .returns_estimator(ReturnsEstimator::NStep)
            .obs_clip(5.0)
            .seed(42);
        let json = config.to_json().unwrap();
        assert!(json.contains("\"n_step\""));
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{ "algorithm": "a2c", "rollout_len": 5 }"#).unwrap();
        let loaded = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.algorithm, Algorithm::A2c);
        assert_eq!(loaded.rollout_len, 5);
        assert_eq!(loaded.gamma, 0.99);

        std::fs::write(&path, r#"{ "gamma": 2.0 }"#).unwrap();
        assert!(TrainConfig::from_json_file(&path).is_err());
    }

    #[test]
    fn test_unbounded_trust_region_survives_json() {
        let config = TrainConfig::new().ppo_epsilon(f64::INFINITY);
        let json = config.to_json().unwrap();
        assert!(json.contains("\"ppo_epsilon\": null"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unclipped.json");
        std::fs::write(&path, &json).unwrap();
        let loaded = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.ppo_epsilon, f64::INFINITY);
        assert_eq!(loaded, config);

        // an absent field still takes the default radius
        let partial: TrainConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(partial.ppo_epsilon, 0.2);
    }
}
