//! Epoch loop
//!
//! [`Trainer`] owns every piece of mutable training state: both environment
//! pools, the training and online agents, the normalizer, the rollout
//! collector and the counters in [`TrainerState`]. Nothing is global; a run
//! lives exactly as long as its trainer.

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    buffer::collector::RolloutCollector,
    env::{Environment, pool::EnvPool},
    error::TrainError,
    policy::ActorCritic,
    train::{
        agent::{OnlineAgent, TrainingAgent},
        checkpoint::{Checkpoint, CheckpointState},
        config::TrainConfig,
        stats::{EpochSummary, TrainingStats},
    },
    utils::Normalizer,
};

/// Counters persisted with every checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Completed epochs
    pub epoch: usize,
    /// Environment transitions collected for training
    pub global_step: u64,
    /// Completed training-agent updates
    pub updates: u64,
    /// Finished training episodes
    pub episodes: u64,
}

/// Owner of a training run
pub struct Trainer<E: Environment + Send, P: ActorCritic> {
    config: TrainConfig,
    train_pool: EnvPool<E>,
    test_pool: EnvPool<E>,
    training: TrainingAgent<P>,
    online: OnlineAgent<P>,
    collector: RolloutCollector,
    normalizer: Normalizer,
    /// Normalized observations the next rollout starts from
    observations: Option<Vec<Vec<f32>>>,
    state: TrainerState,
    stop: Arc<AtomicBool>,
}

impl<E: Environment + Send, P: ActorCritic> Trainer<E, P> {
    /// Set up a run
    ///
    /// `training_policy` and `online_policy` must share an architecture; the
    /// online copy is overwritten with the training parameters before the
    /// first rollout.
    pub fn new(
        config: TrainConfig,
        train_pool: EnvPool<E>,
        test_pool: EnvPool<E>,
        training_policy: P,
        online_policy: P,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(seed) = config.seed {
            tch::manual_seed(seed as i64);
        }

        let obs_space = train_pool
            .observation_space()
            .ok_or_else(|| TrainError::InvalidConfig("training pool has no environments".into()))?;
        if config.n_tests_per_epoch > 0 {
            match test_pool.observation_space() {
                Some(space) if space == obs_space => {}
                Some(_) => {
                    return Err(TrainError::InvalidConfig(
                        "test pool observation space differs from training pool".into(),
                    )
                    .into());
                }
                None => {
                    return Err(TrainError::InvalidConfig("test pool has no environments".into()).into());
                }
            }
        }

        let normalizer = Normalizer::from_config(&config, obs_space.flat_dim());
        let collector =
            RolloutCollector::new(train_pool.num_envs(), config.rollout_len, config.reward_scale);
        if config.image_aug_alpha > 0.0 && obs_space.shape.len() != 3 {
            warn!(shape = ?obs_space.shape, "image_aug_alpha ignored for non-image observations");
        }
        let training = TrainingAgent::new(training_policy, config.clone())?
            .with_observation_shape(&obs_space.shape);
        let mut online = OnlineAgent::new(online_policy);
        online.sync_from(&training.parameters())?;

        info!(
            algorithm = ?config.algorithm,
            train_envs = train_pool.num_envs(),
            test_envs = test_pool.num_envs(),
            rollout_len = config.rollout_len,
            "trainer ready"
        );

        Ok(Self {
            config,
            train_pool,
            test_pool,
            training,
            online,
            collector,
            normalizer,
            observations: None,
            state: TrainerState::default(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag that ends [`Trainer::train`] at the next epoch boundary
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run epochs until `n_epoch` is reached or a stop is requested
    pub fn train(&mut self) -> Result<Vec<EpochSummary>> {
        let mut summaries = Vec::new();
        while self.state.epoch < self.config.n_epoch {
            if self.stop.load(Ordering::SeqCst) {
                info!(epoch = self.state.epoch, "stop requested");
                break;
            }

            summaries.push(self.run_epoch()?);

            if let Some(dir) = &self.config.checkpoint_dir {
                let every = self.config.checkpoint_every;
                if every > 0 && self.state.epoch % every == 0 {
                    self.save_checkpoint(dir.join(format!("epoch_{}", self.state.epoch)))?;
                }
            }
        }
        Ok(summaries)
    }

    /// `n_step_per_epoch` training steps followed by evaluation
    pub fn run_epoch(&mut self) -> Result<EpochSummary> {
        let epoch = self.state.epoch;
        let mut step_stats = Vec::with_capacity(self.config.n_step_per_epoch);
        for _ in 0..self.config.n_step_per_epoch {
            step_stats.push(self.train_step()?);
        }

        let episodes = self.collector.drain_finished();
        self.state.episodes += episodes.len() as u64;
        let eval_returns = self.evaluate(self.config.n_tests_per_epoch)?;
        self.state.epoch += 1;

        let summary = EpochSummary {
            epoch,
            updates: self.state.updates,
            global_step: self.state.global_step,
            stats: TrainingStats::mean_of(&step_stats),
            ..Default::default()
        }
        .with_episodes(&episodes, eval_returns);

        info!(
            epoch,
            updates = summary.updates,
            global_step = summary.global_step,
            train_episodes = summary.train_episodes,
            mean_train_return = ?summary.mean_train_return,
            mean_eval_return = ?summary.mean_eval_return,
            policy_loss = summary.stats.policy_loss,
            value_loss = summary.stats.value_loss,
            "epoch finished"
        );
        Ok(summary)
    }

    /// Collect one rollout with the online agent and update the training agent
    ///
    /// Syncs the online agent after every `update_period`-th update.
    pub fn train_step(&mut self) -> Result<TrainingStats> {
        let observations = match self.observations.take() {
            Some(observations) => observations,
            None => {
                let raw = self.train_pool.reset()?;
                self.normalizer.observations(&raw, true)?
            }
        };

        let (next, rollout) = self.collector.collect(
            &mut self.train_pool,
            &self.online,
            &mut self.normalizer,
            observations,
        )?;
        self.observations = Some(next);
        self.state.global_step += rollout.num_samples() as u64;

        let advantages = self.training.estimator().estimate(&rollout)?;
        let stats = self.training.update(&rollout, &advantages)?;
        self.state.updates += 1;

        if self.state.updates % self.config.update_period as u64 == 0 {
            self.sync_online()?;
        }
        Ok(stats)
    }

    /// Copy the training parameters into the online agent
    pub fn sync_online(&mut self) -> Result<()> {
        let snapshot = self.training.parameters();
        self.online.sync_from(&snapshot)?;
        info!(version = self.online.version(), updates = self.state.updates, "online agent synced");
        Ok(())
    }

    /// Play `n_episodes` deterministic episodes on the test pool
    ///
    /// Returns the raw (unscaled, unnormalized) return of each episode in
    /// completion order. An episode running `eval_max_steps` steps is cut
    /// off and its environment reset.
    pub fn evaluate(&mut self, n_episodes: usize) -> Result<Vec<f32>> {
        if n_episodes == 0 {
            return Ok(Vec::new());
        }

        let update = !self.config.freeze_stats_during_eval;
        let num_envs = self.test_pool.num_envs();
        let raw = self.test_pool.reset()?;
        let mut observations = self.normalizer.observations(&raw, update)?;
        let mut returns = vec![0.0f32; num_envs];
        let mut lengths = vec![0usize; num_envs];
        let mut finished = Vec::with_capacity(n_episodes);

        while finished.len() < n_episodes {
            let act = self.online.act_batch(&observations, true)?;
            let step = self.test_pool.step(&act.actions)?;

            let scaled: Vec<f32> =
                step.rewards.iter().map(|r| r * self.config.reward_scale).collect();
            self.normalizer.rewards(&scaled, update)?;

            let mut next = step.observations;
            for env_id in 0..num_envs {
                returns[env_id] += step.rewards[env_id];
                lengths[env_id] += 1;

                let timed_out = !step.dones[env_id] && lengths[env_id] >= self.config.eval_max_steps;
                if step.dones[env_id] || timed_out {
                    if timed_out {
                        warn!(env_id, steps = lengths[env_id], "evaluation episode cut off");
                        next[env_id] = self.test_pool.reset_env(env_id)?;
                    }
                    if finished.len() < n_episodes {
                        finished.push(returns[env_id]);
                    }
                    returns[env_id] = 0.0;
                    lengths[env_id] = 0;
                }
            }
            observations = self.normalizer.observations(&next, update)?;
        }

        let mean = finished.iter().sum::<f32>() / finished.len() as f32;
        info!(episodes = finished.len(), mean_return = mean, "evaluation finished");
        Ok(finished)
    }

    /// Write parameters, optimizer state, statistics and counters to `dir`
    pub fn save_checkpoint<Q: AsRef<Path>>(&self, dir: Q) -> Result<()> {
        let checkpoint = Checkpoint {
            parameters: self.training.parameters(),
            optimizer: self.training.optimizer().state_tensors(),
            state: CheckpointState {
                version: crate::VERSION.to_string(),
                trainer: self.state.clone(),
                optimizer_step: self.training.optimizer().step_count(),
                normalizer: self.normalizer.clone(),
                config: serde_json::to_value(&self.config)?,
            },
        };
        checkpoint.save(dir)
    }

    /// Resume from a checkpoint written by [`Trainer::save_checkpoint`]
    ///
    /// The training pool is reset before the next rollout and the online
    /// agent is re-synced.
    pub fn load_checkpoint<Q: AsRef<Path>>(&mut self, dir: Q) -> Result<()> {
        let checkpoint = Checkpoint::load(dir)?;
        let state = checkpoint.state;

        self.normalizer.check_compatible(&state.normalizer)?;
        if state.config != serde_json::to_value(&self.config)? {
            warn!("checkpoint was written with a different configuration");
        }

        self.training.load_parameters(&checkpoint.parameters)?;
        self.training.optimizer_mut().load_state(checkpoint.optimizer, state.optimizer_step)?;
        self.training.set_updates(state.trainer.updates);
        self.normalizer = state.normalizer;
        self.state = state.trainer;

        self.observations = None;
        self.collector = RolloutCollector::new(
            self.train_pool.num_envs(),
            self.config.rollout_len,
            self.config.reward_scale,
        );
        self.sync_online()
    }

    /// Counters of the run
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// The run's configuration
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// The acting agent
    pub fn online(&self) -> &OnlineAgent<P> {
        &self.online
    }

    /// The learning agent
    pub fn training(&self) -> &TrainingAgent<P> {
        &self.training
    }

    /// Observation/reward statistics
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }
}
