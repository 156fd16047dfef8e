//! Training and online agents
//!
//! A run owns two independent copies of the policy:
//!
//! - [`TrainingAgent`] holds the trainable parameters and the optimizer and
//!   performs the PPO or A2C update on a finished rollout.
//! - [`OnlineAgent`] holds a frozen copy used only for acting. It changes
//!   only through [`OnlineAgent::sync_from`], which takes `&mut self`, so a
//!   rollout (which borrows the agent immutably) can never observe a
//!   partially copied parameter set.
//!
//! The two copies may live on different devices; parameters move between
//! them as a CPU [`ParameterSnapshot`].

use anyhow::Result;
use rand::{SeedableRng, rngs::StdRng};
use tch::{Device, Tensor};
use tracing::debug;

use crate::{
    buffer::{
        collector::{ActStep, RolloutPolicy},
        gae::{AdvantageBuffer, AdvantageEstimator},
        rollout::{Rollout, flatten_rows},
        sampling::minibatch_indices,
    },
    env::ActionBatch,
    error::TrainError,
    policy::{ActorCritic, Evaluation, ParameterSnapshot, observations_to_tensor, tensor_to_vec},
    train::{
        config::{Algorithm, TrainConfig},
        augment::random_shift,
        loss::{
            compute_a2c_policy_loss, compute_consistency_loss, compute_entropy_loss,
            compute_policy_loss, compute_value_loss, scalar,
        },
        optim::Adam,
        stats::TrainingStats,
    },
};

/// Flattened rollout samples on the training device
struct SampleSet {
    observations: Tensor,
    actions: Tensor,
    log_probs: Tensor,
    values: Tensor,
    advantages: Tensor,
    returns: Tensor,
}

impl SampleSet {
    fn new(rollout: &Rollout, advantages: &AdvantageBuffer, device: Device) -> Result<Self> {
        if advantages.len() != rollout.len() {
            return Err(TrainError::ShapeMismatch {
                what: "advantage rows",
                expected: rollout.len(),
                actual: advantages.len(),
            }
            .into());
        }
        Ok(Self {
            observations: rollout.observations_tensor(device),
            actions: rollout.flat_actions()?.to_tensor(device),
            log_probs: to_tensor(&flatten_rows(rollout.log_probs()), device),
            values: to_tensor(&flatten_rows(&rollout.values()[..rollout.len()]), device),
            advantages: to_tensor(&advantages.flat_advantages(), device),
            returns: to_tensor(&advantages.flat_returns(), device),
        })
    }

    fn select(&self, indices: &Tensor) -> Self {
        Self {
            observations: self.observations.index_select(0, indices),
            actions: self.actions.index_select(0, indices),
            log_probs: self.log_probs.index_select(0, indices),
            values: self.values.index_select(0, indices),
            advantages: self.advantages.index_select(0, indices),
            returns: self.returns.index_select(0, indices),
        }
    }
}

fn to_tensor(values: &[f32], device: Device) -> Tensor {
    Tensor::from_slice(values).to_device(device)
}

/// Owner of the trainable parameters and the optimizer
pub struct TrainingAgent<P: ActorCritic> {
    policy: P,
    optimizer: Adam,
    config: TrainConfig,
    estimator: AdvantageEstimator,
    rng: StdRng,
    image_shape: Option<[i64; 3]>,
    updates: u64,
}

impl<P: ActorCritic> TrainingAgent<P> {
    /// Wrap a policy for training with `config`
    pub fn new(policy: P, config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let optimizer = Adam::new(policy.var_store(), config.learning_rate);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let estimator = AdvantageEstimator::new(config.gamma as f32, config.gae_lambda as f32)
            .with_estimator(config.returns_estimator)
            .with_normalization(config.normalize_adv, config.adv_epsilon as f32);

        Ok(Self { policy, optimizer, config, estimator, rng, image_shape: None, updates: 0 })
    }

    /// Declare the observation shape
    ///
    /// A `[C, H, W]` shape enables random-shift augmentation when
    /// `image_aug_alpha > 0`; any other rank leaves it off.
    pub fn with_observation_shape(mut self, shape: &[usize]) -> Self {
        self.image_shape = match *shape {
            [c, h, w] => Some([c as i64, h as i64, w as i64]),
            _ => None,
        };
        self
    }

    /// The advantage estimator configured for this run
    pub fn estimator(&self) -> &AdvantageEstimator {
        &self.estimator
    }

    /// The trained policy
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// The optimizer
    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Mutable optimizer, e.g. to restore its state
    pub fn optimizer_mut(&mut self) -> &mut Adam {
        &mut self.optimizer
    }

    /// Number of completed `update` calls
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Snapshot of the current parameters
    pub fn parameters(&self) -> ParameterSnapshot {
        self.policy.parameters()
    }

    /// Overwrite the parameters, e.g. from a checkpoint
    pub fn load_parameters(&mut self, snapshot: &ParameterSnapshot) -> Result<()> {
        self.policy.load_parameters(snapshot)
    }

    /// Restore the update counter after loading a checkpoint
    pub fn set_updates(&mut self, updates: u64) {
        self.updates = updates;
    }

    /// Optimize on one finished rollout
    ///
    /// PPO runs `ppo_n_epoch` epochs over reshuffled mini-batches; A2C takes
    /// one full-batch step. A non-finite loss or gradient norm aborts the
    /// update with [`TrainError::NonFinite`] before the offending step is
    /// applied.
    pub fn update(&mut self, rollout: &Rollout, advantages: &AdvantageBuffer) -> Result<TrainingStats> {
        let samples = SampleSet::new(rollout, advantages, self.policy.device())?;
        let stats = match self.config.algorithm {
            Algorithm::Ppo => self.update_ppo(rollout, samples)?,
            Algorithm::A2c => self.update_a2c(&samples)?,
        };
        self.updates += 1;
        debug!(
            update = self.updates,
            policy_loss = stats.policy_loss,
            value_loss = stats.value_loss,
            entropy = stats.entropy,
            approx_kl = stats.approx_kl,
            clip_fraction = stats.clip_fraction,
            grad_norm = stats.grad_norm,
            "update finished"
        );
        Ok(stats)
    }

    fn update_ppo(&mut self, rollout: &Rollout, mut samples: SampleSet) -> Result<TrainingStats> {
        let n = rollout.num_samples();
        let device = self.policy.device();
        let mut total = TrainingStats::zeros();

        for epoch in 0..self.config.ppo_n_epoch {
            if self.config.recompute_advantage {
                self.refresh(rollout, &mut samples)?;
            }

            let batches = minibatch_indices(n, self.config.ppo_n_mini_batches, &mut self.rng);
            for (mini_batch, indices) in batches.iter().enumerate() {
                let indices: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
                let indices = Tensor::from_slice(&indices).to_device(device);
                let batch = samples.select(&indices);

                let eval = self.policy.evaluate(&batch.observations, &batch.actions);
                let (policy_loss, clip_fraction, approx_kl) = compute_policy_loss(
                    &eval.log_probs,
                    &batch.log_probs,
                    &batch.advantages,
                    self.config.ppo_epsilon,
                    self.config.rollback_alpha,
                );
                let value_clip = self.config.use_ppo_value_loss.then_some(self.config.ppo_epsilon);
                let (value_loss, explained_var) =
                    compute_value_loss(&eval.values, &batch.values, &batch.returns, value_clip);

                let consistency = self.consistency(&batch, &eval);

                let mut stats = self.apply_gradients(
                    &policy_loss,
                    &value_loss,
                    &eval.entropy,
                    consistency.as_ref(),
                    epoch,
                    mini_batch,
                )?;
                stats.clip_fraction = clip_fraction;
                stats.approx_kl = approx_kl;
                stats.explained_var = explained_var;
                total += &stats;
            }
        }

        Ok(total.average())
    }

    fn update_a2c(&mut self, samples: &SampleSet) -> Result<TrainingStats> {
        let eval = self.policy.evaluate(&samples.observations, &samples.actions);
        let policy_loss = compute_a2c_policy_loss(&eval.log_probs, &samples.advantages);
        let (value_loss, explained_var) =
            compute_value_loss(&eval.values, &samples.values, &samples.returns, None);

        let mut stats =
            self.apply_gradients(&policy_loss, &value_loss, &eval.entropy, None, 0, 0)?;
        stats.explained_var = explained_var;
        Ok(stats)
    }

    /// Re-measure log-probs and values under the current parameters and
    /// re-run advantage estimation
    fn refresh(&self, rollout: &Rollout, samples: &mut SampleSet) -> Result<()> {
        let device = self.policy.device();
        let (log_probs, values, bootstrap) = tch::no_grad(|| {
            let eval = self.policy.evaluate(&samples.observations, &samples.actions);
            let bootstrap = self.policy.values(&rollout.last_observations_tensor(device));
            (eval.log_probs, eval.values, bootstrap)
        });

        let mut value_rows: Vec<Vec<f32>> =
            tensor_to_vec(&values)?.chunks(rollout.num_envs()).map(<[f32]>::to_vec).collect();
        value_rows.push(tensor_to_vec(&bootstrap)?);
        let advantages = self.estimator.estimate_from(rollout.rewards(), &value_rows, rollout.dones())?;

        samples.log_probs = log_probs.detach();
        samples.values = values.detach();
        samples.advantages = to_tensor(&advantages.flat_advantages(), device);
        samples.returns = to_tensor(&advantages.flat_returns(), device);
        Ok(())
    }

    /// Consistency penalty against a shifted copy of the mini-batch, if
    /// augmentation is active
    fn consistency(&mut self, batch: &SampleSet, eval: &Evaluation) -> Option<Tensor> {
        let shape = self.image_shape?;
        if self.config.image_aug_alpha <= 0.0 {
            return None;
        }
        let augmented = random_shift(&batch.observations, shape, &mut self.rng);
        let aug = self.policy.evaluate(&augmented, &batch.actions);
        Some(compute_consistency_loss(&eval.log_probs, &eval.values, &aug.log_probs, &aug.values))
    }

    fn apply_gradients(
        &mut self,
        policy_loss: &Tensor,
        value_loss: &Tensor,
        entropy: &Tensor,
        consistency: Option<&Tensor>,
        epoch: usize,
        mini_batch: usize,
    ) -> Result<TrainingStats> {
        let entropy_loss = compute_entropy_loss(entropy);
        let mut loss = policy_loss
            + value_loss * self.config.value_loss_coef
            + &entropy_loss * self.config.entropy;
        if let Some(consistency) = consistency {
            loss = loss + consistency * self.config.image_aug_alpha;
        }

        let total_loss = scalar(&loss);
        if !total_loss.is_finite() {
            return Err(TrainError::NonFinite { what: "loss", epoch, mini_batch }.into());
        }

        self.optimizer.zero_grad();
        loss.backward();
        let grad_norm = self.optimizer.clip_grad_norm(self.config.clip_grad);
        if !grad_norm.is_finite() {
            self.optimizer.zero_grad();
            return Err(TrainError::NonFinite { what: "gradient norm", epoch, mini_batch }.into());
        }
        self.optimizer.step();

        Ok(TrainingStats {
            policy_loss: scalar(policy_loss),
            value_loss: scalar(value_loss),
            entropy: -scalar(&entropy_loss),
            total_loss,
            grad_norm,
            consistency_loss: consistency.map_or(0.0, scalar),
            num_updates: 1,
            ..Default::default()
        })
    }
}

/// Frozen policy copy used for acting
pub struct OnlineAgent<P: ActorCritic> {
    policy: P,
    version: u64,
}

impl<P: ActorCritic> OnlineAgent<P> {
    /// Take ownership of a policy and freeze its parameters
    pub fn new(mut policy: P) -> Self {
        policy.var_store_mut().freeze();
        Self { policy, version: 0 }
    }

    /// Replace every parameter with the snapshot, in one pass
    pub fn sync_from(&mut self, snapshot: &ParameterSnapshot) -> Result<()> {
        self.policy.load_parameters(snapshot)?;
        self.version += 1;
        Ok(())
    }

    /// Number of completed syncs
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Snapshot of the acting parameters
    pub fn parameters(&self) -> ParameterSnapshot {
        self.policy.parameters()
    }

    /// The acting policy
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Act on observation rows without tracking gradients
    pub fn act_batch(&self, observations: &[Vec<f32>], deterministic: bool) -> Result<ActStep> {
        let obs = observations_to_tensor(observations, self.policy.device());
        let out = tch::no_grad(|| self.policy.act(&obs, deterministic));
        Ok(ActStep {
            actions: ActionBatch::from_tensor(&out.actions, self.policy.head().is_discrete())?,
            log_probs: tensor_to_vec(&out.log_probs)?,
            values: tensor_to_vec(&out.values)?,
        })
    }
}

impl<P: ActorCritic> RolloutPolicy for OnlineAgent<P> {
    fn act(&self, observations: &[Vec<f32>]) -> Result<ActStep> {
        self.act_batch(observations, false)
    }

    fn values(&self, observations: &[Vec<f32>]) -> Result<Vec<f32>> {
        let obs = observations_to_tensor(observations, self.policy.device());
        tensor_to_vec(&tch::no_grad(|| self.policy.values(&obs)))
    }
}

#[cfg(test)]
mod tests {
    use tch::{Kind, nn};

    use super::*;
    use crate::policy::{ActOutput, PolicyHead, mlp::MlpPolicy};

    /// Two envs, four steps, obs [t, env], discrete actions
    fn rollout(reward: f32) -> Rollout {
        let mut rollout = Rollout::new(vec![vec![0.0, 0.0], vec![0.0, 1.0]]).unwrap();
        for t in 0..4 {
            rollout
                .push(
                    ActionBatch::Discrete(vec![(t % 2) as i64, 1]),
                    vec![-0.69; 2],
                    vec![0.0; 2],
                    vec![reward; 2],
                    vec![false, t == 2],
                    vec![vec![(t + 1) as f32, 0.0], vec![(t + 1) as f32, 1.0]],
                )
                .unwrap();
        }
        rollout.finish(vec![0.0; 2]).unwrap();
        rollout
    }

    fn agent(config: TrainConfig) -> TrainingAgent<MlpPolicy> {
        let policy = MlpPolicy::new(2, PolicyHead::Categorical { n: 2 }, Device::Cpu);
        TrainingAgent::new(policy, config.seed(0)).unwrap()
    }

    /// Two agents starting from the same parameters
    fn twins(
        first: TrainConfig,
        second: TrainConfig,
    ) -> (TrainingAgent<MlpPolicy>, TrainingAgent<MlpPolicy>) {
        let first = agent(first);
        let mut second = agent(second);
        second.load_parameters(&first.parameters()).unwrap();
        (first, second)
    }

    /// Value head `sqrt(w)` at `w = 0`: finite loss, infinite gradient
    struct SqrtValue {
        vs: nn::VarStore,
        w: Tensor,
    }

    impl SqrtValue {
        fn new() -> Self {
            let vs = nn::VarStore::new(Device::Cpu);
            let w = vs.root().var("w", &[1], nn::Init::Const(0.0));
            Self { vs, w }
        }

        fn value(&self, observations: &Tensor) -> Tensor {
            self.w.sqrt().expand([observations.size()[0]], true)
        }

        fn zeros(observations: &Tensor) -> Tensor {
            Tensor::zeros([observations.size()[0]], (Kind::Float, Device::Cpu))
        }
    }

    impl ActorCritic for SqrtValue {
        fn act(&self, observations: &Tensor, _deterministic: bool) -> ActOutput {
            ActOutput {
                actions: Tensor::zeros([observations.size()[0]], (Kind::Int64, Device::Cpu)),
                log_probs: Self::zeros(observations),
                values: self.value(observations),
            }
        }

        fn values(&self, observations: &Tensor) -> Tensor {
            self.value(observations)
        }

        fn evaluate(&self, observations: &Tensor, _actions: &Tensor) -> Evaluation {
            Evaluation {
                log_probs: Self::zeros(observations),
                entropy: Self::zeros(observations),
                values: self.value(observations),
            }
        }

        fn var_store(&self) -> &nn::VarStore {
            &self.vs
        }

        fn var_store_mut(&mut self) -> &mut nn::VarStore {
            &mut self.vs
        }

        fn head(&self) -> PolicyHead {
            PolicyHead::Categorical { n: 2 }
        }
    }

    #[test]
    fn test_ppo_update_schedule() {
        let config = TrainConfig::new().ppo_n_epoch(3).ppo_n_mini_batches(3);
        let mut agent = agent(config);
        let rollout = rollout(1.0);
        let advantages = agent.estimator().estimate(&rollout).unwrap();
        let before = agent.parameters();

        let stats = agent.update(&rollout, &advantages).unwrap();

        // 8 samples in 3 groups per epoch, 3 epochs
        assert_eq!(stats.num_updates, 9);
        assert_eq!(agent.optimizer().step_count(), 9);
        assert_eq!(agent.updates(), 1);
        assert!(before.max_abs_diff(&agent.parameters()).unwrap() > 0.0);
        assert!(stats.total_loss.is_finite());
    }

    #[test]
    fn test_a2c_takes_one_step() {
        let mut agent = agent(TrainConfig::new().algorithm(Algorithm::A2c));
        let rollout = rollout(1.0);
        let advantages = agent.estimator().estimate(&rollout).unwrap();

        let stats = agent.update(&rollout, &advantages).unwrap();
        assert_eq!(stats.num_updates, 1);
        assert_eq!(agent.optimizer().step_count(), 1);
    }

    #[test]
    fn test_recompute_advantage_runs_every_epoch() {
        let config = TrainConfig::new()
            .ppo_n_epoch(2)
            .ppo_n_mini_batches(2)
            .recompute_advantage(true)
            .normalize_adv(true);
        let mut agent = agent(config);
        let rollout = rollout(0.5);
        let advantages = agent.estimator().estimate(&rollout).unwrap();

        let stats = agent.update(&rollout, &advantages).unwrap();
        assert_eq!(stats.num_updates, 4);
        // refreshed log-probs come from the training policy itself, so the
        // first mini-batch starts exactly on-policy
        assert!(stats.approx_kl.abs() < 0.1);
    }

    #[test]
    fn test_non_finite_loss_is_fatal_and_leaves_parameters() {
        let mut agent = agent(TrainConfig::new());
        let rollout = rollout(f32::NAN);
        let advantages = agent.estimator().estimate(&rollout).unwrap();
        let before = agent.parameters();

        let err = agent.update(&rollout, &advantages).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrainError>(),
            Some(&TrainError::NonFinite { what: "loss", epoch: 0, mini_batch: 0 })
        );
        assert_eq!(before.max_abs_diff(&agent.parameters()).unwrap(), 0.0);
        assert_eq!(agent.optimizer().step_count(), 0);
        assert_eq!(agent.updates(), 0);
    }

    #[test]
    fn test_infinite_gradient_is_fatal_and_leaves_parameters() {
        let mut agent = TrainingAgent::new(SqrtValue::new(), TrainConfig::new().seed(0)).unwrap();
        let rollout = rollout(1.0);
        let advantages = agent.estimator().estimate(&rollout).unwrap();
        let before = agent.parameters();

        let err = agent.update(&rollout, &advantages).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrainError>(),
            Some(&TrainError::NonFinite { what: "gradient norm", epoch: 0, mini_batch: 0 })
        );
        assert_eq!(before.max_abs_diff(&agent.parameters()).unwrap(), 0.0);
        assert_eq!(agent.optimizer().step_count(), 0);
        assert_eq!(agent.updates(), 0);
    }

    #[test]
    fn test_zero_augmentation_weight_leaves_update_unchanged() {
        let rollout = rollout(1.0);
        let (mut plain, image) = twins(TrainConfig::new(), TrainConfig::new());
        let mut image = image.with_observation_shape(&[1, 1, 2]);
        let mut flat = agent(TrainConfig::new().image_aug_alpha(1.0)).with_observation_shape(&[2]);
        flat.load_parameters(&plain.parameters()).unwrap();
        let advantages = plain.estimator().estimate(&rollout).unwrap();

        let expected = plain.update(&rollout, &advantages).unwrap();
        // alpha = 0 on image observations
        assert_eq!(image.update(&rollout, &advantages).unwrap(), expected);
        // alpha > 0 without an image shape
        assert_eq!(flat.update(&rollout, &advantages).unwrap(), expected);
        assert_eq!(plain.parameters().max_abs_diff(&image.parameters()).unwrap(), 0.0);
        assert_eq!(plain.parameters().max_abs_diff(&flat.parameters()).unwrap(), 0.0);
    }

    #[test]
    fn test_augmentation_adds_consistency_penalty() {
        let rollout = rollout(1.0);
        let (mut plain, augmented) =
            twins(TrainConfig::new(), TrainConfig::new().image_aug_alpha(1.0));
        let mut augmented = augmented.with_observation_shape(&[1, 1, 2]);
        let advantages = plain.estimator().estimate(&rollout).unwrap();

        let base = plain.update(&rollout, &advantages).unwrap();
        let stats = augmented.update(&rollout, &advantages).unwrap();
        assert_eq!(base.consistency_loss, 0.0);
        assert!(stats.consistency_loss > 0.0);
        assert!(stats.total_loss.is_finite());
        assert_ne!(stats.total_loss, base.total_loss);
        assert_eq!(stats.num_updates, base.num_updates);
    }

    #[test]
    fn test_advantages_must_match_rollout() {
        let mut agent = agent(TrainConfig::new());
        let short = {
            let mut r = Rollout::new(vec![vec![0.0, 0.0], vec![0.0, 1.0]]).unwrap();
            r.push(
                ActionBatch::Discrete(vec![0, 0]),
                vec![0.0; 2],
                vec![0.0; 2],
                vec![1.0; 2],
                vec![false; 2],
                vec![vec![1.0, 0.0], vec![1.0, 1.0]],
            )
            .unwrap();
            r.finish(vec![0.0; 2]).unwrap();
            r
        };
        let advantages = agent.estimator().estimate(&short).unwrap();
        let err = agent.update(&rollout(1.0), &advantages).unwrap_err();
        assert!(matches!(err.downcast_ref::<TrainError>(), Some(TrainError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_online_agent_is_independent_copy() {
        let mut training = agent(TrainConfig::new());
        let mut online = OnlineAgent::new(MlpPolicy::new(
            2,
            PolicyHead::Categorical { n: 2 },
            Device::Cpu,
        ));
        online.sync_from(&training.parameters()).unwrap();
        assert_eq!(online.version(), 1);
        assert_eq!(online.parameters().max_abs_diff(&training.parameters()).unwrap(), 0.0);

        let rollout = rollout(1.0);
        let advantages = training.estimator().estimate(&rollout).unwrap();
        training.update(&rollout, &advantages).unwrap();

        // training moved, the online copy did not
        assert!(online.parameters().max_abs_diff(&training.parameters()).unwrap() > 0.0);
    }

    #[test]
    fn test_online_agent_acts_on_rows() {
        let online =
            OnlineAgent::new(MlpPolicy::new(3, PolicyHead::Gaussian { dim: 2 }, Device::Cpu));
        let obs = vec![vec![0.1, 0.2, 0.3]; 5];

        let step = online.act_batch(&obs, true).unwrap();
        assert_eq!(step.actions.len(), 5);
        assert!(matches!(step.actions, ActionBatch::Continuous { dim: 2, .. }));
        assert_eq!(step.log_probs.len(), 5);
        assert_eq!(RolloutPolicy::values(&online, &obs).unwrap(), step.values);
    }
}
