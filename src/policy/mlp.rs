//! Multi-Layer Perceptron (MLP) actor-critic policy
//!
//! This module provides a simple feedforward neural network policy using
//! tch-rs. The policy outputs both action-distribution parameters and value
//! estimates, which is standard for actor-critic algorithms like PPO.
//!
//! # Architecture
//!
//! ```text
//! Input (observations)
//!         |
//!     [Dense(64)]
//!         |
//!      Tanh
//!         |
//!     [Dense(64)]
//!         |
//!      Tanh
//!      /     \
//!  Actor    Critic
//!     |        |
//! [Dense(k)]  [Dense(1)]
//!     |        |
//!  Head     Value
//! ```
//!
//! `k` depends on the [`PolicyHead`]: `n` logits for categorical actions,
//! `dim` means for the Gaussian head (plus a learned `log_std` vector),
//! `2 * dim` concentration pre-activations for the Beta head.

use std::f64::consts::{LN_2, PI};

use tch::{
    Device, Kind, Tensor,
    nn::{self, Init, Module},
};

use crate::policy::{ActOutput, ActorCritic, Evaluation, PolicyHead};

/// Keeps Beta samples strictly inside the support
const BETA_EPS: f64 = 1e-6;

/// Configuration for MLP policy architecture
#[derive(Debug, Clone)]
pub struct MlpConfig {
    /// Number of shared hidden layers (at least 1)
    pub num_layers: usize,
    /// Width of every hidden layer
    pub hidden_dim: i64,
    /// Orthogonal (true) or small-normal initialization
    pub use_orthogonal_init: bool,
    /// Hidden-layer nonlinearity
    pub activation: Activation,
}

/// Hidden-layer nonlinearity
#[derive(Debug, Clone, Copy)]
pub enum Activation {
    /// Rectified linear unit
    ReLU,
    /// Hyperbolic tangent
    Tanh,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self { num_layers: 2, hidden_dim: 64, use_orthogonal_init: true, activation: Activation::Tanh }
    }
}

/// Multi-layer perceptron actor-critic
///
/// Implements an actor-critic architecture with:
/// - Shared feature extraction layers
/// - Orthogonal weight initialization (better for RL)
/// - Separate actor head (distribution parameters)
/// - Separate critic head (state value estimate)
pub struct MlpPolicy {
    vs: nn::VarStore,
    shared: nn::Sequential,
    actor: nn::Linear,
    critic: nn::Linear,
    log_std: Option<Tensor>,
    head: PolicyHead,
    config: MlpConfig,
}

impl MlpPolicy {
    /// Create a new MLP policy with the default 2x64 architecture
    ///
    /// # Arguments
    ///
    /// * `obs_dim` - Observation space dimensionality
    /// * `head` - Action distribution family
    /// * `device` - Where the parameters live
    pub fn new(obs_dim: i64, head: PolicyHead, device: Device) -> Self {
        Self::with_config(obs_dim, head, MlpConfig::default(), device)
    }

    /// Create a new MLP policy with custom configuration
    pub fn with_config(obs_dim: i64, head: PolicyHead, config: MlpConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        // Weight initialization - use orthogonal for hidden layers
        let hidden_init = if config.use_orthogonal_init {
            Init::Orthogonal { gain: 2.0_f64.sqrt() }
        } else {
            Init::Randn { mean: 0.0, stdev: 0.01 }
        };
        let hidden_config = nn::LinearConfig { ws_init: hidden_init, ..Default::default() };

        let activation = config.activation;
        let mut shared = nn::seq();
        let mut in_dim = obs_dim;
        for layer in 0..config.num_layers.max(1) {
            shared = shared
                .add(nn::linear(
                    &root / "shared" / format!("fc{}", layer + 1),
                    in_dim,
                    config.hidden_dim,
                    hidden_config,
                ))
                .add_fn(move |x| match activation {
                    Activation::ReLU => x.relu(),
                    Activation::Tanh => x.tanh(),
                });
            in_dim = config.hidden_dim;
        }

        // Policy and value heads with smaller gain for output layers
        let output_init = if config.use_orthogonal_init {
            Init::Orthogonal { gain: 0.01 }
        } else {
            Init::Randn { mean: 0.0, stdev: 0.01 }
        };
        let output_config = nn::LinearConfig { ws_init: output_init, ..Default::default() };

        let actor = nn::linear(
            &root / "actor",
            config.hidden_dim,
            head.num_outputs() as i64,
            output_config,
        );
        let critic = nn::linear(&root / "critic", config.hidden_dim, 1, output_config);
        let log_std = match head {
            PolicyHead::Gaussian { dim } => Some(root.var("log_std", &[dim as i64], Init::Const(0.0))),
            _ => None,
        };

        tracing::debug!(?head, ?device, hidden = config.hidden_dim, "MlpPolicy created");
        Self { vs, shared, actor, critic, log_std, head, config }
    }

    /// Forward pass: actor outputs and values
    pub fn forward(&self, obs: &Tensor) -> (Tensor, Tensor) {
        let features = self.shared.forward(obs);
        let actor_out = self.actor.forward(&features);
        let values = self.critic.forward(&features).squeeze_dim(-1);
        (actor_out, values)
    }

    /// Architecture configuration
    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    fn beta_params(&self, actor_out: &Tensor) -> (Tensor, Tensor) {
        let dim = actor_out.size()[1] / 2;
        let conc = actor_out.softplus() + 1.0;
        (conc.narrow(-1, 0, dim), conc.narrow(-1, dim, dim))
    }

    fn log_std_like(&self, mean: &Tensor) -> Tensor {
        match &self.log_std {
            Some(log_std) => log_std.expand_as(mean),
            None => mean.zeros_like(),
        }
    }

    fn gaussian_log_prob(mean: &Tensor, log_std: &Tensor, actions: &Tensor) -> Tensor {
        let var = (log_std * 2.0).exp();
        let log_density = -(actions - mean).square() / (var * 2.0) - log_std - 0.5 * (2.0 * PI).ln();
        log_density.sum_dim_intlist(-1, false, Kind::Float)
    }

    fn beta_log_prob(alpha: &Tensor, beta: &Tensor, actions: &Tensor) -> Tensor {
        let x = ((actions + 1.0) / 2.0).clamp(BETA_EPS, 1.0 - BETA_EPS);
        let log_norm = alpha.lgamma() + beta.lgamma() - (alpha + beta).lgamma();
        let log_density =
            (alpha - 1.0) * x.log() + (beta - 1.0) * (-&x + 1.0).log() - log_norm - LN_2;
        log_density.sum_dim_intlist(-1, false, Kind::Float)
    }

    fn beta_entropy(alpha: &Tensor, beta: &Tensor) -> Tensor {
        let total = alpha + beta;
        let log_norm = alpha.lgamma() + beta.lgamma() - total.lgamma();
        let entropy = log_norm - (alpha - 1.0) * alpha.digamma() - (beta - 1.0) * beta.digamma()
            + (&total - 2.0) * total.digamma()
            + LN_2;
        entropy.sum_dim_intlist(-1, false, Kind::Float)
    }
}

impl ActorCritic for MlpPolicy {
    fn act(&self, observations: &Tensor, deterministic: bool) -> ActOutput {
        let (actor_out, values) = self.forward(observations);
        let (actions, log_probs) = match self.head {
            PolicyHead::Categorical { .. } => {
                // Use log_softmax for numerical stability
                let log_probs_all = actor_out.log_softmax(-1, Kind::Float);
                let actions = if deterministic {
                    actor_out.argmax(-1, false)
                } else {
                    log_probs_all.exp().multinomial(1, true).squeeze_dim(-1)
                };
                let log_probs =
                    log_probs_all.gather(-1, &actions.unsqueeze(-1), false).squeeze_dim(-1);
                (actions, log_probs)
            }
            PolicyHead::Gaussian { .. } => {
                let log_std = self.log_std_like(&actor_out);
                let actions = if deterministic {
                    actor_out.shallow_clone()
                } else {
                    &actor_out + log_std.exp() * actor_out.randn_like()
                };
                let log_probs = Self::gaussian_log_prob(&actor_out, &log_std, &actions);
                (actions, log_probs)
            }
            PolicyHead::Beta { .. } => {
                let (alpha, beta) = self.beta_params(&actor_out);
                let x = if deterministic {
                    &alpha / (&alpha + &beta)
                } else {
                    let a = alpha.internal_standard_gamma();
                    let b = beta.internal_standard_gamma();
                    &a / (&a + &b)
                };
                let actions = x.clamp(BETA_EPS, 1.0 - BETA_EPS) * 2.0 - 1.0;
                let log_probs = Self::beta_log_prob(&alpha, &beta, &actions);
                (actions, log_probs)
            }
        };
        ActOutput { actions, log_probs, values }
    }

    fn values(&self, observations: &Tensor) -> Tensor {
        self.forward(observations).1
    }

    fn evaluate(&self, observations: &Tensor, actions: &Tensor) -> Evaluation {
        let (actor_out, values) = self.forward(observations);
        let (log_probs, entropy) = match self.head {
            PolicyHead::Categorical { .. } => {
                let log_probs_all = actor_out.log_softmax(-1, Kind::Float);
                let probs = log_probs_all.exp();
                let actions = actions.to_kind(Kind::Int64);
                let log_probs =
                    log_probs_all.gather(-1, &actions.unsqueeze(-1), false).squeeze_dim(-1);
                // H = -sum p(x) * log(p(x)), per sample
                let entropy = -(probs * &log_probs_all).sum_dim_intlist(-1, false, Kind::Float);
                (log_probs, entropy)
            }
            PolicyHead::Gaussian { .. } => {
                let log_std = self.log_std_like(&actor_out);
                let log_probs = Self::gaussian_log_prob(&actor_out, &log_std, actions);
                let entropy = (&log_std + 0.5 + 0.5 * (2.0 * PI).ln())
                    .sum_dim_intlist(-1, false, Kind::Float);
                (log_probs, entropy)
            }
            PolicyHead::Beta { .. } => {
                let (alpha, beta) = self.beta_params(&actor_out);
                (Self::beta_log_prob(&alpha, &beta, actions), Self::beta_entropy(&alpha, &beta))
            }
        };
        Evaluation { log_probs, entropy, values }
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    fn head(&self) -> PolicyHead {
        self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(batch: i64, dim: i64) -> Tensor {
        Tensor::randn([batch, dim], (Kind::Float, Device::Cpu))
    }

    fn scalar(t: &Tensor) -> f64 {
        f64::try_from(t).unwrap()
    }

    #[test]
    fn test_forward_pass() {
        let policy = MlpPolicy::new(4, PolicyHead::Categorical { n: 2 }, Device::Cpu);
        let (logits, values) = policy.forward(&obs(8, 4));

        assert_eq!(logits.size(), vec![8, 2]);
        assert_eq!(values.size(), vec![8]);
    }

    #[test]
    fn test_categorical_act_and_evaluate_agree() {
        let policy = MlpPolicy::new(4, PolicyHead::Categorical { n: 3 }, Device::Cpu);
        let o = obs(16, 4);

        let out = policy.act(&o, false);
        assert_eq!(out.actions.size(), vec![16]);
        assert_eq!(out.actions.kind(), Kind::Int64);
        let actions: Vec<i64> = Vec::try_from(&out.actions).unwrap();
        assert!(actions.iter().all(|&a| (0..3).contains(&a)));

        let eval = policy.evaluate(&o, &out.actions);
        assert_eq!(eval.entropy.size(), vec![16]);
        assert!(scalar(&(&eval.log_probs - &out.log_probs).abs().max()) < 1e-5);
        // entropy of a 3-way categorical lies in [0, ln 3]
        assert!(scalar(&eval.entropy.min()) >= 0.0);
        assert!(scalar(&eval.entropy.max()) <= 3f64.ln() + 1e-5);
    }

    #[test]
    fn test_deterministic_act_is_repeatable() {
        for head in [
            PolicyHead::Categorical { n: 4 },
            PolicyHead::Gaussian { dim: 2 },
            PolicyHead::Beta { dim: 2 },
        ] {
            let policy = MlpPolicy::new(3, head, Device::Cpu);
            let o = obs(5, 3);
            let a = policy.act(&o, true).actions;
            let b = policy.act(&o, true).actions;
            assert!(a.equal(&b), "{head:?}");
        }
    }

    #[test]
    fn test_gaussian_log_prob_at_mean() {
        let policy = MlpPolicy::new(3, PolicyHead::Gaussian { dim: 2 }, Device::Cpu);
        let o = obs(4, 3);
        let out = policy.act(&o, true);
        assert_eq!(out.actions.size(), vec![4, 2]);

        // log_std starts at 0: density at the mean is -dim * ln(sqrt(2 pi))
        let expected = -2.0 * 0.5 * (2.0 * PI).ln();
        let lp: Vec<f32> = Vec::try_from(&out.log_probs).unwrap();
        assert!(lp.iter().all(|&l| (l as f64 - expected).abs() < 1e-5));

        let eval = policy.evaluate(&o, &out.actions);
        let entropy: Vec<f32> = Vec::try_from(&eval.entropy).unwrap();
        let expected_entropy = 2.0 * (0.5 + 0.5 * (2.0 * PI).ln());
        assert!(entropy.iter().all(|&h| (h as f64 - expected_entropy).abs() < 1e-5));
    }

    #[test]
    fn test_beta_actions_are_bounded() {
        let policy = MlpPolicy::new(3, PolicyHead::Beta { dim: 2 }, Device::Cpu);
        let o = obs(64, 3);
        let out = policy.act(&o, false);
        assert_eq!(out.actions.size(), vec![64, 2]);
        assert!(scalar(&out.actions.max()) <= 1.0);
        assert!(scalar(&out.actions.min()) >= -1.0);

        let eval = policy.evaluate(&o, &out.actions);
        assert!(scalar(&(&eval.log_probs - &out.log_probs).abs().max()) < 1e-4);
        assert!(scalar(&eval.entropy.sum(Kind::Double)).is_finite());
    }

    #[test]
    fn test_beta_deterministic_action_starts_near_center() {
        // small actor weights: both concentrations start near softplus(0) + 1
        let policy = MlpPolicy::new(2, PolicyHead::Beta { dim: 1 }, Device::Cpu);
        let out = policy.act(&Tensor::zeros([1, 2], (Kind::Float, Device::Cpu)), true);
        assert!(scalar(&out.actions.abs().max()) < 0.2);
    }

    #[test]
    fn test_gradients_flow_through_evaluate() {
        let policy = MlpPolicy::new(4, PolicyHead::Gaussian { dim: 1 }, Device::Cpu);
        let o = obs(8, 4);
        let actions = Tensor::randn([8, 1], (Kind::Float, Device::Cpu));
        let eval = policy.evaluate(&o, &actions);
        let loss = -eval.log_probs.mean(Kind::Float) + eval.values.square().mean(Kind::Float);
        loss.backward();

        let grads = policy
            .var_store()
            .trainable_variables()
            .iter()
            .filter(|v| v.grad().defined())
            .count();
        assert_eq!(grads, policy.var_store().trainable_variables().len());
    }

    #[test]
    fn test_three_layer_config() {
        let config = MlpConfig { num_layers: 3, hidden_dim: 16, ..Default::default() };
        let policy = MlpPolicy::with_config(4, PolicyHead::Categorical { n: 2 }, config, Device::Cpu);
        assert!(policy.var_store().variables().contains_key("shared.fc3.weight"));
        assert_eq!(policy.config().hidden_dim, 16);
    }
}
