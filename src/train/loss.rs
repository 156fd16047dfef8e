//! Loss computation functions
//!
//! This module contains the policy, value and entropy losses used by the PPO
//! and A2C updates. Every loss is a scalar mean over the mini-batch; the
//! scalar diagnostics next to it are computed without gradient tracking.

use tch::{Kind, Tensor};

/// Compute the PPO policy loss
///
/// Returns (policy_loss, clip_fraction, approx_kl)
///
/// With `rollback_alpha == 0` this is the clipped surrogate
/// `-min(r * A, clip(r, 1 - eps, 1 + eps) * A)`. With `rollback_alpha > 0`
/// the clipped branch is replaced by a rollback line through the trust-region
/// bound with slope `-rollback_alpha`:
///
/// ```text
/// F(r) = r                                     if 1 - eps <= r <= 1 + eps
/// F(r) = -alpha * r + (1 + alpha) * (1 + eps)  if r > 1 + eps
/// F(r) = -alpha * r + (1 + alpha) * (1 - eps)  if r < 1 - eps
/// loss = -min(r * A, F(r) * A)
/// ```
///
/// # Arguments
/// * `log_probs` - Log probabilities of actions under current policy
/// * `old_log_probs` - Log probabilities of actions under the acting policy
/// * `advantages` - Computed advantages
/// * `clip_range` - Trust-region radius (epsilon); infinity disables clipping
/// * `rollback_alpha` - Rollback slope; 0 selects the hard clip
pub fn compute_policy_loss(
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    advantages: &Tensor,
    clip_range: f64,
    rollback_alpha: f64,
) -> (Tensor, f64, f64) {
    // Compute probability ratio
    let ratio = (log_probs - old_log_probs).exp();
    let upper = 1.0 + clip_range;
    let lower = 1.0 - clip_range;

    let bounded_ratio = if rollback_alpha > 0.0 {
        let above = &ratio * -rollback_alpha + (1.0 + rollback_alpha) * upper;
        let below = &ratio * -rollback_alpha + (1.0 + rollback_alpha) * lower;
        above.where_self(&ratio.gt(upper), &below.where_self(&ratio.lt(lower), &ratio))
    } else {
        ratio.clamp(lower, upper)
    };

    let surrogate = advantages * &ratio;
    let bounded_surrogate = advantages * bounded_ratio;
    let policy_loss = -surrogate.minimum(&bounded_surrogate).mean(Kind::Float);

    let (clip_fraction, approx_kl) = tch::no_grad(|| {
        // Compute fraction of samples outside the trust region
        let clip_fraction = (&ratio - 1.0).abs().gt(clip_range).to_kind(Kind::Float).mean(Kind::Float);
        // Approximate KL divergence between acting and current policy
        let approx_kl = (old_log_probs - log_probs).mean(Kind::Float);
        (scalar(&clip_fraction), scalar(&approx_kl))
    });

    (policy_loss, clip_fraction, approx_kl)
}

/// Compute value function loss with optional clipping
///
/// Returns (value_loss, explained_variance)
///
/// Without a clip radius the loss is the plain squared error. With one, the
/// prediction's deviation from `old_values` is clipped to `[-clip, clip]`
/// and the larger of the clipped and unclipped squared errors is used.
///
/// # Arguments
/// * `values` - Predicted values under current value function
/// * `old_values` - Predicted values under the acting value function
/// * `returns` - Computed returns (targets)
/// * `clip_range` - Value clipping radius, if enabled
pub fn compute_value_loss(
    values: &Tensor,
    old_values: &Tensor,
    returns: &Tensor,
    clip_range: Option<f64>,
) -> (Tensor, f64) {
    let unclipped = (values - returns).square();
    let value_loss = match clip_range {
        Some(clip) => {
            let values_clipped = old_values + (values - old_values).clamp(-clip, clip);
            let clipped = (values_clipped - returns).square();
            unclipped.maximum(&clipped).mean(Kind::Float)
        }
        None => unclipped.mean(Kind::Float),
    };

    let explained_var = tch::no_grad(|| explained_variance(values, returns));
    (value_loss, explained_var)
}

/// Compute entropy loss (negative entropy for maximization)
///
/// # Arguments
/// * `entropy` - Per-sample entropy from the policy distribution
pub fn compute_entropy_loss(entropy: &Tensor) -> Tensor {
    -entropy.mean(Kind::Float)
}

/// Vanilla policy-gradient loss `-mean(log_prob * A)`
pub fn compute_a2c_policy_loss(log_probs: &Tensor, advantages: &Tensor) -> Tensor {
    -(log_probs * advantages).mean(Kind::Float)
}

/// Consistency penalty between a batch and its augmented copy
///
/// The policy term estimates `KL(pi(.|obs) || pi(.|aug))` at the recorded
/// actions with `(r - 1) - log r`, `r = pi(a|aug) / pi(a|obs)`, which is
/// never negative. The value term is the mean squared difference of the two
/// value predictions. Outputs on the original observations are detached, so
/// only the augmented pass is pulled toward them.
pub fn compute_consistency_loss(
    log_probs: &Tensor,
    values: &Tensor,
    aug_log_probs: &Tensor,
    aug_values: &Tensor,
) -> Tensor {
    let log_ratio = aug_log_probs - log_probs.detach();
    let kl = (log_ratio.exp() - 1.0 - &log_ratio).mean(Kind::Float);
    let value = (aug_values - values.detach()).square().mean(Kind::Float);
    kl + value
}

/// `1 - Var(returns - values) / Var(returns)`, 0 when the returns are constant
pub fn explained_variance(values: &Tensor, returns: &Tensor) -> f64 {
    let var_returns = scalar(&returns.var(false));
    if var_returns <= f64::EPSILON {
        return 0.0;
    }
    1.0 - scalar(&(returns - values).var(false)) / var_returns
}

/// Read a scalar tensor, NaN if it cannot be read
pub(crate) fn scalar(t: &Tensor) -> f64 {
    f64::try_from(&t.detach().to_kind(Kind::Double)).unwrap_or(f64::NAN)
}
