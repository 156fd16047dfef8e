//! Policy capability and parameter snapshots
//!
//! The training core only talks to a model through [`ActorCritic`]:
//! `act` for rollouts, `evaluate` for the loss, and the parameter
//! snapshot pair used to copy weights between the training and online
//! agents. [`mlp::MlpPolicy`] is the bundled implementation.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use tch::{Device, Kind, Tensor, nn};

use crate::{
    env::{SpaceInfo, SpaceType},
    error::TrainError,
};

pub mod mlp;

/// Distribution family of the action head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyHead {
    /// Softmax over `n` discrete actions
    Categorical {
        /// Number of actions
        n: usize,
    },

    /// Unbounded diagonal Gaussian with a state-independent log-std
    Gaussian {
        /// Action dimensionality
        dim: usize,
    },

    /// Per-dimension Beta distribution rescaled to `[-1, 1]`
    Beta {
        /// Action dimensionality
        dim: usize,
    },
}

impl PolicyHead {
    /// Pick a head for an action space; `bounded` selects Beta over Gaussian
    pub fn for_action_space(space: &SpaceInfo, bounded: bool) -> Self {
        match space.dtype {
            SpaceType::Discrete(n) => PolicyHead::Categorical { n },
            SpaceType::Continuous if bounded => PolicyHead::Beta { dim: space.flat_dim() },
            SpaceType::Continuous => PolicyHead::Gaussian { dim: space.flat_dim() },
        }
    }

    /// Whether actions are discrete indices
    pub fn is_discrete(&self) -> bool {
        matches!(self, PolicyHead::Categorical { .. })
    }

    /// Number of actor outputs the head consumes
    pub fn num_outputs(&self) -> usize {
        match *self {
            PolicyHead::Categorical { n } => n,
            PolicyHead::Gaussian { dim } => dim,
            PolicyHead::Beta { dim } => 2 * dim,
        }
    }
}

/// Result of acting on a batch of observations
#[derive(Debug)]
pub struct ActOutput {
    /// `[B]` int64 for discrete heads, `[B, dim]` float otherwise
    pub actions: Tensor,
    /// `[B]`
    pub log_probs: Tensor,
    /// `[B]`
    pub values: Tensor,
}

/// Re-evaluation of stored actions under the current parameters
#[derive(Debug)]
pub struct Evaluation {
    /// `[B]`
    pub log_probs: Tensor,
    /// Per-sample entropy, `[B]`
    pub entropy: Tensor,
    /// `[B]`
    pub values: Tensor,
}

/// Policy/value model used by the training core
pub trait ActorCritic {
    /// Sample (or, when `deterministic`, pick the mode of) actions
    fn act(&self, observations: &Tensor, deterministic: bool) -> ActOutput;

    /// State values, `[B]`
    fn values(&self, observations: &Tensor) -> Tensor;

    /// Log-probability, entropy and value of given actions
    fn evaluate(&self, observations: &Tensor, actions: &Tensor) -> Evaluation;

    /// Variable store holding every parameter
    fn var_store(&self) -> &nn::VarStore;

    /// Mutable variable store
    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// Action head family
    fn head(&self) -> PolicyHead;

    /// Device the parameters live on
    fn device(&self) -> Device {
        self.var_store().device()
    }

    /// Detached CPU copy of every parameter
    fn parameters(&self) -> ParameterSnapshot {
        ParameterSnapshot::from_var_store(self.var_store())
    }

    /// Overwrite every parameter from a snapshot
    fn load_parameters(&mut self, snapshot: &ParameterSnapshot) -> Result<()> {
        snapshot.load_into(self.var_store_mut())
    }
}

/// Named, detached, CPU-resident copies of a model's parameters
///
/// A snapshot never aliases the storage it was taken from.
#[derive(Debug)]
pub struct ParameterSnapshot {
    tensors: BTreeMap<String, Tensor>,
}

impl ParameterSnapshot {
    /// Deep-copy every variable of `vs`
    pub fn from_var_store(vs: &nn::VarStore) -> Self {
        let tensors = vs
            .variables()
            .into_iter()
            .map(|(name, t)| (name, t.detach().to_device(Device::Cpu).copy()))
            .collect();
        Self { tensors }
    }

    /// Build from named tensors (e.g. read back from disk)
    pub fn from_named(named: Vec<(String, Tensor)>) -> Self {
        Self { tensors: named.into_iter().map(|(n, t)| (n, t.to_device(Device::Cpu))).collect() }
    }

    /// Copy the snapshot into `vs`
    ///
    /// Names and shapes are checked for every variable before anything is
    /// written, so a mismatch leaves `vs` untouched.
    pub fn load_into(&self, vs: &mut nn::VarStore) -> Result<()> {
        let mut variables = vs.variables();

        for (name, var) in &variables {
            let Some(src) = self.tensors.get(name) else {
                return Err(TrainError::CheckpointMismatch {
                    name: name.clone(),
                    expected: format!("{:?}", var.size()),
                    actual: "missing".to_string(),
                }
                .into());
            };
            if src.size() != var.size() {
                return Err(TrainError::CheckpointMismatch {
                    name: name.clone(),
                    expected: format!("{:?}", var.size()),
                    actual: format!("{:?}", src.size()),
                }
                .into());
            }
        }
        if let Some(extra) = self.tensors.keys().find(|name| !variables.contains_key(*name)) {
            return Err(TrainError::CheckpointMismatch {
                name: extra.clone(),
                expected: "absent".to_string(),
                actual: format!("{:?}", self.tensors[extra].size()),
            }
            .into());
        }

        tch::no_grad(|| {
            for (name, var) in variables.iter_mut() {
                var.copy_(&self.tensors[name]);
            }
        });
        Ok(())
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if the snapshot holds no tensor
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor by variable name
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Variable names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Largest element-wise absolute difference to another snapshot
    ///
    /// Fails when the two do not hold the same names and shapes.
    pub fn max_abs_diff(&self, other: &ParameterSnapshot) -> Result<f64> {
        let mut max = 0.0f64;
        for (name, t) in &self.tensors {
            let Some(o) = other.tensors.get(name).filter(|o| o.size() == t.size()) else {
                return Err(TrainError::CheckpointMismatch {
                    name: name.clone(),
                    expected: format!("{:?}", t.size()),
                    actual: format!("{:?}", other.tensors.get(name).map(Tensor::size)),
                }
                .into());
            };
            if t.numel() == 0 {
                continue;
            }
            let diff = f64::try_from(&(t - o).abs().max().to_kind(Kind::Double))?;
            max = max.max(diff);
        }
        if other.len() != self.len() {
            anyhow::bail!("snapshots hold {} and {} tensors", self.len(), other.len());
        }
        Ok(max)
    }

    /// Named tensors, for serialization
    pub fn named_tensors(&self) -> Vec<(&str, &Tensor)> {
        self.tensors.iter().map(|(n, t)| (n.as_str(), t)).collect()
    }

    /// Write the snapshot as a safetensors file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        Tensor::write_safetensors(&self.named_tensors(), path)
            .with_context(|| format!("writing parameters to {}", path.display()))?;
        Ok(())
    }

    /// Read a snapshot written by [`ParameterSnapshot::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let named = Tensor::read_safetensors(path)
            .with_context(|| format!("reading parameters from {}", path.display()))?;
        Ok(Self::from_named(named))
    }
}

/// Stack observation rows into a `[B, obs_dim]` float tensor
pub fn observations_to_tensor(observations: &[Vec<f32>], device: Device) -> Tensor {
    let obs_dim = observations.first().map_or(0, Vec::len);
    let flat: Vec<f32> = observations.iter().flatten().copied().collect();
    Tensor::from_slice(&flat).view([observations.len() as i64, obs_dim as i64]).to_device(device)
}

/// Read a tensor back as a flat `Vec<f32>`
pub fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    let flat = tensor.detach().to_device(Device::Cpu).to_kind(Kind::Float).contiguous().view([-1]);
    Ok(Vec::<f32>::try_from(&flat)?)
}
