//! Environment traits and action types
//!
//! This module defines the step/reset contract every simulated environment
//! satisfies, the per-environment [`Action`] and batched [`ActionBatch`]
//! types that flow between the policy and the environment pool, and the
//! space descriptors used to size policies.

use anyhow::Result;
use tch::{Device, Kind, Tensor};

use crate::error::TrainError;

/// Core trait for RL environments
///
/// Observations are flat `f32` vectors; image observations are flattened in
/// row-major order and described by [`SpaceInfo::shape`].
pub trait Environment {
    /// Reset the environment and return initial observation
    fn reset(&mut self) -> Result<Vec<f32>>;

    /// Step the environment with an action
    fn step(&mut self, action: &Action) -> Result<StepResult>;

    /// Get the observation space dimensions
    fn observation_space(&self) -> SpaceInfo;

    /// Get the action space dimensions
    fn action_space(&self) -> SpaceInfo;
}

/// Result of an environment step
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Next observation
    pub observation: Vec<f32>,

    /// Reward received
    pub reward: f32,

    /// Whether the episode terminated
    pub terminated: bool,

    /// Whether the episode was truncated
    pub truncated: bool,
}

impl StepResult {
    /// Whether the episode ended for any reason
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Space information for observations and actions
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceInfo {
    /// Shape of the space
    pub shape: Vec<usize>,

    /// Data type
    pub dtype: SpaceType,
}

impl SpaceInfo {
    /// Number of scalars in one flattened element of the space
    pub fn flat_dim(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Space data types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpaceType {
    /// Discrete space with n options
    Discrete(usize),

    /// Continuous space (Box)
    Continuous,
}

/// A single environment's action
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Index into a discrete action set
    Discrete(i64),

    /// Continuous action vector
    Continuous(Vec<f32>),
}

/// Actions for every environment of a pool at one time step
///
/// Continuous actions are stored flattened, `dim` scalars per environment.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionBatch {
    /// One discrete index per environment
    Discrete(Vec<i64>),

    /// `len * dim` scalars, environment-major
    Continuous {
        /// Flattened action values
        data: Vec<f32>,
        /// Action dimensionality
        dim: usize,
    },
}

impl ActionBatch {
    /// Batch holding the same action for `n` environments
    pub fn repeat(action: &Action, n: usize) -> Self {
        match action {
            Action::Discrete(a) => ActionBatch::Discrete(vec![*a; n]),
            Action::Continuous(v) => {
                ActionBatch::Continuous { data: v.repeat(n), dim: v.len() }
            }
        }
    }

    /// Number of environments covered by the batch
    pub fn len(&self) -> usize {
        match self {
            ActionBatch::Discrete(a) => a.len(),
            ActionBatch::Continuous { data, dim } => {
                if *dim == 0 {
                    0
                } else {
                    data.len() / dim
                }
            }
        }
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Action for environment `i`
    ///
    /// # Panics
    ///
    /// Panics if `i` is out of range.
    pub fn get(&self, i: usize) -> Action {
        match self {
            ActionBatch::Discrete(a) => Action::Discrete(a[i]),
            ActionBatch::Continuous { data, dim } => {
                Action::Continuous(data[i * dim..(i + 1) * dim].to_vec())
            }
        }
    }

    /// Concatenate batches along the environment axis
    ///
    /// Used to flatten a time-major rollout into one `[T * N]` sample set.
    pub fn concat(batches: &[ActionBatch]) -> Result<ActionBatch> {
        let Some(first) = batches.first() else {
            return Ok(ActionBatch::Discrete(Vec::new()));
        };
        match first {
            ActionBatch::Discrete(_) => {
                let mut out = Vec::new();
                for batch in batches {
                    match batch {
                        ActionBatch::Discrete(a) => out.extend_from_slice(a),
                        ActionBatch::Continuous { .. } => {
                            anyhow::bail!("cannot mix discrete and continuous action batches")
                        }
                    }
                }
                Ok(ActionBatch::Discrete(out))
            }
            ActionBatch::Continuous { dim, .. } => {
                let dim = *dim;
                let mut out = Vec::new();
                for batch in batches {
                    match batch {
                        ActionBatch::Continuous { data, dim: d } if *d == dim => {
                            out.extend_from_slice(data)
                        }
                        ActionBatch::Continuous { dim: d, .. } => {
                            return Err(TrainError::ShapeMismatch {
                                what: "continuous action dimension",
                                expected: dim,
                                actual: *d,
                            }
                            .into());
                        }
                        ActionBatch::Discrete(_) => {
                            anyhow::bail!("cannot mix discrete and continuous action batches")
                        }
                    }
                }
                Ok(ActionBatch::Continuous { data: out, dim })
            }
        }
    }

    /// Convert to a tensor: `[N]` int64 for discrete, `[N, dim]` float otherwise
    pub fn to_tensor(&self, device: Device) -> Tensor {
        match self {
            ActionBatch::Discrete(a) => Tensor::from_slice(a).to_device(device),
            ActionBatch::Continuous { data, dim } => Tensor::from_slice(data)
                .view([self.len() as i64, *dim as i64])
                .to_device(device),
        }
    }

    /// Read actions back from a policy output tensor
    pub fn from_tensor(actions: &Tensor, discrete: bool) -> Result<Self> {
        let actions = actions.to_device(Device::Cpu).contiguous();
        if discrete {
            let flat = actions.to_kind(Kind::Int64).view([-1]);
            Ok(ActionBatch::Discrete(Vec::<i64>::try_from(&flat)?))
        } else {
            let size = actions.size();
            let dim = if size.len() >= 2 { size[1..].iter().product::<i64>() as usize } else { 1 };
            let flat = actions.to_kind(Kind::Float).view([-1]);
            Ok(ActionBatch::Continuous { data: Vec::<f32>::try_from(&flat)?, dim })
        }
    }
}

pub mod pool;
pub mod wrappers;
