//! # lockstep-rl
//!
//! On-policy reinforcement learning core in Rust, on top of PyTorch via
//! tch-rs.
//!
//! A run steps a pool of environments in lockstep, records fixed-length
//! rollouts with a frozen *online* copy of the policy, estimates advantages
//! (GAE, n-step or one-step), and optimizes a separate *training* copy with
//! PPO or A2C. Parameters flow from the training copy to the online copy
//! only through explicit snapshot syncs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lockstep_rl::prelude::*;
//! # use anyhow::Result;
//! # fn run<E: Environment + Send>(make_env: impl Fn() -> E) -> Result<()> {
//! let config = TrainConfig::new().rollout_len(64).n_epoch(20).seed(7);
//!
//! let train_pool = EnvPool::new(&make_env, 8);
//! let test_pool = EnvPool::new(&make_env, 1);
//! let obs_dim = train_pool.observation_space().map_or(0, |s| s.flat_dim()) as i64;
//! let head = PolicyHead::Categorical { n: 2 };
//!
//! let mut trainer = Trainer::new(
//!     config,
//!     train_pool,
//!     test_pool,
//!     MlpPolicy::new(obs_dim, head, tch::Device::Cpu),
//!     MlpPolicy::new(obs_dim, head, tch::Device::Cpu),
//! )?;
//! for summary in trainer.train()? {
//!     println!("epoch {} eval {:?}", summary.epoch, summary.mean_eval_return);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Environment contract, batched pool and wrappers
pub mod env;

/// Policy capability, parameter snapshots and the MLP actor-critic
pub mod policy;

/// Rollout storage, collection and advantage estimation
pub mod buffer;

/// Training agents, losses, optimizer and the epoch loop
pub mod train;

/// Normalization and logging helpers
pub mod utils;

/// Typed failure kinds
pub mod error;

/// Prelude module for convenient imports
///
/// This module re-exports commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::{
        buffer::{AdvantageEstimator, ReturnsEstimator, Rollout, RolloutCollector, RolloutPolicy},
        env::{Action, ActionBatch, Environment, SpaceInfo, SpaceType, StepResult, pool::EnvPool},
        error::TrainError,
        policy::{ActorCritic, ParameterSnapshot, PolicyHead, mlp::MlpPolicy},
        train::{
            Algorithm, EpochSummary, OnlineAgent, TrainConfig, Trainer, TrainingAgent,
            TrainingStats,
        },
        utils::{Normalizer, logging::init_tracing},
    };
}

/// Current version of lockstep-rl
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
