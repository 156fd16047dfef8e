//! Training algorithms
//!
//! This module implements the PPO and A2C updates, the split between the
//! training agent and the acting (online) agent, and the epoch loop that
//! ties collection, advantage estimation and optimization together.

pub mod agent;
pub mod augment;
pub mod checkpoint;
pub mod config;
pub mod loss;
pub mod optim;
pub mod stats;
pub mod trainer;

pub use agent::{OnlineAgent, TrainingAgent};
pub use checkpoint::{Checkpoint, CheckpointState};
pub use config::{Algorithm, TrainConfig};
pub use loss::{
    compute_consistency_loss, compute_entropy_loss, compute_policy_loss, compute_value_loss,
};
pub use optim::Adam;
pub use stats::{EpochSummary, TrainingStats};
pub use trainer::{Trainer, TrainerState};
