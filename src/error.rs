//! Typed failure kinds
//!
//! Most of the crate returns `anyhow::Result`. The failures a caller may need
//! to tell apart are raised as [`TrainError`] and can be recovered with
//! `err.downcast_ref::<TrainError>()`.

use thiserror::Error;

/// Errors raised by the training pipeline
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TrainError {
    /// A batch did not have the size the receiving component expects
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// What was being checked
        what: &'static str,
        /// Expected length
        expected: usize,
        /// Observed length
        actual: usize,
    },

    /// An environment failed during `reset` or `step`
    #[error("environment {env_id} failed: {message}")]
    EnvStep {
        /// Slot index inside the pool
        env_id: usize,
        /// Rendered error chain from the environment
        message: String,
    },

    /// A loss or gradient norm was NaN or infinite
    #[error("non-finite {what} at epoch {epoch}, mini-batch {mini_batch}")]
    NonFinite {
        /// Which quantity went non-finite
        what: &'static str,
        /// PPO epoch inside the current update
        epoch: usize,
        /// Mini-batch index inside the epoch
        mini_batch: usize,
    },

    /// A checkpoint or parameter snapshot does not fit the target model
    #[error("checkpoint mismatch for `{name}`: expected {expected}, found {actual}")]
    CheckpointMismatch {
        /// Tensor name
        name: String,
        /// What the target expects
        expected: String,
        /// What the checkpoint holds
        actual: String,
    },

    /// Configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
