//! Rollout storage, collection and advantage estimation

pub mod collector;
pub mod gae;
pub mod rollout;
pub mod sampling;

pub use collector::{ActStep, EpisodeRecord, RolloutCollector, RolloutPolicy};
pub use gae::{AdvantageBuffer, AdvantageEstimator, ReturnsEstimator};
pub use rollout::{Rollout, Transition};
pub use sampling::minibatch_indices;
