//! Utility functions and helpers

pub mod logging;
pub mod normalize;

pub use normalize::{Normalizer, RunningMeanStd};
