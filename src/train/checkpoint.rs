//! Checkpoint files
//!
//! A checkpoint is a directory holding three files:
//!
//! - `training.safetensors`: the training agent's parameters
//! - `optimizer.safetensors`: Adam moment tensors
//! - `state.json`: trainer counters, normalizer statistics, the optimizer step
//!   count and the configuration the run was started with

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tch::Tensor;
use tracing::info;

use crate::{policy::ParameterSnapshot, train::trainer::TrainerState, utils::Normalizer};

/// Parameter file name inside a checkpoint directory
pub const PARAMETERS_FILE: &str = "training.safetensors";

/// Optimizer moments file name inside a checkpoint directory
pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";

/// Counters and statistics file name inside a checkpoint directory
pub const STATE_FILE: &str = "state.json";

/// Everything in `state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Crate version that wrote the checkpoint
    pub version: String,
    /// Trainer counters
    pub trainer: TrainerState,
    /// Adam step count
    pub optimizer_step: u64,
    /// Running observation/reward statistics
    pub normalizer: Normalizer,
    /// Training configuration as JSON (non-finite numbers are written as null)
    pub config: serde_json::Value,
}

/// In-memory form of a checkpoint directory
#[derive(Debug)]
pub struct Checkpoint {
    /// Training agent parameters
    pub parameters: ParameterSnapshot,
    /// Adam moments keyed `exp_avg.<var>` / `exp_avg_sq.<var>`
    pub optimizer: Vec<(String, Tensor)>,
    /// Counters and statistics
    pub state: CheckpointState,
}

impl Checkpoint {
    /// Write the checkpoint into `dir`, creating it if needed
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;

        self.parameters.save(dir.join(PARAMETERS_FILE))?;

        let optimizer_path = dir.join(OPTIMIZER_FILE);
        Tensor::write_safetensors(&self.optimizer, &optimizer_path)
            .with_context(|| format!("writing optimizer state to {}", optimizer_path.display()))?;

        let state_path = dir.join(STATE_FILE);
        let json = serde_json::to_string_pretty(&self.state)?;
        fs::write(&state_path, json)
            .with_context(|| format!("writing {}", state_path.display()))?;

        info!(
            dir = %dir.display(),
            epoch = self.state.trainer.epoch,
            updates = self.state.trainer.updates,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Read a checkpoint written by [`Checkpoint::save`]
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let parameters = ParameterSnapshot::load(dir.join(PARAMETERS_FILE))?;

        let optimizer_path = dir.join(OPTIMIZER_FILE);
        let optimizer = Tensor::read_safetensors(&optimizer_path)
            .with_context(|| format!("reading optimizer state from {}", optimizer_path.display()))?;

        let state_path = dir.join(STATE_FILE);
        let json = fs::read_to_string(&state_path)
            .with_context(|| format!("reading {}", state_path.display()))?;
        let state: CheckpointState = serde_json::from_str(&json)
            .with_context(|| format!("parsing {}", state_path.display()))?;

        info!(dir = %dir.display(), epoch = state.trainer.epoch, "checkpoint loaded");
        Ok(Self { parameters, optimizer, state })
    }
}

#[cfg(test)]
mod tests {
    use tch::{Device, Kind};

    use super::*;

    fn checkpoint() -> Checkpoint {
        let w = Tensor::from_slice(&[1.0f32, -2.0, 3.5]);
        let mut normalizer = Normalizer::new(2, true, false, 1e-8);
        normalizer.observations(&[vec![1.0, 2.0], vec![3.0, 4.0]], true).unwrap();

        Checkpoint {
            parameters: ParameterSnapshot::from_named(vec![("fc.weight".to_string(), w)]),
            optimizer: vec![
                ("exp_avg.fc.weight".to_string(), Tensor::ones([3], (Kind::Float, Device::Cpu))),
                ("exp_avg_sq.fc.weight".to_string(), Tensor::zeros([3], (Kind::Float, Device::Cpu))),
            ],
            state: CheckpointState {
                version: crate::VERSION.to_string(),
                trainer: TrainerState { epoch: 3, global_step: 1200, updates: 30, episodes: 17 },
                optimizer_step: 120,
                normalizer,
                config: serde_json::json!({ "gamma": 0.99, "ppo_epsilon": null }),
            },
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ckpt");
        let original = checkpoint();
        original.save(&path).unwrap();

        for file in [PARAMETERS_FILE, OPTIMIZER_FILE, STATE_FILE] {
            assert!(path.join(file).exists(), "{file} missing");
        }

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.state, original.state);
        assert_eq!(loaded.parameters.max_abs_diff(&original.parameters).unwrap(), 0.0);
        assert_eq!(loaded.optimizer.len(), 2);
    }

    #[test]
    fn test_load_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::load(dir.path().join("absent")).is_err());
    }
}
