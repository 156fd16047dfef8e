//! Saving a run and resuming it in a fresh trainer

mod common;

use common::{corridor_trainer, small_config};
use lockstep_rl::{
    policy::{PolicyHead, mlp::{MlpConfig, MlpPolicy}},
    prelude::*,
    train::checkpoint::{OPTIMIZER_FILE, PARAMETERS_FILE, STATE_FILE},
};
use tch::Device;

#[test]
fn test_resume_restores_everything() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config().normalize_obs(true).normalize_reward(true);

    let mut original = corridor_trainer(config.clone()).unwrap();
    original.train().unwrap();
    original.save_checkpoint(dir.path()).unwrap();
    for file in [PARAMETERS_FILE, OPTIMIZER_FILE, STATE_FILE] {
        assert!(dir.path().join(file).exists());
    }

    let mut resumed = corridor_trainer(config.seed(99)).unwrap();
    resumed.load_checkpoint(dir.path()).unwrap();

    let params = original.training().parameters();
    assert_eq!(resumed.training().parameters().max_abs_diff(&params).unwrap(), 0.0);
    assert_eq!(resumed.online().parameters().max_abs_diff(&params).unwrap(), 0.0);
    assert_eq!(resumed.state(), original.state());
    assert_eq!(resumed.normalizer(), original.normalizer());
    assert_eq!(
        resumed.training().optimizer().step_count(),
        original.training().optimizer().step_count()
    );
    assert_eq!(resumed.training().updates(), original.training().updates());

    // the resumed run continues from the restored counters
    resumed.train_step().unwrap();
    assert_eq!(resumed.state().updates, original.state().updates + 1);
}

#[test]
fn test_periodic_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config().n_epoch(3).checkpoint(dir.path(), 2);

    let mut trainer = corridor_trainer(config).unwrap();
    trainer.train().unwrap();

    assert!(dir.path().join("epoch_2").join(STATE_FILE).exists());
    assert!(!dir.path().join("epoch_1").exists());
    assert!(!dir.path().join("epoch_3").exists());
}

#[test]
fn test_incompatible_architecture_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = corridor_trainer(small_config()).unwrap();
    trainer.save_checkpoint(dir.path()).unwrap();

    let head = PolicyHead::Categorical { n: 2 };
    let wide = MlpConfig { hidden_dim: 32, ..MlpConfig::default() };
    let mut other = Trainer::new(
        small_config(),
        EnvPool::new(|| common::Corridor::new(5), 2),
        EnvPool::new(|| common::Corridor::new(5), 1),
        MlpPolicy::with_config(2, head, wide.clone(), Device::Cpu),
        MlpPolicy::with_config(2, head, wide, Device::Cpu),
    )
    .unwrap();
    let before = other.training().parameters();

    let err = other.load_checkpoint(dir.path()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::CheckpointMismatch { .. })
    ));
    assert_eq!(other.training().parameters().max_abs_diff(&before).unwrap(), 0.0);
}

#[test]
fn test_normalizer_layout_must_match() {
    let dir = tempfile::tempdir().unwrap();
    let trainer = corridor_trainer(small_config().normalize_obs(true)).unwrap();
    trainer.save_checkpoint(dir.path()).unwrap();

    let mut plain = corridor_trainer(small_config()).unwrap();
    assert!(plain.load_checkpoint(dir.path()).is_err());
}
