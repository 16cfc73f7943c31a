use std::{fs, path::Path};

use anyhow::Result;
use distill::{
    checkpoint::{latest_checkpoint, load_checkpoint},
    config::{CheckpointConfig, Precision},
    DistillConfig, Trainer,
};
use tempfile::tempdir;

fn tiny_config(base: &Path) -> DistillConfig {
    let mut config = DistillConfig::default();
    config.model.hidden_size = 16;
    config.model.num_attention_heads = 2;
    config.model.sequence_length = 8;

    config.perlin.k = 2;
    config.perlin.attention_predictor_length = 8;
    config.perlin.v_eye_length = 8;
    config.perlin.predictor_dropout = 0.0;

    config.data.batch_size = 2;
    config.data.gradient_accumulation_steps = 2;
    config.data.batches_per_epoch = 64;
    config.data.validation_batches = 2;

    config.optimizer.learning_rate = 1e-3;
    config.optimizer.max_grad_norm = Some(1.0);

    config.runtime.seed = 11;
    config.runtime.precision = Precision::Fp32;
    config.runtime.max_steps = Some(4);
    config.runtime.log_every_n_steps = 1;
    config.runtime.evaluation.every_n_steps = Some(2);
    config.runtime.evaluation.max_batches = Some(1);
    config.runtime.logging.enable_stdout = false;
    config.runtime.logging.tensorboard = Some(base.join("tensorboard"));
    config.runtime.checkpoint = Some(CheckpointConfig {
        directory: base.join("checkpoints"),
        every_n_steps: 2,
        max_keep: Some(1),
    });
    config
}

#[test]
fn smoke_distillation_checkpoint_resume() -> Result<()> {
    let tmp = tempdir()?;
    let config = tiny_config(tmp.path());

    let mut trainer = Trainer::new(config.clone())?;
    trainer.train()?;
    assert_eq!(trainer.optimizer_steps(), 4);
    // Four optimizer steps at two micro-batches each.
    assert_eq!(trainer.progress().global_step, 8);

    let checkpoints = tmp.path().join("checkpoints");
    let kept = fs::read_dir(&checkpoints)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("step_"))
        .count();
    assert_eq!(kept, 1, "max_keep should prune older checkpoints");

    let latest = latest_checkpoint(&checkpoints)?.expect("checkpoint written");
    assert_eq!(latest.manifest.progress.optimizer_step, 4);
    for file in ["model.safetensors", "optimizer.json", "scaler.json", "manifest.json"] {
        assert!(latest.directory.join(file).is_file(), "missing {file}");
    }
    load_checkpoint(&latest.directory, &config)?;

    let events = fs::read_dir(tmp.path().join("tensorboard"))?.count();
    assert_eq!(events, 1);

    let mut extended = config.clone();
    extended.runtime.max_steps = Some(6);
    let mut resumed = Trainer::new(extended)?;
    let descriptor = resumed.resume_from_latest()?.expect("resume");
    assert_eq!(descriptor.manifest.progress.optimizer_step, 4);
    assert_eq!(resumed.optimizer_steps(), 4);

    let before = resumed.evaluate(Some(1))?;
    let original = trainer.evaluate(Some(1))?;
    assert!(before.context_mse.is_finite());
    assert!(
        (before.context_mse - original.context_mse).abs() < 1e-6,
        "restored weights should reproduce the trained student"
    );

    resumed.train()?;
    assert_eq!(resumed.optimizer_steps(), 6);
    Ok(())
}

#[test]
fn resume_rejects_incompatible_attention_settings() -> Result<()> {
    let tmp = tempdir()?;
    let mut config = tiny_config(tmp.path());
    config.runtime.max_steps = Some(2);
    config.runtime.evaluation.every_n_steps = None;
    config.runtime.logging.tensorboard = None;

    Trainer::new(config.clone())?.train()?;

    let mut changed = config;
    changed.perlin.k = 3;
    let mut trainer = Trainer::new(changed)?;
    assert!(trainer.resume_from_latest().is_err());
    Ok(())
}
