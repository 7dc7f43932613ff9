mod common;

use std::fs;

use anyhow::Result;
use finetune::{
    checkpoint::{self, read_envelope, read_envelope_header},
    OptimizerState, ProcessContext, SchedulerState, Trainer, TrainerPhase, TrainingError,
};
use serde_json::json;
use tempfile::tempdir;

use common::{build_policy, init_tracing, setup};

#[test]
fn single_worker_run_writes_checkpoints_and_tracking() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = setup(
        dir.path(),
        json!({
            "eval_every": 4,
            "n_examples": 84,
            "tracking": { "enabled": true }
        }),
    )?;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;

    let mut trainer = Trainer::new(
        Box::new(policy),
        config,
        ProcessContext::solo(3),
        run_dir.clone(),
        None,
    )?;
    assert_eq!(trainer.phase(), TrainerPhase::Constructed);
    trainer.train()?;
    assert_eq!(trainer.phase(), TrainerPhase::Terminated);
    assert_eq!(trainer.example_counter(), 84);
    assert_eq!(trainer.batch_counter(), 21);

    let step_dir = run_dir.join(checkpoint::step_dirname(80));
    let (step, metrics) = read_envelope_header(&step_dir.join(checkpoint::POLICY_FILENAME))?;
    assert_eq!(step, 80);
    assert!(metrics.contains_key("loss/eval"));

    trainer.save(None, None)?;
    let latest = run_dir.join(checkpoint::LATEST_DIRNAME);
    for name in [
        checkpoint::POLICY_FILENAME,
        checkpoint::OPTIMIZER_FILENAME,
        checkpoint::SCHEDULER_FILENAME,
    ] {
        let (step, _) = read_envelope_header(&latest.join(name))?;
        assert_eq!(step, 84, "{name}");
    }
    let scheduler = read_envelope::<SchedulerState>(&latest.join(checkpoint::SCHEDULER_FILENAME))?;
    assert_eq!(scheduler.state.step, 21);

    let samples = fs::read_to_string(run_dir.join("samples.jsonl"))?;
    let first: serde_json::Value = serde_json::from_str(
        samples
            .lines()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no samples written"))?,
    )?;
    assert_eq!(first["step"], 0);
    assert!(first["prompt"].is_string());
    assert!(first["sample"].is_string());

    let events = fs::read_dir(run_dir.join("tensorboard"))?.count();
    assert_eq!(events, 1);

    trainer.finalize()?;
    Ok(())
}

#[test]
fn debug_mode_skips_interval_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let config = setup(
        dir.path(),
        json!({ "eval_every": 4, "n_examples": 84, "debug": true, "sample_during_eval": false }),
    )?;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;
    let mut trainer = Trainer::new(
        Box::new(policy),
        config,
        ProcessContext::solo(3),
        run_dir.clone(),
        None,
    )?;
    trainer.train()?;

    assert_eq!(trainer.example_counter(), 84);
    assert!(!run_dir.join(checkpoint::step_dirname(80)).exists());
    Ok(())
}

#[test]
fn evaluate_reports_eval_metrics() -> Result<()> {
    let dir = tempdir()?;
    let config = setup(dir.path(), json!({ "sample_during_eval": false }))?;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;
    let mut trainer = Trainer::new(
        Box::new(policy),
        config,
        ProcessContext::solo(3),
        run_dir,
        None,
    )?;

    let metrics = trainer.evaluate()?;
    assert_eq!(trainer.phase(), TrainerPhase::Evaluating);
    for name in [
        "loss/eval",
        "logps_eval/chosen",
        "logps_eval/rejected",
        "logps_eval/random",
        "logps_eval/paraphrase",
        "logps_eval/variant",
        "logps_eval/nonresponse",
    ] {
        let value = metrics
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("missing metric {name}"))?;
        assert!(value.is_finite(), "{name} = {value}");
    }
    assert!(metrics["logps_eval/chosen"] <= 0.0);
    assert!((metrics["loss/eval"] + metrics["logps_eval/chosen"]).abs() < 1e-4);
    Ok(())
}

#[test]
fn train_may_only_run_once() -> Result<()> {
    let dir = tempdir()?;
    let config = setup(dir.path(), json!({ "sample_during_eval": false }))?;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;
    let mut trainer = Trainer::new(
        Box::new(policy),
        config,
        ProcessContext::solo(3),
        run_dir,
        None,
    )?;
    trainer.train()?;
    assert!(matches!(trainer.train(), Err(TrainingError::Runtime(_))));
    Ok(())
}

#[test]
fn archive_restores_saved_policy() -> Result<()> {
    let dir = tempdir()?;
    let config = setup(dir.path(), json!({ "sample_during_eval": false }))?;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;
    let mut trainer = Trainer::new(
        Box::new(policy),
        config.clone(),
        ProcessContext::solo(3),
        run_dir.clone(),
        None,
    )?;
    trainer.train()?;
    trainer.save(None, None)?;
    let trained: Vec<Vec<f32>> = trainer
        .policy()
        .parameters()
        .iter()
        .map(|(_, var)| var.as_tensor().flatten_all()?.to_vec1::<f32>())
        .collect::<candle_core::Result<_>>()?;

    let mut warm = config;
    warm.model.archive = Some(
        run_dir
            .join(checkpoint::LATEST_DIRNAME)
            .join(checkpoint::POLICY_FILENAME),
    );
    warm.exp_name = "warm-start".to_string();
    let policy = build_policy(&warm)?;
    let run_dir = warm.run_dir();
    let restored = Trainer::new(
        Box::new(policy),
        warm,
        ProcessContext::solo(3),
        run_dir,
        None,
    )?;
    let loaded: Vec<Vec<f32>> = restored
        .policy()
        .parameters()
        .iter()
        .map(|(_, var)| var.as_tensor().flatten_all()?.to_vec1::<f32>())
        .collect::<candle_core::Result<_>>()?;
    assert_eq!(trained, loaded);
    Ok(())
}

#[test]
fn optimizer_checkpoint_covers_every_parameter() -> Result<()> {
    let dir = tempdir()?;
    let config = setup(dir.path(), json!({ "sample_during_eval": false }))?;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;
    let n_params = policy.parameters().len();
    let mut trainer = Trainer::new(
        Box::new(policy),
        config,
        ProcessContext::solo(3),
        run_dir.clone(),
        None,
    )?;
    trainer.train()?;
    trainer.save(None, None)?;

    let optimizer = read_envelope::<OptimizerState>(
        &run_dir
            .join(checkpoint::LATEST_DIRNAME)
            .join(checkpoint::OPTIMIZER_FILENAME),
    )?;
    assert_eq!(optimizer.state.parameters.len(), n_params);
    assert_eq!(optimizer.state.step, 4);
    Ok(())
}

#[test]
fn preference_loss_is_not_implemented() -> Result<()> {
    let dir = tempdir()?;
    let config = setup(
        dir.path(),
        json!({ "loss": { "name": "dpo" }, "sample_during_eval": false }),
    )?;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;
    let reference = build_policy(&config)?;
    let mut trainer = Trainer::new(
        Box::new(policy),
        config,
        ProcessContext::solo(3),
        run_dir,
        Some(Box::new(reference)),
    )?;
    assert!(matches!(
        trainer.evaluate(),
        Err(TrainingError::NotImplemented(_))
    ));
    Ok(())
}

#[test]
fn fsdp_without_block_name_fails_construction() -> Result<()> {
    let dir = tempdir()?;
    let mut config = setup(dir.path(), json!({}))?;
    config.trainer = finetune::TrainerKind::FsdpTrainer;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;
    let result = Trainer::new(
        Box::new(policy),
        config,
        ProcessContext::solo(3),
        run_dir,
        None,
    );
    assert!(matches!(result, Err(TrainingError::Initialization(_))));
    Ok(())
}

#[test]
fn fsdp_bfloat16_compute_trains_on_cpu() -> Result<()> {
    let dir = tempdir()?;
    let config = setup(
        dir.path(),
        json!({
            "trainer": "FSDPTrainer",
            "sample_during_eval": false,
            "model": { "block_name": "DecoderBlock", "fsdp_policy_mp": "bfloat16" }
        }),
    )?;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;
    let mut trainer = Trainer::new(
        Box::new(policy),
        config,
        ProcessContext::solo(3),
        run_dir,
        None,
    )?;
    trainer.train()?;
    assert_eq!(trainer.example_counter(), 16);

    let metrics = trainer.evaluate()?;
    assert!(metrics["loss/eval"].is_finite());
    Ok(())
}

#[test]
fn uneven_batch_layout_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let config = setup(
        dir.path(),
        json!({ "batch_size": 6, "gradient_accumulation_steps": 4 }),
    )?;
    let run_dir = config.run_dir();
    let policy = build_policy(&config)?;
    let result = Trainer::new(
        Box::new(policy),
        config,
        ProcessContext::solo(3),
        run_dir,
        None,
    );
    assert!(matches!(result, Err(TrainingError::Validation(_))));
    Ok(())
}
