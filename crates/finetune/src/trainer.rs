use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Instant,
};

use candle_core::backprop::GradStore;

use crate::{
    batch::Batch,
    checkpoint::{self, load_policy_into},
    config::{TrainerKind, TrainingConfig},
    data::{BatchIter, BatchIteratorRequest, BatchSource, JsonlPreferenceSource, TextTokenizer},
    distributed::ProcessContext,
    logging::{build_sink, SampleRecord, TrackingSink},
    loss::{batch_metrics, LossOutput, Split},
    metrics::{
        format_metrics, sample_batch_count, should_checkpoint, should_evaluate, LogThrottle,
        MetricMap,
    },
    optimizer::{OptimizerConfig, TrainerOptimizer},
    policy::CausalLm,
    rank0_info, rank0_warn,
    sampling::batch_samples,
    scheduler::{LRScheduler, WarmupScheduler},
    strategy::{
        BasicStrategy, FsdpStrategy, SaveContext, ShardingStrategy, TensorParallelStrategy,
    },
    TrainingError,
};

/// Eval samples echoed to the log; the tracking sink receives all of them.
const LOGGED_SAMPLES: usize = 10;

/// Where a trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Constructed,
    Training,
    Evaluating,
    Terminated,
}

/// Training loop for one worker: evaluation cadence, gradient accumulation,
/// clipping and checkpointing, with distribution delegated to a [`ShardingStrategy`].
pub struct Trainer {
    config: TrainingConfig,
    ctx: ProcessContext,
    run_dir: PathBuf,
    policy: Box<dyn CausalLm>,
    reference: Option<Box<dyn CausalLm>>,
    tokenizer: TextTokenizer,
    train_iterator: Option<BatchIter>,
    eval_batches: Vec<Batch>,
    strategy: Box<dyn ShardingStrategy>,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    sink: Box<dyn TrackingSink>,
    log_throttle: LogThrottle,
    example_counter: usize,
    batch_counter: usize,
    phase: TrainerPhase,
}

impl Trainer {
    pub fn new(
        policy: Box<dyn CausalLm>,
        config: TrainingConfig,
        ctx: ProcessContext,
        run_dir: PathBuf,
        reference: Option<Box<dyn CausalLm>>,
    ) -> Result<Self, TrainingError> {
        Self::with_source(policy, config, ctx, run_dir, reference, &JsonlPreferenceSource)
    }

    pub fn with_source(
        mut policy: Box<dyn CausalLm>,
        config: TrainingConfig,
        ctx: ProcessContext,
        run_dir: PathBuf,
        mut reference: Option<Box<dyn CausalLm>>,
        source: &dyn BatchSource,
    ) -> Result<Self, TrainingError> {
        check_batch_layout(&config, ctx.world_size())?;

        let tokenizer_path = config.model.tokenizer_path().ok_or_else(|| {
            TrainingError::initialization(
                "model.tokenizer_name_or_path or model.name_or_path must point to a tokenizer",
            )
        })?;
        let tokenizer = TextTokenizer::from_file(&tokenizer_path)?;
        rank0_info!(ctx, path = %tokenizer_path.display(), "loaded tokenizer");

        let silent = !ctx.is_coordinator();
        let train_request = BatchIteratorRequest {
            names: config.datasets.clone(),
            split: "train".to_string(),
            shuffle: true,
            max_length: config.max_length,
            max_prompt_length: config.max_prompt_length,
            categories: config.loss.aux_categories.clone(),
            n_epochs: config.n_epochs,
            n_examples: config.n_examples,
            batch_size: config.batch_size,
            silent,
            seed: config.seed,
        };
        let train_iterator = source.get_batch_iterator(&train_request, &tokenizer)?;

        let eval_request = BatchIteratorRequest {
            split: "test".to_string(),
            n_epochs: config.n_eval_examples.is_none().then_some(1),
            n_examples: config.n_eval_examples,
            batch_size: config.eval_batch_size,
            ..train_request
        };
        let eval_batches = source
            .get_batch_iterator(&eval_request, &tokenizer)?
            .collect::<Result<Vec<_>, _>>()?;
        if eval_batches.is_empty() {
            return Err(TrainingError::initialization(
                "evaluation split produced no complete batches",
            ));
        }
        rank0_info!(ctx, batches = eval_batches.len(), "loaded eval batches");

        if let Some(archive) = &config.model.archive {
            let step = load_policy_into(&policy.parameters(), archive)?;
            rank0_info!(ctx, path = %archive.display(), step, "loaded pre-trained weights");
        }

        let strategy: Box<dyn ShardingStrategy> = match config.trainer {
            TrainerKind::BasicTrainer => Box::new(BasicStrategy::new(&ctx)),
            TrainerKind::FsdpTrainer => Box::new(FsdpStrategy::new(
                policy.as_mut(),
                reference.as_deref_mut().map(|model| model as &mut dyn CausalLm),
                &config,
                &ctx,
            )?),
            TrainerKind::TensorParallelTrainer => Box::new(TensorParallelStrategy::new(
                policy.as_ref(),
                reference.as_deref(),
                &ctx,
            )?),
        };

        let mut optimizer = TrainerOptimizer::new(
            strategy.optimizer_parameters(policy.as_ref(), &ctx),
            OptimizerConfig::from_kind(config.optimizer, config.lr),
        )?;
        strategy.release_parameters(policy.as_ref(), &ctx)?;
        let scheduler = WarmupScheduler::new(config.lr, config.warmup_steps)?;
        optimizer.set_learning_rate(scheduler.learning_rate());
        rank0_info!(
            ctx,
            optimizer = ?config.optimizer,
            lr = config.lr,
            warmup_steps = config.warmup_steps,
            strategy = strategy.name(),
            "using optimizer"
        );

        let sink = build_sink(&config.tracking, &run_dir, &ctx)?;
        let log_throttle = LogThrottle::new(config.minimum_log_interval_secs);

        Ok(Self {
            config,
            ctx,
            run_dir,
            policy,
            reference,
            tokenizer,
            train_iterator: Some(train_iterator),
            eval_batches,
            strategy,
            optimizer,
            scheduler: Box::new(scheduler),
            sink,
            log_throttle,
            example_counter: 0,
            batch_counter: 0,
            phase: TrainerPhase::Constructed,
        })
    }

    pub fn example_counter(&self) -> usize {
        self.example_counter
    }

    pub fn batch_counter(&self) -> usize {
        self.batch_counter
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn policy(&self) -> &dyn CausalLm {
        self.policy.as_ref()
    }

    pub fn reference(&self) -> Option<&dyn CausalLm> {
        self.reference.as_deref()
    }

    pub fn strategy(&self) -> &dyn ShardingStrategy {
        self.strategy.as_ref()
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Consumes the train iterator, evaluating on cadence before each step.
    pub fn train(&mut self) -> Result<(), TrainingError> {
        let Some(mut batches) = self.train_iterator.take() else {
            return Err(TrainingError::runtime("train() may only be called once"));
        };
        rank0_info!(
            self.ctx,
            strategy = self.strategy.name(),
            world_size = self.ctx.world_size(),
            "starting training"
        );

        for batch in &mut batches {
            let batch = batch?;

            if should_evaluate(
                self.example_counter,
                self.config.eval_every,
                self.config.do_first_eval,
            ) {
                let metrics = self.evaluate()?;
                if should_checkpoint(self.example_counter, self.config.eval_every) {
                    if self.config.debug {
                        rank0_info!(self.ctx, "skipping save in debug mode");
                    } else {
                        let output_dir = self
                            .run_dir
                            .join(checkpoint::step_dirname(self.example_counter));
                        rank0_info!(
                            self.ctx,
                            path = %output_dir.display(),
                            "creating checkpoint"
                        );
                        self.save(Some(&output_dir), Some(&metrics))?;
                    }
                }
            }

            self.train_step(&batch)?;
        }

        self.phase = TrainerPhase::Terminated;
        self.sink.flush()?;
        rank0_info!(
            self.ctx,
            examples = self.example_counter,
            updates = self.batch_counter,
            "training finished"
        );
        Ok(())
    }

    /// Runs every cached eval batch (and sampling, when enabled) and returns the mean metrics.
    pub fn evaluate(&mut self) -> Result<BTreeMap<String, f64>, TrainingError> {
        self.phase = TrainerPhase::Evaluating;
        rank0_info!(
            self.ctx,
            "running evaluation after {} train examples",
            self.example_counter
        );
        self.policy.set_training(false);
        self.strategy
            .gather_parameters(self.policy.as_ref(), &self.ctx)?;

        let rank = self.ctx.rank();
        let world = self.ctx.world_size();
        let device = self.policy.device().clone();

        let mut all_metrics = MetricMap::new();
        for eval_batch in &self.eval_batches {
            let local = eval_batch.slice(rank, world)?.to_device(&device)?;
            let LossOutput { metrics, .. } = batch_metrics(
                self.policy.as_ref(),
                &local,
                &self.config.loss,
                &self.ctx,
                Split::Eval,
            )?;
            all_metrics.merge(metrics);
        }

        let mut samples = Vec::new();
        if self.config.sample_during_eval {
            let (n_batches, short) =
                sample_batch_count(self.config.n_eval_model_samples, self.config.eval_batch_size);
            if short {
                rank0_warn!(
                    self.ctx,
                    n_eval_model_samples = self.config.n_eval_model_samples,
                    eval_batch_size = self.config.eval_batch_size,
                    "n_eval_model_samples < eval_batch_size; sampling from the first eval batch"
                );
            }
            for eval_batch in self.eval_batches.iter().take(n_batches) {
                let local = eval_batch.slice(rank, world)?.to_device(&device)?;
                let generated = batch_samples(
                    self.policy.as_ref(),
                    &local,
                    &self.config.loss,
                    &self.tokenizer,
                    self.config.max_length,
                    &mut self.ctx,
                )?;
                let prompts = eval_batch.text("prompt")?;
                samples.extend(prompts.iter().zip(generated).map(|(prompt, sample)| {
                    SampleRecord {
                        step: self.example_counter,
                        prompt: prompt.clone(),
                        sample,
                    }
                }));
            }
        }

        self.strategy
            .release_parameters(self.policy.as_ref(), &self.ctx)?;

        let mean_metrics = all_metrics.mean();
        rank0_info!(
            self.ctx,
            "eval after {}: {}",
            self.example_counter,
            format_metrics(&mean_metrics)
        );
        log_samples(&self.ctx, &samples);

        if self.config.tracking.enabled && self.ctx.is_coordinator() {
            self.sink.log_metrics(&mean_metrics, self.example_counter)?;
            if !samples.is_empty() {
                self.sink.log_samples(&samples)?;
            }
        }

        Ok(mean_metrics)
    }

    fn train_step(&mut self, batch: &Batch) -> Result<(), TrainingError> {
        self.phase = TrainerPhase::Training;
        self.policy.set_training(true);

        let start = Instant::now();
        self.strategy
            .gather_parameters(self.policy.as_ref(), &self.ctx)?;
        let accumulation = self.config.gradient_accumulation_steps;
        let rank = self.ctx.rank();
        let world = self.ctx.world_size();
        let device = self.policy.device().clone();
        let parameters = self.policy.parameters();

        let mut step_metrics = MetricMap::new();
        let mut accumulated: Option<GradStore> = None;
        for micro in 0..accumulation {
            let local = batch
                .slice(micro, accumulation)?
                .slice(rank, world)?
                .to_device(&device)?;
            let LossOutput { loss, metrics } = batch_metrics(
                self.policy.as_ref(),
                &local,
                &self.config.loss,
                &self.ctx,
                Split::Train,
            )?;
            let grads = loss.affine(1.0 / accumulation as f64, 0.0)?.backward()?;
            match accumulated.as_mut() {
                Some(existing) => merge_gradient_store(&parameters, existing, grads)?,
                None => accumulated = Some(grads),
            }
            step_metrics.merge(metrics);
        }
        let Some(mut grads) = accumulated else {
            return Err(TrainingError::runtime("no microbatches were processed"));
        };

        self.strategy
            .reduce_gradients(self.policy.as_ref(), &mut grads, &self.ctx)?;
        let grad_norm = self.strategy.clip_gradients(
            self.policy.as_ref(),
            &mut grads,
            self.config.max_grad_norm,
            &self.ctx,
        )?;
        self.optimizer.step(&mut grads)?;
        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        self.strategy
            .release_parameters(self.policy.as_ref(), &self.ctx)?;

        let step_time = start.elapsed().as_secs_f64().max(f64::EPSILON);
        step_metrics.push(
            "examples_per_second",
            self.config.batch_size as f64 / step_time,
        );
        step_metrics.push("grad_norm", grad_norm);

        self.batch_counter += 1;
        self.example_counter += self.config.batch_size;

        if self.log_throttle.should_log(Instant::now()) {
            let mut mean_train = step_metrics.mean();
            mean_train.insert("counters/examples".to_string(), self.example_counter as f64);
            mean_train.insert("counters/updates".to_string(), self.batch_counter as f64);
            rank0_info!(
                self.ctx,
                "train stats after {} examples: {}",
                self.example_counter,
                format_metrics(&mean_train)
            );
            if self.config.tracking.enabled && self.ctx.is_coordinator() {
                self.sink.log_metrics(&mean_train, self.example_counter)?;
            }
        } else {
            tracing::debug!(
                rank = self.ctx.rank(),
                "skipping logging after {} examples to avoid logging too frequently",
                self.example_counter
            );
        }
        Ok(())
    }

    /// Writes policy, optimizer and scheduler state, by default to `run_dir/LATEST`.
    pub fn save(
        &mut self,
        output_dir: Option<&Path>,
        metrics: Option<&BTreeMap<String, f64>>,
    ) -> Result<(), TrainingError> {
        let output_dir = output_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.run_dir.join(checkpoint::LATEST_DIRNAME));
        let empty = BTreeMap::new();
        let metrics = metrics.unwrap_or(&empty);
        self.strategy.save(
            SaveContext {
                policy: self.policy.as_ref(),
                optimizer: &self.optimizer,
                scheduler: self.scheduler.as_ref(),
                ctx: &self.ctx,
                example_counter: self.example_counter,
            },
            &output_dir,
            metrics,
        )?;
        rank0_info!(self.ctx, path = %output_dir.display(), "saved checkpoint");
        Ok(())
    }

    /// Ends this worker's participation in the process group.
    pub fn finalize(self) -> Result<(), TrainingError> {
        self.ctx.finalize()
    }
}

/// Batches must split evenly over accumulation steps and workers.
fn check_batch_layout(config: &TrainingConfig, world_size: usize) -> Result<(), TrainingError> {
    let mut errors = Vec::new();
    let per_step = config.gradient_accumulation_steps * world_size;
    if per_step == 0 || config.batch_size % per_step != 0 {
        errors.push(format!(
            "batch_size {} must be divisible by gradient_accumulation_steps * world_size ({})",
            config.batch_size, per_step
        ));
    }
    if world_size == 0 || config.eval_batch_size % world_size != 0 {
        errors.push(format!(
            "eval_batch_size {} must be divisible by world_size ({})",
            config.eval_batch_size, world_size
        ));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TrainingError::validation(errors))
    }
}

fn merge_gradient_store(
    parameters: &[(String, candle_core::Var)],
    accum: &mut GradStore,
    mut new_grads: GradStore,
) -> Result<(), TrainingError> {
    for (_, var) in parameters {
        let tensor = var.as_tensor();
        if let Some(grad) = new_grads.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}

fn log_samples(ctx: &ProcessContext, samples: &[SampleRecord]) {
    for record in samples.iter().take(LOGGED_SAMPLES) {
        rank0_info!(ctx, "policy sample: {}", record.sample);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Write},
        sync::Arc,
    };

    use parking_lot::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn config(batch_size: usize, eval_batch_size: usize, accumulation: usize) -> TrainingConfig {
        let mut config: TrainingConfig =
            serde_json::from_value(serde_json::json!({ "datasets": ["data"], "n_epochs": 1 }))
                .unwrap();
        config.batch_size = batch_size;
        config.eval_batch_size = eval_batch_size;
        config.gradient_accumulation_steps = accumulation;
        config
    }

    #[test]
    fn eval_logs_the_first_ten_samples() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let samples: Vec<SampleRecord> = (0..12)
            .map(|index| SampleRecord {
                step: 0,
                prompt: String::new(),
                sample: format!("sample-{index:02}"),
            })
            .collect();
        tracing::subscriber::with_default(subscriber, || {
            log_samples(&ProcessContext::solo(0), &samples);
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert_eq!(output.matches("policy sample:").count(), 10);
        assert!(output.contains("sample-09"));
        assert!(!output.contains("sample-10"));
    }

    #[test]
    fn batch_layout_accepts_even_splits() {
        assert!(check_batch_layout(&config(32, 16, 2), 4).is_ok());
    }

    #[test]
    fn batch_layout_rejects_uneven_splits() {
        let err = check_batch_layout(&config(30, 6, 2), 4).unwrap_err();
        match err {
            TrainingError::Validation(messages) => assert_eq!(messages.len(), 2),
            other => panic!("unexpected error {other}"),
        }
    }
}
