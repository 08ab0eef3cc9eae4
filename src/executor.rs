//! Training-loop executor: owns the epoch loop, checkpoint cadence,
//! metric plumbing, and the resume handshake. The numeric work is
//! delegated to a [`ModelStrategy`].

use crate::{
    checkpoint::{load_checkpoint, CheckpointManager, ResumeTarget, TrainingState},
    config::{DeviceKind, RunConfig},
    data::{Batch, BlockingDataLoader, DataLoader},
    error::{Result, TrainError},
    metrics::{AccuracyCounter, RunningAverage},
    model::{ModelStrategy, StepContext, StepOutcome},
    scaler::LossScaler,
    scheduler::{build_scheduler, LrScheduler, SchedulerState},
    sink::ScalarSink,
};

/// Lifecycle of an executor. `build` moves `Uninitialized` to `Built`;
/// training moves through `Running` to `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Built,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorOptions {
    /// Pick up from the newest recorded checkpoint instead of starting
    /// fresh. A missing or unusable checkpoint degrades to a fresh run
    /// with a warning.
    pub resume: bool,
}

/// Loaders for each split. `test` is only required for prediction.
pub struct LoaderBundle {
    pub train: Box<dyn DataLoader>,
    pub valid: Box<dyn DataLoader>,
    pub test: Option<Box<dyn DataLoader>>,
}

#[derive(Debug, Clone)]
pub struct PredictionReport {
    pub rank1: f64,
    /// Top-5 accuracy, absent when the label space is narrower than 5.
    pub rank5: Option<f64>,
    pub examples: usize,
}

pub struct Executor<M: ModelStrategy> {
    config: RunConfig,
    phase: Phase,
    model: Option<M>,
    builder: Option<Box<dyn FnOnce(&RunConfig) -> Result<M> + Send>>,
    scheduler: Option<Box<dyn LrScheduler>>,
    scaler: LossScaler,
    checkpoints: CheckpointManager,
    sink: ScalarSink,
    train_loader: BlockingDataLoader<Box<dyn DataLoader>>,
    valid_loader: BlockingDataLoader<Box<dyn DataLoader>>,
    test_loader: Option<BlockingDataLoader<Box<dyn DataLoader>>>,
    start_epoch: usize,
    resume_target: Option<ResumeTarget>,
    restored: bool,
    loss_avg: RunningAverage,
}

impl<M: ModelStrategy> Executor<M> {
    /// Wires up an executor. The model itself is not constructed until
    /// [`build`](Self::build); `builder` runs exactly once.
    ///
    /// With `options.resume` set, the resume pointer is resolved here so
    /// the visualization sink can reopen the previous run directory and
    /// append to its plots.
    pub fn new(
        config: RunConfig,
        loaders: LoaderBundle,
        options: ExecutorOptions,
        builder: impl FnOnce(&RunConfig) -> Result<M> + Send + 'static,
    ) -> Result<Self> {
        config.validate()?;

        let checkpoints = CheckpointManager::from_config(&config);
        let resume_target = if options.resume {
            match checkpoints.latest() {
                Ok(target) => target,
                Err(err) if err.is_recoverable_on_resume() => {
                    tracing::warn!("ignoring unusable resume pointer: {err}");
                    None
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        let sink = match &resume_target {
            Some(target) => ScalarSink::open(&target.log_dir)?,
            None => ScalarSink::create(&config.run_log_dir())?,
        };

        let scaler = LossScaler::new(config.mixed_precision);

        Ok(Self {
            config,
            phase: Phase::Uninitialized,
            model: None,
            builder: Some(Box::new(builder)),
            scheduler: None,
            scaler,
            checkpoints,
            sink,
            train_loader: BlockingDataLoader::new(loaders.train),
            valid_loader: BlockingDataLoader::new(loaders.valid),
            test_loader: loaders.test.map(BlockingDataLoader::new),
            start_epoch: 1,
            resume_target,
            restored: false,
            loss_avg: RunningAverage::new(),
        })
    }

    /// Constructs the model, scheduler, and (when resuming) applies the
    /// recorded state. Idempotent: later calls are no-ops.
    pub fn build(&mut self) -> Result<()> {
        if self.phase != Phase::Uninitialized {
            return Ok(());
        }

        let Some(builder) = self.builder.take() else {
            return Err(TrainError::runtime("model builder already consumed"));
        };
        let mut model = builder(&self.config)?;
        model.set_learning_rate(self.config.learning_rate);

        if self.config.multi_gpu && self.config.device == DeviceKind::Gpu {
            let devices = model.device_count();
            if devices > 1 {
                model.distribute(devices)?;
                tracing::info!("model distributed across {devices} devices");
            } else {
                tracing::debug!("multi_gpu requested but only one device is visible");
            }
        }

        self.scheduler = build_scheduler(&self.config.scheduler, self.config.learning_rate)?;

        if let Some(target) = self.resume_target.take() {
            match self.apply_resume(&mut model, &target) {
                Ok(start_epoch) => {
                    self.start_epoch = start_epoch;
                    self.restored = true;
                    tracing::info!(
                        "resumed from {}; continuing at epoch {start_epoch}",
                        target.checkpoint.display()
                    );
                }
                Err(err) if err.is_recoverable_on_resume() => {
                    tracing::warn!("unable to resume ({err}); starting fresh");
                    self.start_epoch = 1;
                    self.restored = false;
                    self.sink = ScalarSink::create(&self.config.run_log_dir())?;
                }
                Err(err) => return Err(err),
            }
        }

        self.model = Some(model);
        self.phase = Phase::Built;
        Ok(())
    }

    fn apply_resume(&mut self, model: &mut M, target: &ResumeTarget) -> Result<usize> {
        let (state, start_epoch) = load_checkpoint(&target.checkpoint)?;

        model.load_model_state(&state.model)?;
        model.load_optimizer_state(&state.optimizer)?;

        if let Some(blob) = &state.scheduler {
            let snapshot: SchedulerState = serde_json::from_slice(blob).map_err(|err| {
                TrainError::corrupt(&target.checkpoint, format!("scheduler state: {err}"))
            })?;
            match self.scheduler.as_mut() {
                Some(scheduler) => scheduler.restore(&snapshot)?,
                None => {
                    return Err(TrainError::runtime(
                        "checkpoint includes scheduler state but scheduling is off",
                    ));
                }
            }
        }

        Ok(start_epoch)
    }

    pub fn train(&mut self) -> Result<()> {
        self.train_with_shutdown(|| false)
    }

    /// Runs the epoch loop, polling `should_stop` at epoch and batch
    /// boundaries. A stop request abandons the in-flight epoch without
    /// recording it; the previous checkpoint remains the resume point.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        self.build()?;
        self.phase = Phase::Running;
        match self.run_epochs(&mut should_stop) {
            Ok(()) => {
                self.phase = Phase::Completed;
                Ok(())
            }
            Err(err) => {
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    fn run_epochs<F>(&mut self, should_stop: &mut F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let start_epoch = self.start_epoch;
        let Self {
            config,
            model,
            scheduler,
            scaler,
            checkpoints,
            sink,
            train_loader,
            valid_loader,
            loss_avg,
            ..
        } = self;
        let Some(model) = model.as_mut() else {
            return Err(TrainError::runtime("executor has no model after build"));
        };

        let epochs = config.epochs;
        if start_epoch > epochs {
            tracing::info!("checkpoint already covers epoch {epochs}; nothing to train");
            return Ok(());
        }

        let batches_per_epoch = train_loader.len_hint();
        // loaders without a length hint get process-local step numbering
        let mut fallback_step: i64 = 0;

        'epochs: for epoch in start_epoch..=epochs {
            if should_stop() {
                tracing::info!("shutdown requested; stopping before epoch {epoch}");
                break;
            }

            model.set_training(true);
            loss_avg.reset();
            let mut train_accuracy = AccuracyCounter::new();
            train_loader.reset()?;

            let mut batch_index = 0usize;
            while let Some(batch) = train_loader.next_batch()? {
                if should_stop() {
                    tracing::info!("shutdown requested during epoch {epoch}; abandoning it");
                    break 'epochs;
                }

                let outcome = forward_backward(
                    model,
                    &batch,
                    scaler,
                    loss_avg,
                    &mut train_accuracy,
                    config.mixed_precision,
                )?;
                if outcome.non_finite {
                    tracing::debug!(
                        "non-finite gradients at epoch {epoch} batch {batch_index}; update skipped"
                    );
                }

                let step = global_step(epoch, batches_per_epoch, batch_index, fallback_step);
                sink.append("Loss/train", round4(loss_avg.value()), step);
                fallback_step += 1;
                batch_index += 1;
            }

            let validation = validation_pass(model, valid_loader, 0)?;
            let val_accuracy = validation.percent();
            sink.append("Accuracy/val", val_accuracy, epoch as i64);
            sink.append("Accuracy/train", train_accuracy.percent(), epoch as i64);

            if let Some(scheduler) = scheduler.as_mut() {
                let lr = scheduler.step(val_accuracy);
                model.set_learning_rate(lr);
            }

            let scheduler_blob = match scheduler.as_ref() {
                Some(active) => Some(serde_json::to_vec(&active.snapshot()).map_err(|err| {
                    TrainError::runtime(format!("failed to encode scheduler state: {err}"))
                })?),
                None => None,
            };
            let state = TrainingState {
                epoch,
                model: model.model_state()?,
                optimizer: model.optimizer_state()?,
                scheduler: scheduler_blob,
            };
            checkpoints.save(&state, sink)?;

            tracing::info!(
                "epoch {epoch}/{epochs}: train_loss={:.4} train_acc={:.2}% val_acc={:.2}% lr={:.5}",
                loss_avg.value(),
                train_accuracy.percent(),
                val_accuracy,
                model.learning_rate()
            );
        }

        Ok(())
    }

    /// One full pass over the validation split, reported as a percentage.
    pub fn validation_accuracy(&mut self) -> Result<f64> {
        self.build()?;
        let Self {
            model, valid_loader, ..
        } = self;
        let Some(model) = model.as_mut() else {
            return Err(TrainError::runtime("executor has no model after build"));
        };
        let counter = validation_pass(model, valid_loader, 0)?;
        Ok(counter.percent())
    }

    /// Evaluates the newest recorded checkpoint on the test split.
    ///
    /// Unlike training resume, prediction refuses to fall back to fresh
    /// weights: without a checkpoint there is nothing meaningful to
    /// score, so the caller gets `ResumeRequired`.
    pub fn predict(&mut self) -> Result<PredictionReport> {
        self.build()?;

        if !self.restored {
            let target = self
                .checkpoints
                .latest()?
                .ok_or_else(|| TrainError::ResumeRequired {
                    pointer: self.config.pointer_path(),
                })?;
            let (state, _) = load_checkpoint(&target.checkpoint)?;
            let Some(model) = self.model.as_mut() else {
                return Err(TrainError::runtime("executor has no model after build"));
            };
            model.load_model_state(&state.model)?;
            self.restored = true;
        }

        let top_k = if self.config.num_classes >= 5 { 5 } else { 0 };
        let Self {
            model, test_loader, ..
        } = self;
        let Some(model) = model.as_mut() else {
            return Err(TrainError::runtime("executor has no model after build"));
        };
        let Some(loader) = test_loader.as_mut() else {
            return Err(TrainError::initialization(
                "prediction requires a test loader",
            ));
        };

        let counter = validation_pass(model, loader, top_k)?;
        let report = PredictionReport {
            rank1: counter.percent(),
            rank5: (top_k > 0).then(|| counter.top_k_percent()),
            examples: counter.examples(),
        };
        match report.rank5 {
            Some(rank5) => tracing::info!(
                "test prediction accuracy: {:.2}% (top-5 {:.2}%) over {} examples",
                report.rank1,
                rank5,
                report.examples
            ),
            None => tracing::info!(
                "test prediction accuracy: {:.2}% over {} examples",
                report.rank1,
                report.examples
            ),
        }
        Ok(report)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Epoch the next training call will start at. Meaningful after
    /// `build`; `1` for a fresh run.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn model(&self) -> Option<&M> {
        self.model.as_ref()
    }
}

/// One optimization step plus scaler and metric bookkeeping. Overflowed
/// steps back the scale off and stay out of the running averages.
fn forward_backward<M: ModelStrategy>(
    model: &mut M,
    batch: &Batch,
    scaler: &mut LossScaler,
    loss_avg: &mut RunningAverage,
    accuracy: &mut AccuracyCounter,
    mixed_precision: bool,
) -> Result<StepOutcome> {
    let ctx = StepContext {
        loss_scale: scaler.loss_scale(),
        mixed_precision,
    };
    let outcome = model.train_step(batch, &ctx)?;
    scaler.update(outcome.non_finite);
    if !outcome.non_finite {
        if outcome.loss.is_finite() {
            loss_avg.send(outcome.loss);
        }
        accuracy.observe(outcome.correct, outcome.examples);
    }
    Ok(outcome)
}

/// Full evaluation pass. The model is switched to eval mode for the
/// duration and restored to its previous mode afterwards, even on error.
pub fn validation_pass<M: ModelStrategy>(
    model: &mut M,
    loader: &mut BlockingDataLoader<Box<dyn DataLoader>>,
    top_k: usize,
) -> Result<AccuracyCounter> {
    let was_training = model.is_training();
    model.set_training(false);

    let result = (|| {
        loader.reset()?;
        let mut counter = AccuracyCounter::new();
        while let Some(batch) = loader.next_batch()? {
            let outcome = model.eval_step(&batch, top_k)?;
            counter.observe(outcome.correct, outcome.examples);
            counter.observe_top_k(outcome.top_k_correct);
        }
        Ok(counter)
    })();

    model.set_training(was_training);
    result
}

fn global_step(
    epoch: usize,
    batches_per_epoch: Option<usize>,
    batch_index: usize,
    fallback: i64,
) -> i64 {
    match batches_per_epoch {
        Some(len) => ((epoch - 1) * len + batch_index) as i64,
        None => fallback,
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
