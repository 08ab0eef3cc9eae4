//! Learning-rate schedules stepped once per epoch on the validation metric.

use serde::{Deserialize, Serialize};

use crate::config::{MetricMode, SchedulerConfig, SchedulerStrategy};
use crate::error::{Result, TrainError};

/// Per-epoch learning-rate policy.
///
/// `step` receives the monitored validation metric and returns the
/// learning rate to use for the next epoch. Implementations keep their
/// own state and expose it through `snapshot`/`restore` so a resumed run
/// continues the schedule instead of restarting it.
pub trait LrScheduler: Send {
    fn step(&mut self, metric: f64) -> f64;
    fn learning_rate(&self) -> f64;
    fn snapshot(&self) -> SchedulerState;
    fn restore(&mut self, state: &SchedulerState) -> Result<()>;
}

/// Serializable schedule progress, stored inside checkpoint records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SchedulerState {
    ReduceOnPlateau {
        learning_rate: f64,
        best: Option<f64>,
        stalled: usize,
    },
    StepDecay {
        learning_rate: f64,
        epochs_seen: usize,
    },
}

pub fn build_scheduler(
    config: &SchedulerConfig,
    base_lr: f64,
) -> Result<Option<Box<dyn LrScheduler>>> {
    match config.strategy {
        SchedulerStrategy::Off => Ok(None),
        SchedulerStrategy::ReduceOnPlateau => Ok(Some(Box::new(ReduceOnPlateau {
            learning_rate: base_lr,
            factor: config.factor,
            patience: config.patience,
            mode: config.mode,
            min_lr: config.min_lr,
            best: None,
            stalled: 0,
        }))),
        SchedulerStrategy::StepDecay => Ok(Some(Box::new(StepDecay {
            base_lr,
            learning_rate: base_lr,
            step_size: config.step_size,
            gamma: config.gamma,
            epochs_seen: 0,
        }))),
    }
}

/// Halves (by `factor`) the learning rate once the monitored metric has
/// not improved for more than `patience` consecutive epochs.
struct ReduceOnPlateau {
    learning_rate: f64,
    factor: f64,
    patience: usize,
    mode: MetricMode,
    min_lr: f64,
    best: Option<f64>,
    stalled: usize,
}

impl ReduceOnPlateau {
    fn improved(&self, metric: f64) -> bool {
        match self.best {
            None => true,
            Some(best) => match self.mode {
                MetricMode::Max => metric > best,
                MetricMode::Min => metric < best,
            },
        }
    }
}

impl LrScheduler for ReduceOnPlateau {
    fn step(&mut self, metric: f64) -> f64 {
        if self.improved(metric) {
            self.best = Some(metric);
            self.stalled = 0;
        } else {
            self.stalled += 1;
            if self.stalled > self.patience {
                self.learning_rate = (self.learning_rate * self.factor).max(self.min_lr);
                self.stalled = 0;
            }
        }
        self.learning_rate
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState::ReduceOnPlateau {
            learning_rate: self.learning_rate,
            best: self.best,
            stalled: self.stalled,
        }
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<()> {
        match state {
            SchedulerState::ReduceOnPlateau {
                learning_rate,
                best,
                stalled,
            } => {
                self.learning_rate = *learning_rate;
                self.best = *best;
                self.stalled = *stalled;
                Ok(())
            }
            other => Err(TrainError::runtime(format!(
                "scheduler state mismatch: expected reduce-on-plateau, found {other:?}"
            ))),
        }
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
struct StepDecay {
    base_lr: f64,
    learning_rate: f64,
    step_size: usize,
    gamma: f64,
    epochs_seen: usize,
}

impl LrScheduler for StepDecay {
    fn step(&mut self, _metric: f64) -> f64 {
        self.epochs_seen += 1;
        let exponent = (self.epochs_seen / self.step_size) as i32;
        self.learning_rate = self.base_lr * self.gamma.powi(exponent);
        self.learning_rate
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState::StepDecay {
            learning_rate: self.learning_rate,
            epochs_seen: self.epochs_seen,
        }
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<()> {
        match state {
            SchedulerState::StepDecay {
                learning_rate,
                epochs_seen,
            } => {
                self.learning_rate = *learning_rate;
                self.epochs_seen = *epochs_seen;
                Ok(())
            }
            other => Err(TrainError::runtime(format!(
                "scheduler state mismatch: expected step-decay, found {other:?}"
            ))),
        }
    }
}
