pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod scaler;
pub mod scheduler;
pub mod sink;

pub use checkpoint::{CheckpointManager, ResumeTarget, TrainingState, CHECKPOINT_VERSION};
pub use config::{DeviceKind, LogLevel, MetricMode, RunConfig, SchedulerConfig, SchedulerStrategy};
pub use data::{Batch, BlockingDataLoader, DataLoader, InMemoryLoader};
pub use error::{Result, TrainError};
pub use executor::{Executor, ExecutorOptions, LoaderBundle, Phase, PredictionReport};
pub use logging::LogGuard;
pub use metrics::{AccuracyCounter, RunningAverage};
pub use model::{EvalOutcome, LinearClassifier, ModelStrategy, StepContext, StepOutcome};
pub use scaler::{LossScaleConfig, LossScaler};
pub use scheduler::{LrScheduler, SchedulerState};
pub use sink::ScalarSink;
