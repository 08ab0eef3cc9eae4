use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::TrainError;

/// Immutable run configuration, loaded once before any training work starts.
///
/// Derived locations (`train_dir`, `valid_dir`, the CSV manifests, the
/// checkpoint and visualization directories) default to well-known paths
/// under `input_dir` and can be overridden individually.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    pub project_name: String,
    pub input_dir: PathBuf,
    #[serde(default)]
    pub train_dir: Option<PathBuf>,
    #[serde(default)]
    pub valid_dir: Option<PathBuf>,
    #[serde(default)]
    pub train_csv: Option<PathBuf>,
    #[serde(default)]
    pub valid_csv: Option<PathBuf>,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    pub num_classes: usize,
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default)]
    pub multi_gpu: bool,
    #[serde(default)]
    pub mixed_precision: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    #[serde(default = "default_drop_last")]
    pub drop_last: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default)]
    pub run_log_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_keep: Option<usize>,
    #[serde(default = "default_logfile")]
    pub logfile: PathBuf,
    #[serde(default)]
    pub loglevel: LogLevel,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl RunConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: RunConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        Self::from_path(path)
    }

    /// Checks every field and reports all violations at once. The
    /// multi-GPU/mixed-precision exclusivity is checked first and reported
    /// as its own error so callers can fail before any other work.
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.multi_gpu && self.mixed_precision {
            return Err(TrainError::conflict("multi_gpu", "mixed_precision"));
        }

        let mut errors = Vec::new();

        if self.project_name.trim().is_empty() {
            errors.push("project_name must not be empty".to_string());
        }

        if self.input_dir.as_os_str().is_empty() {
            errors.push("input_dir must not be empty".to_string());
        }

        if self.checkpoint_interval == 0 {
            errors.push("checkpoint_interval must be greater than 0".to_string());
        }

        if self.num_classes == 0 {
            errors.push("num_classes must be greater than 0".to_string());
        }

        if self.epochs == 0 {
            errors.push("epochs must be greater than 0".to_string());
        }

        if self.learning_rate <= 0.0 {
            errors.push("learning_rate must be greater than 0".to_string());
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        if let Some(0) = self.max_keep {
            errors.push("max_keep must be greater than 0".to_string());
        }

        if self.logfile.as_os_str().is_empty() {
            errors.push("logfile must not be empty".to_string());
        }

        self.scheduler.validate(self.learning_rate, &mut errors);

        if !errors.is_empty() {
            return Err(TrainError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.input_dir, base);
        for path in [
            self.train_dir.as_mut(),
            self.valid_dir.as_mut(),
            self.train_csv.as_mut(),
            self.valid_csv.as_mut(),
            self.checkpoint_dir.as_mut(),
            self.run_log_dir.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
        absolutize_in_place(&mut self.logfile, base);
    }

    pub fn train_dir(&self) -> PathBuf {
        self.train_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join("train"))
    }

    pub fn valid_dir(&self) -> PathBuf {
        self.valid_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join("val"))
    }

    pub fn train_csv(&self) -> PathBuf {
        self.train_csv
            .clone()
            .unwrap_or_else(|| self.input_dir.join("train.csv"))
    }

    pub fn valid_csv(&self) -> PathBuf {
        self.valid_csv
            .clone()
            .unwrap_or_else(|| self.input_dir.join("val.csv"))
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join("checkpoint"))
    }

    pub fn run_log_dir(&self) -> PathBuf {
        self.run_log_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join("runs"))
    }

    /// Pointer file naming the most recently published checkpoint.
    pub fn pointer_path(&self) -> PathBuf {
        self.input_dir.join("last.checkpoint")
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl Default for DeviceKind {
    fn default() -> Self {
        DeviceKind::Cpu
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Learning-rate schedule settings, stepped once per epoch with the
/// monitored validation metric.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: SchedulerStrategy,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default)]
    pub mode: MetricMode,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl SchedulerConfig {
    fn validate(&self, learning_rate: f64, errors: &mut Vec<String>) {
        match self.strategy {
            SchedulerStrategy::Off => {}
            SchedulerStrategy::ReduceOnPlateau => {
                if !(0.0 < self.factor && self.factor < 1.0) {
                    errors.push("scheduler.factor must be in (0, 1)".to_string());
                }
                if self.min_lr < 0.0 {
                    errors.push("scheduler.min_lr must be >= 0".to_string());
                }
                if self.min_lr > learning_rate {
                    errors.push("scheduler.min_lr cannot exceed learning_rate".to_string());
                }
            }
            SchedulerStrategy::StepDecay => {
                if self.step_size == 0 {
                    errors.push("scheduler.step_size must be greater than 0".to_string());
                }
                if !(0.0 < self.gamma && self.gamma < 1.0) {
                    errors.push("scheduler.gamma must be in (0, 1)".to_string());
                }
            }
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: SchedulerStrategy::default(),
            factor: default_factor(),
            patience: default_patience(),
            mode: MetricMode::default(),
            min_lr: 0.0,
            step_size: default_step_size(),
            gamma: default_gamma(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStrategy {
    Off,
    ReduceOnPlateau,
    StepDecay,
}

impl Default for SchedulerStrategy {
    fn default() -> Self {
        SchedulerStrategy::ReduceOnPlateau
    }
}

/// Direction in which the monitored metric improves.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricMode {
    Min,
    Max,
}

impl Default for MetricMode {
    fn default() -> Self {
        // Validation accuracy is the monitored metric, higher is better.
        MetricMode::Max
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_checkpoint_interval() -> usize {
    10
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_batch_size() -> usize {
    16
}

fn default_shuffle() -> bool {
    true
}

fn default_drop_last() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

fn default_logfile() -> PathBuf {
    PathBuf::from("output.log")
}

fn default_factor() -> f64 {
    0.5
}

fn default_patience() -> usize {
    5
}

fn default_step_size() -> usize {
    30
}

fn default_gamma() -> f64 {
    0.1
}
