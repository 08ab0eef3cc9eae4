use std::path::PathBuf;

use thiserror::Error;

/// Result alias for fallible operations across the crate.
pub type Result<T> = std::result::Result<T, TrainError>;

/// Error taxonomy for the training lifecycle.
///
/// `CheckpointNotFound` and `CheckpointCorrupt` are recoverable when resuming
/// a training run: the executor logs a warning and starts from scratch.
/// Everything else is fatal to the operation that raised it.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("configuration conflict: `{first}` cannot be enabled together with `{second}`")]
    ConfigConflict { first: String, second: String },

    #[error("checkpoint not found at {}", path.display())]
    CheckpointNotFound { path: PathBuf },

    #[error("checkpoint {} is unusable: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("no checkpoint recorded at {}; train before predicting", pointer.display())]
    ResumeRequired { pointer: PathBuf },

    #[error("executor initialization failed: {0}")]
    Initialization(String),

    #[error("backend operation failed: {0}")]
    Backend(String),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainError {
    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn conflict(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self::ConfigConflict {
            first: first.into(),
            second: second.into(),
        }
    }

    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::CheckpointNotFound { path: path.into() }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Whether a resume attempt may ignore this error and fall back to a
    /// fresh initialization. Only errors detected before any state is
    /// applied qualify; a failure while applying state is fatal.
    pub fn is_recoverable_on_resume(&self) -> bool {
        matches!(
            self,
            TrainError::CheckpointNotFound { .. } | TrainError::CheckpointCorrupt { .. }
        )
    }
}

impl From<toml::de::Error> for TrainError {
    fn from(value: toml::de::Error) -> Self {
        TrainError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(value: serde_json::Error) -> Self {
        TrainError::ConfigFormat(value.to_string())
    }
}
