//! Model strategy seam between the executor and a numeric backend.

mod linear;

pub use linear::LinearClassifier;

use crate::data::Batch;
use crate::error::Result;

/// Per-step context handed to the strategy by the executor.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    /// Multiplier to apply to the loss before backpropagation.
    pub loss_scale: f64,
    pub mixed_precision: bool,
}

/// Outcome of one optimization step.
#[derive(Debug, Clone, Copy)]
pub struct StepOutcome {
    /// Mean unscaled loss over the batch.
    pub loss: f64,
    pub examples: usize,
    pub correct: usize,
    /// Scaled gradients overflowed; the parameter update was skipped.
    pub non_finite: bool,
}

/// Outcome of one evaluation step.
#[derive(Debug, Clone, Copy)]
pub struct EvalOutcome {
    pub examples: usize,
    pub correct: usize,
    /// Examples whose label appeared in the top `k` predictions, when a
    /// positive `k` was requested. Zero otherwise.
    pub top_k_correct: usize,
}

/// What the executor needs from a trainable model.
///
/// The executor owns the loop, checkpoint cadence, and metric plumbing;
/// implementations own parameters, the optimizer, and the arithmetic.
/// `train_step` must honor `StepContext::loss_scale` by scaling the loss
/// (or, equivalently, the gradients) and unscaling before the update,
/// and must skip the update and report `non_finite` when scaled
/// gradients overflow.
///
/// State blobs are opaque to the executor. `load_model_state` and
/// `load_optimizer_state` must either apply the blob fully or leave the
/// strategy untouched and return an error.
pub trait ModelStrategy: Send {
    fn train_step(&mut self, batch: &Batch, ctx: &StepContext) -> Result<StepOutcome>;

    /// Forward pass without gradient tracking or parameter mutation.
    fn eval_step(&self, batch: &Batch, top_k: usize) -> Result<EvalOutcome>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Number of devices visible to the backend.
    fn device_count(&self) -> usize {
        1
    }

    /// Spreads the model across `devices`. Strategies that cannot are
    /// free to keep running on one device.
    fn distribute(&mut self, devices: usize) -> Result<()> {
        let _ = devices;
        Ok(())
    }

    fn model_state(&self) -> Result<Vec<u8>>;

    fn load_model_state(&mut self, blob: &[u8]) -> Result<()>;

    fn optimizer_state(&self) -> Result<Vec<u8>>;

    fn load_optimizer_state(&mut self, blob: &[u8]) -> Result<()>;
}
