use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::Batch;
use crate::error::{Result, TrainError};
use crate::model::{EvalOutcome, ModelStrategy, StepContext, StepOutcome};

const MOMENTUM: f32 = 0.9;
const WEIGHT_DECAY: f32 = 5e-4;

/// Softmax regression trained with SGD plus momentum and weight decay.
///
/// Small enough to run in tests, yet it exercises every part of the
/// strategy contract: loss scaling, overflow reporting, train/eval
/// modes, and opaque state blobs.
pub struct LinearClassifier {
    num_classes: usize,
    feature_dim: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
    velocity_w: Vec<f32>,
    velocity_b: Vec<f32>,
    learning_rate: f64,
    training: bool,
}

#[derive(Serialize, Deserialize)]
struct ModelState {
    num_classes: usize,
    feature_dim: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct OptimizerState {
    learning_rate: f64,
    velocity_w: Vec<f32>,
    velocity_b: Vec<f32>,
}

impl LinearClassifier {
    pub fn new(
        num_classes: usize,
        feature_dim: usize,
        learning_rate: f64,
        seed: u64,
    ) -> Result<Self> {
        if num_classes < 2 {
            return Err(TrainError::initialization(
                "a classifier needs at least two classes",
            ));
        }
        if feature_dim == 0 {
            return Err(TrainError::initialization(
                "feature_dim must be greater than zero",
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let scale = (1.0 / feature_dim as f32).sqrt();
        let weights = (0..num_classes * feature_dim)
            .map(|_| rng.gen_range(-scale..scale))
            .collect();

        Ok(Self {
            num_classes,
            feature_dim,
            weights,
            bias: vec![0.0; num_classes],
            velocity_w: vec![0.0; num_classes * feature_dim],
            velocity_b: vec![0.0; num_classes],
            learning_rate,
            training: true,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn logits(&self, input: &[f32]) -> Vec<f32> {
        let mut logits = self.bias.clone();
        for (class, logit) in logits.iter_mut().enumerate() {
            let row = &self.weights[class * self.feature_dim..(class + 1) * self.feature_dim];
            *logit += row
                .iter()
                .zip(input)
                .map(|(w, x)| w * x)
                .sum::<f32>();
        }
        logits
    }

    fn check_batch(&self, batch: &Batch) -> Result<()> {
        if batch.feature_dim != self.feature_dim {
            return Err(TrainError::backend(format!(
                "batch feature_dim {} does not match model feature_dim {}",
                batch.feature_dim, self.feature_dim
            )));
        }
        if batch.inputs.len() != batch.examples * batch.feature_dim
            || batch.labels.len() != batch.examples
        {
            return Err(TrainError::backend("batch geometry is inconsistent"));
        }
        for &label in &batch.labels {
            if label as usize >= self.num_classes {
                return Err(TrainError::backend(format!(
                    "label {} out of range for {} classes",
                    label, self.num_classes
                )));
            }
        }
        Ok(())
    }
}

impl ModelStrategy for LinearClassifier {
    fn train_step(&mut self, batch: &Batch, ctx: &StepContext) -> Result<StepOutcome> {
        self.check_batch(batch)?;

        let scale = ctx.loss_scale as f32;
        let batch_weight = scale / batch.examples as f32;
        let mut grad_w = vec![0.0f32; self.weights.len()];
        let mut grad_b = vec![0.0f32; self.bias.len()];
        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;

        for k in 0..batch.examples {
            let input = &batch.inputs[k * self.feature_dim..(k + 1) * self.feature_dim];
            let label = batch.labels[k] as usize;
            let logits = self.logits(input);

            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
            let denom: f32 = exps.iter().sum();
            loss_sum += f64::from(denom.ln() - (logits[label] - max));

            let argmax = logits
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, _)| idx);
            if argmax == Some(label) {
                correct += 1;
            }

            // dlogits = softmax - one_hot, pre-scaled by the loss scale
            for class in 0..self.num_classes {
                let mut dlogit = exps[class] / denom;
                if class == label {
                    dlogit -= 1.0;
                }
                dlogit *= batch_weight;
                grad_b[class] += dlogit;
                let row = &mut grad_w[class * self.feature_dim..(class + 1) * self.feature_dim];
                for (g, x) in row.iter_mut().zip(input) {
                    *g += dlogit * x;
                }
            }
        }

        let loss = loss_sum / batch.examples as f64;
        let finite = grad_w.iter().all(|g| g.is_finite()) && grad_b.iter().all(|g| g.is_finite());
        if !finite {
            return Ok(StepOutcome {
                loss,
                examples: batch.examples,
                correct,
                non_finite: true,
            });
        }

        // unscale, then v = momentum * v + (g + decay * w); w -= lr * v
        let inv_scale = 1.0 / scale;
        let lr = self.learning_rate as f32;
        for i in 0..self.weights.len() {
            let g = grad_w[i] * inv_scale + WEIGHT_DECAY * self.weights[i];
            self.velocity_w[i] = MOMENTUM * self.velocity_w[i] + g;
            self.weights[i] -= lr * self.velocity_w[i];
        }
        for i in 0..self.bias.len() {
            let g = grad_b[i] * inv_scale + WEIGHT_DECAY * self.bias[i];
            self.velocity_b[i] = MOMENTUM * self.velocity_b[i] + g;
            self.bias[i] -= lr * self.velocity_b[i];
        }

        Ok(StepOutcome {
            loss,
            examples: batch.examples,
            correct,
            non_finite: false,
        })
    }

    fn eval_step(&self, batch: &Batch, top_k: usize) -> Result<EvalOutcome> {
        self.check_batch(batch)?;

        let mut correct = 0usize;
        let mut top_k_correct = 0usize;
        for k in 0..batch.examples {
            let input = &batch.inputs[k * self.feature_dim..(k + 1) * self.feature_dim];
            let label = batch.labels[k] as usize;
            let logits = self.logits(input);

            let argmax = logits
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, _)| idx);
            if argmax == Some(label) {
                correct += 1;
            }

            if top_k > 0 {
                let better = logits
                    .iter()
                    .filter(|&&l| l.total_cmp(&logits[label]).is_gt())
                    .count();
                if better < top_k {
                    top_k_correct += 1;
                }
            }
        }

        Ok(EvalOutcome {
            examples: batch.examples,
            correct,
            top_k_correct,
        })
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn model_state(&self) -> Result<Vec<u8>> {
        let state = ModelState {
            num_classes: self.num_classes,
            feature_dim: self.feature_dim,
            weights: self.weights.clone(),
            bias: self.bias.clone(),
        };
        bincode::serialize(&state)
            .map_err(|err| TrainError::backend(format!("failed to serialize model state: {err}")))
    }

    fn load_model_state(&mut self, blob: &[u8]) -> Result<()> {
        let state: ModelState = bincode::deserialize(blob).map_err(|err| {
            TrainError::backend(format!("failed to deserialize model state: {err}"))
        })?;
        if state.num_classes != self.num_classes || state.feature_dim != self.feature_dim {
            return Err(TrainError::backend(format!(
                "stored model is {}x{}, expected {}x{}",
                state.num_classes, state.feature_dim, self.num_classes, self.feature_dim
            )));
        }
        if state.weights.len() != self.weights.len() || state.bias.len() != self.bias.len() {
            return Err(TrainError::backend("stored model state is truncated"));
        }
        self.weights = state.weights;
        self.bias = state.bias;
        Ok(())
    }

    fn optimizer_state(&self) -> Result<Vec<u8>> {
        let state = OptimizerState {
            learning_rate: self.learning_rate,
            velocity_w: self.velocity_w.clone(),
            velocity_b: self.velocity_b.clone(),
        };
        bincode::serialize(&state).map_err(|err| {
            TrainError::backend(format!("failed to serialize optimizer state: {err}"))
        })
    }

    fn load_optimizer_state(&mut self, blob: &[u8]) -> Result<()> {
        let state: OptimizerState = bincode::deserialize(blob).map_err(|err| {
            TrainError::backend(format!("failed to deserialize optimizer state: {err}"))
        })?;
        if state.velocity_w.len() != self.velocity_w.len()
            || state.velocity_b.len() != self.velocity_b.len()
        {
            return Err(TrainError::backend(
                "stored optimizer state does not match model shape",
            ));
        }
        self.learning_rate = state.learning_rate;
        self.velocity_w = state.velocity_w;
        self.velocity_b = state.velocity_b;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(inputs: Vec<f32>, labels: Vec<u32>, feature_dim: usize) -> Batch {
        let examples = labels.len();
        Batch {
            inputs,
            labels,
            examples,
            feature_dim,
            indices: (0..examples).collect(),
        }
    }

    fn separable_batch() -> Batch {
        // class 0 clusters at -1, class 1 at +1
        batch(
            vec![
                -1.0, -0.9, -1.1, -1.0, 1.0, 0.9, 1.1, 1.0, -0.8, -1.2, 0.8, 1.2,
            ],
            vec![0, 0, 1, 1, 0, 1],
            2,
        )
    }

    fn full_precision() -> StepContext {
        StepContext {
            loss_scale: 1.0,
            mixed_precision: false,
        }
    }

    #[test]
    fn training_reduces_loss_on_separable_data() {
        let mut model = LinearClassifier::new(2, 2, 0.1, 7).unwrap();
        let data = separable_batch();

        let first = model.train_step(&data, &full_precision()).unwrap();
        let mut last = first;
        for _ in 0..50 {
            last = model.train_step(&data, &full_precision()).unwrap();
        }
        assert!(last.loss < first.loss);
        assert_eq!(last.correct, data.examples);
    }

    #[test]
    fn scaled_and_unscaled_steps_match() {
        let mut plain = LinearClassifier::new(2, 2, 0.1, 7).unwrap();
        let mut scaled = LinearClassifier::new(2, 2, 0.1, 7).unwrap();
        let data = separable_batch();
        let ctx = StepContext {
            loss_scale: 1024.0,
            mixed_precision: true,
        };

        for _ in 0..10 {
            plain.train_step(&data, &full_precision()).unwrap();
            scaled.train_step(&data, &ctx).unwrap();
        }

        for (a, b) in plain.weights.iter().zip(&scaled.weights) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn overflow_skips_the_update() {
        let mut model = LinearClassifier::new(2, 2, 0.1, 7).unwrap();
        let before = model.model_state().unwrap();

        let data = batch(vec![f32::INFINITY, 1.0], vec![0], 2);
        let outcome = model.train_step(&data, &full_precision()).unwrap();

        assert!(outcome.non_finite);
        assert_eq!(model.model_state().unwrap(), before);
    }

    #[test]
    fn top_k_counts_near_misses() {
        let mut model = LinearClassifier::new(4, 1, 0.1, 7).unwrap();
        // logits for x = 1.0 become 1, 2, 3, 4
        let state = ModelState {
            num_classes: 4,
            feature_dim: 1,
            weights: vec![1.0, 2.0, 3.0, 4.0],
            bias: vec![0.0; 4],
        };
        model
            .load_model_state(&bincode::serialize(&state).unwrap())
            .unwrap();

        let data = batch(vec![1.0], vec![2], 1);
        let outcome = model.eval_step(&data, 2).unwrap();
        assert_eq!(outcome.correct, 0);
        assert_eq!(outcome.top_k_correct, 1);

        let rank1_only = model.eval_step(&data, 0).unwrap();
        assert_eq!(rank1_only.top_k_correct, 0);
    }

    #[test]
    fn state_round_trip_restores_trajectory() {
        let mut source = LinearClassifier::new(3, 4, 0.05, 11).unwrap();
        let data = batch(
            vec![
                0.5, -0.5, 0.25, 1.0, -1.0, 0.75, 0.1, -0.3, 0.0, 0.9, -0.2, 0.4,
            ],
            vec![0, 1, 2],
            4,
        );
        for _ in 0..5 {
            source.train_step(&data, &full_precision()).unwrap();
        }

        let model_blob = source.model_state().unwrap();
        let optimizer_blob = source.optimizer_state().unwrap();

        let mut restored = LinearClassifier::new(3, 4, 0.05, 999).unwrap();
        restored.load_model_state(&model_blob).unwrap();
        restored.load_optimizer_state(&optimizer_blob).unwrap();

        source.train_step(&data, &full_precision()).unwrap();
        restored.train_step(&data, &full_precision()).unwrap();
        assert_eq!(
            source.model_state().unwrap(),
            restored.model_state().unwrap()
        );
    }

    #[test]
    fn load_rejects_mismatched_shape() {
        let donor = LinearClassifier::new(3, 2, 0.1, 7).unwrap();
        let blob = donor.model_state().unwrap();

        let mut model = LinearClassifier::new(4, 2, 0.1, 7).unwrap();
        let before = model.model_state().unwrap();
        assert!(model.load_model_state(&blob).is_err());
        assert_eq!(model.model_state().unwrap(), before);
    }

    #[test]
    fn foreign_feature_dim_is_rejected() {
        let mut model = LinearClassifier::new(2, 3, 0.1, 7).unwrap();
        let data = batch(vec![1.0, 2.0], vec![0], 2);
        assert!(model.train_step(&data, &full_precision()).is_err());
        assert!(model.eval_step(&data, 0).is_err());
    }
}
