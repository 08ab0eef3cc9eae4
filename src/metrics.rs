/// Running average over the samples observed since the last reset.
///
/// The training loop resets it at every epoch boundary so the reported loss
/// is an epoch-local average. `value()` returns 0.0 before the first sample;
/// callers should treat that as "nothing recorded yet", not as a real
/// average.
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    count: usize,
    total: f64,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
    }

    pub fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Tally of classification outcomes for accuracy reporting.
///
/// `correct` counts rank-1 hits; `top_k_correct` counts examples whose true
/// label appeared among the k highest-scoring classes.
#[derive(Debug, Clone, Default)]
pub struct AccuracyCounter {
    examples: usize,
    correct: usize,
    top_k_correct: usize,
}

impl AccuracyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, correct: usize, examples: usize) {
        self.correct += correct;
        self.examples += examples;
    }

    pub fn observe_top_k(&mut self, correct: usize) {
        self.top_k_correct += correct;
    }

    pub fn examples(&self) -> usize {
        self.examples
    }

    /// Rank-1 accuracy in percent, 0.0 when nothing was observed.
    pub fn percent(&self) -> f64 {
        if self.examples == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.examples as f64
        }
    }

    pub fn top_k_percent(&self) -> f64 {
        if self.examples == 0 {
            0.0
        } else {
            100.0 * self.top_k_correct as f64 / self.examples as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
