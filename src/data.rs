use futures::future::BoxFuture;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::error::{Result, TrainError};

/// Batch returned by dataset loaders.
///
/// `inputs` is row-major: example `k` occupies
/// `inputs[k * feature_dim .. (k + 1) * feature_dim]`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Vec<f32>,
    pub labels: Vec<u32>,
    pub examples: usize,
    pub feature_dim: usize,
    /// Source-row index of each example, for provenance in logs.
    pub indices: Vec<usize>,
}

/// Asynchronous-compatible loader abstraction.
///
/// `next_batch` yields `None` once the current epoch is exhausted;
/// `reset` rewinds to the start of a fresh epoch. Loaders that shuffle
/// should reshuffle on reset so consecutive epochs see different orders.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>>;

    fn reset(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Number of batches per epoch, when the loader knows it up front.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

impl DataLoader for Box<dyn DataLoader> {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        (**self).next_batch()
    }

    fn reset(&mut self) -> BoxFuture<'_, Result<()>> {
        (**self).reset()
    }

    fn len_hint(&self) -> Option<usize> {
        (**self).len_hint()
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn reset(&mut self) -> Result<()> {
        futures::executor::block_on(self.inner.reset())
    }

    pub fn len_hint(&self) -> Option<usize> {
        self.inner.len_hint()
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Loader over a dataset held fully in memory.
///
/// Shuffling is seeded per epoch so that a run replayed with the same
/// seed visits examples in the same order.
pub struct InMemoryLoader {
    features: Vec<f32>,
    labels: Vec<u32>,
    feature_dim: usize,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    epoch: u64,
    order: Vec<usize>,
    cursor: usize,
}

impl InMemoryLoader {
    pub fn new(
        features: Vec<f32>,
        labels: Vec<u32>,
        feature_dim: usize,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
    ) -> Result<Self> {
        if feature_dim == 0 {
            return Err(TrainError::initialization(
                "feature_dim must be greater than zero",
            ));
        }
        if batch_size == 0 {
            return Err(TrainError::initialization(
                "batch_size must be greater than zero",
            ));
        }
        if features.len() % feature_dim != 0 {
            return Err(TrainError::initialization(format!(
                "feature buffer length {} is not a multiple of feature_dim {}",
                features.len(),
                feature_dim
            )));
        }
        let examples = features.len() / feature_dim;
        if examples == 0 {
            return Err(TrainError::initialization(
                "dataset is empty; no examples available",
            ));
        }
        if labels.len() != examples {
            return Err(TrainError::initialization(format!(
                "{} labels for {} examples",
                labels.len(),
                examples
            )));
        }

        let mut loader = Self {
            features,
            labels,
            feature_dim,
            batch_size,
            shuffle,
            drop_last,
            seed,
            epoch: 0,
            order: (0..examples).collect(),
            cursor: 0,
        };
        loader.reorder();
        Ok(loader)
    }

    pub fn examples(&self) -> usize {
        self.labels.len()
    }

    fn reorder(&mut self) {
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            self.order.shuffle(&mut rng);
        }
    }

    fn build_batch(&mut self) -> Option<Batch> {
        let remaining = self.order.len() - self.cursor;
        if remaining == 0 {
            return None;
        }
        if remaining < self.batch_size && self.drop_last {
            return None;
        }

        let take = remaining.min(self.batch_size);
        let mut inputs = Vec::with_capacity(take * self.feature_dim);
        let mut labels = Vec::with_capacity(take);
        let mut indices = Vec::with_capacity(take);
        for &row in &self.order[self.cursor..self.cursor + take] {
            let start = row * self.feature_dim;
            inputs.extend_from_slice(&self.features[start..start + self.feature_dim]);
            labels.push(self.labels[row]);
            indices.push(row);
        }
        self.cursor += take;

        Some(Batch {
            inputs,
            labels,
            examples: take,
            feature_dim: self.feature_dim,
            indices,
        })
    }
}

impl DataLoader for InMemoryLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<Batch>>> {
        Box::pin(async move { Ok(self.build_batch()) })
    }

    fn reset(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.epoch += 1;
            self.cursor = 0;
            self.reorder();
            Ok(())
        })
    }

    fn len_hint(&self) -> Option<usize> {
        let examples = self.order.len();
        let batches = if self.drop_last {
            examples / self.batch_size
        } else {
            examples.div_ceil(self.batch_size)
        };
        Some(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(examples: usize, feature_dim: usize) -> (Vec<f32>, Vec<u32>) {
        let features = (0..examples * feature_dim).map(|v| v as f32).collect();
        let labels = (0..examples).map(|v| (v % 3) as u32).collect();
        (features, labels)
    }

    fn drain(loader: &mut InMemoryLoader) -> Vec<Batch> {
        let mut batches = Vec::new();
        while let Some(batch) = futures::executor::block_on(loader.next_batch()).unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn drop_last_discards_partial_batch() {
        let (features, labels) = dataset(10, 2);
        let mut loader = InMemoryLoader::new(features, labels, 2, 4, false, true, 7).unwrap();
        let batches = drain(&mut loader);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.examples == 4));
        assert_eq!(loader.len_hint(), Some(2));
    }

    #[test]
    fn partial_batch_survives_without_drop_last() {
        let (features, labels) = dataset(10, 2);
        let mut loader = InMemoryLoader::new(features, labels, 2, 4, false, false, 7).unwrap();
        let batches = drain(&mut loader);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].examples, 2);
        assert_eq!(loader.len_hint(), Some(3));
    }

    #[test]
    fn unshuffled_order_is_sequential() {
        let (features, labels) = dataset(6, 1);
        let mut loader = InMemoryLoader::new(features, labels, 1, 3, false, true, 7).unwrap();
        let batches = drain(&mut loader);
        assert_eq!(batches[0].indices, vec![0, 1, 2]);
        assert_eq!(batches[0].inputs, vec![0.0, 1.0, 2.0]);
        assert_eq!(batches[1].indices, vec![3, 4, 5]);
    }

    #[test]
    fn same_seed_same_epoch_same_order() {
        let (features, labels) = dataset(32, 2);
        let mut first =
            InMemoryLoader::new(features.clone(), labels.clone(), 2, 8, true, true, 99).unwrap();
        let mut second = InMemoryLoader::new(features, labels, 2, 8, true, true, 99).unwrap();

        let a: Vec<Vec<usize>> = drain(&mut first).into_iter().map(|b| b.indices).collect();
        let b: Vec<Vec<usize>> = drain(&mut second).into_iter().map(|b| b.indices).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn reset_reshuffles_and_rewinds() {
        let (features, labels) = dataset(32, 2);
        let mut loader = InMemoryLoader::new(features, labels, 2, 8, true, true, 99).unwrap();

        let first: Vec<Vec<usize>> = drain(&mut loader).into_iter().map(|b| b.indices).collect();
        futures::executor::block_on(loader.reset()).unwrap();
        let second: Vec<Vec<usize>> = drain(&mut loader).into_iter().map(|b| b.indices).collect();

        assert_eq!(first.len(), second.len());
        assert_ne!(first, second);

        let mut seen: Vec<usize> = second.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        let (features, _) = dataset(4, 2);
        let result = InMemoryLoader::new(features, vec![0, 1], 2, 2, false, true, 7);
        assert!(result.is_err());
    }

    #[test]
    fn blocking_adapter_delegates() {
        let (features, labels) = dataset(8, 2);
        let loader = InMemoryLoader::new(features, labels, 2, 4, false, true, 7).unwrap();
        let mut blocking = BlockingDataLoader::new(loader);
        assert_eq!(blocking.len_hint(), Some(2));
        assert!(blocking.next_batch().unwrap().is_some());
        blocking.reset().unwrap();
        assert_eq!(blocking.into_inner().examples(), 8);
    }
}
