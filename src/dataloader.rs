//! Data loader

use ndarray::{Array, Axis, RemoveAxis};
use rand::{SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error("Labels must have the same length as the data")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be positive")]
    ZeroBatchSize,
}

/// A collection of examples stacked along the first axis
pub trait Batch: Sized {
    /// Number of examples
    fn len(&self) -> usize;
    /// Copies out the examples at `indices`, in order
    fn select(&self, indices: &[usize]) -> Self;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: Clone, D: RemoveAxis> Batch for Array<A, D> {
    fn len(&self) -> usize {
        self.len_of(Axis(0))
    }

    fn select(&self, indices: &[usize]) -> Self {
        self.select(Axis(0), indices)
    }
}

impl<T: Clone> Batch for Vec<T> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn select(&self, indices: &[usize]) -> Self {
        indices.iter().map(|&i| self[i].clone()).collect()
    }
}

/// Data loader, returns batches of data and labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader<X, Y> {
    data: X,
    labels: Y,
    batch_size: usize,
    shuffle: bool,
}

impl<X: Batch, Y: Batch> DataLoader<X, Y> {
    pub fn new(data: X, labels: Y, batch_size: usize, shuffle: bool) -> Result<Self, DataLoaderError> {
        if data.len() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: data.len(),
            });
        }
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        Ok(Self {
            data,
            labels,
            batch_size,
            shuffle,
        })
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of batches per pass, counting a final partial batch
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn data(&self) -> &X {
        &self.data
    }

    pub fn labels(&self) -> &Y {
        &self.labels
    }

    fn iter_with(&self, indices: Vec<usize>) -> DataLoaderIterator<'_, X, Y> {
        DataLoaderIterator {
            data: &self.data,
            labels: &self.labels,
            batch_size: self.batch_size,
            indices,
            curr_iter: 0,
        }
    }

    /// Iterates with a reproducible shuffle (when shuffling is enabled)
    pub fn seeded_iter(&self, seed: u64) -> DataLoaderIterator<'_, X, Y> {
        let mut indices = (0..self.len()).collect::<Vec<_>>();
        if self.shuffle {
            let mut rng = Pcg64Mcg::seed_from_u64(seed);
            indices.shuffle(&mut rng);
        }
        self.iter_with(indices)
    }

    pub fn iter(&self) -> DataLoaderIterator<'_, X, Y> {
        let mut indices = (0..self.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(&mut rand::rng());
        }
        self.iter_with(indices)
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset.
/// The last batch is smaller when the batch size does not divide the number of examples.
pub struct DataLoaderIterator<'a, X, Y> {
    data: &'a X,
    labels: &'a Y,
    batch_size: usize,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl<X: Batch, Y: Batch> Iterator for DataLoaderIterator<'_, X, Y> {
    type Item = (X, Y);

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.batch_size).min(self.indices.len());
        let batch = &self.indices[self.curr_iter..end];
        self.curr_iter = end;
        Some((self.data.select(batch), self.labels.select(batch)))
    }
}
