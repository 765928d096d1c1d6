//! Data loader

use std::collections::BTreeSet;

use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::values::Value;

/// Errors for the dataloader
#[derive(Debug, Error, PartialEq)]
pub enum DataLoaderError {
    #[error(
        "All input vectors must have the same dimension. Received different sizes: {input_dims:?}"
    )]
    InputDimensionMismatch { input_dims: BTreeSet<usize> },
    #[error("Got {label_len} labels for {data_len} samples")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be positive")]
    ZeroBatchSize,
}

/// Data loader, returns batches of inputs and class labels, optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    data: Vec<Vec<f32>>,
    // class index per sample
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl DataLoader {
    pub fn new(
        data: Vec<Vec<f32>>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if data.len() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: data.len(),
            });
        }
        let input_dims = data.iter().map(|d| d.len()).collect::<BTreeSet<_>>();
        if input_dims.len() > 1 {
            return Err(DataLoaderError::InputDimensionMismatch { input_dims });
        }
        Ok(Self {
            data,
            labels,
            batch_size,
            shuffle,
            drop_last: false,
        })
    }

    /// Skip the final batch when it is smaller than `batch_size`
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Width of every input vector, `None` for an empty loader
    pub fn input_dim(&self) -> Option<usize> {
        self.data.first().map(|d| d.len())
    }

    /// Number of batches one pass over the data yields
    pub fn n_batches(&self) -> usize {
        if self.drop_last {
            self.len() / self.batch_size
        } else {
            self.len().div_ceil(self.batch_size)
        }
    }

    /// Iterates with a shuffle order drawn from `seed`, reproducible across runs
    pub fn seeded_iter(&self, seed: u64) -> DataLoaderIterator<'_> {
        self.iter_with_rng(&mut Pcg64Mcg::seed_from_u64(seed))
    }

    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with_rng(&mut rand::rng())
    }

    fn iter_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        let end = if self.drop_last {
            self.n_batches() * self.batch_size
        } else {
            indices.len()
        };
        indices.truncate(end);
        DataLoaderIterator {
            loader: self,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset
///
/// Inputs are handed out as fresh leaf values, so gradients never accumulate on the dataset.
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = (Vec<Vec<Value>>, Vec<usize>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.loader.batch_size).min(self.indices.len());
        let batch = &self.indices[self.curr_iter..end];
        let batch_data: Vec<Vec<Value>> = batch
            .iter()
            .map(|&i| self.loader.data[i].iter().map(|v| Value::new(*v)).collect::<Vec<_>>())
            .collect();
        let batch_labels = batch
            .iter()
            .map(|&i| self.loader.labels[i])
            .collect::<Vec<_>>();
        self.curr_iter = end;
        Some((batch_data, batch_labels))
    }
}
