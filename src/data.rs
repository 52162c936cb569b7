//! Labelled datasets and batch loading
//!
//! Each sample carries a class label and a binary group attribute. The
//! group is the artifact flag for concept correction and the protected
//! attribute for the fairness objective.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// A single labelled sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Flattened input, row-major in `input_shape`
    pub features: Vec<f32>,
    pub label: u32,
    /// Artifact flag / protected attribute (0 or 1)
    #[serde(default)]
    pub group: u32,
}

/// Raw JSON structure for loading
#[derive(Debug, Deserialize)]
struct DatasetFile {
    input_shape: Vec<usize>,
    samples: Vec<Sample>,
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

/// In-memory dataset
#[derive(Debug, Clone)]
pub struct Dataset {
    input_shape: Vec<usize>,
    samples: Vec<Sample>,
}

impl Dataset {
    /// Create a dataset, checking every sample against `input_shape`
    pub fn new(input_shape: Vec<usize>, samples: Vec<Sample>) -> Result<Self> {
        let width: usize = input_shape.iter().product();
        anyhow::ensure!(width > 0, "input_shape {input_shape:?} has no elements");
        for (i, sample) in samples.iter().enumerate() {
            anyhow::ensure!(
                sample.features.len() == width,
                "sample {i} has {} features, expected {width}",
                sample.features.len()
            );
            anyhow::ensure!(sample.group <= 1, "sample {i} has non-binary group {}", sample.group);
        }
        Ok(Self {
            input_shape,
            samples,
        })
    }

    /// Load dataset from JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset {}", path.display()))?;
        let file: DatasetFile = serde_json::from_str(&content).context("Failed to parse dataset")?;
        Self::new(file.input_shape, file.samples)
    }

    /// Split into train and test sets after a seeded shuffle
    pub fn split(&self, train_ratio: f64, seed: u64) -> (Dataset, Dataset) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut samples = self.samples.clone();
        samples.shuffle(&mut rng);

        let split_idx = (samples.len() as f64 * train_ratio.clamp(0.0, 1.0)) as usize;
        let test = samples.split_off(split_idx);

        (
            Dataset {
                input_shape: self.input_shape.clone(),
                samples,
            },
            Dataset {
                input_shape: self.input_shape.clone(),
                samples: test,
            },
        )
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Count samples in `group`
    pub fn group_count(&self, group: u32) -> usize {
        self.samples.iter().filter(|s| s.group == group).count()
    }

    /// Count samples with class `label`
    pub fn label_count(&self, label: u32) -> usize {
        self.samples.iter().filter(|s| s.label == label).count()
    }
}

/// One batch of samples on the loader's device
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(B, *input_shape)` f32
    pub inputs: Tensor,
    /// `(B,)` u32 class labels
    pub labels: Tensor,
    /// `(B,)` u32 group attribute
    pub groups: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels and groups stacked as `(B, 2)`
    pub fn label_matrix(&self) -> Result<Tensor> {
        Ok(Tensor::stack(&[&self.labels, &self.groups], 1)?)
    }
}

/// Batches a [`Dataset`], optionally shuffling with a fixed seed
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    device: Device,
    shuffle_seed: Option<u64>,
}

impl DataLoader {
    pub fn new(dataset: Dataset, batch_size: usize, device: &Device) -> Result<Self> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        Ok(Self {
            dataset,
            batch_size,
            device: device.clone(),
            shuffle_seed: None,
        })
    }

    /// Shuffle sample order (same order on every pass)
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of batches per pass
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Iterate over batches
    pub fn iter(&self) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }
        BatchIter {
            loader: self,
            order,
            position: 0,
        }
    }

    fn make_batch(&self, indices: &[usize]) -> Result<Batch> {
        let samples = self.dataset.samples();
        let width: usize = self.dataset.input_shape.iter().product();
        let mut features = Vec::with_capacity(indices.len() * width);
        let mut labels = Vec::with_capacity(indices.len());
        let mut groups = Vec::with_capacity(indices.len());
        for &i in indices {
            let s = &samples[i];
            features.extend_from_slice(&s.features);
            labels.push(s.label);
            groups.push(s.group);
        }

        let mut shape = Vec::with_capacity(self.dataset.input_shape.len() + 1);
        shape.push(indices.len());
        shape.extend_from_slice(&self.dataset.input_shape);

        Ok(Batch {
            inputs: Tensor::from_vec(features, shape, &self.device)?,
            labels: Tensor::from_vec(labels, indices.len(), &self.device)?,
            groups: Tensor::from_vec(groups, indices.len(), &self.device)?,
        })
    }
}

/// Iterator over a [`DataLoader`]'s batches
pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    position: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let batch = self.loader.make_batch(&self.order[self.position..end]);
        self.position = end;
        Some(batch)
    }
}

/// Concatenate the first batches of `loader` into one batch
///
/// Batches are taken up to and including index `floor(n_batches * frac)`,
/// so `frac = 0.0` still yields the first batch.
pub fn unpack_batches(loader: &DataLoader, frac: f64) -> Result<Batch> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&frac),
        "frac_of_batches_to_use must be in [0, 1], got {frac}"
    );
    anyhow::ensure!(!loader.is_empty(), "cannot unpack an empty data loader");

    let last = (loader.len() as f64 * frac) as usize;
    let mut inputs = Vec::new();
    let mut labels = Vec::new();
    let mut groups = Vec::new();
    for (i, batch) in loader.iter().enumerate() {
        let batch = batch?;
        inputs.push(batch.inputs);
        labels.push(batch.labels);
        groups.push(batch.groups);
        if i == last {
            break;
        }
    }

    Ok(Batch {
        inputs: Tensor::cat(&inputs, 0)?,
        labels: Tensor::cat(&labels, 0)?,
        groups: Tensor::cat(&groups, 0)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy(n: usize) -> Dataset {
        let samples = (0..n)
            .map(|i| Sample {
                features: vec![i as f32, -(i as f32)],
                label: (i % 2) as u32,
                group: u32::from(i % 3 == 0),
            })
            .collect();
        Dataset::new(vec![2], samples).unwrap()
    }

    #[test]
    fn test_dataset_split() {
        let (train, test) = toy(10).split(0.8, 42);
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 2);
        assert_eq!(train.input_shape(), &[2]);
    }

    #[test]
    fn test_dataset_rejects_bad_width() {
        let samples = vec![Sample {
            features: vec![1.0],
            label: 0,
            group: 0,
        }];
        assert!(Dataset::new(vec![2], samples).is_err());
    }

    #[test]
    fn test_loader_batches() {
        let loader = DataLoader::new(toy(5), 2, &Device::Cpu).unwrap();
        assert_eq!(loader.len(), 3);
        let batches: Vec<Batch> = loader.iter().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].inputs.dims(), &[2, 2]);
        assert_eq!(batches[2].len(), 1);
        let labels: Vec<u32> = batches[0].labels.to_vec1().unwrap();
        assert_eq!(labels, vec![0, 1]);
        assert_eq!(batches[0].label_matrix().unwrap().dims(), &[2, 2]);
    }

    #[test]
    fn test_loader_shuffle_is_deterministic() {
        let a = DataLoader::new(toy(20), 4, &Device::Cpu).unwrap().with_shuffle(7);
        let b = DataLoader::new(toy(20), 4, &Device::Cpu).unwrap().with_shuffle(7);
        let first_a: Vec<u32> = a.iter().next().unwrap().unwrap().labels.to_vec1().unwrap();
        let first_b: Vec<u32> = b.iter().next().unwrap().unwrap().labels.to_vec1().unwrap();
        assert_eq!(first_a, first_b);
    }

    #[test]
    fn test_unpack_batches_fraction() {
        let loader = DataLoader::new(toy(10), 2, &Device::Cpu).unwrap();
        // 5 batches; 0.4 * 5 = 2 -> batches 0..=2
        let batch = unpack_batches(&loader, 0.4).unwrap();
        assert_eq!(batch.len(), 6);
        // zero still yields the first batch
        assert_eq!(unpack_batches(&loader, 0.0).unwrap().len(), 2);
        assert_eq!(unpack_batches(&loader, 1.0).unwrap().len(), 10);
        assert!(unpack_batches(&loader, 1.5).is_err());
    }
}
