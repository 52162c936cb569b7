//! Activation extraction and on-disk caching
//!
//! Runs a model over a [`DataLoader`], captures the outputs of the requested
//! layers and concatenates them per layer. Results are persisted to
//! `<save_dir>/<experiment_name>.safetensors`; a later call with the same
//! experiment name loads that file instead of running the model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use tracing::{debug, info};

use crate::data::DataLoader;
use crate::error::CorrectionError;
use crate::model::HookedClassifier;

/// Key of the `(n_samples, 2)` label matrix: `[label, group]`
pub const LABELS_KEY: &str = "labels";

/// Prefix of layer tensors in a cache file, keeping them apart from `labels`
pub const LAYER_PREFIX: &str = "act/";

/// Default directory for cached activations
pub const DEFAULT_SAVE_DIR: &str = "./activations";

/// Per-layer activations for a whole dataset
#[derive(Debug, Default)]
pub struct ActivationStore {
    /// Layer name -> `(n_samples, ...)`
    layers: HashMap<String, Tensor>,
    /// `(n_samples, 2)` u32, absent when loaded from a file without labels
    labels: Option<Tensor>,
}

impl ActivationStore {
    pub fn new(layers: HashMap<String, Tensor>, labels: Option<Tensor>) -> Self {
        Self { layers, labels }
    }

    pub fn get_layer(&self, name: &str) -> Option<&Tensor> {
        self.layers.get(name)
    }

    /// Get a layer, failing with the layer name if it was not extracted
    pub fn require_layer(&self, name: &str) -> Result<&Tensor> {
        self.layers
            .get(name)
            .ok_or_else(|| CorrectionError::UnknownLayer(name.to_string()).into())
    }

    /// Layer names in sorted order
    pub fn layer_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.layers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn labels(&self) -> Option<&Tensor> {
        self.labels.as_ref()
    }

    /// Number of samples (from the label matrix, else the first layer)
    pub fn n_samples(&self) -> Result<usize> {
        if let Some(labels) = &self.labels {
            return Ok(labels.dim(0)?);
        }
        let first = self
            .layers
            .values()
            .next()
            .ok_or_else(|| anyhow::anyhow!("activation store is empty"))?;
        Ok(first.dim(0)?)
    }

    /// Column `column` of the label matrix as host values
    pub fn label_column(&self, column: usize) -> Result<Vec<u32>> {
        let labels = self
            .labels
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("activation store has no labels"))?;
        Ok(labels.i((.., column))?.to_dtype(DType::U32)?.to_vec1()?)
    }

    /// Artifact flags: column 1 of the label matrix
    pub fn artifact_labels(&self) -> Result<Vec<u32>> {
        self.label_column(1)
    }

    /// Layer activations flattened to `(n_samples, features)`
    pub fn flatten_layer(&self, name: &str) -> Result<Tensor> {
        Ok(self.require_layer(name)?.flatten_from(1)?)
    }

    /// Persist all tensors to a safetensors file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tensors: HashMap<String, Tensor> = self
            .layers
            .iter()
            .map(|(name, tensor)| (format!("{LAYER_PREFIX}{name}"), tensor.clone()))
            .collect();
        if let Some(labels) = &self.labels {
            tensors.insert(LABELS_KEY.to_string(), labels.clone());
        }
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to save activations to {}", path.display()))?;
        Ok(())
    }

    /// Load a store written by [`save`](Self::save)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to load activations from {}", path.display()))?;
        let mut store = Self::default();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(LAYER_PREFIX) {
                store.layers.insert(name.to_string(), tensor);
            } else if key == LABELS_KEY {
                store.labels = Some(tensor);
            } else {
                anyhow::bail!("unexpected tensor '{key}' in activation cache {}", path.display());
            }
        }
        Ok(store)
    }
}

/// Cache file for an experiment
pub fn cache_path(save_dir: impl AsRef<Path>, experiment_name: &str) -> PathBuf {
    save_dir
        .as_ref()
        .join(format!("{experiment_name}.safetensors"))
}

/// Extract activations of `layers` (all named modules when `None`)
///
/// With `use_cache`, an existing cache file for `experiment_name` is
/// returned as-is, without checking that it holds the requested layers.
pub fn extract_activations(
    model: &HookedClassifier,
    loader: &DataLoader,
    experiment_name: &str,
    layers: Option<&[String]>,
    use_cache: bool,
    save_dir: impl AsRef<Path>,
) -> Result<ActivationStore> {
    let save_path = cache_path(&save_dir, experiment_name);
    if use_cache && save_path.exists() {
        let store = ActivationStore::load(&save_path)?;
        info!("Loaded activations from '{}'", save_path.display());
        return Ok(store);
    }

    let layer_names: Vec<String> = match layers {
        None => model.named_modules(),
        Some(names) => {
            for name in names {
                if !model.layer_exists(name) {
                    return Err(CorrectionError::UnknownLayer(name.clone()).into());
                }
            }
            names.to_vec()
        }
    };
    anyhow::ensure!(!loader.is_empty(), "cannot extract activations from an empty loader");

    info!(
        "Extracting activations: {} layers, {} batches",
        layer_names.len(),
        loader.len()
    );

    let mut per_layer: HashMap<String, Vec<Tensor>> = HashMap::new();
    let mut labels = Vec::with_capacity(loader.len());
    for (batch_idx, batch) in loader.iter().enumerate() {
        let batch = batch?;
        let cache = model.forward_with_capture(&batch.inputs, &layer_names)?;
        for name in &layer_names {
            let activation = cache.require(name)?.to_device(&Device::Cpu)?;
            per_layer.entry(name.clone()).or_default().push(activation);
        }
        labels.push(batch.label_matrix()?.to_device(&Device::Cpu)?);
        debug!("Extracted batch {}/{}", batch_idx + 1, loader.len());
    }

    let mut layers = HashMap::with_capacity(per_layer.len());
    for (name, chunks) in per_layer {
        layers.insert(name, Tensor::cat(&chunks, 0)?);
    }
    let store = ActivationStore::new(layers, Some(Tensor::cat(&labels, 0)?));

    std::fs::create_dir_all(save_dir.as_ref()).with_context(|| {
        format!(
            "Failed to create activation directory {}",
            save_dir.as_ref().display()
        )
    })?;
    store.save(&save_path)?;
    info!("Saved all activations at '{}'", save_path.display());

    Ok(store)
}
