//! Run configuration loaded from JSON
//!
//! ```json
//! {
//!   "experiment_name": "isic_band_aid",
//!   "batch_size": 32,
//!   "correction": { "method": "pclarc", "cav_layer": "features.fc1", "alpha": 1.0 }
//! }
//! ```
//!
//! Every field except `correction` (and the fields its method requires) has
//! a default.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::activations::DEFAULT_SAVE_DIR;
use crate::cav::CavType;
use crate::error::CorrectionError;
use crate::lwo::LwoOptions;

/// Device preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// CUDA when available, else CPU
    #[default]
    Auto,
    Cpu,
}

/// Settings of a concept-based correction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarcConfig {
    /// Layers to extract (defaults to `[cav_layer]`)
    #[serde(default)]
    pub layers: Option<Vec<String>>,
    pub cav_layer: String,
    #[serde(default)]
    pub cav_type: CavType,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

impl ClarcConfig {
    pub fn new(cav_layer: impl Into<String>) -> Self {
        Self {
            layers: None,
            cav_layer: cav_layer.into(),
            cav_type: CavType::default(),
            alpha: default_alpha(),
        }
    }

    /// Layers whose activations are extracted
    pub fn extraction_layers(&self) -> Vec<String> {
        self.layers
            .clone()
            .unwrap_or_else(|| vec![self.cav_layer.clone()])
    }

    fn validate(&self) -> Result<()> {
        if self.cav_layer.is_empty() {
            return Err(CorrectionError::InvalidOption("cav_layer is empty".into()).into());
        }
        if !self.alpha.is_finite() {
            return Err(CorrectionError::InvalidOption(format!("alpha must be finite, got {}", self.alpha)).into());
        }
        if let Some(layers) = &self.layers {
            if !layers.contains(&self.cav_layer) {
                return Err(CorrectionError::InvalidOption(format!(
                    "cav_layer '{}' is not among the extracted layers {:?}",
                    self.cav_layer, layers
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Correction method and its settings, tagged by `"method"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MethodConfig {
    Pclarc(ClarcConfig),
    ProbeShift(ClarcConfig),
    Lwo(LwoOptions),
}

impl MethodConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pclarc(_) => "pclarc",
            Self::ProbeShift(_) => "probe_shift",
            Self::Lwo(_) => "lwo",
        }
    }
}

fn default_experiment_name() -> String {
    "experiment".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_seed() -> u64 {
    42
}

fn default_train_ratio() -> f64 {
    0.8
}

fn default_save_dir() -> String {
    DEFAULT_SAVE_DIR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_alpha() -> f64 {
    1.0
}

/// Configuration of one correction run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Names the activation cache file
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    #[serde(default)]
    pub device: DeviceChoice,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seed for the data split and loader shuffling
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Fraction of samples used to fit the correction
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
    #[serde(default = "default_save_dir")]
    pub save_dir: String,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    pub correction: MethodConfig,
}

impl RunConfig {
    pub fn new(experiment_name: impl Into<String>, correction: MethodConfig) -> Self {
        Self {
            experiment_name: experiment_name.into(),
            device: DeviceChoice::default(),
            batch_size: default_batch_size(),
            seed: default_seed(),
            train_ratio: default_train_ratio(),
            save_dir: default_save_dir(),
            use_cache: true,
            correction,
        }
    }

    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.experiment_name.is_empty(), "experiment_name is empty");
        if self.batch_size == 0 {
            return Err(CorrectionError::InvalidOption("batch_size must be positive".into()).into());
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(CorrectionError::InvalidOption(format!(
                "train_ratio must be in (0, 1), got {}",
                self.train_ratio
            ))
            .into());
        }
        match &self.correction {
            MethodConfig::Pclarc(c) | MethodConfig::ProbeShift(c) => c.validate(),
            MethodConfig::Lwo(options) => options.validate(),
        }
    }

    pub fn force_cpu(&self) -> bool {
        self.device == DeviceChoice::Cpu
    }
}
