//! Concept activation vectors
//!
//! A CAV is a direction in a layer's activation space that separates
//! artifact samples (label 1) from artifact-free ones (label 0). Two ways
//! to obtain it:
//!
//! - mass-mean probe: the difference of the two class means, closed form
//! - logistic probe: the coefficient vector of a logistic regression
//!   trained with linfa, normalised to unit length

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CorrectionError;

/// How the concept direction is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CavType {
    /// Difference of class means
    #[default]
    #[serde(rename = "mmp")]
    MassMean,
    /// Trained linear separator
    #[serde(rename = "logistic", alias = "lr")]
    Logistic,
}

impl fmt::Display for CavType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MassMean => write!(f, "mmp"),
            Self::Logistic => write!(f, "logistic"),
        }
    }
}

impl FromStr for CavType {
    type Err = CorrectionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mmp" | "mass_mean" => Ok(Self::MassMean),
            "logistic" | "lr" => Ok(Self::Logistic),
            other => Err(CorrectionError::InvalidOption(format!("unknown CAV type '{other}'"))),
        }
    }
}

/// Concept direction plus the class-conditional mean activations
#[derive(Debug, Clone)]
pub struct CavResult {
    /// `(d,)` concept direction
    pub cav: Tensor,
    /// `(d,)` mean over artifact-free samples
    pub mean_na: Tensor,
    /// `(d,)` mean over artifact samples
    pub mean_a: Tensor,
    /// Training accuracy of the separator (logistic probe only)
    pub probe_accuracy: Option<f64>,
}

/// Mass-mean probe: `cav = mean_a - mean_na`
///
/// `acts` is `(n, d)`; `labels` holds one 0/1 flag per row.
pub fn compute_mass_mean_probe(acts: &Tensor, labels: &[u32]) -> Result<CavResult> {
    let (mean_na, mean_a) = class_means(acts, labels)?;
    let cav = (&mean_a - &mean_na)?;
    Ok(CavResult {
        cav,
        mean_na,
        mean_a,
        probe_accuracy: None,
    })
}

/// CAV from a trained linear separator
pub fn compute_cav(acts: &Tensor, labels: &[u32], cav_type: CavType) -> Result<CavResult> {
    match cav_type {
        CavType::MassMean => compute_mass_mean_probe(acts, labels),
        CavType::Logistic => {
            let (mean_na, mean_a) = class_means(acts, labels)?;
            let probe = LinearProbe::new();
            let (direction, accuracy) = probe.fit_direction(acts, labels)?;

            // orient toward the artifact class
            let mean_diff: Vec<f32> = (&mean_a - &mean_na)?.to_dtype(DType::F32)?.to_vec1()?;
            let alignment: f64 = direction
                .iter()
                .zip(&mean_diff)
                .map(|(w, d)| w * f64::from(*d))
                .sum();
            let sign = if alignment < 0.0 { -1.0 } else { 1.0 };
            let cav: Vec<f32> = direction.iter().map(|w| (w * sign) as f32).collect();

            Ok(CavResult {
                cav: Tensor::from_vec(cav, mean_na.dims(), mean_na.device())?,
                mean_na,
                mean_a,
                probe_accuracy: Some(accuracy),
            })
        }
    }
}

/// Scale a vector to unit L2 norm
pub fn normalize(v: &Tensor) -> Result<Tensor> {
    let norm = v.sqr()?.sum_all()?.sqrt()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    anyhow::ensure!(norm > f64::EPSILON, "cannot normalise a zero vector");
    Ok((v / norm)?)
}

fn check_inputs(acts: &Tensor, labels: &[u32]) -> Result<(usize, usize)> {
    let (n, d) = acts
        .dims2()
        .context("activations must be (n_samples, features)")?;
    if n != labels.len() {
        return Err(CorrectionError::Probe(format!(
            "{n} activation rows but {} labels",
            labels.len()
        ))
        .into());
    }
    if let Some(bad) = labels.iter().find(|&&l| l > 1) {
        return Err(CorrectionError::Probe(format!("non-binary label {bad}")).into());
    }
    Ok((n, d))
}

fn class_means(acts: &Tensor, labels: &[u32]) -> Result<(Tensor, Tensor)> {
    check_inputs(acts, labels)?;
    let acts = acts.to_dtype(DType::F32)?;
    let mean_of = |class: u32| -> Result<Tensor> {
        let idx: Vec<u32> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == class)
            .map(|(i, _)| i as u32)
            .collect();
        if idx.is_empty() {
            return Err(CorrectionError::Probe(format!("no samples with label {class}")).into());
        }
        let len = idx.len();
        let idx = Tensor::from_vec(idx, len, acts.device())?;
        Ok(acts.index_select(&idx, 0)?.mean(0)?)
    };
    Ok((mean_of(0)?, mean_of(1)?))
}

/// Logistic-regression probe used for learned CAVs
pub struct LinearProbe {
    max_iterations: u64,
    alpha: f64,
}

impl LinearProbe {
    pub fn new() -> Self {
        Self {
            max_iterations: 100,
            alpha: 1.0,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// L2 regularisation strength
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Fit the probe; returns the unit-norm weight vector and train accuracy
    pub fn fit_direction(&self, acts: &Tensor, labels: &[u32]) -> Result<(Vec<f64>, f64)> {
        let (x, y) = self.prepare_data(acts, labels)?;

        debug!(
            "Training probe: {} samples, {} features",
            x.nrows(),
            x.ncols()
        );

        let dataset = Dataset::new(x.clone(), y.clone());
        let model = LogisticRegression::default()
            .alpha(self.alpha)
            .max_iterations(self.max_iterations)
            .fit(&dataset)
            .context("Failed to train logistic regression")?;

        let predictions = model.predict(&x);
        let correct = predictions.iter().zip(y.iter()).filter(|(p, l)| p == l).count();
        let accuracy = correct as f64 / y.len() as f64;

        let weights = model.params();
        let norm = weights.dot(weights).sqrt();
        if norm <= f64::EPSILON {
            return Err(CorrectionError::Probe("probe weights are all zero".into()).into());
        }
        let direction: Vec<f64> = weights.iter().map(|w| w / norm).collect();

        debug!("Probe train accuracy: {:.2}%", accuracy * 100.0);
        Ok((direction, accuracy))
    }

    fn prepare_data(&self, acts: &Tensor, labels: &[u32]) -> Result<(Array2<f64>, Array1<usize>)> {
        let (n, d) = check_inputs(acts, labels)?;
        for class in [0, 1] {
            if !labels.contains(&class) {
                return Err(CorrectionError::Probe(format!("no samples with label {class}")).into());
            }
        }

        let flat: Vec<f64> = acts
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1()?;
        let x = Array2::from_shape_vec((n, d), flat).context("Failed to create feature matrix")?;
        let y: Array1<usize> = labels.iter().map(|&l| l as usize).collect();
        Ok((x, y))
    }
}

impl Default for LinearProbe {
    fn default() -> Self {
        Self::new()
    }
}
