//! Fairness-constrained performance objective
//!
//! `phi` is the balanced accuracy of a set of binary predictions when the
//! chosen bias metric stays within `epsilon`, and zero otherwise. The bias
//! is the signed gap between group 0 and group 1.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::CorrectionError;

/// Group-gap metric used as the fairness constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMetric {
    /// Statistical parity difference: gap in positive prediction rates
    Spd,
    /// Equal opportunity gap: gap in true positive rates
    #[default]
    #[serde(alias = "eod")]
    EoGap,
    /// Average odds difference: mean of the FPR and TPR gaps
    Aod,
}

impl fmt::Display for BiasMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spd => write!(f, "spd"),
            Self::EoGap => write!(f, "eo_gap"),
            Self::Aod => write!(f, "aod"),
        }
    }
}

impl FromStr for BiasMetric {
    type Err = CorrectionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spd" => Ok(Self::Spd),
            "eo_gap" | "eod" => Ok(Self::EoGap),
            "aod" => Ok(Self::Aod),
            other => Err(CorrectionError::InvalidOption(format!("unknown bias metric '{other}'"))),
        }
    }
}

/// Confusion counts for one subset of samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Confusion {
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl Confusion {
    /// Count over samples where `keep` holds
    pub fn from_predictions(y_true: &[u32], y_pred: &[bool], keep: impl Fn(usize) -> bool) -> Self {
        let mut c = Self::default();
        for (i, (&t, &p)) in y_true.iter().zip(y_pred).enumerate() {
            if !keep(i) {
                continue;
            }
            match (t == 1, p) {
                (true, true) => c.true_positives += 1,
                (false, false) => c.true_negatives += 1,
                (false, true) => c.false_positives += 1,
                (true, false) => c.false_negatives += 1,
            }
        }
        c
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.true_negatives + self.false_positives + self.false_negatives
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positives + self.true_negatives, self.total())
    }

    pub fn true_positive_rate(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn true_negative_rate(&self) -> f64 {
        ratio(self.true_negatives, self.true_negatives + self.false_positives)
    }

    pub fn false_positive_rate(&self) -> f64 {
        ratio(self.false_positives, self.false_positives + self.true_negatives)
    }

    pub fn positive_rate(&self) -> f64 {
        ratio(self.true_positives + self.false_positives, self.total())
    }

    /// Mean of TPR and TNR over the classes present
    pub fn balanced_accuracy(&self) -> f64 {
        let positives = self.true_positives + self.false_negatives;
        let negatives = self.true_negatives + self.false_positives;
        match (positives > 0, negatives > 0) {
            (true, true) => 0.5 * (self.true_positive_rate() + self.true_negative_rate()),
            (true, false) => self.true_positive_rate(),
            (false, true) => self.true_negative_rate(),
            (false, false) => 0.0,
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Signed bias of `y_pred`: metric(group 0) - metric(group 1)
pub fn bias(y_true: &[u32], y_pred: &[bool], groups: &[u32], metric: BiasMetric) -> f64 {
    let g0 = Confusion::from_predictions(y_true, y_pred, |i| groups.get(i) == Some(&0));
    let g1 = Confusion::from_predictions(y_true, y_pred, |i| groups.get(i) == Some(&1));
    match metric {
        BiasMetric::Spd => g0.positive_rate() - g1.positive_rate(),
        BiasMetric::EoGap => g0.true_positive_rate() - g1.true_positive_rate(),
        BiasMetric::Aod => {
            0.5 * ((g0.false_positive_rate() - g1.false_positive_rate())
                + (g0.true_positive_rate() - g1.true_positive_rate()))
        }
    }
}

/// Objective value and bias: `(phi, bias)`
pub fn phi(
    y_true: &[u32],
    y_pred: &[bool],
    groups: &[u32],
    epsilon: f64,
    metric: BiasMetric,
) -> Result<(f64, f64)> {
    anyhow::ensure!(
        y_true.len() == y_pred.len() && y_true.len() == groups.len(),
        "length mismatch: {} labels, {} predictions, {} groups",
        y_true.len(),
        y_pred.len(),
        groups.len()
    );
    anyhow::ensure!(!y_true.is_empty(), "cannot score an empty prediction set");

    let b = bias(y_true, y_pred, groups, metric);
    let performance = Confusion::from_predictions(y_true, y_pred, |_| true).balanced_accuracy();
    let value = if b.abs() <= epsilon { performance } else { 0.0 };
    Ok((value, b))
}

/// Labels, groups and constraint bundled for repeated scoring
#[derive(Debug, Clone)]
pub struct FairnessTarget {
    y_true: Vec<u32>,
    groups: Vec<u32>,
    epsilon: f64,
    metric: BiasMetric,
}

impl FairnessTarget {
    pub fn new(y_true: Vec<u32>, groups: Vec<u32>, epsilon: f64, metric: BiasMetric) -> Result<Self> {
        anyhow::ensure!(
            y_true.len() == groups.len(),
            "{} labels but {} group attributes",
            y_true.len(),
            groups.len()
        );
        anyhow::ensure!(!y_true.is_empty(), "fairness target has no samples");
        anyhow::ensure!(epsilon >= 0.0, "epsilon must be non-negative, got {epsilon}");
        Ok(Self {
            y_true,
            groups,
            epsilon,
            metric,
        })
    }

    pub fn len(&self) -> usize {
        self.y_true.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y_true.is_empty()
    }

    pub fn metric(&self) -> BiasMetric {
        self.metric
    }

    pub fn phi(&self, y_pred: &[bool]) -> Result<(f64, f64)> {
        phi(&self.y_true, y_pred, &self.groups, self.epsilon, self.metric)
    }

    /// Score class-1 probabilities thresholded strictly above `tau`
    pub fn phi_at_threshold(&self, scores: &[f32], tau: f64) -> Result<(f64, f64)> {
        let y_pred: Vec<bool> = scores.iter().map(|&s| f64::from(s) > tau).collect();
        self.phi(&y_pred)
    }

    /// Accuracy, balanced accuracy and bias of thresholded scores
    pub fn report(&self, scores: &[f32], tau: f64) -> Result<FairnessReport> {
        let y_pred: Vec<bool> = scores.iter().map(|&s| f64::from(s) > tau).collect();
        let (value, b) = self.phi(&y_pred)?;
        let all = Confusion::from_predictions(&self.y_true, &y_pred, |_| true);
        Ok(FairnessReport {
            accuracy: all.accuracy(),
            balanced_accuracy: all.balanced_accuracy(),
            bias: b,
            phi: value,
            metric: self.metric,
        })
    }
}

/// Summary of a model's predictions against a [`FairnessTarget`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FairnessReport {
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub bias: f64,
    pub phi: f64,
    pub metric: BiasMetric,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confusion_metrics() {
        let y_true = [1, 1, 0, 0, 1];
        let y_pred = [true, false, false, true, true];
        let c = Confusion::from_predictions(&y_true, &y_pred, |_| true);
        assert_eq!(c.true_positives, 2);
        assert_eq!(c.false_negatives, 1);
        assert_eq!(c.true_negatives, 1);
        assert_eq!(c.false_positives, 1);
        assert!((c.accuracy() - 0.6).abs() < 1e-12);
        assert!((c.balanced_accuracy() - (2.0 / 3.0 + 0.5) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_eo_gap() {
        // group 0: TPR 1.0, group 1: TPR 0.5
        let y_true = [1, 1, 1, 1];
        let y_pred = [true, true, true, false];
        let groups = [0, 0, 1, 1];
        let b = bias(&y_true, &y_pred, &groups, BiasMetric::EoGap);
        assert!((b - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_spd_and_aod() {
        let y_true = [0, 1, 0, 1];
        let y_pred = [true, true, false, false];
        let groups = [0, 0, 1, 1];
        assert!((bias(&y_true, &y_pred, &groups, BiasMetric::Spd) - 1.0).abs() < 1e-12);
        // FPR gap 1.0, TPR gap 1.0
        assert!((bias(&y_true, &y_pred, &groups, BiasMetric::Aod) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_phi_constraint() {
        let y_true = [1, 0, 1, 0];
        let groups = [0, 0, 1, 1];

        // perfect and fair
        let (p, b) = phi(&y_true, &[true, false, true, false], &groups, 0.05, BiasMetric::EoGap).unwrap();
        assert!((p - 1.0).abs() < 1e-12);
        assert!(b.abs() < 1e-12);

        // group 1 positives missed: gap 1.0 > epsilon
        let (p, b) = phi(&y_true, &[true, false, false, false], &groups, 0.05, BiasMetric::EoGap).unwrap();
        assert_eq!(p, 0.0);
        assert!((b - 1.0).abs() < 1e-12);

        assert!(phi(&y_true, &[true], &groups, 0.05, BiasMetric::EoGap).is_err());
    }

    #[test]
    fn test_target_threshold() {
        let target = FairnessTarget::new(vec![1, 0, 1, 0], vec![0, 0, 1, 1], 0.1, BiasMetric::EoGap).unwrap();
        let scores = [0.9f32, 0.2, 0.6, 0.4];
        let (p, _) = target.phi_at_threshold(&scores, 0.5).unwrap();
        assert!((p - 1.0).abs() < 1e-12);
        let (p, _) = target.phi_at_threshold(&scores, 0.7).unwrap();
        assert_eq!(p, 0.0);

        let report = target.report(&scores, 0.5).unwrap();
        assert!((report.accuracy - 1.0).abs() < 1e-12);
        assert_eq!(report.metric, BiasMetric::EoGap);
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("eod".parse::<BiasMetric>().unwrap(), BiasMetric::EoGap);
        assert_eq!("SPD".parse::<BiasMetric>().unwrap(), BiasMetric::Spd);
        assert!("gini".parse::<BiasMetric>().is_err());
        let m: BiasMetric = serde_json::from_str("\"aod\"").unwrap();
        assert_eq!(m, BiasMetric::Aod);
    }
}
