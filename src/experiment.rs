//! Experiment runner for correction pipelines
//!
//! Splits the dataset, fits the configured correction on the training part
//! and scores the model on the held-out part before and after correcting.

use std::path::Path;

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cav::CavType;
use crate::config::{ClarcConfig, MethodConfig, RunConfig};
use crate::correction::{Clarc, ClarcMethod, ClarcTarget, MeanShift, ModelCorrection, Projective};
use crate::data::{unpack_batches, DataLoader, Dataset};
use crate::fairness::{BiasMetric, FairnessReport, FairnessTarget};
use crate::lwo::{Lwo, LwoOptions, LwoOutcome};
use crate::model::HookedClassifier;

/// Bias tolerance used when scoring concept-based corrections
pub const DEFAULT_EVAL_EPSILON: f64 = 0.05;

/// Decision threshold for held-out scoring
const EVAL_THRESHOLD: f64 = 0.5;

/// Concept vector summary for the results file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CavSummary {
    pub layer: String,
    pub cav_type: CavType,
    pub n_features: usize,
    pub norm: f64,
    /// safetensors file holding `cav`, `mean_act_na` and `mean_act_a`
    pub saved_to: String,
}

/// Results of a correction run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    pub experiment_name: String,
    pub method: String,
    pub n_train: usize,
    pub n_test: usize,
    /// Held-out scores of the uncorrected model
    pub baseline: FairnessReport,
    /// Held-out scores of the corrected model
    pub corrected: FairnessReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cav: Option<CavSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lwo: Option<LwoOutcome>,
}

/// Main experiment runner
pub struct Experiment {
    config: RunConfig,
    model: HookedClassifier,
}

impl Experiment {
    pub fn new(model: HookedClassifier, config: RunConfig) -> Self {
        Self { config, model }
    }

    /// Run the configured correction; returns the corrected model
    pub fn run(self, dataset: &Dataset) -> Result<(HookedClassifier, ExperimentResults)> {
        let Self { config, model } = self;
        config.validate()?;

        info!(
            "Starting {} experiment '{}'",
            config.correction.name(),
            config.experiment_name
        );

        let (train, test) = dataset.split(config.train_ratio, config.seed);
        anyhow::ensure!(
            !train.is_empty() && !test.is_empty(),
            "split of {} samples at ratio {} leaves an empty part",
            dataset.len(),
            config.train_ratio
        );
        info!("Split: {} train, {} test samples", train.len(), test.len());
        let (n_train, n_test) = (train.len(), test.len());

        let device = model.device().clone();
        let train_loader = DataLoader::new(train, config.batch_size, &device)?.with_shuffle(config.seed);
        let test_loader = DataLoader::new(test, config.batch_size, &device)?;

        let held_out = unpack_batches(&test_loader, 1.0)?;
        let (epsilon, metric) = match &config.correction {
            MethodConfig::Lwo(options) => (options.epsilon, options.bias_metric),
            _ => (DEFAULT_EVAL_EPSILON, BiasMetric::default()),
        };
        let target = FairnessTarget::new(held_out.labels.to_vec1()?, held_out.groups.to_vec1()?, epsilon, metric)?;

        let logits = model.outputs_are_logits();
        let baseline = evaluate(&model, &held_out.inputs, &target, logits)?;
        log_report("Baseline", &baseline);

        let (model, cav, lwo, corrected_logits) = match &config.correction {
            MethodConfig::Pclarc(c) => {
                let (model, summary) = run_clarc::<Projective>(model, c, &train_loader, &config)?;
                (model, Some(summary), None, logits)
            }
            MethodConfig::ProbeShift(c) => {
                let (model, summary) = run_clarc::<MeanShift>(model, c, &train_loader, &config)?;
                (model, Some(summary), None, logits)
            }
            MethodConfig::Lwo(options) => {
                let (model, outcome) = run_lwo(model, options, &train_loader, &config)?;
                // the soft-threshold hook emits probabilities
                (model, None, Some(outcome), false)
            }
        };

        let corrected = evaluate(&model, &held_out.inputs, &target, corrected_logits)?;
        log_report("Corrected", &corrected);

        Ok((
            model,
            ExperimentResults {
                experiment_name: config.experiment_name.clone(),
                method: config.correction.name().to_string(),
                n_train,
                n_test,
                baseline,
                corrected,
                cav,
                lwo,
            },
        ))
    }
}

fn run_clarc<M: ClarcMethod>(
    model: HookedClassifier,
    settings: &ClarcConfig,
    loader: &DataLoader,
    config: &RunConfig,
) -> Result<(HookedClassifier, CavSummary)> {
    let mut clarc = Clarc::<M>::new(model, config.experiment_name.as_str());
    let layers = settings.extraction_layers();
    clarc.extract_activations(loader, Some(layers.as_slice()), config.use_cache, &config.save_dir)?;

    let vectors = clarc.compute_cav(settings.cav_type, &settings.cav_layer)?;
    let norm = f64::from(vectors.cav.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?);

    std::fs::create_dir_all(&config.save_dir)?;
    let cav_path = Path::new(&config.save_dir).join(format!("{}_cav.safetensors", config.experiment_name));
    vectors.save(&cav_path)?;

    let summary = CavSummary {
        layer: vectors.layer.clone(),
        cav_type: vectors.cav_type,
        n_features: vectors.cav.elem_count(),
        norm,
        saved_to: cav_path.display().to_string(),
    };

    clarc.apply_model_correction(ClarcTarget::new(&settings.cav_layer).with_alpha(settings.alpha))?;
    Ok((clarc.into_corrected_model(), summary))
}

fn run_lwo(
    model: HookedClassifier,
    options: &LwoOptions,
    loader: &DataLoader,
    config: &RunConfig,
) -> Result<(HookedClassifier, LwoOutcome)> {
    let mut lwo = Lwo::new(model, config.experiment_name.as_str());
    let outcome = lwo.apply_model_correction(loader, options)?;
    info!(
        "LWO: tau {:.3}, phi {:.3}, bias {:.3} over {} parameter tensors",
        outcome.best_tau, outcome.best_phi, outcome.best_bias, outcome.layers_optimized
    );
    Ok((lwo.into_corrected_model(), outcome))
}

fn evaluate(
    model: &HookedClassifier,
    inputs: &Tensor,
    target: &FairnessTarget,
    outputs_are_logits: bool,
) -> Result<FairnessReport> {
    let scores = model.predict_scores(inputs, outputs_are_logits)?;
    target.report(&scores, EVAL_THRESHOLD)
}

fn log_report(label: &str, report: &FairnessReport) {
    info!(
        "{}: accuracy {:.2}%, balanced {:.2}%, {} {:+.3}",
        label,
        report.accuracy * 100.0,
        report.balanced_accuracy * 100.0,
        report.metric,
        report.bias
    );
}
