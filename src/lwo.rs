//! Layer-wise weight optimization (LWO)
//!
//! Parameter tensors are visited from the last to the first. For each one a
//! random subset of rows is perturbed by a surrogate-model black-box search
//! that maximizes the fairness-constrained objective at a fixed threshold.
//! When a tensor improves on the best objective seen so far, the decision
//! threshold is re-tuned with a bounded scalar search and the model is
//! snapshotted. The best snapshot is restored at the end and the tuned
//! threshold is installed as a soft-threshold hook on the output layer.

use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::{debug, info, warn};

use crate::correction::ModelCorrection;
use crate::data::{unpack_batches, DataLoader};
use crate::error::CorrectionError;
use crate::fairness::{BiasMetric, FairnessTarget};
use crate::hooks::{HookHandle, SoftThresholdHook};
use crate::model::HookedClassifier;
use crate::optim::{minimize_scalar_bounded, GbrtMinimizer, Real, ScalarResult, DEFAULT_XATOL};

/// Random evaluations the surrogate search makes before fitting trees
const SURROGATE_INITIAL_POINTS: usize = 10;

fn default_epsilon() -> f64 {
    0.05
}

fn default_frac() -> f64 {
    1.0
}

fn default_optimizer_maxiter() -> usize {
    10
}

fn default_thresh_maxiter() -> usize {
    100
}

fn default_beta() -> f64 {
    2.2
}

fn default_neuron_frac() -> f64 {
    0.1
}

fn default_tau_init() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

/// Options for [`Lwo::apply_model_correction`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LwoOptions {
    /// Layer that receives the soft-threshold hook
    pub last_layer_name: String,
    /// Largest tolerated absolute bias
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub bias_metric: BiasMetric,
    #[serde(default = "default_frac")]
    pub frac_of_batches_to_use: f64,
    /// Trailing parameter tensors to optimize (`None` = all)
    #[serde(default)]
    pub n_layers_to_optimize: Option<usize>,
    /// Objective evaluations per parameter tensor
    #[serde(default = "default_optimizer_maxiter")]
    pub optimizer_maxiter: usize,
    #[serde(default = "default_thresh_maxiter")]
    pub thresh_optimizer_maxiter: usize,
    /// Search half-width, in standard deviations of the tensor
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Fraction of rows (output neurons) perturbed per tensor
    #[serde(default = "default_neuron_frac")]
    pub neuron_frac: f64,
    #[serde(default = "default_tau_init")]
    pub tau_init: f64,
    #[serde(default = "default_true")]
    pub outputs_are_logits: bool,
    #[serde(default)]
    pub seed: u64,
}

impl LwoOptions {
    pub fn new(last_layer_name: impl Into<String>) -> Self {
        Self {
            last_layer_name: last_layer_name.into(),
            epsilon: default_epsilon(),
            bias_metric: BiasMetric::default(),
            frac_of_batches_to_use: default_frac(),
            n_layers_to_optimize: None,
            optimizer_maxiter: default_optimizer_maxiter(),
            thresh_optimizer_maxiter: default_thresh_maxiter(),
            beta: default_beta(),
            neuron_frac: default_neuron_frac(),
            tau_init: default_tau_init(),
            outputs_are_logits: true,
            seed: 0,
        }
    }

    /// Check value ranges (model-dependent checks happen at apply time)
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(CorrectionError::InvalidOption(msg).into()) };

        if self.last_layer_name.is_empty() {
            return invalid("last_layer_name is empty".into());
        }
        if !(0.0..=1.0).contains(&self.frac_of_batches_to_use) {
            return invalid(format!(
                "frac_of_batches_to_use must be in [0, 1], got {}",
                self.frac_of_batches_to_use
            ));
        }
        if !(self.epsilon.is_finite() && self.epsilon >= 0.0) {
            return invalid(format!("epsilon must be non-negative, got {}", self.epsilon));
        }
        if !(self.beta.is_finite() && self.beta > 0.0) {
            return invalid(format!("beta must be positive, got {}", self.beta));
        }
        if !(self.neuron_frac > 0.0 && self.neuron_frac <= 1.0) {
            return invalid(format!("neuron_frac must be in (0, 1], got {}", self.neuron_frac));
        }
        if !(0.0..=1.0).contains(&self.tau_init) {
            return invalid(format!("tau_init must be in [0, 1], got {}", self.tau_init));
        }
        if self.optimizer_maxiter == 0 || self.thresh_optimizer_maxiter == 0 {
            return invalid("optimizer iteration budgets must be positive".into());
        }
        Ok(())
    }
}

/// Result of a layer-wise optimization run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LwoOutcome {
    /// Threshold installed by the soft-threshold hook
    pub best_tau: f64,
    pub best_phi: f64,
    pub best_bias: f64,
    /// Parameter tensors visited
    pub layers_optimized: usize,
    /// False when no threshold search improved the objective and
    /// `tau_init` was installed instead
    pub tau_tuned: bool,
}

/// Evaluation inputs held for the duration of a run
#[derive(Debug, Clone)]
struct EvalSet {
    inputs: Tensor,
    target: FairnessTarget,
}

/// Outcome of the surrogate search on one parameter tensor
struct ParameterSearch {
    original: Tensor,
    best: Tensor,
    phi: f64,
    n_weights: usize,
}

/// Flat positions of whole rows sampled from a parameter tensor
#[derive(Debug, Clone)]
struct RowSelection {
    positions: Vec<usize>,
}

impl RowSelection {
    /// Sample `max(floor(frac * rows), 1)` rows along dim 0 without
    /// replacement; a scalar counts as one row
    fn sample<R: Rng>(shape: &[usize], frac: f64, rng: &mut R) -> Self {
        let n_elems: usize = shape.iter().product();
        let rows = shape.first().copied().unwrap_or(1).max(1);
        let row_len = n_elems / rows;
        let n_rows = ((frac * rows as f64) as usize).clamp(1, rows);

        let mut picked = index::sample(rng, rows, n_rows).into_vec();
        picked.sort_unstable();
        let positions = picked
            .iter()
            .flat_map(|&r| r * row_len..(r + 1) * row_len)
            .collect();
        Self { positions }
    }

    fn len(&self) -> usize {
        self.positions.len()
    }

    fn gather(&self, values: &[f32]) -> Vec<f64> {
        self.positions.iter().map(|&p| f64::from(values[p])).collect()
    }

    /// Copy of `base` with the selected positions replaced by `x`
    fn scatter(&self, base: &[f32], x: &[f64]) -> Vec<f32> {
        let mut out = base.to_vec();
        for (&p, &v) in self.positions.iter().zip(x) {
            out[p] = v as f32;
        }
        out
    }
}

/// Layer-wise weight optimization of a binary classifier
pub struct Lwo {
    model: HookedClassifier,
    experiment_name: String,
    hooks: Vec<HookHandle>,
    eval: Option<EvalSet>,
    outputs_are_logits: bool,
    best_tau: Option<f64>,
    best_parameters: Option<Vec<Tensor>>,
}

impl Lwo {
    pub fn new(model: HookedClassifier, experiment_name: impl Into<String>) -> Self {
        let outputs_are_logits = model.outputs_are_logits();
        Self {
            model,
            experiment_name: experiment_name.into(),
            hooks: Vec::new(),
            eval: None,
            outputs_are_logits,
            best_tau: None,
            best_parameters: None,
        }
    }

    /// Threshold installed by the last run
    pub fn best_tau(&self) -> Option<f64> {
        self.best_tau
    }

    /// Parameters snapshotted when the installed threshold was tuned
    pub fn best_parameters(&self) -> Option<&[Tensor]> {
        self.best_parameters.as_deref()
    }

    pub fn num_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Run layer-wise optimization and install the tuned threshold
    pub fn apply_model_correction(&mut self, loader: &DataLoader, options: &LwoOptions) -> Result<LwoOutcome> {
        options.validate()?;
        if !self.model.layer_exists(&options.last_layer_name) {
            return Err(CorrectionError::UnknownLayer(options.last_layer_name.clone()).into());
        }
        let total = self.model.n_parameter_tensors();
        let n_layers = options.n_layers_to_optimize.unwrap_or(total);
        if n_layers > total {
            return Err(CorrectionError::InvalidOption(format!(
                "n_layers_to_optimize ({n_layers}) exceeds the {total} parameter tensors"
            ))
            .into());
        }

        self.remove_hooks();
        self.best_parameters = None;
        self.outputs_are_logits = options.outputs_are_logits;

        let batch = unpack_batches(loader, options.frac_of_batches_to_use)?;
        let y_true: Vec<u32> = batch.labels.to_vec1()?;
        let groups: Vec<u32> = batch.groups.to_vec1()?;
        let target = FairnessTarget::new(y_true, groups, options.epsilon, options.bias_metric)?;
        info!(
            "Layer-wise optimization: {} samples, {} of {} parameter tensors",
            target.len(),
            n_layers,
            total
        );
        self.eval = Some(EvalSet {
            inputs: batch.inputs,
            target,
        });

        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut best_phi = -1.0;
        let mut best_bias: Option<f64> = None;
        let mut best_tau: Option<f64> = None;
        let mut best_snapshot = self.model.snapshot()?;
        let mut layers_optimized = 0;

        for index in (total - n_layers..total).rev() {
            let name = self.model.parameters()[index].0.clone();
            let Some(search) = self.search_parameter(index, options, &mut rng)? else {
                debug!("Skipping constant parameter {}", name);
                continue;
            };
            layers_optimized += 1;
            debug!(
                "{}: perturbed {} weights, phi at tau_init: {:.4}",
                name, search.n_weights, search.phi
            );

            if search.phi > best_phi {
                self.model.set_parameter(index, &search.best)?;

                let res = self.objective_thresh(options.thresh_optimizer_maxiter)?;
                if res.success {
                    let tau = res.x;
                    let phi = -res.fun;
                    let (_, bias) = self.phi_at(tau, None)?;
                    info!("tau: {:.3}, phi: {:.3}, bias: {:.3}", tau, phi, bias);

                    if phi > best_phi {
                        best_tau = Some(tau);
                        best_phi = phi;
                        best_bias = Some(bias);
                        best_snapshot = self.model.snapshot()?;
                    }
                } else {
                    warn!("Threshold optimization failed: {}", res.message);
                }
            } else {
                self.model.set_parameter(index, &search.original)?;
            }

            info!(
                "Layer-wise optimization. Parameter {} ({}/{}). (global best phi: {:.3}, tau: {}, bias: {})",
                name,
                layers_optimized,
                n_layers,
                best_phi,
                fmt_opt(best_tau),
                fmt_opt(best_bias)
            );
        }

        self.model.restore(&best_snapshot)?;
        if best_tau.is_some() {
            self.best_parameters = Some(best_snapshot);
        }

        let (tau, phi, bias, tau_tuned) = match (best_tau, best_bias) {
            (Some(tau), Some(bias)) => (tau, best_phi, bias, true),
            _ => {
                warn!(
                    "No threshold improved the objective; falling back to tau_init = {}",
                    options.tau_init
                );
                let (phi, bias) = self.phi_at(options.tau_init, None)?;
                (options.tau_init, phi, bias, false)
            }
        };

        self.apply_hook(&options.last_layer_name, tau)?;
        self.best_tau = Some(tau);

        Ok(LwoOutcome {
            best_tau: tau,
            best_phi: phi,
            best_bias: bias,
            layers_optimized,
            tau_tuned,
        })
    }

    /// Class-1 scores of the current model on the evaluation batch
    ///
    /// Once the soft-threshold hook is installed the model already emits
    /// probabilities, so no softmax is applied.
    pub fn predict_scores(&self) -> Result<Vec<f32>> {
        let eval = self.eval_set()?;
        let logits = self.outputs_are_logits && self.hooks.is_empty();
        self.model.predict_scores(&eval.inputs, logits)
    }

    /// `(phi, bias)` at threshold `tau`, on `scores` or fresh predictions
    pub fn phi_at(&self, tau: f64, scores: Option<&[f32]>) -> Result<(f64, f64)> {
        let eval = self.eval_set()?;
        match scores {
            Some(scores) => eval.target.phi_at_threshold(scores, tau),
            None => eval.target.phi_at_threshold(&self.predict_scores()?, tau),
        }
    }

    /// Maximize phi over `tau` in `[0, 1]` on cached predictions
    pub fn objective_thresh(&self, maxiter: usize) -> Result<ScalarResult> {
        let eval = self.eval_set()?;
        let scores = self.predict_scores()?;
        minimize_scalar_bounded(
            |tau| Ok(-eval.target.phi_at_threshold(&scores, tau)?.0),
            (0.0, 1.0),
            maxiter,
            DEFAULT_XATOL,
        )
    }

    fn eval_set(&self) -> Result<&EvalSet> {
        self.eval
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no evaluation batch; run apply_model_correction first"))
    }

    /// Surrogate search over sampled rows of parameter `index`
    ///
    /// The live parameter holds the last candidate on return; the caller
    /// installs `best` or restores `original`. Returns `None` for a tensor
    /// with zero spread, which has an empty search box.
    fn search_parameter(
        &self,
        index: usize,
        options: &LwoOptions,
        rng: &mut StdRng,
    ) -> Result<Option<ParameterSearch>> {
        let eval = self.eval_set()?;
        let original = self.model.parameters()[index].1.as_tensor().copy()?;
        let shape = original.dims().to_vec();
        let values: Vec<f32> = original.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;

        let std = values.iter().map(|&v| f64::from(v)).population_std_dev();
        if !(std.is_finite() && std > 0.0) {
            return Ok(None);
        }

        let selection = RowSelection::sample(&shape, options.neuron_frac, rng);
        let x0 = selection.gather(&values);
        let space: Vec<Real> = x0
            .iter()
            .map(|&x| Real::new(x - options.beta * std, x + options.beta * std))
            .collect();

        let mut optimizer = GbrtMinimizer::new(space)?
            .with_n_calls(options.optimizer_maxiter)
            .with_initial_points(options.optimizer_maxiter.min(SURROGATE_INITIAL_POINTS))
            .with_seed(rng.gen())
            .with_x0(x0)?;

        let device = self.model.device().clone();
        let result = optimizer.minimize(|x| {
            let candidate = Tensor::from_vec(selection.scatter(&values, x), shape.clone(), &device)?;
            self.model.set_parameter(index, &candidate)?;
            let scores = self.model.predict_scores(&eval.inputs, options.outputs_are_logits)?;
            let (phi, _) = eval.target.phi_at_threshold(&scores, options.tau_init)?;
            Ok(-phi)
        })?;

        let best = Tensor::from_vec(selection.scatter(&values, &result.x), shape, &device)?;
        Ok(Some(ParameterSearch {
            original,
            best,
            phi: -result.fun,
            n_weights: selection.len(),
        }))
    }

    fn apply_hook(&mut self, layer: &str, tau: f64) -> Result<()> {
        let hook = Arc::new(SoftThresholdHook::new(tau, self.outputs_are_logits));
        let handle = self.model.register_forward_hook(layer, hook)?;
        info!("Hook registered on layer: {}, threshold: {:.4}", layer, tau);
        self.hooks.push(handle);
        Ok(())
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map_or_else(|| "none".to_string(), |v| format!("{v:.3}"))
}

impl ModelCorrection for Lwo {
    type Input<'a> = (&'a DataLoader, &'a LwoOptions);
    type Output = LwoOutcome;

    fn apply_model_correction(&mut self, (loader, options): Self::Input<'_>) -> Result<LwoOutcome> {
        Lwo::apply_model_correction(self, loader, options)
    }

    fn experiment_name(&self) -> &str {
        &self.experiment_name
    }

    fn corrected_model(&self) -> &HookedClassifier {
        &self.model
    }

    fn into_corrected_model(self) -> HookedClassifier {
        self.model
    }

    fn remove_hooks(&mut self) -> usize {
        let n = self.hooks.len();
        for handle in self.hooks.drain(..) {
            self.model.remove_hook(handle);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, Sample};
    use crate::model::{ClassifierConfig, LayerConfig, LayerKind};
    use candle_core::Device;

    fn tiny_model() -> HookedClassifier {
        let config = ClassifierConfig {
            input_shape: vec![2],
            layers: vec![
                LayerConfig::new(
                    "fc1",
                    LayerKind::Linear {
                        out_features: 4,
                        bias: true,
                    },
                ),
                LayerConfig::new("act", LayerKind::Relu),
                LayerConfig::new(
                    "head",
                    LayerKind::Linear {
                        out_features: 2,
                        bias: true,
                    },
                ),
            ],
            outputs_are_logits: true,
        };
        HookedClassifier::new(config, &Device::Cpu).unwrap()
    }

    fn loader() -> DataLoader {
        let samples = (0..40)
            .map(|i| {
                let label = (i % 2) as u32;
                let group = u32::from(i % 4 < 2);
                let sign = if label == 1 { 1.0 } else { -1.0 };
                Sample {
                    features: vec![sign + 0.05 * i as f32, group as f32 - 0.5],
                    label,
                    group,
                }
            })
            .collect();
        let dataset = Dataset::new(vec![2], samples).unwrap();
        DataLoader::new(dataset, 8, &Device::Cpu).unwrap()
    }

    /// Every sample positive and in group 0: the TPR gap equals the
    /// overall TPR, so with `epsilon = 0` phi is 0 for any weights
    fn flat_objective_loader() -> DataLoader {
        let samples = (0..16)
            .map(|i| Sample {
                features: vec![0.1 * i as f32, 1.0 - 0.05 * i as f32],
                label: 1,
                group: 0,
            })
            .collect();
        let dataset = Dataset::new(vec![2], samples).unwrap();
        DataLoader::new(dataset, 4, &Device::Cpu).unwrap()
    }

    fn assert_same_parameters(a: &[Tensor], b: &[Tensor]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            let x: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
            let y: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(x, y);
        }
    }

    fn quick_options() -> LwoOptions {
        LwoOptions {
            n_layers_to_optimize: Some(2),
            optimizer_maxiter: 4,
            thresh_optimizer_maxiter: 30,
            neuron_frac: 0.5,
            epsilon: 1.0,
            ..LwoOptions::new("head")
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(LwoOptions::new("head").validate().is_ok());
        let bad = LwoOptions {
            frac_of_batches_to_use: 1.5,
            ..LwoOptions::new("head")
        };
        assert!(bad.validate().is_err());
        let bad = LwoOptions {
            neuron_frac: 0.0,
            ..LwoOptions::new("head")
        };
        assert!(bad.validate().is_err());
        assert!(LwoOptions::new("").validate().is_err());
    }

    #[test]
    fn test_options_defaults_from_json() {
        let options: LwoOptions = serde_json::from_str(r#"{"last_layer_name": "head"}"#).unwrap();
        assert_eq!(options.epsilon, 0.05);
        assert_eq!(options.bias_metric, BiasMetric::EoGap);
        assert_eq!(options.optimizer_maxiter, 10);
        assert_eq!(options.thresh_optimizer_maxiter, 100);
        assert_eq!(options.beta, 2.2);
        assert_eq!(options.neuron_frac, 0.1);
        assert_eq!(options.tau_init, 0.5);
        assert!(options.outputs_are_logits);
        assert!(options.n_layers_to_optimize.is_none());
    }

    #[test]
    fn test_row_selection_takes_whole_rows() {
        let mut rng = StdRng::seed_from_u64(3);
        let selection = RowSelection::sample(&[4, 3], 0.5, &mut rng);
        assert_eq!(selection.len(), 6);
        for chunk in selection.positions.chunks(3) {
            assert_eq!(chunk[0] % 3, 0);
            assert_eq!(chunk[1], chunk[0] + 1);
            assert_eq!(chunk[2], chunk[0] + 2);
        }

        let base: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let gathered = selection.gather(&base);
        let doubled: Vec<f64> = gathered.iter().map(|v| v * 2.0).collect();
        let out = selection.scatter(&base, &doubled);
        for (i, v) in out.iter().enumerate() {
            if selection.positions.contains(&i) {
                assert_eq!(*v, 2.0 * i as f32);
            } else {
                assert_eq!(*v, i as f32);
            }
        }

        // at least one row, scalars are one row
        assert_eq!(RowSelection::sample(&[10, 2], 0.01, &mut rng).len(), 2);
        assert_eq!(RowSelection::sample(&[], 0.1, &mut rng).len(), 1);
    }

    #[test]
    fn test_unknown_last_layer() {
        let mut lwo = Lwo::new(tiny_model(), "toy");
        let err = lwo
            .apply_model_correction(&loader(), &LwoOptions::new("missing"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CorrectionError>(),
            Some(CorrectionError::UnknownLayer(_))
        ));
    }

    #[test]
    fn test_too_many_layers() {
        let mut lwo = Lwo::new(tiny_model(), "toy");
        let options = LwoOptions {
            n_layers_to_optimize: Some(5),
            ..LwoOptions::new("head")
        };
        let err = lwo.apply_model_correction(&loader(), &options).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CorrectionError>(),
            Some(CorrectionError::InvalidOption(_))
        ));
    }

    #[test]
    fn test_objective_requires_run() {
        let lwo = Lwo::new(tiny_model(), "toy");
        assert!(lwo.predict_scores().is_err());
        assert!(lwo.objective_thresh(10).is_err());
    }

    #[test]
    fn test_apply_installs_threshold_hook() {
        let loader = loader();
        let mut lwo = Lwo::new(tiny_model(), "toy");
        let untouched: Vec<Tensor> = lwo.corrected_model().snapshot().unwrap();

        let outcome = lwo.apply_model_correction(&loader, &quick_options()).unwrap();
        assert_eq!(outcome.layers_optimized, 2);
        assert!((0.0..=1.0).contains(&outcome.best_tau));
        assert!(outcome.best_phi >= 0.0);
        assert_eq!(lwo.best_tau(), Some(outcome.best_tau));
        assert_eq!(lwo.num_hooks(), 1);

        // first-layer parameters are outside the optimized range
        let after = lwo.corrected_model().snapshot().unwrap();
        for i in 0..2 {
            let a: Vec<f32> = untouched[i].flatten_all().unwrap().to_vec1().unwrap();
            let b: Vec<f32> = after[i].flatten_all().unwrap().to_vec1().unwrap();
            assert_eq!(a, b);
        }

        // outputs are now probabilities
        let x = Tensor::new(&[[1f32, 0.5], [-1.0, -0.5]], &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = lwo.corrected_model().forward(&x).unwrap().to_vec2().unwrap();
        for row in out {
            assert!((row[0] + row[1] - 1.0).abs() < 1e-5);
        }

        // the reported objective matches a re-evaluation through the hook
        let (phi, bias) = lwo.phi_at(0.5, None).unwrap();
        assert!(phi >= 0.0);
        assert!(bias.abs() <= 1.0);

        assert_eq!(lwo.remove_hooks(), 1);
        assert_eq!(lwo.corrected_model().num_hooks(), 0);
    }

    #[test]
    fn test_rejected_tensors_are_restored() {
        let mut lwo = Lwo::new(tiny_model(), "toy");
        let before = lwo.corrected_model().snapshot().unwrap();
        let options = LwoOptions {
            n_layers_to_optimize: None,
            optimizer_maxiter: 5,
            thresh_optimizer_maxiter: 100,
            neuron_frac: 1.0,
            epsilon: 0.0,
            ..LwoOptions::new("head")
        };

        let outcome = lwo.apply_model_correction(&flat_objective_loader(), &options).unwrap();
        assert_eq!(outcome.layers_optimized, 4);
        // only head.bias (visited first) beats the initial best of -1
        assert!(outcome.tau_tuned);
        assert_eq!(outcome.best_phi, 0.0);

        // the three later searches never beat phi = 0 and are undone exactly
        let after = lwo.corrected_model().snapshot().unwrap();
        assert_same_parameters(&before[..3], &after[..3]);

        // the model ends on the snapshot taken when the threshold was tuned
        let recorded = lwo.best_parameters().unwrap();
        assert_same_parameters(recorded, &after);
    }

    #[test]
    fn test_same_seed_same_outcome() {
        let first_model = tiny_model();
        let initial = first_model.snapshot().unwrap();
        let second_model = tiny_model();
        second_model.restore(&initial).unwrap();

        let options = LwoOptions {
            seed: 11,
            ..quick_options()
        };
        let loader = loader();
        let mut a = Lwo::new(first_model, "a");
        let mut b = Lwo::new(second_model, "b");
        let outcome_a = a.apply_model_correction(&loader, &options).unwrap();
        let outcome_b = b.apply_model_correction(&loader, &options).unwrap();

        assert_eq!(outcome_a.best_tau, outcome_b.best_tau);
        assert_eq!(outcome_a.best_phi, outcome_b.best_phi);
        assert_eq!(outcome_a.best_bias, outcome_b.best_bias);
        assert_eq!(outcome_a.tau_tuned, outcome_b.tau_tuned);
        assert_same_parameters(
            &a.corrected_model().snapshot().unwrap(),
            &b.corrected_model().snapshot().unwrap(),
        );
    }

    #[test]
    fn test_zero_layers_falls_back_to_tau_init() {
        let mut lwo = Lwo::new(tiny_model(), "toy");
        let options = LwoOptions {
            n_layers_to_optimize: Some(0),
            tau_init: 0.4,
            ..quick_options()
        };
        let outcome = lwo.apply_model_correction(&loader(), &options).unwrap();
        assert_eq!(outcome.layers_optimized, 0);
        assert!(!outcome.tau_tuned);
        assert_eq!(outcome.best_tau, 0.4);
        assert!(lwo.best_parameters().is_none());
        assert_eq!(lwo.num_hooks(), 1);
    }
}
