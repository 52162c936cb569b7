//! Concept-based model correction (ClArC family)
//!
//! A [`Clarc`] owns the model being corrected and walks it through three
//! stages: activation extraction, CAV computation on one layer, and hook
//! installation. The hook installed in the last stage is chosen by the
//! [`ClarcMethod`] type parameter:
//!
//! - [`PClarc`]: projective correction toward the artifact-free mean
//! - [`ProbeShift`]: constant shift against the concept direction

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::activations::{self, ActivationStore};
use crate::cav::{self, CavType};
use crate::data::DataLoader;
use crate::error::CorrectionError;
use crate::hooks::{self, HookHandle};
use crate::model::HookedClassifier;

/// A post-hoc correction applied to a [`HookedClassifier`]
pub trait ModelCorrection {
    /// Arguments of [`apply_model_correction`](Self::apply_model_correction)
    type Input<'a>;
    type Output;

    fn apply_model_correction(&mut self, input: Self::Input<'_>) -> Result<Self::Output>;

    fn experiment_name(&self) -> &str;

    /// The model with the correction applied
    fn corrected_model(&self) -> &HookedClassifier;

    fn into_corrected_model(self) -> HookedClassifier
    where
        Self: Sized;

    /// Detach the hooks this correction installed; returns how many
    fn remove_hooks(&mut self) -> usize;
}

/// Concept direction and class means for one layer, stored as f32
#[derive(Debug, Clone)]
pub struct ConceptVectors {
    pub cav: Tensor,
    /// Mean activation over artifact-free samples
    pub mean_act_na: Tensor,
    /// Mean activation over artifact samples
    pub mean_act_a: Tensor,
    pub cav_type: CavType,
    pub layer: String,
}

impl ConceptVectors {
    /// Write `cav`, `mean_act_na` and `mean_act_a` to a safetensors file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tensors = HashMap::with_capacity(3);
        for (key, tensor) in [
            ("cav", &self.cav),
            ("mean_act_na", &self.mean_act_na),
            ("mean_act_a", &self.mean_act_a),
        ] {
            tensors.insert(key.to_string(), tensor.to_device(&Device::Cpu)?);
        }
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to save concept vectors to {}", path.display()))?;
        info!("Saved {} concept vectors at '{}'", self.layer, path.display());
        Ok(())
    }
}

/// Where and how strongly to apply a ClArC hook
#[derive(Debug, Clone, Copy)]
pub struct ClarcTarget<'a> {
    pub cav_layer: &'a str,
    pub alpha: f64,
}

impl<'a> ClarcTarget<'a> {
    /// Target `cav_layer` with `alpha = 1.0`
    pub fn new(cav_layer: &'a str) -> Self {
        Self { cav_layer, alpha: 1.0 }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }
}

/// Hook strategy of a [`Clarc`] correction
pub trait ClarcMethod {
    const NAME: &'static str;

    fn register(
        model: &mut HookedClassifier,
        vectors: &ConceptVectors,
        target: ClarcTarget<'_>,
    ) -> Result<Vec<HookHandle>>;
}

/// Projective ClArC: `x - alpha * ((x - z) v) vᵀ` with a unit-norm `v`
#[derive(Debug, Clone, Copy, Default)]
pub struct Projective;

impl ClarcMethod for Projective {
    const NAME: &'static str = "pclarc";

    fn register(
        model: &mut HookedClassifier,
        vectors: &ConceptVectors,
        target: ClarcTarget<'_>,
    ) -> Result<Vec<HookHandle>> {
        let v = cav::normalize(&vectors.cav)?;
        hooks::add_clarc_hook(
            model,
            &v,
            &vectors.mean_act_na,
            &[target.cav_layer.to_string()],
            target.alpha,
        )
    }
}

/// Mass-mean shift: `x - alpha * cav`
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanShift;

impl ClarcMethod for MeanShift {
    const NAME: &'static str = "probe_shift";

    fn register(
        model: &mut HookedClassifier,
        vectors: &ConceptVectors,
        target: ClarcTarget<'_>,
    ) -> Result<Vec<HookHandle>> {
        hooks::add_mass_mean_probe_hook(model, &vectors.cav, &[target.cav_layer.to_string()], target.alpha)
    }
}

/// Concept-based correction state
pub struct Clarc<M: ClarcMethod> {
    model: HookedClassifier,
    experiment_name: String,
    hooks: Vec<HookHandle>,
    activations: Option<ActivationStore>,
    vectors: Option<ConceptVectors>,
    _method: PhantomData<M>,
}

pub type PClarc = Clarc<Projective>;
pub type ProbeShift = Clarc<MeanShift>;

impl<M: ClarcMethod> Clarc<M> {
    pub fn new(model: HookedClassifier, experiment_name: impl Into<String>) -> Self {
        Self {
            model,
            experiment_name: experiment_name.into(),
            hooks: Vec::new(),
            activations: None,
            vectors: None,
            _method: PhantomData,
        }
    }

    /// Extract (or load cached) activations of `layers`
    pub fn extract_activations(
        &mut self,
        loader: &DataLoader,
        layers: Option<&[String]>,
        use_cache: bool,
        save_dir: impl AsRef<Path>,
    ) -> Result<()> {
        let store = activations::extract_activations(
            &self.model,
            loader,
            &self.experiment_name,
            layers,
            use_cache,
            save_dir,
        )?;
        self.activations = Some(store);
        Ok(())
    }

    /// Use an already extracted store
    pub fn set_activations(&mut self, store: ActivationStore) {
        self.activations = Some(store);
    }

    pub fn activations(&self) -> Option<&ActivationStore> {
        self.activations.as_ref()
    }

    /// Compute the CAV of `cav_layer` against the artifact labels
    ///
    /// The activations are dropped afterwards.
    pub fn compute_cav(&mut self, cav_type: CavType, cav_layer: &str) -> Result<&ConceptVectors> {
        let store = self
            .activations
            .as_ref()
            .ok_or(CorrectionError::MissingActivations)?;
        let labels = store.artifact_labels()?;
        let acts = store.flatten_layer(cav_layer)?;

        let result = cav::compute_cav(&acts, &labels, cav_type)?;
        let device = self.model.device();
        let to_device = |t: &Tensor| -> Result<Tensor> { Ok(t.to_dtype(DType::F32)?.to_device(device)?) };

        info!(
            "Computed {} CAV on '{}' ({} features)",
            cav_type,
            cav_layer,
            result.cav.elem_count()
        );
        if let Some(acc) = result.probe_accuracy {
            info!("Probe train accuracy: {:.2}%", acc * 100.0);
        }

        let vectors = ConceptVectors {
            cav: to_device(&result.cav)?,
            mean_act_na: to_device(&result.mean_na)?,
            mean_act_a: to_device(&result.mean_a)?,
            cav_type,
            layer: cav_layer.to_string(),
        };
        self.activations = None;
        let vectors = self.vectors.insert(vectors);
        Ok(&*vectors)
    }

    pub fn concept_vectors(&self) -> Option<&ConceptVectors> {
        self.vectors.as_ref()
    }

    /// The stored CAV, or the error explaining which stage is missing
    pub fn require_activations_and_cav(&self) -> Result<&ConceptVectors> {
        match (&self.vectors, &self.activations) {
            (Some(vectors), _) => Ok(vectors),
            (None, Some(_)) => Err(CorrectionError::MissingCav.into()),
            (None, None) => Err(CorrectionError::MissingActivations.into()),
        }
    }

    /// Install the method's hook on `target.cav_layer`
    pub fn apply_model_correction(&mut self, target: ClarcTarget<'_>) -> Result<Vec<HookHandle>> {
        anyhow::ensure!(target.alpha.is_finite(), "alpha must be finite, got {}", target.alpha);
        let vectors = self.require_activations_and_cav()?.clone();
        let handles = M::register(&mut self.model, &vectors, target)?;
        info!(
            "{}: hook registered on '{}' (alpha = {})",
            M::NAME,
            target.cav_layer,
            target.alpha
        );
        self.hooks.extend(handles.iter().copied());
        Ok(handles)
    }

    pub fn num_hooks(&self) -> usize {
        self.hooks.len()
    }
}

impl<M: ClarcMethod> ModelCorrection for Clarc<M> {
    type Input<'a> = ClarcTarget<'a>;
    type Output = Vec<HookHandle>;

    fn apply_model_correction(&mut self, input: ClarcTarget<'_>) -> Result<Vec<HookHandle>> {
        Clarc::apply_model_correction(self, input)
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
    use candle_core::{Device, IndexOp};
    use std::collections::HashMap;

    fn model() -> HookedClassifier {
        let config = ClassifierConfig {
            input_shape: vec![3],
            layers: vec![
                LayerConfig::new(
                    "fc1",
                    LayerKind::Linear {
                        out_features: 5,
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

    /// Store whose `feat` layer separates the classes along axis 1
    fn store() -> ActivationStore {
        let device = Device::Cpu;
        let acts = Tensor::new(
            &[
                [0.1f32, 0.0, 1.0],
                [0.2, 0.1, 1.0],
                [0.0, -0.1, 1.0],
                [0.1, 2.0, 1.0],
                [0.2, 2.1, 1.0],
                [0.0, 1.9, 1.0],
            ],
            &device,
        )
        .unwrap();
        let labels = Tensor::new(&[[0u32, 0], [1, 0], [0, 0], [1, 1], [0, 1], [1, 1]], &device).unwrap();
        let mut layers = HashMap::new();
        layers.insert("feat".to_string(), acts);
        ActivationStore::new(layers, Some(labels))
    }

    #[test]
    fn test_apply_requires_stages() {
        let mut clarc = PClarc::new(model(), "toy");
        let err = clarc.apply_model_correction(ClarcTarget::new("fc1")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CorrectionError>(),
            Some(CorrectionError::MissingActivations)
        ));

        clarc.set_activations(store());
        let err = clarc.apply_model_correction(ClarcTarget::new("fc1")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CorrectionError>(),
            Some(CorrectionError::MissingCav)
        ));
    }

    #[test]
    fn test_compute_cav_uses_artifact_column() {
        let mut clarc = PClarc::new(model(), "toy");
        assert!(matches!(
            clarc
                .compute_cav(CavType::MassMean, "feat")
                .unwrap_err()
                .downcast_ref::<CorrectionError>(),
            Some(CorrectionError::MissingActivations)
        ));

        clarc.set_activations(store());
        let vectors = clarc.compute_cav(CavType::MassMean, "feat").unwrap();
        let cav: Vec<f32> = vectors.cav.to_vec1().unwrap();
        assert!((cav[1] - 2.0).abs() < 1e-5);
        assert!(cav[0].abs() < 1e-5);
        assert_eq!(vectors.mean_act_na.dtype(), DType::F32);
        assert_eq!(vectors.layer, "feat");

        // activations are released once the CAV exists
        assert!(clarc.activations().is_none());
        assert!(clarc.require_activations_and_cav().is_ok());
    }

    #[test]
    fn test_pclarc_hook_projects_out_concept() {
        let device = Device::Cpu;
        let mut clarc = PClarc::new(model(), "toy");
        let mut layers = HashMap::new();
        // samples differ only along fc1 unit 0
        layers.insert(
            "fc1".to_string(),
            Tensor::new(
                &[
                    [0f32, 1.0, 1.0, 1.0, 1.0],
                    [0.0, 1.0, 1.0, 1.0, 1.0],
                    [3.0, 1.0, 1.0, 1.0, 1.0],
                    [3.0, 1.0, 1.0, 1.0, 1.0],
                ],
                &device,
            )
            .unwrap(),
        );
        let labels = Tensor::new(&[[0u32, 0], [0, 0], [1, 1], [1, 1]], &device).unwrap();
        clarc.set_activations(ActivationStore::new(layers, Some(labels)));
        clarc.compute_cav(CavType::MassMean, "fc1").unwrap();

        let handles = clarc.apply_model_correction(ClarcTarget::new("fc1")).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(clarc.corrected_model().num_hooks(), 1);

        let x = Tensor::new(&[[1f32, -2.0, 0.5], [0.3, 0.3, 0.3]], &device).unwrap();
        let cache = clarc.corrected_model().forward_with_capture(&x, &["fc1"]).unwrap();
        let fc1 = cache.require("fc1").unwrap();
        // the concept unit is pinned to the artifact-free mean
        let unit0: Vec<f32> = fc1.i((.., 0)).unwrap().to_vec1().unwrap();
        for v in unit0 {
            assert!(v.abs() < 1e-4);
        }

        assert_eq!(clarc.remove_hooks(), 1);
        assert_eq!(clarc.corrected_model().num_hooks(), 0);
    }

    #[test]
    fn test_probe_shift_subtracts_cav() {
        let device = Device::Cpu;
        let mut shift = ProbeShift::new(model(), "toy");
        shift.set_activations(store());
        shift.compute_cav(CavType::MassMean, "feat").unwrap();
        // the "feat" layer is not part of the model
        let err = shift.apply_model_correction(ClarcTarget::new("feat")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CorrectionError>(),
            Some(CorrectionError::UnknownLayer(_))
        ));

        let mut layers = HashMap::new();
        layers.insert("head".to_string(), Tensor::new(&[[0f32, 0.0], [1.0, 2.0]], &device).unwrap());
        let labels = Tensor::new(&[[0u32, 0], [1, 1]], &device).unwrap();
        shift.set_activations(ActivationStore::new(layers, Some(labels)));
        shift.compute_cav(CavType::MassMean, "head").unwrap();

        let x = Tensor::new(&[[1f32, 1.0, 1.0]], &device).unwrap();
        let before: Vec<Vec<f32>> = shift.corrected_model().forward(&x).unwrap().to_vec2().unwrap();
        shift
            .apply_model_correction(ClarcTarget::new("head").with_alpha(0.5))
            .unwrap();
        let after: Vec<Vec<f32>> = shift.corrected_model().forward(&x).unwrap().to_vec2().unwrap();
        assert!((before[0][0] - after[0][0] - 0.5).abs() < 1e-5);
        assert!((before[0][1] - after[0][1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_extract_then_correct() {
        let dir = tempfile::tempdir().unwrap();
        let samples = (0..12)
            .map(|i| Sample {
                features: vec![i as f32 * 0.1, 1.0, if i % 2 == 0 { 2.0 } else { -2.0 }],
                label: (i % 2) as u32,
                group: (i % 2) as u32,
            })
            .collect();
        let dataset = Dataset::new(vec![3], samples).unwrap();
        let loader = DataLoader::new(dataset, 5, &Device::Cpu).unwrap();

        let mut clarc = PClarc::new(model(), "extract_then_correct");
        clarc
            .extract_activations(&loader, Some(&["fc1".to_string()][..]), false, dir.path())
            .unwrap();
        assert_eq!(clarc.activations().unwrap().n_samples().unwrap(), 12);
        let vectors = clarc.compute_cav(CavType::MassMean, "fc1").unwrap();
        let cav_path = dir.path().join("fc1_cav.safetensors");
        vectors.save(&cav_path).unwrap();
        let saved = candle_core::safetensors::load(&cav_path, &Device::Cpu).unwrap();
        for key in ["cav", "mean_act_na", "mean_act_a"] {
            assert_eq!(saved[key].dims(), vectors.cav.dims());
        }
        clarc.apply_model_correction(ClarcTarget::new("fc1")).unwrap();
        assert_eq!(clarc.experiment_name(), "extract_then_correct");

        let model = clarc.into_corrected_model();
        assert_eq!(model.num_hooks(), 1);
    }
}
