// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // f64→f32 when writing weights back
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::many_single_char_names)] // x, y, z, v standard in math
#![allow(clippy::similar_names)] // related variables like `mean_na`/`mean_a`
#![allow(clippy::module_name_repetitions)] // LwoOptions in lwo.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::float_cmp)] // exact comparisons on bracket endpoints

//! clarc-rs: post-hoc bias correction for neural classifiers
//!
//! Finds the direction a trained classifier uses to encode a spurious
//! artifact and removes it at inference time, or perturbs the weights
//! directly under a fairness constraint.
//!
//! ## Architecture
//!
//! - `model`: HookedClassifier, a candle network of named layers with forward hooks
//! - `hooks`: Hook registry, capture cache and the correction hooks
//! - `data`: Labelled datasets and the batch loader
//! - `activations`: Activation extraction with a safetensors cache
//! - `cav`: Concept activation vectors (mass-mean and logistic probes)
//! - `correction`: ClArC-family corrections (P-ClArC, probe shift)
//! - `fairness`: Bias metrics and the fairness-constrained objective
//! - `optim`: Surrogate-model and bounded scalar optimizers
//! - `lwo`: Layer-wise weight optimization
//! - `config`: JSON run configuration
//! - `experiment`: Experiment runner coordinating the full pipeline

pub mod activations;
pub mod cav;
pub mod config;
pub mod correction;
pub mod data;
pub mod error;
pub mod experiment;
pub mod fairness;
pub mod hooks;
pub mod lwo;
pub mod model;
pub mod optim;

pub use activations::{extract_activations, ActivationStore};
pub use cav::{compute_cav, compute_mass_mean_probe, CavResult, CavType, LinearProbe};
pub use config::{ClarcConfig, DeviceChoice, MethodConfig, RunConfig};
pub use correction::{
    Clarc, ClarcMethod, ClarcTarget, ConceptVectors, MeanShift, ModelCorrection, PClarc, ProbeShift, Projective,
};
pub use data::{unpack_batches, Batch, DataLoader, Dataset, Sample};
pub use error::CorrectionError;
pub use experiment::{CavSummary, Experiment, ExperimentResults};
pub use fairness::{BiasMetric, FairnessReport, FairnessTarget};
pub use hooks::{
    add_clarc_hook, add_mass_mean_probe_hook, ClarcHook, ForwardHook, HookCache, HookHandle, HookRegistry,
    MassMeanProbeHook, SoftThresholdHook,
};
pub use lwo::{Lwo, LwoOptions, LwoOutcome};
pub use model::{select_device, ClassifierConfig, HookedClassifier, LayerConfig, LayerKind};
pub use optim::{minimize_scalar_bounded, GbrtMinimizer, OptimizeResult, Real, ScalarResult};
