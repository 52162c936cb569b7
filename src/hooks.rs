//! Forward hooks for reading and rewriting layer outputs
//!
//! A hook is attached to a named layer of a [`HookedClassifier`] and is
//! called with that layer's output every forward pass. Returning
//! `Some(tensor)` replaces the output for the rest of the network; hooks on
//! the same layer run in registration order and each sees the output of the
//! previous one.
//!
//! ## Correction hooks
//!
//! - [`ClarcHook`]: P-ClArC projection. Removes the component of the
//!   activation along the concept direction, measured relative to the
//!   artifact-free mean.
//! - [`MassMeanProbeHook`]: subtracts a scaled probe vector from the
//!   activation.
//! - [`SoftThresholdHook`]: rewrites a binary classifier's output into
//!   soft-thresholded class probabilities around a tuned threshold.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use candle_core::{IndexOp, Tensor};
use tracing::debug;

use crate::error::CorrectionError;
use crate::model::HookedClassifier;

/// Added to the concept vector and mean activation before projecting
pub const STABILIZE_EPS: f64 = 1e-8;

/// Sharpness of the sigmoid used by [`SoftThresholdHook`]
pub const SOFT_THRESHOLD_SHARPNESS: f64 = 10.0;

/// Callback invoked on a layer's output during the forward pass
pub trait ForwardHook: Send + Sync + fmt::Debug {
    /// Inspect or rewrite `output` produced by `layer`.
    ///
    /// `Ok(None)` keeps the output unchanged.
    fn call(&self, layer: &str, output: &Tensor) -> Result<Option<Tensor>>;
}

/// Handle returned on registration, used to remove the hook later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    id: u64,
}

impl HookHandle {
    /// Numeric id of the registration
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Registered hooks, keyed by layer name, in registration order
#[derive(Debug, Default)]
pub struct HookRegistry {
    next_id: u64,
    entries: Vec<(HookHandle, String, Arc<dyn ForwardHook>)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` on `layer`. Layer existence is checked by the model.
    pub fn register(&mut self, layer: impl Into<String>, hook: Arc<dyn ForwardHook>) -> HookHandle {
        let handle = HookHandle { id: self.next_id };
        self.next_id += 1;
        self.entries.push((handle, layer.into(), hook));
        handle
    }

    /// Remove a hook; returns false if the handle was already removed
    pub fn remove(&mut self, handle: HookHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(h, _, _)| *h != handle);
        self.entries.len() != before
    }

    /// Remove every hook
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check whether any hook targets `layer`
    pub fn has_hooks_on(&self, layer: &str) -> bool {
        self.entries.iter().any(|(_, l, _)| l == layer)
    }

    /// Run all hooks registered on `layer` over `output`
    pub fn apply(&self, layer: &str, output: Tensor) -> Result<Tensor> {
        let mut current = output;
        for (_, _, hook) in self.entries.iter().filter(|(_, l, _)| l == layer) {
            if let Some(replaced) = hook.call(layer, &current)? {
                current = replaced;
            }
        }
        Ok(current)
    }
}

/// Layer outputs captured during a forward pass, plus the model output
#[derive(Debug)]
pub struct HookCache {
    output: Tensor,
    captures: HashMap<String, Tensor>,
}

impl HookCache {
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
        }
    }

    /// Model output (logits or probabilities)
    pub fn output(&self) -> &Tensor {
        &self.output
    }

    pub fn into_output(self) -> Tensor {
        self.output
    }

    pub fn get(&self, layer: &str) -> Option<&Tensor> {
        self.captures.get(layer)
    }

    /// Retrieve a captured tensor, failing if `layer` was not captured
    pub fn require(&self, layer: &str) -> Result<&Tensor> {
        self.captures
            .get(layer)
            .ok_or_else(|| anyhow::anyhow!("layer '{layer}' was not captured"))
    }

    pub fn store(&mut self, layer: impl Into<String>, tensor: Tensor) {
        self.captures.insert(layer.into(), tensor);
    }

    pub fn set_output(&mut self, output: Tensor) {
        self.output = output;
    }

    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }
}

// ============================================================================
// Correction hooks
// ============================================================================

/// P-ClArC projection hook
///
/// For a flattened activation `x` of shape `(B, N)`, a concept vector `v`
/// and the artifact-free mean `z`:
///
/// ```text
/// out = x - alpha * ((x - z) v) vᵀ
/// ```
///
/// Both `v` and `z` are offset by [`STABILIZE_EPS`]. The output is reshaped
/// back to the layer's original shape.
#[derive(Debug, Clone)]
pub struct ClarcHook {
    cav: Tensor,
    mean_length: Tensor,
    alpha: f64,
}

impl ClarcHook {
    pub fn new(cav: Tensor, mean_length: Tensor, alpha: f64) -> Result<Self> {
        let cav = cav.flatten_all()?;
        let mean_length = mean_length.flatten_all()?;
        anyhow::ensure!(
            cav.elem_count() == mean_length.elem_count(),
            "CAV has {} elements but mean activation has {}",
            cav.elem_count(),
            mean_length.elem_count()
        );
        Ok(Self {
            cav,
            mean_length,
            alpha,
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

impl ForwardHook for ClarcHook {
    fn call(&self, layer: &str, output: &Tensor) -> Result<Option<Tensor>> {
        let shape = output.dims().to_vec();
        let x = output.flatten_from(1)?;
        let n = x.dim(1)?;
        anyhow::ensure!(
            n == self.cav.elem_count(),
            "layer '{layer}' has {n} features per sample, CAV has {}",
            self.cav.elem_count()
        );

        let v = (self.cav.to_device(x.device())?.to_dtype(x.dtype())? + STABILIZE_EPS)?;
        let z = (self.mean_length.to_device(x.device())?.to_dtype(x.dtype())? + STABILIZE_EPS)?
            .unsqueeze(0)?;

        // (x - z) v vᵀ without materializing the (N, N) outer product
        let coeff = x.broadcast_sub(&z)?.matmul(&v.unsqueeze(1)?)?;
        let projected = coeff.broadcast_mul(&v.unsqueeze(0)?)?;
        let corrected = (x - (projected * self.alpha)?)?;

        debug!("ClArC hook applied on '{}'", layer);
        Ok(Some(corrected.reshape(shape)?))
    }
}

/// Subtracts `alpha * probe` from every sample's flattened activation
#[derive(Debug, Clone)]
pub struct MassMeanProbeHook {
    probe: Tensor,
    alpha: f64,
}

impl MassMeanProbeHook {
    pub fn new(probe: Tensor, alpha: f64) -> Result<Self> {
        Ok(Self {
            probe: probe.flatten_all()?,
            alpha,
        })
    }
}

impl ForwardHook for MassMeanProbeHook {
    fn call(&self, layer: &str, output: &Tensor) -> Result<Option<Tensor>> {
        let shape = output.dims().to_vec();
        let x = output.flatten_from(1)?;
        anyhow::ensure!(
            x.dim(1)? == self.probe.elem_count(),
            "layer '{layer}' has {} features per sample, probe has {}",
            x.dim(1)?,
            self.probe.elem_count()
        );
        let probe = self.probe.to_device(x.device())?.to_dtype(x.dtype())?;
        let shifted = x.broadcast_sub(&(probe * self.alpha)?.unsqueeze(0)?)?;
        Ok(Some(shifted.reshape(shape)?))
    }
}

/// Soft decision threshold on a binary classifier's output layer
///
/// The class-1 score `s` (softmax probability when the layer emits logits)
/// becomes `sigmoid((s - tau) * 10)`, and class 0 its complement, so the
/// output rows are probabilities whose argmax flips exactly at `tau`.
#[derive(Debug, Clone)]
pub struct SoftThresholdHook {
    tau: f64,
    sharpness: f64,
    outputs_are_logits: bool,
}

impl SoftThresholdHook {
    pub fn new(tau: f64, outputs_are_logits: bool) -> Self {
        Self {
            tau,
            sharpness: SOFT_THRESHOLD_SHARPNESS,
            outputs_are_logits,
        }
    }

    pub fn with_sharpness(mut self, sharpness: f64) -> Self {
        self.sharpness = sharpness;
        self
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }
}

impl ForwardHook for SoftThresholdHook {
    fn call(&self, layer: &str, output: &Tensor) -> Result<Option<Tensor>> {
        let (_, n_classes) = output.dims2()?;
        anyhow::ensure!(
            n_classes == 2,
            "soft thresholding on '{layer}' expects 2 output classes, got {n_classes}"
        );

        let probs = if self.outputs_are_logits {
            candle_nn::ops::softmax(output, 1)?
        } else {
            output.clone()
        };
        let score = probs.i((.., 1))?;
        let p1 = candle_nn::ops::sigmoid(&((score - self.tau)? * self.sharpness)?)?;
        let p0 = p1.affine(-1.0, 1.0)?;

        debug!("Soft threshold applied on '{}', tau: {:.4}", layer, self.tau);
        Ok(Some(Tensor::stack(&[p0, p1], 1)?))
    }
}

// ============================================================================
// Registration helpers
// ============================================================================

/// Register a [`ClarcHook`] on each of `layer_names`
///
/// Returns one handle per registered hook. Fails before registering
/// anything if a name is not a layer of the model.
pub fn add_clarc_hook(
    model: &mut HookedClassifier,
    cav: &Tensor,
    mean_length: &Tensor,
    layer_names: &[String],
    alpha: f64,
) -> Result<Vec<HookHandle>> {
    check_layers(model, layer_names)?;
    let hook = Arc::new(ClarcHook::new(cav.clone(), mean_length.clone(), alpha)?);
    layer_names
        .iter()
        .map(|name| model.register_forward_hook(name, hook.clone()))
        .collect()
}

/// Register a [`MassMeanProbeHook`] on each of `layer_names`
pub fn add_mass_mean_probe_hook(
    model: &mut HookedClassifier,
    probe: &Tensor,
    layer_names: &[String],
    alpha: f64,
) -> Result<Vec<HookHandle>> {
    check_layers(model, layer_names)?;
    let hook = Arc::new(MassMeanProbeHook::new(probe.clone(), alpha)?);
    layer_names
        .iter()
        .map(|name| model.register_forward_hook(name, hook.clone()))
        .collect()
}

fn check_layers(model: &HookedClassifier, layer_names: &[String]) -> Result<()> {
    for name in layer_names {
        if !model.layer_exists(name) {
            return Err(CorrectionError::UnknownLayer(name.clone()).into());
        }
    }
    Ok(())
}
