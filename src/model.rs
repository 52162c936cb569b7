//! Hookable classifier built on candle-nn
//!
//! A [`HookedClassifier`] is an ordered tree of named layers. Every layer,
//! nested `sequential` containers included, is a hook point: outputs can be
//! captured into a [`HookCache`] or rewritten by a [`ForwardHook`].
//!
//! Parameters live in a [`VarMap`] so correction methods can overwrite
//! weights in place and the whole model can be saved to or loaded from
//! safetensors.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear, VarBuilder, VarMap};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CorrectionError;
use crate::hooks::{ForwardHook, HookCache, HookHandle, HookRegistry};

/// Network description, usually read from `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Per-sample input shape, e.g. `[64]` or `[1, 28, 28]`
    pub input_shape: Vec<usize>,
    /// Layers applied in order
    pub layers: Vec<LayerConfig>,
    /// Whether the final layer emits logits (softmax still to apply)
    #[serde(default = "default_outputs_are_logits")]
    pub outputs_are_logits: bool,
}

fn default_outputs_are_logits() -> bool {
    true
}

impl ClassifierConfig {
    /// Read a config JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse model config")
    }
}

fn default_true() -> bool {
    true
}

fn default_stride() -> usize {
    1
}

/// A named layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
}

/// Supported layer kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerKind {
    Linear {
        out_features: usize,
        #[serde(default = "default_true")]
        bias: bool,
    },
    Conv2d {
        out_channels: usize,
        kernel_size: usize,
        #[serde(default = "default_stride")]
        stride: usize,
        #[serde(default)]
        padding: usize,
        #[serde(default = "default_true")]
        bias: bool,
    },
    Relu,
    Gelu,
    Sigmoid,
    Flatten,
    /// Identity at inference
    Dropout,
    Sequential {
        layers: Vec<LayerConfig>,
    },
}

impl LayerConfig {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

enum Layer {
    Linear(Linear),
    Conv2d(Conv2d),
    Relu,
    Gelu,
    Sigmoid,
    Flatten,
    Dropout,
    Sequential(Vec<NamedModule>),
}

struct NamedModule {
    /// Full dotted path, e.g. `features.conv1`
    name: String,
    module: Layer,
}

/// Pick a device: CUDA when available unless `force_cpu`
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Classifier with forward hooks on every named layer
pub struct HookedClassifier {
    config: ClassifierConfig,
    layers: Vec<NamedModule>,
    varmap: VarMap,
    /// Parameters in definition order (weight before bias)
    params: Vec<(String, Var)>,
    hooks: HookRegistry,
    device: Device,
}

impl HookedClassifier {
    /// Build a randomly initialised model
    pub fn new(config: ClassifierConfig, device: &Device) -> Result<Self> {
        anyhow::ensure!(!config.input_shape.is_empty(), "input_shape must not be empty");
        anyhow::ensure!(!config.layers.is_empty(), "model has no layers");

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut param_names = Vec::new();
        let mut names = HashSet::new();
        let mut shape = config.input_shape.clone();

        let layers = build_layers(
            &config.layers,
            "",
            &vb,
            &mut shape,
            &mut param_names,
            &mut names,
        )?;

        let params = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
            param_names
                .iter()
                .map(|name| {
                    data.get(name)
                        .cloned()
                        .map(|var| (name.clone(), var))
                        .ok_or_else(|| anyhow::anyhow!("parameter '{name}' was not created"))
                })
                .collect::<Result<Vec<_>>>()?
        };

        debug!(
            "Built classifier: {} modules, {} parameter tensors, output shape {:?}",
            names.len(),
            params.len(),
            shape
        );

        Ok(Self {
            config,
            layers,
            varmap,
            params,
            hooks: HookRegistry::new(),
            device: device.clone(),
        })
    }

    /// Build from a config file and load weights from safetensors
    pub fn load(config_path: impl AsRef<Path>, weights_path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let config = ClassifierConfig::load(config_path)?;
        let mut model = Self::new(config, device)?;
        model.load_weights(weights_path)?;
        Ok(model)
    }

    /// Download `config.json` and `model.safetensors` from the HuggingFace hub
    pub fn from_hub(repo_id: &str, device: &Device) -> Result<Self> {
        info!("Loading model from hub: {}", repo_id);
        let api = Api::new()?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        Self::load(config_path, weights_path, device)
    }

    /// Overwrite all parameters from a safetensors file
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .load(path)
            .with_context(|| format!("Failed to load weights from {}", path.display()))?;
        info!("Loaded weights from {}", path.display());
        Ok(())
    }

    /// Write all parameters to a safetensors file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .save(path)
            .with_context(|| format!("Failed to save weights to {}", path.display()))?;
        info!("Saved weights to {}", path.display());
        Ok(())
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn outputs_are_logits(&self) -> bool {
        self.config.outputs_are_logits
    }

    /// All module names in pre-order (containers before their children)
    pub fn named_modules(&self) -> Vec<String> {
        fn walk(modules: &[NamedModule], out: &mut Vec<String>) {
            for m in modules {
                out.push(m.name.clone());
                if let Layer::Sequential(children) = &m.module {
                    walk(children, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.layers, &mut out);
        out
    }

    pub fn layer_exists(&self, name: &str) -> bool {
        self.named_modules().iter().any(|n| n == name)
    }

    /// Parameters in definition order, like `model.parameters()`
    pub fn parameters(&self) -> &[(String, Var)] {
        &self.params
    }

    pub fn n_parameter_tensors(&self) -> usize {
        self.params.len()
    }

    /// Total number of scalar weights
    pub fn n_weights(&self) -> usize {
        self.params.iter().map(|(_, v)| v.elem_count()).sum()
    }

    /// Replace parameter `index` in place
    pub fn set_parameter(&self, index: usize, value: &Tensor) -> Result<()> {
        let (name, var) = self
            .params
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("parameter index {index} out of range"))?;
        write_var(name, var, value)
    }

    /// Copy of every parameter value, in definition order
    pub fn snapshot(&self) -> Result<Vec<Tensor>> {
        self.params
            .iter()
            .map(|(_, var)| Ok(var.as_tensor().copy()?))
            .collect()
    }

    /// Restore parameters from a [`snapshot`](Self::snapshot)
    pub fn restore(&self, snapshot: &[Tensor]) -> Result<()> {
        anyhow::ensure!(
            snapshot.len() == self.params.len(),
            "snapshot has {} tensors, model has {}",
            snapshot.len(),
            self.params.len()
        );
        for ((name, var), value) in self.params.iter().zip(snapshot) {
            write_var(name, var, value)?;
        }
        Ok(())
    }

    /// Attach a forward hook to `layer`
    pub fn register_forward_hook(&mut self, layer: &str, hook: Arc<dyn ForwardHook>) -> Result<HookHandle> {
        if !self.layer_exists(layer) {
            return Err(CorrectionError::UnknownLayer(layer.to_string()).into());
        }
        let handle = self.hooks.register(layer, hook);
        debug!("Hook {} registered on layer: {}", handle.id(), layer);
        Ok(handle)
    }

    pub fn remove_hook(&mut self, handle: HookHandle) -> bool {
        self.hooks.remove(handle)
    }

    pub fn clear_hooks(&mut self) {
        self.hooks.clear();
    }

    pub fn num_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Forward pass with all registered hooks applied
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut cache = HookCache::new(x.clone());
        let out = self.run(x, &HashSet::new(), &mut cache)?;
        Ok(out)
    }

    /// Forward pass that also captures the outputs of `layers`
    ///
    /// Captured tensors are taken after that layer's hooks ran.
    pub fn forward_with_capture<S: AsRef<str>>(&self, x: &Tensor, layers: &[S]) -> Result<HookCache> {
        let mut wanted = HashSet::new();
        for layer in layers {
            let layer = layer.as_ref();
            if !self.layer_exists(layer) {
                return Err(CorrectionError::UnknownLayer(layer.to_string()).into());
            }
            wanted.insert(layer.to_string());
        }
        let mut cache = HookCache::new(x.clone());
        let out = self.run(x, &wanted, &mut cache)?;
        cache.set_output(out);
        Ok(cache)
    }

    /// Class-1 scores for a binary classifier, as host values
    pub fn predict_scores(&self, x: &Tensor, outputs_are_logits: bool) -> Result<Vec<f32>> {
        let out = self.forward(x)?;
        let (_, n_classes) = out.dims2()?;
        anyhow::ensure!(n_classes == 2, "expected 2 output classes, got {n_classes}");
        let probs = if outputs_are_logits {
            candle_nn::ops::softmax(&out, 1)?
        } else {
            out
        };
        Ok(probs.narrow(1, 1, 1)?.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?)
    }

    fn run(&self, x: &Tensor, wanted: &HashSet<String>, cache: &mut HookCache) -> Result<Tensor> {
        let dims = x.dims();
        anyhow::ensure!(
            dims.len() == self.config.input_shape.len() + 1 && dims[1..] == self.config.input_shape[..],
            "input shape {:?} does not match (batch, {:?})",
            dims,
            self.config.input_shape
        );
        let mut h = x.to_device(&self.device)?.to_dtype(DType::F32)?;
        for module in &self.layers {
            h = self.run_module(module, h, wanted, cache)?;
        }
        Ok(h)
    }

    fn run_module(
        &self,
        module: &NamedModule,
        x: Tensor,
        wanted: &HashSet<String>,
        cache: &mut HookCache,
    ) -> Result<Tensor> {
        let out = match &module.module {
            Layer::Linear(l) => l.forward(&x)?,
            Layer::Conv2d(c) => c.forward(&x)?,
            Layer::Relu => x.relu()?,
            Layer::Gelu => x.gelu()?,
            Layer::Sigmoid => candle_nn::ops::sigmoid(&x)?,
            Layer::Flatten => x.flatten_from(1)?,
            Layer::Dropout => x,
            Layer::Sequential(children) => {
                let mut h = x;
                for child in children {
                    h = self.run_module(child, h, wanted, cache)?;
                }
                h
            }
        };

        let out = self.hooks.apply(&module.name, out)?;
        if wanted.contains(&module.name) {
            cache.store(module.name.clone(), out.clone());
        }
        Ok(out)
    }
}

fn write_var(name: &str, var: &Var, value: &Tensor) -> Result<()> {
    anyhow::ensure!(
        var.dims() == value.dims(),
        "parameter '{name}' has shape {:?}, got {:?}",
        var.dims(),
        value.dims()
    );
    let value = value.to_device(var.device())?.to_dtype(var.dtype())?;
    var.set(&value)
        .with_context(|| format!("Failed to write parameter '{name}'"))?;
    Ok(())
}

/// Build modules recursively, tracking the per-sample shape
fn build_layers(
    configs: &[LayerConfig],
    prefix: &str,
    vb: &VarBuilder,
    shape: &mut Vec<usize>,
    param_names: &mut Vec<String>,
    names: &mut HashSet<String>,
) -> Result<Vec<NamedModule>> {
    let mut modules = Vec::with_capacity(configs.len());
    for cfg in configs {
        anyhow::ensure!(
            !cfg.name.is_empty() && !cfg.name.contains('.'),
            "invalid layer name '{}'",
            cfg.name
        );
        let name = if prefix.is_empty() {
            cfg.name.clone()
        } else {
            format!("{prefix}.{}", cfg.name)
        };
        anyhow::ensure!(names.insert(name.clone()), "duplicate layer name '{name}'");

        let module = match &cfg.kind {
            LayerKind::Linear { out_features, bias } => {
                let in_features = *shape
                    .last()
                    .ok_or_else(|| anyhow::anyhow!("linear layer '{name}' has no input features"))?;
                let linear = if *bias {
                    candle_nn::linear(in_features, *out_features, vb.pp(&name))?
                } else {
                    candle_nn::linear_no_bias(in_features, *out_features, vb.pp(&name))?
                };
                param_names.push(format!("{name}.weight"));
                if *bias {
                    param_names.push(format!("{name}.bias"));
                }
                if let Some(last) = shape.last_mut() {
                    *last = *out_features;
                }
                Layer::Linear(linear)
            }
            LayerKind::Conv2d {
                out_channels,
                kernel_size,
                stride,
                padding,
                bias,
            } => {
                let (c, h, w) = match shape.as_slice() {
                    [c, h, w] => (*c, *h, *w),
                    other => anyhow::bail!("conv2d layer '{name}' expects (C, H, W) input, got {other:?}"),
                };
                anyhow::ensure!(*stride > 0, "conv2d layer '{name}' has zero stride");
                anyhow::ensure!(
                    h + 2 * padding >= *kernel_size && w + 2 * padding >= *kernel_size,
                    "conv2d layer '{name}' kernel {kernel_size} larger than padded input {h}x{w}"
                );
                let conv_cfg = Conv2dConfig {
                    padding: *padding,
                    stride: *stride,
                    ..Default::default()
                };
                let conv = if *bias {
                    candle_nn::conv2d(c, *out_channels, *kernel_size, conv_cfg, vb.pp(&name))?
                } else {
                    candle_nn::conv2d_no_bias(c, *out_channels, *kernel_size, conv_cfg, vb.pp(&name))?
                };
                param_names.push(format!("{name}.weight"));
                if *bias {
                    param_names.push(format!("{name}.bias"));
                }
                let out_h = (h + 2 * padding - kernel_size) / stride + 1;
                let out_w = (w + 2 * padding - kernel_size) / stride + 1;
                *shape = vec![*out_channels, out_h, out_w];
                Layer::Conv2d(conv)
            }
            LayerKind::Relu => Layer::Relu,
            LayerKind::Gelu => Layer::Gelu,
            LayerKind::Sigmoid => Layer::Sigmoid,
            LayerKind::Dropout => Layer::Dropout,
            LayerKind::Flatten => {
                *shape = vec![shape.iter().product()];
                Layer::Flatten
            }
            LayerKind::Sequential { layers } => {
                let children = build_layers(layers, &name, vb, shape, param_names, names)?;
                Layer::Sequential(children)
            }
        };
        modules.push(NamedModule { name, module });
    }
    Ok(modules)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mlp_config() -> ClassifierConfig {
        ClassifierConfig {
            input_shape: vec![4],
            layers: vec![
                LayerConfig::new(
                    "features",
                    LayerKind::Sequential {
                        layers: vec![
                            LayerConfig::new(
                                "fc1",
                                LayerKind::Linear {
                                    out_features: 8,
                                    bias: true,
                                },
                            ),
                            LayerConfig::new("act", LayerKind::Relu),
                        ],
                    },
                ),
                LayerConfig::new(
                    "head",
                    LayerKind::Linear {
                        out_features: 2,
                        bias: true,
                    },
                ),
            ],
            outputs_are_logits: true,
        }
    }

    #[derive(Debug)]
    struct Zero;

    impl ForwardHook for Zero {
        fn call(&self, _layer: &str, output: &Tensor) -> Result<Option<Tensor>> {
            Ok(Some(output.zeros_like()?))
        }
    }

    #[test]
    fn test_named_modules_and_parameters() {
        let model = HookedClassifier::new(mlp_config(), &Device::Cpu).unwrap();
        assert_eq!(
            model.named_modules(),
            vec!["features", "features.fc1", "features.act", "head"]
        );
        let names: Vec<&str> = model.parameters().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["features.fc1.weight", "features.fc1.bias", "head.weight", "head.bias"]
        );
        assert_eq!(model.n_weights(), 8 * 4 + 8 + 2 * 8 + 2);
        assert!(model.layer_exists("features.act"));
        assert!(!model.layer_exists("fc1"));
    }

    #[test]
    fn test_forward_with_capture_shapes() {
        let device = Device::Cpu;
        let model = HookedClassifier::new(mlp_config(), &device).unwrap();
        let x = Tensor::ones((3, 4), DType::F32, &device).unwrap();
        let cache = model
            .forward_with_capture(&x, &["features.fc1", "features"])
            .unwrap();
        assert_eq!(cache.output().dims(), &[3, 2]);
        assert_eq!(cache.require("features.fc1").unwrap().dims(), &[3, 8]);
        assert_eq!(cache.require("features").unwrap().dims(), &[3, 8]);
        assert!(cache.get("head").is_none());
        assert!(model.forward_with_capture(&x, &["missing"]).is_err());
    }

    #[test]
    fn test_hook_rewrites_output_and_removal() {
        let device = Device::Cpu;
        let mut model = HookedClassifier::new(mlp_config(), &device).unwrap();
        let x = Tensor::ones((2, 4), DType::F32, &device).unwrap();

        let handle = model.register_forward_hook("features", Arc::new(Zero)).unwrap();
        // zero features -> output equals head bias
        let out: Vec<Vec<f32>> = model.forward(&x).unwrap().to_vec2().unwrap();
        let bias: Vec<f32> = model.parameters()[3].1.as_tensor().to_vec1().unwrap();
        assert!((out[0][0] - bias[0]).abs() < 1e-6);
        assert!((out[1][1] - bias[1]).abs() < 1e-6);

        assert!(model.remove_hook(handle));
        assert_eq!(model.num_hooks(), 0);
        assert!(model.register_forward_hook("nope", Arc::new(Zero)).is_err());
    }

    #[test]
    fn test_snapshot_restore_and_set_parameter() {
        let device = Device::Cpu;
        let model = HookedClassifier::new(mlp_config(), &device).unwrap();
        let x = Tensor::ones((1, 4), DType::F32, &device).unwrap();
        let before: Vec<Vec<f32>> = model.forward(&x).unwrap().to_vec2().unwrap();

        let snapshot = model.snapshot().unwrap();
        let zeros = Tensor::zeros((2, 8), DType::F32, &device).unwrap();
        model.set_parameter(2, &zeros).unwrap();
        let bias: Vec<f32> = model.parameters()[3].1.as_tensor().to_vec1().unwrap();
        let zeroed: Vec<Vec<f32>> = model.forward(&x).unwrap().to_vec2().unwrap();
        assert!((zeroed[0][0] - bias[0]).abs() < 1e-6);

        // wrong shape is rejected
        assert!(model.set_parameter(2, &Tensor::zeros(3, DType::F32, &device).unwrap()).is_err());

        model.restore(&snapshot).unwrap();
        let after: Vec<Vec<f32>> = model.forward(&x).unwrap().to_vec2().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_conv_shape_inference() {
        let device = Device::Cpu;
        let config = ClassifierConfig {
            input_shape: vec![1, 6, 6],
            layers: vec![
                LayerConfig::new(
                    "conv",
                    LayerKind::Conv2d {
                        out_channels: 3,
                        kernel_size: 3,
                        stride: 1,
                        padding: 0,
                        bias: true,
                    },
                ),
                LayerConfig::new("relu", LayerKind::Relu),
                LayerConfig::new("flatten", LayerKind::Flatten),
                LayerConfig::new(
                    "fc",
                    LayerKind::Linear {
                        out_features: 2,
                        bias: true,
                    },
                ),
            ],
            outputs_are_logits: true,
        };
        let model = HookedClassifier::new(config, &device).unwrap();
        let x = Tensor::zeros((2, 1, 6, 6), DType::F32, &device).unwrap();
        let cache = model.forward_with_capture(&x, &["conv", "flatten"]).unwrap();
        assert_eq!(cache.require("conv").unwrap().dims(), &[2, 3, 4, 4]);
        assert_eq!(cache.require("flatten").unwrap().dims(), &[2, 48]);
        assert_eq!(cache.output().dims(), &[2, 2]);

        let bad = Tensor::zeros((2, 36), DType::F32, &device).unwrap();
        assert!(model.forward(&bad).is_err());
    }

    #[test]
    fn test_config_json_parsing() {
        let json = r#"{
            "input_shape": [10],
            "layers": [
                {"name": "fc1", "kind": "linear", "out_features": 5},
                {"name": "drop", "kind": "dropout"},
                {"name": "fc2", "kind": "linear", "out_features": 2, "bias": false}
            ]
        }"#;
        let config: ClassifierConfig = serde_json::from_str(json).unwrap();
        assert!(config.outputs_are_logits);
        let model = HookedClassifier::new(config, &Device::Cpu).unwrap();
        assert_eq!(model.n_parameter_tensors(), 3);
    }

    #[test]
    fn test_duplicate_layer_names_rejected() {
        let config = ClassifierConfig {
            input_shape: vec![2],
            layers: vec![
                LayerConfig::new("a", LayerKind::Relu),
                LayerConfig::new("a", LayerKind::Relu),
            ],
            outputs_are_logits: true,
        };
        assert!(HookedClassifier::new(config, &Device::Cpu).is_err());
    }
}
