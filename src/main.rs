//! clarc-rs CLI: post-hoc bias correction for neural classifiers

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clarc_rs::activations::DEFAULT_SAVE_DIR;
use clarc_rs::{
    extract_activations, select_device, ClassifierConfig, DataLoader, Dataset, Experiment, HookedClassifier,
    RunConfig,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "clarc-rs")]
#[command(about = "Post-hoc bias correction for neural classifiers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Model architecture JSON
    #[arg(long, global = true)]
    model_config: Option<PathBuf>,

    /// Model weights (safetensors)
    #[arg(long, global = true)]
    weights: Option<PathBuf>,

    /// `HuggingFace` repo holding config.json and model.safetensors
    #[arg(long, global = true, conflicts_with_all = ["model_config", "weights"])]
    hub: Option<String>,

    /// Dataset JSON file
    #[arg(short, long, global = true)]
    data: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long, global = true, default_value = "outputs")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long, global = true)]
    cpu: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Extract and cache layer activations
    Extract {
        /// Experiment name (names the cache file)
        #[arg(long, default_value = "experiment")]
        name: String,

        /// Comma-separated layer names (default: all)
        #[arg(long, value_delimiter = ',')]
        layers: Vec<String>,

        #[arg(long, default_value_t = 32)]
        batch_size: usize,

        /// Re-extract even if a cache file exists
        #[arg(long)]
        no_cache: bool,

        #[arg(long, default_value = DEFAULT_SAVE_DIR)]
        save_dir: PathBuf,
    },
    /// Run the correction described by a config file
    Correct {
        /// Run configuration JSON
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List named layers and parameter tensors
    Layers,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &cli.command {
        Command::Extract {
            name,
            layers,
            batch_size,
            no_cache,
            save_dir,
        } => {
            println!("=== clarc-rs: activation extraction ===");
            let model = load_model(&cli, cli.cpu)?;
            let dataset = load_dataset(&cli)?;
            let loader = DataLoader::new(dataset, *batch_size, model.device())?;
            let layers = (!layers.is_empty()).then_some(layers.as_slice());

            let store = extract_activations(&model, &loader, name, layers, !no_cache, save_dir)?;
            println!("\n=== Activations ===");
            for layer in store.layer_names() {
                let dims = store.require_layer(layer)?.dims().to_vec();
                println!("{layer:30} {dims:?}");
            }
        }
        Command::Correct { config } => {
            println!("=== clarc-rs: model correction ===");
            let config = RunConfig::load(config)?;
            println!("Experiment: {}", config.experiment_name);
            println!("Method:     {}", config.correction.name());
            println!("Output:     {}", cli.output.display());
            if cli.cpu || config.force_cpu() {
                println!("Mode:       CPU (forced)");
            }

            let model = load_model(&cli, cli.cpu || config.force_cpu())?;
            let dataset = load_dataset(&cli)?;
            let experiment_name = config.experiment_name.clone();

            let (model, results) = Experiment::new(model, config).run(&dataset)?;

            println!("\n=== Results ===");
            for (label, report) in [("Baseline", &results.baseline), ("Corrected", &results.corrected)] {
                println!(
                    "{:10} accuracy {:5.1}%  balanced {:5.1}%  {} {:+.3}",
                    label,
                    report.accuracy * 100.0,
                    report.balanced_accuracy * 100.0,
                    report.metric,
                    report.bias
                );
            }
            if let Some(lwo) = &results.lwo {
                println!("\nThreshold: {:.3} (phi {:.3})", lwo.best_tau, lwo.best_phi);
            }
            if let Some(cav) = &results.cav {
                println!("\nConcept vectors: {} (layer {}, norm {:.3})", cav.saved_to, cav.layer, cav.norm);
            }

            // Save results
            std::fs::create_dir_all(&cli.output)?;
            let results_path = cli.output.join(format!("{experiment_name}_results.json"));
            std::fs::write(&results_path, serde_json::to_string_pretty(&results)?)?;
            info!("Results saved to {}", results_path.display());

            let weights_path = cli.output.join(format!("{experiment_name}_corrected.safetensors"));
            model.save(&weights_path)?;
            if results.cav.is_some() {
                warn!(
                    "{} holds the uncorrected weights; the {} correction is a forward hook built from the concept vectors",
                    weights_path.display(),
                    results.method
                );
            } else {
                info!("Corrected weights saved to {}", weights_path.display());
            }
        }
        Command::Layers => {
            let model = load_model(&cli, true)?;
            println!("=== Layers ===");
            for name in model.named_modules() {
                println!("{name}");
            }
            println!("\n=== Parameters ===");
            for (i, (name, var)) in model.parameters().iter().enumerate() {
                println!("{i:3} {name:30} {:?}", var.dims());
            }
            println!("\nTotal weights: {}", model.n_weights());
        }
    }

    Ok(())
}

fn load_model(cli: &Cli, force_cpu: bool) -> Result<HookedClassifier> {
    let device = select_device(force_cpu);
    let model = match (&cli.hub, &cli.model_config, &cli.weights) {
        (Some(repo), _, _) => HookedClassifier::from_hub(repo, &device)?,
        (None, Some(config), Some(weights)) => HookedClassifier::load(config, weights, &device)?,
        (None, Some(config), None) => {
            warn!("No weights given, using randomly initialised parameters");
            HookedClassifier::new(ClassifierConfig::load(config)?, &device)?
        }
        (None, None, _) => anyhow::bail!("pass --model-config (with --weights) or --hub"),
    };
    info!(
        "Model: {} modules, {} parameter tensors, {} weights",
        model.named_modules().len(),
        model.n_parameter_tensors(),
        model.n_weights()
    );
    Ok(model)
}

fn load_dataset(cli: &Cli) -> Result<Dataset> {
    let path: &Path = cli.data.as_deref().context("--data is required for this command")?;
    let dataset = Dataset::load(path)?;
    info!(
        "Dataset: {} samples, {} in group 1, {} positive",
        dataset.len(),
        dataset.group_count(1),
        dataset.label_count(1)
    );
    Ok(dataset)
}
