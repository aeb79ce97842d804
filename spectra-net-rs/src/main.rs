//! CLI entry point for spectra-net.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use spectra_net_rs::evaluate::{compare_truth_pred, run_evaluation, ErrorReport};
use spectra_net_rs::{ColumnRange, PipelineConfig, Trainer};

#[derive(Parser)]
#[command(name = "spectra-net")]
#[command(about = "Train and evaluate dense + transposed-convolution spectrum regressors")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model
    Train {
        #[command(flatten)]
        run: RunArgs,
        /// Resume from the model directory's last checkpoint
        #[arg(long)]
        resume: bool,
    },
    /// Evaluate a trained model on its validation split
    Evaluate {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Compare a prediction file against a truth file
    Compare {
        /// Space-delimited prediction rows
        #[arg(long)]
        pred: PathBuf,
        /// Space-delimited truth rows
        #[arg(long)]
        truth: PathBuf,
    },
    /// Write a configuration file with default values
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,
    },
    /// Validate a configuration
    Validate {
        #[command(flatten)]
        run: RunArgs,
    },
}

/// Configuration file plus per-flag overrides.
#[derive(Args)]
struct RunArgs {
    /// YAML configuration file; defaults are used when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    input_size: Option<usize>,
    /// Input columns as `first,last`
    #[arg(long)]
    x_range: Option<ColumnRange>,
    /// Output columns as `first,last`
    #[arg(long)]
    y_range: Option<ColumnRange>,
    /// Number of cross-validation folds
    #[arg(long)]
    cross_val: Option<usize>,
    /// Fold used for validation
    #[arg(long)]
    val_fold: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    shuffle_size: Option<usize>,
    /// Steps between progress messages
    #[arg(long)]
    verb_step: Option<u64>,
    /// Steps between validation passes
    #[arg(long)]
    eval_step: Option<u64>,
    /// Total training steps
    #[arg(long)]
    train_step: Option<u64>,
    #[arg(long)]
    learn_rate: Option<f64>,
    #[arg(long)]
    decay_step: Option<u64>,
    #[arg(long)]
    decay_rate: Option<f64>,
    /// Re-run evaluation even if predictions exist
    #[arg(long)]
    force_run: Option<bool>,
    #[arg(long)]
    model_name: Option<String>,
    #[arg(long)]
    train_file: Option<String>,
    #[arg(long)]
    valid_file: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    models_dir: Option<PathBuf>,
}

impl RunArgs {
    /// Load the base configuration, apply overrides and validate once.
    fn resolve(self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        let data = &mut config.data;
        if let Some(v) = self.input_size {
            data.input_size = v;
        }
        if let Some(v) = self.x_range {
            data.x_range = v;
        }
        if let Some(v) = self.y_range {
            data.y_range = v;
        }
        if let Some(v) = self.cross_val {
            data.cross_val = v;
        }
        if let Some(v) = self.val_fold {
            data.val_fold = v;
        }
        if let Some(v) = self.batch_size {
            data.batch_size = v;
        }
        if let Some(v) = self.shuffle_size {
            data.shuffle_size = v;
        }
        if let Some(v) = self.train_file {
            data.train_file = v;
        }
        if let Some(v) = self.valid_file {
            data.valid_file = Some(v);
        }
        if let Some(v) = self.data_dir {
            data.data_dir = v;
        }

        let training = &mut config.training;
        if let Some(v) = self.verb_step {
            training.verb_step = v;
        }
        if let Some(v) = self.eval_step {
            training.eval_step = v;
        }
        if let Some(v) = self.train_step {
            training.train_step = v;
        }
        if let Some(v) = self.learn_rate {
            training.learn_rate = v;
        }
        if let Some(v) = self.decay_step {
            training.decay_step = v;
        }
        if let Some(v) = self.decay_rate {
            training.decay_rate = v;
        }

        if let Some(v) = self.force_run {
            config.force_run = v;
        }
        if let Some(v) = self.model_name {
            config.model_name = v;
        }
        if let Some(v) = self.models_dir {
            config.models_dir = v;
        }

        config.validate()?;
        Ok(config)
    }
}

fn print_report(report: &ErrorReport) {
    println!("✓ Evaluated {}", report.model_name);
    println!("  Samples:  {}", report.samples);
    println!("  Avg MAE:  {:.4e}", report.mean_mae);
    println!("  Avg MSE:  {:.4e}", report.mean_mse);
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { run, resume } => {
            let config = run.resolve()?;
            let device = Device::cuda_if_available(0)?;

            let mut trainer = Trainer::from_config(&config, &device)?;
            if resume {
                trainer
                    .resume(config.model_dir())
                    .context("resuming training")?;
            }
            let report = trainer.run_training(config.training.train_step)?;

            println!("✓ Trained {} for {} steps", config.model_name, report.steps);
            if let Some(loss) = report.final_loss {
                println!("  Final loss: {loss:.4e}");
            }
            if let Some(path) = &report.checkpoint {
                println!("  Checkpoint: {}", path.display());
            }
        }
        Commands::Evaluate { run } => {
            let config = run.resolve()?;
            let device = Device::cuda_if_available(0)?;
            let report = run_evaluation(&config, &device)
                .with_context(|| format!("evaluating {}", config.model_name))?;
            print_report(&report);
        }
        Commands::Compare { pred, truth } => {
            let errors = compare_truth_pred(&pred, &truth)?;
            let report = ErrorReport::from_errors("compare", &errors);
            for (i, (mae, mse)) in errors.mae.iter().zip(&errors.mse).enumerate() {
                println!("{i} {mae} {mse}");
            }
            print_report(&report);
        }
        Commands::Init { output } => {
            PipelineConfig::default().to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
        Commands::Validate { run } => {
            let config = run.resolve()?;
            let spec = config.model.architecture()?;
            println!("✓ Configuration is valid");
            println!("  Model: {}", config.model_name);
            println!(
                "  Architecture: fc {:?}, tconv {:?} x {:?} ({})",
                spec.fc_filters, spec.tconv_dims, spec.tconv_filters, config.model.variant
            );
            println!("  Output size: {}", spec.output_size()?);
        }
    }

    Ok(())
}
