//! Pipeline configuration.
//!
//! A single [`PipelineConfig`] is built once at start-up (defaults, then a
//! YAML file, then command-line overrides), validated, and passed by
//! reference to every component.
//!
//! # Example
//!
//! ```rust
//! use spectra_net_rs::config::PipelineConfig;
//!
//! let config: PipelineConfig = serde_yaml::from_str("model_name: demo\n").unwrap();
//! assert_eq!(config.data.batch_size, 20);
//! assert_eq!(config.model_dir(), std::path::Path::new("models/demo"));
//! config.validate().unwrap();
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::data::ColumnRange;
use crate::error::{SpectraError, SpectraResult};
use crate::network::{ArchitectureVariant, NetworkOptions, DEFAULT_LEAKY_SLOPE};
use crate::optimizer::OptimizerKind;
use crate::scheduler::ExponentialDecay;
use crate::shape::{build_schedule, ArchitectureSpec};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Data files, columns and batching.
    #[serde(default)]
    pub data: DataConfig,

    /// Network architecture.
    #[serde(default)]
    pub model: ModelConfig,

    /// Step counts, periods and learning rate.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Name of the run; the model directory is `<models_dir>/<model_name>`.
    #[serde(default = "default_model_name")]
    pub model_name: String,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Re-run evaluation even if its prediction file already exists.
    #[serde(default = "default_true")]
    pub force_run: bool,

    /// Seed for shuffling and curve selection.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_model_name() -> String {
    "20180705_125935".into()
}
fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}
fn default_true() -> bool {
    true
}
fn default_seed() -> u64 {
    42
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            model_name: default_model_name(),
            models_dir: default_models_dir(),
            force_run: true,
            seed: default_seed(),
        }
    }
}

/// Data configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Number of input parameters per record
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    /// Input columns, `[first, last]` inclusive
    #[serde(default = "default_x_range")]
    pub x_range: ColumnRange,
    /// Output columns, `[first, last]` inclusive
    #[serde(default = "default_y_range")]
    pub y_range: ColumnRange,
    /// Number of cross-validation folds
    #[serde(default = "default_cross_val")]
    pub cross_val: usize,
    /// Fold held out for validation
    #[serde(default)]
    pub val_fold: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Shuffle buffer size for the training stream
    #[serde(default = "default_shuffle_size")]
    pub shuffle_size: usize,
    #[serde(default = "default_train_file")]
    pub train_file: String,
    /// Separate validation file; the held-out fold is used when absent
    #[serde(default = "default_valid_file")]
    pub valid_file: Option<String>,
    /// Directory holding data files and evaluation outputs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_input_size() -> usize {
    2
}
fn default_x_range() -> ColumnRange {
    ColumnRange { first: 0, last: 1 }
}
fn default_y_range() -> ColumnRange {
    ColumnRange {
        first: 2,
        last: 1002,
    }
}
fn default_cross_val() -> usize {
    5
}
fn default_batch_size() -> usize {
    20
}
fn default_shuffle_size() -> usize {
    5
}
fn default_train_file() -> String {
    "TrainDataV9.txt".into()
}
fn default_valid_file() -> Option<String> {
    Some("TestDataV9.txt".into())
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            x_range: default_x_range(),
            y_range: default_y_range(),
            cross_val: default_cross_val(),
            val_fold: 0,
            batch_size: default_batch_size(),
            shuffle_size: default_shuffle_size(),
            train_file: default_train_file(),
            valid_file: default_valid_file(),
            data_dir: default_data_dir(),
        }
    }
}

/// Architecture configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_fc_filters")]
    pub fc_filters: Vec<usize>,
    #[serde(default = "default_tconv_dims")]
    pub tconv_dims: Vec<usize>,
    #[serde(default = "default_tconv_filters")]
    pub tconv_filters: Vec<usize>,
    #[serde(default)]
    pub variant: ArchitectureVariant,
    #[serde(default = "default_leaky_slope")]
    pub leaky_slope: f64,
}

fn default_fc_filters() -> Vec<usize> {
    vec![100, 100, 143]
}
fn default_tconv_dims() -> Vec<usize> {
    vec![1001]
}
fn default_tconv_filters() -> Vec<usize> {
    vec![8]
}
fn default_leaky_slope() -> f64 {
    DEFAULT_LEAKY_SLOPE
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            fc_filters: default_fc_filters(),
            tconv_dims: default_tconv_dims(),
            tconv_filters: default_tconv_filters(),
            variant: ArchitectureVariant::default(),
            leaky_slope: default_leaky_slope(),
        }
    }
}

impl ModelConfig {
    /// Validated architecture shape.
    pub fn architecture(&self) -> SpectraResult<ArchitectureSpec> {
        ArchitectureSpec::new(
            self.fc_filters.clone(),
            self.tconv_dims.clone(),
            self.tconv_filters.clone(),
        )
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Total optimization steps
    #[serde(default = "default_train_step")]
    pub train_step: u64,
    /// Steps between progress reports
    #[serde(default = "default_verb_step")]
    pub verb_step: u64,
    /// Steps between validation passes
    #[serde(default = "default_eval_step")]
    pub eval_step: u64,
    /// Steps between checkpoints
    #[serde(default = "default_save_step")]
    pub save_step: u64,
    #[serde(default = "default_learn_rate")]
    pub learn_rate: f64,
    #[serde(default = "default_decay_step")]
    pub decay_step: u64,
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    /// Print progress lines
    #[serde(default = "default_true")]
    pub verbose: bool,
    /// Write summary events to `summary.jsonl`
    #[serde(default = "default_true")]
    pub write_summary: bool,
    /// Curve pairs per validation plot
    #[serde(default = "default_curve_num")]
    pub curve_num: usize,
}

fn default_train_step() -> u64 {
    1500
}
fn default_verb_step() -> u64 {
    25
}
fn default_eval_step() -> u64 {
    250
}
fn default_save_step() -> u64 {
    500
}
fn default_learn_rate() -> f64 {
    1e-3
}
fn default_decay_step() -> u64 {
    10_000
}
fn default_decay_rate() -> f64 {
    0.96
}
fn default_curve_num() -> usize {
    6
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            train_step: default_train_step(),
            verb_step: default_verb_step(),
            eval_step: default_eval_step(),
            save_step: default_save_step(),
            learn_rate: default_learn_rate(),
            decay_step: default_decay_step(),
            decay_rate: default_decay_rate(),
            optimizer: OptimizerKind::default(),
            verbose: true,
            write_summary: true,
            curve_num: default_curve_num(),
        }
    }
}

impl TrainingConfig {
    pub fn schedule(&self) -> SpectraResult<ExponentialDecay> {
        ExponentialDecay::new(self.learn_rate, self.decay_step, self.decay_rate)
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> SpectraResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| SpectraError::io(path, e))?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> SpectraResult<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(|e| SpectraError::io(path, e))
    }

    /// Directory holding weights, metadata and summaries for this run.
    pub fn model_dir(&self) -> PathBuf {
        self.models_dir.join(&self.model_name)
    }

    /// Network options derived from the data and model sections.
    pub fn network_options(&self) -> NetworkOptions {
        NetworkOptions {
            input_size: self.data.input_size,
            variant: self.model.variant,
            leaky_slope: self.model.leaky_slope,
        }
    }

    /// Check every value that would otherwise fail deep inside a run.
    pub fn validate(&self) -> SpectraResult<()> {
        let err = |msg: String| Err(SpectraError::configuration(msg));
        let data = &self.data;
        let training = &self.training;

        if self.model_name.trim().is_empty() {
            return err("model_name must not be empty".into());
        }
        if data.input_size == 0 {
            return err("input_size must be positive".into());
        }
        if data.x_range.len() != data.input_size {
            return err(format!(
                "x_range {} selects {} columns but input_size is {}",
                data.x_range,
                data.x_range.len(),
                data.input_size
            ));
        }
        if data.cross_val == 0 {
            return err("cross_val must be positive".into());
        }
        if data.val_fold >= data.cross_val {
            return err(format!(
                "val_fold {} must be below cross_val {}",
                data.val_fold, data.cross_val
            ));
        }
        if data.batch_size == 0 {
            return err("batch_size must be positive".into());
        }

        for (name, period) in [
            ("verb_step", training.verb_step),
            ("eval_step", training.eval_step),
            ("save_step", training.save_step),
        ] {
            if period == 0 {
                return err(format!("{name} must be positive"));
            }
        }
        training.schedule()?;

        if !(0.0..1.0).contains(&self.model.leaky_slope) {
            return err(format!(
                "leaky_slope {} must be in [0, 1)",
                self.model.leaky_slope
            ));
        }

        let schedule = build_schedule(&self.model.architecture()?)?;
        if data.y_range.len() != schedule.output_size() {
            return err(format!(
                "y_range {} selects {} columns but the network outputs {}",
                data.y_range,
                data.y_range.len(),
                schedule.output_size()
            ));
        }

        Ok(())
    }
}
