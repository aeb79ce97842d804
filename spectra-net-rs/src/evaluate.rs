//! Evaluation pass and error report.
//!
//! [`evaluate`] restores a checkpoint, drains a validation stream once and
//! writes two row-aligned, space-delimited files: predictions and truths.
//! [`compare_truth_pred`] reads them back and computes per-row errors, and
//! [`run_evaluation`] ties both together for a configured run.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::data::{BatchStream, DataReader};
use crate::error::{SpectraError, SpectraResult};
use crate::meta::ModelMeta;
use crate::network::{NetworkOptions, RegressionNetwork};
use crate::trainer::WEIGHTS_FILE_NAME;

/// Number of bins in the per-row MSE histogram.
pub const HISTOGRAM_BINS: usize = 100;

/// Truth and prediction rows from one full pass, in stream order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationResult {
    pub truth: Vec<Vec<f32>>,
    pub prediction: Vec<Vec<f32>>,
    /// Mean of the per-batch losses, `None` for an empty pass
    pub mean_loss: Option<f32>,
}

impl EvaluationResult {
    pub fn len(&self) -> usize {
        self.truth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.truth.is_empty()
    }
}

/// Files written by [`evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationFiles {
    pub pred_file: PathBuf,
    pub truth_file: PathBuf,
}

impl EvaluationFiles {
    /// `test_pred_<model>.csv` and `test_truth_<model>.csv` under `out_dir`.
    pub fn for_model(out_dir: &Path, model_name: &str) -> Self {
        Self {
            pred_file: out_dir.join(format!("test_pred_{model_name}.csv")),
            truth_file: out_dir.join(format!("test_truth_{model_name}.csv")),
        }
    }
}

/// Rewind `stream` and run the network over every batch once.
pub fn collect(
    network: &RegressionNetwork,
    stream: &mut dyn BatchStream,
) -> SpectraResult<EvaluationResult> {
    stream.reset()?;

    let mut result = EvaluationResult::default();
    let mut loss_sum = 0.0f32;
    let mut batches = 0usize;
    while let Some(batch) = stream.next_batch()? {
        let output = network.evaluate_batch(&batch)?;
        loss_sum += output.loss;
        batches += 1;
        result.truth.extend(output.truth);
        result.prediction.extend(output.prediction);
    }

    if batches > 0 {
        result.mean_loss = Some(loss_sum / batches as f32);
    }
    Ok(result)
}

/// Restore `checkpoint` into `network`, drain `stream` and write the
/// prediction and truth files for `model_name` under `out_dir`.
pub fn evaluate(
    network: &mut RegressionNetwork,
    stream: &mut dyn BatchStream,
    checkpoint: &Path,
    out_dir: &Path,
    model_name: &str,
) -> SpectraResult<(EvaluationFiles, EvaluationResult)> {
    network.restore(checkpoint)?;
    let result = collect(network, stream)?;
    if result.is_empty() {
        tracing::warn!("Validation stream produced no rows for {model_name}");
    }

    std::fs::create_dir_all(out_dir).map_err(|e| SpectraError::io(out_dir, e))?;
    let files = EvaluationFiles::for_model(out_dir, model_name);
    write_rows(&files.pred_file, &result.prediction)?;
    write_rows(&files.truth_file, &result.truth)?;

    tracing::info!(
        "Wrote {} rows to {} and {}",
        result.len(),
        files.pred_file.display(),
        files.truth_file.display()
    );
    Ok((files, result))
}

/// Write one space-delimited row per line.
pub fn write_rows(path: &Path, rows: &[Vec<f32>]) -> SpectraResult<()> {
    let out: String = rows
        .iter()
        .map(|row| {
            let line = row.iter().map(ToString::to_string).collect::<Vec<_>>();
            line.join(" ") + "\n"
        })
        .collect();
    std::fs::write(path, out).map_err(|e| SpectraError::io(path, e))
}

/// Read a space-delimited numeric file written by [`write_rows`].
pub fn read_rows(path: &Path) -> SpectraResult<Vec<Vec<f64>>> {
    let text = std::fs::read_to_string(path).map_err(|e| SpectraError::io(path, e))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_no, line)| {
            line.split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| {
                    SpectraError::data(format!("{}:{}: {e}", path.display(), line_no + 1))
                })
        })
        .collect()
}

/// Per-row error vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowErrors {
    /// Mean absolute error of each row
    pub mae: Vec<f64>,
    /// Mean squared error of each row
    pub mse: Vec<f64>,
}

/// Per-row mean absolute and mean squared error between a prediction file
/// and a truth file.
///
/// # Errors
///
/// Fails with a data error if the files differ in row count or any row pair
/// differs in width.
pub fn compare_truth_pred(pred_file: &Path, truth_file: &Path) -> SpectraResult<RowErrors> {
    let pred = read_rows(pred_file)?;
    let truth = read_rows(truth_file)?;
    if pred.len() != truth.len() {
        return Err(SpectraError::data(format!(
            "{} has {} rows but {} has {}",
            pred_file.display(),
            pred.len(),
            truth_file.display(),
            truth.len()
        )));
    }

    let mut errors = RowErrors {
        mae: Vec::with_capacity(pred.len()),
        mse: Vec::with_capacity(pred.len()),
    };
    for (i, (p, t)) in pred.iter().zip(&truth).enumerate() {
        if p.len() != t.len() || p.is_empty() {
            return Err(SpectraError::data(format!(
                "row {i}: prediction width {} vs truth width {}",
                p.len(),
                t.len()
            )));
        }
        let n = p.len() as f64;
        let (abs_sum, sq_sum) = p.iter().zip(t).fold((0.0, 0.0), |(a, s), (x, y)| {
            let d = x - y;
            (a + d.abs(), s + d * d)
        });
        errors.mae.push(abs_sum / n);
        errors.mse.push(sq_sum / n);
    }

    Ok(errors)
}

/// Equal-width histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// Bin edges, one more than `counts`
    pub edges: Vec<f64>,
    pub counts: Vec<u64>,
}

impl Histogram {
    /// Bin `values` into `bins` equal-width bins spanning their range. The
    /// last bin includes its right edge. A degenerate range `v..v` is widened
    /// to `v - 0.5..v + 0.5`, and an empty input spans `0..1`.
    pub fn new(values: &[f64], bins: usize) -> Self {
        let bins = bins.max(1);
        let (mut lo, mut hi) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if values.is_empty() {
            (lo, hi) = (0.0, 1.0);
        } else if lo == hi {
            (lo, hi) = (lo - 0.5, hi + 0.5);
        }

        let width = (hi - lo) / bins as f64;
        let edges = (0..=bins).map(|i| lo + width * i as f64).collect();
        let mut counts = vec![0u64; bins];
        for &v in values {
            let bin = (((v - lo) / width) as usize).min(bins - 1);
            counts[bin] += 1;
        }

        Self { edges, counts }
    }
}

/// Summary of a finished evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub model_name: String,
    pub samples: usize,
    pub mean_mae: f64,
    pub mean_mse: f64,
    /// Histogram of per-row MSE
    pub histogram: Histogram,
}

impl ErrorReport {
    pub fn from_errors(model_name: &str, errors: &RowErrors) -> Self {
        let mean = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };
        Self {
            model_name: model_name.to_string(),
            samples: errors.mse.len(),
            mean_mae: mean(&errors.mae),
            mean_mse: mean(&errors.mse),
            histogram: Histogram::new(&errors.mse, HISTOGRAM_BINS),
        }
    }

    /// Write as `mse_histogram_<model>.json` under `out_dir`.
    pub fn write(&self, out_dir: &Path) -> SpectraResult<PathBuf> {
        let path = out_dir.join(format!("mse_histogram_{}.json", self.model_name));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .map_err(|e| SpectraError::io(&path, e))?;
        Ok(path)
    }
}

/// Evaluate the configured model on its validation split and report errors.
///
/// The architecture is rebuilt from the model directory's metadata record.
/// When `force_run` is off and the prediction file already exists, the
/// existing files are compared without running the network.
pub fn run_evaluation(config: &PipelineConfig, device: &Device) -> SpectraResult<ErrorReport> {
    let model_dir = config.model_dir();
    let out_dir = &config.data.data_dir;
    let files = EvaluationFiles::for_model(out_dir, &config.model_name);

    if config.force_run || !files.pred_file.exists() {
        tracing::info!("Evaluating the model ...");
        let meta = ModelMeta::read(&model_dir)?;
        let spec = meta.to_spec()?;
        let options = NetworkOptions {
            variant: meta.variant.unwrap_or_default(),
            ..config.network_options()
        };
        let mut network = RegressionNetwork::new(&spec, options, device)?;

        let reader = DataReader::new(&config.data, network.output_size())?;
        let mut stream = reader.validation_stream(device)?;
        evaluate(
            &mut network,
            &mut stream,
            &model_dir.join(WEIGHTS_FILE_NAME),
            out_dir,
            &config.model_name,
        )?;
    } else {
        tracing::info!(
            "Reusing existing predictions at {}",
            files.pred_file.display()
        );
    }

    let errors = compare_truth_pred(&files.pred_file, &files.truth_file)?;
    let report = ErrorReport::from_errors(&config.model_name, &errors);
    let histogram_path = report.write(out_dir)?;

    tracing::info!(
        "{}: {} samples, Avg MAE={:.4e}, Avg MSE={:.4e} (histogram at {})",
        config.model_name,
        report.samples,
        report.mean_mae,
        report.mean_mse,
        histogram_path.display()
    );
    Ok(report)
}
