//! Summary sinks for scalar metrics and truth/prediction curve plots.
//!
//! Sinks are best-effort: hooks log a failed write and keep training.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a summary sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("summary write to {} failed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("summary event could not be encoded: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("summary sink is closed")]
    Closed,

    #[error("malformed curves: {0}")]
    Malformed(String),
}

/// One truth/prediction pair drawn for a curve plot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvePair {
    /// Row within the source batch
    pub index: usize,
    pub truth: Vec<f32>,
    pub prediction: Vec<f32>,
    /// Sum of squared differences over the curve
    pub sse: f32,
    pub label: String,
}

/// A set of curve pairs logged at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurvePlot {
    pub name: String,
    pub step: u64,
    pub curves: Vec<CurvePair>,
}

impl CurvePlot {
    /// Draw `min(curve_count, rows)` rows from a random permutation of the
    /// batch rows.
    ///
    /// # Errors
    ///
    /// Fails if `truth` and `prediction` differ in row count or row width.
    pub fn sample(
        name: &str,
        truth: &[Vec<f32>],
        prediction: &[Vec<f32>],
        step: u64,
        curve_count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Self, SinkError> {
        if truth.len() != prediction.len() {
            return Err(SinkError::Malformed(format!(
                "{} truth rows but {} prediction rows",
                truth.len(),
                prediction.len()
            )));
        }

        let mut order: Vec<usize> = (0..truth.len()).collect();
        order.shuffle(rng);

        let mut curves = Vec::with_capacity(curve_count.min(order.len()));
        for &index in order.iter().take(curve_count) {
            let (t, p) = (&truth[index], &prediction[index]);
            if t.len() != p.len() {
                return Err(SinkError::Malformed(format!(
                    "row {index}: truth width {} vs prediction width {}",
                    t.len(),
                    p.len()
                )));
            }
            let sse: f32 = t.iter().zip(p).map(|(a, b)| (a - b) * (a - b)).sum();
            curves.push(CurvePair {
                index,
                truth: t.clone(),
                prediction: p.clone(),
                sse,
                label: format!("Step {step}, MSE={sse:.3}"),
            });
        }

        Ok(Self {
            name: name.to_string(),
            step,
            curves,
        })
    }
}

/// Destination for training summaries.
pub trait SummarySink {
    /// Record a named scalar at `step`.
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SinkError>;

    /// Record a prepared curve plot.
    fn log_plot(&mut self, plot: &CurvePlot) -> Result<(), SinkError>;

    /// Sample `curve_count` truth/prediction pairs and record them as a plot.
    fn log_curves(
        &mut self,
        name: &str,
        truth: &[Vec<f32>],
        prediction: &[Vec<f32>],
        step: u64,
        curve_count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<(), SinkError> {
        let plot = CurvePlot::sample(name, truth, prediction, step, curve_count, rng)?;
        self.log_plot(&plot)
    }

    /// Flush buffered events.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// One line of `summary.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryEvent {
    Scalar {
        name: String,
        value: f64,
        step: u64,
    },
    Curves(CurvePlot),
}

#[derive(Serialize)]
struct TimestampedEvent<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a SummaryEvent,
}

/// Appends events as JSON lines, flushing after each one.
pub struct JsonlSummaryWriter {
    path: PathBuf,
    file: Option<File>,
}

impl JsonlSummaryWriter {
    /// Open (or create) `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| SinkError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting events; later writes fail with [`SinkError::Closed`].
    pub fn close(&mut self) -> Result<(), SinkError> {
        self.flush()?;
        self.file = None;
        Ok(())
    }

    fn write_event(&mut self, event: &SummaryEvent) -> Result<(), SinkError> {
        let file = self.file.as_mut().ok_or(SinkError::Closed)?;
        let line = serde_json::to_string(&TimestampedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event,
        })?;
        writeln!(file, "{line}")
            .and_then(|()| file.flush())
            .map_err(|source| SinkError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Read back every event in a summary file, skipping timestamps.
    pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<SummaryEvent>, SinkError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SinkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(SinkError::from))
            .collect()
    }
}

impl SummarySink for JsonlSummaryWriter {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SinkError> {
        self.write_event(&SummaryEvent::Scalar {
            name: name.to_string(),
            value,
            step,
        })
    }

    fn log_plot(&mut self, plot: &CurvePlot) -> Result<(), SinkError> {
        self.write_event(&SummaryEvent::Curves(plot.clone()))
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        match self.file.as_mut() {
            Some(file) => file.flush().map_err(|source| SinkError::Io {
                path: self.path.clone(),
                source,
            }),
            None => Ok(()),
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSummary;

impl SummarySink for NullSummary {
    fn log_scalar(&mut self, _name: &str, _value: f64, _step: u64) -> Result<(), SinkError> {
        Ok(())
    }

    fn log_plot(&mut self, _plot: &CurvePlot) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps events in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySummary {
    pub events: Vec<SummaryEvent>,
}

impl MemorySummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(step, value)` of every scalar logged under `name`.
    pub fn scalars(&self, name: &str) -> Vec<(u64, f64)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SummaryEvent::Scalar {
                    name: n,
                    value,
                    step,
                } if n == name => Some((*step, *value)),
                _ => None,
            })
            .collect()
    }

    pub fn plots(&self) -> Vec<&CurvePlot> {
        self.events
            .iter()
            .filter_map(|event| match event {
                SummaryEvent::Curves(plot) => Some(plot),
                SummaryEvent::Scalar { .. } => None,
            })
            .collect()
    }
}

impl SummarySink for MemorySummary {
    fn log_scalar(&mut self, name: &str, value: f64, step: u64) -> Result<(), SinkError> {
        self.events.push(SummaryEvent::Scalar {
            name: name.to_string(),
            value,
            step,
        });
        Ok(())
    }

    fn log_plot(&mut self, plot: &CurvePlot) -> Result<(), SinkError> {
        self.events.push(SummaryEvent::Curves(plot.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rows(n: usize, offset: f32) -> Vec<Vec<f32>> {
        (0..n).map(|i| vec![i as f32 + offset; 4]).collect()
    }

    #[test]
    fn test_sample_clamps_and_labels() {
        let mut rng = StdRng::seed_from_u64(0);
        let truth = rows(3, 0.0);
        let pred = rows(3, 0.5);

        let plot = CurvePlot::sample("pred_plot", &truth, &pred, 250, 6, &mut rng).unwrap();
        assert_eq!(plot.curves.len(), 3);

        let mut indices: Vec<usize> = plot.curves.iter().map(|c| c.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);

        for curve in &plot.curves {
            assert!((curve.sse - 1.0).abs() < 1e-6);
            assert_eq!(curve.label, "Step 250, MSE=1.000");
            assert_eq!(curve.truth, truth[curve.index]);
        }
    }

    #[test]
    fn test_sample_rejects_mismatched_rows() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = CurvePlot::sample("p", &rows(2, 0.0), &rows(3, 0.0), 0, 2, &mut rng);
        assert!(matches!(err, Err(SinkError::Malformed(_))));

        let short = vec![vec![0.0; 3]; 2];
        let err = CurvePlot::sample("p", &rows(2, 0.0), &short, 0, 2, &mut rng);
        assert!(matches!(err, Err(SinkError::Malformed(_))));
    }

    #[test]
    fn test_jsonl_writer_appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("summary.jsonl");
        let mut writer = JsonlSummaryWriter::open(&path).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        writer.log_scalar("mean_squared_error", 0.5, 0).unwrap();
        writer
            .log_curves("pred_plot", &rows(4, 0.0), &rows(4, 1.0), 10, 2, &mut rng)
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|l| l.contains("\"timestamp\"")));

        let events = JsonlSummaryWriter::read_events(&path).unwrap();
        assert_eq!(
            events[0],
            SummaryEvent::Scalar {
                name: "mean_squared_error".into(),
                value: 0.5,
                step: 0
            }
        );
        match &events[1] {
            SummaryEvent::Curves(plot) => {
                assert_eq!(plot.step, 10);
                assert_eq!(plot.curves.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_closed_writer_rejects_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JsonlSummaryWriter::open(dir.path().join("s.jsonl")).unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.log_scalar("x", 1.0, 1),
            Err(SinkError::Closed)
        ));
    }

    #[test]
    fn test_memory_summary_filters() {
        let mut sink = MemorySummary::new();
        sink.log_scalar("a", 1.0, 0).unwrap();
        sink.log_scalar("b", 2.0, 0).unwrap();
        sink.log_scalar("a", 3.0, 5).unwrap();
        assert_eq!(sink.scalars("a"), vec![(0, 1.0), (5, 3.0)]);
        assert!(sink.plots().is_empty());
    }
}
