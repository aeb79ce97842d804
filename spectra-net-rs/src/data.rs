//! Data loading for spectrum regression.
//!
//! - [`ColumnRange`] - inclusive column selection, written `[first, last]`
//! - [`load_records`] - whitespace-delimited numeric text into [`Record`]s
//! - [`split_folds`] - deterministic cross-validation split
//! - [`BatchStream`] - resettable batch source; `Ok(None)` marks the end of a pass
//! - [`InMemoryStream`] - batches over loaded records with an optional shuffle buffer
//! - [`DataReader`] - builds the train and validation streams from a [`DataConfig`]

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::DataConfig;
use crate::error::{SpectraError, SpectraResult};

/// Contiguous, inclusive range of column indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[usize; 2]", into = "[usize; 2]")]
pub struct ColumnRange {
    pub first: usize,
    pub last: usize,
}

impl ColumnRange {
    pub fn new(first: usize, last: usize) -> SpectraResult<Self> {
        if last < first {
            return Err(SpectraError::configuration(format!(
                "column range [{first}, {last}] is reversed"
            )));
        }
        Ok(Self { first, last })
    }

    /// Number of columns selected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last - self.first + 1
    }

    /// Always false; a range selects at least one column.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl TryFrom<[usize; 2]> for ColumnRange {
    type Error = SpectraError;

    fn try_from([first, last]: [usize; 2]) -> Result<Self, Self::Error> {
        Self::new(first, last)
    }
}

impl From<ColumnRange> for [usize; 2] {
    fn from(range: ColumnRange) -> Self {
        [range.first, range.last]
    }
}

impl fmt::Display for ColumnRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.first, self.last)
    }
}

/// Parses `first,last` (also `first:last` or `first-last`).
impl FromStr for ColumnRange {
    type Err = SpectraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SpectraError::configuration(format!("invalid column range `{s}`"));
        let (first, last) = s.split_once([',', ':', '-']).ok_or_else(bad)?;
        let first = first.trim().parse().map_err(|_| bad())?;
        let last = last.trim().parse().map_err(|_| bad())?;
        Self::new(first, last)
    }
}

/// One sample: input parameters and the target curve.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub features: Vec<f32>,
    pub labels: Vec<f32>,
}

/// A mini-batch on device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// (batch, input_size)
    pub features: Tensor,
    /// (batch, output_size)
    pub labels: Tensor,
}

impl Batch {
    /// Stack `records` into a batch.
    pub fn from_records(records: &[&Record], device: &Device) -> SpectraResult<Self> {
        let Some(first) = records.first() else {
            return Err(SpectraError::data("cannot build an empty batch"));
        };
        let (input_size, output_size) = (first.features.len(), first.labels.len());

        let mut features = Vec::with_capacity(records.len() * input_size);
        let mut labels = Vec::with_capacity(records.len() * output_size);
        for record in records {
            features.extend_from_slice(&record.features);
            labels.extend_from_slice(&record.labels);
        }

        Ok(Self {
            features: Tensor::from_vec(features, (records.len(), input_size), device)?,
            labels: Tensor::from_vec(labels, (records.len(), output_size), device)?,
        })
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.features.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resettable source of batches.
pub trait BatchStream: Send {
    /// Rewind to the start of the data.
    fn reset(&mut self) -> SpectraResult<()>;

    /// Next batch, or `None` once the current pass is exhausted.
    fn next_batch(&mut self) -> SpectraResult<Option<Batch>>;

    /// Number of records per pass, if known.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

/// Parse a whitespace-delimited numeric file into records.
///
/// Commas are treated as whitespace. Blank lines are skipped.
///
/// # Errors
///
/// Fails with an IO error if the file cannot be read, and with a data error
/// naming the file and 1-based line number for short rows or non-numeric tokens.
pub fn load_records(
    path: &Path,
    x_range: ColumnRange,
    y_range: ColumnRange,
) -> SpectraResult<Vec<Record>> {
    let text = fs::read_to_string(path).map_err(|e| SpectraError::io(path, e))?;
    let needed = x_range.last.max(y_range.last) + 1;

    let mut records = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let values = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty())
            .map(str::parse::<f32>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                SpectraError::data(format!("{}:{}: {e}", path.display(), line_no + 1))
            })?;

        if values.len() < needed {
            return Err(SpectraError::data(format!(
                "{}:{}: expected at least {needed} columns, found {}",
                path.display(),
                line_no + 1,
                values.len()
            )));
        }

        records.push(Record {
            features: values[x_range.first..=x_range.last].to_vec(),
            labels: values[y_range.first..=y_range.last].to_vec(),
        });
    }

    Ok(records)
}

/// Split records into `(train, validation)`: record `i` belongs to fold
/// `i % cross_val`, and fold `val_fold` is held out.
pub fn split_folds(
    records: Vec<Record>,
    cross_val: usize,
    val_fold: usize,
) -> SpectraResult<(Vec<Record>, Vec<Record>)> {
    if cross_val == 0 || val_fold >= cross_val {
        return Err(SpectraError::configuration(format!(
            "val_fold {val_fold} is not a fold of {cross_val}"
        )));
    }

    let (valid, train): (Vec<_>, Vec<_>) = records
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % cross_val == val_fold);

    Ok((
        train.into_iter().map(|(_, r)| r).collect(),
        valid.into_iter().map(|(_, r)| r).collect(),
    ))
}

/// Visiting order produced by a bounded shuffle buffer of `buffer_size`:
/// the buffer is filled in order, then each draw emits a random buffered item
/// and refills its slot with the next unseen one.
fn buffered_shuffle_order(len: usize, buffer_size: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut order = Vec::with_capacity(len);
    let mut buffer: Vec<usize> = Vec::with_capacity(buffer_size);
    let mut next = 0;

    while next < len && buffer.len() < buffer_size {
        buffer.push(next);
        next += 1;
    }
    while !buffer.is_empty() {
        let slot = rng.gen_range(0..buffer.len());
        order.push(buffer[slot]);
        if next < len {
            buffer[slot] = next;
            next += 1;
        } else {
            buffer.swap_remove(slot);
        }
    }

    order
}

/// Batches over records held in memory.
pub struct InMemoryStream {
    records: Vec<Record>,
    batch_size: usize,
    /// Buffer size and generator when shuffling
    shuffle: Option<(usize, StdRng)>,
    order: Vec<usize>,
    cursor: usize,
    device: Device,
}

impl InMemoryStream {
    /// Stream `records` in file order.
    pub fn new(records: Vec<Record>, batch_size: usize, device: &Device) -> SpectraResult<Self> {
        if batch_size == 0 {
            return Err(SpectraError::configuration("batch_size must be positive"));
        }
        let order = (0..records.len()).collect();
        Ok(Self {
            records,
            batch_size,
            shuffle: None,
            order,
            cursor: 0,
            device: device.clone(),
        })
    }

    /// Reorder every pass through a shuffle buffer of `buffer_size` records.
    /// A buffer size of 0 or 1 keeps file order.
    pub fn with_shuffle(mut self, buffer_size: usize, seed: u64) -> Self {
        if buffer_size > 1 {
            self.shuffle = Some((buffer_size, StdRng::seed_from_u64(seed)));
            self.reorder();
        }
        self
    }

    fn reorder(&mut self) {
        if let Some((buffer_size, rng)) = &mut self.shuffle {
            self.order = buffered_shuffle_order(self.records.len(), *buffer_size, rng);
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl BatchStream for InMemoryStream {
    fn reset(&mut self) -> SpectraResult<()> {
        self.cursor = 0;
        self.reorder();
        Ok(())
    }

    fn next_batch(&mut self) -> SpectraResult<Option<Batch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let rows: Vec<&Record> = self.order[self.cursor..end]
            .iter()
            .map(|&i| &self.records[i])
            .collect();
        self.cursor = end;

        Batch::from_records(&rows, &self.device).map(Some)
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.records.len())
    }
}

/// Loaded train and validation records.
#[derive(Debug, Clone)]
pub struct DataSplits {
    pub train: Vec<Record>,
    pub valid: Vec<Record>,
}

/// Reads the configured data files and builds batch streams.
pub struct DataReader {
    config: DataConfig,
}

impl DataReader {
    /// Create a reader for a network with `output_size` outputs.
    ///
    /// # Errors
    ///
    /// Fails if the configured column ranges do not match `input_size` and
    /// `output_size`.
    pub fn new(config: &DataConfig, output_size: usize) -> SpectraResult<Self> {
        if config.x_range.len() != config.input_size {
            return Err(SpectraError::configuration(format!(
                "x_range selects {} columns but input_size is {}",
                config.x_range.len(),
                config.input_size
            )));
        }
        if config.y_range.len() != output_size {
            return Err(SpectraError::configuration(format!(
                "y_range selects {} columns but the network outputs {output_size}",
                config.y_range.len()
            )));
        }
        Ok(Self {
            config: config.clone(),
        })
    }

    /// Load both splits.
    ///
    /// The training split is every `train_file` record outside `val_fold`.
    /// The validation split is all of `valid_file` when configured, otherwise
    /// the `val_fold` records of `train_file`.
    pub fn read_splits(&self) -> SpectraResult<DataSplits> {
        let cfg = &self.config;
        let train_path = cfg.data_dir.join(&cfg.train_file);
        let all = load_records(&train_path, cfg.x_range, cfg.y_range)?;
        let total = all.len();
        let (train, held_out) = split_folds(all, cfg.cross_val, cfg.val_fold)?;

        let valid = match &cfg.valid_file {
            Some(name) => load_records(&cfg.data_dir.join(name), cfg.x_range, cfg.y_range)?,
            None => held_out,
        };

        if train.is_empty() {
            return Err(SpectraError::data(format!(
                "training split of {} is empty ({total} records, {} folds)",
                train_path.display(),
                cfg.cross_val
            )));
        }

        tracing::info!(
            "Loaded {} training and {} validation records",
            train.len(),
            valid.len()
        );
        Ok(DataSplits { train, valid })
    }

    /// Shuffled training stream and in-order validation stream.
    pub fn streams(
        &self,
        device: &Device,
        seed: u64,
    ) -> SpectraResult<(InMemoryStream, InMemoryStream)> {
        let DataSplits { train, valid } = self.read_splits()?;
        let train = InMemoryStream::new(train, self.config.batch_size, device)?
            .with_shuffle(self.config.shuffle_size, seed);
        let valid = InMemoryStream::new(valid, self.config.batch_size, device)?;
        Ok((train, valid))
    }

    /// In-order validation stream only.
    ///
    /// With `valid_file` configured, `train_file` is never opened.
    pub fn validation_stream(&self, device: &Device) -> SpectraResult<InMemoryStream> {
        let cfg = &self.config;
        let valid = match &cfg.valid_file {
            Some(name) => load_records(&cfg.data_dir.join(name), cfg.x_range, cfg.y_range)?,
            None => {
                let train_path = cfg.data_dir.join(&cfg.train_file);
                let all = load_records(&train_path, cfg.x_range, cfg.y_range)?;
                split_folds(all, cfg.cross_val, cfg.val_fold)?.1
            }
        };
        tracing::info!("Loaded {} validation records", valid.len());
        InMemoryStream::new(valid, cfg.batch_size, device)
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }
}
