//! Dense-to-upsampling regression network.
//!
//! The forward path is:
//! - dense layers with leaky ReLU, widths from `fc_filters`
//! - a unit channel axis, turning the last dense output into a 1-channel sequence
//! - one transposed convolution per upsampling stage, optionally followed by a
//!   width-3 refining convolution
//! - a width-1 convolution collapsing channels back to 1
//!
//! Tensors inside the upsampling stack are channels-first, `[batch, channels, length]`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::data::Batch;
use crate::error::{SpectraError, SpectraResult};
use crate::shape::{build_schedule, ArchitectureSpec, UpsampleSchedule, UpsampleStage};
use crate::tconv::TransposedConv1d;

/// Default negative slope of the leaky ReLU.
pub const DEFAULT_LEAKY_SLOPE: f64 = 0.2;

/// How each upsampling stage is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchitectureVariant {
    /// Transposed convolution only
    #[default]
    TconvOnly,
    /// Transposed convolution followed by a same-length width-3 convolution
    TconvRefine,
}

impl ArchitectureVariant {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TconvOnly => "tconv_only",
            Self::TconvRefine => "tconv_refine",
        }
    }
}

impl fmt::Display for ArchitectureVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchitectureVariant {
    type Err = SpectraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tconv_only" => Ok(Self::TconvOnly),
            "tconv_refine" => Ok(Self::TconvRefine),
            other => Err(SpectraError::configuration(format!(
                "unknown architecture variant `{other}`"
            ))),
        }
    }
}

/// Leaky ReLU: `max(x, slope * x)` for `0 <= slope < 1`.
pub fn leaky_relu(x: &Tensor, slope: f64) -> candle_core::Result<Tensor> {
    x.maximum(&x.affine(slope, 0.0)?)
}

/// Construction options that are not part of the architecture shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkOptions {
    /// Width of each input row
    pub input_size: usize,
    pub variant: ArchitectureVariant,
    pub leaky_slope: f64,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            input_size: 2,
            variant: ArchitectureVariant::TconvOnly,
            leaky_slope: DEFAULT_LEAKY_SLOPE,
        }
    }
}

/// Dense layer drawn from `N(0, 0.02)` with a zero bias.
fn dense(in_dim: usize, out_dim: usize, vb: VarBuilder) -> candle_core::Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// One upsampling stage plus its optional refining convolution.
struct UpsampleBlock {
    tconv: TransposedConv1d,
    refine: Option<Conv1d>,
}

impl UpsampleBlock {
    fn new(
        stage: &UpsampleStage,
        variant: ArchitectureVariant,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let tconv = TransposedConv1d::new(stage, vb.pp("tconv"))?;
        let refine = match variant {
            ArchitectureVariant::TconvOnly => None,
            ArchitectureVariant::TconvRefine => Some(candle_nn::conv1d(
                stage.out_channels,
                stage.out_channels,
                3,
                Conv1dConfig {
                    padding: 1,
                    ..Default::default()
                },
                vb.pp("refine"),
            )?),
        };
        Ok(Self { tconv, refine })
    }

    fn forward(&self, xs: &Tensor, slope: f64) -> candle_core::Result<Tensor> {
        let up = self.tconv.forward(xs)?;
        match &self.refine {
            Some(conv) => leaky_relu(&conv.forward(&up)?, slope),
            None => Ok(up),
        }
    }
}

/// Outputs of one forward pass over a labelled batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    /// Batch-mean squared error
    pub loss: f32,
    /// Label rows in batch order
    pub truth: Vec<Vec<f32>>,
    /// Prediction rows aligned with `truth`
    pub prediction: Vec<Vec<f32>>,
}

/// Regression network mapping `[batch, input_size]` to `[batch, output_size]`.
pub struct RegressionNetwork {
    dense: Vec<Linear>,
    stages: Vec<UpsampleBlock>,
    /// Collapses channels to one; also applied after a dense-only stack
    projection: Conv1d,
    spec: ArchitectureSpec,
    schedule: UpsampleSchedule,
    options: NetworkOptions,
    var_map: VarMap,
    device: Device,
}

impl RegressionNetwork {
    /// Build a freshly initialised network.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error if `spec` has no valid upsampling
    /// schedule or `input_size` is zero.
    pub fn new(
        spec: &ArchitectureSpec,
        options: NetworkOptions,
        device: &Device,
    ) -> SpectraResult<Self> {
        if options.input_size == 0 {
            return Err(SpectraError::configuration("input_size must be positive"));
        }
        let schedule = build_schedule(spec)?;

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let mut dense_layers = Vec::with_capacity(spec.fc_filters.len());
        let mut in_dim = options.input_size;
        for (i, &width) in spec.fc_filters.iter().enumerate() {
            dense_layers.push(dense(in_dim, width, vb.pp(format!("dense.{i}")))?);
            in_dim = width;
        }

        let mut stages = Vec::with_capacity(schedule.stages.len());
        for stage in &schedule.stages {
            stages.push(UpsampleBlock::new(
                stage,
                options.variant,
                vb.pp(format!("upsample.{}", stage.index)),
            )?);
        }

        // 1-wide, single-output conv; a dense-only net sees one channel
        let projection = candle_nn::conv1d(
            schedule.output_channels(),
            1,
            1,
            Conv1dConfig::default(),
            vb.pp("projection"),
        )?;

        tracing::debug!(
            "Built network: fc {:?}, strides {:?}, variant {}",
            spec.fc_filters,
            schedule.strides(),
            options.variant
        );

        Ok(Self {
            dense: dense_layers,
            stages,
            projection,
            spec: spec.clone(),
            schedule,
            options,
            var_map,
            device: device.clone(),
        })
    }

    /// Build a network and restore its parameters from a safetensors file.
    pub fn load(
        spec: &ArchitectureSpec,
        options: NetworkOptions,
        path: &Path,
        device: &Device,
    ) -> SpectraResult<Self> {
        let mut network = Self::new(spec, options, device)?;
        network.restore(path)?;
        Ok(network)
    }

    /// Forward pass.
    /// Input: (batch, input_size)
    /// Output: (batch, output_size)
    pub fn forward(&self, xs: &Tensor) -> SpectraResult<Tensor> {
        let (_, width) = xs.dims2()?;
        if width != self.options.input_size {
            return Err(SpectraError::data(format!(
                "expected {} input columns, got {width}",
                self.options.input_size
            )));
        }

        let slope = self.options.leaky_slope;
        let mut hidden = xs.clone();
        for layer in &self.dense {
            hidden = leaky_relu(&layer.forward(&hidden)?, slope)?;
        }

        let mut seq = hidden.unsqueeze(1)?;
        for block in &self.stages {
            seq = block.forward(&seq, slope)?;
        }
        Ok(self.projection.forward(&seq)?.squeeze(1)?)
    }

    /// Batch-mean squared error between the prediction for `batch` and its labels.
    pub fn loss(&self, batch: &Batch) -> SpectraResult<Tensor> {
        let prediction = self.forward(&batch.features)?;
        Ok(candle_nn::loss::mse(&prediction, &batch.labels)?)
    }

    /// Forward a labelled batch without building a training graph.
    pub fn evaluate_batch(&self, batch: &Batch) -> SpectraResult<BatchOutput> {
        let prediction = self.forward(&batch.features)?.detach();
        let loss = candle_nn::loss::mse(&prediction, &batch.labels)?.to_scalar::<f32>()?;

        Ok(BatchOutput {
            loss,
            truth: batch.labels.to_vec2::<f32>()?,
            prediction: prediction.to_vec2::<f32>()?,
        })
    }

    /// Save parameters (safetensors format).
    pub fn save(&self, path: &Path) -> SpectraResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SpectraError::io(parent, e))?;
        }
        self.var_map.save(path)?;
        Ok(())
    }

    /// Overwrite the parameters in place from a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns [`SpectraError::Checkpoint`] if the file is missing or does not
    /// hold every parameter of this architecture with the right shape.
    pub fn restore(&mut self, path: &Path) -> SpectraResult<()> {
        if !path.is_file() {
            return Err(SpectraError::checkpoint(format!(
                "no weights at {}",
                path.display()
            )));
        }
        self.var_map.load(path).map_err(|e| {
            SpectraError::checkpoint(format!("cannot restore {}: {e}", path.display()))
        })
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn spec(&self) -> &ArchitectureSpec {
        &self.spec
    }

    pub fn schedule(&self) -> &UpsampleSchedule {
        &self.schedule
    }

    pub fn options(&self) -> NetworkOptions {
        self.options
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn input_size(&self) -> usize {
        self.options.input_size
    }

    pub fn output_size(&self) -> usize {
        self.schedule.output_size()
    }

    /// Total number of trainable scalars.
    pub fn parameter_count(&self) -> usize {
        self.var_map
            .all_vars()
            .iter()
            .map(|var| var.as_tensor().elem_count())
            .sum()
    }
}
