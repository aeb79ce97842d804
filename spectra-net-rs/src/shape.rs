//! Shape inference for the upsampling stack.
//!
//! An [`ArchitectureSpec`] describes the network declaratively: the dense
//! widths, then the target width and channel count of every transposed
//! convolution stage. [`build_schedule`] turns that into concrete per-stage
//! strides, failing if any stage would need a non-integral stride.
//!
//! # Example
//!
//! ```
//! use spectra_net_rs::shape::{build_schedule, ArchitectureSpec};
//!
//! let spec = ArchitectureSpec {
//!     fc_filters: vec![100],
//!     tconv_dims: vec![200, 1000],
//!     tconv_filters: vec![8, 4],
//! };
//! let schedule = build_schedule(&spec).unwrap();
//! assert_eq!(schedule.strides(), vec![2, 5]);
//! assert_eq!(schedule.output_size(), 1000);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{SpectraError, SpectraResult};

/// Declarative network shape: dense widths followed by upsampling targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    /// Width of each dense layer, in order. The last entry is the feature
    /// width handed to the upsampling stack.
    pub fc_filters: Vec<usize>,
    /// Target sequence length after each transposed convolution stage
    pub tconv_dims: Vec<usize>,
    /// Output channel count of each transposed convolution stage
    pub tconv_filters: Vec<usize>,
}

impl ArchitectureSpec {
    /// Build a spec and check that it yields a valid schedule.
    pub fn new(
        fc_filters: Vec<usize>,
        tconv_dims: Vec<usize>,
        tconv_filters: Vec<usize>,
    ) -> SpectraResult<Self> {
        let spec = Self {
            fc_filters,
            tconv_dims,
            tconv_filters,
        };
        build_schedule(&spec)?;
        Ok(spec)
    }

    /// Width of the last dense layer.
    pub fn feature_width(&self) -> SpectraResult<usize> {
        self.fc_filters
            .last()
            .copied()
            .ok_or_else(|| SpectraError::configuration("fc_filters must not be empty"))
    }

    /// Length of the network output: the last upsampling target, or the last
    /// dense width when there is no upsampling stage.
    pub fn output_size(&self) -> SpectraResult<usize> {
        match self.tconv_dims.last() {
            Some(&dim) => Ok(dim),
            None => self.feature_width(),
        }
    }

    /// Whether the upsampling stack is skipped entirely.
    #[must_use]
    pub fn is_dense_only(&self) -> bool {
        self.tconv_dims.is_empty()
    }
}

/// One transposed convolution stage with its inferred stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsampleStage {
    /// Position of the stage in the stack
    pub index: usize,
    /// Sequence length entering the stage
    pub in_length: usize,
    /// Sequence length leaving the stage
    pub out_length: usize,
    /// Integral upsampling factor, `out_length / in_length`
    pub stride: usize,
    /// Channels entering the stage (1 for the first stage)
    pub in_channels: usize,
    /// Channels leaving the stage
    pub out_channels: usize,
}

/// Resolved upsampling schedule for an [`ArchitectureSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsampleSchedule {
    /// Width of the last dense layer
    pub feature_width: usize,
    /// Stages in application order; empty for a dense-only network
    pub stages: Vec<UpsampleStage>,
}

impl UpsampleSchedule {
    /// Length of the network output.
    #[must_use]
    pub fn output_size(&self) -> usize {
        self.stages
            .last()
            .map_or(self.feature_width, |stage| stage.out_length)
    }

    /// Channel count entering the final projection.
    #[must_use]
    pub fn output_channels(&self) -> usize {
        self.stages.last().map_or(1, |stage| stage.out_channels)
    }

    /// Per-stage strides in order.
    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        self.stages.iter().map(|stage| stage.stride).collect()
    }

    /// Whether there are no upsampling stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Derive the per-stage strides and channel counts for `spec`.
///
/// Stage `i` upsamples from `feature_dim_i` to `tconv_dims[i]`, where
/// `feature_dim_0` is the last dense width and `feature_dim_i` is
/// `tconv_dims[i - 1]` afterwards. Every target must be a multiple of the
/// length entering its stage.
///
/// # Errors
///
/// Returns [`SpectraError::Configuration`] when `fc_filters` is empty, any
/// width or filter count is zero, the two tconv lists differ in length, or a
/// stride would be non-integral.
pub fn build_schedule(spec: &ArchitectureSpec) -> SpectraResult<UpsampleSchedule> {
    let feature_width = spec.feature_width()?;

    if let Some(pos) = spec.fc_filters.iter().position(|&w| w == 0) {
        return Err(SpectraError::configuration(format!(
            "fc_filters[{pos}] must be positive"
        )));
    }
    if spec.tconv_dims.len() != spec.tconv_filters.len() {
        return Err(SpectraError::configuration(format!(
            "tconv_dims has {} stages but tconv_filters has {}",
            spec.tconv_dims.len(),
            spec.tconv_filters.len()
        )));
    }

    let mut stages = Vec::with_capacity(spec.tconv_dims.len());
    let mut feature_dim = feature_width;
    let mut last_filter = 1;

    for (index, (&out_length, &out_channels)) in spec
        .tconv_dims
        .iter()
        .zip(spec.tconv_filters.iter())
        .enumerate()
    {
        if out_length == 0 || out_channels == 0 {
            return Err(SpectraError::configuration(format!(
                "upsampling stage {index} has zero width or zero filters"
            )));
        }
        if out_length % feature_dim != 0 {
            return Err(SpectraError::configuration(format!(
                "tconv_dims[{index}] = {out_length} is not a multiple of the incoming \
                 feature dimension {feature_dim}"
            )));
        }

        stages.push(UpsampleStage {
            index,
            in_length: feature_dim,
            out_length,
            stride: out_length / feature_dim,
            in_channels: last_filter,
            out_channels,
        });

        feature_dim = out_length;
        last_filter = out_channels;
    }

    Ok(UpsampleSchedule {
        feature_width,
        stages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(fc: &[usize], dims: &[usize], filters: &[usize]) -> ArchitectureSpec {
        ArchitectureSpec {
            fc_filters: fc.to_vec(),
            tconv_dims: dims.to_vec(),
            tconv_filters: filters.to_vec(),
        }
    }

    #[test]
    fn test_strides_reconstruct_targets() {
        let specs = [
            spec(&[100], &[200], &[4]),
            spec(&[10, 20, 25], &[50, 250, 1000], &[16, 8, 4]),
            spec(&[7], &[7, 21, 63], &[1, 2, 3]),
            spec(&[143], &[1001], &[8]),
        ];

        for s in &specs {
            let schedule = build_schedule(s).unwrap();
            let mut feature_dim = *s.fc_filters.last().unwrap();
            for (stage, &target) in schedule.stages.iter().zip(&s.tconv_dims) {
                assert_eq!(stage.in_length, feature_dim);
                assert_eq!(feature_dim * stage.stride, target);
                feature_dim = target;
            }
            assert_eq!(schedule.output_size(), *s.tconv_dims.last().unwrap());
        }
    }

    #[test]
    fn test_non_multiple_target_rejected() {
        let err = build_schedule(&spec(&[100], &[150], &[4])).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("tconv_dims[0]"));

        let ok = build_schedule(&spec(&[100], &[200], &[4])).unwrap();
        assert_eq!(ok.strides(), vec![2]);
    }

    #[test]
    fn test_later_stage_checked_against_previous_target() {
        // 300 is a multiple of fc width 100 but not of the previous target 200
        let err = build_schedule(&spec(&[100], &[200, 300], &[4, 2])).unwrap_err();
        assert!(err.to_string().contains("tconv_dims[1]"));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = build_schedule(&spec(&[4], &[8, 16], &[2])).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_empty_fc_filters_rejected() {
        assert!(build_schedule(&spec(&[], &[], &[])).is_err());
    }

    #[test]
    fn test_zero_widths_rejected() {
        assert!(build_schedule(&spec(&[4, 0], &[], &[])).is_err());
        assert!(build_schedule(&spec(&[4], &[8], &[0])).is_err());
    }

    #[test]
    fn test_dense_only_schedule() {
        let s = spec(&[4], &[], &[]);
        let schedule = build_schedule(&s).unwrap();
        assert!(schedule.is_empty());
        assert_eq!(schedule.output_size(), 4);
        assert_eq!(schedule.output_channels(), 1);
        assert!(s.is_dense_only());
        assert_eq!(s.output_size().unwrap(), 4);
    }

    #[test]
    fn test_channels_thread_through_stages() {
        let schedule = build_schedule(&spec(&[4], &[8, 16], &[2, 5])).unwrap();
        assert_eq!(schedule.stages[0].in_channels, 1);
        assert_eq!(schedule.stages[0].out_channels, 2);
        assert_eq!(schedule.stages[1].in_channels, 2);
        assert_eq!(schedule.stages[1].out_channels, 5);
        assert_eq!(schedule.output_channels(), 5);
    }

    #[test]
    fn test_new_validates() {
        assert!(ArchitectureSpec::new(vec![100], vec![150], vec![4]).is_err());
        let s = ArchitectureSpec::new(vec![4], vec![8], vec![2]).unwrap();
        assert_eq!(s.output_size().unwrap(), 8);
    }
}
