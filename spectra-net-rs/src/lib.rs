//! Regression networks that map a few input parameters to long output curves
//! (1001-point spectra by default), built on candle.
//!
//! This crate provides:
//! - Shape inference for a dense-to-upsampling architecture ([`shape`])
//! - A 1-D "same"-padded transposed convolution with autograd support ([`tconv`])
//! - The network itself, in two variants ([`network`])
//! - A hook-driven training loop with periodic validation and checkpointing
//!   ([`trainer`], [`hooks`], [`summary`])
//! - An evaluation pass and per-row error report ([`evaluate`])
//!
//! # Example
//!
//! ```no_run
//! use spectra_net_rs::{ArchitectureSpec, NetworkOptions, RegressionNetwork};
//! use candle_core::{DType, Device, Tensor};
//!
//! let spec = ArchitectureSpec::new(vec![100, 100, 143], vec![1001], vec![8]).unwrap();
//! let device = Device::Cpu;
//! let network = RegressionNetwork::new(&spec, NetworkOptions::default(), &device).unwrap();
//!
//! let x = Tensor::zeros((4, 2), DType::F32, &device).unwrap();
//! let y = network.forward(&x).unwrap();
//! assert_eq!(y.dims(), &[4, 1001]);
//! ```
//!
//! # Training from a config
//!
//! ```no_run
//! use spectra_net_rs::{PipelineConfig, Trainer};
//! use candle_core::Device;
//!
//! let config = PipelineConfig::from_file("config.yaml").unwrap();
//! let mut trainer = Trainer::from_config(&config, &Device::Cpu).unwrap();
//! let report = trainer.run_training(config.training.train_step).unwrap();
//! println!("final loss: {:?}", report.final_loss);
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod hooks;
pub mod meta;
pub mod network;
pub mod optimizer;
pub mod scheduler;
pub mod shape;
pub mod summary;
pub mod tconv;
pub mod trainer;

pub use config::{DataConfig, ModelConfig, PipelineConfig, TrainingConfig};
pub use data::{Batch, BatchStream, ColumnRange, DataReader, InMemoryStream, Record};
pub use error::{SpectraError, SpectraResult};
pub use evaluate::{compare_truth_pred, evaluate, run_evaluation, ErrorReport, EvaluationResult};
pub use hooks::{Hook, HookEvent, TrainProgressHook, TrainingState, ValidationHook};
pub use meta::ModelMeta;
pub use network::{ArchitectureVariant, NetworkOptions, RegressionNetwork};
pub use shape::{build_schedule, ArchitectureSpec, UpsampleSchedule};
pub use summary::{JsonlSummaryWriter, MemorySummary, NullSummary, SinkError, SummarySink};
pub use trainer::{Trainer, TrainingReport};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::data::{BatchStream, DataReader};
    pub use crate::error::{SpectraError, SpectraResult};
    pub use crate::hooks::{Hook, TrainProgressHook, ValidationHook};
    pub use crate::network::{ArchitectureVariant, NetworkOptions, RegressionNetwork};
    pub use crate::shape::ArchitectureSpec;
    pub use crate::summary::SummarySink;
    pub use crate::trainer::{Trainer, TrainingReport};
}
