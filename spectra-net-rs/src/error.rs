//! Error types for the spectra-net pipeline.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::summary::SinkError;

/// Result type for spectra-net operations.
pub type SpectraResult<T> = Result<T, SpectraError>;

/// Errors that can occur while building, training or evaluating a network.
#[derive(Debug, Error)]
pub enum SpectraError {
    /// Malformed architecture or pipeline configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// File could not be read or written
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed data record, column range or empty split
    #[error("Data error: {0}")]
    Data(String),

    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Checkpoint could not be restored
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Summary sink failure surfaced to a caller that asked for it
    #[error("Summary error: {0}")]
    Sink(#[from] SinkError),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML config parse error
    #[error("Invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SpectraError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Wrap an IO error together with the path that caused it
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this error came from a bad configuration (never worth retrying)
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_configuration_error_display() {
        let error = SpectraError::configuration("stride would be non-integral");
        assert_eq!(
            error.to_string(),
            "Configuration error: stride would be non-integral"
        );
        assert!(error.is_configuration());
    }

    #[test]
    fn test_io_error_names_path() {
        let error = SpectraError::io(
            "models/run/model_meta.txt",
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        let msg = error.to_string();
        assert!(msg.contains("models/run/model_meta.txt"));
        assert!(msg.contains("no such file"));
        assert!(!error.is_configuration());
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error;
        let error = SpectraError::io("x", io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(error.source().is_some());
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: SpectraError = candle_error.into();
        assert!(error.to_string().starts_with("Candle error"));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("a: b: :::").unwrap_err();
        let error: SpectraError = yaml_error.into();
        assert!(error.to_string().contains("Invalid config file"));
    }
}
