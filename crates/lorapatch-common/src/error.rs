//! Error types for the lorapatch engine
//!
//! Only [`SourceError`] is meant to abort an adapter load. Every other
//! per-module problem is turned into an outcome by the caller and counted.

use crate::config::ConfigError;
use thiserror::Error;

/// Result alias used throughout the workspace
pub type Result<T> = std::result::Result<T, LoraError>;

/// Top-level engine error
#[derive(Error, Debug)]
pub enum LoraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Adapter source error: {0}")]
    Source(#[from] SourceError),

    #[error("Layer error: {0}")]
    Layer(#[from] LayerError),

    #[error("Quantization error: {0}")]
    Quantization(#[from] QuantizationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Failures reading or decoding an adapter source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Unsupported adapter format: {path}")]
    UnsupportedFormat { path: String },

    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("Invalid adapter metadata: {reason}")]
    Metadata { reason: String },
}

/// Failures raised by a layer while taking or dropping a patch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayerError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },

    #[error("Rank mismatch: down has {down} rows, up has {up} columns")]
    RankMismatch { down: usize, up: usize },

    #[error("{kind} layers do not support {operation}")]
    Unsupported { kind: String, operation: String },
}

/// Failures in the compressed weight representation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantizationError {
    #[error("Invalid block size: {size}")]
    InvalidBlockSize { size: usize },

    #[error("Corrupt quantized data: expected {expected} bytes, got {actual}")]
    CorruptData { expected: usize, actual: usize },

    #[error("Quantization failed: {reason}")]
    QuantizationFailed { reason: String },
}

impl LoraError {
    /// Whether this error came from reading the adapter source itself
    pub fn is_source_failure(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_error_converts_into_top_level() {
        let err: LoraError =
            LayerError::ShapeMismatch { expected: vec![8, 4], actual: vec![4, 4] }.into();
        assert!(matches!(err, LoraError::Layer(LayerError::ShapeMismatch { .. })));
        assert!(err.to_string().contains("[8, 4]"));
        assert!(!err.is_source_failure());
    }

    #[test]
    fn source_errors_are_source_failures() {
        let err: LoraError = SourceError::UnsupportedFormat { path: "a.onnx".into() }.into();
        assert!(err.is_source_failure());
        assert_eq!(err.to_string(), "Adapter source error: Unsupported adapter format: a.onnx");
    }
}
