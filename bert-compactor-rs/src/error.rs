//! Error types for structural compaction.

use thiserror::Error;

/// Result type for compaction operations.
pub type CompactResult<T> = Result<T, CompactError>;

/// Errors that can occur while compacting a gated encoder.
///
/// Every variant is fatal for the run: a violated precondition means the
/// trained snapshot is malformed and there is nothing to retry.
#[derive(Debug, Error)]
pub enum CompactError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Output width of one transform does not match the input width of the next
    #[error("Dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        got: usize,
    },

    /// A selection index points outside the feature universe
    #[error("Index {index} out of range for {context} with {size} features")]
    IndexOutOfRange {
        context: String,
        index: usize,
        size: usize,
    },

    /// A hidden-stream mask kept no features at all
    #[error("Mask {0} keeps no features; refusing to build a zero-width stream")]
    EmptyMask(String),

    /// Live attention heads retain different numbers of dimensions
    #[error("Layer {layer}: {projection} heads retain uneven widths {counts:?}")]
    RaggedHeads {
        layer: usize,
        projection: &'static str,
        counts: Vec<usize>,
    },

    /// A required sub-module is absent
    #[error("Required module missing: {0}")]
    MissingModule(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CompactError {
    /// Create a dimension mismatch error
    pub fn dimension_mismatch(context: impl Into<String>, expected: usize, got: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            got,
        }
    }

    /// Create an index out of range error
    pub fn index_out_of_range(context: impl Into<String>, index: usize, size: usize) -> Self {
        Self::IndexOutOfRange {
            context: context.into(),
            index,
            size,
        }
    }

    /// Create an empty mask error
    pub fn empty_mask(name: impl Into<String>) -> Self {
        Self::EmptyMask(name.into())
    }

    /// Create a missing module error
    pub fn missing_module(name: impl Into<String>) -> Self {
        Self::MissingModule(name.into())
    }

    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// The pooler was required but the gated model has none.
    pub fn pooler_missing() -> Self {
        Self::MissingModule("pooler.dense".to_string())
    }
}
