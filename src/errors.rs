//! Typed error handling for the rknn-convert library.
//!
//! All public API functions return [`Result<T>`](type@Result), which uses
//! [`ConvertError`] as the error type. The CLI binary converts these into
//! `anyhow::Error` automatically via the blanket `From<E: std::error::Error>`
//! impl, so callers that prefer `anyhow` can use `?` without `.map_err()`.

use std::fmt;
use std::path::PathBuf;

/// Result type alias used throughout the rknn-convert public API.
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Errors produced by the rknn-convert library.
///
/// Each variant covers one pipeline stage. Every variant carries enough
/// context to pinpoint the offending artifact (config field, model path,
/// tensor, or node).
#[derive(Debug)]
pub enum ConvertError {
    /// Malformed, missing, or invalid configuration field.
    Config {
        /// Dotted path of the first offending field (e.g. `input.shapes`).
        field: String,
        /// What went wrong.
        reason: String,
    },

    /// Native model file unreadable or malformed.
    Load {
        /// Path that was being loaded.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Forward shape inference failed for a tensor during loading.
    ShapeInference {
        /// Name (or id) of the tensor whose shape could not be inferred.
        tensor: String,
        /// What went wrong.
        reason: String,
    },

    /// An operator with no mapping to the IR vocabulary survived to a stage
    /// that cannot tolerate it (`convert` only; `explain` reports instead).
    UnsupportedOperator {
        /// Name of the offending node.
        node: String,
        /// Native operator name as seen in the source model.
        op: String,
    },

    /// Empty/invalid calibration data or unresolved numeric degeneracy.
    Quantize {
        /// What went wrong.
        reason: String,
    },

    /// I/O failure during the atomic write, or target incompatibility.
    Encode {
        /// What went wrong.
        reason: String,
    },

    /// A graph-rewrite pass broke an invariant (e.g. introduced a cycle).
    /// This is a programming bug, never a user-facing condition.
    Internal {
        /// What went wrong.
        reason: String,
    },
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertError::Config { field, reason } => {
                write!(f, "config error in '{field}': {reason}")
            }
            ConvertError::Load { path, reason } => {
                write!(f, "failed to load model '{}': {reason}", path.display())
            }
            ConvertError::ShapeInference { tensor, reason } => {
                write!(f, "shape inference failed for tensor '{tensor}': {reason}")
            }
            ConvertError::UnsupportedOperator { node, op } => {
                write!(f, "unsupported operator '{op}' at node '{node}'")
            }
            ConvertError::Quantize { reason } => {
                write!(f, "quantization error: {reason}")
            }
            ConvertError::Encode { reason } => {
                write!(f, "encode error: {reason}")
            }
            ConvertError::Internal { reason } => {
                write!(f, "internal error: {reason}")
            }
        }
    }
}

impl std::error::Error for ConvertError {}

/// Non-fatal diagnostics accumulated across a pipeline run.
///
/// Warnings never stop a run on their own; the orchestrator surfaces them
/// alongside the terminal outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    /// A native operator had no mapping to the IR vocabulary and was loaded
    /// as a sentinel node. `explain` reports it; `convert` fails later.
    UnsupportedOperator { node: String, op: String },

    /// A tensor shape could not be inferred precisely and was carried over
    /// from the node's first input instead.
    ShapeFallback { tensor: String },

    /// A tensor's observed calibration range was a single point; the scale
    /// was clamped to the smallest usable positive value.
    DegenerateRange { tensor: String },

    /// Quantizing this tensor is expected to lose noticeable precision.
    PrecisionLoss { tensor: String, detail: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnsupportedOperator { node, op } => {
                write!(f, "operator '{op}' at node '{node}' has no IR mapping")
            }
            Warning::ShapeFallback { tensor } => {
                write!(f, "shape of tensor '{tensor}' carried over from its input")
            }
            Warning::DegenerateRange { tensor } => {
                write!(f, "tensor '{tensor}' has a degenerate calibration range; scale clamped")
            }
            Warning::PrecisionLoss { tensor, detail } => {
                write!(f, "tensor '{tensor}' may lose precision: {detail}")
            }
        }
    }
}
