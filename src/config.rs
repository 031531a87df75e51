//! TOML configuration file support.
//!
//! A configuration file describes one conversion: the input model descriptor,
//! quantization options, output path, and target platform. It is parsed once
//! at startup into an immutable [`Configuration`] and validated before any
//! graph work begins.

use crate::errors::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Top-level conversion configuration.
///
/// Loaded from a TOML file with [`Configuration::parse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Input model descriptor.
    pub input: InputConfig,

    /// Quantization options.
    #[serde(default)]
    pub quantization: QuantizationConfig,

    /// Output artifact location.
    pub output: OutputConfig,

    /// Target platform selection.
    pub target: TargetConfig,
}

/// The `[input]` table: which model to load and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Path to the source model file.
    pub path: PathBuf,

    /// Source model format.
    pub format: ModelFormat,

    /// Input tensor name → ordered dimension list. Used to resolve dynamic
    /// boundary dimensions before shape inference.
    #[serde(default)]
    pub shapes: BTreeMap<String, Vec<usize>>,
}

/// Supported source model formats. Closed set: adding a format means adding
/// a variant here and a dispatch arm in the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Onnx,
    TensorFlow,
    PyTorch,
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFormat::Onnx => write!(f, "onnx"),
            ModelFormat::TensorFlow => write!(f, "tensorflow"),
            ModelFormat::PyTorch => write!(f, "pytorch"),
        }
    }
}

/// The `[quantization]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
    /// Whether to quantize at all. When `false`, the encoder emits a
    /// float32 binary (only on platforms that support it).
    pub enabled: bool,

    /// Fixed-point element type for quantized tensors.
    pub dtype: QuantDtype,

    /// Path to a `.npy` file of calibration samples, shape
    /// `[num_samples, ...input shape]`.
    pub calibration_dataset: Option<PathBuf>,

    /// Inline calibration samples, one flattened input tensor each.
    pub calibration_samples: Option<Vec<Vec<f32>>>,

    /// Range-selection policy for calibration statistics.
    pub method: CalibrationMethod,

    /// Force symmetric ranges (zero-point fixed at 0).
    pub symmetric: bool,

    /// Per-channel mean subtracted from calibration samples before
    /// simulation.
    pub mean_values: Option<Vec<f32>>,

    /// Per-channel divisor applied to calibration samples after mean
    /// subtraction.
    pub std_values: Option<Vec<f32>>,
}

/// Fixed-point target element type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantDtype {
    #[default]
    Int8,
    Int16,
}

impl QuantDtype {
    /// Smallest representable quantized value.
    pub fn qmin(self) -> i32 {
        match self {
            QuantDtype::Int8 => i8::MIN as i32,
            QuantDtype::Int16 => i16::MIN as i32,
        }
    }

    /// Largest representable quantized value.
    pub fn qmax(self) -> i32 {
        match self {
            QuantDtype::Int8 => i8::MAX as i32,
            QuantDtype::Int16 => i16::MAX as i32,
        }
    }
}

/// Calibration range-selection policy.
///
/// Pluggable per configuration; `minmax` (full observed range) is the
/// default. `percentile` clips at the 99.9th percentile to shed outliers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMethod {
    #[default]
    MinMax,
    Percentile,
}

/// The `[output]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Destination for the encoded binary. Written atomically.
    pub path: PathBuf,
}

/// The `[target]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target NPU variant.
    pub platform: TargetPlatform,

    /// Optional user string embedded in the output binary.
    #[serde(default)]
    pub custom_string: Option<String>,
}

/// Supported NPU variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPlatform {
    Rk3588,
    Rk3576,
    Rk3568,
    Rk3562,
    Rv1126,
    Rv1106,
}

impl TargetPlatform {
    /// Platform identifier as written into the output header.
    pub fn id(self) -> u16 {
        match self {
            TargetPlatform::Rk3588 => 0x3588,
            TargetPlatform::Rk3576 => 0x3576,
            TargetPlatform::Rk3568 => 0x3568,
            TargetPlatform::Rk3562 => 0x3562,
            TargetPlatform::Rv1126 => 0x1126,
            TargetPlatform::Rv1106 => 0x1106,
        }
    }

    /// Whether the NPU can execute float32 graphs. The small rv-series
    /// parts are int-only.
    pub fn supports_float(self) -> bool {
        !matches!(self, TargetPlatform::Rv1126 | TargetPlatform::Rv1106)
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPlatform::Rk3588 => write!(f, "rk3588"),
            TargetPlatform::Rk3576 => write!(f, "rk3576"),
            TargetPlatform::Rk3568 => write!(f, "rk3568"),
            TargetPlatform::Rk3562 => write!(f, "rk3562"),
            TargetPlatform::Rv1126 => write!(f, "rv1126"),
            TargetPlatform::Rv1106 => write!(f, "rv1106"),
        }
    }
}

impl Configuration {
    /// Load and validate a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::Config`] on I/O, parse, or validation errors,
    /// identifying the first offending field. No partial recovery is
    /// attempted.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConvertError::Config {
            field: "config".into(),
            reason: format!("failed to read '{}': {e}", path.display()),
        })?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a TOML string. Does not validate.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConvertError::Config {
            field: "config".into(),
            reason: format!("failed to parse TOML: {e}"),
        })
    }

    /// Validate field values, path existence, and shape well-formedness.
    ///
    /// Fails fast on the first offending field, in document order.
    pub fn validate(&self) -> Result<()> {
        if !self.input.path.exists() {
            return Err(ConvertError::Config {
                field: "input.path".into(),
                reason: format!("file '{}' does not exist", self.input.path.display()),
            });
        }

        for (name, shape) in &self.input.shapes {
            if shape.is_empty() {
                return Err(ConvertError::Config {
                    field: "input.shapes".into(),
                    reason: format!("shape for '{name}' is empty"),
                });
            }
            if shape.iter().any(|&d| d == 0) {
                return Err(ConvertError::Config {
                    field: "input.shapes".into(),
                    reason: format!("shape for '{name}' contains a zero dimension"),
                });
            }
        }

        let q = &self.quantization;
        if q.enabled {
            match (&q.calibration_dataset, &q.calibration_samples) {
                (Some(path), _) if !path.exists() => {
                    return Err(ConvertError::Config {
                        field: "quantization.calibration_dataset".into(),
                        reason: format!("file '{}' does not exist", path.display()),
                    });
                }
                (None, None) => {
                    return Err(ConvertError::Config {
                        field: "quantization.calibration_dataset".into(),
                        reason: "quantization is enabled but no calibration dataset or \
                                 inline samples were given"
                            .into(),
                    });
                }
                _ => {}
            }

            if let (Some(mean), Some(std)) = (&q.mean_values, &q.std_values) {
                if mean.len() != std.len() {
                    return Err(ConvertError::Config {
                        field: "quantization.std_values".into(),
                        reason: format!(
                            "std_values has {} entries but mean_values has {}",
                            std.len(),
                            mean.len()
                        ),
                    });
                }
            }
            if let Some(std) = &q.std_values {
                if std.iter().any(|&s| s == 0.0) {
                    return Err(ConvertError::Config {
                        field: "quantization.std_values".into(),
                        reason: "std_values contains a zero".into(),
                    });
                }
            }
        }

        if self.output.path.as_os_str().is_empty() {
            return Err(ConvertError::Config {
                field: "output.path".into(),
                reason: "output path is empty".into(),
            });
        }
        if let Some(parent) = self.output.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(ConvertError::Config {
                    field: "output.path".into(),
                    reason: format!("directory '{}' does not exist", parent.display()),
                });
            }
        }

        if !q.enabled && !self.target.platform.supports_float() {
            return Err(ConvertError::Config {
                field: "target.platform".into(),
                reason: format!(
                    "platform '{}' is int-only and requires quantization.enabled = true",
                    self.target.platform
                ),
            });
        }

        Ok(())
    }
}
