//! Conversion pipeline.
//!
//! Two entry points over the same front half: `convert` runs
//! config → load → optimize → quantize → encode, `explain` stops after
//! optimization and reports structure instead. Each stage returns a
//! `Result` consumed by the next, so the run stops at the first failure
//! and, because the encoder is the only writer and writes atomically, a
//! failed run never leaves partial output.

use crate::config::Configuration;
use crate::encoder;
use crate::errors::{ConvertError, Result, Warning};
use crate::explain::{self, Report};
use crate::loader;
use crate::optimizer;
use crate::quantizer;
use std::path::{Path, PathBuf};

/// Successful `convert` outcome.
#[derive(Debug)]
pub struct Conversion {
    pub output: PathBuf,
    pub quantized: bool,
    pub node_count: usize,
    pub warnings: Vec<Warning>,
}

/// Successful `explain` outcome.
#[derive(Debug)]
pub struct Explanation {
    pub report: Report,
    pub config_summary: String,
    pub warnings: Vec<Warning>,
}

/// Convert the model described by the configuration file into a target
/// binary at `output.path`.
pub fn convert(config_path: &Path) -> Result<Conversion> {
    let config = Configuration::parse(config_path)?;
    let (mut graph, mut warnings) = loader::load(&config)?;
    optimizer::optimize(&mut graph)?;

    // Deferred failure ends here: what load turned into warnings becomes a
    // hard error before any numeric work.
    if let Some(node) = graph.first_unsupported() {
        return Err(ConvertError::UnsupportedOperator {
            node: node.name.clone(),
            op: node.op.name().to_string(),
        });
    }

    let quantized = config.quantization.enabled;
    if quantized {
        warnings.extend(quantizer::quantize(&mut graph, &config.quantization)?);
    }

    encoder::write(&graph, &config.target, quantized, &config.output.path)?;
    Ok(Conversion {
        output: config.output.path.clone(),
        quantized,
        node_count: graph.node_count(),
        warnings,
    })
}

/// Produce a structural report of the optimized graph without writing
/// anything. Works on models containing unsupported operators.
pub fn explain(config_path: &Path) -> Result<Explanation> {
    let config = Configuration::parse(config_path)?;
    let (mut graph, warnings) = loader::load(&config)?;
    optimizer::optimize(&mut graph)?;

    let report = explain::explain(&graph)?;
    Ok(Explanation {
        report,
        config_summary: explain::render_config(&config),
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Conv → Relu → Softmax, 1x1x4x4 input, identity 1x1 kernel.
    const MODEL: &str = r#"{
        "graph": {
            "node": [
                {"name": "conv0", "op_type": "Conv",
                 "input": ["data", "w"], "output": ["conv_out"],
                 "attribute": {"kernel_shape": [1, 1]}},
                {"name": "relu0", "op_type": "Relu",
                 "input": ["conv_out"], "output": ["relu_out"]},
                {"name": "softmax0", "op_type": "Softmax",
                 "input": ["relu_out"], "output": ["out"],
                 "attribute": {"axis": 1}}
            ],
            "initializer": [
                {"name": "w", "dims": [1, 1, 1, 1], "float_data": [1.0]}
            ],
            "input": [{"name": "data", "dims": [1, 1, 4, 4]}],
            "output": [{"name": "out"}]
        }
    }"#;

    fn write_setup(dir: &Path, model: &str, quantization: &str) -> PathBuf {
        let model_path = dir.join("model.json");
        fs::write(&model_path, model).unwrap();
        let config = format!(
            r#"
[input]
path = "{}"
format = "onnx"

{quantization}

[output]
path = "{}"

[target]
platform = "rk3588"
"#,
            model_path.display(),
            dir.join("model.rknn").display()
        );
        let config_path = dir.join("convert.toml");
        fs::write(&config_path, config).unwrap();
        config_path
    }

    #[test]
    fn test_convert_float_path() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_setup(dir.path(), MODEL, "");

        let outcome = convert(&config_path).unwrap();
        assert!(!outcome.quantized);
        // relu fused into conv
        assert_eq!(outcome.node_count, 2);
        let bytes = fs::read(&outcome.output).unwrap();
        assert_eq!(&bytes[0..4], b"RKNN");
        assert_eq!(bytes[10], 0);
    }

    #[test]
    fn test_convert_quantized_path() {
        let dir = tempfile::tempdir().unwrap();
        let quant = r#"
[quantization]
enabled = true
dtype = "int8"
calibration_samples = [
    [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0, 0.0, -1.0, -0.5, 0.5, 0.25, -0.25],
    [1.0, -1.0, 0.5, -0.5, 0.0, 0.0, 0.0, 0.0, 0.1, 0.1, 0.1, 0.1, 0.2, 0.2, 0.2, 0.2]
]
"#;
        let config_path = write_setup(dir.path(), MODEL, quant);

        let outcome = convert(&config_path).unwrap();
        assert!(outcome.quantized);
        let bytes = fs::read(&outcome.output).unwrap();
        assert_eq!(bytes[10], 1);
    }

    #[test]
    fn test_unsupported_op_fails_convert_but_not_explain() {
        let model = r#"{
            "graph": {
                "node": [{"name": "erf0", "op_type": "Erf",
                          "input": ["data"], "output": ["out"]}],
                "input": [{"name": "data", "dims": [1, 4]}],
                "output": [{"name": "out"}]
            }
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_setup(dir.path(), model, "");

        let err = convert(&config_path).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedOperator { node, .. } if node == "erf0"));
        assert!(!dir.path().join("model.rknn").exists());

        let explanation = explain(&config_path).unwrap();
        assert_eq!(explanation.report.unsupported_ops, vec!["Erf".to_string()]);
        assert!(explanation
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::UnsupportedOperator { .. })));
    }

    #[test]
    fn test_explain_reports_structure() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_setup(dir.path(), MODEL, "");

        let explanation = explain(&config_path).unwrap();
        assert_eq!(explanation.report.node_count(), 2);
        assert_eq!(explanation.report.total_params, 1);
        assert!(explanation.config_summary.contains("rk3588"));
    }

    #[test]
    fn test_missing_calibration_file_fails_before_loading() {
        let dir = tempfile::tempdir().unwrap();
        let quant = r#"
[quantization]
enabled = true
calibration_dataset = "/nonexistent/calib.npy"
"#;
        // deliberately malformed model file: it must never be read
        let config_path = write_setup(dir.path(), "not json", quant);

        let err = convert(&config_path).unwrap_err();
        assert!(matches!(err, ConvertError::Config { field, .. }
            if field == "quantization.calibration_dataset"));
    }
}
