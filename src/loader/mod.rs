//! Source-format graph loading.
//!
//! Each format driver translates the already-parsed JSON dump of its native
//! container into the shared IR (byte-level container codecs are out of
//! scope). The set of formats is closed: adding one means adding a
//! [`ModelFormat`] variant and a dispatch arm here, never subclassing.
//!
//! Drivers agree on the operator-name mapping into the shared vocabulary.
//! A native operator with no mapping becomes an [`OpKind::Unsupported`]
//! sentinel node instead of failing the load, so `explain` keeps working on
//! partially-supported models; `convert` fails later, at the encoder gate.

pub mod onnx;
pub mod pytorch;
pub mod tensorflow;

use crate::config::{Configuration, ModelFormat};
use crate::errors::{ConvertError, Result, Warning};
use crate::ir::{shape_inference, Attr, Graph, OpKind};
use std::collections::BTreeMap;
use std::path::Path;

/// Load the configured model into the IR: parse, bind configured input
/// shapes, run forward shape inference, validate.
pub fn load(config: &Configuration) -> Result<(Graph, Vec<Warning>)> {
    let path = &config.input.path;
    let content = std::fs::read_to_string(path).map_err(|e| ConvertError::Load {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    let mut graph = match config.input.format {
        ModelFormat::Onnx => onnx::parse(&content, path)?,
        ModelFormat::TensorFlow => tensorflow::parse(&content, path)?,
        ModelFormat::PyTorch => pytorch::parse(&content, path)?,
    };

    let mut warnings: Vec<Warning> = graph
        .nodes()
        .filter_map(|n| match &n.op {
            OpKind::Unsupported(op) => Some(Warning::UnsupportedOperator {
                node: n.name.clone(),
                op: op.clone(),
            }),
            _ => None,
        })
        .collect();

    bind_input_shapes(&mut graph, config)?;
    warnings.extend(shape_inference::infer(&mut graph)?);
    graph.validate()?;
    Ok((graph, warnings))
}

/// Overlay `input.shapes` from the configuration onto the graph boundary.
/// Every graph input must end up with a concrete shape.
fn bind_input_shapes(graph: &mut Graph, config: &Configuration) -> Result<()> {
    for &id in &graph.inputs.clone() {
        let label = graph.tensor(id).label();
        if let Some(shape) = config.input.shapes.get(&label) {
            graph.tensor_mut(id).shape = shape.clone();
        }
        if graph.tensor(id).shape.is_empty() {
            return Err(ConvertError::ShapeInference {
                tensor: label,
                reason: "graph input has no shape in the model or in input.shapes".into(),
            });
        }
    }
    Ok(())
}

/// Convert a JSON attribute value into an IR attribute. Returns `None` for
/// value kinds no driver produces (objects, nested arrays, null).
pub(crate) fn attr_from_json(value: &serde_json::Value) -> Option<Attr> {
    use serde_json::Value;
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Attr::Int(i))
            } else {
                n.as_f64().map(|f| Attr::Float(f as f32))
            }
        }
        Value::String(s) => Some(Attr::Str(s.clone())),
        Value::Bool(b) => Some(Attr::Int(*b as i64)),
        Value::Array(items) => {
            if items.iter().all(|v| v.as_i64().is_some()) {
                Some(Attr::Ints(
                    items.iter().filter_map(|v| v.as_i64()).collect(),
                ))
            } else if items.iter().all(|v| v.as_f64().is_some()) {
                Some(Attr::Floats(
                    items.iter().filter_map(|v| v.as_f64()).map(|f| f as f32).collect(),
                ))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Convert a whole JSON attribute map, silently dropping unconvertible
/// entries (they only ever occur on unsupported operators).
pub(crate) fn attrs_from_json(
    raw: &BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, Attr> {
    raw.iter()
        .filter_map(|(k, v)| attr_from_json(v).map(|a| (k.clone(), a)))
        .collect()
}

pub(crate) fn malformed(path: &Path, reason: impl Into<String>) -> ConvertError {
    ConvertError::Load {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
