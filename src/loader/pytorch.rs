//! PyTorch format driver.
//!
//! Consumes the JSON form of a traced TorchScript graph: named inputs and
//! outputs, a parameter table, and `aten::` nodes. Torch is already NCHW so
//! no layout work is needed; `aten::linear` keeps its `[n, k]` weight and is
//! marked `trans_b` instead of being transposed.

use crate::errors::Result;
use crate::ir::{Attr, Constant, ElemType, Graph, OpKind, TensorId};
use crate::loader::{attrs_from_json, malformed};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ModuleJson {
    graph: TraceJson,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TraceJson {
    inputs: Vec<TraceValueJson>,
    outputs: Vec<String>,
    params: Vec<ParamJson>,
    nodes: Vec<TraceNodeJson>,
}

#[derive(Debug, Deserialize)]
struct TraceValueJson {
    name: String,
    #[serde(default)]
    shape: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct ParamJson {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TraceNodeJson {
    name: String,
    kind: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    attrs: BTreeMap<String, serde_json::Value>,
}

fn map_op(kind: &str) -> OpKind {
    match kind {
        "aten::_convolution" | "aten::conv2d" => OpKind::Conv2D,
        "aten::linear" | "aten::addmm" | "aten::matmul" => OpKind::MatMul,
        "aten::add" | "aten::add_" => OpKind::Add,
        "aten::mul" | "aten::mul_" => OpKind::Mul,
        "aten::relu" | "aten::relu_" => OpKind::Relu,
        "aten::sigmoid" => OpKind::Sigmoid,
        "aten::batch_norm" => OpKind::BatchNorm,
        "aten::max_pool2d" => OpKind::MaxPool2D,
        "aten::avg_pool2d" => OpKind::AvgPool2D,
        "aten::reshape" | "aten::view" => OpKind::Reshape,
        "aten::flatten" => OpKind::Flatten,
        "aten::softmax" => OpKind::Softmax,
        "aten::cat" => OpKind::Concat,
        other => OpKind::Unsupported(other.to_string()),
    }
}

/// Rename torch attribute keys to the IR conventions.
fn normalize_attrs(kind: &str, mut attrs: BTreeMap<String, Attr>) -> BTreeMap<String, Attr> {
    for (torch, ours) in [
        ("stride", "strides"),
        ("padding", "pads"),
        ("kernel_size", "kernel"),
        ("dim", "axis"),
        ("start_dim", "axis"),
        ("eps", "epsilon"),
    ] {
        if let Some(v) = attrs.remove(torch) {
            attrs.entry(ours.to_string()).or_insert(v);
        }
    }
    attrs.remove("dilation");
    attrs.remove("groups");
    attrs.remove("ceil_mode");
    if matches!(kind, "aten::linear" | "aten::addmm") {
        attrs.insert("trans_b".to_string(), Attr::Int(1));
    }
    attrs
}

/// Parse a traced-module JSON dump into the IR.
pub fn parse(content: &str, path: &Path) -> Result<Graph> {
    let module: ModuleJson = serde_json::from_str(content)
        .map_err(|e| malformed(path, format!("invalid trace JSON: {e}")))?;
    let trace = &module.graph;

    let mut graph = Graph::new();
    let mut by_name: HashMap<String, TensorId> = HashMap::new();

    for param in &trace.params {
        let expected: usize = param.shape.iter().product();
        if param.data.len() != expected {
            return Err(malformed(
                path,
                format!(
                    "parameter '{}' has {} values but shape {:?}",
                    param.name,
                    param.data.len(),
                    param.shape
                ),
            ));
        }
        let id = graph.add_tensor(
            Some(param.name.clone()),
            param.shape.clone(),
            ElemType::F32,
            Some(Constant::F32(param.data.clone())),
        );
        by_name.insert(param.name.clone(), id);
    }

    for input in &trace.inputs {
        let id = graph.add_tensor(
            Some(input.name.clone()),
            input.shape.clone(),
            ElemType::F32,
            None,
        );
        by_name.insert(input.name.clone(), id);
        graph.inputs.push(id);
    }

    for (idx, node) in trace.nodes.iter().enumerate() {
        let op = map_op(&node.kind);
        let attrs = normalize_attrs(&node.kind, attrs_from_json(&node.attrs));

        let mut inputs = Vec::with_capacity(node.inputs.len());
        for name in &node.inputs {
            let id = *by_name.entry(name.clone()).or_insert_with(|| {
                graph.add_tensor(Some(name.clone()), vec![], ElemType::F32, None)
            });
            inputs.push(id);
        }
        // Traced aten ops are single-output; extra outputs would never
        // receive values during calibration simulation.
        if node.outputs.len() > 1 && !matches!(op, OpKind::Unsupported(_)) {
            return Err(malformed(
                path,
                format!("node '{}' declares {} outputs", node.name, node.outputs.len()),
            ));
        }
        let mut outputs = Vec::with_capacity(node.outputs.len());
        for name in &node.outputs {
            let id = *by_name.entry(name.clone()).or_insert_with(|| {
                graph.add_tensor(Some(name.clone()), vec![], ElemType::F32, None)
            });
            outputs.push(id);
        }

        let name = if node.name.is_empty() {
            format!("{}_{idx}", node.kind.trim_start_matches("aten::"))
        } else {
            node.name.clone()
        };
        graph.add_node(name, op, attrs, inputs, outputs);
    }

    for name in &trace.outputs {
        let id = by_name.get(name).ok_or_else(|| {
            malformed(path, format!("declared output '{name}' never appears"))
        })?;
        graph.outputs.push(*id);
    }

    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR_RELU: &str = r#"{
        "graph": {
            "inputs": [{"name": "x", "shape": [1, 4]}],
            "outputs": ["y"],
            "params": [
                {"name": "fc.weight", "shape": [2, 4],
                 "data": [1, 0, 0, 0, 0, 1, 0, 0]},
                {"name": "fc.bias", "shape": [2], "data": [0.5, -0.5]}
            ],
            "nodes": [
                {"name": "fc", "kind": "aten::linear",
                 "inputs": ["x", "fc.weight", "fc.bias"], "outputs": ["h"]},
                {"name": "act", "kind": "aten::relu",
                 "inputs": ["h"], "outputs": ["y"]}
            ]
        }
    }"#;

    #[test]
    fn test_parse_linear_relu() {
        let graph = parse(LINEAR_RELU, Path::new("m.json")).unwrap();
        assert_eq!(graph.node_count(), 2);

        let fc = graph.nodes().find(|n| n.name == "fc").unwrap();
        assert_eq!(fc.op, OpKind::MatMul);
        assert_eq!(fc.attr_i64("trans_b"), Some(1));

        let w = graph.find_tensor("fc.weight").unwrap();
        assert_eq!(graph.tensor(w).shape, vec![2, 4]);
    }

    #[test]
    fn test_conv_attrs_renamed() {
        let json = r#"{
            "graph": {
                "inputs": [{"name": "x", "shape": [1, 1, 8, 8]}],
                "outputs": ["y"],
                "params": [
                    {"name": "c.weight", "shape": [1, 1, 3, 3],
                     "data": [0, 0, 0, 0, 1, 0, 0, 0, 0]}
                ],
                "nodes": [
                    {"name": "c", "kind": "aten::conv2d",
                     "inputs": ["x", "c.weight"], "outputs": ["y"],
                     "attrs": {"stride": [2, 2], "padding": [1, 1],
                               "dilation": [1, 1], "groups": 1}}
                ]
            }
        }"#;
        let graph = parse(json, Path::new("m.json")).unwrap();
        let conv = graph.nodes().next().unwrap();
        assert_eq!(conv.attr_ints("strides"), Some(&[2, 2][..]));
        assert_eq!(conv.attr_ints("pads"), Some(&[1, 1][..]));
        assert!(conv.attrs.get("dilation").is_none());
    }

    #[test]
    fn test_unknown_kind_becomes_sentinel() {
        let json = r#"{
            "graph": {
                "inputs": [{"name": "x", "shape": [1, 4]}],
                "outputs": ["y"],
                "nodes": [
                    {"name": "g", "kind": "aten::gelu",
                     "inputs": ["x"], "outputs": ["y"]}
                ]
            }
        }"#;
        let graph = parse(json, Path::new("m.json")).unwrap();
        assert!(graph.has_unsupported());
        assert_eq!(graph.first_unsupported().unwrap().op.name(), "aten::gelu");
    }
}
