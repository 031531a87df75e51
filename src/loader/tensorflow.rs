//! TensorFlow format driver.
//!
//! Consumes the JSON form of a frozen `GraphDef` plus an explicit output-name
//! list. TensorFlow graphs are NHWC; everything is normalized to the NCHW
//! convention the rest of the pipeline assumes: placeholder shapes are
//! permuted, rank-4 `Const` filters go HWIO → OIHW, and the NHWC `strides` /
//! `ksize` 4-vectors collapse to their spatial pair.

use crate::errors::Result;
use crate::ir::{Attr, Constant, ElemType, Graph, OpKind, TensorId};
use crate::loader::{attr_from_json, malformed};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct GraphDefJson {
    node: Vec<NodeDefJson>,
    output: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeDefJson {
    name: String,
    op: String,
    input: Vec<String>,
    attr: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ConstValueJson {
    dims: Vec<usize>,
    float_val: Vec<f32>,
}

fn map_op(op: &str) -> OpKind {
    match op {
        "Conv2D" => OpKind::Conv2D,
        "MatMul" => OpKind::MatMul,
        "Add" | "AddV2" | "BiasAdd" => OpKind::Add,
        "Mul" => OpKind::Mul,
        "Relu" => OpKind::Relu,
        "Sigmoid" => OpKind::Sigmoid,
        "FusedBatchNorm" | "FusedBatchNormV3" => OpKind::BatchNorm,
        "MaxPool" => OpKind::MaxPool2D,
        "AvgPool" => OpKind::AvgPool2D,
        "Reshape" => OpKind::Reshape,
        "Softmax" => OpKind::Softmax,
        "ConcatV2" | "Concat" => OpKind::Concat,
        other => OpKind::Unsupported(other.to_string()),
    }
}

/// NHWC 4-vectors like `strides = [1, sh, sw, 1]` carry their payload in the
/// middle; everything else passes through `attr_from_json`.
fn normalize_attrs(
    node: &NodeDefJson,
    kernel_hw: Option<[i64; 2]>,
) -> BTreeMap<String, Attr> {
    let mut attrs = BTreeMap::new();
    for (key, value) in &node.attr {
        match key.as_str() {
            "strides" | "ksize" => {
                if let Some(Attr::Ints(v)) = attr_from_json(value) {
                    if v.len() == 4 {
                        let name = if key == "ksize" { "kernel" } else { "strides" };
                        attrs.insert(name.to_string(), Attr::Ints(vec![v[1], v[2]]));
                    }
                }
            }
            "padding" => {
                if let Some(pad) = value.as_str() {
                    let pads = match (pad, kernel_hw) {
                        ("SAME", Some([kh, kw])) => vec![(kh - 1) / 2, (kw - 1) / 2],
                        _ => vec![0, 0],
                    };
                    attrs.insert("pads".to_string(), Attr::Ints(pads));
                }
            }
            "data_format" | "T" | "dtype" => {}
            "epsilon" => {
                if let Some(a) = attr_from_json(value) {
                    attrs.insert("epsilon".to_string(), a);
                }
            }
            other => {
                if let Some(a) = attr_from_json(value) {
                    attrs.insert(other.to_string(), a);
                }
            }
        }
    }
    attrs
}

/// Kernel spatial dims, needed before attrs are normalized so SAME padding
/// can be resolved: pools carry `ksize`, convs take it from the filter shape.
fn kernel_hw(node: &NodeDefJson, filter_dims: Option<&[usize]>) -> Option<[i64; 2]> {
    if let Some(v) = node.attr.get("ksize").and_then(attr_from_json) {
        if let Attr::Ints(v) = v {
            if v.len() == 4 {
                return Some([v[1], v[2]]);
            }
        }
    }
    filter_dims
        .filter(|d| d.len() == 4)
        .map(|d| [d[0] as i64, d[1] as i64])
}

fn transpose_hwio_to_oihw(dims: &[usize], data: &[f32]) -> (Vec<usize>, Vec<f32>) {
    let (kh, kw, ci, co) = (dims[0], dims[1], dims[2], dims[3]);
    let mut out = vec![0.0; data.len()];
    for h in 0..kh {
        for w in 0..kw {
            for i in 0..ci {
                for o in 0..co {
                    let src = ((h * kw + w) * ci + i) * co + o;
                    let dst = ((o * ci + i) * kh + h) * kw + w;
                    out[dst] = data[src];
                }
            }
        }
    }
    (vec![co, ci, kh, kw], out)
}

fn nhwc_to_nchw(shape: &[usize]) -> Vec<usize> {
    match shape {
        &[n, h, w, c] => vec![n, c, h, w],
        other => other.to_vec(),
    }
}

/// Node input refs are `name`, `name:N` (output slot), or `^name` (control
/// edge). Slots beyond 0 never occur in the dumps we accept.
fn strip_ref(input: &str) -> Option<&str> {
    if input.starts_with('^') {
        return None;
    }
    Some(input.split(':').next().unwrap_or(input))
}

/// Parse a frozen-GraphDef JSON dump into the IR.
pub fn parse(content: &str, path: &Path) -> Result<Graph> {
    let def: GraphDefJson = serde_json::from_str(content)
        .map_err(|e| malformed(path, format!("invalid GraphDef JSON: {e}")))?;

    let mut graph = Graph::new();
    let mut by_name: HashMap<String, TensorId> = HashMap::new();

    // Const dims indexed up front so conv SAME padding can see its filter.
    let mut const_dims: HashMap<&str, Vec<usize>> = HashMap::new();
    for node in &def.node {
        if node.op == "Const" {
            if let Some(raw) = node.attr.get("value") {
                if let Ok(v) = serde_json::from_value::<ConstValueJson>(raw.clone()) {
                    const_dims.insert(node.name.as_str(), v.dims);
                }
            }
        }
    }

    for node in &def.node {
        match node.op.as_str() {
            "Const" => {
                let raw = node.attr.get("value").ok_or_else(|| {
                    malformed(path, format!("Const '{}' has no value", node.name))
                })?;
                let value: ConstValueJson = serde_json::from_value(raw.clone())
                    .map_err(|e| {
                        malformed(path, format!("Const '{}': {e}", node.name))
                    })?;
                let expected: usize = value.dims.iter().product();
                if value.float_val.len() != expected {
                    return Err(malformed(
                        path,
                        format!(
                            "Const '{}' has {} values but dims {:?}",
                            node.name,
                            value.float_val.len(),
                            value.dims
                        ),
                    ));
                }
                // Rank-4 consts are conv filters in HWIO layout.
                let (dims, data) = if value.dims.len() == 4 {
                    transpose_hwio_to_oihw(&value.dims, &value.float_val)
                } else {
                    (value.dims, value.float_val)
                };
                let id = graph.add_tensor(
                    Some(node.name.clone()),
                    dims,
                    ElemType::F32,
                    Some(Constant::F32(data)),
                );
                by_name.insert(node.name.clone(), id);
            }
            "Placeholder" | "PlaceholderV2" => {
                // A negative dim means dynamic; leave the whole shape empty
                // so the config's input.shapes has to supply it.
                let shape: Vec<usize> = node
                    .attr
                    .get("shape")
                    .and_then(attr_from_json)
                    .and_then(|a| match a {
                        Attr::Ints(v) if !v.is_empty() && v.iter().all(|&d| d > 0) => {
                            Some(v.iter().map(|&d| d as usize).collect())
                        }
                        _ => None,
                    })
                    .unwrap_or_default();
                let id = graph.add_tensor(
                    Some(node.name.clone()),
                    nhwc_to_nchw(&shape),
                    ElemType::F32,
                    None,
                );
                by_name.insert(node.name.clone(), id);
                graph.inputs.push(id);
            }
            _ => {
                let filter = node
                    .input
                    .get(1)
                    .and_then(|i| strip_ref(i))
                    .and_then(|n| const_dims.get(n))
                    .map(|d| d.as_slice());
                let khw = kernel_hw(node, filter);
                let mut attrs = normalize_attrs(node, khw);

                let mut inputs = Vec::new();
                for raw in &node.input {
                    let Some(name) = strip_ref(raw) else { continue };
                    // ConcatV2 carries the axis as a trailing scalar const.
                    if node.op.starts_with("Concat") && raw == node.input.last().unwrap() {
                        if let Some(dims) = const_dims.get(name) {
                            if dims.is_empty() || dims == &vec![1] {
                                continue;
                            }
                        }
                    }
                    let id = *by_name.entry(name.to_string()).or_insert_with(|| {
                        graph.add_tensor(Some(name.to_string()), vec![], ElemType::F32, None)
                    });
                    inputs.push(id);
                }
                if node.op.starts_with("Concat") {
                    if let Some(axis) = concat_axis(&def, node) {
                        // NHWC channel axis 3 is NCHW axis 1.
                        let axis = if axis == 3 { 1 } else { axis };
                        attrs.insert("axis".to_string(), Attr::Int(axis));
                    }
                }

                let out = graph.add_tensor(
                    Some(node.name.clone()),
                    vec![],
                    ElemType::F32,
                    None,
                );
                by_name.insert(node.name.clone(), out);
                graph.add_node(node.name.clone(), map_op(&node.op), attrs, inputs, vec![out]);
            }
        }
    }

    for name in &def.output {
        let id = by_name.get(name).ok_or_else(|| {
            malformed(path, format!("declared output '{name}' never appears"))
        })?;
        graph.outputs.push(*id);
    }

    Ok(graph)
}

fn concat_axis(def: &GraphDefJson, node: &NodeDefJson) -> Option<i64> {
    let axis_ref = strip_ref(node.input.last()?)?;
    let axis_node = def.node.iter().find(|n| n.name == axis_ref && n.op == "Const")?;
    let value: ConstValueJson =
        serde_json::from_value(axis_node.attr.get("value")?.clone()).ok()?;
    value.float_val.first().map(|&a| a as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONV_BIAS: &str = r#"{
        "node": [
            {"name": "x", "op": "Placeholder",
             "attr": {"shape": [1, 8, 8, 3]}},
            {"name": "w", "op": "Const",
             "attr": {"value": {"dims": [1, 1, 3, 2],
                                "float_val": [1, 2, 3, 4, 5, 6]}}},
            {"name": "b", "op": "Const",
             "attr": {"value": {"dims": [2], "float_val": [0.1, 0.2]}}},
            {"name": "conv", "op": "Conv2D", "input": ["x", "w"],
             "attr": {"strides": [1, 1, 1, 1], "padding": "SAME",
                      "data_format": "NHWC"}},
            {"name": "bias", "op": "BiasAdd", "input": ["conv", "b"]}
        ],
        "output": ["bias"]
    }"#;

    #[test]
    fn test_parse_conv_biasadd() {
        let graph = parse(CONV_BIAS, Path::new("m.json")).unwrap();
        assert_eq!(graph.node_count(), 2);

        let x = graph.inputs[0];
        assert_eq!(graph.tensor(x).shape, vec![1, 3, 8, 8]);

        let conv = graph.nodes().find(|n| n.name == "conv").unwrap();
        assert_eq!(conv.op, OpKind::Conv2D);
        assert_eq!(conv.attr_ints("strides"), Some(&[1, 1][..]));
        assert_eq!(conv.attr_ints("pads"), Some(&[0, 0][..]));

        let bias = graph.nodes().find(|n| n.name == "bias").unwrap();
        assert_eq!(bias.op, OpKind::Add);
    }

    #[test]
    fn test_filter_transposed_to_oihw() {
        let graph = parse(CONV_BIAS, Path::new("m.json")).unwrap();
        let w = graph.find_tensor("w").unwrap();
        let t = graph.tensor(w);
        // HWIO [1,1,3,2] becomes OIHW [2,3,1,1] with columns regrouped.
        assert_eq!(t.shape, vec![2, 3, 1, 1]);
        assert_eq!(
            t.data.as_ref().unwrap().as_f32().unwrap(),
            vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]
        );
    }

    #[test]
    fn test_same_padding_uses_kernel() {
        let json = r#"{
            "node": [
                {"name": "x", "op": "Placeholder",
                 "attr": {"shape": [1, 8, 8, 1]}},
                {"name": "w", "op": "Const",
                 "attr": {"value": {"dims": [3, 3, 1, 1],
                                    "float_val": [0,0,0,0,1,0,0,0,0]}}},
                {"name": "conv", "op": "Conv2D", "input": ["x", "w"],
                 "attr": {"strides": [1, 1, 1, 1], "padding": "SAME"}}
            ],
            "output": ["conv"]
        }"#;
        let graph = parse(json, Path::new("m.json")).unwrap();
        let conv = graph.nodes().next().unwrap();
        assert_eq!(conv.attr_ints("pads"), Some(&[1, 1][..]));
    }

    #[test]
    fn test_dynamic_placeholder_shape_left_unbound() {
        let json = r#"{
            "node": [
                {"name": "x", "op": "Placeholder",
                 "attr": {"shape": [-1, 8, 8, 3]}},
                {"name": "act", "op": "Relu", "input": ["x"]}
            ],
            "output": ["act"]
        }"#;
        let graph = parse(json, Path::new("m.json")).unwrap();
        assert!(graph.tensor(graph.inputs[0]).shape.is_empty());
    }

    #[test]
    fn test_unknown_op_becomes_sentinel() {
        let json = r#"{
            "node": [
                {"name": "x", "op": "Placeholder", "attr": {"shape": [1, 4]}},
                {"name": "y", "op": "Rsqrt", "input": ["x"]}
            ],
            "output": ["y"]
        }"#;
        let graph = parse(json, Path::new("m.json")).unwrap();
        assert!(graph.has_unsupported());
    }
}
