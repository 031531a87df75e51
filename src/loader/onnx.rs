//! ONNX format driver.
//!
//! Consumes the JSON form of a `ModelProto` (graph / node / initializer /
//! input / output). Attribute names are normalized to the IR conventions:
//! `kernel_shape` → `kernel`, 4-entry `pads` collapse to the symmetric
//! `[top, left]` pair, `Gemm`'s `transB` becomes `trans_b`.

use crate::errors::Result;
use crate::ir::{Attr, Constant, ElemType, Graph, OpKind, TensorId};
use crate::loader::{attrs_from_json, malformed};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ModelJson {
    graph: GraphJson,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GraphJson {
    node: Vec<NodeJson>,
    initializer: Vec<InitializerJson>,
    input: Vec<ValueInfoJson>,
    output: Vec<ValueInfoJson>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeJson {
    name: String,
    op_type: String,
    input: Vec<String>,
    output: Vec<String>,
    attribute: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct InitializerJson {
    name: String,
    dims: Vec<usize>,
    float_data: Vec<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ValueInfoJson {
    name: String,
    dims: Vec<usize>,
}

fn map_op(op_type: &str) -> OpKind {
    match op_type {
        "Conv" => OpKind::Conv2D,
        "Gemm" | "MatMul" => OpKind::MatMul,
        "Add" => OpKind::Add,
        "Mul" => OpKind::Mul,
        "Relu" => OpKind::Relu,
        "Sigmoid" => OpKind::Sigmoid,
        "BatchNormalization" => OpKind::BatchNorm,
        "MaxPool" => OpKind::MaxPool2D,
        "AveragePool" => OpKind::AvgPool2D,
        "Reshape" => OpKind::Reshape,
        "Flatten" => OpKind::Flatten,
        "Softmax" => OpKind::Softmax,
        "Concat" => OpKind::Concat,
        other => OpKind::Unsupported(other.to_string()),
    }
}

fn normalize_attrs(op: &OpKind, mut attrs: BTreeMap<String, Attr>) -> BTreeMap<String, Attr> {
    if let Some(kernel) = attrs.remove("kernel_shape") {
        attrs.insert("kernel".into(), kernel);
    }
    if let Some(Attr::Ints(pads)) = attrs.get("pads") {
        // ONNX pads are [top, left, bottom, right]; the IR keeps the
        // symmetric [top, left] pair.
        if pads.len() == 4 {
            let symmetric = vec![pads[0], pads[1]];
            attrs.insert("pads".into(), Attr::Ints(symmetric));
        }
    }
    if matches!(op, OpKind::MatMul) {
        if let Some(t) = attrs.remove("transB") {
            attrs.insert("trans_b".into(), t);
        }
        attrs.remove("transA");
        attrs.remove("alpha");
        attrs.remove("beta");
    }
    attrs
}

/// Parse an ONNX model-proto JSON dump into the IR.
pub fn parse(content: &str, path: &Path) -> Result<Graph> {
    let model: ModelJson = serde_json::from_str(content)
        .map_err(|e| malformed(path, format!("invalid ONNX JSON: {e}")))?;

    let mut graph = Graph::new();
    let mut by_name: HashMap<String, TensorId> = HashMap::new();

    for init in &model.graph.initializer {
        let expected: usize = init.dims.iter().product();
        if init.float_data.len() != expected {
            return Err(malformed(
                path,
                format!(
                    "initializer '{}' has {} values but dims {:?}",
                    init.name,
                    init.float_data.len(),
                    init.dims
                ),
            ));
        }
        let id = graph.add_tensor(
            Some(init.name.clone()),
            init.dims.clone(),
            ElemType::F32,
            Some(Constant::F32(init.float_data.clone())),
        );
        by_name.insert(init.name.clone(), id);
    }

    for input in &model.graph.input {
        // ONNX-1 lists weights under graph.input as well; only
        // non-initializer entries are real graph inputs.
        if by_name.contains_key(&input.name) {
            continue;
        }
        let id = graph.add_tensor(
            Some(input.name.clone()),
            input.dims.clone(),
            ElemType::F32,
            None,
        );
        by_name.insert(input.name.clone(), id);
        graph.inputs.push(id);
    }

    for (idx, node) in model.graph.node.iter().enumerate() {
        let op = map_op(&node.op_type);
        let mut attrs = normalize_attrs(&op, attrs_from_json(&node.attribute));

        // Reshape carries its target as a second constant input; the IR
        // wants it as a `shape` attribute.
        let mut node_inputs: &[String] = &node.input;
        if op == OpKind::Reshape && node.input.len() == 2 {
            let shape_init = model
                .graph
                .initializer
                .iter()
                .find(|i| i.name == node.input[1]);
            if let Some(init) = shape_init {
                let dims: Vec<i64> = init.float_data.iter().map(|&d| d as i64).collect();
                attrs.insert("shape".into(), Attr::Ints(dims));
                node_inputs = &node.input[..1];
            }
        }

        let mut inputs = Vec::with_capacity(node_inputs.len());
        for name in node_inputs {
            let id = *by_name.entry(name.clone()).or_insert_with(|| {
                graph.add_tensor(Some(name.clone()), vec![], ElemType::F32, None)
            });
            inputs.push(id);
        }
        // BatchNormalization may declare its optional training outputs
        // (running mean/var); only the first output carries inference data.
        let node_outputs: &[String] = if op == OpKind::BatchNorm && node.output.len() > 1 {
            &node.output[..1]
        } else {
            &node.output
        };
        if node_outputs.len() > 1 && !matches!(op, OpKind::Unsupported(_)) {
            return Err(malformed(
                path,
                format!("node '{}' declares {} outputs", node.name, node_outputs.len()),
            ));
        }
        let mut outputs = Vec::with_capacity(node_outputs.len());
        for name in node_outputs {
            let id = *by_name.entry(name.clone()).or_insert_with(|| {
                graph.add_tensor(Some(name.clone()), vec![], ElemType::F32, None)
            });
            outputs.push(id);
        }

        let name = if node.name.is_empty() {
            format!("{}_{idx}", node.op_type)
        } else {
            node.name.clone()
        };
        graph.add_node(name, op, attrs, inputs, outputs);
    }

    for output in &model.graph.output {
        let id = by_name.get(&output.name).ok_or_else(|| {
            malformed(path, format!("declared output '{}' never appears", output.name))
        })?;
        graph.outputs.push(*id);
    }

    Ok(graph)
}
