//! Structural model report.
//!
//! A read-only traversal producing one row per node (operator, shapes,
//! dtypes, parameter count) plus aggregate totals and the distinct
//! unsupported operators. Works on any loadable graph, quantized or not,
//! and never needs calibration data.

use crate::config::Configuration;
use crate::errors::Result;
use crate::ir::{Graph, Tensor, TensorId};
use stanza::renderer::console::Console;
use stanza::renderer::Renderer;
use stanza::table::Table;

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub name: String,
    pub op: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Total elements of the constant tensors this node consumes.
    pub params: usize,
    pub unsupported: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub nodes: Vec<NodeReport>,
    pub total_params: usize,
    pub unsupported_ops: Vec<String>,
}

/// Summarize the graph in topological order.
pub fn explain(graph: &Graph) -> Result<Report> {
    let mut report = Report::default();
    for node_id in graph.topo_order()? {
        let node = graph.node(node_id);
        let params: usize = node
            .inputs
            .iter()
            .map(|&id| graph.tensor(id))
            .filter(|t| t.is_const())
            .map(Tensor::num_elements)
            .sum();

        report.total_params += params;
        if node.op.is_unsupported() {
            let op = node.op.name().to_string();
            if !report.unsupported_ops.contains(&op) {
                report.unsupported_ops.push(op);
            }
        }
        report.nodes.push(NodeReport {
            name: node.name.clone(),
            op: node.op.name().to_string(),
            inputs: describe_tensors(graph, &node.inputs),
            outputs: describe_tensors(graph, &node.outputs),
            params,
            unsupported: node.op.is_unsupported(),
        });
    }
    Ok(report)
}

fn describe_tensors(graph: &Graph, ids: &[TensorId]) -> Vec<String> {
    ids.iter()
        .map(|&id| {
            let t = graph.tensor(id);
            let dims = if t.shape.is_empty() {
                "?".to_string()
            } else {
                t.shape
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("x")
            };
            format!("{} [{dims} {}]", t.label(), t.elem)
        })
        .collect()
}

impl Report {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Render as console tables: node list, then a summary block.
    pub fn render(&self) -> String {
        let mut table = Table::default();
        table.push_row(["#", "node", "op", "inputs", "outputs", "params"]);
        for (i, node) in self.nodes.iter().enumerate() {
            let op = if node.unsupported {
                format!("{} (unsupported)", node.op)
            } else {
                node.op.clone()
            };
            table.push_row([
                i.to_string(),
                node.name.clone(),
                op,
                node.inputs.join(", "),
                node.outputs.join(", "),
                node.params.to_string(),
            ]);
        }

        let mut out = String::new();
        out.push_str(&Console::default().render(&table).to_string());
        out.push('\n');
        out.push_str(&format!(
            "nodes: {}   parameters: {}\n",
            self.node_count(),
            self.total_params
        ));
        if !self.unsupported_ops.is_empty() {
            out.push_str(&format!(
                "unsupported operators: {}\n",
                self.unsupported_ops.join(", ")
            ));
        }
        out
    }
}

/// Render the effective configuration as one table per section, so a run's
/// report always states what it was asked to do.
pub fn render_config(config: &Configuration) -> String {
    let value = match serde_json::to_value(config) {
        Ok(v) => v,
        Err(_) => return String::new(),
    };
    let Some(sections) = value.as_object() else {
        return String::new();
    };

    let mut out = String::new();
    for (section, fields) in sections {
        let Some(fields) = fields.as_object() else {
            continue;
        };
        let mut table = Table::default();
        table.push_row(["key", "value"]);
        for (key, field) in fields {
            let rendered = match field.as_str() {
                Some(s) => s.to_string(),
                None => field.to_string(),
            };
            table.push_row([key.clone(), rendered]);
        }
        out.push_str(&format!("[{section}]\n"));
        out.push_str(&Console::default().render(&table).to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, ElemType, OpKind};
    use std::collections::BTreeMap;

    fn graph_with_weights() -> Graph {
        let mut g = Graph::new();
        let x = g.add_tensor(Some("x".into()), vec![1, 4], ElemType::F32, None);
        let w = g.add_tensor(
            Some("w".into()),
            vec![2, 4],
            ElemType::F32,
            Some(Constant::F32(vec![0.0; 8])),
        );
        let y = g.add_tensor(Some("y".into()), vec![1, 2], ElemType::F32, None);
        let mut attrs = BTreeMap::new();
        attrs.insert("trans_b".to_string(), crate::ir::Attr::Int(1));
        g.add_node("fc", OpKind::MatMul, attrs, vec![x, w], vec![y]);
        g.inputs.push(x);
        g.outputs.push(y);
        g
    }

    #[test]
    fn test_param_count_sums_weights() {
        let report = explain(&graph_with_weights()).unwrap();
        assert_eq!(report.node_count(), 1);
        assert_eq!(report.total_params, 8);
        assert_eq!(report.nodes[0].params, 8);
        assert!(report.unsupported_ops.is_empty());
    }

    #[test]
    fn test_unsupported_ops_deduplicated() {
        let mut g = graph_with_weights();
        for i in 0..2 {
            let a = g.add_tensor(None, vec![1], ElemType::F32, None);
            let b = g.add_tensor(None, vec![1], ElemType::F32, None);
            g.add_node(
                format!("erf{i}"),
                OpKind::Unsupported("Erf".into()),
                BTreeMap::new(),
                vec![a],
                vec![b],
            );
        }
        let report = explain(&g).unwrap();
        assert_eq!(report.unsupported_ops, vec!["Erf".to_string()]);
        assert!(report.render().contains("unsupported operators: Erf"));
    }

    #[test]
    fn test_render_lists_shapes() {
        let report = explain(&graph_with_weights()).unwrap();
        let text = report.render();
        assert!(text.contains("MatMul"));
        assert!(text.contains("1x4 float32"));
        assert!(text.contains("parameters: 8"));
    }
}
