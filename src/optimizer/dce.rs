//! Dead-node elimination.
//!
//! Walks backwards from the declared graph outputs; any node that no output
//! transitively depends on is removed, along with tensors nothing references
//! afterwards (folded-away weights, detached intermediates).

use crate::errors::Result;
use crate::ir::{Graph, NodeId, TensorId};
use crate::optimizer::Pass;
use std::collections::HashSet;

pub struct DeadNodeElimination;

impl Pass for DeadNodeElimination {
    fn name(&self) -> &'static str {
        "dead-node-elimination"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let producers = graph.producers();

        let mut live_tensors: HashSet<TensorId> = graph.outputs.iter().copied().collect();
        let mut live_nodes: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<TensorId> = graph.outputs.clone();
        while let Some(t) = stack.pop() {
            let Some(&producer) = producers.get(&t) else {
                continue;
            };
            if !live_nodes.insert(producer) {
                continue;
            }
            for &inp in &graph.node(producer).inputs {
                if live_tensors.insert(inp) {
                    stack.push(inp);
                }
            }
        }

        let dead_nodes: Vec<NodeId> = graph
            .nodes()
            .filter(|n| !live_nodes.contains(&n.id))
            .map(|n| n.id)
            .collect();
        for id in &dead_nodes {
            graph.remove_node(*id);
        }

        let mut referenced: HashSet<TensorId> =
            graph.inputs.iter().chain(&graph.outputs).copied().collect();
        for node in graph.nodes() {
            referenced.extend(node.inputs.iter().chain(&node.outputs).copied());
        }
        let dead_tensors: Vec<TensorId> = graph
            .tensors()
            .filter(|t| !referenced.contains(&t.id))
            .map(|t| t.id)
            .collect();
        for id in &dead_tensors {
            graph.remove_tensor(*id);
        }

        Ok(!dead_nodes.is_empty() || !dead_tensors.is_empty())
    }
}
