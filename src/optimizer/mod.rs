//! Graph-rewrite passes.
//!
//! `optimize` runs a fixed, ordered pass list: constant folding, operator
//! fusion, dead-node elimination. It is idempotent: running it on an
//! already-optimized graph changes nothing. Each pass must leave the graph
//! topologically sortable; a pass that introduces a cycle is a programming
//! bug, surfaced as [`ConvertError::Internal`] by the validation that runs
//! after every pass.

pub mod constant_folding;
pub mod dce;
pub mod fusion;

use crate::errors::Result;
use crate::ir::Graph;

pub use constant_folding::ConstantFolding;
pub use dce::DeadNodeElimination;
pub use fusion::OperatorFusion;

/// A single rewrite over the graph. `apply` reports whether it changed
/// anything so drivers can run passes to a fixpoint.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn apply(&self, graph: &mut Graph) -> Result<bool>;
}

/// Run the standard pass pipeline to completion.
pub fn optimize(graph: &mut Graph) -> Result<()> {
    let passes: [&dyn Pass; 3] = [
        &ConstantFolding,
        &OperatorFusion,
        &DeadNodeElimination,
    ];
    for pass in passes {
        // Bounded by node count: every effective application removes at
        // least one node, so the fixpoint terminates.
        let budget = graph.node_count() + 1;
        for _ in 0..budget {
            if !pass.apply(graph)? {
                break;
            }
            graph.validate()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attr, Constant, ElemType, OpKind};
    use std::collections::BTreeMap;

    /// Conv → Relu → Softmax with a constant-only Add feeding the conv bias.
    fn small_graph() -> Graph {
        let mut g = Graph::new();
        let x = g.add_tensor(Some("x".into()), vec![1, 1, 4, 4], ElemType::F32, None);
        let w = g.add_tensor(
            Some("w".into()),
            vec![1, 1, 1, 1],
            ElemType::F32,
            Some(Constant::F32(vec![2.0])),
        );
        let b0 = g.add_tensor(
            Some("b0".into()),
            vec![1],
            ElemType::F32,
            Some(Constant::F32(vec![0.25])),
        );
        let b1 = g.add_tensor(
            Some("b1".into()),
            vec![1],
            ElemType::F32,
            Some(Constant::F32(vec![0.75])),
        );
        let b = g.add_tensor(Some("b".into()), vec![1], ElemType::F32, None);
        let conv_out = g.add_tensor(Some("conv_out".into()), vec![1, 1, 4, 4], ElemType::F32, None);
        let relu_out = g.add_tensor(Some("relu_out".into()), vec![1, 1, 4, 4], ElemType::F32, None);
        let y = g.add_tensor(Some("y".into()), vec![1, 1, 4, 4], ElemType::F32, None);

        g.add_node("bias_sum", OpKind::Add, BTreeMap::new(), vec![b0, b1], vec![b]);
        g.add_node(
            "conv0",
            OpKind::Conv2D,
            BTreeMap::new(),
            vec![x, w, b],
            vec![conv_out],
        );
        g.add_node("relu0", OpKind::Relu, BTreeMap::new(), vec![conv_out], vec![relu_out]);
        g.add_node(
            "softmax0",
            OpKind::Softmax,
            BTreeMap::from([("axis".to_string(), Attr::Int(1))]),
            vec![relu_out],
            vec![y],
        );
        g.inputs.push(x);
        g.outputs.push(y);
        g
    }

    #[test]
    fn test_pipeline_folds_and_fuses() {
        let mut g = small_graph();
        optimize(&mut g).unwrap();
        // bias_sum folded away, relu fused into conv: conv + softmax remain.
        assert_eq!(g.node_count(), 2);
        let conv = g.nodes().find(|n| n.op == OpKind::Conv2D).unwrap();
        assert_eq!(conv.attr_str("activation"), Some("relu"));
        let b = g.find_tensor("b").unwrap();
        assert_eq!(
            g.tensor(b).data.as_ref().unwrap().as_f32().unwrap(),
            vec![1.0]
        );
        g.validate().unwrap();
    }

    #[test]
    fn test_optimize_preserves_computed_function() {
        // relu(conv(x)) + b must not collapse into relu(conv(x) + b): with
        // a negative pre-activation the two differ.
        let mut g = Graph::new();
        let x = g.add_tensor(Some("x".into()), vec![1, 1, 1, 1], ElemType::F32, None);
        let w = g.add_tensor(
            Some("w".into()),
            vec![1, 1, 1, 1],
            ElemType::F32,
            Some(Constant::F32(vec![1.0])),
        );
        let b = g.add_tensor(
            Some("b".into()),
            vec![1],
            ElemType::F32,
            Some(Constant::F32(vec![5.0])),
        );
        let conv_out = g.add_tensor(Some("conv_out".into()), vec![1, 1, 1, 1], ElemType::F32, None);
        let relu_out = g.add_tensor(Some("relu_out".into()), vec![1, 1, 1, 1], ElemType::F32, None);
        let y = g.add_tensor(Some("y".into()), vec![1, 1, 1, 1], ElemType::F32, None);
        g.add_node("conv0", OpKind::Conv2D, BTreeMap::new(), vec![x, w], vec![conv_out]);
        g.add_node("relu0", OpKind::Relu, BTreeMap::new(), vec![conv_out], vec![relu_out]);
        g.add_node("shift0", OpKind::Add, BTreeMap::new(), vec![relu_out, b], vec![y]);
        g.inputs.push(x);
        g.outputs.push(y);

        let mut feeds = std::collections::HashMap::new();
        feeds.insert(x, vec![-3.0]);
        let before = crate::ir::eval::run_graph(&g, &feeds).unwrap()[&y].clone();
        assert_eq!(before, vec![5.0]);

        optimize(&mut g).unwrap();
        let y = g.outputs[0];
        let after = crate::ir::eval::run_graph(&g, &feeds).unwrap()[&y].clone();
        assert_eq!(after, before);
        // The relu fused into the conv; the add stays behind it.
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let mut g = small_graph();
        optimize(&mut g).unwrap();
        let nodes = g.node_count();
        let tensors = g.tensor_count();
        optimize(&mut g).unwrap();
        assert_eq!(g.node_count(), nodes);
        assert_eq!(g.tensor_count(), tensors);
    }
}
