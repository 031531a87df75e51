//! Constant folding.
//!
//! A node whose inputs are all float constants is evaluated immediately; its
//! output tensor becomes a constant and the node disappears. Walking in
//! topological order lets a fold enable the next one within a single
//! application, so a whole constant subgraph collapses in one sweep.

use crate::errors::Result;
use crate::ir::{eval, Constant, Graph, OpKind};
use crate::optimizer::Pass;

pub struct ConstantFolding;

impl Pass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant-folding"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for id in graph.topo_order()? {
            let node = graph.node(id);
            if node.op.is_unsupported() || node.op == OpKind::Requantize {
                continue;
            }
            if node.outputs.len() != 1 || node.inputs.is_empty() {
                continue;
            }
            let out = node.outputs[0];
            let out_shape = graph.tensor(out).shape.clone();
            if out_shape.is_empty() || graph.tensor(out).is_const() {
                continue;
            }
            let mut operands = Vec::with_capacity(node.inputs.len());
            for &inp in &node.inputs {
                let t = graph.tensor(inp);
                match t.data.as_ref().and_then(Constant::as_f32) {
                    Some(data) => operands.push((t.shape.clone(), data.to_vec())),
                    None => {
                        operands.clear();
                        break;
                    }
                }
            }
            if operands.len() != node.inputs.len() {
                continue;
            }

            let borrowed: Vec<(&[usize], &[f32])> = operands
                .iter()
                .map(|(s, d)| (s.as_slice(), d.as_slice()))
                .collect();
            let folded = eval::eval_node(graph.node(id), &borrowed, &out_shape)?;
            graph.tensor_mut(out).data = Some(Constant::F32(folded));
            graph.remove_node(id);
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attr, ElemType};
    use std::collections::BTreeMap;

    #[test]
    fn test_chain_folds_in_one_sweep() {
        let mut g = Graph::new();
        let a = g.add_tensor(
            Some("a".into()),
            vec![2],
            ElemType::F32,
            Some(Constant::F32(vec![1.0, 2.0])),
        );
        let b = g.add_tensor(
            Some("b".into()),
            vec![2],
            ElemType::F32,
            Some(Constant::F32(vec![3.0, 4.0])),
        );
        let sum = g.add_tensor(Some("sum".into()), vec![2], ElemType::F32, None);
        let doubled = g.add_tensor(Some("doubled".into()), vec![2], ElemType::F32, None);
        g.add_node("add0", OpKind::Add, BTreeMap::new(), vec![a, b], vec![sum]);
        g.add_node("mul0", OpKind::Mul, BTreeMap::new(), vec![sum, a], vec![doubled]);
        g.outputs.push(doubled);

        let changed = ConstantFolding.apply(&mut g).unwrap();
        assert!(changed);
        assert_eq!(g.node_count(), 0);
        assert_eq!(
            g.tensor(doubled).data.as_ref().unwrap().as_f32().unwrap(),
            vec![4.0, 12.0]
        );
        assert!(!ConstantFolding.apply(&mut g).unwrap());
    }

    #[test]
    fn test_non_constant_input_blocks_fold() {
        let mut g = Graph::new();
        let x = g.add_tensor(Some("x".into()), vec![2], ElemType::F32, None);
        let c = g.add_tensor(
            Some("c".into()),
            vec![2],
            ElemType::F32,
            Some(Constant::F32(vec![1.0, 1.0])),
        );
        let y = g.add_tensor(Some("y".into()), vec![2], ElemType::F32, None);
        g.add_node(
            "add0",
            OpKind::Add,
            BTreeMap::from([("dummy".to_string(), Attr::Int(0))]),
            vec![x, c],
            vec![y],
        );
        g.inputs.push(x);
        g.outputs.push(y);

        assert!(!ConstantFolding.apply(&mut g).unwrap());
        assert_eq!(g.node_count(), 1);
    }
}
