//! Forward shape propagation over the IR.
//!
//! Loaders call [`infer`] after binding the configured input shapes to the
//! graph boundary. Each operator has one rule; a rule that cannot produce a
//! shape for a supported operator is a hard load failure. Unsupported
//! sentinel nodes fall back to their first input's shape (with a warning)
//! so `explain` can still show a mostly-shaped graph.

use crate::errors::{ConvertError, Result, Warning};
use crate::ir::{Graph, Node, OpKind};

/// Propagate shapes in topological order. Returns fallback warnings.
pub fn infer(graph: &mut Graph) -> Result<Vec<Warning>> {
    let mut warnings = Vec::new();
    let order = graph.topo_order()?;

    for node_id in order {
        let node = graph.node(node_id).clone();
        if node.outputs.iter().all(|&t| !graph.tensor(t).shape.is_empty()) {
            continue;
        }

        let shape = match infer_node(graph, &node) {
            Ok(shape) => shape,
            Err(e) => {
                if node.op.is_unsupported() {
                    // Deferred-failure path: carry the input shape forward
                    // if we have one, otherwise leave the shape unknown.
                    let fallback = node
                        .inputs
                        .first()
                        .map(|&t| graph.tensor(t).shape.clone())
                        .unwrap_or_default();
                    for &out in &node.outputs {
                        warnings.push(Warning::ShapeFallback {
                            tensor: graph.tensor(out).label(),
                        });
                        graph.tensor_mut(out).shape = fallback.clone();
                    }
                    continue;
                }
                return Err(e);
            }
        };

        for &out in &node.outputs {
            graph.tensor_mut(out).shape = shape.clone();
        }
    }

    Ok(warnings)
}

fn shape_err(node: &Node, reason: impl Into<String>) -> ConvertError {
    ConvertError::ShapeInference {
        tensor: node
            .outputs
            .first()
            .map(|t| format!("#{}", t.0))
            .unwrap_or_else(|| node.name.clone()),
        reason: reason.into(),
    }
}

fn input_shape<'g>(graph: &'g Graph, node: &Node, idx: usize) -> Result<&'g [usize]> {
    let &id = node
        .inputs
        .get(idx)
        .ok_or_else(|| shape_err(node, format!("missing input {idx}")))?;
    let shape = &graph.tensor(id).shape;
    if shape.is_empty() {
        return Err(shape_err(node, format!("input {idx} has unknown shape")));
    }
    Ok(shape)
}

fn infer_node(graph: &Graph, node: &Node) -> Result<Vec<usize>> {
    match &node.op {
        OpKind::Conv2D => infer_conv(graph, node),
        OpKind::MaxPool2D | OpKind::AvgPool2D => infer_pool(graph, node),
        OpKind::MatMul => infer_matmul(graph, node),
        OpKind::Add | OpKind::Mul => infer_broadcast(graph, node),
        OpKind::Relu
        | OpKind::Sigmoid
        | OpKind::Softmax
        | OpKind::BatchNorm
        | OpKind::Requantize => Ok(input_shape(graph, node, 0)?.to_vec()),
        OpKind::Reshape => infer_reshape(graph, node),
        OpKind::Flatten => infer_flatten(graph, node),
        OpKind::Concat => infer_concat(graph, node),
        OpKind::Unsupported(op) => Err(shape_err(node, format!("no rule for '{op}'"))),
    }
}

fn spatial_attr(node: &Node, key: &str, default: [usize; 2]) -> Result<[usize; 2]> {
    match node.attr_ints(key) {
        None => Ok(default),
        Some([a, b]) => Ok([*a as usize, *b as usize]),
        Some(other) => Err(shape_err(
            node,
            format!("attribute '{key}' must have 2 entries, has {}", other.len()),
        )),
    }
}

fn infer_conv(graph: &Graph, node: &Node) -> Result<Vec<usize>> {
    let input = input_shape(graph, node, 0)?;
    let weight = input_shape(graph, node, 1)?;
    let (&[n, c, h, w], &[o, wc, kh, kw]) = (input, weight) else {
        return Err(shape_err(
            node,
            format!("expected 4-d input and weight, got {input:?} and {weight:?}"),
        ));
    };
    if c != wc {
        return Err(shape_err(
            node,
            format!("input has {c} channels but weight expects {wc}"),
        ));
    }
    let [sh, sw] = spatial_attr(node, "strides", [1, 1])?;
    let [ph, pw] = spatial_attr(node, "pads", [0, 0])?;
    if h + 2 * ph < kh || w + 2 * pw < kw {
        return Err(shape_err(node, "kernel larger than padded input"));
    }
    Ok(vec![n, o, (h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1])
}

fn infer_pool(graph: &Graph, node: &Node) -> Result<Vec<usize>> {
    let input = input_shape(graph, node, 0)?;
    let &[n, c, h, w] = input else {
        return Err(shape_err(node, format!("expected 4-d input, got {input:?}")));
    };
    let kernel = spatial_attr(node, "kernel", [0, 0])?;
    let [kh, kw] = kernel;
    if kh == 0 || kw == 0 {
        return Err(shape_err(node, "missing 'kernel' attribute"));
    }
    let [sh, sw] = spatial_attr(node, "strides", kernel)?;
    let [ph, pw] = spatial_attr(node, "pads", [0, 0])?;
    if h + 2 * ph < kh || w + 2 * pw < kw {
        return Err(shape_err(node, "kernel larger than padded input"));
    }
    Ok(vec![n, c, (h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1])
}

fn infer_matmul(graph: &Graph, node: &Node) -> Result<Vec<usize>> {
    let a = input_shape(graph, node, 0)?;
    let b = input_shape(graph, node, 1)?;
    let (&[m, k], &[b0, b1]) = (a, b) else {
        return Err(shape_err(
            node,
            format!("expected 2-d operands, got {a:?} and {b:?}"),
        ));
    };
    // trans_b: B is stored [n, k] (PyTorch linear weight convention).
    let trans_b = node.attr_i64("trans_b").unwrap_or(0) != 0;
    let (bk, n) = if trans_b { (b1, b0) } else { (b0, b1) };
    if k != bk {
        return Err(shape_err(
            node,
            format!("inner dimensions disagree: {k} vs {bk}"),
        ));
    }
    Ok(vec![m, n])
}

fn infer_broadcast(graph: &Graph, node: &Node) -> Result<Vec<usize>> {
    let a = input_shape(graph, node, 0)?.to_vec();
    let b = input_shape(graph, node, 1)?;
    if broadcast_ok(&a, b) {
        Ok(a)
    } else {
        Err(shape_err(
            node,
            format!("cannot broadcast {b:?} onto {a:?}"),
        ))
    }
}

/// Broadcast forms the evaluator supports: identical shapes, a scalar, a
/// per-channel vector `[c]` against `[n, c, h, w]`, or `[1, c, 1, 1]`.
pub(crate) fn broadcast_ok(a: &[usize], b: &[usize]) -> bool {
    if a == b {
        return true;
    }
    if b.iter().product::<usize>() == 1 {
        return true;
    }
    if a.len() == 4 {
        if b.len() == 1 && b[0] == a[1] {
            return true;
        }
        if b == [1, a[1], 1, 1] {
            return true;
        }
    }
    false
}

fn infer_reshape(graph: &Graph, node: &Node) -> Result<Vec<usize>> {
    let input = input_shape(graph, node, 0)?;
    let total: usize = input.iter().product();
    let target = node
        .attr_ints("shape")
        .ok_or_else(|| shape_err(node, "missing 'shape' attribute"))?;

    let mut inferred = None;
    let mut known = 1usize;
    for (i, &d) in target.iter().enumerate() {
        if d == -1 {
            if inferred.is_some() {
                return Err(shape_err(node, "more than one -1 in reshape target"));
            }
            inferred = Some(i);
        } else if d > 0 {
            known *= d as usize;
        } else {
            return Err(shape_err(node, format!("invalid dimension {d}")));
        }
    }

    let mut out: Vec<usize> = target.iter().map(|&d| d.max(0) as usize).collect();
    if let Some(i) = inferred {
        if known == 0 || total % known != 0 {
            return Err(shape_err(
                node,
                format!("cannot infer -1: {total} elements not divisible by {known}"),
            ));
        }
        out[i] = total / known;
    } else if known != total {
        return Err(shape_err(
            node,
            format!("reshape to {target:?} changes element count ({known} != {total})"),
        ));
    }
    Ok(out)
}

fn infer_flatten(graph: &Graph, node: &Node) -> Result<Vec<usize>> {
    let input = input_shape(graph, node, 0)?;
    let axis = node.attr_i64("axis").unwrap_or(1) as usize;
    if axis == 0 || axis > input.len() {
        return Err(shape_err(node, format!("flatten axis {axis} out of range")));
    }
    Ok(vec![
        input[..axis].iter().product(),
        input[axis..].iter().product(),
    ])
}

fn infer_concat(graph: &Graph, node: &Node) -> Result<Vec<usize>> {
    let axis = node
        .attr_i64("axis")
        .ok_or_else(|| shape_err(node, "missing 'axis' attribute"))? as usize;
    let mut out = input_shape(graph, node, 0)?.to_vec();
    if axis >= out.len() {
        return Err(shape_err(node, format!("concat axis {axis} out of range")));
    }
    for idx in 1..node.inputs.len() {
        let shape = input_shape(graph, node, idx)?;
        if shape.len() != out.len() {
            return Err(shape_err(node, "concat inputs have different ranks"));
        }
        for (d, (&a, &b)) in out.iter().zip(shape).enumerate() {
            if d != axis && a != b {
                return Err(shape_err(
                    node,
                    format!("concat inputs disagree on dimension {d}: {a} vs {b}"),
                ));
            }
        }
        out[axis] += shape[axis];
    }
    Ok(out)
}
