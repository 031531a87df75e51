//! Naive float32 evaluation of IR nodes.
//!
//! One interpreter backs both constant folding and calibration simulation,
//! so the two can never disagree on operator semantics. Kernels are plain
//! loops over NCHW buffers; this is a conversion tool, not a runtime, and
//! calibration sets are small.

use crate::errors::{ConvertError, Result};
use crate::ir::{Graph, Node, OpKind, TensorId};
use std::collections::HashMap;

/// Run the whole graph on the given input feeds, returning the value of
/// every tensor that was computed (constants included).
///
/// # Errors
///
/// Fails with [`ConvertError::UnsupportedOperator`] on a sentinel node and
/// [`ConvertError::Internal`] if a value is missing, which means the graph
/// was not validated first.
pub fn run_graph(
    graph: &Graph,
    feeds: &HashMap<TensorId, Vec<f32>>,
) -> Result<HashMap<TensorId, Vec<f32>>> {
    let mut values: HashMap<TensorId, Vec<f32>> = feeds.clone();
    for tensor in graph.tensors() {
        if let Some(data) = &tensor.data {
            let floats = data.as_f32().ok_or_else(|| ConvertError::Internal {
                reason: format!(
                    "constant '{}' is not float32; evaluation runs before quantization",
                    tensor.label()
                ),
            })?;
            values.insert(tensor.id, floats.to_vec());
        }
    }

    for node_id in graph.topo_order()? {
        let node = graph.node(node_id);
        let mut inputs = Vec::with_capacity(node.inputs.len());
        for &id in &node.inputs {
            let data = values.get(&id).ok_or_else(|| ConvertError::Internal {
                reason: format!("no value for tensor '{}'", graph.tensor(id).label()),
            })?;
            inputs.push((graph.tensor(id).shape.as_slice(), data.as_slice()));
        }
        // Loaders guarantee single-output nodes; anything else would leave
        // tensors without values.
        let [out] = node.outputs.as_slice() else {
            return Err(ConvertError::Internal {
                reason: format!(
                    "node '{}' has {} outputs, expected exactly one",
                    node.name,
                    node.outputs.len()
                ),
            });
        };
        let result = eval_node(node, &inputs, &graph.tensor(*out).shape)?;
        values.insert(*out, result);
    }
    Ok(values)
}

/// Evaluate a single node given `(shape, data)` pairs for its inputs and
/// the already-inferred output shape.
pub fn eval_node(
    node: &Node,
    inputs: &[(&[usize], &[f32])],
    out_shape: &[usize],
) -> Result<Vec<f32>> {
    let result = match &node.op {
        OpKind::Conv2D => conv2d(node, inputs, out_shape)?,
        OpKind::MatMul => matmul(node, inputs)?,
        OpKind::Add => binop(node, inputs, |a, b| a + b)?,
        OpKind::Mul => binop(node, inputs, |a, b| a * b)?,
        OpKind::Relu => inputs[0].1.iter().map(|&v| v.max(0.0)).collect(),
        OpKind::Sigmoid => inputs[0].1.iter().map(|&v| 1.0 / (1.0 + (-v).exp())).collect(),
        OpKind::BatchNorm => batchnorm(node, inputs)?,
        OpKind::MaxPool2D => pool(node, inputs, out_shape, true)?,
        OpKind::AvgPool2D => pool(node, inputs, out_shape, false)?,
        OpKind::Reshape | OpKind::Flatten | OpKind::Requantize => inputs[0].1.to_vec(),
        OpKind::Softmax => softmax(node, inputs),
        OpKind::Concat => concat(node, inputs, out_shape)?,
        OpKind::Unsupported(op) => {
            return Err(ConvertError::UnsupportedOperator {
                node: node.name.clone(),
                op: op.clone(),
            })
        }
    };
    Ok(result)
}

fn internal(node: &Node, reason: impl Into<String>) -> ConvertError {
    ConvertError::Internal {
        reason: format!("eval of node '{}': {}", node.name, reason.into()),
    }
}

fn spatial(node: &Node, key: &str, default: [usize; 2]) -> [usize; 2] {
    match node.attr_ints(key) {
        Some([a, b]) => [*a as usize, *b as usize],
        _ => default,
    }
}

fn apply_activation(node: &Node, mut data: Vec<f32>) -> Vec<f32> {
    match node.attr_str("activation") {
        Some("relu") => {
            for v in &mut data {
                *v = v.max(0.0);
            }
        }
        Some("sigmoid") => {
            for v in &mut data {
                *v = 1.0 / (1.0 + (-*v).exp());
            }
        }
        _ => {}
    }
    data
}

fn conv2d(node: &Node, inputs: &[(&[usize], &[f32])], out_shape: &[usize]) -> Result<Vec<f32>> {
    let (in_shape, x) = inputs[0];
    let (w_shape, w) = inputs[1];
    let bias = inputs.get(2).map(|&(_, b)| b);

    let &[_, c, h, iw] = in_shape else {
        return Err(internal(node, "input is not 4-d"));
    };
    let &[o, _, kh, kw] = w_shape else {
        return Err(internal(node, "weight is not 4-d"));
    };
    let &[n, _, oh, ow] = out_shape else {
        return Err(internal(node, "output is not 4-d"));
    };
    let [sh, sw] = spatial(node, "strides", [1, 1]);
    let [ph, pw] = spatial(node, "pads", [0, 0]);

    let mut out = vec![0.0f32; n * o * oh * ow];
    for bn in 0..n {
        for oc in 0..o {
            for y in 0..oh {
                for x_out in 0..ow {
                    let mut acc = bias.map(|b| b[oc]).unwrap_or(0.0);
                    for ic in 0..c {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                let iy = (y * sh + ky) as isize - ph as isize;
                                let ix = (x_out * sw + kx) as isize - pw as isize;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= iw as isize {
                                    continue;
                                }
                                let xi = ((bn * c + ic) * h + iy as usize) * iw + ix as usize;
                                let wi = ((oc * c + ic) * kh + ky) * kw + kx;
                                acc += x[xi] * w[wi];
                            }
                        }
                    }
                    out[((bn * o + oc) * oh + y) * ow + x_out] = acc;
                }
            }
        }
    }
    Ok(apply_activation(node, out))
}

fn matmul(node: &Node, inputs: &[(&[usize], &[f32])]) -> Result<Vec<f32>> {
    let (a_shape, a) = inputs[0];
    let (b_shape, b) = inputs[1];
    let bias = inputs.get(2).map(|&(_, v)| v);
    let trans_b = node.attr_i64("trans_b").unwrap_or(0) != 0;

    let &[m, k] = a_shape else {
        return Err(internal(node, "lhs is not 2-d"));
    };
    let &[b0, b1] = b_shape else {
        return Err(internal(node, "rhs is not 2-d"));
    };
    let n = if trans_b { b0 } else { b1 };

    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = bias.map(|v| v[j]).unwrap_or(0.0);
            for p in 0..k {
                let bv = if trans_b { b[j * k + p] } else { b[p * b1 + j] };
                acc += a[i * k + p] * bv;
            }
            out[i * n + j] = acc;
        }
    }
    Ok(out)
}

fn binop(
    node: &Node,
    inputs: &[(&[usize], &[f32])],
    f: impl Fn(f32, f32) -> f32,
) -> Result<Vec<f32>> {
    let (a_shape, a) = inputs[0];
    let (b_shape, b) = inputs[1];

    if a_shape == b_shape {
        return Ok(a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect());
    }
    if b.len() == 1 {
        return Ok(a.iter().map(|&x| f(x, b[0])).collect());
    }
    // Per-channel operand against NCHW.
    if a_shape.len() == 4 {
        let [_, c, h, w] = [a_shape[0], a_shape[1], a_shape[2], a_shape[3]];
        if b.len() == c {
            let plane = h * w;
            return Ok(a
                .iter()
                .enumerate()
                .map(|(i, &x)| f(x, b[(i / plane) % c]))
                .collect());
        }
    }
    Err(internal(
        node,
        format!("unsupported broadcast: {a_shape:?} vs {b_shape:?}"),
    ))
}

fn batchnorm(node: &Node, inputs: &[(&[usize], &[f32])]) -> Result<Vec<f32>> {
    let (x_shape, x) = inputs[0];
    let scale = inputs.get(1).map(|&(_, v)| v).ok_or_else(|| internal(node, "missing scale"))?;
    let bias = inputs.get(2).map(|&(_, v)| v).ok_or_else(|| internal(node, "missing bias"))?;
    let mean = inputs.get(3).map(|&(_, v)| v).ok_or_else(|| internal(node, "missing mean"))?;
    let var = inputs.get(4).map(|&(_, v)| v).ok_or_else(|| internal(node, "missing variance"))?;
    let epsilon = node.attr_f32("epsilon").unwrap_or(1e-5);

    let &[_, c, h, w] = x_shape else {
        return Err(internal(node, "input is not 4-d"));
    };
    let plane = h * w;
    Ok(x.iter()
        .enumerate()
        .map(|(i, &v)| {
            let ch = (i / plane) % c;
            (v - mean[ch]) / (var[ch] + epsilon).sqrt() * scale[ch] + bias[ch]
        })
        .collect())
}

fn pool(
    node: &Node,
    inputs: &[(&[usize], &[f32])],
    out_shape: &[usize],
    max: bool,
) -> Result<Vec<f32>> {
    let (in_shape, x) = inputs[0];
    let &[_, c, h, w] = in_shape else {
        return Err(internal(node, "input is not 4-d"));
    };
    let &[n, _, oh, ow] = out_shape else {
        return Err(internal(node, "output is not 4-d"));
    };
    let kernel = spatial(node, "kernel", [1, 1]);
    let [kh, kw] = kernel;
    let [sh, sw] = spatial(node, "strides", kernel);
    let [ph, pw] = spatial(node, "pads", [0, 0]);

    let mut out = vec![0.0f32; n * c * oh * ow];
    for bn in 0..n {
        for ch in 0..c {
            for y in 0..oh {
                for xo in 0..ow {
                    let mut acc = if max { f32::NEG_INFINITY } else { 0.0 };
                    let mut count = 0usize;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = (y * sh + ky) as isize - ph as isize;
                            let ix = (xo * sw + kx) as isize - pw as isize;
                            if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                continue;
                            }
                            let v = x[((bn * c + ch) * h + iy as usize) * w + ix as usize];
                            if max {
                                acc = acc.max(v);
                            } else {
                                acc += v;
                            }
                            count += 1;
                        }
                    }
                    if !max && count > 0 {
                        acc /= count as f32;
                    }
                    out[((bn * c + ch) * oh + y) * ow + xo] = acc;
                }
            }
        }
    }
    Ok(out)
}

fn softmax(node: &Node, inputs: &[(&[usize], &[f32])]) -> Vec<f32> {
    let (shape, x) = inputs[0];
    let rank = shape.len();
    let axis = match node.attr_i64("axis") {
        Some(a) if a >= 0 => a as usize,
        Some(a) => (rank as i64 + a) as usize,
        None => rank - 1,
    };
    let axis_len = shape[axis];
    let inner: usize = shape[axis + 1..].iter().product();
    let outer: usize = shape[..axis].iter().product();

    let mut out = vec![0.0f32; x.len()];
    for o in 0..outer {
        for i in 0..inner {
            let idx = |a: usize| (o * axis_len + a) * inner + i;
            let max = (0..axis_len)
                .map(|a| x[idx(a)])
                .fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for a in 0..axis_len {
                let e = (x[idx(a)] - max).exp();
                out[idx(a)] = e;
                sum += e;
            }
            for a in 0..axis_len {
                out[idx(a)] /= sum;
            }
        }
    }
    out
}

fn concat(node: &Node, inputs: &[(&[usize], &[f32])], out_shape: &[usize]) -> Result<Vec<f32>> {
    let axis = node
        .attr_i64("axis")
        .ok_or_else(|| internal(node, "missing 'axis' attribute"))? as usize;
    let outer: usize = out_shape[..axis].iter().product();
    let inner: usize = out_shape[axis + 1..].iter().product();

    let mut out = Vec::with_capacity(out_shape.iter().product());
    for o in 0..outer {
        for &(shape, data) in inputs {
            let block = shape[axis] * inner;
            out.extend_from_slice(&data[o * block..(o + 1) * block]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attr, Constant, ElemType};
    use std::collections::BTreeMap;

    fn node(op: OpKind, attrs: BTreeMap<String, Attr>) -> Node {
        Node {
            id: crate::ir::NodeId(0),
            name: "n".into(),
            op,
            attrs,
            inputs: vec![],
            outputs: vec![],
        }
    }

    #[test]
    fn test_conv_identity_kernel() {
        // 1x1 kernel with weight 1.0 passes the input through.
        let n = node(OpKind::Conv2D, BTreeMap::new());
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let w = vec![1.0];
        let out = eval_node(
            &n,
            &[(&[1, 1, 2, 2], &x), (&[1, 1, 1, 1], &w)],
            &[1, 1, 2, 2],
        )
        .unwrap();
        assert_eq!(out, x);
    }

    #[test]
    fn test_conv_sums_kernel_window() {
        // 2x2 all-ones kernel over a 2x2 input: single output = sum.
        let n = node(OpKind::Conv2D, BTreeMap::new());
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let w = vec![1.0; 4];
        let out = eval_node(
            &n,
            &[(&[1, 1, 2, 2], &x), (&[1, 1, 2, 2], &w)],
            &[1, 1, 1, 1],
        )
        .unwrap();
        assert_eq!(out, vec![10.0]);
    }

    #[test]
    fn test_conv_fused_relu_clamps() {
        let mut attrs = BTreeMap::new();
        attrs.insert("activation".to_string(), Attr::Str("relu".into()));
        let n = node(OpKind::Conv2D, attrs);
        let x = vec![1.0, -2.0];
        let w = vec![1.0];
        let out = eval_node(
            &n,
            &[(&[1, 1, 1, 2], &x), (&[1, 1, 1, 1], &w)],
            &[1, 1, 1, 2],
        )
        .unwrap();
        assert_eq!(out, vec![1.0, 0.0]);
    }

    #[test]
    fn test_matmul_with_bias() {
        let n = node(OpKind::MatMul, BTreeMap::new());
        let a = vec![1.0, 2.0];
        let b = vec![1.0, 0.0, 0.0, 1.0];
        let bias = vec![10.0, 20.0];
        let out = eval_node(
            &n,
            &[(&[1, 2], &a), (&[2, 2], &b), (&[2], &bias)],
            &[1, 2],
        )
        .unwrap();
        assert_eq!(out, vec![11.0, 22.0]);
    }

    #[test]
    fn test_add_per_channel_broadcast() {
        let n = node(OpKind::Add, BTreeMap::new());
        let a = vec![0.0; 8];
        let b = vec![1.0, 2.0];
        let out = eval_node(
            &n,
            &[(&[1, 2, 2, 2], &a), (&[2], &b)],
            &[1, 2, 2, 2],
        )
        .unwrap();
        assert_eq!(out, vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_maxpool() {
        let mut attrs = BTreeMap::new();
        attrs.insert("kernel".to_string(), Attr::Ints(vec![2, 2]));
        let n = node(OpKind::MaxPool2D, attrs);
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let out = eval_node(&n, &[(&[1, 1, 2, 2], &x)], &[1, 1, 1, 1]).unwrap();
        assert_eq!(out, vec![4.0]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let n = node(OpKind::Softmax, BTreeMap::new());
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let out = eval_node(&n, &[(&[1, 4], &x)], &[1, 4]).unwrap();
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(out[3] > out[0]);
    }

    #[test]
    fn test_run_graph_end_to_end() {
        let mut g = Graph::new();
        let x = g.add_tensor(Some("x".into()), vec![1, 2], ElemType::F32, None);
        let w = g.add_tensor(
            Some("w".into()),
            vec![2, 2],
            ElemType::F32,
            Some(Constant::F32(vec![1.0, 0.0, 0.0, 1.0])),
        );
        let mid = g.add_tensor(Some("mid".into()), vec![1, 2], ElemType::F32, None);
        let y = g.add_tensor(Some("y".into()), vec![1, 2], ElemType::F32, None);
        g.add_node("fc", OpKind::MatMul, BTreeMap::new(), vec![x, w], vec![mid]);
        g.add_node("act", OpKind::Relu, BTreeMap::new(), vec![mid], vec![y]);
        g.inputs.push(x);
        g.outputs.push(y);

        let mut feeds = HashMap::new();
        feeds.insert(x, vec![-1.0, 2.0]);
        let values = run_graph(&g, &feeds).unwrap();
        assert_eq!(values[&y], vec![0.0, 2.0]);
        assert_eq!(values[&mid], vec![-1.0, 2.0]);
    }

    #[test]
    fn test_unsupported_node_fails_eval() {
        let n = node(OpKind::Unsupported("Erf".into()), BTreeMap::new());
        let x = vec![0.0];
        let err = eval_node(&n, &[(&[1], &x)], &[1]).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedOperator { .. }));
    }
}
