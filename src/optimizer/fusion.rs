//! Operator fusion.
//!
//! Local patterns over a producer whose output has exactly one consumer:
//!
//! - Conv2D + Add(constant bias)    → Conv2D with a bias input
//! - Conv2D + BatchNorm(constants)  → Conv2D with folded weights
//! - Conv2D + Relu/Sigmoid          → Conv2D with an `activation` attribute
//! - BatchNorm(constants) + Conv2D  → Conv2D with folded weights (unpadded
//!   convs only; padding zeros would not carry the per-channel shift)
//!
//! The patterns never overlap on a node pair (the BatchNorm+Conv2D rule
//! yields to Conv2D+BatchNorm when both match the same BatchNorm), so
//! applying them in any order reaches the same fused graph. One application
//! fuses at most one pair; the driver re-applies to a fixpoint.

use crate::errors::{ConvertError, Result};
use crate::ir::{Attr, Constant, Graph, NodeId, OpKind, TensorId};
use crate::optimizer::Pass;

pub struct OperatorFusion;

impl Pass for OperatorFusion {
    fn name(&self) -> &'static str {
        "operator-fusion"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        for id in graph.topo_order()? {
            let Some(next) = sole_consumer(graph, id) else {
                continue;
            };
            let fused = match graph.node(id).op {
                OpKind::Conv2D => {
                    try_fuse_bias(graph, id, next)?
                        || try_fuse_batchnorm(graph, id, next)?
                        || try_fuse_activation(graph, id, next)
                }
                OpKind::BatchNorm => try_fuse_norm_conv(graph, id, next)?,
                _ => false,
            };
            if fused {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// The single node consuming the output, if the output feeds exactly one
/// node and is not itself a declared graph output.
fn sole_consumer(graph: &Graph, id: NodeId) -> Option<NodeId> {
    let out = *graph.node(id).outputs.first()?;
    if graph.outputs.contains(&out) {
        return None;
    }
    let consumers = graph.consumers();
    match consumers.get(&out).map(Vec::as_slice) {
        Some(&[single]) => Some(single),
        _ => None,
    }
}

/// Conv2D (no bias yet) followed by Add with a constant `[c]` or
/// `[1, c, 1, 1]` operand becomes a biased conv. A conv that already
/// carries a fused activation is off limits: its bias applies before the
/// activation, the Add after it.
fn try_fuse_bias(graph: &mut Graph, conv: NodeId, next: NodeId) -> Result<bool> {
    if graph.node(next).op != OpKind::Add || graph.node(conv).inputs.len() != 2 {
        return Ok(false);
    }
    if graph.node(conv).attrs.contains_key("activation") {
        return Ok(false);
    }
    let conv_out = graph.node(conv).outputs[0];
    let add = graph.node(next);
    let other = match add.inputs.as_slice() {
        &[a, b] if a == conv_out => b,
        &[a, b] if b == conv_out => a,
        _ => return Ok(false),
    };
    let out_channels = conv_channels(graph, conv)?;
    let bias = graph.tensor(other);
    let per_channel = bias.shape == [out_channels] || bias.shape == [1, out_channels, 1, 1];
    if !bias.is_const() || !per_channel {
        return Ok(false);
    }

    let add_out = graph.node(next).outputs[0];
    graph.node_mut(conv).inputs.push(other);
    rewire_output(graph, conv, conv_out, add_out);
    graph.remove_node(next);
    graph.remove_tensor(conv_out);
    Ok(true)
}

/// Constant gamma/beta/mean/variance of a 5-input BatchNorm, plus epsilon.
/// `None` when any parameter is missing or not a constant.
fn batchnorm_constants(graph: &Graph, bn: NodeId) -> Option<(f32, [Vec<f32>; 4])> {
    let node = graph.node(bn);
    if node.inputs.len() != 5 {
        return None;
    }
    let epsilon = node.attr_f32("epsilon").unwrap_or(1e-5);
    let mut folded = Vec::with_capacity(4);
    for &p in &node.inputs[1..] {
        let values = graph.tensor(p).data.as_ref().and_then(Constant::as_f32)?;
        folded.push(values.to_vec());
    }
    let params = <[Vec<f32>; 4]>::try_from(folded).ok()?;
    Some((epsilon, params))
}

/// Conv2D followed by BatchNorm with constant scale/bias/mean/var folds the
/// normalization into the conv weights (and bias, if present).
fn try_fuse_batchnorm(graph: &mut Graph, conv: NodeId, next: NodeId) -> Result<bool> {
    if graph.node(next).op != OpKind::BatchNorm {
        return Ok(false);
    }
    // Same ordering hazard as the bias fold: the normalization runs after
    // the fused activation, the folded weights before it.
    if graph.node(conv).attrs.contains_key("activation") {
        return Ok(false);
    }
    if graph.node(next).inputs.first() != Some(&graph.node(conv).outputs[0]) {
        return Ok(false);
    }
    let Some((epsilon, [gamma, beta, mean, var])) = batchnorm_constants(graph, next) else {
        return Ok(false);
    };

    let weight_id = graph.node(conv).inputs[1];
    let Some(weight) = graph
        .tensor(weight_id)
        .data
        .as_ref()
        .and_then(Constant::as_f32)
        .map(<[f32]>::to_vec)
    else {
        return Ok(false);
    };
    let out_channels = conv_channels(graph, conv)?;
    if gamma.len() != out_channels {
        return Ok(false);
    }

    let per_out = weight.len() / out_channels;
    let mut new_weight = weight;
    let mut factor = vec![0.0f32; out_channels];
    for oc in 0..out_channels {
        factor[oc] = gamma[oc] / (var[oc] + epsilon).sqrt();
        for v in &mut new_weight[oc * per_out..(oc + 1) * per_out] {
            *v *= factor[oc];
        }
    }

    let old_bias = match graph.node(conv).inputs.get(2) {
        Some(&b) => graph
            .tensor(b)
            .data
            .as_ref()
            .and_then(Constant::as_f32)
            .map(<[f32]>::to_vec)
            .unwrap_or_else(|| vec![0.0; out_channels]),
        None => vec![0.0; out_channels],
    };
    let new_bias: Vec<f32> = (0..out_channels)
        .map(|oc| (old_bias[oc] - mean[oc]) * factor[oc] + beta[oc])
        .collect();

    graph.tensor_mut(weight_id).data = Some(Constant::F32(new_weight));
    let bias_id = graph.add_tensor(
        Some(format!("{}_bias", graph.node(conv).name)),
        vec![out_channels],
        crate::ir::ElemType::F32,
        Some(Constant::F32(new_bias)),
    );
    match graph.node(conv).inputs.len() {
        2 => graph.node_mut(conv).inputs.push(bias_id),
        _ => graph.node_mut(conv).inputs[2] = bias_id,
    }

    let conv_out = graph.node(conv).outputs[0];
    let bn_out = graph.node(next).outputs[0];
    rewire_output(graph, conv, conv_out, bn_out);
    graph.remove_node(next);
    graph.remove_tensor(conv_out);
    Ok(true)
}

/// BatchNorm with constant parameters feeding an unpadded Conv2D folds into
/// the conv weights and bias. Padded convs are skipped: border windows see
/// padding zeros, not the per-channel shift, so the fold would be inexact
/// there. Yields to the Conv2D + BatchNorm rule when the normalization
/// itself follows a conv.
fn try_fuse_norm_conv(graph: &mut Graph, bn: NodeId, next: NodeId) -> Result<bool> {
    if graph.node(next).op != OpKind::Conv2D {
        return Ok(false);
    }
    let bn_out = graph.node(bn).outputs[0];
    let conv = graph.node(next);
    if conv.inputs.first() != Some(&bn_out) {
        return Ok(false);
    }
    if let Some(pads) = conv.attr_ints("pads") {
        if pads.iter().any(|&p| p != 0) {
            return Ok(false);
        }
    }
    let bn_in = graph.node(bn).inputs[0];
    let produced_by_conv = graph
        .producers()
        .get(&bn_in)
        .is_some_and(|&p| graph.node(p).op == OpKind::Conv2D);
    if produced_by_conv {
        return Ok(false);
    }
    let Some((epsilon, [gamma, beta, mean, var])) = batchnorm_constants(graph, bn) else {
        return Ok(false);
    };

    let weight_id = graph.node(next).inputs[1];
    let Some(weight) = graph
        .tensor(weight_id)
        .data
        .as_ref()
        .and_then(Constant::as_f32)
        .map(<[f32]>::to_vec)
    else {
        return Ok(false);
    };
    let wshape = graph.tensor(weight_id).shape.clone();
    if wshape.len() != 4 {
        return Ok(false);
    }
    let (out_channels, in_channels, khw) = (wshape[0], wshape[1], wshape[2] * wshape[3]);
    if gamma.len() != in_channels || weight.len() != out_channels * in_channels * khw {
        return Ok(false);
    }
    let old_bias = match graph.node(next).inputs.get(2) {
        Some(&b) => match graph.tensor(b).data.as_ref().and_then(Constant::as_f32) {
            Some(v) => v.to_vec(),
            None => return Ok(false),
        },
        None => vec![0.0; out_channels],
    };

    // BN(x) = scale ⊙ x + shift per input channel; the shift contribution
    // goes through the original weights, the scale into the new ones.
    let scale: Vec<f32> = (0..in_channels)
        .map(|i| gamma[i] / (var[i] + epsilon).sqrt())
        .collect();
    let shift: Vec<f32> = (0..in_channels)
        .map(|i| beta[i] - mean[i] * scale[i])
        .collect();

    let mut new_weight = weight;
    let mut new_bias = old_bias;
    for o in 0..out_channels {
        for i in 0..in_channels {
            let start = (o * in_channels + i) * khw;
            let block = &mut new_weight[start..start + khw];
            new_bias[o] += shift[i] * block.iter().sum::<f32>();
            for v in block.iter_mut() {
                *v *= scale[i];
            }
        }
    }

    graph.tensor_mut(weight_id).data = Some(Constant::F32(new_weight));
    let bias_id = graph.add_tensor(
        Some(format!("{}_bias", graph.node(next).name)),
        vec![out_channels],
        crate::ir::ElemType::F32,
        Some(Constant::F32(new_bias)),
    );
    match graph.node(next).inputs.len() {
        2 => graph.node_mut(next).inputs.push(bias_id),
        _ => graph.node_mut(next).inputs[2] = bias_id,
    }
    graph.node_mut(next).inputs[0] = bn_in;
    graph.remove_node(bn);
    graph.remove_tensor(bn_out);
    Ok(true)
}

/// Conv2D followed by Relu or Sigmoid becomes a conv with an `activation`
/// attribute, matching what the fixed-point kernels execute natively.
fn try_fuse_activation(graph: &mut Graph, conv: NodeId, next: NodeId) -> bool {
    let activation = match graph.node(next).op {
        OpKind::Relu => "relu",
        OpKind::Sigmoid => "sigmoid",
        _ => return false,
    };
    if graph.node(conv).attrs.contains_key("activation") {
        return false;
    }
    let conv_out = graph.node(conv).outputs[0];
    let act_out = graph.node(next).outputs[0];
    graph
        .node_mut(conv)
        .attrs
        .insert("activation".to_string(), Attr::Str(activation.to_string()));
    rewire_output(graph, conv, conv_out, act_out);
    graph.remove_node(next);
    graph.remove_tensor(conv_out);
    true
}

fn conv_channels(graph: &Graph, conv: NodeId) -> Result<usize> {
    let weight = graph.tensor(graph.node(conv).inputs[1]);
    weight.shape.first().copied().ok_or_else(|| ConvertError::Internal {
        reason: format!("conv '{}' weight has no shape", graph.node(conv).name),
    })
}

fn rewire_output(graph: &mut Graph, conv: NodeId, old: TensorId, new: TensorId) {
    let node = graph.node_mut(conv);
    for out in &mut node.outputs {
        if *out == old {
            *out = new;
        }
    }
}
