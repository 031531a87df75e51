//! Target binary serialization.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic "RKNN" | version u32 | platform u16 | flags u8 | pad u8
//! tensor count u32 | node count u32
//! graph inputs:  count u8, tensor indices u32...
//! graph outputs: count u8, tensor indices u32...
//! tensor table | node table | custom string trailer
//! ```
//!
//! Tensors are emitted in ascending-id order and nodes in topological
//! order; node attributes iterate a BTreeMap. Encoding the same graph twice
//! therefore yields byte-identical output.
//!
//! This is the terminal gate for unsupported operators: a sentinel node
//! that was only a warning at load time becomes a hard
//! [`ConvertError::UnsupportedOperator`] here.

use crate::config::TargetConfig;
use crate::errors::{ConvertError, Result};
use crate::ir::{Attr, Graph, Node, Tensor, TensorId};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const MAGIC: [u8; 4] = *b"RKNN";
pub const VERSION: u32 = 1;

const FLAG_QUANTIZED: u8 = 0b0000_0001;

const ATTR_INT: u8 = 0;
const ATTR_FLOAT: u8 = 1;
const ATTR_INTS: u8 = 2;
const ATTR_FLOATS: u8 = 3;
const ATTR_STR: u8 = 4;

/// Serialize the graph for the configured target platform.
pub fn encode(graph: &Graph, target: &TargetConfig, quantized: bool) -> Result<Vec<u8>> {
    if let Some(node) = graph.first_unsupported() {
        return Err(ConvertError::UnsupportedOperator {
            node: node.name.clone(),
            op: format!("{} (unsupported operator for target)", node.op.name()),
        });
    }

    let tensors: Vec<&Tensor> = graph.tensors().collect();
    let index: HashMap<TensorId, u32> = tensors
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id, i as u32))
        .collect();
    let order = graph.topo_order()?;

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    put_u32(&mut out, VERSION);
    put_u16(&mut out, target.platform.id());
    out.push(if quantized { FLAG_QUANTIZED } else { 0 });
    out.push(0);
    put_u32(&mut out, tensors.len() as u32);
    put_u32(&mut out, order.len() as u32);

    for (ids, what) in [(&graph.inputs, "graph input"), (&graph.outputs, "graph output")] {
        put_count(&mut out, ids.len(), what)?;
        for id in ids {
            put_u32(&mut out, index[id]);
        }
    }

    for tensor in &tensors {
        put_tensor(&mut out, tensor)?;
    }
    for node_id in order {
        put_node(&mut out, graph.node(node_id), &index)?;
    }

    put_str(&mut out, target.custom_string.as_deref().unwrap_or(""))?;
    Ok(out)
}

/// Encode and write to `path` atomically: the bytes land in a temporary
/// file beside the target and are renamed into place only on success, so an
/// interrupted run never leaves a corrupt output.
pub fn write(graph: &Graph, target: &TargetConfig, quantized: bool, path: &Path) -> Result<()> {
    let bytes = encode(graph, target, quantized)?;

    let tmp = path.with_extension("tmp");
    let io_err = |e: std::io::Error| ConvertError::Encode {
        reason: format!("failed to write '{}': {e}", path.display()),
    };
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

fn put_tensor(out: &mut Vec<u8>, tensor: &Tensor) -> Result<()> {
    put_str(out, &tensor.label())?;
    put_count(out, tensor.shape.len(), "tensor rank")?;
    for &dim in &tensor.shape {
        put_u32(out, dim as u32);
    }
    out.push(tensor.elem.code());

    match tensor.qparams {
        Some(qp) => {
            out.push(1);
            out.extend_from_slice(&qp.scale.to_le_bytes());
            out.extend_from_slice(&qp.zero_point.to_le_bytes());
        }
        None => out.push(0),
    }

    match &tensor.data {
        Some(data) => {
            out.push(1);
            let bytes = data.to_le_bytes();
            put_u32(out, bytes.len() as u32);
            out.extend_from_slice(&bytes);
        }
        None => out.push(0),
    }
    Ok(())
}

fn put_node(out: &mut Vec<u8>, node: &Node, index: &HashMap<TensorId, u32>) -> Result<()> {
    let code = node.op.code().ok_or_else(|| ConvertError::UnsupportedOperator {
        node: node.name.clone(),
        op: format!("{} (unsupported operator for target)", node.op.name()),
    })?;
    put_str(out, &node.name)?;
    put_u16(out, code);

    put_count(out, node.attrs.len(), "node attribute")?;
    for (key, attr) in &node.attrs {
        put_str(out, key)?;
        put_attr(out, attr)?;
    }

    for (ids, what) in [(&node.inputs, "node input"), (&node.outputs, "node output")] {
        put_count(out, ids.len(), what)?;
        for id in ids {
            put_u32(out, index[id]);
        }
    }
    Ok(())
}

fn put_attr(out: &mut Vec<u8>, attr: &Attr) -> Result<()> {
    match attr {
        Attr::Int(v) => {
            out.push(ATTR_INT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Attr::Float(v) => {
            out.push(ATTR_FLOAT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Attr::Ints(vs) => {
            out.push(ATTR_INTS);
            put_u32(out, vs.len() as u32);
            for v in vs {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Attr::Floats(vs) => {
            out.push(ATTR_FLOATS);
            put_u32(out, vs.len() as u32);
            for v in vs {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        Attr::Str(s) => {
            out.push(ATTR_STR);
            put_str(out, s)?;
        }
    }
    Ok(())
}

/// Single-byte count fields overflow silently under `as`; large graphs must
/// fail loudly instead.
fn put_count(out: &mut Vec<u8>, n: usize, what: &str) -> Result<()> {
    let v = u8::try_from(n).map_err(|_| ConvertError::Encode {
        reason: format!("{what} count {n} exceeds the format limit of {}", u8::MAX),
    })?;
    out.push(v);
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| ConvertError::Encode {
        reason: format!("string of {} bytes exceeds the format limit of {}", s.len(), u16::MAX),
    })?;
    put_u16(out, len);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetPlatform;
    use crate::ir::{Constant, ElemType, OpKind};
    use std::collections::BTreeMap;

    fn target(platform: TargetPlatform) -> TargetConfig {
        TargetConfig {
            platform,
            custom_string: None,
        }
    }

    fn relu_graph() -> Graph {
        let mut g = Graph::new();
        let x = g.add_tensor(Some("x".into()), vec![1, 4], ElemType::F32, None);
        let w = g.add_tensor(
            Some("w".into()),
            vec![4],
            ElemType::F32,
            Some(Constant::F32(vec![1.0, 2.0, 3.0, 4.0])),
        );
        let y = g.add_tensor(Some("y".into()), vec![1, 4], ElemType::F32, None);
        g.add_node("add0", OpKind::Add, BTreeMap::new(), vec![x, w], vec![y]);
        g.inputs.push(x);
        g.outputs.push(y);
        g
    }

    #[test]
    fn test_header_fields() {
        let g = relu_graph();
        let bytes = encode(&g, &target(TargetPlatform::Rk3588), false).unwrap();
        assert_eq!(&bytes[0..4], b"RKNN");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), VERSION);
        assert_eq!(u16::from_le_bytes(bytes[8..10].try_into().unwrap()), 0x3588);
        assert_eq!(bytes[10], 0); // not quantized
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 1);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let g = relu_graph();
        let t = target(TargetPlatform::Rk3576);
        assert_eq!(encode(&g, &t, false).unwrap(), encode(&g, &t, false).unwrap());
    }

    #[test]
    fn test_unsupported_node_is_rejected() {
        let mut g = relu_graph();
        let a = g.add_tensor(None, vec![1], ElemType::F32, None);
        let b = g.add_tensor(None, vec![1], ElemType::F32, None);
        g.add_node(
            "mystery",
            OpKind::Unsupported("Erf".into()),
            BTreeMap::new(),
            vec![a],
            vec![b],
        );
        let err = encode(&g, &target(TargetPlatform::Rk3588), false).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedOperator { node, .. } if node == "mystery"));
    }

    #[test]
    fn test_oversized_node_input_list_is_rejected() {
        let mut g = Graph::new();
        let inputs: Vec<_> = (0..300)
            .map(|i| g.add_tensor(Some(format!("t{i}")), vec![1, 1], ElemType::F32, None))
            .collect();
        g.inputs.push(inputs[0]);
        let y = g.add_tensor(Some("y".into()), vec![300, 1], ElemType::F32, None);
        let attrs = BTreeMap::from([("axis".to_string(), crate::ir::Attr::Int(0))]);
        g.add_node("cat0", OpKind::Concat, attrs, inputs, vec![y]);
        g.outputs.push(y);

        let err = encode(&g, &target(TargetPlatform::Rk3588), false).unwrap_err();
        assert!(matches!(err, ConvertError::Encode { .. }));
    }

    #[test]
    fn test_custom_string_trailer() {
        let g = relu_graph();
        let t = TargetConfig {
            platform: TargetPlatform::Rk3568,
            custom_string: Some("built-by-ci".into()),
        };
        let bytes = encode(&g, &t, false).unwrap();
        let tail = &bytes[bytes.len() - 11..];
        assert_eq!(tail, b"built-by-ci");
    }

    #[test]
    fn test_write_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rknn");
        let g = relu_graph();
        write(&g, &target(TargetPlatform::Rv1106), true, &path).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RKNN");
        assert_eq!(bytes[10], 1); // quantized flag
    }

    #[test]
    fn test_failed_encode_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.rknn");
        let mut g = relu_graph();
        let a = g.add_tensor(None, vec![1], ElemType::F32, None);
        let b = g.add_tensor(None, vec![1], ElemType::F32, None);
        g.add_node(
            "mystery",
            OpKind::Unsupported("Erf".into()),
            BTreeMap::new(),
            vec![a],
            vec![b],
        );
        assert!(write(&g, &target(TargetPlatform::Rk3588), false, &path).is_err());
        assert!(!path.exists());
    }
}
