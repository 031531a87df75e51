//! Format-neutral intermediate representation shared by all passes.
//!
//! The graph is an arena: nodes and tensors live in slot vectors addressed
//! by stable integer ids, and edges are id references. Mutating passes
//! (fusion, dead-node elimination) rewrite id sets instead of a pointer
//! graph. The graph is a directed acyclic multigraph by invariant: every
//! tensor has at most one producing node (none for graph inputs and
//! weights) and any number of consumers.

pub mod eval;
pub mod shape_inference;

use crate::errors::{ConvertError, Result};
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::fmt;

/// Stable identifier of a tensor slot in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub u32);

/// Stable identifier of a node slot in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Tensor element type. Graphs load as float32; the quantizer rewrites
/// tensors to a fixed-point type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    F32,
    I8,
    I16,
}

impl ElemType {
    /// One-byte type code used by the target encoder.
    pub fn code(self) -> u8 {
        match self {
            ElemType::F32 => 0,
            ElemType::I8 => 1,
            ElemType::I16 => 2,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElemType::F32 => write!(f, "float32"),
            ElemType::I8 => write!(f, "int8"),
            ElemType::I16 => write!(f, "int16"),
        }
    }
}

/// Owned constant data of a weight tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    F32(Vec<f32>),
    I8(Vec<i8>),
    I16(Vec<i16>),
}

impl Constant {
    pub fn len(&self) -> usize {
        match self {
            Constant::F32(v) => v.len(),
            Constant::I8(v) => v.len(),
            Constant::I16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow as float data, if this constant is still floating-point.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Constant::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Little-endian byte image, as embedded by the target encoder.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Constant::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Constant::I8(v) => v.iter().map(|&x| x as u8).collect(),
            Constant::I16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }
}

/// Fixed-point parameters attached to a tensor by the quantizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

/// A value flowing through the graph.
///
/// Weight tensors own their constant data; activation tensors carry only
/// shape and type metadata.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub id: TensorId,
    pub name: Option<String>,
    /// Ordered dimension list. Empty until shape inference has run (only
    /// legal transiently, during loading).
    pub shape: Vec<usize>,
    pub elem: ElemType,
    pub data: Option<Constant>,
    pub qparams: Option<QuantParams>,
}

impl Tensor {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_const(&self) -> bool {
        self.data.is_some()
    }

    /// Human-readable label for diagnostics: the name if present, else the id.
    pub fn label(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("#{}", self.id.0),
        }
    }
}

/// Node attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Str(String),
}

/// Operator vocabulary. Closed and versioned: the target encoder assigns a
/// stable code to every kind except [`OpKind::Unsupported`], which only
/// exists so `explain` can report structure for partially-supported models.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Conv2D,
    MatMul,
    Add,
    Mul,
    Relu,
    Sigmoid,
    BatchNorm,
    MaxPool2D,
    AvgPool2D,
    Reshape,
    Flatten,
    Softmax,
    Concat,
    /// Scale/zero-point conversion inserted by the quantizer where producer
    /// and consumer scales differ.
    Requantize,
    /// Sentinel for a native operator with no vocabulary mapping. Carries
    /// the native operator name.
    Unsupported(String),
}

impl OpKind {
    pub fn name(&self) -> &str {
        match self {
            OpKind::Conv2D => "Conv2D",
            OpKind::MatMul => "MatMul",
            OpKind::Add => "Add",
            OpKind::Mul => "Mul",
            OpKind::Relu => "Relu",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::BatchNorm => "BatchNorm",
            OpKind::MaxPool2D => "MaxPool2D",
            OpKind::AvgPool2D => "AvgPool2D",
            OpKind::Reshape => "Reshape",
            OpKind::Flatten => "Flatten",
            OpKind::Softmax => "Softmax",
            OpKind::Concat => "Concat",
            OpKind::Requantize => "Requantize",
            OpKind::Unsupported(op) => op,
        }
    }

    /// Stable operator code for the target encoder. `None` for the
    /// unsupported sentinel, which must never reach the encoder.
    pub fn code(&self) -> Option<u16> {
        let code = match self {
            OpKind::Conv2D => 1,
            OpKind::MatMul => 2,
            OpKind::Add => 3,
            OpKind::Mul => 4,
            OpKind::Relu => 5,
            OpKind::Sigmoid => 6,
            OpKind::BatchNorm => 7,
            OpKind::MaxPool2D => 8,
            OpKind::AvgPool2D => 9,
            OpKind::Reshape => 10,
            OpKind::Flatten => 11,
            OpKind::Softmax => 12,
            OpKind::Concat => 13,
            OpKind::Requantize => 14,
            OpKind::Unsupported(_) => return None,
        };
        Some(code)
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, OpKind::Unsupported(_))
    }
}

/// An operator instance with ordered input and output tensor references.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub op: OpKind,
    /// BTreeMap so attribute iteration (and therefore encoding) is
    /// deterministic.
    pub attrs: BTreeMap<String, Attr>,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

impl Node {
    pub fn attr_i64(&self, key: &str) -> Option<i64> {
        match self.attrs.get(key) {
            Some(Attr::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_f32(&self, key: &str) -> Option<f32> {
        match self.attrs.get(key) {
            Some(Attr::Float(v)) => Some(*v),
            Some(Attr::Int(v)) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn attr_ints(&self, key: &str) -> Option<&[i64]> {
        match self.attrs.get(key) {
            Some(Attr::Ints(v)) => Some(v),
            _ => None,
        }
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        match self.attrs.get(key) {
            Some(Attr::Str(v)) => Some(v),
            _ => None,
        }
    }
}

/// The IR graph arena.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    tensors: Vec<Option<Tensor>>,
    /// Declared graph inputs, in signature order.
    pub inputs: Vec<TensorId>,
    /// Declared graph outputs, in signature order.
    pub outputs: Vec<TensorId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tensor(
        &mut self,
        name: Option<String>,
        shape: Vec<usize>,
        elem: ElemType,
        data: Option<Constant>,
    ) -> TensorId {
        let id = TensorId(self.tensors.len() as u32);
        self.tensors.push(Some(Tensor {
            id,
            name,
            shape,
            elem,
            data,
            qparams: None,
        }));
        id
    }

    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        attrs: BTreeMap<String, Attr>,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node {
            id,
            name: name.into(),
            op,
            attrs,
            inputs,
            outputs,
        }));
        id
    }

    pub fn remove_node(&mut self, id: NodeId) {
        self.nodes[id.0 as usize] = None;
    }

    pub fn remove_tensor(&mut self, id: TensorId) {
        self.tensors[id.0 as usize] = None;
    }

    /// Borrow a tensor. Panics on a stale id: passes must never hold ids
    /// across removals they performed themselves.
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        self.tensors[id.0 as usize].as_ref().expect("stale tensor id")
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        self.tensors[id.0 as usize].as_mut().expect("stale tensor id")
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0 as usize].as_ref().expect("stale node id")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0 as usize].as_mut().expect("stale node id")
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.iter().flatten()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.iter().flatten().count()
    }

    /// Look up a tensor id by name.
    pub fn find_tensor(&self, name: &str) -> Option<TensorId> {
        self.tensors()
            .find(|t| t.name.as_deref() == Some(name))
            .map(|t| t.id)
    }

    /// Tensor id → producing node. Graph inputs and weights have none.
    pub fn producers(&self) -> HashMap<TensorId, NodeId> {
        let mut map = HashMap::new();
        for node in self.nodes() {
            for &out in &node.outputs {
                map.insert(out, node.id);
            }
        }
        map
    }

    /// Tensor id → consuming nodes, in ascending node-id order.
    pub fn consumers(&self) -> HashMap<TensorId, Vec<NodeId>> {
        let mut map: HashMap<TensorId, Vec<NodeId>> = HashMap::new();
        for node in self.nodes() {
            for &inp in &node.inputs {
                map.entry(inp).or_default().push(node.id);
            }
        }
        map
    }

    /// Kahn's algorithm with an ascending-id ready queue, so the order is
    /// deterministic for a given graph.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::Internal`] if the graph contains a cycle;
    /// only a buggy rewrite pass can cause that.
    pub fn topo_order(&self) -> Result<Vec<NodeId>> {
        let producers = self.producers();
        let mut pending: HashMap<NodeId, usize> = HashMap::new();
        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();

        for node in self.nodes() {
            let mut deps = 0;
            for &inp in &node.inputs {
                if let Some(&producer) = producers.get(&inp) {
                    deps += 1;
                    dependents.entry(producer).or_default().push(node.id);
                }
            }
            pending.insert(node.id, deps);
        }

        let mut ready: BinaryHeap<Reverse<NodeId>> = pending
            .iter()
            .filter(|(_, &deps)| deps == 0)
            .map(|(&id, _)| Reverse(id))
            .collect();

        let mut order = Vec::with_capacity(pending.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            if let Some(deps) = dependents.get(&id) {
                for &dep in deps {
                    let count = pending.get_mut(&dep).expect("dependent not registered");
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse(dep));
                    }
                }
            }
        }

        if order.len() != self.node_count() {
            return Err(ConvertError::Internal {
                reason: "graph contains a cycle".into(),
            });
        }
        Ok(order)
    }

    /// First node whose operator is the unsupported sentinel, if any.
    pub fn first_unsupported(&self) -> Option<&Node> {
        let mut nodes: Vec<&Node> = self.nodes().filter(|n| n.op.is_unsupported()).collect();
        nodes.sort_by_key(|n| n.id);
        nodes.into_iter().next()
    }

    pub fn has_unsupported(&self) -> bool {
        self.first_unsupported().is_some()
    }

    /// Check structural invariants: id validity, single producer per
    /// tensor, producer-free graph inputs, acyclicity.
    pub fn validate(&self) -> Result<()> {
        let mut produced: HashMap<TensorId, NodeId> = HashMap::new();
        for node in self.nodes() {
            for &id in node.inputs.iter().chain(&node.outputs) {
                if self.tensors.get(id.0 as usize).map(Option::is_none).unwrap_or(true) {
                    return Err(ConvertError::Internal {
                        reason: format!("node '{}' references a removed tensor", node.name),
                    });
                }
            }
            for &out in &node.outputs {
                if let Some(prev) = produced.insert(out, node.id) {
                    return Err(ConvertError::Internal {
                        reason: format!(
                            "tensor '{}' produced by both node {} and node {}",
                            self.tensor(out).label(),
                            prev.0,
                            node.id.0
                        ),
                    });
                }
            }
        }
        for &inp in &self.inputs {
            if produced.contains_key(&inp) {
                return Err(ConvertError::Internal {
                    reason: format!(
                        "graph input '{}' also has a producing node",
                        self.tensor(inp).label()
                    ),
                });
            }
        }
        self.topo_order()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> Graph {
        let mut g = Graph::new();
        let x = g.add_tensor(Some("x".into()), vec![1, 4], ElemType::F32, None);
        let mid = g.add_tensor(Some("mid".into()), vec![1, 4], ElemType::F32, None);
        let y = g.add_tensor(Some("y".into()), vec![1, 4], ElemType::F32, None);
        g.add_node("relu0", OpKind::Relu, BTreeMap::new(), vec![x], vec![mid]);
        g.add_node("sig0", OpKind::Sigmoid, BTreeMap::new(), vec![mid], vec![y]);
        g.inputs.push(x);
        g.outputs.push(y);
        g
    }

    #[test]
    fn test_topo_order_follows_data_deps() {
        let g = two_node_graph();
        let order = g.topo_order().unwrap();
        assert_eq!(order, vec![NodeId(0), NodeId(1)]);
        g.validate().unwrap();
    }

    #[test]
    fn test_cycle_is_internal_error() {
        let mut g = Graph::new();
        let a = g.add_tensor(Some("a".into()), vec![1], ElemType::F32, None);
        let b = g.add_tensor(Some("b".into()), vec![1], ElemType::F32, None);
        g.add_node("n0", OpKind::Relu, BTreeMap::new(), vec![a], vec![b]);
        g.add_node("n1", OpKind::Relu, BTreeMap::new(), vec![b], vec![a]);
        assert!(matches!(
            g.topo_order().unwrap_err(),
            ConvertError::Internal { .. }
        ));
    }

    #[test]
    fn test_remove_node_unlinks_it() {
        let mut g = two_node_graph();
        g.remove_node(NodeId(1));
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.topo_order().unwrap(), vec![NodeId(0)]);
    }

    #[test]
    fn test_unsupported_sentinel_detection() {
        let mut g = two_node_graph();
        let t = g.add_tensor(None, vec![1], ElemType::F32, None);
        let u = g.add_tensor(None, vec![1], ElemType::F32, None);
        g.add_node(
            "mystery",
            OpKind::Unsupported("CustomOp".into()),
            BTreeMap::new(),
            vec![t],
            vec![u],
        );
        let node = g.first_unsupported().unwrap();
        assert_eq!(node.op.name(), "CustomOp");
        assert_eq!(node.op.code(), None);
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let mut g = Graph::new();
        let a = g.add_tensor(None, vec![1], ElemType::F32, None);
        let b = g.add_tensor(None, vec![1], ElemType::F32, None);
        g.add_node("n0", OpKind::Relu, BTreeMap::new(), vec![a], vec![b]);
        g.add_node("n1", OpKind::Sigmoid, BTreeMap::new(), vec![a], vec![b]);
        assert!(matches!(
            g.validate().unwrap_err(),
            ConvertError::Internal { .. }
        ));
    }
}
