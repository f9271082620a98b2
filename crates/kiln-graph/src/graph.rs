//! The graph container.
//!
//! [`Graph`] owns every node. Edges are stored on the consumer side as
//! [`OutputRef`]s, so an output may fan out to any number of consumer inputs.

use crate::error::{GraphError, Result};
use crate::infer::infer_outputs;
use crate::node::{
    ConstantData, InputRef, Node, NodeId, OpKind, OutputRef, RuntimeInfo, TensorDesc,
};
use crate::shape::PartialShape;
use kiln_common::ElementType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A mutable directed graph of typed operation nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    name: String,
    nodes: BTreeMap<NodeId, Node>,
    next_id: u64,
    parameters: Vec<NodeId>,
    results: Vec<NodeId>,
    variables: Vec<String>,
}

/// Position-based view of one node, independent of node ids.
///
/// Two graphs are structurally identical when their canonical forms match.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalNode {
    pub name: String,
    pub op: OpKind,
    /// `(producer position, output port)` per input.
    pub inputs: Vec<(usize, usize)>,
    pub outputs: Vec<TensorDesc>,
    pub rt: RuntimeInfo,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: BTreeMap::new(),
            next_id: 0,
            parameters: Vec::new(),
            results: Vec::new(),
            variables: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Construction ────────────────────────────────────────────────────────

    /// Add a node computing `op` over `inputs`; outputs are inferred.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        inputs: Vec<OutputRef>,
    ) -> Result<NodeId> {
        let name = name.into();
        let id = NodeId(self.next_id);
        let descs = self.input_descs(id, &inputs)?;
        let outputs = infer_outputs(&op, &descs)
            .map_err(|reason| GraphError::TypeMismatch { node: id, name: name.clone(), reason })?;
        self.next_id += 1;
        match op {
            OpKind::Parameter { .. } => self.parameters.push(id),
            OpKind::Result => self.results.push(id),
            _ => {}
        }
        self.nodes.insert(id, Node { id, name, op, inputs, outputs, rt: RuntimeInfo::default() });
        Ok(id)
    }

    pub fn add_parameter(
        &mut self,
        name: impl Into<String>,
        element_type: ElementType,
        shape: PartialShape,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.parameters.push(id);
        let outputs = vec![TensorDesc::new(element_type, shape.clone())];
        let op = OpKind::Parameter { element_type, shape };
        self.nodes.insert(
            id,
            Node { id, name: name.into(), op, inputs: Vec::new(), outputs, rt: RuntimeInfo::default() },
        );
        id
    }

    /// Add a constant. `values` must hold one value or one per element.
    pub fn add_constant(
        &mut self,
        name: impl Into<String>,
        element_type: ElementType,
        shape: &[usize],
        values: Vec<f64>,
    ) -> Result<NodeId> {
        let data = ConstantData { element_type, shape: shape.to_vec(), values };
        let count = data.element_count();
        if data.values.len() != 1 && data.values.len() != count {
            return Err(GraphError::InvalidConstant(format!(
                "{} values for shape {:?} ({count} elements)",
                data.values.len(),
                data.shape
            )));
        }
        self.add_node(name, OpKind::Constant(data), Vec::new())
    }

    /// Add a scalar constant.
    pub fn add_scalar(
        &mut self,
        name: impl Into<String>,
        element_type: ElementType,
        value: f64,
    ) -> Result<NodeId> {
        self.add_constant(name, element_type, &[], vec![value])
    }

    pub fn add_result(&mut self, name: impl Into<String>, source: OutputRef) -> Result<NodeId> {
        self.add_node(name, OpKind::Result, vec![source])
    }

    /// Register a state variable (the model becomes stateful).
    pub fn add_variable(&mut self, variable: impl Into<String>) {
        let variable = variable.into();
        if !self.variables.contains(&variable) {
            self.variables.push(variable);
        }
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    fn require(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))
    }

    fn require_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of nodes whose operation has the given type name.
    pub fn count_op(&self, name: &str) -> usize {
        self.nodes.values().filter(|n| n.op.name() == name).count()
    }

    pub fn parameters(&self) -> &[NodeId] {
        &self.parameters
    }

    pub fn results(&self) -> &[NodeId] {
        &self.results
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn is_stateful(&self) -> bool {
        !self.variables.is_empty()
    }

    pub fn output_desc(&self, output: OutputRef) -> Option<&TensorDesc> {
        self.nodes.get(&output.node)?.outputs.get(output.port)
    }

    /// Producer feeding `input`.
    pub fn producer(&self, input: InputRef) -> Option<OutputRef> {
        self.nodes.get(&input.node)?.inputs.get(input.port).copied()
    }

    /// Descriptor arriving at `input`.
    pub fn input_desc(&self, input: InputRef) -> Option<&TensorDesc> {
        self.output_desc(self.producer(input)?)
    }

    /// Consumer inputs fed by `output`, ordered by consumer id then port.
    pub fn consumers(&self, output: OutputRef) -> Vec<InputRef> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.inputs
                    .iter()
                    .enumerate()
                    .filter(move |(_, src)| **src == output)
                    .map(move |(port, _)| InputRef::new(node.id, port))
            })
            .collect()
    }

    /// Consumer inputs across every output of `id`.
    pub fn all_consumers(&self, id: NodeId) -> Vec<InputRef> {
        self.nodes
            .values()
            .flat_map(|node| {
                node.inputs
                    .iter()
                    .enumerate()
                    .filter(move |(_, src)| src.node == id)
                    .map(move |(port, _)| InputRef::new(node.id, port))
            })
            .collect()
    }

    /// Distinct consumer nodes of output `port` of `id`, in id order.
    pub fn consumer_nodes(&self, output: OutputRef) -> Vec<NodeId> {
        let set: BTreeSet<NodeId> = self.consumers(output).into_iter().map(|i| i.node).collect();
        set.into_iter().collect()
    }

    fn input_descs(&self, consumer: NodeId, inputs: &[OutputRef]) -> Result<Vec<TensorDesc>> {
        inputs
            .iter()
            .enumerate()
            .map(|(port, src)| {
                self.output_desc(*src).cloned().ok_or(GraphError::DanglingEdge {
                    node: consumer,
                    port,
                    source_ref: *src,
                })
            })
            .collect()
    }

    // ── Mutation ────────────────────────────────────────────────────────────

    /// Point `input` at `source`.
    pub fn set_input(&mut self, input: InputRef, source: OutputRef) -> Result<()> {
        if self.output_desc(source).is_none() {
            return Err(GraphError::DanglingEdge {
                node: input.node,
                port: input.port,
                source_ref: source,
            });
        }
        let node = self.require_mut(input.node)?;
        let slot = node
            .inputs
            .get_mut(input.port)
            .ok_or(GraphError::PortOutOfRange { node: input.node, port: input.port })?;
        *slot = source;
        Ok(())
    }

    /// Redirect every consumer of `old` to `new`, except `new`'s own node.
    ///
    /// Returns the number of redirected inputs.
    pub fn replace_output_uses(&mut self, old: OutputRef, new: OutputRef) -> Result<usize> {
        if self.output_desc(new).is_none() {
            return Err(GraphError::NodeNotFound(new.node));
        }
        let mut redirected = 0;
        for node in self.nodes.values_mut() {
            if node.id == new.node {
                continue;
            }
            for src in &mut node.inputs {
                if *src == old {
                    *src = new;
                    redirected += 1;
                }
            }
        }
        Ok(redirected)
    }

    /// Insert a new node on the edge arriving at `input`.
    ///
    /// The new node takes the current producer as its only input and `input`
    /// is re-pointed at the new node's output 0.
    pub fn insert_before(
        &mut self,
        input: InputRef,
        name: impl Into<String>,
        op: OpKind,
    ) -> Result<NodeId> {
        let source = self
            .producer(input)
            .ok_or(GraphError::PortOutOfRange { node: input.node, port: input.port })?;
        let id = self.add_node(name, op, vec![source])?;
        self.set_input(input, OutputRef::new(id, 0))?;
        Ok(id)
    }

    /// Make `new` take over every consumer of `old`, port by port, then remove
    /// `old`. The friendly name is left untouched.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        let ports = self.require(old)?.outputs.len();
        self.require(new)?;
        for port in 0..ports {
            self.replace_output_uses(OutputRef::new(old, port), OutputRef::new(new, port))?;
        }
        if let Some(pos) = self.results.iter().position(|&r| r == old) {
            self.results[pos] = new;
        }
        if self.all_consumers(old).is_empty() {
            self.remove_node(old)?;
        }
        Ok(())
    }

    /// Remove a node that nothing consumes.
    ///
    /// Every `NodeId` for the removed node stops resolving.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node> {
        let consumers = self.all_consumers(id).len();
        if consumers > 0 {
            return Err(GraphError::NodeInUse { node: id, consumers });
        }
        let node = self.nodes.remove(&id).ok_or(GraphError::NodeNotFound(id))?;
        self.parameters.retain(|&p| p != id);
        self.results.retain(|&r| r != id);
        Ok(node)
    }

    /// Remove nodes whose outputs reach no sink. Parameters are kept.
    pub fn remove_dead_nodes(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let dead: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| !n.op.is_sink() && !matches!(n.op, OpKind::Parameter { .. }))
                .filter(|n| self.all_consumers(n.id).is_empty())
                .map(|n| n.id)
                .collect();
            if dead.is_empty() {
                break;
            }
            for id in dead {
                self.nodes.remove(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(graph = %self.name, removed, "removed dead nodes");
        }
        removed
    }

    /// Recompute the outputs of `id` from its attributes and inputs.
    pub fn refresh(&mut self, id: NodeId) -> Result<()> {
        let node = self.require(id)?;
        let descs = self.input_descs(id, &node.inputs)?;
        let outputs = infer_outputs(&node.op, &descs).map_err(|reason| GraphError::TypeMismatch {
            node: id,
            name: node.name.clone(),
            reason,
        })?;
        self.require_mut(id)?.outputs = outputs;
        Ok(())
    }

    /// Recompute every node's outputs in topological order.
    pub fn infer_types(&mut self) -> Result<()> {
        for id in self.topological_order()? {
            self.refresh(id)?;
        }
        Ok(())
    }

    // ── Ordering and validation ─────────────────────────────────────────────

    /// Producers before consumers; ties broken by smallest id.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut pending: BTreeMap<NodeId, usize> = BTreeMap::new();
        let mut users: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for node in self.nodes.values() {
            let mut deps = BTreeSet::new();
            for (port, src) in node.inputs.iter().enumerate() {
                if !self.nodes.contains_key(&src.node) {
                    return Err(GraphError::DanglingEdge { node: node.id, port, source_ref: *src });
                }
                deps.insert(src.node);
            }
            pending.insert(node.id, deps.len());
            for dep in deps {
                users.entry(dep).or_default().push(node.id);
            }
        }
        let mut ready: BTreeSet<NodeId> =
            pending.iter().filter(|(_, n)| **n == 0).map(|(id, _)| *id).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for user in users.get(&id).map(Vec::as_slice).unwrap_or_default() {
                if let Some(n) = pending.get_mut(user) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*user);
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = pending
                .iter()
                .find(|(_, n)| **n > 0)
                .map(|(id, _)| *id)
                .unwrap_or(NodeId(0));
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Check edges, acyclicity and that every stored output matches what the
    /// node's inputs imply.
    pub fn validate(&self) -> Result<()> {
        for id in self.topological_order()? {
            let node = self.require(id)?;
            let descs = self.input_descs(id, &node.inputs)?;
            let inferred =
                infer_outputs(&node.op, &descs).map_err(|reason| GraphError::TypeMismatch {
                    node: id,
                    name: node.name.clone(),
                    reason,
                })?;
            if inferred.len() != node.outputs.len() {
                return Err(GraphError::TypeMismatch {
                    node: id,
                    name: node.name.clone(),
                    reason: format!(
                        "declares {} outputs but computes {}",
                        node.outputs.len(),
                        inferred.len()
                    ),
                });
            }
            for (port, (declared, computed)) in node.outputs.iter().zip(inferred).enumerate() {
                if *declared != computed {
                    return Err(GraphError::StaleOutput {
                        node: id,
                        name: node.name.clone(),
                        port,
                        declared: declared.clone(),
                        inferred: computed,
                    });
                }
            }
        }
        Ok(())
    }

    /// Id-independent structural description, in topological order.
    pub fn canonical_form(&self) -> Result<Vec<CanonicalNode>> {
        let order = self.topological_order()?;
        let position: BTreeMap<NodeId, usize> =
            order.iter().enumerate().map(|(pos, id)| (*id, pos)).collect();
        order
            .iter()
            .map(|id| {
                let node = self.require(*id)?;
                let inputs = node
                    .inputs
                    .iter()
                    .map(|src| {
                        position
                            .get(&src.node)
                            .map(|pos| (*pos, src.port))
                            .ok_or(GraphError::NodeNotFound(src.node))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(CanonicalNode {
                    name: node.name.clone(),
                    op: node.op.clone(),
                    inputs,
                    outputs: node.outputs.clone(),
                    rt: node.rt.clone(),
                })
            })
            .collect()
    }

    /// Every element type appearing on any output.
    pub fn element_types(&self) -> BTreeSet<ElementType> {
        self.nodes.values().flat_map(|n| n.outputs.iter().map(|d| d.element_type)).collect()
    }
}
