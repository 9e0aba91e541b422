//! Transform graph construction, verification and execution
//!
//! Nodes are added in dependency order: every input must already have a
//! producer (the loader or an earlier node) and every output must not.
//! This gives each tensor exactly one producer. The producer table is only
//! written while the graph is being built; `build` verifies the topology,
//! allocates the remaining tensors and freezes the graph.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use ml_feed_core::{MemoryBackend, Tensor, TensorId, TensorInfo, TensorRole};

use crate::error::{Error, Result};
use crate::node::{BuildContext, NodeKind, ParamContext, TransformNode};
use crate::registry::NodeRegistry;

/// Identifier of a node inside one transform graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Placeholder node whose outputs the loader fills by buffer swap
struct LoaderNode;

impl TransformNode for LoaderNode {
    fn kind(&self) -> NodeKind {
        NodeKind::LOADER
    }

    fn execute(&mut self, _inputs: &[&Tensor], _outputs: &mut [&mut Tensor]) -> Result<()> {
        Ok(())
    }
}

struct GraphNode {
    kind: NodeKind,
    node: Box<dyn TransformNode>,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    next: Vec<NodeId>,
    prev: Vec<NodeId>,
}

/// A DAG of transform nodes over a table of tensors
pub struct TransformGraph {
    /// Tensor table indexed by [`TensorId`]; an entry is only vacant while
    /// its producer executes
    tensors: Vec<Option<Tensor>>,

    /// Nodes indexed by [`NodeId`]
    nodes: Vec<GraphNode>,

    /// Producer of every produced tensor
    producers: HashMap<TensorId, NodeId>,

    /// Execution order, fixed by `build`
    order: Vec<NodeId>,

    /// Whether the graph is frozen
    built: bool,

    /// Backend tensors are allocated from
    memory: Arc<dyn MemoryBackend>,
}

impl TransformGraph {
    /// Create an empty graph allocating from `memory`
    pub fn new(memory: Arc<dyn MemoryBackend>) -> Self {
        Self {
            tensors: Vec::new(),
            nodes: Vec::new(),
            producers: HashMap::new(),
            order: Vec::new(),
            built: false,
            memory,
        }
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.built {
            return Err(Error::AlreadyBuilt);
        }
        Ok(())
    }

    /// Declare a tensor. Storage is allocated by `build`.
    pub fn create_tensor(&mut self, info: TensorInfo, role: TensorRole) -> Result<TensorId> {
        self.ensure_mutable()?;
        let id = TensorId(self.tensors.len());
        self.tensors.push(Some(Tensor::new(id, info, role)));
        Ok(id)
    }

    /// Declare a graph-internal tensor
    pub fn create_virtual_tensor(&mut self, info: TensorInfo) -> Result<TensorId> {
        self.create_tensor(info, TensorRole::Intermediate)
    }

    /// Register the loader's output tensors. They need no producer lookup.
    pub fn add_loader_node(&mut self, outputs: &[TensorId]) -> Result<NodeId> {
        self.ensure_mutable()?;
        for &id in outputs {
            if self.tensor(id)?.role() != TensorRole::Loader {
                return Err(Error::InvalidArgument(format!(
                    "{id} is not declared as a loader tensor"
                )));
            }
        }
        self.insert_node(Box::new(LoaderNode), &[], outputs)
    }

    /// Add a node reading `inputs` and producing `outputs`
    pub fn add_node<N: TransformNode + 'static>(
        &mut self,
        node: N,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<NodeId> {
        self.add_boxed_node(Box::new(node), inputs, outputs)
    }

    /// Add an already boxed node
    pub fn add_boxed_node(
        &mut self,
        node: Box<dyn TransformNode>,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<NodeId> {
        self.ensure_mutable()?;
        for &id in outputs {
            if self.tensor(id)?.role() == TensorRole::Loader {
                return Err(Error::InvalidArgument(format!(
                    "{id} is filled by the loader and cannot be a node output"
                )));
            }
        }
        self.insert_node(node, inputs, outputs)
    }

    /// Add a node created by `registry` from a kind name and JSON arguments
    pub fn add_node_by_kind(
        &mut self,
        registry: &NodeRegistry,
        kind: &str,
        args: &serde_json::Value,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<NodeId> {
        let node = registry.create(kind, args)?;
        self.add_boxed_node(node, inputs, outputs)
    }

    fn insert_node(
        &mut self,
        node: Box<dyn TransformNode>,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<NodeId> {
        let kind = node.kind();
        if outputs.is_empty() {
            return Err(Error::InvalidArgument(format!("{kind} node has no outputs")));
        }

        let mut prev = Vec::new();
        for &input in inputs {
            self.tensor(input)?;
            let producer = *self.producers.get(&input).ok_or(Error::DanglingInput {
                node: kind.to_string(),
                tensor: input,
            })?;
            if !prev.contains(&producer) {
                prev.push(producer);
            }
        }
        for (i, &output) in outputs.iter().enumerate() {
            self.tensor(output)?;
            if self.producers.contains_key(&output) || outputs[..i].contains(&output) {
                return Err(Error::AlreadyProduced { tensor: output });
            }
        }

        let id = NodeId(self.nodes.len());
        for &producer in &prev {
            self.nodes[producer.0].next.push(id);
        }
        for &output in outputs {
            self.producers.insert(output, id);
        }
        self.nodes.push(GraphNode {
            kind,
            node,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            next: Vec::new(),
            prev,
        });
        debug!(node = %id, %kind, inputs = inputs.len(), outputs = outputs.len(), "node added");
        Ok(id)
    }

    /// Verify the topology, allocate every tensor, prepare every node and
    /// freeze the graph
    pub fn build(&mut self, ctx: &BuildContext) -> Result<()> {
        self.ensure_mutable()?;

        for tensor in self.tensors.iter().flatten() {
            let produced = self.producers.contains_key(&tensor.id());
            match tensor.role() {
                TensorRole::Output | TensorRole::Loader if !produced => {
                    return Err(Error::Unresolved(tensor.id()));
                }
                TensorRole::Intermediate if !produced => {
                    warn!(tensor = %tensor.id(), "intermediate tensor is never produced");
                }
                _ => {}
            }
        }

        self.order = self.topological_order()?;

        for tensor in self.tensors.iter_mut().flatten() {
            if !tensor.is_allocated() {
                tensor.allocate(self.memory.as_ref())?;
            }
        }

        for &id in &self.order {
            let node = &mut self.nodes[id.0];
            let inputs = tensor_infos(&self.tensors, &node.inputs)?;
            let outputs = tensor_infos(&self.tensors, &node.outputs)?;
            node.node.create(ctx, &inputs, &outputs)?;
        }

        self.built = true;
        info!(
            nodes = self.nodes.len(),
            tensors = self.tensors.len(),
            "transform graph built"
        );
        Ok(())
    }

    fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.prev.len()).collect();
        let mut ready: VecDeque<NodeId> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| NodeId(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for &next in &self.nodes[id.0].next {
                indegree[next.0] -= 1;
                if indegree[next.0] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(Error::Cycle);
        }
        Ok(order)
    }

    /// Whether `build` has completed
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Draw every node's randomized parameters for the next batch
    pub fn renew_parameters(&mut self, rng: &mut StdRng, batch_size: usize) -> Result<()> {
        let mut ctx = ParamContext { rng, batch_size };
        for &id in &self.order {
            self.nodes[id.0].node.update_parameters(&mut ctx)?;
        }
        Ok(())
    }

    /// Execute one node. Outputs inherit the first input's regions of
    /// interest before the node runs. A panic inside the node is resumed
    /// after its output tensors are back in the graph.
    pub fn execute_node(&mut self, id: NodeId) -> Result<()> {
        if !self.built {
            return Err(Error::NotBuilt);
        }
        let node = self.nodes.get_mut(id.0).ok_or(Error::UnknownNode(id.0))?;

        let mut outputs = Vec::with_capacity(node.outputs.len());
        let mut missing = None;
        for &tid in &node.outputs {
            match self.tensors[tid.0].take() {
                Some(tensor) => outputs.push(tensor),
                None => {
                    missing = Some(tid);
                    break;
                }
            }
        }

        let result = match missing {
            Some(tid) => Ok(Err(Error::UnknownTensor(tid))),
            None => panic::catch_unwind(AssertUnwindSafe(|| {
                Self::run_node(node, &self.tensors, &mut outputs)
            })),
        };
        // outputs go back even when the node panicked
        for tensor in outputs {
            let slot = tensor.id().0;
            self.tensors[slot] = Some(tensor);
        }
        result.unwrap_or_else(|payload| panic::resume_unwind(payload))
    }

    fn run_node(
        node: &mut GraphNode,
        tensors: &[Option<Tensor>],
        outputs: &mut [Tensor],
    ) -> Result<()> {
        let inputs = node
            .inputs
            .iter()
            .map(|t| tensors[t.0].as_ref().ok_or(Error::UnknownTensor(*t)))
            .collect::<Result<Vec<_>>>()?;
        if let Some(first) = inputs.first() {
            for output in outputs.iter_mut() {
                output.set_roi(first.roi());
            }
        }
        let mut outputs: Vec<&mut Tensor> = outputs.iter_mut().collect();
        node.node.execute(&inputs, &mut outputs)
    }

    /// Nodes in execution order
    pub fn execution_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Look up a tensor
    pub fn tensor(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(Error::UnknownTensor(id))
    }

    /// Look up a tensor mutably
    pub fn tensor_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(Error::UnknownTensor(id))
    }

    fn tensors_with_role(&self, role: TensorRole) -> Vec<TensorId> {
        self.tensors
            .iter()
            .flatten()
            .filter(|t| t.role() == role)
            .map(Tensor::id)
            .collect()
    }

    /// Tensors the loader fills, in declaration order
    pub fn loader_tensors(&self) -> Vec<TensorId> {
        self.tensors_with_role(TensorRole::Loader)
    }

    /// Tensors handed to the consumer, in declaration order
    pub fn output_tensors(&self) -> Vec<TensorId> {
        self.tensors_with_role(TensorRole::Output)
    }

    /// Producer of a tensor
    pub fn producer(&self, id: TensorId) -> Option<NodeId> {
        self.producers.get(&id).copied()
    }

    /// Kind of a node
    pub fn node_kind(&self, id: NodeId) -> Result<NodeKind> {
        self.nodes
            .get(id.0)
            .map(|n| n.kind)
            .ok_or(Error::UnknownNode(id.0))
    }

    /// Current per-sample parameters of a node
    pub fn node_parameters(&self, id: NodeId) -> Result<&[f32]> {
        self.nodes
            .get(id.0)
            .map(|n| n.node.parameters())
            .ok_or(Error::UnknownNode(id.0))
    }

    /// Nodes reading an output of `id`
    pub fn successors(&self, id: NodeId) -> Result<&[NodeId]> {
        self.nodes
            .get(id.0)
            .map(|n| n.next.as_slice())
            .ok_or(Error::UnknownNode(id.0))
    }

    /// Nodes producing an input of `id`
    pub fn predecessors(&self, id: NodeId) -> Result<&[NodeId]> {
        self.nodes
            .get(id.0)
            .map(|n| n.prev.as_slice())
            .ok_or(Error::UnknownNode(id.0))
    }

    /// Number of nodes, the loader node included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of tensors
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }
}

fn tensor_infos<'a>(tensors: &'a [Option<Tensor>], ids: &[TensorId]) -> Result<Vec<&'a TensorInfo>> {
    ids.iter()
        .map(|t| {
            tensors
                .get(t.0)
                .and_then(Option::as_ref)
                .map(Tensor::info)
                .ok_or(Error::UnknownTensor(*t))
        })
        .collect()
}
