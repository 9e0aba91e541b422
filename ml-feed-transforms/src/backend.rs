//! Execution backends that run a built graph

use std::sync::Arc;

use ml_feed_core::{HostMemory, MemoryBackend};
use tracing::trace;

use crate::error::{Error, Result};
use crate::graph::TransformGraph;

/// Runs every node of a built graph for one batch
pub trait ExecutionBackend: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Memory backend graph tensors are allocated from
    fn memory(&self) -> Arc<dyn MemoryBackend>;

    /// Execute the graph synchronously with the nodes' current parameters
    fn execute(&mut self, graph: &mut TransformGraph) -> Result<()>;
}

/// Executes nodes one after another on the calling thread
pub struct HostBackend {
    /// Host allocator shared with the graph
    memory: Arc<dyn MemoryBackend>,
}

impl HostBackend {
    /// Create a backend with its own host allocator
    pub fn new() -> Self {
        Self {
            memory: Arc::new(HostMemory::new()),
        }
    }

    /// Create a backend on an existing allocator
    pub fn with_memory(memory: Arc<dyn MemoryBackend>) -> Self {
        Self { memory }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn memory(&self) -> Arc<dyn MemoryBackend> {
        Arc::clone(&self.memory)
    }

    fn execute(&mut self, graph: &mut TransformGraph) -> Result<()> {
        if !graph.is_built() {
            return Err(Error::NotBuilt);
        }
        for i in 0..graph.execution_order().len() {
            let id = graph.execution_order()[i];
            trace!(node = %id, "executing");
            graph.execute_node(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::BuildContext;
    use crate::nodes::CopyNode;
    use ml_feed_core::{DataType, Layout, TensorInfo, TensorRole};

    #[test]
    fn test_host_backend_runs_chain() {
        let mut backend = HostBackend::new();
        let mut graph = TransformGraph::new(backend.memory());
        let info = TensorInfo::new(vec![1, 2], DataType::UInt8, Layout::Flat).unwrap();
        let input = graph.create_tensor(info.clone(), TensorRole::Loader).unwrap();
        let mid = graph.create_virtual_tensor(info.clone()).unwrap();
        let out = graph.create_tensor(info, TensorRole::Output).unwrap();
        graph.add_loader_node(&[input]).unwrap();
        graph.add_node(CopyNode, &[input], &[mid]).unwrap();
        graph.add_node(CopyNode, &[mid], &[out]).unwrap();

        assert!(matches!(backend.execute(&mut graph), Err(Error::NotBuilt)));
        graph.build(&BuildContext::default()).unwrap();
        graph
            .tensor_mut(input)
            .unwrap()
            .buffer_mut()
            .as_bytes_mut()
            .copy_from_slice(&[7, 8]);
        backend.execute(&mut graph).unwrap();
        assert_eq!(graph.tensor(out).unwrap().buffer().as_bytes(), &[7, 8]);
        assert!(backend.memory().stats().total_allocations >= 3);
    }
}
