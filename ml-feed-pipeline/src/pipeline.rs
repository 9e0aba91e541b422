//! The consumer-facing pipeline.
//!
//! A [`Pipeline`] is assembled in two phases. While it is a draft, the caller
//! attaches a [`ShardedLoader`], declares tensors and adds transform nodes
//! and metadata stages. [`Pipeline::build`] freezes the graph, allocates the
//! ring buffer and starts the orchestrator thread. From then on the consumer
//! thread calls [`Pipeline::run`] to advance one batch at a time and reads the
//! current batch through [`Pipeline::output_tensors`],
//! [`Pipeline::copy_output`] and the metadata views.

use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use ml_feed_core::{
    BoundingBox, BufferHandle, DataType, Layout, MaskPolygon, MemoryBackend, MetaDataBatch,
    MetaDataKind, Roi, TensorId, TensorInfo, TensorRole,
};
use ml_feed_parallel::ShardedLoader;
use ml_feed_transforms::{
    BuildContext, ExecutionBackend, HostBackend, MetaDataReader, MetaNode, MetadataGraph, NodeId,
    NodeRegistry, ParameterFactory, TransformGraph, TransformNode,
};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::orchestrator::{Orchestrator, Shared};
use crate::ring::{RingBuffer, Slot};
use crate::stats::PipelineStats;

/// Outcome of [`Pipeline::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStatus {
    /// A new batch is available
    Ok,

    /// Every batch has been delivered
    NoMoreData,

    /// The orchestrator is not running
    NotRunning,
}

/// Flattened metadata sizes of the current batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDataSizes {
    /// Labels across all samples
    pub labels: usize,

    /// Bounding boxes across all samples
    pub boxes: usize,

    /// Mask polygon vertices across all samples
    pub mask_vertices: usize,
}

struct Draft {
    graph: TransformGraph,
    backend: Box<dyn ExecutionBackend>,
    loader: Option<(ShardedLoader, TensorId)>,
    meta_reader: Option<Box<dyn MetaDataReader>>,
    meta_graph: MetadataGraph,
}

struct Running {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<Orchestrator>>,
    meta_kinds: Option<Vec<MetaDataKind>>,
}

enum Stage {
    Draft(Box<Draft>),
    Running(Running),
    Released,
}

fn stage_error(stage: &Stage) -> PipelineError {
    let reason = match stage {
        Stage::Draft(_) => "pipeline has not been built",
        Stage::Running(_) => "pipeline is already built",
        Stage::Released => "pipeline has been released",
    };
    PipelineError::InvalidState(reason.into())
}

/// Double-buffered batch pipeline
pub struct Pipeline {
    id: Uuid,
    config: PipelineConfig,
    memory: Arc<dyn MemoryBackend>,
    stage: Stage,
    outputs: Vec<TensorInfo>,
    first_run: bool,
    remaining: usize,
    padded: usize,
    delivered: u64,
}

impl Pipeline {
    /// Create a pipeline executing on the host
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_backend(config, Box::new(HostBackend::new()))
    }

    /// Create a pipeline executing on `backend`
    pub fn with_backend(config: PipelineConfig, backend: Box<dyn ExecutionBackend>) -> Result<Self> {
        config.validate()?;
        let memory = backend.memory();
        let id = Uuid::new_v4();
        info!(
            pipeline_id = %id,
            backend = backend.name(),
            batch_size = config.batch_size,
            "pipeline created"
        );
        Ok(Self {
            id,
            stage: Stage::Draft(Box::new(Draft {
                graph: TransformGraph::new(Arc::clone(&memory)),
                backend,
                loader: None,
                meta_reader: None,
                meta_graph: MetadataGraph::new(),
            })),
            config,
            memory,
            outputs: Vec::new(),
            first_run: true,
            remaining: 0,
            padded: 0,
            delivered: 0,
        })
    }

    /// Identifier used in log events
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pipeline configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Allocator used for graph tensors and ring buffer slots
    pub fn memory(&self) -> Arc<dyn MemoryBackend> {
        Arc::clone(&self.memory)
    }

    fn draft_mut(&mut self) -> Result<&mut Draft> {
        match &mut self.stage {
            Stage::Draft(draft) => Ok(draft.as_mut()),
            other => Err(stage_error(other)),
        }
    }

    fn running(&self) -> Result<&Running> {
        match &self.stage {
            Stage::Running(running) => Ok(running),
            other => Err(stage_error(other)),
        }
    }

    /// Attach the loader and return the tensor it fills, shaped
    /// `[batch, height, width, channels]`
    pub fn set_loader(&mut self, loader: ShardedLoader) -> Result<TensorId> {
        let batch_size = self.config.batch_size;
        let loop_forever = self.config.loop_forever;
        let draft = self.draft_mut()?;
        if draft.loader.is_some() {
            return Err(PipelineError::InvalidState("loader is already set".into()));
        }
        let loader_config = loader.config();
        if loader_config.batch_size != batch_size {
            return Err(PipelineError::Config(format!(
                "loader batch size {} differs from pipeline batch size {batch_size}",
                loader_config.batch_size
            )));
        }
        if loader_config.loop_forever != loop_forever {
            return Err(PipelineError::Config(
                "loader and pipeline disagree on looping".into(),
            ));
        }

        let target = loader_config.target;
        let info = TensorInfo::new(
            vec![
                batch_size,
                target.height as usize,
                target.width as usize,
                target.channels as usize,
            ],
            DataType::UInt8,
            Layout::Nhwc,
        )?
        .with_memory_space(loader_config.memory_space);
        let id = draft.graph.create_tensor(info, TensorRole::Loader)?;
        draft.graph.add_loader_node(&[id])?;
        draft.loader = Some((loader, id));
        Ok(id)
    }

    /// Declare a tensor
    pub fn create_tensor(&mut self, info: TensorInfo, role: TensorRole) -> Result<TensorId> {
        Ok(self.draft_mut()?.graph.create_tensor(info, role)?)
    }

    /// Declare a tensor handed to the consumer, placed in the configured
    /// output memory space
    pub fn create_output_tensor(&mut self, info: TensorInfo) -> Result<TensorId> {
        let info = info.with_memory_space(self.config.output_memory_space);
        self.create_tensor(info, TensorRole::Output)
    }

    /// Declare an intermediate tensor between two nodes
    pub fn create_virtual_tensor(&mut self, info: TensorInfo) -> Result<TensorId> {
        Ok(self.draft_mut()?.graph.create_virtual_tensor(info)?)
    }

    /// Add a transform node
    pub fn add_node<N: TransformNode + 'static>(
        &mut self,
        node: N,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<NodeId> {
        Ok(self.draft_mut()?.graph.add_node(node, inputs, outputs)?)
    }

    /// Add a transform node created by `registry` from a kind name
    pub fn add_node_by_kind(
        &mut self,
        registry: &NodeRegistry,
        kind: &str,
        args: &serde_json::Value,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<NodeId> {
        Ok(self
            .draft_mut()?
            .graph
            .add_node_by_kind(registry, kind, args, inputs, outputs)?)
    }

    /// Attach the source of per-sample annotations
    pub fn set_metadata_reader<R: MetaDataReader + 'static>(&mut self, reader: R) -> Result<()> {
        self.draft_mut()?.meta_reader = Some(Box::new(reader));
        Ok(())
    }

    /// Add a metadata stage, optionally reading the parameters of the
    /// transform node `source`
    pub fn add_meta_node<N: MetaNode + 'static>(
        &mut self,
        node: N,
        source: Option<NodeId>,
    ) -> Result<usize> {
        Ok(self.draft_mut()?.meta_graph.add_node(node, source))
    }

    /// Freeze the graph, allocate the ring buffer and start the orchestrator
    pub fn build(&mut self) -> Result<()> {
        let config = self.config.clone();
        let memory = Arc::clone(&self.memory);
        let draft = self.draft_mut()?;
        let shard_count = match &draft.loader {
            Some((loader, _)) => loader.shard_count(),
            None => return Err(PipelineError::InvalidState("build needs a loader".into())),
        };
        let cpu_threads = config.resolved_cpu_threads(shard_count);
        draft.graph.build(&BuildContext {
            batch_size: config.batch_size,
            cpu_threads,
        })?;

        let output_ids = draft.graph.output_tensors();
        if output_ids.is_empty() {
            return Err(PipelineError::Config("graph has no output tensors".into()));
        }
        let outputs = output_ids
            .iter()
            .map(|&id| draft.graph.tensor(id).map(|t| t.info().clone()))
            .collect::<ml_feed_transforms::Result<Vec<_>>>()?;
        let ring = RingBuffer::new(config.prefetch_depth, &outputs, memory.as_ref())?;
        if let Some((loader, _)) = &mut draft.loader {
            loader.start()?;
        }

        let Stage::Draft(draft) = std::mem::replace(&mut self.stage, Stage::Released) else {
            return Err(PipelineError::InvalidState("pipeline is not a draft".into()));
        };
        let Draft {
            graph,
            backend,
            loader,
            meta_reader,
            meta_graph,
        } = *draft;
        let Some((loader, loader_tensor)) = loader else {
            return Err(PipelineError::InvalidState("build needs a loader".into()));
        };

        self.remaining = loader.remaining_count();
        self.padded = loader.last_batch_padded_size();
        self.first_run = true;
        self.outputs = outputs;
        let meta_kinds = meta_reader.as_ref().map(|r| r.kinds().to_vec());

        let orchestrator = Orchestrator {
            pipeline_id: self.id,
            graph,
            backend,
            loader,
            loader_tensor,
            outputs: output_ids,
            meta_reader,
            meta_graph,
            params: ParameterFactory::new(config.seed),
            batch_size: config.batch_size,
            idle: config.idle_poll_interval(),
        };
        let shared = Arc::new(Shared::new(ring));
        let handle = orchestrator.spawn(Arc::clone(&shared))?;
        self.stage = Stage::Running(Running {
            shared,
            handle: Some(handle),
            meta_kinds,
        });
        info!(
            pipeline_id = %self.id,
            outputs = self.outputs.len(),
            slots = config.prefetch_depth,
            cpu_threads,
            remaining = self.remaining,
            "pipeline built"
        );
        Ok(())
    }

    /// Whether the orchestrator thread is producing batches
    pub fn is_running(&self) -> bool {
        self.running()
            .is_ok_and(|running| running.shared.processing.load(Ordering::SeqCst))
    }

    /// Advance to the next batch. The batch delivered by the previous call is
    /// given back to the orchestrator first.
    pub fn run(&mut self) -> Result<RunStatus> {
        let shared = Arc::clone(&self.running()?.shared);
        if let Some(reason) = shared.fatal_reason()? {
            return Err(PipelineError::Terminated(reason));
        }
        if !shared.processing.load(Ordering::SeqCst) {
            return Ok(RunStatus::NotRunning);
        }
        if shared.no_more_processed_data()? {
            return Ok(RunStatus::NoMoreData);
        }

        shared.ring.block_if_empty()?;
        if self.first_run {
            self.first_run = false;
        } else {
            shared.ring.pop()?;
        }

        if !shared.ring.block_if_empty()? {
            if let Some(reason) = shared.fatal_reason()? {
                return Err(PipelineError::Terminated(reason));
            }
            return Ok(RunStatus::NoMoreData);
        }
        let samples = shared
            .ring
            .get_read_slot()?
            .map_or(0, |slot| slot.sample_count);
        if !self.config.loop_forever {
            self.remaining = self.remaining.saturating_sub(samples);
        }
        self.delivered += 1;
        Ok(RunStatus::Ok)
    }

    /// The batch delivered by the last successful [`Pipeline::run`]
    pub fn output_tensors(&self) -> Result<OutputBatch<'_>> {
        let shared = &self.running()?.shared;
        if self.first_run {
            return Err(PipelineError::InvalidState(
                "no batch delivered yet; call run() first".into(),
            ));
        }
        match shared.ring.get_read_slot()? {
            Some(slot) => Ok(OutputBatch {
                slot,
                infos: &self.outputs,
            }),
            None => match shared.fatal_reason()? {
                Some(reason) => Err(PipelineError::Terminated(reason)),
                None => Err(PipelineError::InvalidState("no batch available".into())),
            },
        }
    }

    /// Copy every output tensor of the current batch into `dst`, one after
    /// another in declaration order. Returns the number of bytes written.
    pub fn copy_output(&self, dst: &mut [u8]) -> Result<usize> {
        let batch = self.output_tensors()?;
        let total: usize = batch.slot.buffers.iter().map(BufferHandle::len).sum();
        if dst.len() < total {
            return Err(ml_feed_core::Error::SizeMismatch {
                expected: total,
                actual: dst.len(),
            }
            .into());
        }
        let mut offset = 0;
        for buffer in &batch.slot.buffers {
            dst[offset..offset + buffer.len()].copy_from_slice(buffer.as_bytes());
            offset += buffer.len();
        }
        Ok(total)
    }

    fn require_metadata(&self) -> Result<()> {
        match &self.running()?.meta_kinds {
            Some(_) => Ok(()),
            None => Err(PipelineError::InvalidState(
                "no metadata reader was attached".into(),
            )),
        }
    }

    /// Annotation kinds the attached metadata reader provides
    pub fn meta_data_kinds(&self) -> Result<&[MetaDataKind]> {
        Ok(self.running()?.meta_kinds.as_deref().unwrap_or_default())
    }

    /// Metadata of the current batch, one entry per sample
    pub fn meta_data(&self) -> Result<MetaDataBatch> {
        Ok(self.output_tensors()?.meta().clone())
    }

    /// Labels of the current batch, per sample
    pub fn labels_meta_data(&self) -> Result<Vec<Vec<i32>>> {
        self.require_metadata()?;
        let batch = self.output_tensors()?;
        Ok(batch.meta().labels().into_iter().map(<[i32]>::to_vec).collect())
    }

    /// Bounding boxes of the current batch, per sample
    pub fn bbox_meta_data(&self) -> Result<Vec<Vec<BoundingBox>>> {
        self.require_metadata()?;
        let batch = self.output_tensors()?;
        Ok(batch
            .meta()
            .boxes()
            .into_iter()
            .map(<[BoundingBox]>::to_vec)
            .collect())
    }

    /// Mask polygons of the current batch, per sample
    pub fn mask_meta_data(&self) -> Result<Vec<Vec<MaskPolygon>>> {
        self.require_metadata()?;
        let batch = self.output_tensors()?;
        Ok(batch
            .meta()
            .masks()
            .into_iter()
            .map(<[MaskPolygon]>::to_vec)
            .collect())
    }

    /// Flattened metadata sizes of the current batch
    pub fn meta_data_sizes(&self) -> Result<MetaDataSizes> {
        self.require_metadata()?;
        let batch = self.output_tensors()?;
        let meta = batch.meta();
        Ok(MetaDataSizes {
            labels: meta.label_count(),
            boxes: meta.box_count(),
            mask_vertices: meta.mask_vertex_count(),
        })
    }

    /// Copy the current batch's labels, flattened, into `dst`
    pub fn copy_labels(&self, dst: &mut [i32]) -> Result<usize> {
        self.require_metadata()?;
        Ok(self.output_tensors()?.meta().copy_labels(dst)?)
    }

    /// Copy the current batch's boxes as flattened `l, t, r, b` into `dst`
    pub fn copy_boxes(&self, dst: &mut [f32]) -> Result<usize> {
        self.require_metadata()?;
        Ok(self.output_tensors()?.meta().copy_boxes(dst)?)
    }

    /// Stop the orchestrator, drop every processed batch, rewind every shard
    /// and start again from the beginning
    pub fn reset(&mut self) -> Result<()> {
        let running = match &mut self.stage {
            Stage::Running(running) => running,
            other => return Err(stage_error(other)),
        };
        let shared = Arc::clone(&running.shared);
        shared.processing.store(false, Ordering::SeqCst);
        shared.ring.unblock_writer()?;
        shared.ring.unblock_reader()?;

        let handle = running.handle.take().ok_or_else(|| {
            PipelineError::InvalidState("orchestrator thread is gone".into())
        })?;
        let mut orchestrator = handle
            .join()
            .map_err(|_| PipelineError::Terminated("orchestrator thread panicked".into()))?;

        shared.ring.reset()?;
        orchestrator.loader.reset()?;
        orchestrator.params.reseed();
        shared.rearm()?;

        self.first_run = true;
        self.remaining = orchestrator.loader.remaining_count();
        running.handle = Some(orchestrator.spawn(Arc::clone(&shared))?);
        info!(pipeline_id = %self.id, remaining = self.remaining, "pipeline reset");
        Ok(())
    }

    /// Samples not yet delivered to the consumer
    pub fn remaining_count(&self) -> Result<usize> {
        self.running()?;
        Ok(self.remaining)
    }

    /// Sum over shards of the padding in each shard's final batch
    pub fn last_batch_padded_size(&self) -> Result<usize> {
        self.running()?;
        Ok(self.padded)
    }

    /// Snapshot of the pipeline's counters
    pub fn stats(&self) -> Result<PipelineStats> {
        let shared = &self.running()?.shared;
        let mut stats = shared.counters.lock()?.clone();
        let (reader_wait, writer_wait) = shared.ring.wait_times()?;
        stats.reader_wait = reader_wait;
        stats.writer_wait = writer_wait;
        stats.batches_delivered = self.delivered;
        stats.memory = self.memory.stats();
        Ok(stats)
    }

    /// Stop every thread and free every buffer. Later calls report an
    /// invalid state.
    pub fn release(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.stage, Stage::Released) {
            Stage::Released => Err(stage_error(&Stage::Released)),
            Stage::Draft(draft) => {
                drop(draft);
                info!(pipeline_id = %self.id, "pipeline released before build");
                Ok(())
            }
            Stage::Running(mut running) => {
                let shared = running.shared;
                shared.processing.store(false, Ordering::SeqCst);
                shared.ring.release_all_blocked_calls()?;
                if let Some(handle) = running.handle.take() {
                    match handle.join() {
                        Ok(mut orchestrator) => orchestrator.loader.stop()?,
                        Err(_) => warn!(pipeline_id = %self.id, "orchestrator thread panicked"),
                    }
                }
                for buffer in shared.ring.take_buffers()? {
                    self.memory.release(buffer);
                }
                info!(
                    pipeline_id = %self.id,
                    delivered = self.delivered,
                    "pipeline released"
                );
                Ok(())
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if matches!(self.stage, Stage::Released) {
            return;
        }
        if let Err(e) = self.release() {
            warn!(pipeline_id = %self.id, error = %e, "failed to release pipeline");
        }
    }
}

/// Read access to the batch the consumer currently holds
pub struct OutputBatch<'a> {
    slot: MutexGuard<'a, Slot>,
    infos: &'a [TensorInfo],
}

impl OutputBatch<'_> {
    fn check(&self, index: usize) -> Result<()> {
        if index >= self.infos.len() {
            return Err(ml_feed_core::Error::IndexOutOfBounds {
                index,
                len: self.infos.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Number of output tensors
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether the graph has no output tensors
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Real samples in the batch; short only for a partial final batch
    pub fn sample_count(&self) -> usize {
        self.slot.sample_count
    }

    /// Sample names, in slot order
    pub fn names(&self) -> &[String] {
        &self.slot.names
    }

    /// Shape and type of output tensor `index`
    pub fn info(&self, index: usize) -> Result<&TensorInfo> {
        self.check(index)?;
        Ok(&self.infos[index])
    }

    /// Storage of output tensor `index`
    pub fn buffer(&self, index: usize) -> Result<&BufferHandle> {
        self.check(index)?;
        Ok(&self.slot.buffers[index])
    }

    /// Bytes of output tensor `index`
    pub fn as_bytes(&self, index: usize) -> Result<&[u8]> {
        Ok(self.buffer(index)?.as_bytes())
    }

    /// Bytes of sample `sample` within output tensor `index`
    pub fn sample_bytes(&self, index: usize, sample: usize) -> Result<&[u8]> {
        let info = self.info(index)?;
        if sample >= info.batch_size() {
            return Err(ml_feed_core::Error::IndexOutOfBounds {
                index: sample,
                len: info.batch_size(),
            }
            .into());
        }
        let size = info.sample_size();
        Ok(&self.as_bytes(index)?[sample * size..(sample + 1) * size])
    }

    /// Per-sample regions of interest of output tensor `index`
    pub fn roi(&self, index: usize) -> Result<&[Roi]> {
        self.check(index)?;
        Ok(&self.slot.rois[index])
    }

    /// Metadata aligned with the samples
    pub fn meta(&self) -> &MetaDataBatch {
        &self.slot.meta
    }
}
