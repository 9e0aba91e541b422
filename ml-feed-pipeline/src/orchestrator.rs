//! The output routine: loads, transforms and publishes batches on its own
//! thread until told to stop or until something fails

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ml_feed_core::{MetaDataBatch, SampleMeta, TensorId};
use ml_feed_parallel::{LoadStatus, ShardedLoader};
use ml_feed_transforms::{ExecutionBackend, MetaDataReader, MetadataGraph, ParameterFactory, TransformGraph};

use crate::error::{PipelineError, Result};
use crate::ring::RingBuffer;
use crate::stats::PipelineStats;

/// State shared between the orchestrator thread and the consumer
pub(crate) struct Shared {
    pub(crate) ring: RingBuffer,
    pub(crate) processing: AtomicBool,
    pub(crate) finished: AtomicBool,
    pub(crate) fatal: Mutex<Option<String>>,
    pub(crate) counters: Mutex<PipelineStats>,
}

impl Shared {
    pub(crate) fn new(ring: RingBuffer) -> Self {
        Self {
            ring,
            processing: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            fatal: Mutex::new(None),
            counters: Mutex::new(PipelineStats::default()),
        }
    }

    /// Why the orchestrator died, if it did
    pub(crate) fn fatal_reason(&self) -> Result<Option<String>> {
        Ok(self.fatal.lock()?.clone())
    }

    /// The loader is drained and every processed batch has been consumed
    pub(crate) fn no_more_processed_data(&self) -> Result<bool> {
        Ok(self.finished.load(Ordering::SeqCst) && self.ring.is_empty()?)
    }

    /// Clear per-epoch flags before the orchestrator restarts
    pub(crate) fn rearm(&self) -> Result<()> {
        self.finished.store(false, Ordering::SeqCst);
        *self.fatal.lock()? = None;
        Ok(())
    }

    fn terminate(&self, reason: &str) {
        error!(error = reason, "orchestrator stopped on a fatal error");
        match self.fatal.lock() {
            Ok(mut fatal) => {
                fatal.get_or_insert_with(|| reason.to_owned());
            }
            Err(e) => warn!(error = %e, "could not record fatal error"),
        }
        self.processing.store(false, Ordering::SeqCst);
        if let Err(e) = self.ring.release_all_blocked_calls() {
            warn!(error = %e, "could not release blocked ring buffer calls");
        }
    }
}

enum Step {
    Produced,
    Idle,
    Released,
}

/// Everything the output routine owns while it runs
pub(crate) struct Orchestrator {
    pub(crate) pipeline_id: Uuid,
    pub(crate) graph: TransformGraph,
    pub(crate) backend: Box<dyn ExecutionBackend>,
    pub(crate) loader: ShardedLoader,
    pub(crate) loader_tensor: TensorId,
    pub(crate) outputs: Vec<TensorId>,
    pub(crate) meta_reader: Option<Box<dyn MetaDataReader>>,
    pub(crate) meta_graph: MetadataGraph,
    pub(crate) params: ParameterFactory,
    pub(crate) batch_size: usize,
    pub(crate) idle: Duration,
}

impl Orchestrator {
    /// Move onto a fresh thread and start producing batches
    pub(crate) fn spawn(self, shared: Arc<Shared>) -> Result<JoinHandle<Orchestrator>> {
        shared.processing.store(true, Ordering::SeqCst);
        let thread_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("ml-feed-orchestrator".into())
            .spawn(move || self.output_routine(&thread_shared))
            .map_err(|e| {
                shared.processing.store(false, Ordering::SeqCst);
                PipelineError::Spawn(e)
            })
    }

    fn output_routine(mut self, shared: &Shared) -> Self {
        info!(
            pipeline_id = %self.pipeline_id,
            remaining = self.loader.remaining_count(),
            "output routine started"
        );
        while shared.processing.load(Ordering::SeqCst) {
            match panic::catch_unwind(AssertUnwindSafe(|| self.step(shared))) {
                Ok(Ok(Step::Produced | Step::Released)) => {}
                Ok(Ok(Step::Idle)) => thread::sleep(self.idle),
                Ok(Err(e)) => {
                    shared.terminate(&e.to_string());
                    break;
                }
                Err(payload) => {
                    shared.terminate(&panic_message(payload.as_ref()));
                    break;
                }
            }
        }
        info!(pipeline_id = %self.pipeline_id, "output routine stopped");
        self
    }

    fn step(&mut self, shared: &Shared) -> Result<Step> {
        if !self.loader.has_batch() {
            if !shared.finished.swap(true, Ordering::SeqCst) {
                info!(pipeline_id = %self.pipeline_id, "loader drained");
            }
            shared.ring.release_if_empty()?;
            return Ok(Step::Idle);
        }

        let Some(mut slot) = shared.ring.get_write_slot()? else {
            return Ok(Step::Released);
        };
        if !shared.processing.load(Ordering::SeqCst) {
            return Ok(Step::Released);
        }

        let start = Instant::now();
        let tensor = self.graph.tensor_mut(self.loader_tensor)?;
        if self.loader.load_next(tensor)? == LoadStatus::NoMoreData {
            return Ok(Step::Idle);
        }
        let load_time = start.elapsed();
        let batch = self
            .loader
            .last_batch()
            .cloned()
            .ok_or_else(|| PipelineError::InvalidState("loaded batch has no bookkeeping".into()))?;

        let start = Instant::now();
        let mut meta = match &self.meta_reader {
            Some(reader) => reader.lookup(&batch.names),
            None => MetaDataBatch::from_parts(
                vec![SampleMeta::default(); batch.names.len()],
                batch.names.clone(),
            )?,
        };
        let decoded: Vec<(u32, u32)> = batch.decoded.iter().map(|d| d.decoded_size).collect();
        MetadataGraph::rescale(&mut meta, &decoded)?;

        self.graph
            .renew_parameters(self.params.rng(), self.batch_size)?;
        self.backend.execute(&mut self.graph)?;

        for (i, &id) in self.outputs.iter().enumerate() {
            let tensor = self.graph.tensor_mut(id)?;
            tensor.swap_buffer(&mut slot.buffers[i]);
            slot.rois[i].clear();
            slot.rois[i].extend_from_slice(tensor.roi());
        }
        self.meta_graph.process(&meta, &mut slot.meta, &self.graph)?;
        let samples = batch.sample_count();
        slot.names = batch.names;
        slot.sample_count = samples;
        let process_time = start.elapsed();

        drop(slot);
        shared.ring.push()?;

        let mut counters = shared.counters.lock()?;
        counters.batches_processed += 1;
        counters.samples_processed += samples as u64;
        counters.load_time += load_time;
        counters.process_time += process_time;
        counters.loader = self.loader.timing();
        debug!(
            pipeline_id = %self.pipeline_id,
            shard_id = batch.shard_id,
            samples,
            ?load_time,
            ?process_time,
            "batch published"
        );
        Ok(Step::Produced)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    format!("orchestrator panicked: {detail}")
}
