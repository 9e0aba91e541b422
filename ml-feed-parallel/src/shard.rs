//! One shard: a reader, a decoder and a prefetch thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, info, warn};

use ml_feed_core::{BufferHandle, MemoryBackend, Roi, Tensor};
use ml_feed_readers::{DecodeTarget, DecodedInfo, Decoder, Reader};

use crate::config::LoaderConfig;
use crate::error::{Error, Result};

/// How often blocked prefetch threads re-check the stop flag
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of asking a loader for the next batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// A batch was swapped into the tensor
    Ok,

    /// Every shard is exhausted
    NoMoreData,
}

/// A batch filled by a prefetch thread
#[derive(Debug)]
pub struct LoadedBatch {
    /// Decoded samples, one slot per sample
    pub buffer: BufferHandle,

    /// Per-sample bookkeeping
    pub info: BatchInfo,

    /// Reader items consumed, blank ones included
    pub items_consumed: usize,

    /// Time spent reading
    pub read_time: Duration,

    /// Time spent decoding
    pub decode_time: Duration,
}

/// Per-sample bookkeeping of the most recent batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchInfo {
    /// Shard that produced the batch
    pub shard_id: usize,

    /// Sample names, in slot order
    pub names: Vec<String>,

    /// Region of interest per sample
    pub rois: Vec<Roi>,

    /// Original and decoded size per sample
    pub decoded: Vec<DecodedInfo>,
}

impl BatchInfo {
    /// Number of samples in the batch
    pub fn sample_count(&self) -> usize {
        self.names.len()
    }
}

/// Accumulated timing of one shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardTiming {
    /// Time the prefetch thread spent reading
    pub read_time: Duration,

    /// Time the prefetch thread spent decoding
    pub decode_time: Duration,

    /// Time spent handing buffers over to the caller
    pub swap_time: Duration,

    /// Time the caller waited for a prefetched batch
    pub wait_time: Duration,
}

/// Reader and decoder driven by the prefetch thread
struct ShardWorker {
    shard_id: usize,
    reader: Box<dyn Reader>,
    decoder: Box<dyn Decoder>,
    target: DecodeTarget,
    batch_size: usize,
    scratch: Vec<u8>,
}

impl ShardWorker {
    fn exhausted(&self) -> bool {
        self.reader.count_items() == 0
    }

    fn load_batch(&mut self, mut buffer: BufferHandle) -> Result<LoadedBatch> {
        let sample_size = self.target.sample_size();
        buffer.resize(self.batch_size * sample_size)?;

        // an unreadable item still occupies its slot, so batches stay aligned
        // with the shard plan
        let wanted = self.batch_size.min(self.reader.count_items());
        let mut info = BatchInfo {
            shard_id: self.shard_id,
            ..BatchInfo::default()
        };
        let mut read_time = Duration::ZERO;
        let mut decode_time = Duration::ZERO;

        for slot in 0..wanted {
            let start = Instant::now();
            let size = self.reader.open()?;
            let name = self.reader.id().to_string();
            let output = &mut buffer.as_bytes_mut()[slot * sample_size..(slot + 1) * sample_size];
            if size == 0 {
                warn!(shard_id = self.shard_id, sample = %name, "empty or unreadable sample left blank");
                self.reader.close();
                output.fill(0);
                info.rois.push(Roi::default());
                info.decoded.push(DecodedInfo::default());
                info.names.push(name);
                continue;
            }
            self.scratch.resize(size, 0);
            let read = self.reader.read(&mut self.scratch)?;
            self.reader.close();
            read_time += start.elapsed();

            let start = Instant::now();
            let decoded = self
                .decoder
                .decode(&name, &self.scratch[..read], output, &self.target)?;
            decode_time += start.elapsed();

            info.rois.push(Roi::full(decoded.decoded_size.0, decoded.decoded_size.1));
            info.decoded.push(decoded);
            info.names.push(name);
        }

        let filled = wanted * sample_size;
        buffer.as_bytes_mut()[filled..].fill(0);

        Ok(LoadedBatch {
            buffer,
            info,
            items_consumed: wanted,
            read_time,
            decode_time,
        })
    }
}

fn prefetch_loop(
    mut worker: ShardWorker,
    free: Receiver<BufferHandle>,
    filled: Sender<Result<LoadedBatch>>,
    running: Arc<AtomicBool>,
) -> ShardWorker {
    while running.load(Ordering::Acquire) && !worker.exhausted() {
        let buffer = match free.recv_timeout(POLL_INTERVAL) {
            Ok(buffer) => buffer,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut message = worker.load_batch(buffer);
        let failed = message.is_err();
        loop {
            match filled.send_timeout(message, POLL_INTERVAL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(returned)) => {
                    if !running.load(Ordering::Acquire) {
                        return worker;
                    }
                    message = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => return worker,
            }
        }
        if failed {
            break;
        }
    }
    debug!(shard_id = worker.shard_id, "prefetch thread finished");
    worker
}

/// One shard with its own reader, decoder and prefetch thread
pub struct ShardLoader {
    /// Index of this shard
    shard_id: usize,

    /// Loader configuration
    config: LoaderConfig,

    /// Backend batch buffers are allocated from
    memory: Arc<dyn MemoryBackend>,

    /// Reader and decoder while no thread is running
    worker: Option<ShardWorker>,

    /// Running prefetch thread
    thread: Option<JoinHandle<ShardWorker>>,

    /// Stop flag shared with the thread
    running: Arc<AtomicBool>,

    /// Empty buffers going to the thread
    free_tx: Option<Sender<BufferHandle>>,

    /// Filled batches coming from the thread
    filled_rx: Option<Receiver<Result<LoadedBatch>>>,

    /// Items not yet handed to the caller
    remaining: usize,

    /// Padded size of the shard's final batch
    padded_size: usize,

    /// Bookkeeping of the most recent batch
    last_batch: BatchInfo,

    /// Accumulated timing
    timing: ShardTiming,
}

impl ShardLoader {
    /// Initialise `reader` for shard `shard_id` and wrap it in a loader
    pub fn new(
        shard_id: usize,
        mut reader: Box<dyn Reader>,
        decoder: Box<dyn Decoder>,
        config: &LoaderConfig,
        memory: Arc<dyn MemoryBackend>,
    ) -> Result<Self> {
        config.validate()?;
        if !memory.supports(config.memory_space) {
            return Err(Error::Config(format!(
                "memory backend cannot serve {:?}",
                config.memory_space
            )));
        }
        reader.initialize(&config.reader_config(shard_id))?;
        let remaining = reader.count_items();
        let padded_size = reader.last_batch_padded_size();
        info!(shard_id, remaining, padded_size, decoder = decoder.name(), "shard initialized");

        Ok(Self {
            shard_id,
            config: config.clone(),
            memory,
            worker: Some(ShardWorker {
                shard_id,
                reader,
                decoder,
                target: config.target,
                batch_size: config.batch_size,
                scratch: Vec::new(),
            }),
            thread: None,
            running: Arc::new(AtomicBool::new(false)),
            free_tx: None,
            filled_rx: None,
            remaining,
            padded_size,
            last_batch: BatchInfo::default(),
            timing: ShardTiming::default(),
        })
    }

    /// Index of this shard
    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    /// Whether the prefetch thread is running
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Start the prefetch thread
    pub fn start(&mut self) -> Result<()> {
        let worker = self.worker.take().ok_or_else(|| {
            Error::InvalidOperation(format!("shard {} is already started", self.shard_id))
        })?;

        let depth = self.config.prefetch_depth;
        let (free_tx, free_rx) = channel::bounded(depth + 1);
        let (filled_tx, filled_rx) = channel::bounded(depth);
        for _ in 0..depth {
            let buffer = match self
                .memory
                .allocate(self.config.batch_bytes(), self.config.memory_space)
            {
                Ok(buffer) => buffer,
                Err(e) => {
                    self.worker = Some(worker);
                    return Err(e.into());
                }
            };
            // capacity is depth + 1, so this cannot fail
            let _ = free_tx.try_send(buffer);
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let shard_id = self.shard_id;
        let handle = thread::Builder::new()
            .name(format!("ml-feed-shard-{shard_id}"))
            .spawn(move || prefetch_loop(worker, free_rx, filled_tx, running))
            .map_err(|source| Error::Spawn { shard_id, source })?;

        self.thread = Some(handle);
        self.free_tx = Some(free_tx);
        self.filled_rx = Some(filled_rx);
        debug!(shard_id, depth, "prefetch thread started");
        Ok(())
    }

    /// Stop the prefetch thread and reclaim the reader. Prefetched batches
    /// are discarded.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);
        self.free_tx = None;
        self.filled_rx = None;
        let worker = handle
            .join()
            .map_err(|_| Error::WorkerPanicked(self.shard_id))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Stop, rewind the reader and start again
    pub fn reset(&mut self) -> Result<()> {
        self.stop()?;
        let worker = self
            .worker
            .as_mut()
            .ok_or(Error::WorkerPanicked(self.shard_id))?;
        worker.reader.reset()?;
        self.remaining = worker.reader.count_items();
        self.last_batch = BatchInfo::default();
        info!(shard_id = self.shard_id, remaining = self.remaining, "shard reset");
        self.start()
    }

    /// Items not yet handed to the caller
    pub fn remaining_count(&self) -> usize {
        self.remaining
    }

    /// Padded size of this shard's final batch
    pub fn last_batch_padded_size(&self) -> usize {
        self.padded_size
    }

    /// Bookkeeping of the most recent batch
    pub fn last_batch(&self) -> &BatchInfo {
        &self.last_batch
    }

    /// Accumulated timing
    pub fn timing(&self) -> ShardTiming {
        self.timing
    }

    /// Swap the next prefetched batch into `tensor`. The tensor's previous
    /// buffer goes back to the prefetch thread for refilling.
    pub fn load_next(&mut self, tensor: &mut Tensor) -> Result<LoadStatus> {
        if self.remaining == 0 {
            return Ok(LoadStatus::NoMoreData);
        }
        if tensor.info().sample_size() != self.config.target.sample_size()
            || tensor.batch_size() != self.config.batch_size
        {
            return Err(Error::Config(format!(
                "{} does not match the loader's batch geometry",
                tensor.id()
            )));
        }
        let filled_rx = self.filled_rx.as_ref().ok_or_else(|| {
            Error::InvalidOperation(format!("shard {} is not started", self.shard_id))
        })?;

        let start = Instant::now();
        let mut batch = filled_rx
            .recv()
            .map_err(|_| Error::WorkerStopped(self.shard_id))??;
        self.timing.wait_time += start.elapsed();
        self.timing.read_time += batch.read_time;
        self.timing.decode_time += batch.decode_time;

        let start = Instant::now();
        tensor.swap_buffer(&mut batch.buffer);
        tensor.set_roi(&batch.info.rois);
        if let Some(free_tx) = &self.free_tx {
            // a full pool just drops the spare buffer
            let _ = free_tx.try_send(batch.buffer);
        }
        self.timing.swap_time += start.elapsed();

        if !self.config.loop_forever {
            self.remaining = self.remaining.saturating_sub(batch.items_consumed);
            if self.remaining == 0 {
                info!(shard_id = self.shard_id, "shard exhausted");
            }
        }
        self.last_batch = batch.info;
        Ok(LoadStatus::Ok)
    }
}

impl Drop for ShardLoader {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(shard_id = self.shard_id, error = %e, "failed to stop prefetch thread");
        }
    }
}
