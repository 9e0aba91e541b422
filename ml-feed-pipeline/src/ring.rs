//! Fixed-size ring of batch slots shared by one writer and one reader.
//!
//! The orchestrator thread writes processed batches into the slot at the
//! write cursor and pushes it; the consumer reads the slot at the read cursor
//! and pops it once done. A full ring blocks the writer and an empty ring
//! blocks the reader until the other side moves, or until a blocked call is
//! released for shutdown.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ml_feed_core::{BufferHandle, MemoryBackend, MetaDataBatch, Roi, TensorInfo};

use crate::error::{PipelineError, Result};

/// One batch worth of storage
#[derive(Debug)]
pub struct Slot {
    /// One buffer per output tensor
    pub buffers: Vec<BufferHandle>,

    /// Per-sample regions of interest, per output tensor
    pub rois: Vec<Vec<Roi>>,

    /// Sample names, in slot order
    pub names: Vec<String>,

    /// Metadata aligned with the samples
    pub meta: MetaDataBatch,

    /// Real samples in this batch
    pub sample_count: usize,
}

#[derive(Debug, Default)]
struct State {
    write: usize,
    read: usize,
    level: usize,
    write_acquired: bool,
    reader_released: bool,
    writer_released: bool,
    dont_block: bool,
    reader_wait: Duration,
    writer_wait: Duration,
}

/// Ring of batch slots with blocking acquisition on both ends
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Mutex<Slot>>,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl RingBuffer {
    /// Allocate `slot_count` slots, each holding one buffer per entry of
    /// `outputs`
    pub fn new(slot_count: usize, outputs: &[TensorInfo], memory: &dyn MemoryBackend) -> Result<Self> {
        if slot_count < 2 {
            return Err(PipelineError::Config(format!(
                "ring buffer needs at least 2 slots, got {slot_count}"
            )));
        }
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            let buffers = outputs
                .iter()
                .map(|info| memory.allocate(info.data_size(), info.memory_space))
                .collect::<ml_feed_core::Result<Vec<_>>>()?;
            slots.push(Mutex::new(Slot {
                rois: outputs
                    .iter()
                    .map(|info| vec![Roi::default(); info.batch_size()])
                    .collect(),
                buffers,
                names: Vec::new(),
                meta: MetaDataBatch::new(),
                sample_count: 0,
            }));
        }
        Ok(Self {
            slots,
            state: Mutex::new(State::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Lock one slot. A slot poisoned by a writer that panicked mid-batch
    /// is still usable: the batch was never pushed and is overwritten by the
    /// next write.
    fn lock_slot(&self, index: usize) -> MutexGuard<'_, Slot> {
        self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Occupied slots, including the one the reader is looking at
    pub fn level(&self) -> Result<usize> {
        Ok(self.state.lock()?.level)
    }

    /// Whether no slot is occupied
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.level()? == 0)
    }

    /// Time the reader and writer have spent blocked, in that order
    pub fn wait_times(&self) -> Result<(Duration, Duration)> {
        let state = self.state.lock()?;
        Ok((state.reader_wait, state.writer_wait))
    }

    /// Wait while every slot is occupied. Returns `false` if the wait was
    /// released without a slot becoming free.
    pub fn block_if_full(&self) -> Result<bool> {
        let start = Instant::now();
        let mut state = self.state.lock()?;
        while state.level == self.slots.len() && !state.dont_block && !state.writer_released {
            state = self.not_full.wait(state)?;
        }
        state.writer_wait += start.elapsed();
        Ok(state.level < self.slots.len())
    }

    /// Wait while no slot is occupied. Returns `false` if the wait was
    /// released without a batch arriving.
    pub fn block_if_empty(&self) -> Result<bool> {
        let start = Instant::now();
        let mut state = self.state.lock()?;
        while state.level == 0 && !state.dont_block && !state.reader_released {
            state = self.not_empty.wait(state)?;
        }
        state.reader_wait += start.elapsed();
        Ok(state.level > 0)
    }

    /// Slot at the write cursor, blocking while the ring is full. `None` if
    /// the wait was released.
    pub fn get_write_slot(&self) -> Result<Option<MutexGuard<'_, Slot>>> {
        if !self.block_if_full()? {
            return Ok(None);
        }
        let index = {
            let mut state = self.state.lock()?;
            state.write_acquired = true;
            state.write
        };
        Ok(Some(self.lock_slot(index)))
    }

    /// Publish the slot handed out by [`RingBuffer::get_write_slot`]
    pub fn push(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if !state.write_acquired {
            return Err(PipelineError::InvalidState(
                "push without a write slot".into(),
            ));
        }
        if state.level == self.slots.len() {
            return Err(PipelineError::InvalidState("push into a full ring".into()));
        }
        state.write_acquired = false;
        state.write = (state.write + 1) % self.slots.len();
        state.level += 1;
        drop(state);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Slot at the read cursor, blocking while the ring is empty. `None` if
    /// the wait was released.
    pub fn get_read_slot(&self) -> Result<Option<MutexGuard<'_, Slot>>> {
        if !self.block_if_empty()? {
            return Ok(None);
        }
        let index = self.state.lock()?.read;
        Ok(Some(self.lock_slot(index)))
    }

    /// Free the slot at the read cursor. Returns `false` and changes nothing
    /// when the ring is already empty.
    pub fn pop(&self) -> Result<bool> {
        let mut state = self.state.lock()?;
        if state.level == 0 {
            return Ok(false);
        }
        state.read = (state.read + 1) % self.slots.len();
        state.level -= 1;
        drop(state);
        self.not_full.notify_all();
        Ok(true)
    }

    /// Release a reader blocked on an empty ring; later reads on an empty
    /// ring return immediately until [`RingBuffer::reset`]
    pub fn unblock_reader(&self) -> Result<()> {
        self.state.lock()?.reader_released = true;
        self.not_empty.notify_all();
        Ok(())
    }

    /// Release a writer blocked on a full ring; later writes on a full ring
    /// return immediately until [`RingBuffer::reset`]
    pub fn unblock_writer(&self) -> Result<()> {
        self.state.lock()?.writer_released = true;
        self.not_full.notify_all();
        Ok(())
    }

    /// Stop blocking on either side
    pub fn release_all_blocked_calls(&self) -> Result<()> {
        self.state.lock()?.dont_block = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        Ok(())
    }

    /// Release the reader if nothing is left to read
    pub fn release_if_empty(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if state.level == 0 {
            state.reader_released = true;
            drop(state);
            self.not_empty.notify_all();
        }
        Ok(())
    }

    /// Mark every slot free and restore blocking behaviour
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        let (reader_wait, writer_wait) = (state.reader_wait, state.writer_wait);
        *state = State {
            reader_wait,
            writer_wait,
            ..State::default()
        };
        drop(state);
        for index in 0..self.slots.len() {
            let mut slot = self.lock_slot(index);
            slot.names.clear();
            slot.meta.clear();
            slot.sample_count = 0;
        }
        Ok(())
    }

    /// Detach every slot buffer so it can be returned to its allocator
    pub fn take_buffers(&self) -> Result<Vec<BufferHandle>> {
        let mut buffers = Vec::new();
        for index in 0..self.slots.len() {
            buffers.append(&mut self.lock_slot(index).buffers);
        }
        Ok(buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml_feed_core::{DataType, HostMemory, Layout};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn ring(slots: usize) -> RingBuffer {
        let info = TensorInfo::new(vec![2, 4], DataType::UInt8, Layout::Flat).unwrap();
        RingBuffer::new(slots, &[info], &HostMemory::new()).unwrap()
    }

    #[test]
    fn test_new() {
        let ring = ring(3);
        assert_eq!(ring.slot_count(), 3);
        assert_eq!(ring.level().unwrap(), 0);
        let slot = ring.get_write_slot().unwrap().unwrap();
        assert_eq!(slot.buffers.len(), 1);
        assert_eq!(slot.buffers[0].len(), 8);
        assert_eq!(slot.rois[0].len(), 2);

        let info = TensorInfo::new(vec![2, 4], DataType::UInt8, Layout::Flat).unwrap();
        assert!(RingBuffer::new(1, &[info], &HostMemory::new()).is_err());
    }

    #[test]
    fn test_fifo_order() {
        let ring = ring(3);
        for i in 0..3 {
            ring.get_write_slot().unwrap().unwrap().sample_count = i;
            ring.push().unwrap();
        }
        assert_eq!(ring.level().unwrap(), 3);
        for i in 0..3 {
            assert_eq!(ring.get_read_slot().unwrap().unwrap().sample_count, i);
            assert!(ring.pop().unwrap());
        }
        assert!(ring.is_empty().unwrap());
    }

    #[test]
    fn test_push_requires_write_slot() {
        let ring = ring(2);
        assert!(matches!(ring.push(), Err(PipelineError::InvalidState(_))));
        drop(ring.get_write_slot().unwrap());
        ring.push().unwrap();
        assert!(ring.push().is_err());
        assert_eq!(ring.level().unwrap(), 1);
    }

    #[test]
    fn test_pop_on_empty_is_noop() {
        let ring = ring(2);
        assert!(!ring.pop().unwrap());
        assert_eq!(ring.level().unwrap(), 0);
    }

    #[test]
    fn test_writer_blocks_until_pop() {
        let ring = Arc::new(ring(2));
        for _ in 0..2 {
            drop(ring.get_write_slot().unwrap());
            ring.push().unwrap();
        }

        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let got = ring.get_write_slot().unwrap().is_some();
                ring.push().unwrap();
                got
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ring.level().unwrap(), 2);
        assert!(ring.pop().unwrap());
        assert!(writer.join().unwrap());
        assert_eq!(ring.level().unwrap(), 2);
    }

    #[test]
    fn test_reader_blocks_until_push() {
        let ring = Arc::new(ring(2));
        let reader = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.get_read_slot().unwrap().map(|slot| slot.sample_count))
        };
        thread::sleep(Duration::from_millis(50));
        ring.get_write_slot().unwrap().unwrap().sample_count = 7;
        ring.push().unwrap();
        assert_eq!(reader.join().unwrap(), Some(7));
    }

    #[test]
    fn test_unblock_releases_waiters() {
        let ring = Arc::new(ring(2));
        let reader = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.get_read_slot().unwrap().is_some())
        };
        thread::sleep(Duration::from_millis(20));
        ring.unblock_reader().unwrap();
        assert!(!reader.join().unwrap());

        for _ in 0..2 {
            drop(ring.get_write_slot().unwrap());
            ring.push().unwrap();
        }
        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.get_write_slot().unwrap().is_some())
        };
        thread::sleep(Duration::from_millis(20));
        ring.unblock_writer().unwrap();
        assert!(!writer.join().unwrap());

        let (reader_wait, writer_wait) = ring.wait_times().unwrap();
        assert!(reader_wait >= Duration::from_millis(10));
        assert!(writer_wait >= Duration::from_millis(10));
    }

    #[test]
    fn test_release_if_empty() {
        let ring = ring(2);
        drop(ring.get_write_slot().unwrap());
        ring.push().unwrap();
        ring.release_if_empty().unwrap();
        assert!(ring.block_if_empty().unwrap());

        ring.pop().unwrap();
        ring.release_if_empty().unwrap();
        assert!(!ring.block_if_empty().unwrap());
        assert!(ring.get_read_slot().unwrap().is_none());
    }

    #[test]
    fn test_reset_restores_blocking_state() {
        let ring = ring(2);
        drop(ring.get_write_slot().unwrap());
        ring.push().unwrap();
        ring.release_all_blocked_calls().unwrap();
        ring.reset().unwrap();

        assert_eq!(ring.level().unwrap(), 0);
        assert!(ring.push().is_err());
        drop(ring.get_write_slot().unwrap());
        ring.push().unwrap();
        assert_eq!(ring.get_read_slot().unwrap().unwrap().sample_count, 0);
    }

    #[test]
    fn test_take_buffers() {
        let ring = ring(3);
        let buffers = ring.take_buffers().unwrap();
        assert_eq!(buffers.len(), 3);
        assert!(buffers.iter().all(|b| b.len() == 8));
        assert!(ring.take_buffers().unwrap().is_empty());
    }

    #[test]
    fn test_slot_survives_a_panicking_writer() {
        let ring = Arc::new(ring(2));
        let writer = Arc::clone(&ring);
        let joined = thread::spawn(move || {
            let mut slot = writer.get_write_slot().unwrap().unwrap();
            slot.sample_count = 7;
            panic!("writer died mid-batch");
        })
        .join();
        assert!(joined.is_err());

        ring.reset().unwrap();
        assert_eq!(ring.level().unwrap(), 0);
        ring.get_write_slot().unwrap().unwrap().sample_count = 1;
        ring.push().unwrap();
        assert_eq!(ring.get_read_slot().unwrap().unwrap().sample_count, 1);
        assert_eq!(ring.take_buffers().unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn prop_level_stays_in_bounds(slots in 2usize..6, ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let ring = ring(slots);
            let mut expected = 0usize;
            for write in ops {
                if write {
                    if expected < slots {
                        drop(ring.get_write_slot().unwrap());
                        ring.push().unwrap();
                        expected += 1;
                    }
                } else {
                    let popped = ring.pop().unwrap();
                    prop_assert_eq!(popped, expected > 0);
                    expected = expected.saturating_sub(1);
                }
                let level = ring.level().unwrap();
                prop_assert_eq!(level, expected);
                prop_assert!(level <= slots);
            }
        }
    }
}
