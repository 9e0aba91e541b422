//! The reader interface every shard loader drives

use crate::config::ReaderConfig;
use crate::error::Result;

/// A source of raw sample bytes for one shard.
///
/// A loader calls [`Reader::open`] to move to the next item, then
/// [`Reader::read`] to copy its bytes, then [`Reader::close`].
pub trait Reader: Send {
    /// Enumerate items and apply sharding and the last-batch policy
    fn initialize(&mut self, config: &ReaderConfig) -> Result<()>;

    /// Items left to read in this shard, padding included
    fn count_items(&self) -> usize;

    /// Move to the next item and return its size in bytes.
    ///
    /// A size of zero means the item is unreadable or empty; it still counts
    /// as consumed and the caller should skip it.
    fn open(&mut self) -> Result<usize>;

    /// Copy up to `buf.len()` bytes of the current item, returning the count
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Release the current item
    fn close(&mut self);

    /// Name of the current item
    fn id(&self) -> &str;

    /// Rewind to the start of the shard
    fn reset(&mut self) -> Result<()>;

    /// How many samples the shard's final batch is short of a full batch
    fn last_batch_padded_size(&self) -> usize;
}

impl<R: Reader + ?Sized> Reader for Box<R> {
    fn initialize(&mut self, config: &ReaderConfig) -> Result<()> {
        (**self).initialize(config)
    }

    fn count_items(&self) -> usize {
        (**self).count_items()
    }

    fn open(&mut self) -> Result<usize> {
        (**self).open()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn id(&self) -> &str {
        (**self).id()
    }

    fn reset(&mut self) -> Result<()> {
        (**self).reset()
    }

    fn last_batch_padded_size(&self) -> usize {
        (**self).last_batch_padded_size()
    }
}
