//! Reader over samples held in memory

use std::sync::Arc;

use tracing::debug;

use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::shard::{ShardCursor, ShardPlan};

/// One named sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedSample {
    /// Sample name, used for metadata lookup
    pub name: String,

    /// Raw sample bytes
    pub data: Vec<u8>,
}

/// A reader over an in-memory list of samples.
///
/// Cloning is cheap; clones share the sample storage and can be initialised
/// for different shards.
#[derive(Debug, Clone)]
pub struct InMemoryReader {
    /// Samples shared between shard readers
    samples: Arc<[NamedSample]>,

    /// Interleave items across shards, or own every item
    interleave: bool,

    /// Read position, set by `initialize`
    cursor: Option<ShardCursor>,

    /// Item currently open
    current: Option<usize>,

    /// Bytes of the current item already read
    offset: usize,
}

impl InMemoryReader {
    /// A reader whose items are spread across shards by index
    pub fn new<I, S>(samples: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<String>,
    {
        Self {
            samples: samples
                .into_iter()
                .map(|(name, data)| NamedSample {
                    name: name.into(),
                    data,
                })
                .collect(),
            interleave: true,
            cursor: None,
            current: None,
            offset: 0,
        }
    }

    /// A reader whose samples already form one shard
    pub fn presharded<I, S>(samples: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: Into<String>,
    {
        Self {
            interleave: false,
            ..Self::new(samples)
        }
    }

    fn cursor(&self) -> Result<&ShardCursor> {
        self.cursor
            .as_ref()
            .ok_or_else(|| Error::NotInitialized("in-memory reader".into()))
    }

    fn current_sample(&self) -> Option<&NamedSample> {
        self.current.and_then(|i| self.samples.get(i))
    }
}

impl Reader for InMemoryReader {
    fn initialize(&mut self, config: &ReaderConfig) -> Result<()> {
        let plan = if self.interleave {
            ShardPlan::interleaved(self.samples.len(), config)?
        } else {
            ShardPlan::whole(self.samples.len(), config)?
        };
        debug!(
            shard_id = config.shard_id,
            items = plan.real_count(),
            planned = plan.len(),
            "in-memory reader initialized"
        );
        self.cursor = Some(ShardCursor::new(plan, config));
        self.current = None;
        self.offset = 0;
        Ok(())
    }

    fn count_items(&self) -> usize {
        self.cursor.as_ref().map_or(0, ShardCursor::remaining)
    }

    fn open(&mut self) -> Result<usize> {
        self.cursor()?;
        let item = self
            .cursor
            .as_mut()
            .and_then(ShardCursor::advance)
            .ok_or(Error::EndOfData)?;
        self.current = Some(item);
        self.offset = 0;
        Ok(self.current_sample().map_or(0, |s| s.data.len()))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(sample) = self.current_sample() else {
            return Ok(0);
        };
        let remaining = &sample.data[self.offset.min(sample.data.len())..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        self.offset += count;
        Ok(count)
    }

    fn close(&mut self) {
        self.offset = 0;
    }

    fn id(&self) -> &str {
        self.current_sample().map_or("", |s| s.name.as_str())
    }

    fn reset(&mut self) -> Result<()> {
        self.current = None;
        self.offset = 0;
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.reset();
        }
        Ok(())
    }

    fn last_batch_padded_size(&self) -> usize {
        self.cursor.as_ref().map_or(0, |c| c.plan().padded_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LastBatchPolicy;

    fn samples(n: usize) -> Vec<(String, Vec<u8>)> {
        (0..n).map(|i| (format!("s{i}"), vec![i as u8; 3])).collect()
    }

    #[test]
    fn test_read_before_initialize() {
        let mut reader = InMemoryReader::new(samples(2));
        assert!(matches!(reader.open(), Err(Error::NotInitialized(_))));
        assert_eq!(reader.count_items(), 0);
    }

    #[test]
    fn test_interleaved_shard_reads() {
        let mut reader = InMemoryReader::new(samples(5));
        reader.initialize(&ReaderConfig::for_shard(1, 2, 1)).unwrap();
        assert_eq!(reader.count_items(), 2);

        assert_eq!(reader.open().unwrap(), 3);
        assert_eq!(reader.id(), "s1");
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 1);
        reader.close();

        reader.open().unwrap();
        assert_eq!(reader.id(), "s3");
        assert_eq!(reader.count_items(), 0);
        assert!(matches!(reader.open(), Err(Error::EndOfData)));
    }

    #[test]
    fn test_presharded_padding_and_reset() {
        let mut reader = InMemoryReader::presharded(samples(5));
        let config = ReaderConfig {
            last_batch_policy: LastBatchPolicy::Fill,
            ..ReaderConfig::for_shard(0, 1, 4)
        };
        reader.initialize(&config).unwrap();
        assert_eq!(reader.count_items(), 8);
        assert_eq!(reader.last_batch_padded_size(), 3);

        for _ in 0..8 {
            reader.open().unwrap();
        }
        assert_eq!(reader.id(), "s2");
        reader.reset().unwrap();
        assert_eq!(reader.count_items(), 8);
    }

    #[test]
    fn test_clone_keeps_its_own_position() {
        let mut reader = InMemoryReader::presharded(samples(3));
        reader.initialize(&ReaderConfig::for_shard(0, 1, 1)).unwrap();
        reader.open().unwrap();
        reader.close();

        let mut copy = reader.clone();
        copy.open().unwrap();
        assert_eq!(copy.id(), "s1");
        assert_eq!(copy.count_items(), 1);
        assert_eq!(reader.count_items(), 2);
        reader.open().unwrap();
        assert_eq!(reader.id(), "s1");
    }
}
