#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;

use ml_feed_core::{DataType, HostMemory, Layout, TensorId, TensorInfo};
use ml_feed_parallel::{LoaderConfig, ShardedLoader};
use ml_feed_pipeline::{Pipeline, PipelineConfig, RunStatus};
use ml_feed_readers::{DecodeTarget, InMemoryReader, LastBatchPolicy, RawDecoder, Reader};
use ml_feed_transforms::CopyNode;

/// Byte value identifying sample `index` of shard `shard`
pub fn sample_value(shard: usize, index: usize) -> u8 {
    u8::try_from(shard * 16 + index).expect("test sample ids fit in a byte")
}

/// Name of sample `index` of shard `shard`
pub fn sample_name(shard: usize, index: usize) -> String {
    format!("shard{shard}-{index}")
}

/// One pre-sharded in-memory reader per entry of `sizes`. Every sample is a
/// single byte identifying it.
pub fn readers(sizes: &[usize]) -> Vec<Box<dyn Reader>> {
    readers_with_blanks(sizes, &[])
}

/// Like [`readers`], but the `(shard, index)` samples listed in `blanks` are
/// zero bytes long
pub fn readers_with_blanks(sizes: &[usize], blanks: &[(usize, usize)]) -> Vec<Box<dyn Reader>> {
    sizes
        .iter()
        .enumerate()
        .map(|(shard, &len)| {
            Box::new(InMemoryReader::presharded((0..len).map(|i| {
                let data = if blanks.contains(&(shard, i)) {
                    Vec::new()
                } else {
                    vec![sample_value(shard, i)]
                };
                (sample_name(shard, i), data)
            }))) as Box<dyn Reader>
        })
        .collect()
}

pub fn loader_config(batch_size: usize, shards: usize, policy: LastBatchPolicy) -> LoaderConfig {
    LoaderConfig {
        batch_size,
        shard_count: shards,
        last_batch_policy: policy,
        target: DecodeTarget {
            width: 1,
            height: 1,
            channels: 1,
        },
        ..LoaderConfig::default()
    }
}

pub fn pipeline_config(batch_size: usize) -> PipelineConfig {
    PipelineConfig {
        batch_size,
        idle_poll_ms: 5,
        ..PipelineConfig::default()
    }
}

pub fn loader(config: LoaderConfig, readers: Vec<Box<dyn Reader>>) -> Result<ShardedLoader> {
    ml_feed_pipeline::logging::init_tracing();
    Ok(ShardedLoader::initialize(
        config,
        readers,
        || Box::new(RawDecoder),
        Arc::new(HostMemory::new()),
    )?)
}

/// Output tensor matching a loader tensor of one byte per sample
pub fn flat_output(pipeline: &mut Pipeline, batch_size: usize) -> Result<TensorId> {
    let info = TensorInfo::new(vec![batch_size, 1], DataType::UInt8, Layout::Flat)?;
    Ok(pipeline.create_output_tensor(info)?)
}

/// Built pipeline that copies one-byte samples from shards of `sizes`
pub fn copy_pipeline(
    config: PipelineConfig,
    policy: LastBatchPolicy,
    sizes: &[usize],
) -> Result<Pipeline> {
    copy_pipeline_from(config, policy, readers(sizes))
}

/// Built pipeline that copies one-byte samples from `shards`
pub fn copy_pipeline_from(
    config: PipelineConfig,
    policy: LastBatchPolicy,
    shards: Vec<Box<dyn Reader>>,
) -> Result<Pipeline> {
    let batch_size = config.batch_size;
    let mut pipeline = Pipeline::new(config)?;
    let input = pipeline.set_loader(loader(
        loader_config(batch_size, shards.len(), policy),
        shards,
    )?)?;
    let output = flat_output(&mut pipeline, batch_size)?;
    pipeline.add_node(CopyNode, &[input], &[output])?;
    pipeline.build()?;
    Ok(pipeline)
}

/// A delivered batch: sample names and the first byte of each sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub names: Vec<String>,
    pub bytes: Vec<u8>,
}

/// Run until the pipeline reports no more data
pub fn drain(pipeline: &mut Pipeline) -> Result<Vec<Delivered>> {
    let mut batches = Vec::new();
    while pipeline.run()? == RunStatus::Ok {
        let batch = pipeline.output_tensors()?;
        let count = batch.sample_count();
        batches.push(Delivered {
            names: batch.names().to_vec(),
            bytes: batch.as_bytes(0)?[..count].to_vec(),
        });
    }
    Ok(batches)
}
