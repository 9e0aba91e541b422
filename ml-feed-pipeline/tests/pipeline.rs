mod common;

use std::thread;
use std::time::Duration;

use anyhow::Result;
use test_case::test_case;

use ml_feed_pipeline::{Pipeline, PipelineConfig, PipelineError, RunStatus};
use ml_feed_readers::{InMemoryReader, LastBatchPolicy, Reader};
use ml_feed_transforms::{CopyNode, Error as GraphError, FnNode, NodeKind};

use common::{
    copy_pipeline, copy_pipeline_from, drain, flat_output, loader, loader_config,
    pipeline_config, readers, readers_with_blanks, sample_name, sample_value,
};

#[test]
fn partial_batches_deliver_every_sample() -> Result<()> {
    let mut pipeline = copy_pipeline(pipeline_config(4), LastBatchPolicy::Partial, &[5, 3])?;
    assert_eq!(pipeline.remaining_count()?, 8);
    assert_eq!(pipeline.last_batch_padded_size()?, 4);

    let batches = drain(&mut pipeline)?;
    let sizes: Vec<usize> = batches.iter().map(|b| b.names.len()).collect();
    assert_eq!(sizes, vec![4, 3, 1]);
    assert_eq!(batches[1].names, (0..3).map(|i| sample_name(1, i)).collect::<Vec<_>>());
    assert_eq!(batches[2].names, vec![sample_name(0, 4)]);
    assert_eq!(batches[2].bytes, vec![sample_value(0, 4)]);

    assert_eq!(pipeline.remaining_count()?, 0);
    assert_eq!(pipeline.run()?, RunStatus::NoMoreData);
    assert_eq!(pipeline.run()?, RunStatus::NoMoreData);

    let stats = pipeline.stats()?;
    assert_eq!(stats.batches_processed, 3);
    assert_eq!(stats.samples_processed, 8);
    assert_eq!(stats.batches_delivered, 3);
    pipeline.release()?;
    Ok(())
}

#[test]
fn fill_pads_the_final_batch_from_the_shard() -> Result<()> {
    let mut pipeline = copy_pipeline(pipeline_config(4), LastBatchPolicy::Fill, &[5])?;
    assert_eq!(pipeline.last_batch_padded_size()?, 3);

    let batches = drain(&mut pipeline)?;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1].names.len(), 4);
    assert_eq!(
        batches[1].bytes,
        vec![
            sample_value(0, 4),
            sample_value(0, 0),
            sample_value(0, 1),
            sample_value(0, 2),
        ]
    );
    Ok(())
}

#[test_case(LastBatchPolicy::Partial, 8 ; "partial")]
#[test_case(LastBatchPolicy::Fill, 12 ; "fill")]
#[test_case(LastBatchPolicy::Drop, 4 ; "drop")]
fn delivered_sample_count_follows_policy(policy: LastBatchPolicy, expected: usize) {
    let mut pipeline = copy_pipeline(pipeline_config(4), policy, &[5, 3]).unwrap();
    let delivered: usize = drain(&mut pipeline)
        .unwrap()
        .iter()
        .map(|b| b.names.len())
        .sum();
    assert_eq!(delivered, expected);
}

#[test]
fn blank_sample_keeps_fill_batches_full() -> Result<()> {
    let shards = readers_with_blanks(&[8], &[(0, 2)]);
    let mut pipeline = copy_pipeline_from(pipeline_config(4), LastBatchPolicy::Fill, shards)?;
    assert_eq!(pipeline.remaining_count()?, 8);

    let batches = drain(&mut pipeline)?;
    let sizes: Vec<usize> = batches.iter().map(|b| b.names.len()).collect();
    assert_eq!(sizes, vec![4, 4]);
    assert_eq!(batches[0].names[2], sample_name(0, 2));
    assert_eq!(batches[0].bytes[2], 0);
    assert_eq!(batches[1].names, (4..8).map(|i| sample_name(0, i)).collect::<Vec<_>>());
    assert_eq!(pipeline.remaining_count()?, 0);
    assert_eq!(pipeline.run()?, RunStatus::NoMoreData);
    Ok(())
}

#[test]
fn blank_sample_does_not_shorten_other_batches() -> Result<()> {
    let shards = readers_with_blanks(&[8, 8], &[(0, 1)]);
    let mut pipeline = copy_pipeline_from(pipeline_config(4), LastBatchPolicy::Fill, shards)?;

    let batches = drain(&mut pipeline)?;
    assert_eq!(batches.len(), 4);
    assert!(batches.iter().all(|b| b.names.len() == 4));
    let firsts: Vec<&str> = batches.iter().map(|b| b.names[0].as_str()).collect();
    assert_eq!(firsts, vec!["shard0-0", "shard1-0", "shard0-4", "shard1-4"]);
    assert_eq!(pipeline.remaining_count()?, 0);
    Ok(())
}

#[test]
fn blank_sample_under_drop_keeps_the_plan() -> Result<()> {
    let shards = readers_with_blanks(&[7], &[(0, 1)]);
    let mut pipeline = copy_pipeline_from(pipeline_config(4), LastBatchPolicy::Drop, shards)?;
    assert_eq!(pipeline.remaining_count()?, 4);

    let batches = drain(&mut pipeline)?;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].names, (0..4).map(|i| sample_name(0, i)).collect::<Vec<_>>());
    assert_eq!(pipeline.remaining_count()?, 0);
    Ok(())
}

#[test]
fn empty_shards_are_skipped() -> Result<()> {
    let mut pipeline = copy_pipeline(pipeline_config(1), LastBatchPolicy::Fill, &[0, 2, 3])?;
    let order: Vec<u8> = drain(&mut pipeline)?
        .into_iter()
        .flat_map(|b| b.bytes)
        .map(|byte| byte / 16)
        .collect();
    assert_eq!(order, vec![1, 2, 1, 2, 2]);
    Ok(())
}

#[test]
fn data_stays_aligned_with_names() -> Result<()> {
    let mut pipeline = copy_pipeline(pipeline_config(2), LastBatchPolicy::Partial, &[3, 4])?;
    for batch in drain(&mut pipeline)? {
        for (name, byte) in batch.names.iter().zip(&batch.bytes) {
            let shard = usize::from(byte / 16);
            let index = usize::from(byte % 16);
            assert_eq!(name, &sample_name(shard, index));
        }
    }
    Ok(())
}

#[test]
fn reset_reproduces_a_fresh_epoch() -> Result<()> {
    let mut fresh = copy_pipeline(pipeline_config(4), LastBatchPolicy::Partial, &[5, 3])?;
    let expected = drain(&mut fresh)?;

    let mut pipeline = copy_pipeline(pipeline_config(4), LastBatchPolicy::Partial, &[5, 3])?;
    assert_eq!(pipeline.run()?, RunStatus::Ok);
    pipeline.reset()?;
    assert_eq!(pipeline.remaining_count()?, 8);
    assert_eq!(drain(&mut pipeline)?, expected);

    pipeline.reset()?;
    assert_eq!(drain(&mut pipeline)?, expected);
    Ok(())
}

#[test]
fn reset_releases_a_writer_blocked_on_a_full_ring() -> Result<()> {
    let mut pipeline = copy_pipeline(pipeline_config(1), LastBatchPolicy::Fill, &[32])?;
    assert_eq!(pipeline.run()?, RunStatus::Ok);
    thread::sleep(Duration::from_millis(50));

    pipeline.reset()?;
    assert!(pipeline.is_running());
    assert_eq!(drain(&mut pipeline)?.len(), 32);
    Ok(())
}

#[test]
fn full_ring_holds_back_the_orchestrator() -> Result<()> {
    let config = PipelineConfig {
        prefetch_depth: 2,
        ..pipeline_config(1)
    };
    let mut pipeline = copy_pipeline(config, LastBatchPolicy::Fill, &[20])?;
    thread::sleep(Duration::from_millis(100));
    assert!(pipeline.stats()?.batches_processed <= 2);

    let mut delivered = 0;
    while pipeline.run()? == RunStatus::Ok {
        delivered += 1;
        if delivered % 5 == 0 {
            thread::sleep(Duration::from_millis(10));
        }
    }
    assert_eq!(delivered, 20);
    let stats = pipeline.stats()?;
    assert_eq!(stats.batches_processed, 20);
    assert!(stats.writer_wait > Duration::ZERO);
    Ok(())
}

#[test]
fn looping_never_runs_dry() -> Result<()> {
    let config = PipelineConfig {
        loop_forever: true,
        ..pipeline_config(2)
    };
    let mut pipeline = Pipeline::new(config)?;
    let loader_config = ml_feed_parallel::LoaderConfig {
        loop_forever: true,
        ..loader_config(2, 1, LastBatchPolicy::Fill)
    };
    let input = pipeline.set_loader(loader(loader_config, readers(&[3]))?)?;
    let output = flat_output(&mut pipeline, 2)?;
    pipeline.add_node(CopyNode, &[input], &[output])?;
    pipeline.build()?;

    let remaining = pipeline.remaining_count()?;
    for _ in 0..10 {
        assert_eq!(pipeline.run()?, RunStatus::Ok);
    }
    assert_eq!(pipeline.remaining_count()?, remaining);
    Ok(())
}

#[test]
fn copy_output_concatenates_output_tensors() -> Result<()> {
    let mut pipeline = copy_pipeline(pipeline_config(4), LastBatchPolicy::Partial, &[4])?;
    assert_eq!(pipeline.run()?, RunStatus::Ok);

    let mut small = [0u8; 3];
    assert!(pipeline.copy_output(&mut small).is_err());
    let mut dst = [0u8; 6];
    assert_eq!(pipeline.copy_output(&mut dst)?, 4);
    assert_eq!(&dst[..4], &[0, 1, 2, 3]);

    let batch = pipeline.output_tensors()?;
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.sample_bytes(0, 2)?, &[2]);
    assert!(batch.sample_bytes(0, 4).is_err());
    assert!(batch.buffer(1).is_err());
    assert_eq!(batch.roi(0)?.len(), 4);
    Ok(())
}

#[test]
fn node_failure_terminates_the_pipeline() -> Result<()> {
    let mut pipeline = Pipeline::new(pipeline_config(1))?;
    let input = pipeline.set_loader(loader(
        loader_config(1, 1, LastBatchPolicy::Fill),
        readers(&[8]),
    )?)?;
    let output = flat_output(&mut pipeline, 1)?;
    let mut calls = 0;
    let node = FnNode::new(NodeKind::custom("fails_second"), move |inputs, outputs| {
        calls += 1;
        if calls == 2 {
            return Err(GraphError::Execution {
                node: "fails_second".into(),
                reason: "synthetic failure".into(),
            });
        }
        outputs[0]
            .buffer_mut()
            .as_bytes_mut()
            .copy_from_slice(inputs[0].buffer().as_bytes());
        Ok(())
    });
    pipeline.add_node(node, &[input], &[output])?;
    pipeline.build()?;

    let mut delivered = 0;
    let err = loop {
        match pipeline.run() {
            Ok(RunStatus::Ok) => delivered += 1,
            Ok(status) => panic!("unexpected status {status:?}"),
            Err(e) => break e,
        }
    };
    assert!(delivered <= 1);
    assert!(matches!(&err, PipelineError::Terminated(reason) if reason.contains("synthetic failure")));
    assert!(matches!(pipeline.run(), Err(PipelineError::Terminated(_))));
    assert!(!pipeline.is_running());
    pipeline.release()?;
    Ok(())
}

#[test]
fn node_panic_is_reported_not_propagated() -> Result<()> {
    let mut pipeline = Pipeline::new(pipeline_config(1))?;
    let input = pipeline.set_loader(loader(
        loader_config(1, 1, LastBatchPolicy::Fill),
        readers(&[4]),
    )?)?;
    let output = flat_output(&mut pipeline, 1)?;
    let node = FnNode::new(NodeKind::custom("panics"), |_, _| panic!("node exploded"));
    pipeline.add_node(node, &[input], &[output])?;
    pipeline.build()?;

    let err = pipeline.run().expect_err("a panicking node must stop the pipeline");
    assert!(matches!(&err, PipelineError::Terminated(reason) if reason.contains("node exploded")));
    Ok(())
}

#[test]
fn reset_recovers_from_a_node_panic() -> Result<()> {
    let mut pipeline = Pipeline::new(pipeline_config(1))?;
    let input = pipeline.set_loader(loader(
        loader_config(1, 1, LastBatchPolicy::Fill),
        readers(&[3]),
    )?)?;
    let output = flat_output(&mut pipeline, 1)?;
    let mut calls = 0;
    let node = FnNode::new(NodeKind::custom("panics_once"), move |inputs, outputs| {
        calls += 1;
        if calls == 1 {
            panic!("first batch panics");
        }
        outputs[0]
            .buffer_mut()
            .as_bytes_mut()
            .copy_from_slice(inputs[0].buffer().as_bytes());
        Ok(())
    });
    pipeline.add_node(node, &[input], &[output])?;
    pipeline.build()?;

    let err = pipeline.run().expect_err("the panic stops the pipeline");
    assert!(matches!(&err, PipelineError::Terminated(reason) if reason.contains("first batch panics")));

    pipeline.reset()?;
    let batches = drain(&mut pipeline)?;
    let bytes: Vec<u8> = batches.into_iter().flat_map(|b| b.bytes).collect();
    assert_eq!(bytes, (0..3).map(|i| sample_value(0, i)).collect::<Vec<_>>());
    pipeline.release()?;
    Ok(())
}

#[test]
fn decode_failure_in_a_shard_terminates_the_pipeline() -> Result<()> {
    let oversized: Box<dyn Reader> = Box::new(InMemoryReader::presharded(vec![
        ("ok", vec![1]),
        ("too-big", vec![1, 2, 3]),
    ]));
    let mut pipeline = Pipeline::new(pipeline_config(1))?;
    let input = pipeline.set_loader(loader(
        loader_config(1, 1, LastBatchPolicy::Fill),
        vec![oversized],
    )?)?;
    let output = flat_output(&mut pipeline, 1)?;
    pipeline.add_node(CopyNode, &[input], &[output])?;
    pipeline.build()?;

    let err = loop {
        match pipeline.run() {
            Ok(RunStatus::Ok) => {}
            Ok(status) => panic!("unexpected status {status:?}"),
            Err(e) => break e,
        }
    };
    assert!(matches!(&err, PipelineError::Terminated(reason) if reason.contains("too-big")));
    Ok(())
}

#[test]
fn reset_recovers_from_a_fatal_error() -> Result<()> {
    let mut pipeline = Pipeline::new(pipeline_config(1))?;
    let input = pipeline.set_loader(loader(
        loader_config(1, 1, LastBatchPolicy::Fill),
        readers(&[3]),
    )?)?;
    let output = flat_output(&mut pipeline, 1)?;
    let mut calls = 0;
    let node = FnNode::new(NodeKind::custom("fails_once"), move |inputs, outputs| {
        calls += 1;
        if calls == 1 {
            return Err(GraphError::Execution {
                node: "fails_once".into(),
                reason: "first batch".into(),
            });
        }
        outputs[0]
            .buffer_mut()
            .as_bytes_mut()
            .copy_from_slice(inputs[0].buffer().as_bytes());
        Ok(())
    });
    pipeline.add_node(node, &[input], &[output])?;
    pipeline.build()?;

    assert!(matches!(pipeline.run(), Err(PipelineError::Terminated(_))));
    pipeline.reset()?;
    assert_eq!(drain(&mut pipeline)?.len(), 3);
    Ok(())
}

#[test]
fn calls_outside_the_running_state_are_rejected() -> Result<()> {
    let mut pipeline = Pipeline::new(pipeline_config(2))?;
    assert!(matches!(pipeline.run(), Err(PipelineError::InvalidState(_))));
    assert!(matches!(pipeline.remaining_count(), Err(PipelineError::InvalidState(_))));
    assert!(matches!(pipeline.build(), Err(PipelineError::InvalidState(_))));

    let wrong_batch = loader(loader_config(4, 1, LastBatchPolicy::Fill), readers(&[4]))?;
    assert!(matches!(pipeline.set_loader(wrong_batch), Err(PipelineError::Config(_))));

    let input = pipeline.set_loader(loader(
        loader_config(2, 1, LastBatchPolicy::Fill),
        readers(&[4]),
    )?)?;
    let output = flat_output(&mut pipeline, 2)?;
    pipeline.add_node(CopyNode, &[input], &[output])?;
    pipeline.build()?;

    assert!(matches!(pipeline.output_tensors(), Err(PipelineError::InvalidState(_))));
    assert!(matches!(pipeline.build(), Err(PipelineError::InvalidState(_))));
    assert!(matches!(pipeline.labels_meta_data(), Err(PipelineError::InvalidState(_))));

    pipeline.release()?;
    assert!(matches!(pipeline.run(), Err(PipelineError::InvalidState(_))));
    assert!(matches!(pipeline.copy_output(&mut [0; 2]), Err(PipelineError::InvalidState(_))));
    assert!(matches!(pipeline.reset(), Err(PipelineError::InvalidState(_))));
    assert!(matches!(pipeline.release(), Err(PipelineError::InvalidState(_))));
    Ok(())
}

#[test]
fn dangling_graph_input_fails_before_build() -> Result<()> {
    let mut pipeline = Pipeline::new(pipeline_config(1))?;
    let _input = pipeline.set_loader(loader(
        loader_config(1, 1, LastBatchPolicy::Fill),
        readers(&[1]),
    )?)?;
    let orphan = flat_output(&mut pipeline, 1)?;
    let output = flat_output(&mut pipeline, 1)?;
    let err = pipeline
        .add_node(CopyNode, &[orphan], &[output])
        .expect_err("orphan tensor has no producer");
    assert!(matches!(err, PipelineError::Graph(GraphError::DanglingInput { .. })));
    Ok(())
}
