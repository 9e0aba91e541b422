//! The metadata graph and the stage interface it runs

use std::borrow::Cow;

use ml_feed_core::{MetaDataBatch, SampleMeta};
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::{NodeId, TransformGraph};

/// One metadata transform stage
pub trait MetaNode: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Write the transformed `input` into `output`. Both batches have the
    /// same length; `params` holds the per-sample parameters of the mirrored
    /// transform node, or nothing.
    fn update(
        &mut self,
        input: &MetaDataBatch,
        output: &mut MetaDataBatch,
        params: &[f32],
    ) -> Result<()>;
}

struct MetaStage {
    node: Box<dyn MetaNode>,
    source: Option<NodeId>,
}

/// Ordered metadata stages, each optionally mirroring a transform node
#[derive(Default)]
pub struct MetadataGraph {
    stages: Vec<MetaStage>,
}

impl MetadataGraph {
    /// An empty metadata graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage. With a `source`, the stage receives that node's
    /// per-sample parameters every batch.
    pub fn add_node<N: MetaNode + 'static>(&mut self, node: N, source: Option<NodeId>) -> usize {
        self.stages.push(MetaStage {
            node: Box::new(node),
            source,
        });
        self.stages.len() - 1
    }

    /// Number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Bring annotations from their stored image size to the decoded size.
    /// `decoded` holds one (width, height) per sample.
    pub fn rescale(batch: &mut MetaDataBatch, decoded: &[(u32, u32)]) -> Result<()> {
        if decoded.len() != batch.len() {
            return Err(Error::InvalidArgument(format!(
                "{} decoded sizes for {} metadata entries",
                decoded.len(),
                batch.len()
            )));
        }

        #[cfg(feature = "parallel")]
        batch
            .samples_mut()
            .par_iter_mut()
            .zip(decoded.par_iter())
            .for_each(|(sample, &size)| rescale_sample(sample, size));

        #[cfg(not(feature = "parallel"))]
        for (sample, &size) in batch.samples_mut().iter_mut().zip(decoded) {
            rescale_sample(sample, size);
        }
        Ok(())
    }

    /// Run every stage over `input`, leaving the result in `output`. Each
    /// stage after the first reads a deep copy of the previous stage's result.
    pub fn process(
        &mut self,
        input: &MetaDataBatch,
        output: &mut MetaDataBatch,
        graph: &TransformGraph,
    ) -> Result<()> {
        output.clone_from(input);
        let mut stage_input = Cow::Borrowed(input);
        for (i, stage) in self.stages.iter_mut().enumerate() {
            if i > 0 {
                stage_input = Cow::Owned(output.clone());
            }
            let params: &[f32] = match stage.source {
                Some(id) => graph.node_parameters(id)?,
                None => &[],
            };
            stage.node.update(&stage_input, output, params)?;
            debug!(stage = stage.node.name(), samples = output.len(), "metadata stage applied");
        }
        Ok(())
    }
}

#[allow(clippy::cast_precision_loss)]
fn rescale_sample(sample: &mut SampleMeta, (width, height): (u32, u32)) {
    if width == 0 || height == 0 {
        return;
    }
    let (orig_w, orig_h) = sample.img_size;
    if orig_w != 0 && orig_h != 0 && (orig_w, orig_h) != (width, height) {
        let sx = width as f32 / orig_w as f32;
        let sy = height as f32 / orig_h as f32;
        for bbox in &mut sample.boxes {
            *bbox = bbox.scaled(sx, sy);
        }
        for mask in &mut sample.masks {
            for vertex in &mut mask.vertices {
                vertex[0] *= sx;
                vertex[1] *= sy;
            }
        }
    }
    sample.img_size = (width, height);
}
