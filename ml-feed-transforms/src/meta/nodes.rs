//! Built-in metadata stages

use ml_feed_core::{BoundingBox, MetaDataBatch, SampleMeta};

use crate::error::Result;
use crate::meta::graph::MetaNode;

fn map_samples<F>(input: &MetaDataBatch, output: &mut MetaDataBatch, mut f: F)
where
    F: FnMut(usize, &SampleMeta, &mut SampleMeta),
{
    if output.len() != input.len() {
        output.clone_from(input);
    }
    for (i, (src, dst)) in input.samples().iter().zip(output.samples_mut()).enumerate() {
        f(i, src, dst);
    }
}

/// Mirrors boxes and masks of samples whose flip parameter is non-zero
#[derive(Debug, Clone, Copy)]
pub struct FlipMetaNode {
    horizontal: bool,
}

impl FlipMetaNode {
    /// Mirror across the vertical axis
    pub fn horizontal() -> Self {
        Self { horizontal: true }
    }

    /// Mirror across the horizontal axis
    pub fn vertical() -> Self {
        Self { horizontal: false }
    }
}

impl MetaNode for FlipMetaNode {
    fn name(&self) -> &'static str {
        "flip"
    }

    #[allow(clippy::cast_precision_loss)]
    fn update(
        &mut self,
        input: &MetaDataBatch,
        output: &mut MetaDataBatch,
        params: &[f32],
    ) -> Result<()> {
        let horizontal = self.horizontal;
        map_samples(input, output, |i, src, dst| {
            if params.get(i).copied().unwrap_or(0.0) == 0.0 {
                dst.clone_from(src);
                return;
            }
            let (width, height) = (src.img_size.0 as f32, src.img_size.1 as f32);
            dst.labels.clone_from(&src.labels);
            dst.img_size = src.img_size;
            dst.boxes = src
                .boxes
                .iter()
                .map(|b| {
                    if horizontal {
                        b.flipped_horizontally(width)
                    } else {
                        b.flipped_vertically(height)
                    }
                })
                .collect();
            dst.masks.clone_from(&src.masks);
            for mask in &mut dst.masks {
                for vertex in &mut mask.vertices {
                    if horizontal {
                        vertex[0] = width - vertex[0];
                    } else {
                        vertex[1] = height - vertex[1];
                    }
                }
            }
        });
        Ok(())
    }
}

/// Clips boxes to the image and drops the ones left empty. When a sample
/// has one label per box, the labels of dropped boxes go too.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClipMetaNode;

impl MetaNode for ClipMetaNode {
    fn name(&self) -> &'static str {
        "clip"
    }

    #[allow(clippy::cast_precision_loss)]
    fn update(
        &mut self,
        input: &MetaDataBatch,
        output: &mut MetaDataBatch,
        _params: &[f32],
    ) -> Result<()> {
        map_samples(input, output, |_, src, dst| {
            let (width, height) = (src.img_size.0 as f32, src.img_size.1 as f32);
            let paired = src.labels.len() == src.boxes.len();
            dst.boxes.clear();
            dst.labels.clear();
            for (j, b) in src.boxes.iter().enumerate() {
                let clipped = BoundingBox::new(
                    b.l.clamp(0.0, width),
                    b.t.clamp(0.0, height),
                    b.r.clamp(0.0, width),
                    b.b.clamp(0.0, height),
                );
                if clipped.width() <= 0.0 || clipped.height() <= 0.0 {
                    continue;
                }
                dst.boxes.push(clipped);
                if paired {
                    dst.labels.push(src.labels[j]);
                }
            }
            if !paired {
                dst.labels.clone_from(&src.labels);
            }
            dst.masks.clone_from(&src.masks);
            dst.img_size = src.img_size;
        });
        Ok(())
    }
}
