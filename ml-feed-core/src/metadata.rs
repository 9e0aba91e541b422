//! Per-sample annotations that travel alongside each batch

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of annotation a metadata source provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaDataKind {
    /// Class labels
    Labels,

    /// Axis-aligned bounding boxes
    BoundingBoxes,

    /// Polygon masks
    Masks,
}

/// Axis-aligned box in relative (0..1) or pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left edge
    pub l: f32,

    /// Top edge
    pub t: f32,

    /// Right edge
    pub r: f32,

    /// Bottom edge
    pub b: f32,
}

impl BoundingBox {
    /// Create a box from its edges
    pub fn new(l: f32, t: f32, r: f32, b: f32) -> Self {
        Self { l, t, r, b }
    }

    /// Box width
    pub fn width(&self) -> f32 {
        self.r - self.l
    }

    /// Box height
    pub fn height(&self) -> f32 {
        self.b - self.t
    }

    /// Scale both axes
    #[must_use]
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.l * sx, self.t * sy, self.r * sx, self.b * sy)
    }

    /// Mirror horizontally inside an image of the given width
    #[must_use]
    pub fn flipped_horizontally(&self, image_width: f32) -> Self {
        Self::new(image_width - self.r, self.t, image_width - self.l, self.b)
    }

    /// Mirror vertically inside an image of the given height
    #[must_use]
    pub fn flipped_vertically(&self, image_height: f32) -> Self {
        Self::new(self.l, image_height - self.b, self.r, image_height - self.t)
    }
}

/// A polygon mask given as (x, y) vertices
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MaskPolygon {
    /// Vertices in order
    pub vertices: Vec<[f32; 2]>,
}

/// Annotations of one sample
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SampleMeta {
    /// Class labels
    #[serde(default)]
    pub labels: Vec<i32>,

    /// Bounding boxes
    #[serde(default)]
    pub boxes: Vec<BoundingBox>,

    /// Polygon masks
    #[serde(default)]
    pub masks: Vec<MaskPolygon>,

    /// Width and height of the sample the annotations refer to
    #[serde(default)]
    pub img_size: (u32, u32),
}

impl SampleMeta {
    /// Whether the sample carries no annotations at all
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.boxes.is_empty() && self.masks.is_empty()
    }
}

/// Annotations of a whole batch, positionally aligned with its samples
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetaDataBatch {
    /// One entry per sample, in batch order
    samples: Vec<SampleMeta>,

    /// Sample names, in batch order
    names: Vec<String>,
}

impl MetaDataBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from aligned samples and names
    pub fn from_parts(samples: Vec<SampleMeta>, names: Vec<String>) -> Result<Self> {
        if samples.len() != names.len() {
            return Err(Error::InvalidArgument(format!(
                "{} metadata entries for {} sample names",
                samples.len(),
                names.len()
            )));
        }
        Ok(Self { samples, names })
    }

    /// Append one sample
    pub fn push(&mut self, name: impl Into<String>, sample: SampleMeta) {
        self.names.push(name.into());
        self.samples.push(sample);
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Remove every sample
    pub fn clear(&mut self) {
        self.samples.clear();
        self.names.clear();
    }

    /// Per-sample annotations
    pub fn samples(&self) -> &[SampleMeta] {
        &self.samples
    }

    /// Mutable per-sample annotations
    pub fn samples_mut(&mut self) -> &mut [SampleMeta] {
        &mut self.samples
    }

    /// Sample names
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Annotations of sample `index`
    pub fn get(&self, index: usize) -> Result<&SampleMeta> {
        self.samples.get(index).ok_or(Error::IndexOutOfBounds {
            index,
            len: self.samples.len(),
        })
    }

    /// Labels of every sample
    pub fn labels(&self) -> Vec<&[i32]> {
        self.samples.iter().map(|s| s.labels.as_slice()).collect()
    }

    /// Bounding boxes of every sample
    pub fn boxes(&self) -> Vec<&[BoundingBox]> {
        self.samples.iter().map(|s| s.boxes.as_slice()).collect()
    }

    /// Masks of every sample
    pub fn masks(&self) -> Vec<&[MaskPolygon]> {
        self.samples.iter().map(|s| s.masks.as_slice()).collect()
    }

    /// Total number of labels across the batch
    pub fn label_count(&self) -> usize {
        self.samples.iter().map(|s| s.labels.len()).sum()
    }

    /// Total number of boxes across the batch
    pub fn box_count(&self) -> usize {
        self.samples.iter().map(|s| s.boxes.len()).sum()
    }

    /// Total number of mask vertices across the batch
    pub fn mask_vertex_count(&self) -> usize {
        self.samples
            .iter()
            .flat_map(|s| s.masks.iter())
            .map(|m| m.vertices.len())
            .sum()
    }

    /// Copy every label, flattened in batch order
    pub fn copy_labels(&self, dst: &mut [i32]) -> Result<usize> {
        let count = self.label_count();
        if dst.len() < count {
            return Err(Error::SizeMismatch {
                expected: count * 4,
                actual: dst.len() * 4,
            });
        }
        for (slot, label) in dst.iter_mut().zip(self.samples.iter().flat_map(|s| &s.labels)) {
            *slot = *label;
        }
        Ok(count)
    }

    /// Copy every box as `[l, t, r, b]`, flattened in batch order
    pub fn copy_boxes(&self, dst: &mut [f32]) -> Result<usize> {
        let count = self.box_count();
        if dst.len() < count * 4 {
            return Err(Error::SizeMismatch {
                expected: count * 16,
                actual: dst.len() * 4,
            });
        }
        for (chunk, bbox) in dst
            .chunks_exact_mut(4)
            .zip(self.samples.iter().flat_map(|s| &s.boxes))
        {
            chunk.copy_from_slice(&[bbox.l, bbox.t, bbox.r, bbox.b]);
        }
        Ok(count)
    }
}
