//! Sources of per-sample annotations

use std::collections::HashMap;
use std::path::Path;

use ml_feed_core::{MetaDataBatch, MetaDataKind, SampleMeta};
use tracing::{info, warn};

use crate::error::Result;

/// Source of per-sample annotations, looked up by sample name
pub trait MetaDataReader: Send + Sync {
    /// Kinds of annotation this reader provides
    fn kinds(&self) -> &[MetaDataKind];

    /// Annotations for `names`, positionally aligned. Unknown names get an
    /// empty entry.
    fn lookup(&self, names: &[String]) -> MetaDataBatch;

    /// Number of annotated samples
    fn len(&self) -> usize;

    /// Whether the reader holds no annotations
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Annotations held in memory, loaded from a JSON object mapping sample
/// names to entries
#[derive(Debug, Clone, Default)]
pub struct JsonMetaDataReader {
    entries: HashMap<String, SampleMeta>,
    kinds: Vec<MetaDataKind>,
}

impl JsonMetaDataReader {
    /// Build from name/annotation pairs
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, SampleMeta)>,
        S: Into<String>,
    {
        let entries: HashMap<String, SampleMeta> =
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect();

        let mut kinds = Vec::new();
        if entries.values().any(|m| !m.labels.is_empty()) {
            kinds.push(MetaDataKind::Labels);
        }
        if entries.values().any(|m| !m.boxes.is_empty()) {
            kinds.push(MetaDataKind::BoundingBoxes);
        }
        if entries.values().any(|m| !m.masks.is_empty()) {
            kinds.push(MetaDataKind::Masks);
        }
        Self { entries, kinds }
    }

    /// Parse a JSON object of `{"name": {"labels": [...], "boxes": [...]}}`
    pub fn from_json_str(json: &str) -> Result<Self> {
        let entries: HashMap<String, SampleMeta> = serde_json::from_str(json)?;
        Ok(Self::from_entries(entries))
    }

    /// Read annotations from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let reader = Self::from_json_str(&json)?;
        info!(path = %path.as_ref().display(), samples = reader.len(), "metadata loaded");
        Ok(reader)
    }
}

impl MetaDataReader for JsonMetaDataReader {
    fn kinds(&self) -> &[MetaDataKind] {
        &self.kinds
    }

    fn lookup(&self, names: &[String]) -> MetaDataBatch {
        let mut batch = MetaDataBatch::new();
        for name in names {
            let meta = if let Some(meta) = self.entries.get(name) {
                meta.clone()
            } else {
                warn!(sample = %name, "no metadata for sample");
                SampleMeta::default()
            };
            batch.push(name.clone(), meta);
        }
        batch
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
