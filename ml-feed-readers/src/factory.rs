//! Factory functions that build readers and decoders from configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::decoder::{Decoder, PnmDecoder, RawDecoder};
use crate::file::{FileReader, FileSource};
use crate::reader::Reader;

/// Serializable description of a reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReaderSpec {
    /// Files in a directory and its immediate sub-folders
    Directory {
        /// Root directory
        path: PathBuf,
        /// Read through memory maps
        #[serde(default)]
        memory_map: bool,
    },

    /// Files named in a list file
    FileList {
        /// The list file
        list: PathBuf,
        /// Directory the listed names are relative to
        root: PathBuf,
        /// Read through memory maps
        #[serde(default)]
        memory_map: bool,
    },
}

/// Serializable description of a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderSpec {
    /// Copy bytes verbatim
    #[default]
    Raw,

    /// Binary PGM/PPM
    Pnm,
}

/// Create a fresh, uninitialised reader for one shard
pub fn create_reader(spec: &ReaderSpec) -> Box<dyn Reader> {
    match spec {
        ReaderSpec::Directory { path, memory_map } => {
            Box::new(FileReader::directory(path).with_memory_map(*memory_map))
        }
        ReaderSpec::FileList {
            list,
            root,
            memory_map,
        } => Box::new(
            FileReader::new(FileSource::FileList {
                list: list.clone(),
                root: root.clone(),
            })
            .with_memory_map(*memory_map),
        ),
    }
}

/// Create a decoder
pub fn create_decoder(spec: DecoderSpec) -> Box<dyn Decoder> {
    match spec {
        DecoderSpec::Raw => Box::new(RawDecoder),
        DecoderSpec::Pnm => Box::new(PnmDecoder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderConfig;

    #[test]
    fn test_reader_spec_from_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.jpg"), [1]).unwrap();
        let json = format!(
            r#"{{"type": "directory", "path": {:?}}}"#,
            dir.path().to_string_lossy()
        );
        let spec: ReaderSpec = serde_json::from_str(&json).unwrap();

        let mut reader = create_reader(&spec);
        reader.initialize(&ReaderConfig::default()).unwrap();
        assert_eq!(reader.count_items(), 1);
    }

    #[test]
    fn test_decoder_spec() {
        let spec: DecoderSpec = serde_json::from_str(r#""pnm""#).unwrap();
        assert_eq!(create_decoder(spec).name(), "pnm");
        assert_eq!(create_decoder(DecoderSpec::default()).name(), "raw");
    }
}
