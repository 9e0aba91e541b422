//! Reader over files in a directory tree or listed in a file-list

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use ml_feed_core::io::MemoryMappedFile;
use tracing::{debug, info, warn};

use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::format::SampleFormat;
use crate::reader::Reader;
use crate::shard::{ShardCursor, ShardPlan};

/// Where a [`FileReader`] finds its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Files directly in the directory and one level of sub-folders
    Directory(PathBuf),

    /// A text file naming one file per line, relative to `root`.
    /// Anything after the first whitespace on a line is ignored.
    FileList {
        /// The list file
        list: PathBuf,
        /// Directory the listed names are relative to
        root: PathBuf,
    },
}

/// The file currently open
enum OpenItem {
    Stream(File),
    Mapped {
        map: MemoryMappedFile,
        offset: usize,
    },
}

/// A reader over sample files on disk
pub struct FileReader {
    /// Where the files come from
    source: FileSource,

    /// Read files through a memory map instead of a stream
    memory_map: bool,

    /// Every file found, in sorted order, before sharding
    paths: Vec<PathBuf>,

    /// Read position, set by `initialize`
    cursor: Option<ShardCursor>,

    /// File currently open
    current: Option<OpenItem>,

    /// File name of the current item
    current_id: String,
}

impl FileReader {
    /// Create a reader over `source`
    pub fn new(source: FileSource) -> Self {
        Self {
            source,
            memory_map: false,
            paths: Vec::new(),
            cursor: None,
            current: None,
            current_id: String::new(),
        }
    }

    /// Create a reader over the files of a directory
    pub fn directory<P: AsRef<Path>>(path: P) -> Self {
        Self::new(FileSource::Directory(path.as_ref().to_path_buf()))
    }

    /// Read files through memory maps
    #[must_use]
    pub fn with_memory_map(mut self, memory_map: bool) -> Self {
        self.memory_map = memory_map;
        self
    }

    /// Every file found, before sharding
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn list_files(&self) -> Result<Vec<PathBuf>> {
        match &self.source {
            FileSource::Directory(root) => {
                let mut files = Vec::new();
                for entry in sorted_entries(root)? {
                    if entry.is_dir() {
                        files.extend(
                            sorted_entries(&entry)?
                                .into_iter()
                                .filter(|p| p.is_file() && has_supported_extension(p)),
                        );
                    } else if entry.is_file() && has_supported_extension(&entry) {
                        files.push(entry);
                    }
                }
                Ok(files)
            }
            FileSource::FileList { list, root } => {
                let text = fs::read_to_string(list)?;
                Ok(text
                    .lines()
                    .filter_map(|line| line.split_whitespace().next())
                    .map(|name| root.join(name))
                    .collect())
            }
        }
    }

    fn open_path(&self, path: &Path) -> Result<Option<(OpenItem, usize)>> {
        if self.memory_map {
            let map = match MemoryMappedFile::open(path) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to map file");
                    return Ok(None);
                }
            };
            let size = map.size();
            return Ok(Some((OpenItem::Mapped { map, offset: 0 }, size)));
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open file");
                return Ok(None);
            }
        };
        let size = usize::try_from(file.metadata()?.len())
            .map_err(|_| Error::InvalidArgument(format!("{} is too large", path.display())))?;
        Ok(Some((OpenItem::Stream(file), size)))
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn has_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(true, |ext| SampleFormat::from_extension(ext).is_supported())
}

impl Reader for FileReader {
    fn initialize(&mut self, config: &ReaderConfig) -> Result<()> {
        self.paths = self.list_files()?;
        let plan = ShardPlan::interleaved(self.paths.len(), config)?;
        if plan.is_empty() {
            warn!(shard_id = config.shard_id, source = ?self.source, "reader did not load any file");
        } else {
            info!(
                shard_id = config.shard_id,
                files = plan.real_count(),
                padded = plan.len() - plan.real_count(),
                "file reader initialized"
            );
        }
        self.cursor = Some(ShardCursor::new(plan, config));
        self.current = None;
        Ok(())
    }

    fn count_items(&self) -> usize {
        self.cursor.as_ref().map_or(0, ShardCursor::remaining)
    }

    fn open(&mut self) -> Result<usize> {
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| Error::NotInitialized("file reader".into()))?;
        let index = cursor.advance().ok_or(Error::EndOfData)?;
        let path = self.paths[index].clone();
        self.current_id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.current = None;

        let Some((item, size)) = self.open_path(&path)? else {
            return Ok(0);
        };
        if size == 0 {
            debug!(path = %path.display(), "empty file");
            return Ok(0);
        }
        self.current = Some(item);
        Ok(size)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.current.as_mut() {
            None => Ok(0),
            Some(OpenItem::Stream(file)) => {
                let mut total = 0;
                while total < buf.len() {
                    let n = file.read(&mut buf[total..])?;
                    if n == 0 {
                        break;
                    }
                    total += n;
                }
                Ok(total)
            }
            Some(OpenItem::Mapped { map, offset }) => {
                let bytes = &map.as_slice()[(*offset).min(map.size())..];
                let count = bytes.len().min(buf.len());
                buf[..count].copy_from_slice(&bytes[..count]);
                *offset += count;
                Ok(count)
            }
        }
    }

    fn close(&mut self) {
        self.current = None;
    }

    fn id(&self) -> &str {
        &self.current_id
    }

    fn reset(&mut self) -> Result<()> {
        self.current = None;
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
    use tempfile::tempdir;

    fn populate(dir: &Path) {
        fs::write(dir.join("b.jpg"), [1, 2, 3]).unwrap();
        fs::write(dir.join("a.png"), [4, 5]).unwrap();
        fs::write(dir.join("notes.txt"), b"skip me").unwrap();
        fs::create_dir(dir.join("sub")).unwrap();
        fs::write(dir.join("sub").join("c.ppm"), [6]).unwrap();
        fs::write(dir.join("sub").join("empty.jpg"), []).unwrap();
    }

    #[test]
    fn test_directory_listing_is_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let mut reader = FileReader::directory(dir.path());
        reader.initialize(&ReaderConfig::for_shard(0, 1, 1)).unwrap();

        let names: Vec<_> = reader
            .paths()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "b.jpg", "c.ppm", "empty.jpg"]);
        assert_eq!(reader.count_items(), 4);
    }

    #[test]
    fn test_read_and_skip_empty() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        for memory_map in [false, true] {
            let mut reader = FileReader::directory(dir.path()).with_memory_map(memory_map);
            reader.initialize(&ReaderConfig::for_shard(0, 1, 1)).unwrap();

            assert_eq!(reader.open().unwrap(), 2);
            assert_eq!(reader.id(), "a.png");
            let mut buf = [0u8; 8];
            assert_eq!(reader.read(&mut buf).unwrap(), 2);
            assert_eq!(&buf[..2], &[4, 5]);
            reader.close();

            reader.open().unwrap();
            reader.open().unwrap();
            assert_eq!(reader.open().unwrap(), 0);
            assert_eq!(reader.id(), "empty.jpg");
            assert_eq!(reader.count_items(), 0);
        }
    }

    #[test]
    fn test_file_list_with_sharding() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let list = dir.path().join("list.txt");
        fs::write(&list, "b.jpg 1\nsub/c.ppm 0\na.png 2\n").unwrap();

        let mut reader = FileReader::new(FileSource::FileList {
            list,
            root: dir.path().to_path_buf(),
        });
        reader.initialize(&ReaderConfig::for_shard(1, 2, 1)).unwrap();
        assert_eq!(reader.count_items(), 1);
        assert_eq!(reader.open().unwrap(), 1);
        assert_eq!(reader.id(), "c.ppm");
    }

    #[test]
    fn test_missing_directory_fails() {
        let mut reader = FileReader::directory("/definitely/not/here");
        assert!(matches!(
            reader.initialize(&ReaderConfig::default()),
            Err(Error::Io(_))
        ));
    }
}
