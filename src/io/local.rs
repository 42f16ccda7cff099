use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::{ContentStream, DirectoryReader, Entry, EntryKind, ReadAt, Sink, SinkFactory};

/// Number of children handed out per `read_entries` call.
const DIRECTORY_BATCH: usize = 128;

/// A file or directory on the local filesystem.
///
/// The entry's path is relative to the parent of the root it was created
/// from, so scanning `/home/me/photos` yields `/photos/...` paths.
pub struct LocalEntry {
    path: PathBuf,
    full_path: String,
    kind: EntryKind,
    size: u64,
    modified: Option<NaiveDateTime>,
}

impl LocalEntry {
    /// Create a root entry for `path`.
    pub fn new(path: &Path) -> Result<Arc<dyn Entry>> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Ok(Arc::new(Self::from_metadata(
            path.to_path_buf(),
            format!("/{name}"),
            &metadata,
        )))
    }

    fn from_metadata(path: PathBuf, full_path: String, metadata: &Metadata) -> Self {
        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let modified = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Local>::from(t).naive_local());
        Self {
            path,
            full_path,
            kind,
            size: metadata.len(),
            modified,
        }
    }
}

#[async_trait]
impl Entry for LocalEntry {
    fn full_path(&self) -> String {
        self.full_path.clone()
    }

    fn kind(&self) -> EntryKind {
        self.kind
    }

    fn size_hint(&self) -> Option<u64> {
        match self.kind {
            EntryKind::File => Some(self.size),
            EntryKind::Directory => None,
        }
    }

    fn modified(&self) -> Option<NaiveDateTime> {
        self.modified
    }

    async fn open(&self) -> Result<ContentStream> {
        if self.kind != EntryKind::File {
            bail!("{} is not a file", self.path.display());
        }
        let file = fs::File::open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        Ok(Box::new(file))
    }

    async fn children(&self) -> Result<Box<dyn DirectoryReader>> {
        if self.kind != EntryKind::Directory {
            bail!("{} is not a directory", self.path.display());
        }
        let read_dir = fs::read_dir(&self.path)
            .await
            .with_context(|| format!("failed to list {}", self.path.display()))?;
        Ok(Box::new(LocalDirectoryReader {
            parent: self.full_path.clone(),
            read_dir,
        }))
    }
}

/// Lists a local directory in batches of [`DIRECTORY_BATCH`].
pub struct LocalDirectoryReader {
    parent: String,
    read_dir: fs::ReadDir,
}

#[async_trait]
impl DirectoryReader for LocalDirectoryReader {
    async fn read_entries(&mut self) -> Result<Vec<Arc<dyn Entry>>> {
        let mut batch: Vec<Arc<dyn Entry>> = Vec::new();
        while batch.len() < DIRECTORY_BATCH {
            let Some(dir_entry) = self.read_dir.next_entry().await? else {
                break;
            };
            let name = dir_entry.file_name().to_string_lossy().to_string();
            let full_path = format!("{}/{}", self.parent, name);
            match child_metadata(&dir_entry).await {
                Ok(Some(metadata)) => batch.push(Arc::new(LocalEntry::from_metadata(
                    dir_entry.path(),
                    full_path,
                    &metadata,
                ))),
                Ok(None) => debug!(path = %full_path, "not a regular file or directory"),
                Err(e) => {
                    let detail = format!("{e:#}");
                    warn!(path = %full_path, error = %detail, "skipping unreadable entry");
                }
            }
        }
        Ok(batch)
    }
}

/// Metadata of a listed child, or `None` when it is not archived.
///
/// Symlinks to files are followed. Symlinks to directories are not, so a
/// link back up the tree cannot make the walk recurse.
async fn child_metadata(dir_entry: &fs::DirEntry) -> Result<Option<Metadata>> {
    let path = dir_entry.path();
    let file_type = dir_entry
        .file_type()
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let metadata = if file_type.is_symlink() {
        let target = fs::metadata(&path)
            .await
            .with_context(|| format!("failed to follow link {}", path.display()))?;
        if target.is_dir() {
            return Ok(None);
        }
        target
    } else {
        dir_entry
            .metadata()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?
    };
    Ok((metadata.is_file() || metadata.is_dir()).then_some(metadata))
}

/// Creates archive files inside a directory.
pub struct FileSinkFactory {
    dir: PathBuf,
}

impl FileSinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SinkFactory for FileSinkFactory {
    async fn create(&self, name: &str) -> Result<Box<dyn Sink>> {
        let path = self.dir.join(name);
        let file = fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Box::new(FileSink {
            path,
            writer: BufWriter::new(file),
        }))
    }
}

/// A sink writing to a local file. A write is acknowledged once the bytes
/// have been accepted by the buffered writer.
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<fs::File>,
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.writer
            .write_all(chunk)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    async fn close(&mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .with_context(|| format!("failed to close {}", self.path.display()))
    }
}

/// Local file reader with random access support
pub struct LocalFileReader {
    file: std::fs::File,
    size: u64,
}

impl LocalFileReader {
    pub fn new(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let mut filled = 0;
            while filled < buf.len() {
                let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(filled)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut filled = 0;
            while filled < buf.len() {
                let n = self.file.seek_read(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(filled)
        }

        #[cfg(not(any(unix, windows)))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(filled)
        }
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn lists_directory_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("photos");
        std::fs::create_dir_all(root.join("2019")).unwrap();
        std::fs::write(root.join("a.jpg"), b"jpeg").unwrap();

        let entry = LocalEntry::new(&root).unwrap();
        assert_eq!(entry.full_path(), "/photos");
        assert_eq!(entry.kind(), EntryKind::Directory);

        let mut reader = entry.children().await.unwrap();
        let mut paths = Vec::new();
        loop {
            let batch = reader.read_entries().await.unwrap();
            if batch.is_empty() {
                break;
            }
            paths.extend(batch.iter().map(|e| (e.full_path(), e.kind())));
        }
        paths.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            paths,
            vec![
                ("/photos/2019".to_string(), EntryKind::Directory),
                ("/photos/a.jpg".to_string(), EntryKind::File),
            ]
        );
    }

    #[tokio::test]
    async fn opens_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();

        let entry = LocalEntry::new(&path).unwrap();
        assert_eq!(entry.size_hint(), Some(5));
        assert!(entry.modified().is_some());

        let mut content = String::new();
        entry
            .open()
            .await
            .unwrap()
            .read_to_string(&mut content)
            .await
            .unwrap();
        assert_eq!(content, "hello");
        assert!(entry.children().await.is_err());
    }

    #[tokio::test]
    async fn file_sink_and_reader_agree() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FileSinkFactory::new(dir.path());
        let mut sink = factory.create("out.bin").await.unwrap();
        sink.write(b"0123").await.unwrap();
        sink.write(b"456789").await.unwrap();
        sink.close().await.unwrap();

        let reader = LocalFileReader::new(&dir.path().join("out.bin")).unwrap();
        assert_eq!(reader.size(), 10);
        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(3, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"3456");
    }

    async fn list(entry: &Arc<dyn Entry>) -> Vec<(String, EntryKind)> {
        let mut reader = entry.children().await.unwrap();
        let mut paths = Vec::new();
        loop {
            let batch = reader.read_entries().await.unwrap();
            if batch.is_empty() {
                break;
            }
            paths.extend(batch.iter().map(|e| (e.full_path(), e.kind())));
        }
        paths.sort_by(|a, b| a.0.cmp(&b.0));
        paths
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn broken_and_looping_links_do_not_fail_the_listing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("photos");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.jpg"), b"jpeg").unwrap();
        std::fs::write(root.join("b.jpg"), b"jpeg").unwrap();
        std::os::unix::fs::symlink(root.join("gone"), root.join("broken")).unwrap();
        std::os::unix::fs::symlink(&root, root.join("loop")).unwrap();
        std::os::unix::fs::symlink(root.join("a.jpg"), root.join("alias.jpg")).unwrap();

        let entry = LocalEntry::new(&root).unwrap();
        assert_eq!(
            list(&entry).await,
            vec![
                ("/photos/a.jpg".to_string(), EntryKind::File),
                ("/photos/alias.jpg".to_string(), EntryKind::File),
                ("/photos/b.jpg".to_string(), EntryKind::File),
            ]
        );
    }
}
