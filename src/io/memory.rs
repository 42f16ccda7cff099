use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::NaiveDateTime;

use super::{ContentStream, DirectoryReader, Entry, EntryKind, ReadAt, Sink, SinkFactory};

enum Node {
    File(Arc<[u8]>),
    Directory {
        children: Vec<Arc<dyn Entry>>,
        batch: usize,
    },
}

/// A file or directory held in memory.
pub struct MemoryEntry {
    path: String,
    node: Node,
    modified: Option<NaiveDateTime>,
}

impl MemoryEntry {
    pub fn file(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Arc<dyn Entry> {
        let data: Vec<u8> = data.into();
        Arc::new(Self {
            path: path.into(),
            node: Node::File(data.into()),
            modified: None,
        })
    }

    /// A file with a known modification time.
    pub fn file_modified(
        path: impl Into<String>,
        data: impl Into<Vec<u8>>,
        modified: NaiveDateTime,
    ) -> Arc<dyn Entry> {
        let data: Vec<u8> = data.into();
        Arc::new(Self {
            path: path.into(),
            node: Node::File(data.into()),
            modified: Some(modified),
        })
    }

    pub fn directory(path: impl Into<String>, children: Vec<Arc<dyn Entry>>) -> Arc<dyn Entry> {
        Self::paged_directory(path, children, usize::MAX)
    }

    /// A directory that hands out at most `batch` children per listing call.
    pub fn paged_directory(
        path: impl Into<String>,
        children: Vec<Arc<dyn Entry>>,
        batch: usize,
    ) -> Arc<dyn Entry> {
        Arc::new(Self {
            path: path.into(),
            node: Node::Directory {
                children,
                batch: batch.max(1),
            },
            modified: None,
        })
    }
}

#[async_trait]
impl Entry for MemoryEntry {
    fn full_path(&self) -> String {
        self.path.clone()
    }

    fn kind(&self) -> EntryKind {
        match self.node {
            Node::File(_) => EntryKind::File,
            Node::Directory { .. } => EntryKind::Directory,
        }
    }

    fn size_hint(&self) -> Option<u64> {
        match &self.node {
            Node::File(data) => Some(data.len() as u64),
            Node::Directory { .. } => None,
        }
    }

    fn modified(&self) -> Option<NaiveDateTime> {
        self.modified
    }

    async fn open(&self) -> Result<ContentStream> {
        match &self.node {
            Node::File(data) => Ok(Box::new(Cursor::new(Arc::clone(data)))),
            Node::Directory { .. } => bail!("{} is a directory", self.path),
        }
    }

    async fn children(&self) -> Result<Box<dyn DirectoryReader>> {
        match &self.node {
            Node::Directory { children, batch } => Ok(Box::new(MemoryDirectoryReader {
                remaining: children.clone().into_iter(),
                batch: *batch,
            })),
            Node::File(_) => bail!("{} is not a directory", self.path),
        }
    }
}

struct MemoryDirectoryReader {
    remaining: std::vec::IntoIter<Arc<dyn Entry>>,
    batch: usize,
}

#[async_trait]
impl DirectoryReader for MemoryDirectoryReader {
    async fn read_entries(&mut self) -> Result<Vec<Arc<dyn Entry>>> {
        Ok(self.remaining.by_ref().take(self.batch).collect())
    }
}

#[derive(Debug, Default)]
struct Output {
    data: Vec<u8>,
    writes: usize,
    closed: bool,
}

/// Collects every archive it creates in memory, keyed by name.
///
/// Clones share the same storage, so a clone kept by the caller can inspect
/// what a session wrote.
#[derive(Clone, Default)]
pub struct MemorySinkFactory {
    outputs: Arc<Mutex<BTreeMap<String, Output>>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Output>> {
        self.outputs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Names of all sinks created so far.
    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Bytes written to the sink named `name`.
    pub fn output(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().get(name).map(|o| o.data.clone())
    }

    /// Number of write calls the sink named `name` received.
    pub fn writes(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, |o| o.writes)
    }

    pub fn is_closed(&self, name: &str) -> bool {
        self.lock().get(name).is_some_and(|o| o.closed)
    }
}

#[async_trait]
impl SinkFactory for MemorySinkFactory {
    async fn create(&self, name: &str) -> Result<Box<dyn Sink>> {
        self.lock().insert(name.to_string(), Output::default());
        Ok(Box::new(MemorySink {
            name: name.to_string(),
            factory: self.clone(),
        }))
    }
}

struct MemorySink {
    name: String,
    factory: MemorySinkFactory,
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let mut outputs = self.factory.lock();
        let output = outputs
            .get_mut(&self.name)
            .ok_or_else(|| anyhow!("sink {} was removed", self.name))?;
        if output.closed {
            bail!("sink {} is closed", self.name);
        }
        output.data.extend_from_slice(chunk);
        output.writes += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(output) = self.factory.lock().get_mut(&self.name) {
            output.closed = true;
        }
        Ok(())
    }
}

/// Random access over an in-memory archive.
pub struct MemoryReader {
    data: Vec<u8>,
}

impl MemoryReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ReadAt for MemoryReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let start = usize::try_from(offset)?.min(self.data.len());
        let end = start.saturating_add(buf.len()).min(self.data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&self.data[start..end]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}
