//! Capabilities the engine consumes, and the host adapters that provide them.
//!
//! The engine never touches a filesystem or an output file directly. Entries
//! are discovered through [`Entry`] / [`DirectoryReader`], output goes to a
//! [`Sink`] obtained from a [`SinkFactory`], and finished archives are read
//! back through [`ReadAt`].

mod local;
mod memory;

pub use local::{FileSink, FileSinkFactory, LocalDirectoryReader, LocalEntry, LocalFileReader};
pub use memory::{MemoryEntry, MemoryReader, MemorySinkFactory};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::io::AsyncRead;

/// Readable byte content of a file entry.
pub type ContentStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// A node of a hierarchical source: either a file or a directory.
#[async_trait]
pub trait Entry: Send + Sync {
    /// Slash-separated path from the scan root, e.g. `/photos/a.jpg`.
    fn full_path(&self) -> String;

    fn kind(&self) -> EntryKind;

    /// Declared content size, if the source knows it up front.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Last modification time as local wall-clock time.
    fn modified(&self) -> Option<NaiveDateTime> {
        None
    }

    /// Open the file content. May be called more than once.
    async fn open(&self) -> Result<ContentStream>;

    /// Start listing the children of a directory.
    async fn children(&self) -> Result<Box<dyn DirectoryReader>>;
}

/// Paginated listing of a directory's children.
#[async_trait]
pub trait DirectoryReader: Send {
    /// Return the next batch of children. An empty batch ends the listing.
    async fn read_entries(&mut self) -> Result<Vec<Arc<dyn Entry>>>;
}

/// Push-based, flow-controlled destination for archive bytes.
///
/// A write resolves only once the sink has accepted the chunk; callers must
/// not issue another write before that.
#[async_trait]
pub trait Sink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Creates the sink an archive named `name` is written into.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create(&self, name: &str) -> Result<Box<dyn Sink>>;
}

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;
}
