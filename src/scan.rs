//! Depth-first discovery of the files to archive.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ArchiveOptions;
use crate::error::{Error, Result};
use crate::io::{ContentStream, Entry, EntryKind};
use crate::progress::ProgressTracker;

/// A file (or, when enabled, a directory) selected for the archive.
#[derive(Clone)]
pub struct FileDescriptor {
    /// Slash-separated path relative to the scan root, without a leading `/`.
    pub path: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub modified: Option<NaiveDateTime>,
    source: Arc<dyn Entry>,
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("path", &self.path)
            .field("is_dir", &self.is_dir)
            .field("size", &self.size)
            .field("modified", &self.modified)
            .finish()
    }
}

impl FileDescriptor {
    pub(crate) fn from_entry(entry: &Arc<dyn Entry>) -> Self {
        let is_dir = entry.kind() == EntryKind::Directory;
        Self {
            path: entry.full_path().trim_start_matches('/').to_string(),
            is_dir,
            size: if is_dir { Some(0) } else { entry.size_hint() },
            modified: entry.modified(),
            source: Arc::clone(entry),
        }
    }

    /// Open the entry's content. Each call starts a fresh stream.
    pub async fn open(&self) -> anyhow::Result<ContentStream> {
        self.source.open().await
    }
}

/// Result of a scan: the files in archive order plus the directories that
/// could not be listed.
#[derive(Debug, Default)]
pub(crate) struct ScanOutcome {
    pub files: Vec<FileDescriptor>,
    pub skipped: Vec<Error>,
}

/// Entry names are stored with a 16-bit length.
const MAX_NAME_LEN: usize = u16::MAX as usize;

pub(crate) struct EntryScanner<'a> {
    options: &'a ArchiveOptions,
    cancel: &'a CancellationToken,
}

impl<'a> EntryScanner<'a> {
    pub fn new(options: &'a ArchiveOptions, cancel: &'a CancellationToken) -> Self {
        Self { options, cancel }
    }

    /// Walk `roots` depth-first, siblings in the order their source lists
    /// them.
    pub async fn scan(
        &self,
        roots: Vec<Arc<dyn Entry>>,
        tracker: &mut ProgressTracker,
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome::default();
        let mut stack = vec![roots.into_iter()];

        while let Some(level) = stack.last_mut() {
            let Some(entry) = level.next() else {
                stack.pop();
                continue;
            };
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match entry.kind() {
                EntryKind::File => admit(FileDescriptor::from_entry(&entry), &mut outcome),
                EntryKind::Directory => {
                    let (children, failure) = read_children(entry.as_ref()).await;
                    // A listing that broke off part way still keeps what it returned
                    let listed = failure.is_none() || !children.is_empty();
                    if let Some(e) = failure {
                        let err = Error::scan(entry.full_path(), &e);
                        warn!(error = %err, listed = children.len(), "directory listing failed");
                        outcome.skipped.push(err);
                    }
                    if listed {
                        debug!(path = %entry.full_path(), children = children.len(), "listed directory");
                        if self.options.include_directories {
                            admit(FileDescriptor::from_entry(&entry), &mut outcome);
                        }
                        stack.push(children.into_iter());
                    }
                }
            }
            tracker.on_scanned(outcome.files.len());
        }

        if outcome.files.is_empty() {
            return Err(Error::EmptyArchive);
        }
        Ok(outcome)
    }
}

fn admit(descriptor: FileDescriptor, outcome: &mut ScanOutcome) {
    let len = descriptor.path.len() + usize::from(descriptor.is_dir);
    if len > MAX_NAME_LEN {
        let err = Error::Scan {
            path: descriptor.path,
            detail: format!("name is {len} bytes, the limit is {MAX_NAME_LEN}"),
        };
        warn!(error = %err, "skipping entry");
        outcome.skipped.push(err);
        return;
    }
    outcome.files.push(descriptor);
}

/// Drain a directory's listing. On failure, returns the children read so far
/// along with the error.
async fn read_children(entry: &dyn Entry) -> (Vec<Arc<dyn Entry>>, Option<anyhow::Error>) {
    let mut children = Vec::new();
    let mut reader = match entry.children().await {
        Ok(reader) => reader,
        Err(e) => return (children, Some(e)),
    };
    loop {
        match reader.read_entries().await {
            Ok(batch) if batch.is_empty() => return (children, None),
            Ok(batch) => children.extend(batch),
            Err(e) => return (children, Some(e)),
        }
    }
}
