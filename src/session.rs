//! The public face of the engine: scan once, compress any number of times.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ArchiveOptions;
use crate::error::{Error, Result};
use crate::io::{Entry, SinkFactory};
use crate::progress::{CompressProgress, Observers, ProgressSnapshot, ProgressTracker, Speed};
use crate::scan::{EntryScanner, FileDescriptor};
use crate::transform::{Transform, TransformRegistry};
use crate::zip::{
    ArchiveSummary, ArchiveWriter, CompressionLevel, CompressionMethod, EntryStats,
    StreamingCompressor,
};

/// Outcome of [`ArchiveSession::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub file_count: usize,
    /// Directories that could not be listed, as [`Error::Scan`] values.
    pub skipped: Vec<Error>,
}

/// Outcome of a compress operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressReport {
    /// Name the sink was created with.
    pub archive_name: String,
    pub entries: usize,
    /// Bytes read from content streams, after the transform.
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub zip64: bool,
    pub elapsed: Duration,
}

/// Scans hierarchical sources and streams them as ZIP archives into sinks
/// created by `F`.
pub struct ArchiveSession<F: SinkFactory> {
    sinks: F,
    options: ArchiveOptions,
    transforms: TransformRegistry,
    observers: Observers,
    cancel: CancellationToken,
    files: Vec<FileDescriptor>,
    snapshot: Arc<Mutex<ProgressSnapshot>>,
    busy: AtomicBool,
}

impl<F: SinkFactory> ArchiveSession<F> {
    pub fn new(sinks: F, options: ArchiveOptions) -> Self {
        Self {
            sinks,
            options,
            transforms: TransformRegistry::default(),
            observers: Observers::default(),
            cancel: CancellationToken::new(),
            files: Vec::new(),
            snapshot: Arc::new(Mutex::new(ProgressSnapshot::default())),
            busy: AtomicBool::new(false),
        }
    }

    /// Make a transform available to [`compress_with_transform`](Self::compress_with_transform).
    pub fn register_transform(&mut self, transform: Transform) {
        self.transforms.register(transform);
    }

    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    /// Install the token that cancels running and future operations.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn register_scan_progress(&mut self, f: impl Fn(usize) + Send + Sync + 'static) {
        self.observers.set_scan_progress(f);
    }

    pub fn register_compress_progress(
        &mut self,
        f: impl Fn(CompressProgress) + Send + Sync + 'static,
    ) {
        self.observers.set_compress_progress(f);
    }

    pub fn register_average_speed(&mut self, f: impl Fn(Speed) + Send + Sync + 'static) {
        self.observers.set_average_speed(f);
    }

    pub fn register_current_speed(&mut self, f: impl Fn(Speed) + Send + Sync + 'static) {
        self.observers.set_current_speed(f);
    }

    pub fn register_current_file(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.observers.set_current_file(f);
    }

    /// Latest progress of the current or last operation.
    pub fn progress(&self) -> ProgressSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Files selected by the last successful scan, in archive order.
    pub fn files(&self) -> &[FileDescriptor] {
        &self.files
    }

    /// Discover the files under `roots`, replacing any previous scan.
    pub async fn scan(&mut self, roots: Vec<Arc<dyn Entry>>) -> Result<ScanReport> {
        self.files.clear();
        let mut tracker = ProgressTracker::start(&self.observers, Arc::clone(&self.snapshot), &self.options);
        tracker.begin_scan();

        let outcome = EntryScanner::new(&self.options, &self.cancel)
            .scan(roots, &mut tracker)
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracker.finish().await;
                return Err(e);
            }
        };

        tracker.scan_finished(outcome.files.len());
        tracker.finish().await;
        info!(
            files = outcome.files.len(),
            skipped = outcome.skipped.len(),
            "scan complete"
        );
        self.files = outcome.files;
        Ok(ScanReport {
            file_count: self.files.len(),
            skipped: outcome.skipped,
        })
    }

    /// Archive the scanned files into a sink named `output_name`.
    pub async fn compress(&self, output_name: &str, level: u32) -> Result<CompressReport> {
        self.run(output_name, level, None).await
    }

    /// Like [`compress`](Self::compress), with every file's content passed
    /// through the transform registered as `script_id`.
    pub async fn compress_with_transform(
        &self,
        output_name: &str,
        level: u32,
        script_id: &str,
    ) -> Result<CompressReport> {
        self.run(output_name, level, Some(script_id)).await
    }

    async fn run(
        &self,
        output_name: &str,
        level: u32,
        script_id: Option<&str>,
    ) -> Result<CompressReport> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        let level = CompressionLevel::new(level)?;
        if self.files.is_empty() {
            return Err(Error::EmptyArchive);
        }
        let transform = self.transforms.resolve(script_id)?;

        let archive_name = archive_name(output_name);
        info!(
            archive = %archive_name,
            entries = self.files.len(),
            level = level.value(),
            transform = transform.name(),
            "compressing"
        );
        let sink = self
            .sinks
            .create(&archive_name)
            .await
            .map_err(|e| Error::sink(&e))?;
        let mut writer = ArchiveWriter::new(sink, self.options.write_threshold);

        let mut tracker = ProgressTracker::start(&self.observers, Arc::clone(&self.snapshot), &self.options);
        let bytes_total = self.files.iter().filter_map(|f| f.size).sum();
        tracker.begin_compress(self.files.len(), bytes_total);
        let started = Instant::now();

        let mut bytes_read = 0;
        let result = self
            .write_entries(&mut writer, &mut tracker, &transform, level, &mut bytes_read)
            .await;
        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                if e.is_cancelled() {
                    info!(archive = %archive_name, "compress cancelled");
                } else {
                    warn!(archive = %archive_name, error = %e, "compress failed");
                }
                writer.abort().await;
                tracker.finish().await;
                return Err(e);
            }
        };

        tracker.report_speeds(summary.bytes_written);
        tracker.finish().await;
        let elapsed = started.elapsed();
        info!(
            archive = %archive_name,
            bytes = summary.bytes_written,
            elapsed_ms = elapsed.as_millis() as u64,
            "archive complete"
        );
        Ok(CompressReport {
            archive_name,
            entries: summary.entries,
            bytes_read,
            bytes_written: summary.bytes_written,
            zip64: summary.zip64,
            elapsed,
        })
    }

    async fn write_entries(
        &self,
        writer: &mut ArchiveWriter,
        tracker: &mut ProgressTracker,
        transform: &Transform,
        level: CompressionLevel,
        bytes_read: &mut u64,
    ) -> Result<ArchiveSummary> {
        let mut buf = vec![0u8; self.options.chunk_size.max(1)];

        for file in &self.files {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tracker.on_current_file(&file.path);

            if file.is_dir {
                writer.begin_entry(file, CompressionMethod::Stored).await?;
                writer.finish_entry(EntryStats::default()).await?;
                tracker.on_entry_done();
                continue;
            }

            let content = file.open().await.map_err(|e| Error::read(&file.path, &e))?;
            let mut content = transform.transform(content);
            let mut compressor = StreamingCompressor::new(level);
            writer.begin_entry(file, compressor.method()).await?;

            loop {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let n = fill_chunk(&mut content, &mut buf)
                    .await
                    .map_err(|e| Error::read(&file.path, e))?;
                if n == 0 {
                    break;
                }
                *bytes_read += n as u64;
                tracker.on_bytes_read(n as u64);

                let compressed = compressor.update(&buf[..n])?;
                writer.write_payload(compressed).await?;
                tracker.on_bytes_written(writer.bytes_flushed());
            }

            let (tail, stats) = compressor.finish()?;
            writer.write_payload(&tail).await?;
            writer.finish_entry(stats).await?;
            tracker.on_entry_done();
            tracker.on_bytes_written(writer.bytes_flushed());
        }

        debug!(entries = writer.entries(), offset = writer.offset(), "writing central directory");
        writer.finish().await
    }
}

/// Appends `.zip` unless the name already ends with it.
fn archive_name(name: &str) -> String {
    if name.to_ascii_lowercase().ends_with(".zip") {
        name.to_string()
    } else {
        format!("{name}.zip")
    }
}

/// Read until `buf` is full or the stream ends.
async fn fill_chunk<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(Error::internal("another compress operation is running"));
        }
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryEntry, MemorySinkFactory};

    #[test]
    fn appends_zip_suffix() {
        assert_eq!(archive_name("photos"), "photos.zip");
        assert_eq!(archive_name("photos.zip"), "photos.zip");
        assert_eq!(archive_name("PHOTOS.ZIP"), "PHOTOS.ZIP");
        assert_eq!(archive_name("photos.tar"), "photos.tar.zip");
    }

    #[test]
    fn busy_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = BusyGuard::acquire(&flag).unwrap();
        assert!(matches!(BusyGuard::acquire(&flag), Err(Error::Internal { .. })));
        drop(guard);
        assert!(BusyGuard::acquire(&flag).is_ok());
    }

    #[tokio::test]
    async fn fill_chunk_reads_across_short_reads() {
        let data = b"abcdefghij".to_vec();
        let mut stream = tokio::io::BufReader::with_capacity(3, &data[..]);
        let mut buf = [0u8; 8];
        assert_eq!(fill_chunk(&mut stream, &mut buf).await.unwrap(), 8);
        assert_eq!(fill_chunk(&mut stream, &mut buf).await.unwrap(), 2);
        assert_eq!(fill_chunk(&mut stream, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn validation_happens_before_the_sink_exists() {
        let sinks = MemorySinkFactory::new();
        let mut session = ArchiveSession::new(sinks.clone(), ArchiveOptions::default());

        assert_eq!(session.compress("out", 5).await.unwrap_err(), Error::EmptyArchive);

        session
            .scan(vec![MemoryEntry::file("/a.txt", "hello")])
            .await
            .unwrap();
        assert_eq!(
            session.compress("out", 10).await.unwrap_err(),
            Error::InvalidLevel { value: 10 }
        );
        assert_eq!(
            session
                .compress_with_transform("out", 5, "rot13")
                .await
                .unwrap_err(),
            Error::Transform {
                script_id: "rot13".to_string()
            }
        );
        assert!(sinks.names().is_empty());
    }

    #[tokio::test]
    async fn failed_scan_clears_previous_files() {
        let mut session = ArchiveSession::new(MemorySinkFactory::new(), ArchiveOptions::default());
        session
            .scan(vec![MemoryEntry::file("/a.txt", "hello")])
            .await
            .unwrap();
        assert_eq!(session.files().len(), 1);

        let err = session
            .scan(vec![MemoryEntry::directory("/empty", vec![])])
            .await
            .unwrap_err();
        assert_eq!(err, Error::EmptyArchive);
        assert!(session.files().is_empty());
    }
}
