//! # zipstream
//!
//! A streaming ZIP archive builder.
//!
//! Files are discovered through pluggable [`Entry`] sources, optionally run
//! through a reversible [`Transform`], compressed entry by entry and pushed
//! into a flow-controlled [`Sink`] without ever holding a whole file or the
//! whole archive in memory. Sizes and CRCs trail each entry in a data
//! descriptor, so nothing is ever seeked back and patched.
//!
//! ## Features
//!
//! - Depth-first scanning of local or in-memory trees, with unreadable
//!   directories skipped and reported
//! - STORED (level 0) and DEFLATE (levels 1-9) entries
//! - ZIP64 for entries of unknown or very large size and for huge archives
//! - Progress, throughput and current-file observers that never slow the
//!   pipeline down
//! - Cancellation through a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! - An archive reader with CRC verification, for listing and testing
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use zipstream::{ArchiveOptions, ArchiveSession, FileSinkFactory, LocalEntry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut session = ArchiveSession::new(FileSinkFactory::new("."), ArchiveOptions::default());
//!     session.register_current_file(|name| eprintln!("  adding: {name}"));
//!
//!     let report = session.scan(vec![LocalEntry::new(Path::new("photos"))?]).await?;
//!     println!("{} files", report.file_count);
//!
//!     session.compress("photos", 6).await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod progress;
pub mod scan;
pub mod session;
pub mod transform;
pub mod zip;

pub use cli::Cli;
pub use config::ArchiveOptions;
pub use error::{Error, ErrorRecord, Result};
pub use io::{
    ContentStream, DirectoryReader, Entry, EntryKind, FileSinkFactory, LocalEntry,
    LocalFileReader, MemoryEntry, MemoryReader, MemorySinkFactory, ReadAt, Sink, SinkFactory,
};
pub use progress::{CompressProgress, ProgressSnapshot, Speed};
pub use scan::FileDescriptor;
pub use session::{ArchiveSession, CompressReport, ScanReport};
pub use transform::{StreamFilter, Transform, TransformRegistry};
pub use zip::{ZipExtractor, ZipFileEntry};
