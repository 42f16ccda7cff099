//! ZIP archive construction and inspection.
//!
//! ## Architecture
//!
//! - [`structures`]: records of the ZIP format (EOCD, zip64 records, DOS time)
//! - [`header`]: local/central header builder with deferred sizes
//! - [`compressor`]: incremental stored/deflate compression with CRC-32
//! - [`writer`]: sequences records into a flow-controlled sink
//! - [`parser`] and [`extractor`]: read archives back from any [`ReadAt`](crate::io::ReadAt)
//!
//! ## Layout written
//!
//! Every entry is a local file header with zeroed CRC and sizes, the
//! compressed data, and a data descriptor carrying the real values
//! (directories have no data and no descriptor). The central directory
//! and end of central directory record follow the last entry. Entries of
//! unknown or near-4 GiB size use zip64 local headers and descriptors, and
//! the zip64 end records are added only when a count, size or offset
//! overflows the classic fields.
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - Only STORED and DEFLATE methods

mod compressor;
mod extractor;
mod header;
mod parser;
mod structures;
mod writer;

pub use compressor::{CompressionLevel, EntryStats, StreamingCompressor};
pub use extractor::ZipExtractor;
pub use header::FileHeader;
pub use parser::ZipParser;
pub use structures::*;
pub use writer::{ArchiveSummary, ArchiveWriter};
