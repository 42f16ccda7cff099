use std::io::Write;

use flate2::Compression;
use flate2::write::DeflateEncoder;

use crate::error::{Error, Result};

use super::structures::CompressionMethod;

/// A validated compression level, 0 (stored) through 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub fn new(value: u32) -> Result<Self> {
        if value > 9 {
            return Err(Error::InvalidLevel { value });
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn method(&self) -> CompressionMethod {
        if self.0 == 0 {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflate
        }
    }
}

/// CRC and sizes of one archived entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryStats {
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
}

enum Encoder {
    Stored,
    Deflate(DeflateEncoder<Vec<u8>>),
}

/// Incremental compressor for a single entry.
///
/// Fed chunk by chunk; `finish` consumes it, so statistics are only ever
/// observed after the stream has been fully drained.
pub struct StreamingCompressor {
    encoder: Encoder,
    hasher: crc32fast::Hasher,
    uncompressed: u64,
    compressed: u64,
}

impl StreamingCompressor {
    pub fn new(level: CompressionLevel) -> Self {
        let encoder = match level.method() {
            CompressionMethod::Deflate => Encoder::Deflate(DeflateEncoder::new(
                Vec::new(),
                Compression::new(level.value()),
            )),
            _ => Encoder::Stored,
        };
        Self {
            encoder,
            hasher: crc32fast::Hasher::new(),
            uncompressed: 0,
            compressed: 0,
        }
    }

    pub fn method(&self) -> CompressionMethod {
        match self.encoder {
            Encoder::Stored => CompressionMethod::Stored,
            Encoder::Deflate(_) => CompressionMethod::Deflate,
        }
    }

    /// Feed one chunk and return the compressed bytes it produced, which may
    /// be empty while the encoder buffers.
    pub fn update<'a>(&'a mut self, chunk: &'a [u8]) -> Result<&'a [u8]> {
        self.hasher.update(chunk);
        self.uncompressed += chunk.len() as u64;
        let out: &[u8] = match &mut self.encoder {
            Encoder::Stored => chunk,
            Encoder::Deflate(encoder) => {
                encoder.get_mut().clear();
                encoder
                    .write_all(chunk)
                    .map_err(|e| Error::internal(format!("deflate: {e}")))?;
                encoder.get_ref()
            }
        };
        self.compressed += out.len() as u64;
        Ok(out)
    }

    /// Flush the encoder, returning its trailing bytes and the entry stats.
    pub fn finish(self) -> Result<(Vec<u8>, EntryStats)> {
        let tail = match self.encoder {
            Encoder::Stored => Vec::new(),
            Encoder::Deflate(mut encoder) => {
                encoder.get_mut().clear();
                encoder
                    .finish()
                    .map_err(|e| Error::internal(format!("deflate: {e}")))?
            }
        };
        let stats = EntryStats {
            crc32: self.hasher.finalize(),
            compressed_size: self.compressed + tail.len() as u64,
            uncompressed_size: self.uncompressed,
        };
        Ok((tail, stats))
    }
}
