use std::io::Write;
use std::sync::Arc;

use flate2::write::DeflateDecoder;

use crate::error::{Error, Result};
use crate::io::ReadAt;
use crate::transform::{StreamFilter, Transform};

use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};

/// Size of each compressed read while extracting.
const EXTRACT_CHUNK: usize = 64 * 1024;

/// ZIP file extractor
pub struct ZipExtractor<R: ReadAt> {
    parser: ZipParser<R>,
}

impl<R: ReadAt> ZipExtractor<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self {
            parser: ZipParser::new(reader),
        }
    }

    /// List all entries in the archive
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        self.parser.list_files().await.map_err(Error::invalid_archive)
    }

    /// Extract an entry's content to memory
    pub async fn extract_to_memory(&self, entry: &ZipFileEntry) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(entry.uncompressed_size.min(1 << 24) as usize);
        self.extract_with(entry, None, &mut out).await?;
        Ok(out)
    }

    /// Stream an entry's content into `writer`, inflating it, verifying its
    /// CRC and, with `recover`, undoing the transform it was archived with.
    ///
    /// Returns the number of bytes written.
    pub async fn extract_with<W: Write>(
        &self,
        entry: &ZipFileEntry,
        recover: Option<&Transform>,
        writer: &mut W,
    ) -> Result<u64> {
        if entry.is_directory {
            return Ok(0);
        }

        let mut output = CheckedOutput {
            filter: recover.map(Transform::inverse_filter),
            hasher: crc32fast::Hasher::new(),
            archived: 0,
            written: 0,
            scratch: Vec::new(),
            out: writer,
        };

        match entry.compression_method {
            CompressionMethod::Stored => {
                self.pump(entry, &mut output).await?;
            }
            CompressionMethod::Deflate => {
                let mut decoder = DeflateDecoder::new(&mut output);
                self.pump(entry, &mut decoder).await?;
                decoder.finish().map_err(|e| self.corrupt(entry, e))?;
            }
            CompressionMethod::Unknown(method) => {
                return Err(Error::invalid_archive(format!(
                    "{}: unsupported compression method {}",
                    entry.file_name, method
                )));
            }
        }

        if output.archived != entry.uncompressed_size {
            return Err(Error::invalid_archive(format!(
                "{}: expected {} bytes, inflated {}",
                entry.file_name, entry.uncompressed_size, output.archived
            )));
        }
        let actual = output.hasher.clone().finalize();
        if actual != entry.crc32 {
            return Err(Error::ChecksumMismatch {
                path: entry.file_name.clone(),
                expected: entry.crc32,
                actual,
            });
        }
        output.finish().map_err(|e| Error::read(&entry.file_name, e))?;
        Ok(output.written)
    }

    /// Copy the entry's compressed bytes into `sink`, one chunk at a time.
    async fn pump<S: Write>(&self, entry: &ZipFileEntry, sink: &mut S) -> Result<()> {
        let data_offset = self
            .parser
            .get_data_offset(entry)
            .await
            .map_err(Error::invalid_archive)?;

        let mut buf = vec![0u8; EXTRACT_CHUNK];
        let mut remaining = entry.compressed_size;
        let mut offset = data_offset;
        while remaining > 0 {
            let n = remaining.min(EXTRACT_CHUNK as u64) as usize;
            self.parser
                .read_exact_at(offset, &mut buf[..n])
                .await
                .map_err(Error::invalid_archive)?;
            sink.write_all(&buf[..n])
                .map_err(|e| self.corrupt(entry, e))?;
            offset += n as u64;
            remaining -= n as u64;
        }
        Ok(())
    }

    fn corrupt(&self, entry: &ZipFileEntry, e: std::io::Error) -> Error {
        Error::invalid_archive(format!("{}: {}", entry.file_name, e))
    }
}

/// Checksums archived bytes, then recovers and forwards them.
struct CheckedOutput<'a, W: Write> {
    filter: Option<Box<dyn StreamFilter>>,
    hasher: crc32fast::Hasher,
    archived: u64,
    written: u64,
    scratch: Vec<u8>,
    out: &'a mut W,
}

impl<W: Write> CheckedOutput<'_, W> {
    fn forward(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.out.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> std::io::Result<()> {
        if let Some(filter) = self.filter.as_mut() {
            self.scratch.clear();
            filter.finish(&mut self.scratch);
            let tail = std::mem::take(&mut self.scratch);
            self.forward(&tail)?;
        }
        self.out.flush()
    }
}

impl<W: Write> Write for CheckedOutput<'_, W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(data);
        self.archived += data.len() as u64;
        match self.filter.as_mut() {
            Some(filter) => {
                self.scratch.clear();
                filter.update(data, &mut self.scratch);
                let recovered = std::mem::take(&mut self.scratch);
                self.forward(&recovered)?;
                self.scratch = recovered;
            }
            None => self.forward(data)?,
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryEntry, MemoryReader, MemorySinkFactory, SinkFactory};
    use crate::scan::FileDescriptor;
    use crate::zip::{ArchiveWriter, CompressionLevel, StreamingCompressor};

    async fn archive(level: u32, files: &[(&str, &[u8])], transform: &Transform) -> Vec<u8> {
        let sinks = MemorySinkFactory::new();
        let mut writer = ArchiveWriter::new(sinks.create("t.zip").await.unwrap(), 0);
        for (path, data) in files {
            let descriptor = FileDescriptor::from_entry(&MemoryEntry::file(*path, data.to_vec()));
            let mut filter = transform.forward_filter();
            let mut archived = Vec::new();
            filter.update(data, &mut archived);
            filter.finish(&mut archived);

            let mut compressor = StreamingCompressor::new(CompressionLevel::new(level).unwrap());
            writer
                .begin_entry(&descriptor, compressor.method())
                .await
                .unwrap();
            let out = compressor.update(&archived).unwrap().to_vec();
            writer.write_payload(&out).await.unwrap();
            let (tail, stats) = compressor.finish().unwrap();
            writer.write_payload(&tail).await.unwrap();
            writer.finish_entry(stats).await.unwrap();
        }
        writer.finish().await.unwrap();
        sinks.output("t.zip").unwrap()
    }

    #[tokio::test]
    async fn extracts_stored_and_deflated() {
        for level in [0, 9] {
            let data = archive(
                level,
                &[("a.txt", &b"hello"[..]), ("b/c.txt", &[][..])],
                &Transform::identity(),
            )
            .await;
            let extractor = ZipExtractor::new(Arc::new(MemoryReader::new(data)));
            let entries = extractor.list_files().await.unwrap();
            let names: Vec<&str> = entries.iter().map(|e| e.file_name.as_str()).collect();
            assert_eq!(names, vec!["a.txt", "b/c.txt"]);
            assert!(entries[0].has_data_descriptor());
            assert_eq!(extractor.extract_to_memory(&entries[0]).await.unwrap(), b"hello");
            assert!(extractor.extract_to_memory(&entries[1]).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn recovers_transformed_content() {
        let original = b"0123456789abcdef-tail".to_vec();
        let transform = Transform::invert();
        let data = archive(6, &[("x.bin", &original[..])], &transform).await;
        let extractor = ZipExtractor::new(Arc::new(MemoryReader::new(data)));
        let entry = &extractor.list_files().await.unwrap()[0];

        let raw = extractor.extract_to_memory(entry).await.unwrap();
        assert_ne!(raw, original);

        let mut recovered = Vec::new();
        let written = extractor
            .extract_with(entry, Some(&transform), &mut recovered)
            .await
            .unwrap();
        assert_eq!(recovered, original);
        assert_eq!(written, original.len() as u64);
    }

    #[tokio::test]
    async fn detects_corrupted_content() {
        let mut data = archive(0, &[("a.txt", &b"hello"[..])], &Transform::identity()).await;
        // Stored payload starts right after the 30-byte header and the name
        data[30 + 5] ^= 0x20;
        let extractor = ZipExtractor::new(Arc::new(MemoryReader::new(data)));
        let entry = &extractor.list_files().await.unwrap()[0];
        let err = extractor.extract_to_memory(entry).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { ref path, .. } if path == "a.txt"));
    }

    #[tokio::test]
    async fn garbage_is_an_invalid_archive() {
        let extractor = ZipExtractor::new(Arc::new(MemoryReader::new(vec![7u8; 100])));
        assert!(matches!(
            extractor.list_files().await,
            Err(Error::InvalidArchive { .. })
        ));
    }
}
