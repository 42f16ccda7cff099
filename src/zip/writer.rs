use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::io::Sink;
use crate::scan::FileDescriptor;

use super::compressor::EntryStats;
use super::header::FileHeader;
use super::structures::{
    CompressionMethod, EndOfCentralDirectory, Zip64EOCD, Zip64EOCDLocator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Idle,
    Writing(usize),
    Finalizing,
    Closed,
    Failed,
}

/// Totals of a finished archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub entries: usize,
    pub bytes_written: u64,
    pub zip64: bool,
}

/// Sequences archive records into a [`Sink`].
///
/// Output is an append log: every record is emitted once, in order, and
/// only one sink write is ever outstanding. Small records are coalesced
/// until `threshold` bytes are pending.
pub struct ArchiveWriter {
    sink: Box<dyn Sink>,
    state: WriterState,
    offset: u64,
    headers: Vec<FileHeader>,
    current: Option<FileHeader>,
    buffer: Vec<u8>,
    threshold: usize,
    flushed: u64,
}

impl ArchiveWriter {
    pub fn new(sink: Box<dyn Sink>, threshold: usize) -> Self {
        Self {
            sink,
            state: WriterState::Idle,
            offset: 0,
            headers: Vec::new(),
            current: None,
            buffer: Vec::new(),
            threshold,
            flushed: 0,
        }
    }

    /// Bytes emitted so far, including those still buffered.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes acknowledged by the sink.
    pub fn bytes_flushed(&self) -> u64 {
        self.flushed
    }

    pub fn entries(&self) -> usize {
        self.headers.len()
    }

    fn expect_state(&self, expected: WriterState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "{operation} in writer state {:?}",
                self.state
            )))
        }
    }

    async fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        self.offset += bytes.len() as u64;
        if self.buffer.len() >= self.threshold {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.sink.write(&self.buffer).await {
            self.state = WriterState::Failed;
            return Err(Error::sink(&e));
        }
        self.flushed += self.buffer.len() as u64;
        trace!(bytes = self.buffer.len(), total = self.flushed, "sink write acknowledged");
        self.buffer.clear();
        Ok(())
    }

    /// Write the local header of the next entry.
    pub async fn begin_entry(
        &mut self,
        descriptor: &FileDescriptor,
        method: CompressionMethod,
    ) -> Result<()> {
        self.expect_state(WriterState::Idle, "begin_entry")?;
        let header = FileHeader::new(descriptor, method, self.offset);
        let mut record = Vec::with_capacity(64 + header.name().len());
        header.build_local(&mut record)?;
        self.state = WriterState::Writing(self.headers.len());
        self.current = Some(header);
        self.emit(&record).await
    }

    /// Write compressed payload of the current entry.
    pub async fn write_payload(&mut self, data: &[u8]) -> Result<()> {
        if !matches!(self.state, WriterState::Writing(_)) {
            return Err(Error::internal(format!(
                "write_payload in writer state {:?}",
                self.state
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.emit(data).await
    }

    /// Close the current entry with its final CRC and sizes.
    pub async fn finish_entry(&mut self, stats: EntryStats) -> Result<()> {
        let WriterState::Writing(index) = self.state else {
            return Err(Error::internal(format!(
                "finish_entry in writer state {:?}",
                self.state
            )));
        };
        let mut header = self
            .current
            .take()
            .ok_or_else(|| Error::internal("no entry in progress"))?;
        header.finalize(stats)?;
        if header.has_data_descriptor() {
            let mut record = Vec::with_capacity(24);
            header.data_descriptor(&mut record)?;
            self.emit(&record).await?;
        }
        debug!(
            index,
            name = header.name(),
            crc32 = stats.crc32,
            compressed = stats.compressed_size,
            uncompressed = stats.uncompressed_size,
            "entry written"
        );
        self.headers.push(header);
        self.state = WriterState::Idle;
        Ok(())
    }

    /// Write the central directory and end records, then close the sink.
    pub async fn finish(&mut self) -> Result<ArchiveSummary> {
        self.expect_state(WriterState::Idle, "finish")?;
        self.state = WriterState::Finalizing;

        let cd_offset = self.offset;
        let mut directory = Vec::new();
        for header in &self.headers {
            header.build_central(&mut directory)?;
        }
        self.emit(&directory).await?;
        let cd_size = directory.len() as u64;

        let entries = self.headers.len() as u64;
        let zip64 = entries >= 0xFFFF || cd_size >= 0xFFFFFFFF || cd_offset >= 0xFFFFFFFF;
        let mut trailer = Vec::with_capacity(
            Zip64EOCD::MIN_SIZE + Zip64EOCDLocator::SIZE + EndOfCentralDirectory::SIZE,
        );
        let encode = |e: std::io::Error| Error::internal(format!("end record encoding: {e}"));
        if zip64 {
            let eocd64_offset = cd_offset + cd_size;
            Zip64EOCD::new(entries, cd_size, cd_offset)
                .write_into(&mut trailer)
                .map_err(encode)?;
            Zip64EOCDLocator::new(eocd64_offset)
                .write_into(&mut trailer)
                .map_err(encode)?;
        }
        EndOfCentralDirectory::new(entries, cd_size, cd_offset)
            .write_into(&mut trailer)
            .map_err(encode)?;
        self.emit(&trailer).await?;
        self.flush().await?;

        if let Err(e) = self.sink.close().await {
            self.state = WriterState::Failed;
            return Err(Error::sink(&e));
        }
        self.state = WriterState::Closed;
        debug!(entries, bytes = self.flushed, zip64, "archive closed");
        Ok(ArchiveSummary {
            entries: self.headers.len(),
            bytes_written: self.flushed,
            zip64,
        })
    }

    /// Close the sink without finishing the archive. Errors are ignored.
    pub async fn abort(&mut self) {
        if self.state == WriterState::Closed {
            return;
        }
        if let Err(e) = self.sink.close().await {
            let detail = format!("{e:#}");
            debug!(error = %detail, "sink close after abort failed");
        }
        self.state = WriterState::Closed;
    }
}
