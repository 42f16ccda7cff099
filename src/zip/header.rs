use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::scan::FileDescriptor;

use super::compressor::EntryStats;
use super::structures::*;

const U32_MAX: u64 = 0xFFFFFFFF;

#[derive(Debug, Clone, Copy)]
enum HeaderState {
    Pending,
    Finalized(EntryStats),
}

/// Local and central header data for one entry.
///
/// CRC and sizes are unknown while the entry streams, so the local header
/// is written with them zeroed and the real values follow in a data
/// descriptor. The central record can only be built once the header has
/// been finalized with those values.
#[derive(Debug, Clone)]
pub struct FileHeader {
    name: String,
    is_dir: bool,
    method: CompressionMethod,
    modified: DosDateTime,
    lfh_offset: u64,
    zip64: bool,
    state: HeaderState,
}

impl FileHeader {
    pub fn new(descriptor: &FileDescriptor, method: CompressionMethod, lfh_offset: u64) -> Self {
        let mut name = descriptor.path.trim_start_matches('/').to_string();
        if descriptor.is_dir && !name.ends_with('/') {
            name.push('/');
        }
        let (method, zip64) = if descriptor.is_dir {
            (CompressionMethod::Stored, false)
        } else {
            let zip64 = descriptor
                .size
                .is_none_or(|size| size >= ZIP64_SIZE_THRESHOLD);
            (method, zip64)
        };
        Self {
            name,
            is_dir: descriptor.is_dir,
            method,
            modified: descriptor
                .modified
                .as_ref()
                .map(DosDateTime::from_naive)
                .unwrap_or(DosDateTime::EPOCH),
            lfh_offset,
            zip64,
            state: HeaderState::Pending,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_zip64(&self) -> bool {
        self.zip64
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    pub fn stats(&self) -> Option<EntryStats> {
        match self.state {
            HeaderState::Pending => None,
            HeaderState::Finalized(stats) => Some(stats),
        }
    }

    fn flags(&self) -> u16 {
        if self.is_dir {
            FLAG_UTF8
        } else {
            FLAG_UTF8 | FLAG_DATA_DESCRIPTOR
        }
    }

    /// Whether a data descriptor follows the entry's data.
    pub fn has_data_descriptor(&self) -> bool {
        !self.is_dir
    }

    /// Append the local file header.
    pub fn build_local(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.write_local(buf).map_err(encode_error)
    }

    fn write_local(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        let sizes = if self.zip64 { 0xFFFFFFFF } else { 0 };
        let extra_len = if self.zip64 { 20 } else { 0 };
        let name_len = self.name_len()?;

        buf.extend_from_slice(LFH_SIGNATURE);
        buf.write_u16::<LittleEndian>(self.version_needed(self.zip64))?;
        buf.write_u16::<LittleEndian>(self.flags())?;
        buf.write_u16::<LittleEndian>(self.method.as_u16())?;
        buf.write_u16::<LittleEndian>(self.modified.time)?;
        buf.write_u16::<LittleEndian>(self.modified.date)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(sizes)?;
        buf.write_u32::<LittleEndian>(sizes)?;
        buf.write_u16::<LittleEndian>(name_len)?;
        buf.write_u16::<LittleEndian>(extra_len)?;
        buf.extend_from_slice(self.name.as_bytes());
        if self.zip64 {
            buf.write_u16::<LittleEndian>(ZIP64_EXTRA_TAG)?;
            buf.write_u16::<LittleEndian>(16)?;
            buf.write_u64::<LittleEndian>(0)?;
            buf.write_u64::<LittleEndian>(0)?;
        }
        Ok(())
    }

    /// Record the entry's final CRC and sizes.
    pub fn finalize(&mut self, stats: EntryStats) -> Result<()> {
        if let HeaderState::Finalized(_) = self.state {
            return Err(Error::internal(format!("{} finalized twice", self.name)));
        }
        if !self.zip64 && (stats.compressed_size > U32_MAX || stats.uncompressed_size > U32_MAX)
        {
            return Err(Error::read(
                &self.name,
                "content is larger than its declared size",
            ));
        }
        self.state = HeaderState::Finalized(stats);
        Ok(())
    }

    /// Append the data descriptor: 16 bytes, or 24 for zip64 entries.
    pub fn data_descriptor(&self, buf: &mut Vec<u8>) -> Result<()> {
        let stats = self.finalized()?;
        self.write_descriptor(&stats, buf).map_err(encode_error)
    }

    fn write_descriptor(&self, stats: &EntryStats, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.extend_from_slice(DATA_DESCRIPTOR_SIGNATURE);
        buf.write_u32::<LittleEndian>(stats.crc32)?;
        if self.zip64 {
            buf.write_u64::<LittleEndian>(stats.compressed_size)?;
            buf.write_u64::<LittleEndian>(stats.uncompressed_size)
        } else {
            buf.write_u32::<LittleEndian>(stats.compressed_size as u32)?;
            buf.write_u32::<LittleEndian>(stats.uncompressed_size as u32)
        }
    }

    /// Append the central directory record.
    pub fn build_central(&self, buf: &mut Vec<u8>) -> Result<()> {
        let stats = self.finalized()?;
        self.write_central(&stats, buf).map_err(encode_error)
    }

    fn write_central(&self, stats: &EntryStats, buf: &mut Vec<u8>) -> std::io::Result<()> {
        // Fields that overflow 32 bits move into the zip64 extra, in this order
        let mut extra = Vec::new();
        let uncompressed = saturate(stats.uncompressed_size, &mut extra)?;
        let compressed = saturate(stats.compressed_size, &mut extra)?;
        let offset = saturate(self.lfh_offset, &mut extra)?;
        let zip64 = self.zip64 || !extra.is_empty();
        let extra_len = if extra.is_empty() { 0 } else { extra.len() + 4 };
        let name_len = self.name_len()?;

        buf.extend_from_slice(CDFH_SIGNATURE);
        buf.write_u16::<LittleEndian>(VERSION_MADE_BY)?;
        buf.write_u16::<LittleEndian>(self.version_needed(zip64))?;
        buf.write_u16::<LittleEndian>(self.flags())?;
        buf.write_u16::<LittleEndian>(self.method.as_u16())?;
        buf.write_u16::<LittleEndian>(self.modified.time)?;
        buf.write_u16::<LittleEndian>(self.modified.date)?;
        buf.write_u32::<LittleEndian>(stats.crc32)?;
        buf.write_u32::<LittleEndian>(compressed)?;
        buf.write_u32::<LittleEndian>(uncompressed)?;
        buf.write_u16::<LittleEndian>(name_len)?;
        buf.write_u16::<LittleEndian>(extra_len as u16)?;
        buf.write_u16::<LittleEndian>(0)?; // comment
        buf.write_u16::<LittleEndian>(0)?; // disk number start
        buf.write_u16::<LittleEndian>(0)?; // internal attributes
        buf.write_u32::<LittleEndian>(if self.is_dir {
            DOS_DIRECTORY_ATTRIBUTE
        } else {
            0
        })?;
        buf.write_u32::<LittleEndian>(offset)?;
        buf.extend_from_slice(self.name.as_bytes());
        if !extra.is_empty() {
            buf.write_u16::<LittleEndian>(ZIP64_EXTRA_TAG)?;
            buf.write_u16::<LittleEndian>(extra.len() as u16)?;
            buf.extend_from_slice(&extra);
        }
        Ok(())
    }

    fn name_len(&self) -> std::io::Result<u16> {
        u16::try_from(self.name.len()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("name of {} bytes does not fit a header", self.name.len()),
            )
        })
    }

    fn version_needed(&self, zip64: bool) -> u16 {
        if zip64 {
            VERSION_NEEDED_ZIP64
        } else {
            VERSION_NEEDED_DEFAULT
        }
    }

    fn finalized(&self) -> Result<EntryStats> {
        self.stats()
            .ok_or_else(|| Error::internal(format!("{} has no final sizes yet", self.name)))
    }
}

fn saturate(value: u64, extra: &mut Vec<u8>) -> std::io::Result<u32> {
    if value >= U32_MAX {
        extra.write_u64::<LittleEndian>(value)?;
        Ok(0xFFFFFFFF)
    } else {
        Ok(value as u32)
    }
}

fn encode_error(e: std::io::Error) -> Error {
    Error::internal(format!("header encoding: {e}"))
}
