use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::io::Cursor;

use anyhow::{Result, bail};

/// APPNOTE 6.3
pub const VERSION_MADE_BY: u16 = 63;

/// Deflate and stored entries without zip64 fields
pub const VERSION_NEEDED_DEFAULT: u16 = 20;

/// First version with zip64 support
pub const VERSION_NEEDED_ZIP64: u16 = 45;

/// General purpose flag bit 3: CRC and sizes follow the data in a data descriptor
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;

/// General purpose flag bit 11: name is UTF-8
pub const FLAG_UTF8: u16 = 0x0800;

/// Tag of the zip64 extended information extra field
pub const ZIP64_EXTRA_TAG: u16 = 0x0001;

/// Entries declared at or above this size, or of unknown size, get zip64
/// local headers. Leaves headroom for deflate output outgrowing its input.
pub const ZIP64_SIZE_THRESHOLD: u64 = 0xF000_0000;

/// MS-DOS directory attribute, used as external attributes for directories
pub const DOS_DIRECTORY_ATTRIBUTE: u32 = 0x10;

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// MS-DOS date and time as stored in ZIP headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DosDateTime {
    pub time: u16,
    pub date: u16,
}

impl DosDateTime {
    /// 1980-01-01 00:00:00, the earliest representable moment.
    pub const EPOCH: DosDateTime = DosDateTime {
        time: 0,
        date: (1 << 5) | 1,
    };

    /// Convert a wall-clock time. Years outside 1980..=2107 are clamped to
    /// the nearest representable moment; seconds lose their lowest bit.
    pub fn from_naive(dt: &NaiveDateTime) -> Self {
        if dt.year() < 1980 {
            return Self::EPOCH;
        }
        if dt.year() > 2107 {
            return Self {
                time: (23 << 11) | (59 << 5) | (58 / 2),
                date: (127 << 9) | (12 << 5) | 31,
            };
        }
        let time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
        let date =
            (((dt.year() - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
        Self { time, date }
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    /// Build the record for a single-disk archive. Values that do not fit
    /// are saturated, which tells readers to consult the zip64 record.
    pub fn new(entries: u64, cd_size: u64, cd_offset: u64) -> Self {
        let entries = entries.min(0xFFFF) as u16;
        Self {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entries,
            total_entries: entries,
            cd_size: cd_size.min(0xFFFFFFFF) as u32,
            cd_offset: cd_offset.min(0xFFFFFFFF) as u32,
            comment_len: 0,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Invalid End of Central Directory");
        }

        // Verify signature
        if &data[0..4] != Self::SIGNATURE {
            bail!("Invalid End of Central Directory");
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn write_into(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.extend_from_slice(Self::SIGNATURE);
        buf.write_u16::<LittleEndian>(self.disk_number)?;
        buf.write_u16::<LittleEndian>(self.disk_with_cd)?;
        buf.write_u16::<LittleEndian>(self.disk_entries)?;
        buf.write_u16::<LittleEndian>(self.total_entries)?;
        buf.write_u32::<LittleEndian>(self.cd_size)?;
        buf.write_u32::<LittleEndian>(self.cd_offset)?;
        buf.write_u16::<LittleEndian>(self.comment_len)
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn new(eocd64_offset: u64) -> Self {
        Self {
            disk_with_eocd64: 0,
            eocd64_offset,
            total_disks: 1,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Invalid ZIP64 format");
        }

        if &data[0..4] != Self::SIGNATURE {
            bail!("Invalid ZIP64 format");
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write_into(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.extend_from_slice(Self::SIGNATURE);
        buf.write_u32::<LittleEndian>(self.disk_with_eocd64)?;
        buf.write_u64::<LittleEndian>(self.eocd64_offset)?;
        buf.write_u32::<LittleEndian>(self.total_disks)
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn new(entries: u64, cd_size: u64, cd_offset: u64) -> Self {
        Self {
            // Size of the remaining record, excluding signature and this field
            eocd64_size: (Self::MIN_SIZE - 12) as u64,
            version_made_by: VERSION_MADE_BY,
            version_needed: VERSION_NEEDED_ZIP64,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entries,
            total_entries: entries,
            cd_size,
            cd_offset,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            bail!("Invalid ZIP64 format");
        }

        if &data[0..4] != Self::SIGNATURE {
            bail!("Invalid ZIP64 format");
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write_into(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.extend_from_slice(Self::SIGNATURE);
        buf.write_u64::<LittleEndian>(self.eocd64_size)?;
        buf.write_u16::<LittleEndian>(self.version_made_by)?;
        buf.write_u16::<LittleEndian>(self.version_needed)?;
        buf.write_u32::<LittleEndian>(self.disk_number)?;
        buf.write_u32::<LittleEndian>(self.disk_with_cd)?;
        buf.write_u64::<LittleEndian>(self.disk_entries)?;
        buf.write_u64::<LittleEndian>(self.total_entries)?;
        buf.write_u64::<LittleEndian>(self.cd_size)?;
        buf.write_u64::<LittleEndian>(self.cd_offset)
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Data descriptor following an entry's data when flag bit 3 is set
pub const DATA_DESCRIPTOR_SIGNATURE: &[u8] = b"PK\x07\x08";

/// Parsed ZIP file entry information
#[derive(Debug, Clone)]
pub struct ZipFileEntry {
    pub file_name: String,
    pub compression_method: CompressionMethod,
    pub flags: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub lfh_offset: u64,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub is_directory: bool,
}

impl ZipFileEntry {
    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }

    pub fn has_data_descriptor(&self) -> bool {
        self.flags & FLAG_DATA_DESCRIPTOR != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn dos_time_round_trips_through_entry_accessors() {
        let dos = DosDateTime::from_naive(&at(2024, 2, 29, 13, 45, 31));
        let entry = ZipFileEntry {
            file_name: "a".to_string(),
            compression_method: CompressionMethod::Deflate,
            flags: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            lfh_offset: 0,
            last_mod_time: dos.time,
            last_mod_date: dos.date,
            is_directory: false,
        };
        assert_eq!(entry.mod_date(), (2024, 2, 29));
        assert_eq!(entry.mod_time(), (13, 45, 30));
    }

    #[test]
    fn dos_time_clamps_out_of_range_years() {
        assert_eq!(
            DosDateTime::from_naive(&at(1970, 1, 1, 0, 0, 0)),
            DosDateTime::EPOCH
        );
        let late = DosDateTime::from_naive(&at(2200, 6, 1, 0, 0, 0));
        assert_eq!(late.date >> 9, 127);
    }

    #[test]
    fn eocd_saturates_and_parses_back() {
        let mut buf = Vec::new();
        EndOfCentralDirectory::new(70_000, 1234, 0x1_0000_0000)
            .write_into(&mut buf)
            .unwrap();
        assert_eq!(buf.len(), EndOfCentralDirectory::SIZE);

        let eocd = EndOfCentralDirectory::from_bytes(&buf).unwrap();
        assert_eq!(eocd.total_entries, 0xFFFF);
        assert_eq!(eocd.cd_size, 1234);
        assert_eq!(eocd.cd_offset, 0xFFFFFFFF);
        assert!(eocd.is_zip64());
    }

    #[test]
    fn zip64_records_parse_back() {
        let mut buf = Vec::new();
        Zip64EOCD::new(3, 300, 5_000_000_000)
            .write_into(&mut buf)
            .unwrap();
        assert_eq!(buf.len(), Zip64EOCD::MIN_SIZE);
        let record = Zip64EOCD::from_bytes(&buf).unwrap();
        assert_eq!(record.eocd64_size, 44);
        assert_eq!(record.total_entries, 3);
        assert_eq!(record.cd_offset, 5_000_000_000);

        let mut buf = Vec::new();
        Zip64EOCDLocator::new(42).write_into(&mut buf).unwrap();
        assert_eq!(buf.len(), Zip64EOCDLocator::SIZE);
        assert_eq!(Zip64EOCDLocator::from_bytes(&buf).unwrap().eocd64_offset, 42);
    }
}
