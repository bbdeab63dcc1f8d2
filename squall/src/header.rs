//! Archive header parsing and serialization
//!
//! An archive may start at any 512-byte boundary inside its container
//! file, optionally preceded by a user data block. All table offsets
//! stored in the header are relative to the header's own position.

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Little-endian "MPQ\x1A": a regular archive header
pub const HEADER_SIGNATURE: u32 = 0x1A51_504D;

/// Little-endian "MPQ\x1B": a user data block preceding the header
pub const USER_DATA_SIGNATURE: u32 = 0x1B51_504D;

/// Headers are only ever found at this alignment
pub const HEADER_ALIGNMENT: u64 = 0x200;

/// Default sector size shift for new archives (4 KiB sectors)
pub const DEFAULT_SECTOR_SIZE_SHIFT: u16 = 3;

// Largest shift that keeps `512 << shift` inside a u32.
pub(crate) const MAX_SECTOR_SIZE_SHIFT: u16 = 22;

/// Archive format versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatVersion {
    /// Original format: classic hash and block tables only
    V1 = 0,
    /// Adds the hi-block table and 48-bit table positions
    V2 = 1,
    /// Adds the 64-bit archive size and the HET/BET tables
    V3 = 2,
    /// Adds 64-bit table sizes and MD5 digests
    V4 = 3,
}

impl FormatVersion {
    /// Maps the stored version number to a known version
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(FormatVersion::V1),
            1 => Some(FormatVersion::V2),
            2 => Some(FormatVersion::V3),
            3 => Some(FormatVersion::V4),
            _ => None,
        }
    }

    /// Size in bytes of a header of this version
    pub fn header_size(self) -> u32 {
        match self {
            FormatVersion::V1 => 0x20,
            FormatVersion::V2 => 0x2C,
            FormatVersion::V3 => 0x44,
            FormatVersion::V4 => 0xD0,
        }
    }
}

/// Fields added by format version 2
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderV2 {
    /// Position of the hi-block table, 0 if absent
    pub hi_block_table_pos: u64,
    /// High 16 bits of the hash table position
    pub hash_table_pos_hi: u16,
    /// High 16 bits of the block table position
    pub block_table_pos_hi: u16,
}

/// Fields added by format version 3
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderV3 {
    /// 64-bit archive size, replacing the 32-bit field
    pub archive_size_64: u64,
    /// Position of the BET table, 0 if absent
    pub bet_table_pos: u64,
    /// Position of the HET table, 0 if absent
    pub het_table_pos: u64,
}

/// Fields added by format version 4
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderV4 {
    /// Stored size of the hash table in bytes
    pub hash_table_size_64: u64,
    /// Stored size of the block table in bytes
    pub block_table_size_64: u64,
    /// Stored size of the hi-block table in bytes
    pub hi_block_table_size_64: u64,
    /// Stored size of the HET table in bytes
    pub het_table_size_64: u64,
    /// Stored size of the BET table in bytes
    pub bet_table_size_64: u64,
    /// Chunk size for raw data digests
    pub raw_chunk_size: u32,
    /// MD5 of the block table as stored
    pub md5_block_table: [u8; 16],
    /// MD5 of the hash table as stored
    pub md5_hash_table: [u8; 16],
    /// MD5 of the hi-block table as stored
    pub md5_hi_block_table: [u8; 16],
    /// MD5 of the BET table as stored
    pub md5_bet_table: [u8; 16],
    /// MD5 of the HET table as stored
    pub md5_het_table: [u8; 16],
    /// MD5 of the header itself, up to this field
    pub md5_header: [u8; 16],
}

/// User data block in front of an archive header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData {
    /// Maximum size of the user data area
    pub user_data_size: u32,
    /// Offset of the archive header, relative to this block
    pub header_offset: u32,
    /// Size of the user data header itself
    pub user_data_header_size: u32,
}

impl UserData {
    fn read_body<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(UserData {
            user_data_size: reader.read_u32::<LittleEndian>()?,
            header_offset: reader.read_u32::<LittleEndian>()?,
            user_data_header_size: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// Parsed archive header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Size of the header in bytes
    pub header_size: u32,
    /// 32-bit archive size, authoritative only for version 1
    pub archive_size: u32,
    /// Format version of the archive
    pub format_version: FormatVersion,
    /// Sector size is `512 << sector_size_shift`
    pub sector_size_shift: u16,
    /// Position of the hash table (low 32 bits)
    pub hash_table_pos: u32,
    /// Position of the block table (low 32 bits)
    pub block_table_pos: u32,
    /// Number of entries in the hash table
    pub hash_table_size: u32,
    /// Number of entries in the block table
    pub block_table_size: u32,
    /// Version 2 extension fields
    pub v2: Option<HeaderV2>,
    /// Version 3 extension fields
    pub v3: Option<HeaderV3>,
    /// Version 4 extension fields
    pub v4: Option<HeaderV4>,
}

impl Header {
    /// Creates a zeroed header of the given version
    pub fn new(format_version: FormatVersion) -> Self {
        Header {
            header_size: format_version.header_size(),
            archive_size: 0,
            format_version,
            sector_size_shift: DEFAULT_SECTOR_SIZE_SHIFT,
            hash_table_pos: 0,
            block_table_pos: 0,
            hash_table_size: 0,
            block_table_size: 0,
            v2: (format_version >= FormatVersion::V2).then(HeaderV2::default),
            v3: (format_version >= FormatVersion::V3).then(HeaderV3::default),
            v4: (format_version >= FormatVersion::V4).then(HeaderV4::default),
        }
    }

    /// Reads a header from the current stream position.
    ///
    /// The stream must be positioned at the header signature.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let signature = reader.read_u32::<LittleEndian>()?;
        if signature != HEADER_SIGNATURE {
            return Err(Error::bad_format("missing archive header signature"));
        }

        let header_size = reader.read_u32::<LittleEndian>()?;
        let archive_size = reader.read_u32::<LittleEndian>()?;
        let raw_version = reader.read_u16::<LittleEndian>()?;
        let format_version = FormatVersion::from_u16(raw_version).ok_or_else(|| {
            Error::bad_format(format!("unsupported format version {raw_version}"))
        })?;
        if header_size < format_version.header_size() {
            return Err(Error::bad_format(format!(
                "header size {header_size:#x} too small for format version {raw_version}"
            )));
        }

        let sector_size_shift = reader.read_u16::<LittleEndian>()?;
        if sector_size_shift > MAX_SECTOR_SIZE_SHIFT {
            return Err(Error::bad_format(format!(
                "unreasonable sector size shift {sector_size_shift}"
            )));
        }

        let mut header = Header {
            header_size,
            archive_size,
            format_version,
            sector_size_shift,
            hash_table_pos: reader.read_u32::<LittleEndian>()?,
            block_table_pos: reader.read_u32::<LittleEndian>()?,
            hash_table_size: reader.read_u32::<LittleEndian>()?,
            block_table_size: reader.read_u32::<LittleEndian>()?,
            v2: None,
            v3: None,
            v4: None,
        };

        if format_version >= FormatVersion::V2 {
            header.v2 = Some(HeaderV2 {
                hi_block_table_pos: reader.read_u64::<LittleEndian>()?,
                hash_table_pos_hi: reader.read_u16::<LittleEndian>()?,
                block_table_pos_hi: reader.read_u16::<LittleEndian>()?,
            });
        }

        if format_version >= FormatVersion::V3 {
            header.v3 = Some(HeaderV3 {
                archive_size_64: reader.read_u64::<LittleEndian>()?,
                bet_table_pos: reader.read_u64::<LittleEndian>()?,
                het_table_pos: reader.read_u64::<LittleEndian>()?,
            });
        }

        if format_version >= FormatVersion::V4 {
            let mut v4 = HeaderV4 {
                hash_table_size_64: reader.read_u64::<LittleEndian>()?,
                block_table_size_64: reader.read_u64::<LittleEndian>()?,
                hi_block_table_size_64: reader.read_u64::<LittleEndian>()?,
                het_table_size_64: reader.read_u64::<LittleEndian>()?,
                bet_table_size_64: reader.read_u64::<LittleEndian>()?,
                raw_chunk_size: reader.read_u32::<LittleEndian>()?,
                ..HeaderV4::default()
            };
            reader.read_exact(&mut v4.md5_block_table)?;
            reader.read_exact(&mut v4.md5_hash_table)?;
            reader.read_exact(&mut v4.md5_hi_block_table)?;
            reader.read_exact(&mut v4.md5_bet_table)?;
            reader.read_exact(&mut v4.md5_het_table)?;
            reader.read_exact(&mut v4.md5_header)?;
            header.v4 = Some(v4);
        }

        Ok(header)
    }

    /// Writes the header at the current stream position
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(HEADER_SIGNATURE)?;
        writer.write_u32::<LittleEndian>(self.header_size)?;
        writer.write_u32::<LittleEndian>(self.archive_size)?;
        writer.write_u16::<LittleEndian>(self.format_version as u16)?;
        writer.write_u16::<LittleEndian>(self.sector_size_shift)?;
        writer.write_u32::<LittleEndian>(self.hash_table_pos)?;
        writer.write_u32::<LittleEndian>(self.block_table_pos)?;
        writer.write_u32::<LittleEndian>(self.hash_table_size)?;
        writer.write_u32::<LittleEndian>(self.block_table_size)?;

        if self.format_version >= FormatVersion::V2 {
            let v2 = self.v2.unwrap_or_default();
            writer.write_u64::<LittleEndian>(v2.hi_block_table_pos)?;
            writer.write_u16::<LittleEndian>(v2.hash_table_pos_hi)?;
            writer.write_u16::<LittleEndian>(v2.block_table_pos_hi)?;
        }

        if self.format_version >= FormatVersion::V3 {
            let v3 = self.v3.unwrap_or_default();
            writer.write_u64::<LittleEndian>(v3.archive_size_64)?;
            writer.write_u64::<LittleEndian>(v3.bet_table_pos)?;
            writer.write_u64::<LittleEndian>(v3.het_table_pos)?;
        }

        if self.format_version >= FormatVersion::V4 {
            let v4 = self.v4.unwrap_or_default();
            writer.write_u64::<LittleEndian>(v4.hash_table_size_64)?;
            writer.write_u64::<LittleEndian>(v4.block_table_size_64)?;
            writer.write_u64::<LittleEndian>(v4.hi_block_table_size_64)?;
            writer.write_u64::<LittleEndian>(v4.het_table_size_64)?;
            writer.write_u64::<LittleEndian>(v4.bet_table_size_64)?;
            writer.write_u32::<LittleEndian>(v4.raw_chunk_size)?;
            writer.write_all(&v4.md5_block_table)?;
            writer.write_all(&v4.md5_hash_table)?;
            writer.write_all(&v4.md5_hi_block_table)?;
            writer.write_all(&v4.md5_bet_table)?;
            writer.write_all(&v4.md5_het_table)?;
            writer.write_all(&v4.md5_header)?;
        }

        Ok(())
    }

    /// Sector size in bytes
    pub fn sector_size(&self) -> u32 {
        512 << self.sector_size_shift
    }

    /// Hash table position including the version 2 high bits
    pub fn hash_table_offset(&self) -> u64 {
        let hi = self.v2.map_or(0, |v2| u64::from(v2.hash_table_pos_hi) << 32);
        hi | u64::from(self.hash_table_pos)
    }

    /// Block table position including the version 2 high bits
    pub fn block_table_offset(&self) -> u64 {
        let hi = self.v2.map_or(0, |v2| u64::from(v2.block_table_pos_hi) << 32);
        hi | u64::from(self.block_table_pos)
    }

    /// Hi-block table position, if one is present
    pub fn hi_block_table_offset(&self) -> Option<u64> {
        self.v2
            .and_then(|v2| (v2.hi_block_table_pos != 0).then_some(v2.hi_block_table_pos))
    }

    /// HET table position, if one is present
    pub fn het_table_offset(&self) -> Option<u64> {
        self.v3
            .and_then(|v3| (v3.het_table_pos != 0).then_some(v3.het_table_pos))
    }

    /// BET table position, if one is present
    pub fn bet_table_offset(&self) -> Option<u64> {
        self.v3
            .and_then(|v3| (v3.bet_table_pos != 0).then_some(v3.bet_table_pos))
    }

    /// Archive size, preferring the 64-bit field when present
    pub fn archive_size_64(&self) -> u64 {
        self.v3
            .map_or(u64::from(self.archive_size), |v3| v3.archive_size_64)
    }
}

/// Locates the archive header inside a container file.
///
/// Scans 512-byte boundaries from the start of the file. A user data
/// block redirects the search to the position it names; anything else
/// there is treated as a malformed archive. Returns the absolute
/// header position, the user data block if one was seen, and the
/// parsed header.
pub fn find_header<R: Read + Seek>(reader: &mut R) -> Result<(u64, Option<UserData>, Header)> {
    let file_size = reader.seek(SeekFrom::End(0))?;
    let mut offset = 0u64;

    while offset + 4 <= file_size {
        reader.seek(SeekFrom::Start(offset))?;
        let signature = reader.read_u32::<LittleEndian>()?;

        match signature {
            HEADER_SIGNATURE => {
                reader.seek(SeekFrom::Start(offset))?;
                let header = Header::read(reader)?;
                return Ok((offset, None, header));
            }
            USER_DATA_SIGNATURE => {
                let user_data = UserData::read_body(reader)?;
                let target = offset + u64::from(user_data.header_offset);
                if target + 4 > file_size {
                    return Err(Error::bad_format(
                        "user data block points past the end of the file",
                    ));
                }
                reader.seek(SeekFrom::Start(target))?;
                let header = Header::read(reader)?;
                return Ok((target, Some(user_data), header));
            }
            _ => offset += HEADER_ALIGNMENT,
        }
    }

    Err(Error::bad_format("no archive header found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_header(version: FormatVersion) -> Header {
        let mut header = Header::new(version);
        header.archive_size = 0x10000;
        header.hash_table_pos = 0x2000;
        header.block_table_pos = 0x2100;
        header.hash_table_size = 16;
        header.block_table_size = 9;
        if let Some(v2) = header.v2.as_mut() {
            v2.hash_table_pos_hi = 0x0001;
        }
        if let Some(v3) = header.v3.as_mut() {
            v3.archive_size_64 = 0x10000;
        }
        if let Some(v4) = header.v4.as_mut() {
            v4.raw_chunk_size = 0x4000;
            v4.md5_header = [0xAB; 16];
        }
        header
    }

    #[test]
    fn round_trip_every_version() {
        for version in [
            FormatVersion::V1,
            FormatVersion::V2,
            FormatVersion::V3,
            FormatVersion::V4,
        ] {
            let header = sample_header(version);
            let mut buffer = Vec::new();
            header.write(&mut buffer).unwrap();
            assert_eq!(buffer.len() as u32, version.header_size());

            let parsed = Header::read(&mut Cursor::new(&buffer)).unwrap();
            assert_eq!(parsed, header);
        }
    }

    #[test]
    fn rejects_wrong_signature() {
        let mut buffer = Vec::new();
        sample_header(FormatVersion::V1).write(&mut buffer).unwrap();
        buffer[3] = 0x1B;

        let err = Header::read(&mut Cursor::new(&buffer)).unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buffer = Vec::new();
        sample_header(FormatVersion::V1).write(&mut buffer).unwrap();
        buffer[12] = 9;

        let err = Header::read(&mut Cursor::new(&buffer)).unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)));
    }

    #[test]
    fn finds_header_past_leading_data() {
        let mut buffer = vec![0u8; HEADER_ALIGNMENT as usize];
        sample_header(FormatVersion::V1).write(&mut buffer).unwrap();

        let (offset, user_data, _) = find_header(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(offset, HEADER_ALIGNMENT);
        assert!(user_data.is_none());
    }

    #[test]
    fn follows_user_data_block() {
        let mut buffer = Vec::new();
        let mut cursor = Cursor::new(&mut buffer);
        cursor.write_u32::<LittleEndian>(USER_DATA_SIGNATURE).unwrap();
        cursor.write_u32::<LittleEndian>(0x200 - 16).unwrap();
        cursor.write_u32::<LittleEndian>(0x200).unwrap();
        cursor.write_u32::<LittleEndian>(16).unwrap();
        buffer.resize(0x200, 0);
        sample_header(FormatVersion::V2).write(&mut buffer).unwrap();

        let (offset, user_data, header) = find_header(&mut Cursor::new(&buffer)).unwrap();
        assert_eq!(offset, 0x200);
        assert_eq!(user_data.unwrap().header_offset, 0x200);
        assert_eq!(header.format_version, FormatVersion::V2);
    }

    #[test]
    fn user_data_past_eof_is_malformed() {
        let mut buffer = Vec::new();
        let mut cursor = Cursor::new(&mut buffer);
        cursor.write_u32::<LittleEndian>(USER_DATA_SIGNATURE).unwrap();
        cursor.write_u32::<LittleEndian>(0).unwrap();
        cursor.write_u32::<LittleEndian>(0x8000).unwrap();
        cursor.write_u32::<LittleEndian>(16).unwrap();

        let err = find_header(&mut Cursor::new(&buffer)).unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)));
    }

    #[test]
    fn scan_without_header_is_malformed() {
        let buffer = vec![0u8; 0x1000];
        let err = find_header(&mut Cursor::new(&buffer)).unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)));
    }

    #[test]
    fn high_bits_extend_table_offsets() {
        let header = sample_header(FormatVersion::V2);
        assert_eq!(header.hash_table_offset(), 0x1_0000_2000);
        assert_eq!(header.block_table_offset(), 0x2100);
    }

    #[test]
    fn sector_size_from_shift() {
        let mut header = Header::new(FormatVersion::V1);
        assert_eq!(header.sector_size(), 4096);
        header.sector_size_shift = 0;
        assert_eq!(header.sector_size(), 512);
    }
}
