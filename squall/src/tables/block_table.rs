//! The classic block table and its companion hi-block table

use bitflags::bitflags;

use crate::crypto::{decrypt_data, encrypt_data, file_key};
use crate::error::{Error, Result};

bitflags! {
    /// Storage flags of a block table entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u32 {
        /// Compressed with the legacy implode algorithm
        const IMPLODE = 0x0000_0100;
        /// Compressed with one or more of the newer methods
        const COMPRESS = 0x0000_0200;
        /// Sector data is encrypted
        const ENCRYPTED = 0x0001_0000;
        /// The encryption key is adjusted by position and size
        const FIX_KEY = 0x0002_0000;
        /// The file is an incremental patch
        const PATCH_FILE = 0x0010_0000;
        /// Stored as a single unit instead of sectors
        const SINGLE_UNIT = 0x0100_0000;
        /// The file was deleted by a patch
        const DELETE_MARKER = 0x0200_0000;
        /// A checksum trails each sector
        const SECTOR_CRC = 0x0400_0000;
        /// The entry describes a stored file
        const EXISTS = 0x8000_0000;
    }
}

impl BlockFlags {
    /// True if any compression flag is set
    pub fn is_compressed(&self) -> bool {
        self.intersects(BlockFlags::COMPRESS | BlockFlags::IMPLODE)
    }
}

/// One block table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Position of the file data, relative to the archive start
    pub file_pos: u32,
    /// Size of the file as stored, including sector metadata
    pub compressed_size: u32,
    /// Size of the file once unpacked
    pub file_size: u32,
    /// Storage flags
    pub flags: BlockFlags,
}

impl BlockEntry {
    /// Serialized entry size in bytes
    pub const SIZE: usize = 16;

    /// An unused entry, reusable by the next added file
    pub fn free() -> Self {
        BlockEntry {
            file_pos: 0,
            compressed_size: 0,
            file_size: 0,
            flags: BlockFlags::empty(),
        }
    }

    /// True if the entry currently describes a stored file
    pub fn exists(&self) -> bool {
        self.flags.contains(BlockFlags::EXISTS)
    }

    fn from_le_bytes(bytes: &[u8]) -> Self {
        BlockEntry {
            file_pos: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            compressed_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            file_size: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            // Foreign archives may carry flag bits this crate does not
            // model; they are preserved verbatim.
            flags: BlockFlags::from_bits_retain(u32::from_le_bytes([
                bytes[12], bytes[13], bytes[14], bytes[15],
            ])),
        }
    }

    fn write_le_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.file_pos.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&self.flags.bits().to_le_bytes());
    }
}

/// The block table of an open archive
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    entries: Vec<BlockEntry>,
}

impl BlockTable {
    /// Creates an empty table
    pub fn new() -> Self {
        BlockTable::default()
    }

    /// Parses a table from its stored form
    pub fn from_encrypted_bytes(mut raw: Vec<u8>) -> Result<Self> {
        if raw.len() % BlockEntry::SIZE != 0 {
            return Err(Error::bad_format("block table size is not a multiple of 16"));
        }

        decrypt_data(&mut raw, file_key("(block table)"));
        let entries = raw
            .chunks_exact(BlockEntry::SIZE)
            .map(BlockEntry::from_le_bytes)
            .collect();
        Ok(BlockTable { entries })
    }

    /// Serializes the table to its stored form
    pub fn to_encrypted_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.entries.len() * BlockEntry::SIZE);
        for entry in &self.entries {
            entry.write_le_bytes(&mut raw);
        }
        encrypt_data(&mut raw, file_key("(block table)"));
        raw
    }

    /// Number of entries
    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    /// True if the table holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in table order
    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// The entry at `index`, if it is in range
    pub fn get(&self, index: u32) -> Option<&BlockEntry> {
        self.entries.get(index as usize)
    }

    /// Mutable access to the entry at `index`
    pub fn get_mut(&mut self, index: u32) -> Option<&mut BlockEntry> {
        self.entries.get_mut(index as usize)
    }

    /// Appends an entry and returns its index
    pub fn push(&mut self, entry: BlockEntry) -> u32 {
        self.entries.push(entry);
        self.entries.len() as u32 - 1
    }

    /// First entry freed by a removal, if any
    pub fn find_free(&self) -> Option<u32> {
        self.entries
            .iter()
            .position(|entry| !entry.exists())
            .map(|index| index as u32)
    }
}

/// Parses the hi-block table: one u16 of position high bits per block
/// entry, stored in the clear.
pub fn parse_hi_block_table(raw: &[u8]) -> Result<Vec<u16>> {
    if raw.len() % 2 != 0 {
        return Err(Error::bad_format("hi-block table size is not a multiple of 2"));
    }
    Ok(raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Serializes a hi-block table
pub fn hi_block_table_bytes(values: &[u16]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(values.len() * 2);
    for value in values {
        raw.extend_from_slice(&value.to_le_bytes());
    }
    raw
}
