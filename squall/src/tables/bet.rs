//! The BET table of version 3 archives
//!
//! Holds the storage metadata the classic block table would, as
//! bit-packed records sized to the archive's actual value ranges, plus
//! the low bits of each file's name hash for lookup verification.

use std::io::{Read, Seek};

use byteorder::{LittleEndian, ReadBytesExt};

use super::block_table::BlockFlags;
use super::{load_ext_table, read_bits};
use crate::crypto::file_key;
use crate::error::{Error, Result};

/// Storage metadata for one file, unpacked from a BET record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BetFileInfo {
    /// Position of the file data, relative to the archive start
    pub file_pos: u64,
    /// Size of the file as stored
    pub compressed_size: u64,
    /// Size of the file once unpacked
    pub file_size: u64,
    /// Storage flags
    pub flags: BlockFlags,
}

/// Read-only view of a BET table
#[derive(Debug)]
pub struct BetTable {
    file_count: u32,
    table_entry_size: u32,
    bit_index_file_pos: u32,
    bit_index_file_size: u32,
    bit_index_cmp_size: u32,
    bit_index_flag_index: u32,
    bit_count_file_pos: u32,
    bit_count_file_size: u32,
    bit_count_cmp_size: u32,
    bit_count_flag_index: u32,
    bit_total_name_hash: u32,
    file_flags: Vec<u32>,
    file_table: Vec<u8>,
    name_hashes: Vec<u8>,
}

impl BetTable {
    /// Little-endian "BET\x1A"
    pub const SIGNATURE: u32 = 0x1A54_4542;

    const HEADER_SIZE: usize = 19 * 4;

    /// Reads a table from `offset`, where `stored_size` covers the
    /// 12-byte prefix and the table body as stored.
    pub fn read<R: Read + Seek>(reader: &mut R, offset: u64, stored_size: u64) -> Result<Self> {
        let data = load_ext_table(
            reader,
            offset,
            stored_size,
            Self::SIGNATURE,
            file_key("(block table)"),
        )?;
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::bad_format("BET table header truncated"));
        }

        let mut cursor = std::io::Cursor::new(&data);
        let _table_size = cursor.read_u32::<LittleEndian>()?;
        let file_count = cursor.read_u32::<LittleEndian>()?;
        let _unknown_08 = cursor.read_u32::<LittleEndian>()?;
        let table_entry_size = cursor.read_u32::<LittleEndian>()?;
        let bit_index_file_pos = cursor.read_u32::<LittleEndian>()?;
        let bit_index_file_size = cursor.read_u32::<LittleEndian>()?;
        let bit_index_cmp_size = cursor.read_u32::<LittleEndian>()?;
        let bit_index_flag_index = cursor.read_u32::<LittleEndian>()?;
        let _bit_index_unknown = cursor.read_u32::<LittleEndian>()?;
        let bit_count_file_pos = cursor.read_u32::<LittleEndian>()?;
        let bit_count_file_size = cursor.read_u32::<LittleEndian>()?;
        let bit_count_cmp_size = cursor.read_u32::<LittleEndian>()?;
        let bit_count_flag_index = cursor.read_u32::<LittleEndian>()?;
        let _bit_count_unknown = cursor.read_u32::<LittleEndian>()?;
        let bit_total_name_hash = cursor.read_u32::<LittleEndian>()?;
        let _bit_extra_name_hash = cursor.read_u32::<LittleEndian>()?;
        let _bit_count_name_hash = cursor.read_u32::<LittleEndian>()?;
        let name_hash_array_size = cursor.read_u32::<LittleEndian>()?;
        let flag_count = cursor.read_u32::<LittleEndian>()?;

        for count in [
            bit_count_file_pos,
            bit_count_file_size,
            bit_count_cmp_size,
            bit_count_flag_index,
            bit_total_name_hash,
        ] {
            if count > 64 {
                return Err(Error::bad_format(format!(
                    "BET field width {count} exceeds 64 bits"
                )));
            }
        }
        if table_entry_size == 0 || table_entry_size > 0x200 {
            return Err(Error::bad_format(format!(
                "BET entry size {table_entry_size} out of range"
            )));
        }

        let flags_start = Self::HEADER_SIZE;
        let flags_end = flags_start + flag_count as usize * 4;
        let table_end = flags_end
            + (file_count as usize * table_entry_size as usize).div_ceil(8);
        let hashes_end = table_end + name_hash_array_size as usize;
        if data.len() < hashes_end {
            return Err(Error::bad_format("BET table arrays truncated"));
        }

        let file_flags = data[flags_start..flags_end]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(BetTable {
            file_count,
            table_entry_size,
            bit_index_file_pos,
            bit_index_file_size,
            bit_index_cmp_size,
            bit_index_flag_index,
            bit_count_file_pos,
            bit_count_file_size,
            bit_count_cmp_size,
            bit_count_flag_index,
            bit_total_name_hash,
            file_flags,
            file_table: data[flags_end..table_end].to_vec(),
            name_hashes: data[table_end..hashes_end].to_vec(),
        })
    }

    /// Number of file records
    pub fn len(&self) -> u32 {
        self.file_count
    }

    /// True if the table holds no records
    pub fn is_empty(&self) -> bool {
        self.file_count == 0
    }

    /// Unpacks the record at `index`
    pub fn file_info(&self, index: u32) -> Option<BetFileInfo> {
        if index >= self.file_count {
            return None;
        }

        let base = u64::from(index) * u64::from(self.table_entry_size);
        let field = |bit_index: u32, bit_count: u32| {
            read_bits(&self.file_table, base + u64::from(bit_index), bit_count)
        };

        let flag_index = field(self.bit_index_flag_index, self.bit_count_flag_index) as usize;
        let flags = self.file_flags.get(flag_index).copied().unwrap_or(0);

        Some(BetFileInfo {
            file_pos: field(self.bit_index_file_pos, self.bit_count_file_pos),
            compressed_size: field(self.bit_index_cmp_size, self.bit_count_cmp_size),
            file_size: field(self.bit_index_file_size, self.bit_count_file_size),
            flags: BlockFlags::from_bits_retain(flags),
        })
    }

    /// Checks the stored name hash bits of record `index` against a
    /// masked HET hash. Tables without hash storage accept any name.
    pub fn name_hash_matches(&self, index: u32, masked_hash: u64) -> bool {
        if self.bit_total_name_hash == 0 {
            return true;
        }
        if index >= self.file_count {
            return false;
        }

        let stored = read_bits(
            &self.name_hashes,
            u64::from(index) * u64::from(self.bit_total_name_hash),
            self.bit_total_name_hash,
        );
        let mask = if self.bit_total_name_hash == 64 {
            u64::MAX
        } else {
            (1u64 << self.bit_total_name_hash) - 1
        };
        stored == masked_hash & mask
    }
}

#[cfg(test)]
mod tests {
    use super::super::write_bits;
    use super::*;
    use crate::crypto::{encrypt_data, jenkins_hash};
    use std::io::Cursor;

    // Record layout wider than 64 bits, so every field crosses or sits
    // beyond a u64 window: pos 32@0, size 32@32, cmp 12@64, flags 4@76.
    const ENTRY_BITS: u32 = 80;
    const HASH_BITS: u32 = 32;

    struct Record {
        pos: u64,
        size: u64,
        cmp: u64,
        flag_index: u64,
        name: &'static str,
    }

    fn masked(name: &str) -> u64 {
        (jenkins_hash(name) & ((1 << 40) - 1)) | (1 << 39)
    }

    fn build_table(records: &[Record], flags: &[u32]) -> Vec<u8> {
        build_table_padded(records, flags, 0)
    }

    /// `hash_pad` inflates the declared name hash array size without
    /// storing the extra bytes.
    fn build_table_padded(records: &[Record], flags: &[u32], hash_pad: u32) -> Vec<u8> {
        let mut file_table =
            vec![0u8; (records.len() * ENTRY_BITS as usize).div_ceil(8)];
        let mut name_hashes =
            vec![0u8; (records.len() * HASH_BITS as usize).div_ceil(8)];

        for (i, record) in records.iter().enumerate() {
            let base = i as u64 * u64::from(ENTRY_BITS);
            write_bits(&mut file_table, base, 32, record.pos);
            write_bits(&mut file_table, base + 32, 32, record.size);
            write_bits(&mut file_table, base + 64, 12, record.cmp);
            write_bits(&mut file_table, base + 76, 4, record.flag_index);
            write_bits(
                &mut name_hashes,
                i as u64 * u64::from(HASH_BITS),
                HASH_BITS,
                masked(record.name) & 0xFFFF_FFFF,
            );
        }

        let header = [
            0u32, // table size, unused by the reader
            records.len() as u32,
            0x10, // unknown, as written by other tools
            ENTRY_BITS,
            0,  // bit index: file pos
            32, // bit index: file size
            64, // bit index: cmp size
            76, // bit index: flag index
            80, // bit index: unknown
            32, // bit count: file pos
            32, // bit count: file size
            12, // bit count: cmp size
            4,  // bit count: flag index
            0,  // bit count: unknown
            HASH_BITS,
            0,
            HASH_BITS,
            name_hashes.len() as u32 + hash_pad,
            flags.len() as u32,
        ];

        let mut inner = Vec::new();
        for value in header {
            inner.extend_from_slice(&value.to_le_bytes());
        }
        for flag in flags {
            inner.extend_from_slice(&flag.to_le_bytes());
        }
        inner.extend_from_slice(&file_table);
        inner.extend_from_slice(&name_hashes);

        let mut stored = Vec::new();
        stored.extend_from_slice(&BetTable::SIGNATURE.to_le_bytes());
        stored.extend_from_slice(&1u32.to_le_bytes());
        stored.extend_from_slice(&(inner.len() as u32).to_le_bytes());
        encrypt_data(&mut inner, file_key("(block table)"));
        stored.extend_from_slice(&inner);
        stored
    }

    fn sample_records() -> Vec<Record> {
        vec![
            Record {
                pos: 0x200,
                size: 0x1234_5678,
                cmp: 0xABC,
                flag_index: 0,
                name: "war3map.j",
            },
            Record {
                pos: 0xDEAD_BEE0,
                size: 0x400,
                cmp: 0x123,
                flag_index: 1,
                name: "war3map.w3e",
            },
        ]
    }

    #[test]
    fn unpacks_wide_records() {
        let stored = build_table(&sample_records(), &[0x8000_0200, 0x8001_0000]);
        let table = BetTable::read(&mut Cursor::new(&stored), 0, stored.len() as u64).unwrap();
        assert_eq!(table.len(), 2);

        let first = table.file_info(0).unwrap();
        assert_eq!(first.file_pos, 0x200);
        assert_eq!(first.file_size, 0x1234_5678);
        assert_eq!(first.compressed_size, 0xABC);
        assert_eq!(first.flags, BlockFlags::EXISTS | BlockFlags::COMPRESS);

        let second = table.file_info(1).unwrap();
        assert_eq!(second.file_pos, 0xDEAD_BEE0);
        assert_eq!(second.flags, BlockFlags::EXISTS | BlockFlags::ENCRYPTED);

        assert_eq!(table.file_info(2), None);
    }

    #[test]
    fn verifies_name_hashes() {
        let records = sample_records();
        let stored = build_table(&records, &[0x8000_0000, 0x8000_0000]);
        let table = BetTable::read(&mut Cursor::new(&stored), 0, stored.len() as u64).unwrap();

        assert!(table.name_hash_matches(0, masked("war3map.j")));
        assert!(table.name_hash_matches(1, masked("war3map.w3e")));

        // A name whose hash differs in the stored low bits must not
        // verify against record 0.
        let other = (0..)
            .map(|i| format!("other{i}.txt"))
            .find(|name| masked(name) & 0xFFFF_FFFF != masked("war3map.j") & 0xFFFF_FFFF)
            .unwrap();
        assert!(!table.name_hash_matches(0, masked(&other)));
    }

    #[test]
    fn truncated_arrays_are_malformed() {
        // The header promises more name hash bytes than are stored.
        let stored = build_table_padded(&sample_records(), &[0x8000_0000], 64);
        let err = BetTable::read(&mut Cursor::new(&stored), 0, stored.len() as u64).unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)));
    }
}
