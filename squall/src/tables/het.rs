//! The HET table of version 3 archives
//!
//! A compact hash table keyed by a 64-bit Jenkins hash of the file
//! name. Each slot stores the top 8 bits of the hash plus a bit-packed
//! index into the BET table; the remaining hash bits live in the BET
//! table for verification.

use std::io::{Read, Seek};

use byteorder::{LittleEndian, ReadBytesExt};

use super::{load_ext_table, read_bits};
use crate::crypto::{file_key, jenkins_hash};
use crate::error::{Error, Result};

const HET_ENTRY_FREE: u8 = 0x00;

/// Read-only view of a HET table
#[derive(Debug)]
pub struct HetTable {
    entry_count: u32,
    total_count: u32,
    name_hash_bit_size: u32,
    index_size_total: u32,
    index_size: u32,
    name_hashes: Vec<u8>,
    file_indexes: Vec<u8>,
}

impl HetTable {
    /// Little-endian "HET\x1A"
    pub const SIGNATURE: u32 = 0x1A54_4548;

    /// Reads a table from `offset`, where `stored_size` covers the
    /// 12-byte prefix and the table body as stored.
    pub fn read<R: Read + Seek>(reader: &mut R, offset: u64, stored_size: u64) -> Result<Self> {
        let data = load_ext_table(
            reader,
            offset,
            stored_size,
            Self::SIGNATURE,
            file_key("(hash table)"),
        )?;
        if data.len() < 32 {
            return Err(Error::bad_format("HET table header truncated"));
        }

        let mut cursor = std::io::Cursor::new(&data);
        let _table_size = cursor.read_u32::<LittleEndian>()?;
        let entry_count = cursor.read_u32::<LittleEndian>()?;
        let total_count = cursor.read_u32::<LittleEndian>()?;
        let name_hash_bit_size = cursor.read_u32::<LittleEndian>()?;
        let index_size_total = cursor.read_u32::<LittleEndian>()?;
        let _index_size_extra = cursor.read_u32::<LittleEndian>()?;
        let index_size = cursor.read_u32::<LittleEndian>()?;
        let index_table_size = cursor.read_u32::<LittleEndian>()?;

        if total_count == 0 {
            return Err(Error::bad_format("HET table has no slots"));
        }
        if !(8..=64).contains(&name_hash_bit_size) {
            return Err(Error::bad_format(format!(
                "HET name hash bit size {name_hash_bit_size} out of range"
            )));
        }
        if index_size == 0 || index_size > 32 || index_size > index_size_total {
            return Err(Error::bad_format(format!(
                "HET index size {index_size} out of range"
            )));
        }

        let hashes_start = 32usize;
        let hashes_end = hashes_start + total_count as usize;
        let indexes_end = hashes_end + index_table_size as usize;
        if data.len() < indexes_end {
            return Err(Error::bad_format("HET table arrays truncated"));
        }

        Ok(HetTable {
            entry_count,
            total_count,
            name_hash_bit_size,
            index_size_total,
            index_size,
            name_hashes: data[hashes_start..hashes_end].to_vec(),
            file_indexes: data[hashes_end..indexes_end].to_vec(),
        })
    }

    /// Number of files the table indexes
    pub fn file_count(&self) -> u32 {
        self.entry_count
    }

    /// Jenkins hash of `filename`, truncated to the table's hash width
    /// with the top bit forced so no valid hash looks like a free slot.
    pub fn masked_name_hash(&self, filename: &str) -> u64 {
        let and_mask = if self.name_hash_bit_size == 64 {
            u64::MAX
        } else {
            (1u64 << self.name_hash_bit_size) - 1
        };
        let or_mask = 1u64 << (self.name_hash_bit_size - 1);
        (jenkins_hash(filename) & and_mask) | or_mask
    }

    /// BET file indexes whose stored hash byte matches `filename`, in
    /// probe order. The caller verifies candidates against the rest of
    /// the hash held by the BET table.
    pub fn candidate_indexes(&self, filename: &str) -> Vec<u32> {
        let masked = self.masked_name_hash(filename);
        let hash_byte = (masked >> (self.name_hash_bit_size - 8)) as u8;
        let start = (masked % u64::from(self.total_count)) as u32;

        let mut candidates = Vec::new();
        for step in 0..self.total_count {
            let slot = (start + step) % self.total_count;
            let stored = self.name_hashes[slot as usize];

            if stored == HET_ENTRY_FREE {
                break;
            }
            if stored != hash_byte {
                continue;
            }

            let index = read_bits(
                &self.file_indexes,
                u64::from(slot) * u64::from(self.index_size_total),
                self.index_size,
            );
            candidates.push(index as u32);
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::super::write_bits;
    use super::*;
    use crate::crypto::encrypt_data;
    use std::io::Cursor;

    const NAME_HASH_BITS: u32 = 40;
    const INDEX_BITS: u32 = 8;

    fn masked(name: &str) -> u64 {
        let and_mask = (1u64 << NAME_HASH_BITS) - 1;
        (jenkins_hash(name) & and_mask) | (1 << (NAME_HASH_BITS - 1))
    }

    /// Builds a stored HET table mapping each name to its position in
    /// the slice.
    fn build_table(names: &[&str], total_count: u32) -> Vec<u8> {
        let mut hashes = vec![HET_ENTRY_FREE; total_count as usize];
        let mut indexes = vec![0u8; (total_count * INDEX_BITS).div_ceil(8) as usize];

        for (file_index, name) in names.iter().enumerate() {
            let hash = masked(name);
            let mut slot = (hash % u64::from(total_count)) as u32;
            while hashes[slot as usize] != HET_ENTRY_FREE {
                slot = (slot + 1) % total_count;
            }
            hashes[slot as usize] = (hash >> (NAME_HASH_BITS - 8)) as u8;
            write_bits(
                &mut indexes,
                u64::from(slot) * u64::from(INDEX_BITS),
                INDEX_BITS,
                file_index as u64,
            );
        }

        let mut inner = Vec::new();
        let header = [
            32 + total_count + indexes.len() as u32, // table size
            names.len() as u32,                      // entry count
            total_count,
            NAME_HASH_BITS,
            INDEX_BITS, // index size total
            0,          // index size extra
            INDEX_BITS, // index size
            indexes.len() as u32,
        ];
        for value in header {
            inner.extend_from_slice(&value.to_le_bytes());
        }
        inner.extend_from_slice(&hashes);
        inner.extend_from_slice(&indexes);

        let mut stored = Vec::new();
        stored.extend_from_slice(&HetTable::SIGNATURE.to_le_bytes());
        stored.extend_from_slice(&1u32.to_le_bytes());
        stored.extend_from_slice(&(inner.len() as u32).to_le_bytes());
        encrypt_data(&mut inner, file_key("(hash table)"));
        stored.extend_from_slice(&inner);
        stored
    }

    #[test]
    fn finds_stored_names() {
        let names = ["war3map.j", "war3map.w3e", "scripts\\common.j"];
        let stored = build_table(&names, 8);

        let table = HetTable::read(&mut Cursor::new(&stored), 0, stored.len() as u64).unwrap();
        assert_eq!(table.file_count(), 3);

        for (i, name) in names.iter().enumerate() {
            let candidates = table.candidate_indexes(name);
            assert!(
                candidates.contains(&(i as u32)),
                "{name} not found among {candidates:?}"
            );
        }
    }

    #[test]
    fn absent_name_yields_no_candidates() {
        let stored = build_table(&["war3map.j"], 8);
        let table = HetTable::read(&mut Cursor::new(&stored), 0, stored.len() as u64).unwrap();

        // Pick an absent name whose hash byte differs from the stored
        // file's, so the probe cannot match anything.
        let stored_byte = (masked("war3map.j") >> (NAME_HASH_BITS - 8)) as u8;
        let absent = (0..)
            .map(|i| format!("absent{i}.txt"))
            .find(|name| (masked(name) >> (NAME_HASH_BITS - 8)) as u8 != stored_byte)
            .unwrap();

        assert!(table.candidate_indexes(&absent).is_empty());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mut stored = build_table(&["war3map.j"], 8);
        stored[0] = b'X';

        let err = HetTable::read(&mut Cursor::new(&stored), 0, stored.len() as u64).unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)));
    }
}
