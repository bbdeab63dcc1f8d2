//! Archive table structures
//!
//! Classic archives carry a hash table (name lookup) and a block table
//! (storage metadata). Later format versions add the HET and BET
//! tables, which this crate reads but never writes.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::compression::decompress;
use crate::crypto::decrypt_data;
use crate::error::{Error, Result};

mod bet;
mod block_table;
mod hash_table;
mod het;

pub use bet::{BetFileInfo, BetTable};
pub use block_table::{
    hi_block_table_bytes, parse_hi_block_table, BlockEntry, BlockFlags, BlockTable,
};
pub use hash_table::{
    HashEntry, HashTable, HASH_ENTRY_DELETED, HASH_ENTRY_EMPTY, LOCALE_NEUTRAL,
    MAX_HASH_TABLE_SIZE, MIN_HASH_TABLE_SIZE,
};
pub use het::HetTable;

/// Loads the body of an extended table.
///
/// The 12-byte prefix (signature, version, data size) is stored in the
/// clear; everything after it is encrypted and, when the declared data
/// size exceeds what is stored, compressed with a leading method byte.
pub(crate) fn load_ext_table<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    stored_size: u64,
    signature: u32,
    key: u32,
) -> Result<Vec<u8>> {
    if stored_size < 12 {
        return Err(Error::bad_format("extended table smaller than its header"));
    }

    reader.seek(SeekFrom::Start(offset))?;
    let stored_signature = reader.read_u32::<LittleEndian>()?;
    if stored_signature != signature {
        return Err(Error::bad_format(format!(
            "extended table signature {stored_signature:#010x} does not match {signature:#010x}"
        )));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != 1 {
        return Err(Error::bad_format(format!(
            "unsupported extended table version {version}"
        )));
    }
    let data_size = reader.read_u32::<LittleEndian>()? as usize;

    let mut data = vec![0u8; (stored_size - 12) as usize];
    reader.read_exact(&mut data)?;
    decrypt_data(&mut data, key);

    if data_size > data.len() {
        let method = *data
            .first()
            .ok_or_else(|| Error::bad_format("extended table has no body"))?;
        data = decompress(&data[1..], method, data_size)?;
    } else {
        data.truncate(data_size);
    }

    Ok(data)
}

/// Reads `bit_count` bits starting at `bit_offset` from a little-endian
/// packed array. Bits past the end of the array read as zero.
pub(crate) fn read_bits(data: &[u8], bit_offset: u64, bit_count: u32) -> u64 {
    debug_assert!(bit_count <= 64);
    if bit_count == 0 {
        return 0;
    }

    let first = (bit_offset / 8) as usize;
    let shift = (bit_offset % 8) as u32;
    let bytes = ((shift + bit_count).div_ceil(8)) as usize;

    let mut window: u128 = 0;
    for i in 0..bytes {
        let byte = data.get(first + i).copied().unwrap_or(0);
        window |= u128::from(byte) << (8 * i);
    }

    let mask: u128 = if bit_count == 64 {
        u128::from(u64::MAX)
    } else {
        (1u128 << bit_count) - 1
    };
    ((window >> shift) & mask) as u64
}

#[cfg(test)]
pub(crate) fn write_bits(data: &mut [u8], bit_offset: u64, bit_count: u32, value: u64) {
    for bit in 0..u64::from(bit_count) {
        let position = bit_offset + bit;
        let byte = (position / 8) as usize;
        let shift = (position % 8) as u32;
        let mask = 1u8 << shift;
        if (value >> bit) & 1 == 1 {
            data[byte] |= mask;
        } else {
            data[byte] &= !mask;
        }
    }
}
