//! Encryption key derivation for stored files

use super::hash::{hash_string, hash_type};

/// Derives the base encryption key for a file name.
///
/// Only the final path component participates, so renames that move a
/// file between directories do not change its key.
pub fn file_key(filename: &str) -> u32 {
    let base = match filename.rsplit(['\\', '/']).next() {
        Some(base) => base,
        None => filename,
    };
    hash_string(base, hash_type::FILE_KEY)
}

/// Applies the position adjustment used by files flagged with a fixed
/// key: the base key is offset by the file position (archive-relative,
/// low 32 bits) and folded with the unpacked size.
pub fn fix_file_key(base_key: u32, file_pos: u32, file_size: u32) -> u32 {
    base_key.wrapping_add(file_pos) ^ file_size
}
