//! String hashing for table lookups and file keys

use super::table::ENCRYPTION_TABLE;

/// Hash types selecting which group of the encryption table feeds the hash
pub mod hash_type {
    /// Home slot index into the hash table
    pub const TABLE_OFFSET: u32 = 0;
    /// First name verification hash
    pub const NAME_A: u32 = 1;
    /// Second name verification hash
    pub const NAME_B: u32 = 2;
    /// Encryption key derived from a file name
    pub const FILE_KEY: u32 = 3;
}

/// Uppercase folding table. Also folds '/' to '\\' so both path
/// separator conventions hash identically.
const ASCII_TO_UPPER: [u8; 256] = build_case_table(true);

/// Lowercase folding table with the same separator folding, used by
/// the 64-bit name hash of the extended tables.
const ASCII_TO_LOWER: [u8; 256] = build_case_table(false);

const fn build_case_table(to_upper: bool) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let ch = i as u8;
        table[i] = if ch == b'/' {
            b'\\'
        } else if to_upper && ch.is_ascii_lowercase() {
            ch - 0x20
        } else if !to_upper && ch.is_ascii_uppercase() {
            ch + 0x20
        } else {
            ch
        };
        i += 1;
    }
    table
}

/// Hashes a file name with one of the [`hash_type`] selectors.
///
/// Names are folded to uppercase and '/' is treated as '\\', so the
/// same file is found regardless of how the caller spells its path.
pub fn hash_string(filename: &str, hash_type: u32) -> u32 {
    let mut seed1: u32 = 0x7FED_7FED;
    let mut seed2: u32 = 0xEEEE_EEEE;

    for &byte in filename.as_bytes() {
        let ch = ASCII_TO_UPPER[byte as usize] as u32;
        seed1 = ENCRYPTION_TABLE[((hash_type << 8) + ch) as usize] ^ seed1.wrapping_add(seed2);
        seed2 = ch
            .wrapping_add(seed1)
            .wrapping_add(seed2)
            .wrapping_add(seed2 << 5)
            .wrapping_add(3);
    }

    seed1
}

/// 64-bit name hash used by the HET table.
///
/// Names are folded to lowercase (separators folded like
/// [`hash_string`]) and run through Jenkins' lookup3 hash. The primary
/// word forms the high half of the result.
pub fn jenkins_hash(filename: &str) -> u64 {
    let mut normalized = Vec::with_capacity(filename.len());
    for &byte in filename.as_bytes() {
        normalized.push(ASCII_TO_LOWER[byte as usize]);
    }

    let (primary, secondary) = hashlittle2(&normalized, 0, 0);
    (u64::from(primary) << 32) | u64::from(secondary)
}

fn read_word(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Jenkins lookup3 `hashlittle2`: returns both 32-bit hash words
/// (primary, secondary) for the little-endian byte stream.
fn hashlittle2(data: &[u8], primary_init: u32, secondary_init: u32) -> (u32, u32) {
    let mut a = 0xDEAD_BEEF_u32
        .wrapping_add(data.len() as u32)
        .wrapping_add(primary_init);
    let mut b = a;
    let mut c = a.wrapping_add(secondary_init);

    let mut rest = data;
    while rest.len() > 12 {
        a = a.wrapping_add(read_word(rest, 0));
        b = b.wrapping_add(read_word(rest, 4));
        c = c.wrapping_add(read_word(rest, 8));

        a = a.wrapping_sub(c);
        a ^= c.rotate_left(4);
        c = c.wrapping_add(b);
        b = b.wrapping_sub(a);
        b ^= a.rotate_left(6);
        a = a.wrapping_add(c);
        c = c.wrapping_sub(b);
        c ^= b.rotate_left(8);
        b = b.wrapping_add(a);
        a = a.wrapping_sub(c);
        a ^= c.rotate_left(16);
        c = c.wrapping_add(b);
        b = b.wrapping_sub(a);
        b ^= a.rotate_left(19);
        a = a.wrapping_add(c);
        c = c.wrapping_sub(b);
        c ^= b.rotate_left(4);
        b = b.wrapping_add(a);

        rest = &rest[12..];
    }

    // Zero-length input skips the final mix entirely.
    if rest.is_empty() {
        return (c, b);
    }

    // The last 1..=12 bytes are zero-extended; absent bytes contribute
    // nothing to the per-word sums.
    let mut tail = [0u8; 12];
    tail[..rest.len()].copy_from_slice(rest);
    a = a.wrapping_add(read_word(&tail, 0));
    b = b.wrapping_add(read_word(&tail, 4));
    c = c.wrapping_add(read_word(&tail, 8));

    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(24));

    (c, b)
}
