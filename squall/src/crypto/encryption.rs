//! The stream cipher applied to tables and file sectors

use super::table::ENCRYPTION_TABLE;

/// Decrypts a block of u32 values in place.
///
/// A key of zero leaves the data untouched, which lets callers pass
/// the derived key through unconditionally.
pub fn decrypt_block(data: &mut [u32], mut key: u32) {
    if key == 0 {
        return;
    }

    let mut seed: u32 = 0xEEEE_EEEE;
    for value in data.iter_mut() {
        seed = seed.wrapping_add(ENCRYPTION_TABLE[(0x400 + (key & 0xFF)) as usize]);
        let decrypted = *value ^ key.wrapping_add(seed);
        *value = decrypted;

        key = (!key << 0x15).wrapping_add(0x1111_1111) | (key >> 0x0B);
        seed = decrypted
            .wrapping_add(seed)
            .wrapping_add(seed << 5)
            .wrapping_add(3);
    }
}

/// Encrypts a block of u32 values in place. Inverse of [`decrypt_block`].
pub fn encrypt_block(data: &mut [u32], mut key: u32) {
    if key == 0 {
        return;
    }

    let mut seed: u32 = 0xEEEE_EEEE;
    for value in data.iter_mut() {
        seed = seed.wrapping_add(ENCRYPTION_TABLE[(0x400 + (key & 0xFF)) as usize]);
        let plain = *value;
        *value = plain ^ key.wrapping_add(seed);

        key = (!key << 0x15).wrapping_add(0x1111_1111) | (key >> 0x0B);
        // The seed chain runs over plaintext on both directions.
        seed = plain
            .wrapping_add(seed)
            .wrapping_add(seed << 5)
            .wrapping_add(3);
    }
}

/// Decrypts a single u32 without advancing any cipher state.
///
/// Used to peek at the first entry of an encrypted sector offset table
/// when probing for a key.
pub fn decrypt_dword(value: u32, key: u32) -> u32 {
    let seed = 0xEEEE_EEEE_u32.wrapping_add(ENCRYPTION_TABLE[(0x400 + (key & 0xFF)) as usize]);
    value ^ key.wrapping_add(seed)
}

/// Decrypts a byte buffer in place, treating it as little-endian u32s.
///
/// Only whole u32s are ciphered; up to three trailing bytes are stored
/// in the clear, matching how the format encrypts odd-sized sectors.
pub fn decrypt_data(data: &mut [u8], key: u32) {
    cipher_data(data, key, decrypt_block);
}

/// Encrypts a byte buffer in place. Inverse of [`decrypt_data`].
pub fn encrypt_data(data: &mut [u8], key: u32) {
    cipher_data(data, key, encrypt_block);
}

fn cipher_data(data: &mut [u8], key: u32, cipher: fn(&mut [u32], u32)) {
    if key == 0 {
        return;
    }

    let whole = data.len() / 4 * 4;
    let mut words: Vec<u32> = data[..whole]
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    cipher(&mut words, key);

    for (chunk, word) in data[..whole].chunks_exact_mut(4).zip(&words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}
