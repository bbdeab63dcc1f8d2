//! Encryption, decryption, and file name hashing
//!
//! All of the format's cryptography is driven by a single 0x500-entry
//! table of u32 values. The table seeds both the string hash used for
//! hash table lookups and the stream cipher used for table and sector
//! encryption.

mod encryption;
mod hash;
mod keys;
mod table;

pub use encryption::{decrypt_block, decrypt_data, decrypt_dword, encrypt_block, encrypt_data};
pub use hash::{hash_string, hash_type, jenkins_hash};
pub use keys::{file_key, fix_file_key};
pub use table::ENCRYPTION_TABLE;
