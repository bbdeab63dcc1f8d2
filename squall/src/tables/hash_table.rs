//! The classic hash table
//!
//! Lookup walks a linear probe chain from the name's home slot. An
//! empty sentinel ends the chain; a deleted sentinel keeps it alive so
//! that entries displaced past a removal stay reachable.

use crate::crypto::{decrypt_data, encrypt_data, file_key, hash_string, hash_type};
use crate::error::{Error, Result};

/// Block index sentinel for a slot that has never been used
pub const HASH_ENTRY_EMPTY: u32 = 0xFFFF_FFFF;

/// Block index sentinel for a slot whose file was removed
pub const HASH_ENTRY_DELETED: u32 = 0xFFFF_FFFE;

/// Smallest permitted hash table, in entries
pub const MIN_HASH_TABLE_SIZE: u32 = 0x4;

/// Largest permitted hash table, in entries
pub const MAX_HASH_TABLE_SIZE: u32 = 0x0008_0000;

/// Neutral locale, matched when no exact locale entry exists
pub const LOCALE_NEUTRAL: u16 = 0;

/// One hash table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashEntry {
    /// First name verification hash
    pub name_a: u32,
    /// Second name verification hash
    pub name_b: u32,
    /// Locale of this file version
    pub locale: u16,
    /// Platform, always 0 in practice
    pub platform: u16,
    /// Block table index, or one of the sentinels
    pub block_index: u32,
}

impl HashEntry {
    /// Serialized entry size in bytes
    pub const SIZE: usize = 16;

    /// A never-used slot, all bytes 0xFF
    pub fn empty() -> Self {
        HashEntry {
            name_a: 0xFFFF_FFFF,
            name_b: 0xFFFF_FFFF,
            locale: 0xFFFF,
            platform: 0xFFFF,
            block_index: HASH_ENTRY_EMPTY,
        }
    }

    /// True if this slot has never held a file
    pub fn is_empty(&self) -> bool {
        self.block_index == HASH_ENTRY_EMPTY
    }

    /// True if this slot held a file that was removed
    pub fn is_deleted(&self) -> bool {
        self.block_index == HASH_ENTRY_DELETED
    }

    /// True if this slot currently names a file
    pub fn is_occupied(&self) -> bool {
        !self.is_empty() && !self.is_deleted()
    }

    fn from_le_bytes(bytes: &[u8]) -> Self {
        HashEntry {
            name_a: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            name_b: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            locale: u16::from_le_bytes([bytes[8], bytes[9]]),
            platform: u16::from_le_bytes([bytes[10], bytes[11]]),
            block_index: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    fn write_le_bytes(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name_a.to_le_bytes());
        out.extend_from_slice(&self.name_b.to_le_bytes());
        out.extend_from_slice(&self.locale.to_le_bytes());
        out.extend_from_slice(&self.platform.to_le_bytes());
        out.extend_from_slice(&self.block_index.to_le_bytes());
    }
}

/// The hash table of an open archive
#[derive(Debug, Clone)]
pub struct HashTable {
    entries: Vec<HashEntry>,
}

impl HashTable {
    /// Creates a table of `capacity` empty slots. The capacity must
    /// already be validated as a power of two.
    pub fn new(capacity: u32) -> Self {
        debug_assert!(capacity.is_power_of_two());
        HashTable {
            entries: vec![HashEntry::empty(); capacity as usize],
        }
    }

    /// Parses a table from its stored form
    pub fn from_encrypted_bytes(mut raw: Vec<u8>) -> Result<Self> {
        if raw.is_empty() || raw.len() % HashEntry::SIZE != 0 {
            return Err(Error::bad_format("hash table size is not a multiple of 16"));
        }

        decrypt_data(&mut raw, file_key("(hash table)"));
        let entries = raw
            .chunks_exact(HashEntry::SIZE)
            .map(HashEntry::from_le_bytes)
            .collect();
        Ok(HashTable { entries })
    }

    /// Serializes the table to its stored form
    pub fn to_encrypted_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.entries.len() * HashEntry::SIZE);
        for entry in &self.entries {
            entry.write_le_bytes(&mut raw);
        }
        encrypt_data(&mut raw, file_key("(hash table)"));
        raw
    }

    /// Number of slots
    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    fn mask(&self) -> u32 {
        self.capacity() - 1
    }

    /// All slots in table order
    pub fn entries(&self) -> &[HashEntry] {
        &self.entries
    }

    /// The slot at `index`
    pub fn entry(&self, slot: u32) -> &HashEntry {
        &self.entries[slot as usize]
    }

    /// Mutable access to the slot at `index`
    pub fn entry_mut(&mut self, slot: u32) -> &mut HashEntry {
        &mut self.entries[slot as usize]
    }

    /// Number of slots currently naming a file
    pub fn occupied_count(&self) -> u32 {
        self.entries.iter().filter(|e| e.is_occupied()).count() as u32
    }

    /// Home slot for a file name
    pub fn home_slot(&self, filename: &str) -> u32 {
        hash_string(filename, hash_type::TABLE_OFFSET) & self.mask()
    }

    /// Finds the slot holding `filename`.
    ///
    /// An entry with the exact locale wins. Otherwise the neutral
    /// locale is preferred, then the first match in probe order.
    pub fn find(&self, filename: &str, locale: u16) -> Option<u32> {
        let name_a = hash_string(filename, hash_type::NAME_A);
        let name_b = hash_string(filename, hash_type::NAME_B);
        let mask = self.mask();
        let home = self.home_slot(filename);

        let mut neutral = None;
        let mut first = None;

        for step in 0..self.capacity() {
            let slot = (home + step) & mask;
            let entry = &self.entries[slot as usize];

            if entry.is_empty() {
                break;
            }
            if entry.is_deleted() || entry.name_a != name_a || entry.name_b != name_b {
                continue;
            }

            if entry.locale == locale {
                return Some(slot);
            }
            if entry.locale == LOCALE_NEUTRAL && neutral.is_none() {
                neutral = Some(slot);
            }
            if first.is_none() {
                first = Some(slot);
            }
        }

        neutral.or(first)
    }

    /// Claims a slot for `filename`, reusing the first empty or deleted
    /// slot on its probe chain.
    pub fn insert(&mut self, filename: &str, locale: u16, block_index: u32) -> Result<u32> {
        let name_a = hash_string(filename, hash_type::NAME_A);
        let name_b = hash_string(filename, hash_type::NAME_B);
        let mask = self.mask();
        let home = self.home_slot(filename);

        let mut claimed = None;

        // The whole chain up to the empty sentinel is scanned even
        // after a reusable slot is found, so a duplicate further along
        // is still detected.
        for step in 0..self.capacity() {
            let slot = (home + step) & mask;
            let entry = &self.entries[slot as usize];

            if entry.is_empty() {
                claimed.get_or_insert(slot);
                break;
            }
            if entry.is_deleted() {
                claimed.get_or_insert(slot);
                continue;
            }
            if entry.name_a == name_a && entry.name_b == name_b && entry.locale == locale {
                return Err(Error::AlreadyExists(filename.to_string()));
            }
        }

        let slot = claimed.ok_or(Error::NotEnoughMemory)?;
        self.entries[slot as usize] = HashEntry {
            name_a,
            name_b,
            locale,
            platform: 0,
            block_index,
        };
        Ok(slot)
    }

    /// Marks a slot as deleted, keeping probe chains through it alive
    pub fn remove(&mut self, slot: u32) {
        let mut entry = HashEntry::empty();
        entry.block_index = HASH_ENTRY_DELETED;
        self.entries[slot as usize] = entry;
    }

    /// Builds a resized copy of the table.
    ///
    /// `home_hash` supplies the full table-offset hash for entries
    /// whose name is known. For the rest the first verification hash
    /// stands in: the entry stays enumerable, but a by-name lookup
    /// needs the real name hash to find it again.
    pub fn rebuilt_with<F>(&self, new_capacity: u32, mut home_hash: F) -> Result<Self>
    where
        F: FnMut(&HashEntry) -> Option<u32>,
    {
        debug_assert!(new_capacity.is_power_of_two());
        let mut rebuilt = HashTable::new(new_capacity);
        let mask = new_capacity - 1;

        for entry in self.entries.iter().filter(|e| e.is_occupied()) {
            let home = home_hash(entry).unwrap_or(entry.name_a) & mask;
            let mut placed = false;
            for step in 0..new_capacity {
                let slot = ((home + step) & mask) as usize;
                if rebuilt.entries[slot].is_empty() {
                    rebuilt.entries[slot] = *entry;
                    placed = true;
                    break;
                }
            }
            if !placed {
                return Err(Error::NotEnoughMemory);
            }
        }

        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// First `count` generated names sharing one home slot in a table
    /// of `capacity` entries.
    fn colliding_names(capacity: u32, count: usize) -> Vec<String> {
        let mask = capacity - 1;
        let mut buckets: std::collections::HashMap<u32, Vec<String>> =
            std::collections::HashMap::new();

        for i in 0.. {
            let name = format!("data\\chunk{i:04}.bin");
            let home = hash_string(&name, hash_type::TABLE_OFFSET) & mask;
            let bucket = buckets.entry(home).or_default();
            bucket.push(name);
            if bucket.len() == count {
                return bucket.clone();
            }
        }
        unreachable!()
    }

    #[test]
    fn lookup_probes_past_collisions() {
        let names = colliding_names(4, 3);
        let mut table = HashTable::new(4);

        for (i, name) in names.iter().enumerate() {
            table.insert(name, 0, i as u32).unwrap();
        }
        for (i, name) in names.iter().enumerate() {
            let slot = table.find(name, 0).unwrap();
            assert_eq!(table.entry(slot).block_index, i as u32);
        }
    }

    #[test]
    fn deleted_slot_does_not_end_the_chain() {
        let names = colliding_names(8, 2);
        let mut table = HashTable::new(8);

        table.insert(&names[0], 0, 0).unwrap();
        let second = table.insert(&names[1], 0, 1).unwrap();

        let first = table.find(&names[0], 0).unwrap();
        table.remove(first);

        assert_eq!(table.find(&names[0], 0), None);
        assert_eq!(table.find(&names[1], 0), Some(second));
    }

    #[test]
    fn insert_reuses_deleted_slots() {
        let names = colliding_names(8, 3);
        let mut table = HashTable::new(8);

        let first = table.insert(&names[0], 0, 0).unwrap();
        table.insert(&names[1], 0, 1).unwrap();
        table.remove(first);

        // The tombstone sits at the head of the chain and is reclaimed.
        let reused = table.insert(&names[2], 0, 2).unwrap();
        assert_eq!(reused, first);
        assert!(table.find(&names[1], 0).is_some());
        assert_eq!(table.find(&names[2], 0), Some(first));
    }

    #[test]
    fn duplicate_name_and_locale_is_rejected() {
        let mut table = HashTable::new(16);
        table.insert("war3map.j", 0, 0).unwrap();

        let err = table.insert("war3map.j", 0, 1).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn duplicate_check_sees_past_a_tombstone() {
        let names = colliding_names(8, 2);
        let mut table = HashTable::new(8);

        let first = table.insert(&names[0], 0, 0).unwrap();
        table.insert(&names[1], 0, 1).unwrap();
        table.remove(first);

        let err = table.insert(&names[1], 0, 2).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn locale_tie_break() {
        let mut table = HashTable::new(16);
        table.insert("strings.txt", 0x409, 1).unwrap();
        table.insert("strings.txt", LOCALE_NEUTRAL, 0).unwrap();
        table.insert("strings.txt", 0x407, 2).unwrap();

        let exact = table.find("strings.txt", 0x407).unwrap();
        assert_eq!(table.entry(exact).block_index, 2);

        // No 0x415 version: the neutral entry wins.
        let neutral = table.find("strings.txt", 0x415).unwrap();
        assert_eq!(table.entry(neutral).block_index, 0);
    }

    #[test]
    fn first_match_wins_without_a_neutral_entry() {
        let mut table = HashTable::new(16);
        table.insert("strings.txt", 0x409, 1).unwrap();
        table.insert("strings.txt", 0x411, 2).unwrap();

        let fallback = table.find("strings.txt", 0x415).unwrap();
        assert_eq!(table.entry(fallback).block_index, 1);
    }

    #[test]
    fn full_table_rejects_inserts() {
        let mut table = HashTable::new(4);
        for i in 0..4 {
            table.insert(&format!("file{i}.dat"), 0, i).unwrap();
        }

        let err = table.insert("one-more.dat", 0, 4).unwrap_err();
        assert!(matches!(err, Error::NotEnoughMemory));
    }

    #[test]
    fn stored_form_round_trips() {
        let mut table = HashTable::new(16);
        table.insert("a.txt", 0, 0).unwrap();
        table.insert("b.txt", 0x409, 1).unwrap();

        let raw = table.to_encrypted_bytes();
        assert_eq!(raw.len(), 16 * HashEntry::SIZE);

        let parsed = HashTable::from_encrypted_bytes(raw).unwrap();
        assert_eq!(parsed.entries(), table.entries());
    }

    #[test]
    fn stored_form_is_encrypted() {
        let table = HashTable::new(4);
        let raw = table.to_encrypted_bytes();
        // An all-empty table is 0xFF bytes in the clear.
        assert!(raw.iter().any(|&b| b != 0xFF));
    }

    #[test]
    fn odd_sized_table_is_malformed() {
        let err = HashTable::from_encrypted_bytes(vec![0u8; 24]).unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)));
    }

    #[test]
    fn rebuild_preserves_named_lookups() {
        let names = colliding_names(4, 3);
        let mut table = HashTable::new(4);
        for (i, name) in names.iter().enumerate() {
            table.insert(name, 0, i as u32).unwrap();
        }

        let names_by_hashes: std::collections::HashMap<(u32, u32), &str> = names
            .iter()
            .map(|n| {
                let key = (
                    hash_string(n, hash_type::NAME_A),
                    hash_string(n, hash_type::NAME_B),
                );
                (key, n.as_str())
            })
            .collect();

        let grown = table
            .rebuilt_with(16, |entry| {
                names_by_hashes
                    .get(&(entry.name_a, entry.name_b))
                    .map(|name| hash_string(name, hash_type::TABLE_OFFSET))
            })
            .unwrap();

        assert_eq!(grown.capacity(), 16);
        for (i, name) in names.iter().enumerate() {
            let slot = grown.find(name, 0).unwrap();
            assert_eq!(grown.entry(slot).block_index, i as u32);
        }
    }
}
