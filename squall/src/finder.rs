//! File enumeration
//!
//! A finder walks hash-table slots in one linear pass, remembering
//! the last slot examined so successive calls never revisit one. The
//! listfile variant walks a captured name list instead and resolves
//! each name through the hash table. Names that the archive has no
//! record of come back as pseudo-names derived from the block index.

use std::collections::HashMap;

use crate::tables::{BlockTable, HashTable};

/// One file yielded by a finder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindData {
    /// File name, or a `file_XXXXXXXX.dat` pseudo-name when the real
    /// name is unknown
    pub name: String,
    /// Hash table slot the file occupies, or `u32::MAX` when the
    /// archive has no classic hash table
    pub hash_index: u32,
    /// Block table entry describing the stored data
    pub block_index: u32,
    /// Unpacked size in bytes
    pub file_size: u64,
    /// Stored size in bytes, sector metadata included
    pub compressed_size: u64,
    /// Raw block flags
    pub flags: u32,
    /// Locale recorded in the hash slot
    pub locale: u16,
}

/// Cache key for a resolved file name
pub(crate) fn name_key(name_a: u32, name_b: u32) -> u64 {
    (u64::from(name_a) << 32) | u64::from(name_b)
}

/// Borrowed view of the archive state a finder step needs
pub(crate) struct FinderView<'a> {
    pub(crate) hash_table: &'a HashTable,
    pub(crate) block_table: &'a BlockTable,
    pub(crate) names: &'a HashMap<u64, String>,
    pub(crate) locale: u16,
}

enum FinderSource {
    /// Linear walk over hash table slots
    Slots { next: u32 },
    /// Walk over a name list captured when the finder was opened
    Names { names: Vec<String>, next: usize },
    /// Walk over block entries directly, for archives whose only
    /// tables are extended ones
    Blocks { next: u32 },
}

pub(crate) struct FinderState {
    mask: String,
    source: FinderSource,
}

impl FinderState {
    pub(crate) fn over_slots(mask: String) -> Self {
        FinderState {
            mask,
            source: FinderSource::Slots { next: 0 },
        }
    }

    pub(crate) fn over_names(mask: String, names: Vec<String>) -> Self {
        FinderState {
            mask,
            source: FinderSource::Names { names, next: 0 },
        }
    }

    pub(crate) fn over_blocks(mask: String) -> Self {
        FinderState {
            mask,
            source: FinderSource::Blocks { next: 0 },
        }
    }

    /// Yields the next matching file, or `None` once the pass is done
    pub(crate) fn next(&mut self, view: &FinderView<'_>) -> Option<FindData> {
        match &mut self.source {
            FinderSource::Slots { next } => {
                while *next < view.hash_table.capacity() {
                    let slot = *next;
                    *next += 1;

                    let entry = view.hash_table.entry(slot);
                    if !entry.is_occupied() {
                        continue;
                    }
                    let Some(block) = view.block_table.get(entry.block_index) else {
                        continue;
                    };
                    if !block.exists() {
                        continue;
                    }
                    let name = match view.names.get(&name_key(entry.name_a, entry.name_b)) {
                        Some(name) => name.clone(),
                        None => format!("file_{:08}.dat", entry.block_index),
                    };
                    if !mask_matches(&self.mask, &name) {
                        continue;
                    }
                    return Some(FindData {
                        name,
                        hash_index: slot,
                        block_index: entry.block_index,
                        file_size: u64::from(block.file_size),
                        compressed_size: u64::from(block.compressed_size),
                        flags: block.flags.bits(),
                        locale: entry.locale,
                    });
                }
                None
            }
            FinderSource::Names { names, next } => {
                while *next < names.len() {
                    let name = names[*next].clone();
                    *next += 1;

                    if !mask_matches(&self.mask, &name) {
                        continue;
                    }
                    // Listfiles routinely mention names the archive no
                    // longer holds; those are skipped, not errors.
                    let Some(slot) = view.hash_table.find(&name, view.locale) else {
                        continue;
                    };
                    let entry = view.hash_table.entry(slot);
                    let Some(block) = view.block_table.get(entry.block_index) else {
                        continue;
                    };
                    if !block.exists() {
                        continue;
                    }
                    return Some(FindData {
                        name,
                        hash_index: slot,
                        block_index: entry.block_index,
                        file_size: u64::from(block.file_size),
                        compressed_size: u64::from(block.compressed_size),
                        flags: block.flags.bits(),
                        locale: entry.locale,
                    });
                }
                None
            }
            FinderSource::Blocks { next } => {
                while *next < view.block_table.len() {
                    let index = *next;
                    *next += 1;

                    let Some(block) = view.block_table.get(index) else {
                        continue;
                    };
                    if !block.exists() {
                        continue;
                    }
                    let name = format!("file_{index:08}.dat");
                    if !mask_matches(&self.mask, &name) {
                        continue;
                    }
                    return Some(FindData {
                        name,
                        hash_index: u32::MAX,
                        block_index: index,
                        file_size: u64::from(block.file_size),
                        compressed_size: u64::from(block.compressed_size),
                        flags: block.flags.bits(),
                        locale: 0,
                    });
                }
                None
            }
        }
    }
}

/// Wildcard match with `*` and `?`. Literal bytes compare exactly,
/// including case, and there is no escaping.
pub(crate) fn mask_matches(mask: &str, name: &str) -> bool {
    let pattern = mask.as_bytes();
    let text = name.as_bytes();

    let mut p = 0;
    let mut t = 0;
    let mut star: Option<usize> = None;
    let mut mark = 0;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(rewind) = star {
            p = rewind + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{BlockEntry, BlockFlags};

    #[test]
    fn masks_match_like_a_directory_listing() {
        assert!(mask_matches("*", "anything\\at\\all.txt"));
        assert!(mask_matches("*.txt", "readme.txt"));
        assert!(mask_matches("war3*", "war3map.j"));
        assert!(mask_matches("unit?.dat", "units.dat"));
        assert!(!mask_matches("unit?.dat", "unit12.dat"));
        assert!(mask_matches("a*b*c", "axxbyybzzc"));
        assert!(!mask_matches("a*b*c", "axxbyy"));
        assert!(mask_matches("", ""));
        assert!(!mask_matches("", "x"));
    }

    #[test]
    fn mask_literals_are_byte_exact() {
        assert!(!mask_matches("*.txt", "README.TXT"));
        assert!(!mask_matches("units\\*.dat", "Units\\human.dat"));
        assert!(mask_matches("units\\*.dat", "units\\human.dat"));
    }

    fn fixture() -> (HashTable, BlockTable, HashMap<u64, String>) {
        let mut hash_table = HashTable::new(16);
        let mut block_table = BlockTable::new();
        let mut names = HashMap::new();

        for (name, size) in [("alpha.txt", 10u32), ("beta.dat", 20), ("sub\\gamma.txt", 30)] {
            let block_index = block_table.push(BlockEntry {
                file_pos: 0x200,
                compressed_size: size / 2,
                file_size: size,
                flags: BlockFlags::EXISTS | BlockFlags::COMPRESS,
            });
            let slot = hash_table.insert(name, 0, block_index).unwrap();
            let entry = hash_table.entry(slot);
            names.insert(name_key(entry.name_a, entry.name_b), name.to_string());
        }
        (hash_table, block_table, names)
    }

    #[test]
    fn slot_finder_enumerates_each_file_once() {
        let (hash_table, block_table, names) = fixture();
        let view = FinderView {
            hash_table: &hash_table,
            block_table: &block_table,
            names: &names,
            locale: 0,
        };

        let mut finder = FinderState::over_slots("*".to_string());
        let mut seen = Vec::new();
        while let Some(found) = finder.next(&view) {
            seen.push(found.name);
        }
        seen.sort();
        assert_eq!(seen, ["alpha.txt", "beta.dat", "sub\\gamma.txt"]);
        assert_eq!(finder.next(&view), None);
    }

    #[test]
    fn slot_finder_applies_the_mask() {
        let (hash_table, block_table, names) = fixture();
        let view = FinderView {
            hash_table: &hash_table,
            block_table: &block_table,
            names: &names,
            locale: 0,
        };

        let mut finder = FinderState::over_slots("*.txt".to_string());
        let mut seen = Vec::new();
        while let Some(found) = finder.next(&view) {
            seen.push(found.name);
        }
        seen.sort();
        assert_eq!(seen, ["alpha.txt", "sub\\gamma.txt"]);
    }

    #[test]
    fn removed_files_are_not_enumerated() {
        let (mut hash_table, mut block_table, names) = fixture();
        let slot = hash_table.find("beta.dat", 0).unwrap();
        let block_index = hash_table.entry(slot).block_index;
        hash_table.remove(slot);
        block_table.get_mut(block_index).unwrap().flags = BlockFlags::DELETE_MARKER;

        let view = FinderView {
            hash_table: &hash_table,
            block_table: &block_table,
            names: &names,
            locale: 0,
        };
        let mut finder = FinderState::over_slots("*".to_string());
        let mut seen = Vec::new();
        while let Some(found) = finder.next(&view) {
            seen.push(found.name);
        }
        assert!(!seen.contains(&"beta.dat".to_string()));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn unknown_names_fall_back_to_pseudo_names() {
        let (hash_table, block_table, mut names) = fixture();
        names.clear();

        let view = FinderView {
            hash_table: &hash_table,
            block_table: &block_table,
            names: &names,
            locale: 0,
        };
        let mut finder = FinderState::over_slots("*.dat".to_string());
        let mut seen = Vec::new();
        while let Some(found) = finder.next(&view) {
            seen.push(found.name);
        }
        // Every file matches *.dat under its pseudo-name now.
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|name| name.starts_with("file_")));
    }

    #[test]
    fn block_finder_covers_archives_without_a_hash_table() {
        let (_, block_table, names) = fixture();
        let empty = HashTable::new(4);
        let view = FinderView {
            hash_table: &empty,
            block_table: &block_table,
            names: &names,
            locale: 0,
        };

        let mut finder = FinderState::over_blocks("*".to_string());
        let mut seen = Vec::new();
        while let Some(found) = finder.next(&view) {
            seen.push((found.name, found.hash_index));
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ("file_00000000.dat".to_string(), u32::MAX));
    }

    #[test]
    fn name_finder_skips_stale_listfile_entries() {
        let (hash_table, block_table, names) = fixture();
        let view = FinderView {
            hash_table: &hash_table,
            block_table: &block_table,
            names: &names,
            locale: 0,
        };

        let listed = vec![
            "alpha.txt".to_string(),
            "ghost.txt".to_string(),
            "beta.dat".to_string(),
        ];
        let mut finder = FinderState::over_names("*".to_string(), listed);
        let mut seen = Vec::new();
        while let Some(found) = finder.next(&view) {
            seen.push((found.name, found.file_size));
        }
        assert_eq!(
            seen,
            [
                ("alpha.txt".to_string(), 10),
                ("beta.dat".to_string(), 20)
            ]
        );
    }
}
