//! The shared encryption table

/// Builds the 0x500-entry table at compile time.
///
/// Five 0x100-entry groups are interleaved: group 0 feeds the string
/// hash for table lookups, groups 1 and 2 the two verification hashes,
/// group 3 the file key hash, and group 4 the stream cipher.
const fn build_encryption_table() -> [u32; 0x500] {
    let mut table = [0u32; 0x500];
    let mut seed: u32 = 0x0010_0001;
    let mut index1 = 0;

    while index1 < 0x100 {
        let mut index2 = index1;
        let mut i = 0;
        while i < 5 {
            seed = (seed * 125 + 3) % 0x2AAAAB;
            let temp1 = (seed & 0xFFFF) << 0x10;
            seed = (seed * 125 + 3) % 0x2AAAAB;
            let temp2 = seed & 0xFFFF;

            table[index2] = temp1 | temp2;
            i += 1;
            index2 += 0x100;
        }
        index1 += 1;
    }

    table
}

/// Table driving both the string hashes and the stream cipher
pub static ENCRYPTION_TABLE: [u32; 0x500] = build_encryption_table();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_table_values() {
        // First entries of the first two groups, computed by hand from
        // the generator recurrence.
        assert_eq!(ENCRYPTION_TABLE[0x000], 0x55C6_36E2);
        assert_eq!(ENCRYPTION_TABLE[0x100], 0x76F8_C1B1);
    }

    #[test]
    fn table_has_no_duplicate_runs() {
        // The generator never stalls: adjacent entries always differ.
        for pair in ENCRYPTION_TABLE.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }
}
