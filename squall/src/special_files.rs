//! Internal bookkeeping files
//!
//! Archives carry optional internal files alongside user data: the
//! listfile records known file names, the attributes file records
//! per-block metadata. Both are stored and addressed like regular
//! files.

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// Name of the internal file list
pub const LISTFILE_NAME: &str = "(listfile)";

/// Name of the internal attributes file
pub const ATTRIBUTES_NAME: &str = "(attributes)";

/// Name of the digital signature file, recognized but never written
pub const SIGNATURE_NAME: &str = "(signature)";

/// True for names reserved for internal bookkeeping
pub fn is_internal_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(LISTFILE_NAME)
        || name.eq_ignore_ascii_case(ATTRIBUTES_NAME)
        || name.eq_ignore_ascii_case(SIGNATURE_NAME)
}

/// Extracts file names from listfile data.
///
/// Lines hold one name each. Empty lines and comment lines are
/// skipped, and anything after a semicolon on a name line is metadata.
pub fn parse_listfile(data: &[u8]) -> Vec<String> {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text.to_string(),
        Err(err) => {
            log::warn!("listfile is not valid UTF-8 ({err}), converting lossily");
            String::from_utf8_lossy(data).into_owned()
        }
    };

    let mut names = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        let name = match line.split_once(';') {
            Some((head, _)) => head.trim(),
            None => line,
        };
        if !name.is_empty() {
            names.push(name.to_string());
        }
    }
    names
}

/// Serializes a listfile: case-insensitively sorted, CRLF-terminated
pub fn build_listfile(names: &[String]) -> Vec<u8> {
    let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
    sorted.sort_by_key(|name| name.to_ascii_uppercase());

    let mut out = String::new();
    for name in sorted {
        out.push_str(name);
        out.push_str("\r\n");
    }
    out.into_bytes()
}

/// Per-block metadata stored in the attributes file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    /// Which arrays the file stores
    pub flags: u32,
    /// CRC32 of each file's unpacked data
    pub crc32: Vec<u32>,
    /// Windows file times
    pub filetimes: Vec<u64>,
    /// MD5 of each file's unpacked data
    pub md5: Vec<[u8; 16]>,
}

impl Attributes {
    /// The only attributes format version ever defined
    pub const VERSION: u32 = 100;

    /// The file stores a CRC32 array
    pub const CRC32: u32 = 0x01;
    /// The file stores a file time array
    pub const FILETIME: u32 = 0x02;
    /// The file stores an MD5 array
    pub const MD5: u32 = 0x04;

    /// Fresh attributes tracking all three arrays
    pub fn new(block_count: usize) -> Self {
        let mut attributes = Attributes {
            flags: Self::CRC32 | Self::FILETIME | Self::MD5,
            ..Attributes::default()
        };
        attributes.resize(block_count);
        attributes
    }

    /// Parses attributes data for an archive with `block_count` block
    /// entries.
    ///
    /// Archives in the wild disagree on whether the arrays cover the
    /// attributes file's own block; short arrays are padded with
    /// zeros rather than rejected.
    pub fn parse(data: &[u8], block_count: usize) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::bad_format("attributes file shorter than its header"));
        }

        let mut cursor = std::io::Cursor::new(data);
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != Self::VERSION {
            return Err(Error::bad_format(format!(
                "unsupported attributes version {version}"
            )));
        }
        let flags = cursor.read_u32::<LittleEndian>()?;

        let expected = 8
            + usize::from(flags & Self::CRC32 != 0) * 4 * block_count
            + usize::from(flags & Self::FILETIME != 0) * 8 * block_count
            + usize::from(flags & Self::MD5 != 0) * 16 * block_count;
        if data.len() < expected {
            log::warn!(
                "attributes file holds {} bytes where {expected} were expected, \
                 missing entries read as zero",
                data.len()
            );
        }

        let mut attributes = Attributes {
            flags,
            ..Attributes::default()
        };
        if flags & Self::CRC32 != 0 {
            attributes.crc32 = (0..block_count)
                .map(|_| cursor.read_u32::<LittleEndian>().unwrap_or(0))
                .collect();
        }
        if flags & Self::FILETIME != 0 {
            attributes.filetimes = (0..block_count)
                .map(|_| cursor.read_u64::<LittleEndian>().unwrap_or(0))
                .collect();
        }
        if flags & Self::MD5 != 0 {
            attributes.md5 = (0..block_count)
                .map(|_| {
                    let mut digest = [0u8; 16];
                    let _ = std::io::Read::read_exact(&mut cursor, &mut digest);
                    digest
                })
                .collect();
        }

        Ok(attributes)
    }

    /// Serializes the stored arrays
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&Self::VERSION.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        if self.flags & Self::CRC32 != 0 {
            for crc in &self.crc32 {
                out.extend_from_slice(&crc.to_le_bytes());
            }
        }
        if self.flags & Self::FILETIME != 0 {
            for time in &self.filetimes {
                out.extend_from_slice(&time.to_le_bytes());
            }
        }
        if self.flags & Self::MD5 != 0 {
            for digest in &self.md5 {
                out.extend_from_slice(digest);
            }
        }
        out
    }

    /// Grows or shrinks the arrays to match the block table
    pub fn resize(&mut self, block_count: usize) {
        if self.flags & Self::CRC32 != 0 {
            self.crc32.resize(block_count, 0);
        }
        if self.flags & Self::FILETIME != 0 {
            self.filetimes.resize(block_count, 0);
        }
        if self.flags & Self::MD5 != 0 {
            self.md5.resize(block_count, [0; 16]);
        }
    }

    /// Records metadata for the file at block `index`
    pub fn record(&mut self, index: usize, crc32: u32, filetime: u64, md5: [u8; 16]) {
        if self.flags & Self::CRC32 != 0 && index < self.crc32.len() {
            self.crc32[index] = crc32;
        }
        if self.flags & Self::FILETIME != 0 && index < self.filetimes.len() {
            self.filetimes[index] = filetime;
        }
        if self.flags & Self::MD5 != 0 && index < self.md5.len() {
            self.md5[index] = md5;
        }
    }

    /// Zeroes the metadata for the file at block `index`
    pub fn clear(&mut self, index: usize) {
        self.record(index, 0, 0, [0; 16]);
    }
}

/// The current time as a Windows file time
pub fn filetime_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => (elapsed.as_secs() + 11_644_473_600) * 10_000_000,
        Err(_) => 0,
    }
}
