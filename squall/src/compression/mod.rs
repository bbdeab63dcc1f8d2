//! Sector compression and decompression
//!
//! A compressed sector stores a one-byte method mask ahead of its
//! payload. Several methods may be stacked; the mask carries one bit
//! per method, except LZMA which claims its mask value outright.

mod algorithms;
mod compress;
mod decompress;

pub use compress::compress;
pub use decompress::decompress;

/// Method mask bits
pub mod flags {
    /// Huffman coding, not supported
    pub const HUFFMAN: u8 = 0x01;
    /// zlib deflate
    pub const ZLIB: u8 = 0x02;
    /// PKWare implode, not supported
    pub const PKWARE: u8 = 0x08;
    /// bzip2
    pub const BZIP2: u8 = 0x10;
    /// Run-length coding of zero bytes
    pub const SPARSE: u8 = 0x20;
    /// ADPCM mono audio, not supported
    pub const ADPCM_MONO: u8 = 0x40;
    /// ADPCM stereo audio, not supported
    pub const ADPCM_STEREO: u8 = 0x80;
    /// LZMA; an exact mask value, not a bit
    pub const LZMA: u8 = 0x12;
}

/// Compression choices for newly written files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMethod {
    /// Store without compression
    None,
    /// zlib deflate
    #[default]
    Zlib,
    /// bzip2
    Bzip2,
    /// LZMA
    Lzma,
    /// Zero run-length coding alone
    Sparse,
    /// Zero run-length coding, then zlib
    SparseZlib,
}

impl CompressionMethod {
    /// The method mask this choice writes ahead of compressed sectors
    pub fn mask(self) -> u8 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Zlib => flags::ZLIB,
            CompressionMethod::Bzip2 => flags::BZIP2,
            CompressionMethod::Lzma => flags::LZMA,
            CompressionMethod::Sparse => flags::SPARSE,
            CompressionMethod::SparseZlib => flags::SPARSE | flags::ZLIB,
        }
    }
}
