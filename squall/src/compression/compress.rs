//! Compression dispatch

use super::{algorithms, flags};
use crate::error::{Error, Result};

/// Compresses `data` with every method in `method_mask`.
///
/// Stacked methods apply in a fixed order, zero coding first so the
/// byte-level coders see its output. The result carries no method
/// byte; the caller stores the mask ahead of it.
pub fn compress(data: &[u8], method_mask: u8) -> Result<Vec<u8>> {
    if method_mask == 0 {
        return Ok(data.to_vec());
    }
    if method_mask == flags::LZMA {
        return compress_lzma(data);
    }

    check_supported(method_mask)?;

    let mut output = data.to_vec();
    if method_mask & flags::SPARSE != 0 {
        output = algorithms::sparse::compress(&output)?;
    }
    if method_mask & flags::ZLIB != 0 {
        output = algorithms::zlib::compress(&output)?;
    }
    if method_mask & flags::BZIP2 != 0 {
        output = compress_bzip2(&output)?;
    }

    Ok(output)
}

pub(super) fn check_supported(method_mask: u8) -> Result<()> {
    if method_mask & flags::HUFFMAN != 0 {
        return Err(Error::compression("huffman coding is not supported"));
    }
    if method_mask & flags::PKWARE != 0 {
        return Err(Error::compression("pkware implode is not supported"));
    }
    if method_mask & (flags::ADPCM_MONO | flags::ADPCM_STEREO) != 0 {
        return Err(Error::compression("adpcm audio coding is not supported"));
    }
    Ok(())
}

#[cfg(feature = "compression-lzma")]
fn compress_lzma(data: &[u8]) -> Result<Vec<u8>> {
    algorithms::lzma::compress(data)
}

#[cfg(not(feature = "compression-lzma"))]
fn compress_lzma(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::compression("lzma support is not compiled in"))
}

#[cfg(feature = "compression-bzip2")]
fn compress_bzip2(data: &[u8]) -> Result<Vec<u8>> {
    algorithms::bzip2::compress(data)
}

#[cfg(not(feature = "compression-bzip2"))]
fn compress_bzip2(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::compression("bzip2 support is not compiled in"))
}
