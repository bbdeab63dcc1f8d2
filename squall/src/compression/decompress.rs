//! Decompression dispatch

use super::compress::check_supported;
use super::{algorithms, flags};
use crate::error::{Error, Result};

/// Undoes every method in `method_mask`, in the reverse of the order
/// they were applied, and checks the unpacked size.
pub fn decompress(data: &[u8], method_mask: u8, expected_size: usize) -> Result<Vec<u8>> {
    let output = if method_mask == 0 {
        data.to_vec()
    } else if method_mask == flags::LZMA {
        decompress_lzma(data)?
    } else {
        check_supported(method_mask)?;

        let mut output = data.to_vec();
        if method_mask & flags::BZIP2 != 0 {
            output = decompress_bzip2(&output)?;
        }
        if method_mask & flags::ZLIB != 0 {
            output = algorithms::zlib::decompress(&output, expected_size)?;
        }
        if method_mask & flags::SPARSE != 0 {
            output = algorithms::sparse::decompress(&output, expected_size)?;
        }
        output
    };

    if output.len() != expected_size {
        return Err(Error::compression(format!(
            "unpacked to {} bytes where {} were expected",
            output.len(),
            expected_size
        )));
    }
    Ok(output)
}

#[cfg(feature = "compression-lzma")]
fn decompress_lzma(data: &[u8]) -> Result<Vec<u8>> {
    algorithms::lzma::decompress(data)
}

#[cfg(not(feature = "compression-lzma"))]
fn decompress_lzma(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::compression("lzma support is not compiled in"))
}

#[cfg(feature = "compression-bzip2")]
fn decompress_bzip2(data: &[u8]) -> Result<Vec<u8>> {
    algorithms::bzip2::decompress(data)
}

#[cfg(not(feature = "compression-bzip2"))]
fn decompress_bzip2(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::compression("bzip2 support is not compiled in"))
}
