//! LZMA
//!
//! Streams use the stand-alone LZMA container, which embeds the
//! unpacked size in its own header.

use std::io::Cursor;

use crate::error::{Error, Result};

pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    lzma_rs::lzma_compress(&mut Cursor::new(data), &mut output)
        .map_err(|err| Error::compression(format!("lzma: {err}")))?;
    Ok(output)
}

pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    lzma_rs::lzma_decompress(&mut Cursor::new(data), &mut output)
        .map_err(|err| Error::compression(format!("lzma: {err:?}")))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let original = b"lzma round trip payload, long enough to matter";
        let packed = compress(original).unwrap();
        assert_eq!(decompress(&packed).unwrap(), original);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decompress(&[0xFF; 4]).is_err());
    }
}
