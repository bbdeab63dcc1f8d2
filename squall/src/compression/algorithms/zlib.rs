//! zlib deflate

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|err| Error::compression(format!("zlib: {err}")))?;
    encoder
        .finish()
        .map_err(|err| Error::compression(format!("zlib: {err}")))
}

pub(crate) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(expected_size);
    ZlibDecoder::new(data)
        .read_to_end(&mut output)
        .map_err(|err| Error::compression(format!("zlib: {err}")))?;
    Ok(output)
}
