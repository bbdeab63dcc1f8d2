//! bzip2

use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;

use crate::error::{Error, Result};

pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .map_err(|err| Error::compression(format!("bzip2: {err}")))?;
    encoder
        .finish()
        .map_err(|err| Error::compression(format!("bzip2: {err}")))
}

pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    BzDecoder::new(data)
        .read_to_end(&mut output)
        .map_err(|err| Error::compression(format!("bzip2: {err}")))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let original: Vec<u8> = (0..2048u32).map(|i| (i % 7) as u8).collect();
        let packed = compress(&original).unwrap();
        assert_eq!(decompress(&packed).unwrap(), original);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decompress(b"BZnot really").is_err());
    }
}
