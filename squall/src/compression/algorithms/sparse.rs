//! Run-length coding of zero bytes
//!
//! Control bytes drive the stream: 0xFF ends it, a byte with the high
//! bit set stores that many zeros, and a low value is a count of
//! literal bytes that follow. Zero runs chunk at 0x7E so a run control
//! can never alias the end marker.

use crate::error::{Error, Result};

const END_MARKER: u8 = 0xFF;
const MAX_ZERO_RUN: usize = 0x7E;
const MAX_LITERAL_RUN: usize = 0x7F;

pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let zero_start = pos;
        while pos < data.len() && data[pos] == 0 {
            pos += 1;
        }
        let mut zero_count = pos - zero_start;
        while zero_count > 0 {
            let chunk = zero_count.min(MAX_ZERO_RUN);
            output.push(0x80 | chunk as u8);
            zero_count -= chunk;
        }

        let literal_start = pos;
        while pos < data.len() && data[pos] != 0 && pos - literal_start < MAX_LITERAL_RUN {
            pos += 1;
        }
        if pos > literal_start {
            output.push((pos - literal_start) as u8);
            output.extend_from_slice(&data[literal_start..pos]);
        }
    }

    output.push(END_MARKER);
    Ok(output)
}

pub(crate) fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(expected_size);
    let mut pos = 0;

    while pos < data.len() && output.len() < expected_size {
        let control = data[pos];
        pos += 1;

        if control == END_MARKER {
            break;
        }

        if control & 0x80 != 0 {
            let count = (control & 0x7F) as usize;
            output.resize(output.len() + count, 0);
        } else {
            let count = control as usize;
            if pos + count > data.len() {
                return Err(Error::compression("sparse stream ends inside a literal run"));
            }
            output.extend_from_slice(&data[pos..pos + count]);
            pos += count;
        }
    }

    // Trailing zeros are stored implicitly.
    if output.len() < expected_size {
        output.resize(expected_size, 0);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_mixed_data() {
        let original = b"Hello\0\0\0\0\0World\0\0\0!!!";
        let packed = compress(original).unwrap();
        assert_eq!(decompress(&packed, original.len()).unwrap(), original);
    }

    #[test]
    fn long_zero_run_between_literals_round_trips() {
        // A run longer than one chunk must not truncate what follows.
        let mut original = vec![b'A'];
        original.extend(std::iter::repeat(0u8).take(1000));
        original.push(b'Z');

        let packed = compress(&original).unwrap();
        assert_eq!(decompress(&packed, original.len()).unwrap(), original);
    }

    #[test]
    fn all_zeros_compress_well() {
        let original = vec![0u8; 4096];
        let packed = compress(&original).unwrap();
        assert!(packed.len() < 100);
        assert_eq!(decompress(&packed, original.len()).unwrap(), original);
    }

    #[test]
    fn trailing_zeros_are_implicit() {
        // A stream that ends early unpacks to zeros up to the
        // expected size.
        let packed = [0x02, b'h', b'i', END_MARKER];
        assert_eq!(decompress(&packed, 5).unwrap(), b"hi\0\0\0");
    }

    #[test]
    fn truncated_literal_run_is_an_error() {
        let packed = [0x05, b'h', b'i'];
        assert!(decompress(&packed, 5).is_err());
    }
}
