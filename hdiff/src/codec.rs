//! Chunk payload codec.
//!
//! Every payload in the data section is a complete zstd frame. Compression
//! goes through `zstd::bulk`; when it does not shrink the input the payload
//! is stored as a raw-block frame instead, which any zstd decoder accepts.
use thiserror::Error;

use log::trace;

/// zstd frame magic, `0xFD2FB528` little-endian.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Magic that starts a trained (formatted) zstd dictionary.
pub const ZSTD_DICT_MAGIC: [u8; 4] = [0x37, 0xA4, 0x30, 0xEC];

pub const DEFAULT_LEVEL: i32 = 19;

// Raw blocks may not exceed 128 KiB
const MAX_BLOCK_SIZE: usize = 128 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("decoded {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },
}

/// Wraps `data` in a single segment zstd frame made of raw blocks.
pub fn raw_frame(data: &[u8]) -> Vec<u8> {
    let len = data.len() as u64;

    // Frame content size field, the 2 byte form is biased by 256
    let (fcs_flag, fcs): (u8, Vec<u8>) = if len < 256 {
        (0, vec![len as u8])
    } else if len < 256 + 0x1_0000 {
        (1, ((len - 256) as u16).to_le_bytes().to_vec())
    } else if len <= u32::MAX as u64 {
        (2, (len as u32).to_le_bytes().to_vec())
    } else {
        (3, len.to_le_bytes().to_vec())
    };

    let blocks = data.len().div_ceil(MAX_BLOCK_SIZE).max(1);
    let mut frame = Vec::with_capacity(4 + 1 + fcs.len() + blocks * 3 + data.len());
    frame.extend_from_slice(&ZSTD_MAGIC);
    // Single segment, no checksum, no dictionary id
    frame.push((fcs_flag << 6) | 0x20);
    frame.extend_from_slice(&fcs);

    if data.is_empty() {
        frame.extend_from_slice(&block_header(0, true));
        return frame;
    }

    let mut chunks = data.chunks(MAX_BLOCK_SIZE).peekable();
    while let Some(block) = chunks.next() {
        let last = chunks.peek().is_none();
        frame.extend_from_slice(&block_header(block.len(), last));
        frame.extend_from_slice(block);
    }
    frame
}

fn block_header(len: usize, last: bool) -> [u8; 3] {
    // Block type raw (0) in bits 1-2
    let value = ((len as u32) << 3) | last as u32;
    let bytes = value.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

/// Compresses `data` at `level`, optionally against a dictionary.
///
/// A trained dictionary and a raw-content dictionary (such as a base file
/// region) are both accepted. Falls back to [`raw_frame`] when compression
/// does not pay for itself.
pub fn compress(data: &[u8], level: i32, dict: Option<&[u8]>) -> Result<Vec<u8>, CodecError> {
    let mut compressor = match dict {
        Some(dict) => zstd::bulk::Compressor::with_dictionary(level, dict)?,
        None => zstd::bulk::Compressor::new(level)?,
    };
    let packed = compressor.compress(data)?;
    let raw = raw_frame(data);

    if packed.len() < raw.len() {
        trace!("compressed {} -> {} bytes", data.len(), packed.len());
        Ok(packed)
    } else {
        Ok(raw)
    }
}

/// Decodes one frame that must expand to exactly `expected` bytes.
pub fn decompress(frame: &[u8], expected: usize, dict: Option<&[u8]>) -> Result<Vec<u8>, CodecError> {
    let mut decompressor = match dict {
        Some(dict) => zstd::bulk::Decompressor::with_dictionary(dict)?,
        None => zstd::bulk::Decompressor::new()?,
    };
    let data = decompressor.decompress(frame, expected)?;

    if data.len() != expected {
        return Err(CodecError::Length {
            expected,
            actual: data.len(),
        });
    }
    Ok(data)
}


#[cfg(test)]
mod test_codec {
    use super::*;

    #[test]
    fn compressible() {
        let data = vec![b'a'; 10_000];
        let frame = compress(&data, 3, None).unwrap();

        assert!(frame.len() < 100);
        assert_eq!(decompress(&frame, data.len(), None).unwrap(), data);
    }

    // xorshift noise does not compress
    fn noise(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    #[test]
    fn incompressible_falls_back_to_raw() {
        let data = noise(4096, 0x1234_5678);
        let frame = compress(&data, 19, None).unwrap();

        assert_eq!(frame, raw_frame(&data));
    }

    #[test]
    fn raw_content_dictionary() {
        let base = noise(8192, 0xC0FF_EE11);
        let mut target = base.clone();
        target[4000] ^= 0xFF;

        let with_dict = compress(&target, 19, Some(base.as_slice())).unwrap();
        let without = compress(&target, 19, None).unwrap();

        assert!(with_dict.len() < without.len());
        assert_eq!(decompress(&with_dict, target.len(), Some(base.as_slice())).unwrap(), target);
    }

    #[test]
    fn wrong_length() {
        let frame = raw_frame(b"abc");
        assert!(decompress(&frame, 2, None).is_err());
    }
}
