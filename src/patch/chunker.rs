//! Target partitioning
//!
//! Two strategies share one output shape, a sequence of [`Piece`]s:
//! - `literal`: the whole target is one piece (bounded by the window size)
//! - `cdc`: FastCDC v2020 boundaries so local edits only disturb nearby chunks
use std::io::{self, Read};

use fastcdc::v2020::StreamCDC;
use serde::{Deserialize, Serialize};

use crate::patch::{ConfigError, PatchError};

// FastCDC v2020 limits, StreamCDC asserts on these
const MIN_SIZE_RANGE: (u32, u32) = (64, 1024 * 1024);
const AVG_SIZE_RANGE: (u32, u32) = (256, 4 * 1024 * 1024);
const MAX_SIZE_RANGE: (u32, u32) = (1024, 16 * 1024 * 1024);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    Literal,
    #[default]
    Cdc,
}

impl ChunkMode {
    pub fn as_u8(self) -> u8 {
        match self {
            ChunkMode::Literal => 0,
            ChunkMode::Cdc => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<ChunkMode> {
        match v {
            0 => Some(ChunkMode::Literal),
            1 => Some(ChunkMode::Cdc),
            _ => None,
        }
    }
}

/// Chunk size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSizes {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl ChunkSizes {
    pub const DEFAULT: ChunkSizes = ChunkSizes {
        min_size: 2 * 1024,  // 2KB
        avg_size: 8 * 1024,  // 8KB
        max_size: 64 * 1024, // 64KB
    };

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(ConfigError::ChunkOrder {
                min: self.min_size,
                avg: self.avg_size,
                max: self.max_size,
            });
        }

        for (field, value, (lo, hi)) in [
            ("min_size", self.min_size, MIN_SIZE_RANGE),
            ("avg_size", self.avg_size, AVG_SIZE_RANGE),
            ("max_size", self.max_size, MAX_SIZE_RANGE),
        ] {
            if value < lo || value > hi {
                return Err(ConfigError::ChunkBound { field, value, lo, hi });
            }
        }
        Ok(())
    }
}

impl Default for ChunkSizes {
    fn default() -> Self {
        ChunkSizes::DEFAULT
    }
}

/// One slice of the target, in target order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Iterator of [`Piece`]s over a target stream.
///
/// Only one piece is held at a time, so memory is bounded by the max chunk
/// size (cdc) or the window (literal).
pub enum Chunker<R: Read> {
    Literal { source: Option<R>, window: usize },
    Cdc(StreamCDC<R>),
}

impl<R: Read> Chunker<R> {
    /// The sizes must already be validated.
    pub fn new(source: R, mode: ChunkMode, sizes: ChunkSizes, window: usize) -> Self {
        match mode {
            ChunkMode::Literal => Chunker::Literal {
                source: Some(source),
                window,
            },
            ChunkMode::Cdc => Chunker::Cdc(StreamCDC::new(
                source,
                sizes.min_size,
                sizes.avg_size,
                sizes.max_size,
            )),
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Piece, PatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Chunker::Literal { source, window } => {
                let source = source.take()?;
                Some(read_whole(source, *window))
            }
            Chunker::Cdc(cdc) => cdc.next().map(|chunk| match chunk {
                Ok(chunk) => Ok(Piece {
                    offset: chunk.offset,
                    data: chunk.data,
                }),
                Err(fastcdc::v2020::Error::IoError(e)) => Err(PatchError::IO(e)),
                Err(e) => Err(PatchError::IO(io::Error::new(
                    io::ErrorKind::Other,
                    format!("chunker: {:?}", e),
                ))),
            }),
        }
    }
}

fn read_whole<R: Read>(source: R, window: usize) -> Result<Piece, PatchError> {
    let mut data = Vec::new();
    source.take(window as u64 + 1).read_to_end(&mut data)?;

    if data.len() > window {
        return Err(ConfigError::LiteralTooLarge { window }.into());
    }
    Ok(Piece { offset: 0, data })
}

#[cfg(test)]
mod test_chunker {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    const SMALL: ChunkSizes = ChunkSizes {
        min_size: 64,
        avg_size: 256,
        max_size: 1024,
    };

    fn pieces(data: &[u8], mode: ChunkMode, sizes: ChunkSizes) -> Vec<Piece> {
        Chunker::new(Cursor::new(data.to_vec()), mode, sizes, 1 << 20)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn literal_is_one_piece() {
        let data = vec![7u8; 5000];
        let out = pieces(&data, ChunkMode::Literal, SMALL);

        assert_eq!(out, vec![Piece { offset: 0, data }]);
    }

    #[test]
    fn literal_empty_is_one_piece() {
        let out = pieces(&[], ChunkMode::Literal, SMALL);

        assert_eq!(out, vec![Piece { offset: 0, data: vec![] }]);
    }

    #[test]
    fn literal_over_window() {
        let mut chunker = Chunker::new(Cursor::new(vec![0u8; 11]), ChunkMode::Literal, SMALL, 10);

        assert!(matches!(
            chunker.next(),
            Some(Err(PatchError::Config(ConfigError::LiteralTooLarge { window: 10 })))
        ));
        assert!(chunker.next().is_none());
    }

    #[test]
    fn cdc_empty_is_no_pieces() {
        assert!(pieces(&[], ChunkMode::Cdc, SMALL).is_empty());
    }

    #[test]
    fn cdc_respects_max() {
        let data: Vec<u8> = (0u8..=255).cycle().take(64 * 1024).collect();
        let out = pieces(&data, ChunkMode::Cdc, SMALL);

        assert!(out.len() > 1);
        assert!(out.iter().all(|p| p.data.len() <= SMALL.max_size as usize));
    }

    #[test]
    fn size_validation() {
        assert!(ChunkSizes::DEFAULT.validate().is_ok());
        assert!(SMALL.validate().is_ok());

        let swapped = ChunkSizes {
            min_size: 4096,
            avg_size: 2048,
            max_size: 8192,
        };
        assert!(matches!(swapped.validate(), Err(ConfigError::ChunkOrder { .. })));

        let tiny = ChunkSizes {
            min_size: 16,
            avg_size: 256,
            max_size: 1024,
        };
        assert!(matches!(
            tiny.validate(),
            Err(ConfigError::ChunkBound { field: "min_size", .. })
        ));
    }

    #[test]
    fn mode_bytes() {
        for mode in [ChunkMode::Literal, ChunkMode::Cdc] {
            assert_eq!(ChunkMode::from_u8(mode.as_u8()), Some(mode));
        }
        assert_eq!(ChunkMode::from_u8(7), None);
    }

    proptest! {
        #[test]
        fn cdc_is_contiguous_and_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=16384)) {
            let a = pieces(&data, ChunkMode::Cdc, SMALL);
            let b = pieces(&data, ChunkMode::Cdc, SMALL);
            prop_assert_eq!(&a, &b);

            let mut expected_offset = 0u64;
            for piece in &a {
                prop_assert_eq!(piece.offset, expected_offset, "pieces must be contiguous");
                expected_offset += piece.data.len() as u64;
            }
            prop_assert_eq!(expected_offset as usize, data.len());
        }
    }
}
