use thiserror::Error;

use crate::codec::CodecError;

#[derive(Error, Debug)]
pub enum HdiffError {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("structural error: {0}")]
    Structural(#[from] StructuralError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("index entry limit exceeded")]
    EntryLimit,
}

impl HdiffError {
    pub fn is_structural(&self) -> bool {
        matches!(self, HdiffError::Structural(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, HdiffError::Integrity(_))
    }
}

/// The file does not have the shape of an HCTX container.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StructuralError {
    #[error("invalid patch magic {found:02x?}")]
    Magic { found: Vec<u8> },
    #[error("unsupported format version {major}.{minor}")]
    Version { major: u8, minor: u8 },
    #[error("file truncated: layout needs {expected} bytes, file has {actual}")]
    Truncated { expected: u64, actual: u64 },
    #[error("trailing data: layout ends at {expected} bytes, file has {actual}")]
    TrailingBytes { expected: u64, actual: u64 },
    #[error("inconsistent header: {0}")]
    Offsets(&'static str),
    #[error("index length {declared} does not match {count} entries")]
    IndexLength { declared: u64, count: u32 },
    #[error("chunk {index} lies outside the data section")]
    EntryBounds { index: usize },
    #[error("chunk {index} declares {len} bytes, limit is {limit}")]
    ChunkTooLarge { index: usize, len: usize, limit: usize },
}

/// The file has the right shape but its content does not match its digests.
///
/// The footer digest covers the index, so it is checked first: a damaged
/// index reports `FooterDigest`, and `IndexChecksum` only surfaces when the
/// footer digest was recomputed over the damaged bytes.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("footer digest mismatch")]
    FooterDigest,
    #[error("index checksum mismatch")]
    IndexChecksum,
    #[error("footer reserved bytes are not zero")]
    FooterReserved,
    #[error("chunk {index} checksum mismatch")]
    ChunkChecksum { index: usize },
}
