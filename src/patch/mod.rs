//! Patch construction and application on top of the HCTX container.
//!
//! A patch is an HCTX container whose chunk payloads decode to op records
//! (see [`op::ChunkOp`]). The last entry is always the chain record holding
//! the base and target digests, which anchors the whole verification chain:
//! base hash, container digests, per chunk checksums and finally the output
//! hash.
use thiserror::Error;

use hcore::hash::Hash;
use hdiff::HdiffError;

pub mod applier;
pub mod builder;
pub mod chunker;
pub mod op;
pub mod simhash;

pub use applier::{ApplyConfig, ApplySummary, PatchApplier};
pub use builder::{BuildConfig, BuildSummary, PatchBuilder};
pub use chunker::{ChunkMode, ChunkSizes};
pub use op::{ChainRecord, ChunkOp, OpError};

#[derive(Error, Debug)]
pub enum PatchError {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Hdiff(#[from] HdiffError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("malformed op record: {0}")]
    Op(#[from] OpError),
}

impl From<hdiff::codec::CodecError> for PatchError {
    fn from(e: hdiff::codec::CodecError) -> Self {
        PatchError::Hdiff(e.into())
    }
}

/// The patch does not connect the supplied base to the recorded target.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChainError {
    #[error("patch has no chain record")]
    MissingChain,
    #[error("base file hash mismatch: patch expects {expected}, base is {actual}")]
    BaseHash { expected: Hash, actual: Hash },
    #[error("output hash mismatch: patch expects {expected}, output is {actual}")]
    OutputHash { expected: Hash, actual: Hash },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk sizes must satisfy min <= avg <= max (got {min}/{avg}/{max})")]
    ChunkOrder { min: u32, avg: u32, max: u32 },
    #[error("{field} = {value} outside [{lo}, {hi}]")]
    ChunkBound {
        field: &'static str,
        value: u32,
        lo: u32,
        hi: u32,
    },
    #[error("window of {window} bytes is outside [{min}, {max}]")]
    Window { window: usize, min: usize, max: usize },
    #[error("zstd level {level} outside {min}..={max}")]
    Level { level: i32, min: i32, max: i32 },
    #[error("literal mode needs the target to fit one window of {window} bytes")]
    LiteralTooLarge { window: usize },
}

/// Reads `len` bytes of `base` starting at `offset`.
pub(crate) fn read_region<B: std::io::Read + std::io::Seek>(
    base: &mut B,
    offset: u64,
    len: usize,
) -> std::io::Result<Vec<u8>> {
    let mut region = vec![0u8; len];
    base.seek(std::io::SeekFrom::Start(offset))?;
    base.read_exact(&mut region)?;
    Ok(region)
}
