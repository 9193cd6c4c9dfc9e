use std::collections::HashMap;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};

use log::{debug, info};

use hcore::hash::{Hash, Hasher};
use hdiff::codec;
use hdiff::hctx::reader::HdiffReader;
use hdiff::hctx::MAX_CHUNK_SIZE;
use hdiff::VersionPolicy;

use crate::patch::builder::DEFAULT_WINDOW;
use crate::patch::op::{ChainRecord, ChunkOp, OpError};
use crate::patch::{read_region, ChainError, PatchError};

// Sequential reads never buffer more than this, even with a larger window
const IO_BUFFER_MAX: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyConfig {
    pub policy: VersionPolicy,
    pub window: usize,
    pub max_chunk: usize,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        ApplyConfig {
            policy: VersionPolicy::Strict,
            window: DEFAULT_WINDOW,
            max_chunk: MAX_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplySummary {
    pub chain: ChainRecord,
    pub chunks: usize,
}

pub struct PatchApplier {
    config: ApplyConfig,
}

impl PatchApplier {
    pub fn new(config: ApplyConfig) -> Self {
        PatchApplier { config }
    }

    /// Opens `patch`, verifies its digests and returns its chain record.
    ///
    /// Nothing of the patch is trusted before this succeeds.
    pub fn open<P: Read + Seek>(
        &self,
        patch: P,
    ) -> Result<(HdiffReader<P>, ChainRecord), PatchError> {
        let mut reader = HdiffReader::open(patch, self.config.policy)?
            .with_window(self.config.window)
            .with_max_chunk(self.config.max_chunk);
        reader.verify_integrity()?;

        let last = reader
            .entries()
            .len()
            .checked_sub(1)
            .ok_or(ChainError::MissingChain)?;
        if reader.entries()[last].flags.dict_id() != 0 {
            return Err(ChainError::MissingChain.into());
        }

        let record = reader.read_chunk(last, None)?;
        match ChunkOp::decode(&record) {
            Ok(ChunkOp::Chain(chain)) => Ok((reader, chain)),
            _ => Err(ChainError::MissingChain.into()),
        }
    }

    /// Reconstructs the target from `base` and `patch` into `out`.
    ///
    /// `out` receives bytes as chunks are decoded; callers that must never
    /// expose a wrong file write into a temporary and only keep it on `Ok`.
    pub fn apply<B, P, W>(&self, mut base: B, patch: P, mut out: W) -> Result<ApplySummary, PatchError>
    where
        B: Read + Seek,
        P: Read + Seek,
        W: Write,
    {
        let (mut reader, chain) = self.open(patch)?;

        let (base_len, base_hash) = self.hash_base(&mut base)?;
        if base_len != chain.old_len || base_hash != chain.old_hash {
            return Err(ChainError::BaseHash {
                expected: chain.old_hash,
                actual: base_hash,
            }
            .into());
        }

        let last = reader.entries().len() - 1;
        let mut dicts: HashMap<u16, Vec<u8>> = HashMap::new();
        let mut hasher = Hasher::new();
        let mut new_len = 0u64;

        for i in 0..last {
            let dict_id = reader.entries()[i].flags.dict_id();
            let dict = match dict_id {
                0 => None,
                id => Some(
                    dicts
                        .get(&id)
                        .ok_or(OpError::UnknownDictionary(id))?
                        .as_slice(),
                ),
            };
            let record = reader.read_chunk(i, dict)?;

            let bytes = match ChunkOp::decode(&record)? {
                ChunkOp::Literal(data) => data,
                ChunkOp::Copy { offset, len } => {
                    self.base_region(&mut base, &chain, offset, len as u64)?
                }
                ChunkOp::Delta {
                    offset,
                    base_len,
                    target_len,
                    frame,
                } => {
                    let reference = self.base_region(&mut base, &chain, offset, base_len as u64)?;
                    self.check_len(target_len as u64)?;
                    codec::decompress(&frame, target_len as usize, Some(reference.as_slice()))?
                }
                ChunkOp::Dictionary { id, bytes } => {
                    debug!("Loaded dictionary {} ({} bytes)", id, bytes.len());
                    dicts.insert(id, bytes);
                    continue;
                }
                ChunkOp::Chain(_) => return Err(OpError::MisplacedChain(i).into()),
            };

            hasher.update(&bytes);
            new_len += bytes.len() as u64;
            out.write_all(&bytes)?;
        }
        out.flush()?;

        let new_hash = hasher.finalize();
        if new_len != chain.new_len || new_hash != chain.new_hash {
            return Err(ChainError::OutputHash {
                expected: chain.new_hash,
                actual: new_hash,
            }
            .into());
        }

        info!("Applied patch: {} chunks, {} bytes out", last, new_len);
        Ok(ApplySummary {
            chain,
            chunks: last + 1,
        })
    }

    /// In-memory convenience over [`PatchApplier::apply`], nothing is
    /// returned unless every check passed.
    pub fn apply_bytes(&self, base: &[u8], patch: &[u8]) -> Result<Vec<u8>, PatchError> {
        let mut out = Vec::new();
        self.apply(Cursor::new(base), Cursor::new(patch), &mut out)?;
        Ok(out)
    }

    fn hash_base<B: Read + Seek>(&self, base: &mut B) -> Result<(u64, Hash), PatchError> {
        base.seek(SeekFrom::Start(0))?;
        let capacity = self.config.window.clamp(1, IO_BUFFER_MAX);
        let mut reader = BufReader::with_capacity(capacity, &mut *base);
        let mut hasher = Hasher::new();
        let len = io::copy(&mut reader, &mut hasher)?;

        Ok((len, hasher.finalize()))
    }

    fn base_region<B: Read + Seek>(
        &self,
        base: &mut B,
        chain: &ChainRecord,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, PatchError> {
        let in_range = offset
            .checked_add(len)
            .map(|end| end <= chain.old_len)
            .unwrap_or(false);
        if !in_range {
            return Err(OpError::BaseRange {
                offset,
                len,
                base_len: chain.old_len,
            }
            .into());
        }
        self.check_len(len)?;

        Ok(read_region(base, offset, len as usize)?)
    }

    fn check_len(&self, len: u64) -> Result<(), PatchError> {
        if len > self.config.max_chunk as u64 {
            return Err(OpError::TooLarge {
                len,
                limit: self.config.max_chunk,
            }
            .into());
        }
        Ok(())
    }
}
