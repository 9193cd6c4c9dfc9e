use std::collections::HashMap;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};

use log::{debug, info};

use hcore::hash::{hash_bytes, Hash, Hasher};
use hdiff::codec::{self, ZSTD_DICT_MAGIC};
use hdiff::hctx::builder::HdiffBuilder;
use hdiff::{EntryFlags, HdiffError, Importance};

use crate::patch::chunker::{ChunkMode, ChunkSizes, Chunker};
use crate::patch::op::{ChainRecord, ChunkOp};
use crate::patch::simhash::{self, NearIndex, Region};
use crate::patch::{read_region, ConfigError, PatchError};

pub const DEFAULT_LEVEL: i32 = 3;
pub const DEFAULT_WINDOW: usize = 64 * 1024 * 1024;
pub const MAX_WINDOW: usize = 1024 * 1024 * 1024;

// Sequential reads never buffer more than this, even with a larger window
const IO_BUFFER_MAX: usize = 4 * 1024 * 1024;

// Shared dictionary training
const DICT_SAMPLE_BUDGET: usize = 1024 * 1024;
const DICT_MAX_SIZE: usize = 16 * 1024;
const DICT_MIN_SAMPLES: usize = 8;
const SHARED_DICT_ID: u16 = 1;
// Ops held back while sampling, whatever their kind
const DICT_MAX_PENDING: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub mode: ChunkMode,
    pub sizes: ChunkSizes,
    pub level: i32,
    pub dictionary_sharing: bool,
    pub importance: Importance,
    pub window: usize,
    pub max_distance: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            mode: ChunkMode::Cdc,
            sizes: ChunkSizes::DEFAULT,
            level: DEFAULT_LEVEL,
            dictionary_sharing: false,
            importance: Importance::User,
            window: DEFAULT_WINDOW,
            max_distance: simhash::DEFAULT_MAX_DISTANCE,
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sizes.validate()?;

        let levels = zstd::compression_level_range();
        if !levels.contains(&self.level) {
            return Err(ConfigError::Level {
                level: self.level,
                min: *levels.start(),
                max: *levels.end(),
            });
        }

        let min_window = match self.mode {
            ChunkMode::Cdc => self.sizes.max_size as usize,
            ChunkMode::Literal => 1,
        };
        if self.window < min_window || self.window > MAX_WINDOW {
            return Err(ConfigError::Window {
                window: self.window,
                min: min_window,
                max: MAX_WINDOW,
            });
        }
        Ok(())
    }

    fn io_buffer(&self) -> usize {
        self.window.min(IO_BUFFER_MAX)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    pub literal: usize,
    pub copy: usize,
    pub delta: usize,
    pub dictionary: usize,
}

impl OpStats {
    fn count(&mut self, op: &ChunkOp) {
        match op {
            ChunkOp::Literal(_) => self.literal += 1,
            ChunkOp::Copy { .. } => self.copy += 1,
            ChunkOp::Delta { .. } => self.delta += 1,
            ChunkOp::Dictionary { .. } => self.dictionary += 1,
            ChunkOp::Chain(_) => (),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub chain: ChainRecord,
    pub patch_len: u64,
    pub chunks: usize,
    pub ops: OpStats,
}

// What the target pass can reuse from the base
#[derive(Default)]
struct BaseIndex {
    hash: Option<Hash>,
    len: u64,
    exact: HashMap<Hash, Region>,
    near: NearIndex,
}

pub struct PatchBuilder {
    config: BuildConfig,
}

impl PatchBuilder {
    pub fn new(config: BuildConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(PatchBuilder { config })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Builds a patch turning `base` into `target` and writes it to `out`.
    ///
    /// Chunk payloads go to `spool` as soon as they are encoded, only the
    /// index stays in memory. The base is read once sequentially to index it,
    /// then only the regions picked for deltas are read back.
    pub fn build<B, T, D, W>(
        &self,
        mut base: B,
        target: T,
        spool: D,
        out: W,
    ) -> Result<BuildSummary, PatchError>
    where
        B: Read + Seek,
        T: Read,
        D: Read + Write + Seek,
        W: Write,
    {
        let index = self.index_base(&mut base)?;
        debug!(
            "Indexed base: {} bytes, {} regions",
            index.len,
            index.exact.len()
        );

        let container = HdiffBuilder::new(spool).with_window(self.config.window);
        let mut emitter = Emitter::new(container, &self.config);
        let mut hasher = Hasher::new();
        let mut new_len = 0u64;

        let target = BufReader::with_capacity(self.config.io_buffer(), target);
        for piece in Chunker::new(target, self.config.mode, self.config.sizes, self.config.window) {
            let piece = piece?;
            hasher.update(&piece.data);
            new_len += piece.data.len() as u64;

            let op = self.plan(piece.data, &index, &mut base)?;
            emitter.push(op)?;
        }

        let chain = ChainRecord {
            mode: self.config.mode,
            old_len: index.len,
            new_len,
            old_hash: index.hash.unwrap_or_else(|| hash_bytes(&[])),
            new_hash: hasher.finalize(),
        };
        let (container, ops) = emitter.finish(chain)?;
        let layout = container.finalize(out)?;

        info!(
            "Built patch: {} chunks ({} copy, {} delta, {} literal), {} bytes",
            layout.header.entry_count, ops.copy, ops.delta, ops.literal, layout.file_len
        );

        Ok(BuildSummary {
            chain,
            patch_len: layout.file_len,
            chunks: layout.header.entry_count as usize,
            ops,
        })
    }

    /// In-memory convenience over [`PatchBuilder::build`].
    pub fn build_bytes(&self, base: &[u8], target: &[u8]) -> Result<(Vec<u8>, BuildSummary), PatchError> {
        let mut out = Vec::new();
        let summary = self.build(Cursor::new(base), target, Cursor::new(Vec::new()), &mut out)?;
        Ok((out, summary))
    }

    fn index_base<B: Read + Seek>(&self, base: &mut B) -> Result<BaseIndex, PatchError> {
        base.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::with_capacity(self.config.io_buffer(), &mut *base);
        let mut index = BaseIndex::default();
        let mut hasher = Hasher::new();

        match self.config.mode {
            ChunkMode::Literal => {
                // Only a byte identical target can reuse the base
                index.len = io::copy(&mut reader, &mut hasher)?;
                if let Ok(len) = u32::try_from(index.len) {
                    index
                        .exact
                        .insert(hasher.finalize(), Region { offset: 0, len });
                }
            }
            ChunkMode::Cdc => {
                for piece in Chunker::new(reader, ChunkMode::Cdc, self.config.sizes, self.config.window) {
                    let piece = piece?;
                    hasher.update(&piece.data);
                    index.len += piece.data.len() as u64;

                    let region = Region {
                        offset: piece.offset,
                        len: piece.data.len() as u32,
                    };
                    index.exact.entry(hash_bytes(&piece.data)).or_insert(region);
                    index.near.insert(simhash::fingerprint(&piece.data), region);
                }
            }
        }

        index.hash = Some(hasher.finalize());
        Ok(index)
    }

    fn plan<B: Read + Seek>(
        &self,
        data: Vec<u8>,
        index: &BaseIndex,
        base: &mut B,
    ) -> Result<ChunkOp, PatchError> {
        if let Some(region) = index.exact.get(&hash_bytes(&data)) {
            if region.len as usize == data.len() {
                return Ok(ChunkOp::Copy {
                    offset: region.offset,
                    len: region.len,
                });
            }
        }

        if self.config.mode == ChunkMode::Cdc && !data.is_empty() {
            let fp = simhash::fingerprint(&data);
            if let Some((region, _)) = index.near.nearest(fp, self.config.max_distance) {
                if let Some(op) = self.try_delta(&data, region, base)? {
                    return Ok(op);
                }
            }
        }

        Ok(ChunkOp::Literal(data))
    }

    // A delta only wins when it beats the literal encoding of the same bytes
    fn try_delta<B: Read + Seek>(
        &self,
        data: &[u8],
        region: Region,
        base: &mut B,
    ) -> Result<Option<ChunkOp>, PatchError> {
        let reference = read_region(base, region.offset, region.len as usize)?;

        // A region that looks like a trained dictionary would not load as raw content
        if reference.starts_with(&ZSTD_DICT_MAGIC) {
            return Ok(None);
        }

        let frame = codec::compress(data, self.config.level, Some(reference.as_slice()))?;
        let literal = codec::compress(data, self.config.level, None)?;
        if frame.len() + 16 >= literal.len() {
            return Ok(None);
        }

        Ok(Some(ChunkOp::Delta {
            offset: region.offset,
            base_len: region.len,
            target_len: data.len() as u32,
            frame,
        }))
    }
}

enum DictState {
    Off,
    Collecting { pending: Vec<ChunkOp>, held: usize },
    Ready(Vec<u8>),
}

impl DictState {
    fn collecting() -> Self {
        DictState::Collecting {
            pending: Vec::new(),
            held: 0,
        }
    }
}

// Bytes an op keeps alive while it waits in the pending queue
fn held_len(op: &ChunkOp) -> usize {
    match op {
        ChunkOp::Literal(data) => data.len(),
        ChunkOp::Delta { frame, .. } => 17 + frame.len(),
        ChunkOp::Dictionary { bytes, .. } => 3 + bytes.len(),
        ChunkOp::Copy { .. } | ChunkOp::Chain(_) => std::mem::size_of::<ChunkOp>(),
    }
}

// Encodes ops into container entries, in order
struct Emitter<'c, D: Read + Write + Seek> {
    container: HdiffBuilder<D>,
    config: &'c BuildConfig,
    dict: DictState,
    stats: OpStats,
}

impl<'c, D: Read + Write + Seek> Emitter<'c, D> {
    fn new(container: HdiffBuilder<D>, config: &'c BuildConfig) -> Self {
        let dict = if config.dictionary_sharing && config.mode == ChunkMode::Cdc {
            DictState::collecting()
        } else {
            DictState::Off
        };

        Emitter {
            container,
            config,
            dict,
            stats: OpStats::default(),
        }
    }

    fn push(&mut self, op: ChunkOp) -> Result<(), PatchError> {
        if let DictState::Collecting { pending, held } = &mut self.dict {
            *held += held_len(&op);
            pending.push(op);

            let full = *held >= DICT_SAMPLE_BUDGET || pending.len() >= DICT_MAX_PENDING;
            if full {
                self.train(true)?;
            }
            return Ok(());
        }
        self.write(&op)
    }

    fn finish(mut self, chain: ChainRecord) -> Result<(HdiffBuilder<D>, OpStats), PatchError> {
        self.train(false)?;
        self.write(&ChunkOp::Chain(chain))?;
        Ok((self.container, self.stats))
    }

    // Trains on the buffered literals then flushes everything that was held back.
    // Too few samples with `retry` set keeps sampling the ops that follow.
    fn train(&mut self, retry: bool) -> Result<(), PatchError> {
        let pending = match std::mem::replace(&mut self.dict, DictState::Off) {
            DictState::Collecting { pending, .. } => pending,
            other => {
                self.dict = other;
                return Ok(());
            }
        };

        let mut sparse = false;
        let trained = {
            let samples: Vec<&[u8]> = pending
                .iter()
                .filter_map(|op| match op {
                    ChunkOp::Literal(data) if !data.is_empty() => Some(&data[..]),
                    _ => None,
                })
                .collect();

            if samples.len() < DICT_MIN_SAMPLES {
                debug!("Only {} samples, skipping dictionary", samples.len());
                sparse = true;
                None
            } else {
                match zstd::dict::from_samples(&samples, DICT_MAX_SIZE) {
                    Ok(dict) => Some(dict),
                    Err(e) => {
                        debug!("Dictionary training failed, continuing without: {}", e);
                        None
                    }
                }
            }
        };

        if let Some(dict) = trained {
            debug!("Trained shared dictionary of {} bytes", dict.len());
            self.write(&ChunkOp::Dictionary {
                id: SHARED_DICT_ID,
                bytes: dict.clone(),
            })?;
            self.dict = DictState::Ready(dict);
        }

        for op in pending.iter() {
            self.write(op)?;
        }
        if retry && sparse {
            self.dict = DictState::collecting();
        }
        Ok(())
    }

    fn write(&mut self, op: &ChunkOp) -> Result<(), PatchError> {
        let record = op.encode();
        let level = self.config.level;

        let (frame, dict_id) = match (&self.dict, op) {
            (DictState::Ready(dict), ChunkOp::Literal(_)) => {
                let plain = codec::compress(&record, level, None)?;
                let shared = codec::compress(&record, level, Some(dict.as_slice()))?;
                if shared.len() < plain.len() {
                    (shared, SHARED_DICT_ID)
                } else {
                    (plain, 0)
                }
            }
            _ => (codec::compress(&record, level, None)?, 0),
        };

        let importance = match op {
            ChunkOp::Dictionary { .. } | ChunkOp::Chain(_) => Importance::System,
            _ => self.config.importance,
        };
        // Dictionary ids used here always fit the 12 bit field
        let flags = EntryFlags::new(importance, dict_id).unwrap_or_default();
        let record_len = u32::try_from(record.len()).map_err(|_| HdiffError::EntryLimit)?;

        self.container.append_chunk(&frame, record_len, flags)?;
        self.stats.count(op);
        Ok(())
    }
}
