use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use hcore::hash::Hash;

use crate::patch::chunker::ChunkMode;

const KIND_LITERAL: u8 = 0x00;
const KIND_COPY: u8 = 0x01;
const KIND_DELTA: u8 = 0x02;
const KIND_DICTIONARY: u8 = 0x03;
const KIND_CHAIN: u8 = 0x7F;

// Bumped if the chain record layout ever changes
pub const CHAIN_FORMAT: u8 = 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OpError {
    #[error("empty op record")]
    Empty,
    #[error("unknown op kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("truncated {0} record")]
    Truncated(&'static str),
    #[error("unsupported chain record format {0}")]
    ChainFormat(u8),
    #[error("unknown chunking mode {0}")]
    Mode(u8),
    #[error("chunk {0} references unknown dictionary")]
    UnknownDictionary(u16),
    #[error("base region {offset}+{len} exceeds base length {base_len}")]
    BaseRange { offset: u64, len: u64, base_len: u64 },
    #[error("chain record at chunk {0} is not the last entry")]
    MisplacedChain(usize),
    #[error("op spans {len} bytes, over the {limit} byte limit")]
    TooLarge { len: u64, limit: usize },
}

/// Base identity and target identity recorded by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRecord {
    pub mode: ChunkMode,
    pub old_len: u64,
    pub new_len: u64,
    pub old_hash: Hash,
    pub new_hash: Hash,
}

/// The decompressed content of one chunk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOp {
    /// Target bytes stored as is.
    Literal(Vec<u8>),
    /// Target bytes identical to a base region.
    Copy { offset: u64, len: u32 },
    /// Target bytes compressed against a base region used as dictionary.
    Delta {
        offset: u64,
        base_len: u32,
        target_len: u32,
        frame: Vec<u8>,
    },
    /// A shared zstd dictionary for later literal chunks.
    Dictionary { id: u16, bytes: Vec<u8> },
    Chain(ChainRecord),
}

impl ChunkOp {
    pub fn kind(&self) -> &'static str {
        match self {
            ChunkOp::Literal(_) => "literal",
            ChunkOp::Copy { .. } => "copy",
            ChunkOp::Delta { .. } => "delta",
            ChunkOp::Dictionary { .. } => "dictionary",
            ChunkOp::Chain(_) => "chain",
        }
    }

    /// Number of target bytes this op reconstructs.
    pub fn target_len(&self) -> u64 {
        match self {
            ChunkOp::Literal(data) => data.len() as u64,
            ChunkOp::Copy { len, .. } => *len as u64,
            ChunkOp::Delta { target_len, .. } => *target_len as u64,
            ChunkOp::Dictionary { .. } | ChunkOp::Chain(_) => 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ChunkOp::Literal(data) => {
                out.reserve(1 + data.len());
                out.push(KIND_LITERAL);
                out.extend_from_slice(data);
            }
            ChunkOp::Copy { offset, len } => {
                out.push(KIND_COPY);
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
            }
            ChunkOp::Delta {
                offset,
                base_len,
                target_len,
                frame,
            } => {
                out.reserve(17 + frame.len());
                out.push(KIND_DELTA);
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&base_len.to_le_bytes());
                out.extend_from_slice(&target_len.to_le_bytes());
                out.extend_from_slice(frame);
            }
            ChunkOp::Dictionary { id, bytes } => {
                out.reserve(3 + bytes.len());
                out.push(KIND_DICTIONARY);
                out.extend_from_slice(&id.to_le_bytes());
                out.extend_from_slice(bytes);
            }
            ChunkOp::Chain(chain) => {
                out.push(KIND_CHAIN);
                out.push(CHAIN_FORMAT);
                out.push(chain.mode.as_u8());
                out.extend_from_slice(&chain.old_len.to_le_bytes());
                out.extend_from_slice(&chain.new_len.to_le_bytes());
                out.extend_from_slice(chain.old_hash.as_bytes());
                out.extend_from_slice(chain.new_hash.as_bytes());
            }
        }
        out
    }

    pub fn decode(record: &[u8]) -> Result<ChunkOp, OpError> {
        let (&kind, body) = record.split_first().ok_or(OpError::Empty)?;
        let mut rdr = Cursor::new(body);

        match kind {
            KIND_LITERAL => Ok(ChunkOp::Literal(body.to_vec())),
            KIND_COPY => {
                let offset = rdr.read_u64::<LittleEndian>().map_err(|_| OpError::Truncated("copy"))?;
                let len = rdr.read_u32::<LittleEndian>().map_err(|_| OpError::Truncated("copy"))?;
                Ok(ChunkOp::Copy { offset, len })
            }
            KIND_DELTA => {
                let truncated = |_: std::io::Error| OpError::Truncated("delta");
                let offset = rdr.read_u64::<LittleEndian>().map_err(truncated)?;
                let base_len = rdr.read_u32::<LittleEndian>().map_err(truncated)?;
                let target_len = rdr.read_u32::<LittleEndian>().map_err(truncated)?;
                Ok(ChunkOp::Delta {
                    offset,
                    base_len,
                    target_len,
                    frame: body[16..].to_vec(),
                })
            }
            KIND_DICTIONARY => {
                let id = rdr
                    .read_u16::<LittleEndian>()
                    .map_err(|_| OpError::Truncated("dictionary"))?;
                Ok(ChunkOp::Dictionary {
                    id,
                    bytes: body[2..].to_vec(),
                })
            }
            KIND_CHAIN => {
                let truncated = |_: std::io::Error| OpError::Truncated("chain");
                let format = rdr.read_u8().map_err(truncated)?;
                if format != CHAIN_FORMAT {
                    return Err(OpError::ChainFormat(format));
                }
                let mode = rdr.read_u8().map_err(truncated)?;
                let mode = ChunkMode::from_u8(mode).ok_or(OpError::Mode(mode))?;
                let old_len = rdr.read_u64::<LittleEndian>().map_err(truncated)?;
                let new_len = rdr.read_u64::<LittleEndian>().map_err(truncated)?;
                let mut old_hash = [0u8; 32];
                rdr.read_exact(&mut old_hash).map_err(truncated)?;
                let mut new_hash = [0u8; 32];
                rdr.read_exact(&mut new_hash).map_err(truncated)?;

                Ok(ChunkOp::Chain(ChainRecord {
                    mode,
                    old_len,
                    new_len,
                    old_hash: Hash::from(old_hash),
                    new_hash: Hash::from(new_hash),
                }))
            }
            other => Err(OpError::UnknownKind(other)),
        }
    }
}

#[cfg(test)]
mod test_chunk_op {
    use super::*;
    use hcore::hash::hash_bytes;

    fn chain() -> ChainRecord {
        ChainRecord {
            mode: ChunkMode::Cdc,
            old_len: 26,
            new_len: 30,
            old_hash: hash_bytes(b"old"),
            new_hash: hash_bytes(b"new"),
        }
    }

    #[test]
    fn copy_layout() {
        let op = ChunkOp::Copy {
            offset: 0x0102,
            len: 7,
        };
        let rec = op.encode();

        assert_eq!(rec.len(), 13);
        assert_eq!(rec[0], 0x01);
        assert_eq!(&rec[1..9], &0x0102u64.to_le_bytes());
        assert_eq!(&rec[9..13], &7u32.to_le_bytes());
        assert_eq!(ChunkOp::decode(&rec).unwrap(), op);
    }

    #[test]
    fn chain_layout() {
        let op = ChunkOp::Chain(chain());
        let rec = op.encode();

        assert_eq!(rec.len(), 1 + 1 + 1 + 8 + 8 + 32 + 32);
        assert_eq!(&rec[0..3], &[0x7F, CHAIN_FORMAT, 1]);
        assert_eq!(ChunkOp::decode(&rec).unwrap(), op);
    }

    #[test]
    fn decode_each_kind() {
        let ops = vec![
            ChunkOp::Literal(vec![]),
            ChunkOp::Literal(b"abc".to_vec()),
            ChunkOp::Delta {
                offset: 99,
                base_len: 4096,
                target_len: 4100,
                frame: vec![1, 2, 3],
            },
            ChunkOp::Dictionary {
                id: 1,
                bytes: vec![0x37, 0xA4, 0x30, 0xEC],
            },
        ];

        for op in ops {
            assert_eq!(ChunkOp::decode(&op.encode()).unwrap(), op);
        }
    }

    #[test]
    fn target_len() {
        assert_eq!(ChunkOp::Literal(vec![0; 5]).target_len(), 5);
        assert_eq!(ChunkOp::Copy { offset: 0, len: 9 }.target_len(), 9);
        assert_eq!(ChunkOp::Chain(chain()).target_len(), 0);
    }

    #[test]
    fn malformed() {
        assert_eq!(ChunkOp::decode(&[]), Err(OpError::Empty));
        assert_eq!(ChunkOp::decode(&[0x42]), Err(OpError::UnknownKind(0x42)));
        assert_eq!(ChunkOp::decode(&[0x01, 0, 0]), Err(OpError::Truncated("copy")));
        assert_eq!(ChunkOp::decode(&[0x02; 10]), Err(OpError::Truncated("delta")));

        let mut rec = ChunkOp::Chain(chain()).encode();
        rec[1] = 9;
        assert_eq!(ChunkOp::decode(&rec), Err(OpError::ChainFormat(9)));

        let rec = ChunkOp::Chain(chain()).encode();
        assert_eq!(
            ChunkOp::decode(&rec[..40]),
            Err(OpError::Truncated("chain"))
        );
    }
}
