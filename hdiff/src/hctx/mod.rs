//! HCTX container format (`.hdiff`)
//!
//! A patch file is a single HCTX container. Every region is fixed in size or
//! sized by the header, so a reader can validate the whole layout against the
//! file length before it touches a single chunk. Unless other wise noted
//! everything is stored in Little Endian format.
//!
//! # Top Level
//!
//! | Offset              | Size        | Region | Description |
//! | ------------------: | ----------: | ------ | ----------- |
//! | 0                   | 64          | Header | Magic, version and region offsets |
//! | `index_offset`      | 26 * count  | Index  | One [`raw::IndexEntry`] per chunk |
//! | `data_offset`       | `data_len`  | Data   | Concatenated chunk payloads (zstd frames) |
//! | `footer_offset`     | 48          | Footer | Digests sealing everything before it |
//!
//! The regions are contiguous: `index_offset == 64`,
//! `data_offset == index_offset + index_len`,
//! `footer_offset == data_offset + data_len` and the file ends exactly
//! 48 bytes after `footer_offset`.
//!
//! # Header
//!
//! | Offset | Type    | Name          | Description |
//! | -----: | ------: | ------------- | ----------- |
//! | 0x00   | [u8; 4] | magic         | ASCII `HAJI` |
//! | 0x04   | u8      | major         | Format major version, currently `0` |
//! | 0x05   | u8      | minor         | Format minor version, currently `9` |
//! | 0x06   | u8      | flags         | Container flags, written as `0` |
//! | 0x07   | u32     | index count   | Number of index entries |
//! | 0x0B   | u64     | index offset  | Always `64` |
//! | 0x13   | u64     | index length  | `26 * index count` |
//! | 0x1B   | u64     | data offset   | Start of the data section |
//! | 0x23   | u64     | data length   | Length of the data section |
//! | 0x2B   | u64     | footer offset | Start of the footer |
//! | 0x33   | [u8; 13]| reserved      | Zero |
//!
//! # Index Entry
//!
//! | Offset | Type | Name              | Description |
//! | -----: | ---: | ----------------- | ----------- |
//! | 0x00   | u64  | offset            | Absolute file offset of the payload |
//! | 0x08   | u32  | compressed len    | Payload length on disk |
//! | 0x0C   | u32  | uncompressed len  | Length once the zstd frame is decoded |
//! | 0x10   | u16  | flags             | See [`flags::EntryFlags`] |
//! | 0x12   | u64  | checksum          | xxHash64 (seed 0) of the payload bytes |
//!
//! # Footer
//!
//! | Offset | Type     | Name           | Description |
//! | -----: | -------: | -------------- | ----------- |
//! | 0x00   | [u8; 32] | digest         | BLAKE3-256 of bytes `[0, footer_offset)` |
//! | 0x20   | u64      | index checksum | xxHash64 (seed 0) of the raw index table |
//! | 0x28   | [u8; 8]  | reserved       | Zero, rejected otherwise |
//!
//! Because the footer is written last and its offset is only known once every
//! payload is in place, [`builder::HdiffBuilder`] spools payloads and lays the
//! file out in one pass at finalize time.
use serde::{Deserialize, Serialize};

pub mod builder;
pub mod error;
pub mod flags;
pub mod raw;
pub mod reader;
pub mod recover;

pub const MAGIC: [u8; 4] = *b"HAJI";
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 9;

/// Semantic version of the on-disk format, recorded by the golden vector.
pub const FORMAT_VERSION: &str = "0.9.1";

pub const HEADER_LEN: usize = 64;
pub const ENTRY_LEN: usize = 26;
pub const FOOTER_LEN: usize = 48;

// Payloads larger than this are refused before any allocation happens
pub const MAX_CHUNK_SIZE: usize = 256 * 1024 * 1024;

/// How a reader treats a header whose version differs from the one it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionPolicy {
    /// Any other major.minor is rejected.
    #[default]
    Strict,
    /// Another minor only logs a warning, another major is still rejected.
    Lenient,
}
