//! Deliberate corruption of a patch file.
//!
//! Each [`CorruptMode`] damages one region of the container the way a disk,
//! a transfer or a hostile party might. Every output must be rejected by
//! verification or apply, so the harness doubles as an executable list of
//! the ways a patch can fail.
use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use clap::ValueEnum;
use thiserror::Error;

use hdiff::hctx::raw::{COUNT_AT, DATA_OFFSET_AT, FOOTER_OFFSET_AT, INDEX_LEN_AT, INDEX_OFFSET_AT, MINOR_AT};
use hdiff::hctx::{ENTRY_LEN, FOOTER_LEN, HEADER_LEN};

pub const DEFAULT_SEED: u32 = 1337;

const PAGE: usize = 4096;
const MAX_SWAP: usize = 64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorruptError {
    #[error("file of {len} bytes is smaller than an empty container ({min} bytes)")]
    TooSmall { len: usize, min: usize },
    #[error("unknown corruption mode: {0}")]
    UnknownMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
#[value(rename_all = "lower")]
pub enum CorruptMode {
    /// Flip one bit anywhere past the magic
    Bitflip,
    /// Cut the file short, keeping the header
    Trunc,
    /// Exchange two equal length spans of the data section
    Swap,
    /// Overwrite the magic
    Magicflip,
    /// Flip the minor version
    Versionflip,
    /// Flip a byte inside one index entry
    Indexflip,
    /// Shrink the declared index length
    Indextrunc,
    /// Flip a byte inside the footer
    Footerflip,
    /// Zero a page at or after the header
    Zeropage,
}

impl CorruptMode {
    pub const ALL: [CorruptMode; 9] = [
        CorruptMode::Bitflip,
        CorruptMode::Trunc,
        CorruptMode::Swap,
        CorruptMode::Magicflip,
        CorruptMode::Versionflip,
        CorruptMode::Indexflip,
        CorruptMode::Indextrunc,
        CorruptMode::Footerflip,
        CorruptMode::Zeropage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CorruptMode::Bitflip => "bitflip",
            CorruptMode::Trunc => "trunc",
            CorruptMode::Swap => "swap",
            CorruptMode::Magicflip => "magicflip",
            CorruptMode::Versionflip => "versionflip",
            CorruptMode::Indexflip => "indexflip",
            CorruptMode::Indextrunc => "indextrunc",
            CorruptMode::Footerflip => "footerflip",
            CorruptMode::Zeropage => "zeropage",
        }
    }
}

impl fmt::Display for CorruptMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CorruptMode {
    type Err = CorruptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CorruptMode::ALL
            .iter()
            .find(|m| m.name() == s)
            .copied()
            .ok_or_else(|| CorruptError::UnknownMode(s.to_string()))
    }
}

/// xorshift32, the same sequence for the same seed on every platform.
pub struct XorShift32 {
    state: u32,
}

impl XorShift32 {
    pub fn new(seed: u32) -> Self {
        // Zero is a fixed point of xorshift
        let state = if seed == 0 { 0x9E37_79B9 } else { seed };
        XorShift32 { state }
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Uniform-ish value in `[0, n)`, 0 when `n` is 0.
    pub fn below(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let wide = ((self.next_u32() as u64) << 32) | self.next_u32() as u64;
        (wide % n as u64) as usize
    }
}

/// Returns a damaged copy of `bytes`, deterministic for `(mode, seed)`.
///
/// The output always differs from the input.
pub fn corrupt(bytes: &[u8], mode: CorruptMode, seed: u32) -> Result<Vec<u8>, CorruptError> {
    let min = HEADER_LEN + FOOTER_LEN;
    if bytes.len() < min {
        return Err(CorruptError::TooSmall {
            len: bytes.len(),
            min,
        });
    }

    let mut rng = XorShift32::new(seed);
    let mut out = bytes.to_vec();

    // Byte whose low bit gets flipped if the mutation turned out to be a no-op
    let anchor = match mode {
        CorruptMode::Bitflip => {
            let at = 4 + rng.below(out.len() - 4);
            out[at] ^= 1 << rng.below(8);
            at
        }
        CorruptMode::Trunc => {
            let len = HEADER_LEN + 1 + rng.below(out.len() - HEADER_LEN - 1);
            out.truncate(len);
            return Ok(out);
        }
        CorruptMode::Swap => swap(&mut out, &mut rng),
        CorruptMode::Magicflip => {
            out[0..4].copy_from_slice(b"BAD!");
            0
        }
        CorruptMode::Versionflip => {
            out[MINOR_AT] ^= 0x01;
            MINOR_AT
        }
        CorruptMode::Indexflip => {
            let count = LittleEndian::read_u32(&out[COUNT_AT..INDEX_OFFSET_AT]) as usize;
            let index_end = HEADER_LEN.saturating_add(count.saturating_mul(ENTRY_LEN));
            if count == 0 || index_end > out.len() {
                INDEX_LEN_AT
            } else {
                let entry = HEADER_LEN + rng.below(count) * ENTRY_LEN;
                let at = entry + rng.below(ENTRY_LEN);
                out[at] ^= 0xFF;
                at
            }
        }
        CorruptMode::Indextrunc => {
            let declared = LittleEndian::read_u64(&out[INDEX_LEN_AT..DATA_OFFSET_AT]);
            let shrunk = declared.saturating_sub(ENTRY_LEN as u64);
            LittleEndian::write_u64(&mut out[INDEX_LEN_AT..DATA_OFFSET_AT], shrunk);
            INDEX_LEN_AT
        }
        CorruptMode::Footerflip => {
            let at = out.len() - FOOTER_LEN + rng.below(FOOTER_LEN);
            out[at] ^= 0xFF;
            at
        }
        CorruptMode::Zeropage => {
            let start = HEADER_LEN.max(rng.below(out.len()) / PAGE * PAGE);
            let end = out.len().min(start + PAGE);
            out[start..end].fill(0);
            start
        }
    };

    if out == bytes {
        out[anchor] ^= 0x01;
    }
    Ok(out)
}

// Swaps two disjoint spans of the data section (of the body when the data
// section is too small) and returns the start of the first one
fn swap(out: &mut [u8], rng: &mut XorShift32) -> usize {
    let field = |at: usize| LittleEndian::read_u64(&out[at..at + 8]) as usize;
    let data_start = field(DATA_OFFSET_AT);
    let footer_start = field(FOOTER_OFFSET_AT);

    let (start, end) = if data_start < footer_start && footer_start <= out.len() - FOOTER_LEN && footer_start - data_start >= 2 {
        (data_start, footer_start)
    } else {
        (4, out.len())
    };

    let half = (end - start) / 2;
    let span = half.min(MAX_SWAP);
    let a = start + rng.below(half - span + 1);
    let b = start + half + rng.below(end - start - half - span + 1);

    for i in 0..span {
        out.swap(a + i, b + i);
    }
    a
}
