//! SimHash fingerprints for near-duplicate chunk lookup.
//!
//! Each chunk is summarised as a 64 bit fingerprint built from overlapping
//! 8 byte features (stride 4) hashed with xxHash64. Similar chunks end up with
//! fingerprints that differ in few bits. Lookup uses four 16 bit LSH bands:
//! two fingerprints within Hamming distance 3 always share a band, larger
//! distances are found opportunistically.
use std::collections::HashMap;

use hcore::hash::checksum;

const FEATURE_LEN: usize = 8;
const FEATURE_STRIDE: usize = 4;
const BANDS: usize = 4;

// Keeps pathological inputs (long runs of identical chunks) from growing a bucket unbounded
const MAX_BUCKET: usize = 64;

pub const DEFAULT_MAX_DISTANCE: u32 = 10;

pub fn fingerprint(data: &[u8]) -> u64 {
    let mut acc = [0i32; 64];

    let mut add = |feature: &[u8]| {
        let h = checksum(feature);
        for (bit, slot) in acc.iter_mut().enumerate() {
            if h & (1 << bit) != 0 {
                *slot += 1;
            } else {
                *slot -= 1;
            }
        }
    };

    if data.len() < FEATURE_LEN {
        add(data);
    } else {
        for start in (0..=data.len() - FEATURE_LEN).step_by(FEATURE_STRIDE) {
            add(&data[start..start + FEATURE_LEN]);
        }
    }

    acc.iter()
        .enumerate()
        .filter(|(_, v)| **v > 0)
        .fold(0u64, |fp, (bit, _)| fp | (1 << bit))
}

pub fn distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// A base region known to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub len: u32,
}

#[derive(Debug, Default)]
pub struct NearIndex {
    regions: Vec<(u64, Region)>,
    bands: HashMap<(u8, u16), Vec<usize>>,
}

impl NearIndex {
    pub fn new() -> Self {
        NearIndex::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn insert(&mut self, fp: u64, region: Region) {
        let idx = self.regions.len();
        self.regions.push((fp, region));

        for band in 0..BANDS {
            let bucket = self.bands.entry(band_key(fp, band)).or_default();
            if bucket.len() < MAX_BUCKET {
                bucket.push(idx);
            }
        }
    }

    /// Closest region within `max_distance`, ties go to the earliest inserted.
    pub fn nearest(&self, fp: u64, max_distance: u32) -> Option<(Region, u32)> {
        let mut best: Option<(usize, u32)> = None;

        for band in 0..BANDS {
            let Some(bucket) = self.bands.get(&band_key(fp, band)) else {
                continue;
            };
            for &idx in bucket {
                let d = distance(fp, self.regions[idx].0);
                if d > max_distance {
                    continue;
                }
                best = match best {
                    Some((b_idx, b_d)) if (b_d, b_idx) <= (d, idx) => Some((b_idx, b_d)),
                    _ => Some((idx, d)),
                };
            }
        }

        best.map(|(idx, d)| (self.regions[idx].1, d))
    }
}

fn band_key(fp: u64, band: usize) -> (u8, u16) {
    (band as u8, (fp >> (band * 16)) as u16)
}
