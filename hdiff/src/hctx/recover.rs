//! Damage assessment and salvage for containers the reader refuses.
//!
//! [`scan`] never fails: it reads the header fields without trusting them,
//! classifies what is wrong and estimates how much of the data section is
//! still usable. [`recover`] keeps every chunk whose payload still matches
//! its checksum and lays them out again as a fresh, sealed container.
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use serde::Serialize;

use hcore::hash::{checksum, checksum_hex, hash_bytes, to_hex};

use crate::hctx::builder::{encode, Chunk};
use crate::hctx::error::HdiffError;
use crate::hctx::raw::{
    check_magic, parse_index, Footer, IndexEntry, COUNT_AT, DATA_LEN_AT, DATA_OFFSET_AT,
    INDEX_LEN_AT, INDEX_OFFSET_AT,
};
use crate::hctx::{ENTRY_LEN, FOOTER_LEN, HEADER_LEN, MAX_CHUNK_SIZE};

/// Damage classes, in the order a scan looks for them.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCode {
    /// Magic mismatch, nothing can be salvaged
    E1001,
    /// Header offsets out of bounds or footer missing
    E1002,
    /// Index checksum mismatch
    E1003,
    /// File BLAKE3 mismatch
    E1004,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanIssue {
    pub code: ScanCode,
    pub message: &'static str,
}

/// Header fields as found, `None` where the file is too short to hold them.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct HeaderFields {
    pub index_offset: Option<u64>,
    pub index_length: Option<u64>,
    pub data_offset: Option<u64>,
    pub data_length: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub suspect: bool,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// The data section runs past the end of the file
    MissingBytes,
    /// The chunk payload no longer matches its index checksum
    ChecksumMismatch,
}

/// A byte range of the data section that cannot be trusted.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LostRegion {
    pub start: u64,
    pub end: u64,
    pub reason: LossReason,
}

/// Digests recorded in the footer next to the ones computed from the file.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanChecks {
    pub index_ok: Option<bool>,
    pub strong_ok: Option<bool>,
    pub index_xxh64_expected_hex: Option<String>,
    pub index_xxh64_actual_hex: Option<String>,
    pub blake3_expected_hex: Option<String>,
    pub blake3_actual_hex: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub ok: bool,
    pub magic_ok: bool,
    pub bytes: u64,
    pub header: Option<HeaderFields>,
    pub footer_present: bool,
    pub recoverable_pct: f64,
    pub recoverable_bytes: u64,
    pub chunks_total: Option<u64>,
    pub chunks_intact: Option<u64>,
    pub lost_regions: Vec<LostRegion>,
    pub checks: ScanChecks,
    pub errors: Vec<ScanIssue>,
}

impl ScanReport {
    pub fn has(&self, code: ScanCode) -> bool {
        self.errors.iter().any(|e| e.code == code)
    }
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    bytes.get(at..at + 8).map(LittleEndian::read_u64)
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes.get(at..at + 4).map(LittleEndian::read_u32)
}

// Where the footer would start if the file ends with one
fn footer_start(bytes: &[u8]) -> (bool, usize) {
    let present = bytes.len() >= HEADER_LEN + FOOTER_LEN;
    if present {
        (true, bytes.len() - FOOTER_LEN)
    } else {
        (false, bytes.len())
    }
}

fn footer_of(bytes: &[u8], start: usize) -> Option<Footer> {
    let raw: &[u8; FOOTER_LEN] = bytes.get(start..)?.try_into().ok()?;
    Some(Footer::from_bytes(raw))
}

fn entry_end(entry: &IndexEntry) -> u64 {
    entry.offset.saturating_add(entry.compressed_len as u64)
}

fn entry_intact(bytes: &[u8], entry: &IndexEntry, area: (u64, u64)) -> bool {
    let (start, end) = area;
    if entry.offset < start || entry_end(entry) > end || end > bytes.len() as u64 {
        return false;
    }
    checksum(&bytes[entry.offset as usize..entry_end(entry) as usize]) == entry.checksum
}

// Joins touching regions that share a reason
fn merge(mut regions: Vec<LostRegion>) -> Vec<LostRegion> {
    regions.sort_by_key(|r| (r.start, r.end));
    let mut out: Vec<LostRegion> = Vec::with_capacity(regions.len());

    for region in regions {
        match out.last_mut() {
            Some(last) if last.reason == region.reason && region.start <= last.end => {
                last.end = last.end.max(region.end);
            }
            _ => out.push(region),
        }
    }
    out
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10_000.0).round() / 100.0
}

/// Classifies the damage in `bytes`. Never fails, even on empty input.
pub fn scan(bytes: &[u8]) -> ScanReport {
    let len = bytes.len() as u64;
    let (footer_present, footer_at) = footer_start(bytes);
    let mut errors = Vec::new();

    if check_magic(bytes).is_err() {
        errors.push(ScanIssue {
            code: ScanCode::E1001,
            message: "magic mismatch",
        });
        return ScanReport {
            ok: false,
            magic_ok: false,
            bytes: len,
            header: None,
            footer_present,
            recoverable_pct: 0.0,
            recoverable_bytes: 0,
            chunks_total: None,
            chunks_intact: None,
            lost_regions: Vec::new(),
            checks: ScanChecks::default(),
            errors,
        };
    }

    let idx_off = read_u64(bytes, INDEX_OFFSET_AT);
    let idx_len = read_u64(bytes, INDEX_LEN_AT);
    let data_off = read_u64(bytes, DATA_OFFSET_AT);
    let data_len = read_u64(bytes, DATA_LEN_AT);
    let limit = footer_at as u64;

    let fields = match (idx_off, idx_len, data_off, data_len) {
        (Some(io), Some(il), Some(d), Some(dl)) => Some((io, il, d, dl)),
        _ => None,
    };

    // Ordered fields let the data section be measured even when it runs short
    let ordered = fields.filter(|&(io, il, d, _)| {
        io >= HEADER_LEN as u64 && io <= d && d <= limit && io.checked_add(il).is_some()
    });
    let header_ok = ordered.is_some_and(|(io, il, d, dl)| {
        io + il <= limit && d.checked_add(dl).is_some_and(|end| end <= limit)
    });
    if !header_ok {
        errors.push(ScanIssue {
            code: ScanCode::E1002,
            message: "header offsets out of bounds or unreadable",
        });
    }

    let mut lost = Vec::new();
    let mut recoverable = 0u64;
    let mut expected = 0u64;
    let mut chunks_total = None;
    let mut chunks_intact = None;

    if let Some((io, il, d, dl)) = ordered {
        let data_end = d.saturating_add(dl);
        let available = limit.min(data_end);
        expected = dl;
        recoverable = available - d;
        if available < data_end {
            lost.push(LostRegion {
                start: available,
                end: data_end,
                reason: LossReason::MissingBytes,
            });
        }

        // Only an index that lies entirely inside the file is worth reading
        if il % ENTRY_LEN as u64 == 0 && io + il <= limit {
            let entries = parse_index(&bytes[io as usize..(io + il) as usize]);
            let mut intact = 0u64;

            for entry in entries.iter() {
                if entry_intact(bytes, entry, (d, available)) {
                    intact += 1;
                    continue;
                }
                let start = entry.offset.clamp(d, available);
                let end = entry_end(entry).clamp(d, available);
                if start < end {
                    let reason = if entry_end(entry) > available {
                        LossReason::MissingBytes
                    } else {
                        LossReason::ChecksumMismatch
                    };
                    recoverable = recoverable.saturating_sub(end - start);
                    lost.push(LostRegion { start, end, reason });
                }
            }
            chunks_total = Some(entries.len() as u64);
            chunks_intact = Some(intact);
        }
    }

    let mut checks = ScanChecks::default();
    if !footer_present {
        errors.push(ScanIssue {
            code: ScanCode::E1002,
            message: "footer missing (file truncated)",
        });
    } else if let (true, Some((io, il, _, _)), Some(footer)) =
        (header_ok, fields, footer_of(bytes, footer_at))
    {
        let index_sum = checksum(&bytes[io as usize..(io + il) as usize]);
        let index_ok = index_sum == footer.index_checksum;
        if !index_ok {
            errors.push(ScanIssue {
                code: ScanCode::E1003,
                message: "index checksum mismatch",
            });
        }

        let digest = hash_bytes(&bytes[..footer_at]);
        let strong_ok = digest == footer.digest;
        if !strong_ok {
            errors.push(ScanIssue {
                code: ScanCode::E1004,
                message: "file BLAKE3 mismatch",
            });
        }

        checks = ScanChecks {
            index_ok: Some(index_ok),
            strong_ok: Some(strong_ok),
            index_xxh64_expected_hex: Some(checksum_hex(footer.index_checksum)),
            index_xxh64_actual_hex: Some(checksum_hex(index_sum)),
            blake3_expected_hex: Some(to_hex(&footer.digest)),
            blake3_actual_hex: Some(to_hex(&digest)),
        };
    }

    let report = ScanReport {
        ok: errors.is_empty(),
        magic_ok: true,
        bytes: len,
        header: Some(HeaderFields {
            index_offset: idx_off,
            index_length: idx_len,
            data_offset: data_off,
            data_length: data_len,
            suspect: !header_ok,
        }),
        footer_present,
        recoverable_pct: percent(recoverable, expected),
        recoverable_bytes: recoverable,
        chunks_total,
        chunks_intact,
        lost_regions: merge(lost),
        checks,
        errors,
    };
    debug!(
        "Scanned {} bytes: {} issues, {}% recoverable",
        len,
        report.errors.len(),
        report.recoverable_pct
    );
    report
}

/// What [`recover`] had to do to produce a sealed container.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RecoverActions {
    pub footer_present_in_input: bool,
    pub header_inferred: bool,
    pub entries_kept: u64,
    pub entries_dropped: u64,
    pub index_len: u64,
    pub data_len: u64,
    pub wrote_footer: bool,
    pub restored_version: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RecoverReport {
    pub ok: bool,
    pub actions: RecoverActions,
    pub original_scan: ScanReport,
    pub recovered_scan: ScanReport,
}

// Index placement taken from the header when it is self consistent
fn plausible_index(bytes: &[u8], limit: u64) -> Option<(u64, u64, u64, u64)> {
    let io = read_u64(bytes, INDEX_OFFSET_AT)?;
    let il = read_u64(bytes, INDEX_LEN_AT)?;
    let d = read_u64(bytes, DATA_OFFSET_AT)?;
    let dl = read_u64(bytes, DATA_LEN_AT)?;

    let ok = io >= HEADER_LEN as u64
        && il % ENTRY_LEN as u64 == 0
        && io.checked_add(il) == Some(d)
        && d <= limit;
    ok.then(|| (io, il, d, dl.min(limit - d)))
}

// Canonical layout guess: the index follows the header and the first entry
// points right past it. The header's entry count is the fallback.
fn inferred_index(bytes: &[u8], limit: u64) -> (u64, u64, u64, u64) {
    let io = HEADER_LEN as u64;
    let fits = |count: u64| count > 0 && io + count * ENTRY_LEN as u64 <= limit;

    let from_entry = read_u64(bytes, HEADER_LEN)
        .filter(|&first| first > io && (first - io) % ENTRY_LEN as u64 == 0)
        .map(|first| (first - io) / ENTRY_LEN as u64);
    let from_count = read_u32(bytes, COUNT_AT).map(u64::from);

    let count = from_entry
        .filter(|&c| fits(c))
        .or(from_count.filter(|&c| fits(c)))
        .unwrap_or(0);
    let il = count * ENTRY_LEN as u64;
    let d = io + il;
    (io, il, d, limit.saturating_sub(d))
}

/// Rebuilds a sealed container from every chunk that is still intact.
///
/// A magic mismatch is refused. Chunks are kept in index order; the ones
/// whose bytes are missing or no longer match their checksum are dropped.
pub fn recover(bytes: &[u8]) -> Result<(Vec<u8>, RecoverReport), HdiffError> {
    check_magic(bytes)?;
    let original_scan = scan(bytes);

    let (footer_present, footer_at) = footer_start(bytes);
    let limit = footer_at as u64;

    let plausible = plausible_index(bytes, limit);
    let header_inferred = plausible.is_none();
    let (io, il, d, dl) = plausible.unwrap_or_else(|| inferred_index(bytes, limit));
    debug!(
        "Recovering with index {}+{} and data {}+{} (inferred: {})",
        io, il, d, dl, header_inferred
    );

    let entries = bytes
        .get(io as usize..(io + il) as usize)
        .map(parse_index)
        .unwrap_or_default();
    let area = (d, d + dl);

    let mut chunks = Vec::with_capacity(entries.len());
    for entry in entries.iter() {
        if entry.compressed_len as usize > MAX_CHUNK_SIZE || !entry_intact(bytes, entry, area) {
            continue;
        }
        chunks.push(Chunk {
            payload: &bytes[entry.offset as usize..entry_end(entry) as usize],
            uncompressed_len: entry.uncompressed_len,
            flags: entry.flags,
        });
    }

    let recovered = encode(&chunks)?;
    let recovered_scan = scan(&recovered);
    let kept = chunks.len() as u64;
    let data_len = chunks.iter().map(|c| c.payload.len() as u64).sum();

    info!(
        "Recovered {} of {} chunks into {} bytes",
        kept,
        entries.len(),
        recovered.len()
    );

    let report = RecoverReport {
        ok: recovered_scan.ok,
        actions: RecoverActions {
            footer_present_in_input: footer_present,
            header_inferred,
            entries_kept: kept,
            entries_dropped: entries.len() as u64 - kept,
            index_len: kept * ENTRY_LEN as u64,
            data_len,
            wrote_footer: true,
            restored_version: true,
        },
        original_scan,
        recovered_scan,
    };
    Ok((recovered, report))
}

#[cfg(test)]
mod test_recover {
    use super::*;
    use crate::codec::raw_frame;
    use crate::hctx::flags::{EntryFlags, Importance};
    use crate::hctx::reader::{decode, verify_integrity};
    use crate::hctx::VersionPolicy;

    // Four raw-frame chunks of 100 payload bytes each
    fn container() -> Vec<u8> {
        let frames: Vec<Vec<u8>> = (0..4u8).map(|i| raw_frame(&[b'a' + i; 100])).collect();
        let chunks: Vec<Chunk> = frames
            .iter()
            .map(|f| Chunk {
                payload: f,
                uncompressed_len: 100,
                flags: EntryFlags::new(Importance::User, 0).unwrap(),
            })
            .collect();
        encode(&chunks).unwrap()
    }

    fn data_offset(bytes: &[u8]) -> usize {
        LittleEndian::read_u64(&bytes[DATA_OFFSET_AT..DATA_OFFSET_AT + 8]) as usize
    }

    #[test]
    fn clean_file() {
        let bytes = container();
        let report = scan(&bytes);

        assert!(report.ok, "{:?}", report.errors);
        assert_eq!(report.recoverable_pct, 100.0);
        assert_eq!(report.chunks_total, Some(4));
        assert_eq!(report.chunks_intact, Some(4));
        assert!(report.lost_regions.is_empty());
        assert_eq!(report.checks.strong_ok, Some(true));
        assert_eq!(
            report.checks.blake3_expected_hex,
            report.checks.blake3_actual_hex
        );
    }

    #[test]
    fn magic_is_unrecoverable() {
        let mut bytes = container();
        bytes[0] = b'X';

        let report = scan(&bytes);
        assert!(!report.magic_ok);
        assert!(report.has(ScanCode::E1001));
        assert_eq!(report.recoverable_pct, 0.0);
        assert!(report.header.is_none());

        assert!(matches!(
            recover(&bytes),
            Err(HdiffError::Structural(crate::StructuralError::Magic { .. }))
        ));
    }

    #[test]
    fn empty_input() {
        let report = scan(&[]);
        assert!(report.has(ScanCode::E1001));
        assert_eq!(report.bytes, 0);
    }

    #[test]
    fn truncated_file() {
        let bytes = container();
        let short = &bytes[..bytes.len() - 60];
        let report = scan(short);

        assert!(report.has(ScanCode::E1002));
        assert!(report.header.as_ref().unwrap().suspect);
        assert!(report.recoverable_pct < 100.0);
        assert!(report.recoverable_pct > 0.0);
        assert_eq!(report.lost_regions[0].reason, LossReason::MissingBytes);

        let (recovered, rebuilt) = recover(short).unwrap();
        verify_integrity(&recovered, VersionPolicy::Strict).unwrap();
        assert!(rebuilt.ok);
        assert!(!rebuilt.actions.header_inferred);
        assert!(rebuilt.actions.entries_kept < 4);
        assert!(rebuilt.actions.entries_kept > 0);
    }

    #[test]
    fn damaged_chunk_is_dropped() {
        let mut bytes = container();
        let at = data_offset(&bytes) + 150;
        bytes[at] ^= 0xFF;

        let report = scan(&bytes);
        assert!(report.has(ScanCode::E1004));
        assert!(!report.has(ScanCode::E1003));
        assert_eq!(report.chunks_intact, Some(3));
        assert_eq!(report.lost_regions.len(), 1);
        assert_eq!(report.lost_regions[0].reason, LossReason::ChecksumMismatch);
        assert!(report.recoverable_pct < 100.0);

        let (recovered, rebuilt) = recover(&bytes).unwrap();
        verify_integrity(&recovered, VersionPolicy::Strict).unwrap();
        assert_eq!(rebuilt.actions.entries_kept, 3);
        assert_eq!(rebuilt.actions.entries_dropped, 1);
        assert!(rebuilt.recovered_scan.ok);

        let decoded = decode(&recovered, VersionPolicy::Strict).unwrap();
        assert_eq!(decoded.entries.len(), 3);
    }

    #[test]
    fn index_damage_reports_index_checksum() {
        let mut bytes = container();
        // Checksum field of the second entry
        bytes[HEADER_LEN + ENTRY_LEN + 0x12] ^= 0x01;

        let report = scan(&bytes);
        assert!(report.has(ScanCode::E1003));
        assert!(report.has(ScanCode::E1004));
        assert_eq!(report.checks.index_ok, Some(false));
        assert_ne!(
            report.checks.index_xxh64_expected_hex,
            report.checks.index_xxh64_actual_hex
        );
    }

    #[test]
    fn broken_header_is_inferred() {
        let mut bytes = container();
        bytes[DATA_LEN_AT..DATA_LEN_AT + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        bytes[DATA_OFFSET_AT..DATA_OFFSET_AT + 8].copy_from_slice(&7u64.to_le_bytes());

        let report = scan(&bytes);
        assert!(report.has(ScanCode::E1002));

        let (recovered, rebuilt) = recover(&bytes).unwrap();
        assert!(rebuilt.actions.header_inferred);
        assert_eq!(rebuilt.actions.entries_kept, 4);
        verify_integrity(&recovered, VersionPolicy::Strict).unwrap();
    }

    #[test]
    fn version_is_restored() {
        let mut bytes = container();
        bytes[4] = 7;

        let (recovered, rebuilt) = recover(&bytes).unwrap();
        assert_eq!(recovered[4], 0);
        assert!(rebuilt.actions.restored_version);
        assert_eq!(rebuilt.actions.entries_kept, 4);
        verify_integrity(&recovered, VersionPolicy::Strict).unwrap();
    }

    #[test]
    fn json_field_names() {
        let mut bytes = container();
        bytes.truncate(bytes.len() - 60);
        let value = serde_json::to_value(scan(&bytes)).unwrap();

        assert_eq!(value["errors"][0]["code"], "E1002");
        assert_eq!(value["lost_regions"][0]["reason"], "missing_bytes");
        assert_eq!(value["header"]["suspect"], true);
        assert!(value["recoverable_pct"].is_number());

        let clean = serde_json::to_value(scan(&container())).unwrap();
        assert!(clean["header"].get("suspect").is_none());
    }

    #[test]
    fn merge_touching_regions() {
        let region = |start, end| LostRegion {
            start,
            end,
            reason: LossReason::ChecksumMismatch,
        };
        let merged = merge(vec![region(20, 30), region(0, 10), region(10, 20), region(40, 50)]);

        assert_eq!(merged, vec![region(0, 30), region(40, 50)]);
    }
}
