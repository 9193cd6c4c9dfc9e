//! Golden vector: the smallest meaningful container, used as a cross
//! implementation reference.
//!
//! The payload `Hello, Hajimi!` is stored as a raw-block zstd frame so the
//! bytes do not depend on any compressor version. The descriptor records the
//! layout and the digests; [`compare`] reports every field that drifted.
use serde::{Deserialize, Serialize};

use hcore::hash::{checksum_hex, hash_bytes, sha256_hex, to_hex};

use crate::codec::raw_frame;
use crate::hctx::builder::{encode, Chunk};
use crate::hctx::error::HdiffError;
use crate::hctx::flags::{EntryFlags, Importance};
use crate::hctx::reader::decode;
use crate::hctx::{VersionPolicy, ENTRY_LEN, FOOTER_LEN, FORMAT_VERSION, HEADER_LEN};

pub const GOLDEN_PAYLOAD: &[u8] = b"Hello, Hajimi!";
pub const GOLDEN_FILE_NAME: &str = "minimal.hdiff";
pub const VECTOR_FILE_NAME: &str = "golden-vector.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GoldenVector {
    pub version: String,
    pub file_size: u64,
    pub hash_algo: String,
    /// BLAKE3 of everything before the footer, the digest the footer records.
    pub file_blake3_256_hex: String,
    /// SHA-256 of the whole file, footer included.
    pub file_sha256: String,
    pub index_xxh64_hex: String,
    pub chunk_xxh64_hex: ChunkDigests,
    pub layout: GoldenLayout,
}

/// Per chunk xxHash64, a bare string when the container holds one chunk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ChunkDigests {
    One(String),
    Many(Vec<String>),
}

impl ChunkDigests {
    fn new(mut digests: Vec<String>) -> Self {
        match digests.len() {
            1 => ChunkDigests::One(digests.remove(0)),
            _ => ChunkDigests::Many(digests),
        }
    }

    pub fn as_slice(&self) -> &[String] {
        match self {
            ChunkDigests::One(digest) => std::slice::from_ref(digest),
            ChunkDigests::Many(digests) => digests,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GoldenLayout {
    pub header_len: u64,
    pub index_entry_len: u64,
    pub footer_len: u64,
    pub index_count: u32,
    pub index_offset: u64,
    pub index_length: u64,
    pub data_offset: u64,
    pub data_length: u64,
    pub footer_offset: u64,
}

/// Builds the minimal golden container and its descriptor.
pub fn minimal() -> Result<(Vec<u8>, GoldenVector), HdiffError> {
    let frame = raw_frame(GOLDEN_PAYLOAD);
    let flags = EntryFlags::new(Importance::User, 0).unwrap_or_default();

    let bytes = encode(&[Chunk {
        payload: &frame,
        uncompressed_len: GOLDEN_PAYLOAD.len() as u32,
        flags,
    }])?;
    let vector = describe(&bytes)?;

    Ok((bytes, vector))
}

/// Computes the descriptor of any well formed container.
pub fn describe(bytes: &[u8]) -> Result<GoldenVector, HdiffError> {
    let decoded = decode(bytes, VersionPolicy::Strict)?;
    let header = decoded.header;
    let index = &bytes[header.index_offset as usize..header.data_offset as usize];
    let covered = &bytes[..header.footer_offset as usize];

    Ok(GoldenVector {
        version: FORMAT_VERSION.to_string(),
        file_size: bytes.len() as u64,
        hash_algo: "blake3-256".to_string(),
        file_blake3_256_hex: to_hex(&hash_bytes(covered)),
        file_sha256: sha256_hex(bytes),
        index_xxh64_hex: checksum_hex(hcore::hash::checksum(index)),
        chunk_xxh64_hex: ChunkDigests::new(
            decoded
                .entries
                .iter()
                .map(|e| checksum_hex(e.checksum))
                .collect(),
        ),
        layout: GoldenLayout {
            header_len: HEADER_LEN as u64,
            index_entry_len: ENTRY_LEN as u64,
            footer_len: FOOTER_LEN as u64,
            index_count: header.entry_count,
            index_offset: header.index_offset,
            index_length: header.index_len,
            data_offset: header.data_offset,
            data_length: header.data_len,
            footer_offset: header.footer_offset,
        },
    })
}

/// Field level differences between `bytes` and a recorded descriptor.
///
/// An empty list means the container matches.
pub fn compare(bytes: &[u8], expected: &GoldenVector) -> Result<Vec<String>, HdiffError> {
    let actual = describe(bytes)?;
    let mut drift = Vec::new();

    let mut check = |name: &str, want: String, got: String| {
        if want != got {
            drift.push(format!("{}: expected {}, found {}", name, want, got));
        }
    };

    check("version", expected.version.clone(), actual.version);
    check("file_size", expected.file_size.to_string(), actual.file_size.to_string());
    check("hash_algo", expected.hash_algo.clone(), actual.hash_algo);
    check(
        "file_blake3_256_hex",
        expected.file_blake3_256_hex.clone(),
        actual.file_blake3_256_hex,
    );
    check("file_sha256", expected.file_sha256.clone(), actual.file_sha256);
    check(
        "index_xxh64_hex",
        expected.index_xxh64_hex.clone(),
        actual.index_xxh64_hex,
    );
    check(
        "chunk_xxh64_hex",
        expected.chunk_xxh64_hex.as_slice().join(","),
        actual.chunk_xxh64_hex.as_slice().join(","),
    );
    check(
        "layout",
        format!("{:?}", expected.layout),
        format!("{:?}", actual.layout),
    );

    Ok(drift)
}

#[cfg(test)]
mod test_golden {
    use super::*;
    use crate::hctx::reader::verify_integrity;

    #[test]
    fn minimal_layout() {
        let (bytes, vector) = minimal().unwrap();

        assert_eq!(bytes.len(), 161);
        assert_eq!(
            vector.layout,
            GoldenLayout {
                header_len: 64,
                index_entry_len: 26,
                footer_len: 48,
                index_count: 1,
                index_offset: 64,
                index_length: 26,
                data_offset: 90,
                data_length: 23,
                footer_offset: 113,
            }
        );
        assert_eq!(vector.version, "0.9.1");
        assert_eq!(vector.file_size, 161);
        assert_eq!(vector.chunk_xxh64_hex.as_slice().len(), 1);
        assert_eq!(&bytes[90 + 9..90 + 23], GOLDEN_PAYLOAD);
        // Importance user, no dictionary
        assert_eq!(&bytes[64 + 0x10..64 + 0x12], &[0x00, 0x80]);
        verify_integrity(&bytes, VersionPolicy::Strict).unwrap();
    }

    #[test]
    fn blake3_is_footer_digest() {
        let (bytes, vector) = minimal().unwrap();
        let decoded = decode(&bytes, VersionPolicy::Strict).unwrap();

        assert_eq!(vector.file_blake3_256_hex, to_hex(&decoded.footer.digest));
        assert_ne!(vector.file_blake3_256_hex, to_hex(&hash_bytes(&bytes)));
        assert_eq!(vector.file_sha256, sha256_hex(&bytes));
    }

    #[test]
    fn several_chunks_list_digests() {
        let frame = raw_frame(b"chunk");
        let chunk = Chunk {
            payload: &frame,
            uncompressed_len: 5,
            flags: EntryFlags::default(),
        };
        let bytes = encode(&[chunk, chunk]).unwrap();
        let value = serde_json::to_value(describe(&bytes).unwrap()).unwrap();

        assert_eq!(value["chunk_xxh64_hex"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn deterministic() {
        let (a, va) = minimal().unwrap();
        let (b, vb) = minimal().unwrap();

        assert_eq!(a, b);
        assert_eq!(va, vb);
    }

    #[test]
    fn compare_clean_and_drift() {
        let (bytes, vector) = minimal().unwrap();
        assert!(compare(&bytes, &vector).unwrap().is_empty());

        let mut stale = vector.clone();
        stale.file_blake3_256_hex = "00".repeat(32);
        stale.layout.data_length = 24;
        let drift = compare(&bytes, &stale).unwrap();

        assert_eq!(drift.len(), 2);
        assert!(drift[0].starts_with("file_blake3_256_hex"));
        assert!(drift[1].starts_with("layout"));
    }

    #[test]
    fn json_shape() {
        let (_, vector) = minimal().unwrap();
        let value = serde_json::to_value(&vector).unwrap();

        assert_eq!(value["layout"]["footer_offset"], 113);
        assert_eq!(value["hash_algo"], "blake3-256");
        assert!(value["chunk_xxh64_hex"].is_string());
        assert_eq!(value["file_sha256"].as_str().map(str::len), Some(64));
        assert_eq!(
            serde_json::from_value::<GoldenVector>(value).unwrap(),
            vector
        );
    }
}
