use std::fmt;
use std::io::{copy, Read, Write};

use std::hash::Hash as StdHash;
use std::hash::Hasher as StdHasher;
use twox_hash::XxHash64;

use serde::de::{self, Unexpected, Visitor};
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use sha2::{Digest, Sha256};

/// Seed used for every xxHash64 in the container (chunk and index checksums).
pub const CHECKSUM_SEED: u64 = 0;

// Make the checksum api be similiar to blake3's
pub struct Checksum(XxHash64);

impl Checksum {
    pub fn new() -> Checksum {
        Checksum(XxHash64::with_seed(CHECKSUM_SEED))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.write(data);
    }

    pub fn finalize(self) -> u64 {
        self.0.finish()
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Checksum::new()
    }
}

/// One-shot xxHash64 (seed 0) of a byte slice.
pub fn checksum(data: &[u8]) -> u64 {
    XxHash64::oneshot(CHECKSUM_SEED, data)
}

/// Renders a checksum the way it is laid out on disk, little-endian bytes as hex.
pub fn checksum_hex(value: u64) -> String {
    hex::encode(value.to_le_bytes())
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, StdHash)]
pub struct Hash(blake3::Hash);

/// BLAKE3-256 of everything readable from `data`.
pub fn hash<R: Read>(data: &mut R) -> Result<Hash, std::io::Error> {
    let mut hash = blake3::Hasher::new();
    copy(data, &mut hash)?;
    Ok(Hash(hash.finalize()))
}

pub fn hash_bytes(data: &[u8]) -> Hash {
    Hash(blake3::hash(data))
}

// To encapsulate the hash engine used
pub fn from_hex(hash: &str) -> Result<Hash, blake3::HexError> {
    blake3::Hash::from_hex(hash).map(Hash)
}

pub fn to_hex(hash: &Hash) -> String {
    hash.0.to_hex().to_string()
}

/// SHA-256 of a byte slice as lowercase hex, for descriptors read by other tools.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(blake3::Hash::from(bytes))
    }
}

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(self))
    }
}

/// Incremental BLAKE3, fed from the windowed passes over base, target and patch.
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Hasher {
        Hasher(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(&self) -> Hash {
        Hash(self.0.finalize())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Hasher::new()
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// Serde impls, hashes travel as lowercase hex in manifests and reports
impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_hex(self))
    }
}

struct HashVisitor;

impl<'de> Visitor<'de> for HashVisitor {
    type Value = Hash;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a 64 character hex string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        from_hex(v).map_err(|_| de::Error::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        deserializer.deserialize_str(HashVisitor)
    }
}

#[cfg(test)]
mod test_checksum {
    use super::*;

    #[test]
    fn streaming_matches_oneshot() {
        let mut sum = Checksum::new();
        sum.update(b"Hello, ");
        sum.update(b"Hajimi!");

        assert_eq!(sum.finalize(), checksum(b"Hello, Hajimi!"));
    }

    #[test]
    fn order_matters() {
        assert_ne!(checksum(&[0x00, 0x01]), checksum(&[0x01, 0x00]));
    }

    #[test]
    fn hex_is_little_endian() {
        assert_eq!(checksum_hex(0x0102030405060708), "0807060504030201");
    }
}
