use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use hcore::hash::Hash;

use crate::hctx::error::StructuralError;
use crate::hctx::flags::EntryFlags;
use crate::hctx::{
    VersionPolicy, ENTRY_LEN, FOOTER_LEN, HEADER_LEN, MAGIC, VERSION_MAJOR, VERSION_MINOR,
};

// Header field positions
pub const MINOR_AT: usize = 0x05;
pub const COUNT_AT: usize = 0x07;
pub const INDEX_OFFSET_AT: usize = 0x0B;
pub const INDEX_LEN_AT: usize = 0x13;
pub const DATA_OFFSET_AT: usize = 0x1B;
pub const DATA_LEN_AT: usize = 0x23;
pub const FOOTER_OFFSET_AT: usize = 0x2B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major: u8,
    pub minor: u8,
    pub flags: u8,
    pub entry_count: u32,
    pub index_offset: u64,
    pub index_len: u64,
    pub data_offset: u64,
    pub data_len: u64,
    pub footer_offset: u64,
}

impl Header {
    /// Header for a freshly built container with contiguous regions.
    pub fn for_layout(entry_count: u32, data_len: u64) -> Header {
        let index_offset = HEADER_LEN as u64;
        let index_len = entry_count as u64 * ENTRY_LEN as u64;
        let data_offset = index_offset + index_len;

        Header {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            flags: 0,
            entry_count,
            index_offset,
            index_len,
            data_offset,
            data_len,
            footer_offset: data_offset + data_len,
        }
    }

    /// Total file length the header describes.
    pub fn file_len(&self) -> u64 {
        self.footer_offset + FOOTER_LEN as u64
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.major;
        buf[MINOR_AT] = self.minor;
        buf[6] = self.flags;
        LittleEndian::write_u32(&mut buf[COUNT_AT..INDEX_OFFSET_AT], self.entry_count);
        LittleEndian::write_u64(&mut buf[INDEX_OFFSET_AT..INDEX_LEN_AT], self.index_offset);
        LittleEndian::write_u64(&mut buf[INDEX_LEN_AT..DATA_OFFSET_AT], self.index_len);
        LittleEndian::write_u64(&mut buf[DATA_OFFSET_AT..DATA_LEN_AT], self.data_offset);
        LittleEndian::write_u64(&mut buf[DATA_LEN_AT..FOOTER_OFFSET_AT], self.data_len);
        LittleEndian::write_u64(&mut buf[FOOTER_OFFSET_AT..FOOTER_OFFSET_AT + 8], self.footer_offset);
        buf
    }

    /// Parses the header, only the magic is checked here.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Result<Header, StructuralError> {
        check_magic(&buf[..])?;

        Ok(Header {
            major: buf[4],
            minor: buf[MINOR_AT],
            flags: buf[6],
            entry_count: LittleEndian::read_u32(&buf[COUNT_AT..INDEX_OFFSET_AT]),
            index_offset: LittleEndian::read_u64(&buf[INDEX_OFFSET_AT..INDEX_LEN_AT]),
            index_len: LittleEndian::read_u64(&buf[INDEX_LEN_AT..DATA_OFFSET_AT]),
            data_offset: LittleEndian::read_u64(&buf[DATA_OFFSET_AT..DATA_LEN_AT]),
            data_len: LittleEndian::read_u64(&buf[DATA_LEN_AT..FOOTER_OFFSET_AT]),
            footer_offset: LittleEndian::read_u64(&buf[FOOTER_OFFSET_AT..FOOTER_OFFSET_AT + 8]),
        })
    }

    pub fn check_version(&self, policy: VersionPolicy) -> Result<(), StructuralError> {
        let err = StructuralError::Version {
            major: self.major,
            minor: self.minor,
        };

        if self.major != VERSION_MAJOR {
            return Err(err);
        }
        if self.minor != VERSION_MINOR {
            match policy {
                VersionPolicy::Strict => return Err(err),
                VersionPolicy::Lenient => warn!(
                    "Reading format {}.{} with a {}.{} reader",
                    self.major, self.minor, VERSION_MAJOR, VERSION_MINOR
                ),
            }
        }
        Ok(())
    }

    /// Checks that the regions are contiguous and end exactly at `file_len`.
    pub fn check_layout(&self, file_len: u64) -> Result<(), StructuralError> {
        if self.index_offset != HEADER_LEN as u64 {
            return Err(StructuralError::Offsets("index must follow the header"));
        }

        let expected_index = self.entry_count as u64 * ENTRY_LEN as u64;
        if self.index_len != expected_index {
            return Err(StructuralError::IndexLength {
                declared: self.index_len,
                count: self.entry_count,
            });
        }

        if self.index_offset.checked_add(self.index_len) != Some(self.data_offset) {
            return Err(StructuralError::Offsets("data section must follow the index"));
        }
        if self.data_offset.checked_add(self.data_len) != Some(self.footer_offset) {
            return Err(StructuralError::Offsets("footer must follow the data section"));
        }

        let end = self
            .footer_offset
            .checked_add(FOOTER_LEN as u64)
            .ok_or(StructuralError::Offsets("footer offset overflows"))?;

        if end > file_len {
            Err(StructuralError::Truncated {
                expected: end,
                actual: file_len,
            })
        } else if end < file_len {
            Err(StructuralError::TrailingBytes {
                expected: end,
                actual: file_len,
            })
        } else {
            Ok(())
        }
    }
}

pub fn check_magic(buf: &[u8]) -> Result<(), StructuralError> {
    if buf.len() >= MAGIC.len() && buf[..MAGIC.len()] == MAGIC {
        Ok(())
    } else {
        Err(StructuralError::Magic {
            found: buf[..buf.len().min(MAGIC.len())].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: u64,
    pub compressed_len: u32,
    pub uncompressed_len: u32,
    pub flags: EntryFlags,
    pub checksum: u64,
}

impl IndexEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.compressed_len as u64
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_LEN] {
        let mut buf = [0u8; ENTRY_LEN];
        LittleEndian::write_u64(&mut buf[0x00..0x08], self.offset);
        LittleEndian::write_u32(&mut buf[0x08..0x0C], self.compressed_len);
        LittleEndian::write_u32(&mut buf[0x0C..0x10], self.uncompressed_len);
        LittleEndian::write_u16(&mut buf[0x10..0x12], self.flags.bits());
        LittleEndian::write_u64(&mut buf[0x12..0x1A], self.checksum);
        buf
    }

    pub fn from_bytes(buf: &[u8; ENTRY_LEN]) -> IndexEntry {
        IndexEntry {
            offset: LittleEndian::read_u64(&buf[0x00..0x08]),
            compressed_len: LittleEndian::read_u32(&buf[0x08..0x0C]),
            uncompressed_len: LittleEndian::read_u32(&buf[0x0C..0x10]),
            flags: EntryFlags::from_bits(LittleEndian::read_u16(&buf[0x10..0x12])),
            checksum: LittleEndian::read_u64(&buf[0x12..0x1A]),
        }
    }
}

/// Splits a raw index table into entries, trailing partial entries are ignored.
pub fn parse_index(raw: &[u8]) -> Vec<IndexEntry> {
    raw.chunks_exact(ENTRY_LEN)
        .map(|c| {
            let mut buf = [0u8; ENTRY_LEN];
            buf.copy_from_slice(c);
            IndexEntry::from_bytes(&buf)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub digest: Hash,
    pub index_checksum: u64,
    pub reserved: [u8; 8],
}

impl Footer {
    pub fn new(digest: Hash, index_checksum: u64) -> Footer {
        Footer {
            digest,
            index_checksum,
            reserved: [0; 8],
        }
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0u8; FOOTER_LEN];
        buf[0x00..0x20].copy_from_slice(self.digest.as_bytes());
        LittleEndian::write_u64(&mut buf[0x20..0x28], self.index_checksum);
        buf[0x28..0x30].copy_from_slice(&self.reserved);
        buf
    }

    pub fn from_bytes(buf: &[u8; FOOTER_LEN]) -> Footer {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&buf[0x00..0x20]);
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[0x28..0x30]);

        Footer {
            digest: Hash::from(digest),
            index_checksum: LittleEndian::read_u64(&buf[0x20..0x28]),
            reserved,
        }
    }
}

#[cfg(test)]
mod test_header {
    use super::*;

    #[test]
    fn field_offsets() {
        let header = Header::for_layout(1, 23);
        let buf = header.to_bytes();

        assert_eq!(&buf[0..4], b"HAJI");
        assert_eq!(buf[4], 0);
        assert_eq!(buf[5], 9);
        assert_eq!(buf[6], 0);
        assert_eq!(&buf[0x07..0x0B], &1u32.to_le_bytes());
        assert_eq!(&buf[0x0B..0x13], &64u64.to_le_bytes());
        assert_eq!(&buf[0x13..0x1B], &26u64.to_le_bytes());
        assert_eq!(&buf[0x1B..0x23], &90u64.to_le_bytes());
        assert_eq!(&buf[0x23..0x2B], &23u64.to_le_bytes());
        assert_eq!(&buf[0x2B..0x33], &113u64.to_le_bytes());
        assert_eq!(&buf[0x33..], &[0u8; 13]);
        assert_eq!(header.file_len(), 161);
    }

    #[test]
    fn parse_back() {
        let header = Header::for_layout(7, 1000);
        assert_eq!(Header::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn bad_magic() {
        let mut buf = Header::for_layout(0, 0).to_bytes();
        buf[0..4].copy_from_slice(b"BAD!");

        assert_eq!(
            Header::from_bytes(&buf),
            Err(StructuralError::Magic {
                found: b"BAD!".to_vec()
            })
        );
    }

    #[test]
    fn version_policy() {
        let mut header = Header::for_layout(0, 0);
        header.minor = 8;

        assert!(header.check_version(VersionPolicy::Strict).is_err());
        assert!(header.check_version(VersionPolicy::Lenient).is_ok());

        header.major = 1;
        assert!(header.check_version(VersionPolicy::Lenient).is_err());
    }

    #[test]
    fn layout_checks() {
        let header = Header::for_layout(2, 100);
        let len = header.file_len();

        assert_eq!(header.check_layout(len), Ok(()));
        assert_eq!(
            header.check_layout(len - 1),
            Err(StructuralError::Truncated {
                expected: len,
                actual: len - 1
            })
        );
        assert_eq!(
            header.check_layout(len + 1),
            Err(StructuralError::TrailingBytes {
                expected: len,
                actual: len + 1
            })
        );

        let mut short_index = header;
        short_index.index_len -= ENTRY_LEN as u64;
        assert_eq!(
            short_index.check_layout(len),
            Err(StructuralError::IndexLength {
                declared: 26,
                count: 2
            })
        );

        let mut overflow = header;
        overflow.data_len = u64::MAX;
        assert!(matches!(
            overflow.check_layout(len),
            Err(StructuralError::Offsets(_))
        ));
    }
}

#[cfg(test)]
mod test_index_entry {
    use super::*;
    use crate::hctx::flags::Importance;

    #[test]
    fn field_offsets() {
        let entry = IndexEntry {
            offset: 90,
            compressed_len: 23,
            uncompressed_len: 14,
            flags: EntryFlags::new(Importance::User, 0).unwrap(),
            checksum: 0x1122334455667788,
        };
        let buf = entry.to_bytes();

        assert_eq!(&buf[0x00..0x08], &90u64.to_le_bytes());
        assert_eq!(&buf[0x08..0x0C], &23u32.to_le_bytes());
        assert_eq!(&buf[0x0C..0x10], &14u32.to_le_bytes());
        assert_eq!(&buf[0x10..0x12], &[0x00, 0x80]);
        assert_eq!(&buf[0x12..0x1A], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(IndexEntry::from_bytes(&buf), entry);
        assert_eq!(entry.end(), 113);
    }

    #[test]
    fn parse_table() {
        let a = IndexEntry {
            offset: 64,
            compressed_len: 1,
            uncompressed_len: 1,
            flags: EntryFlags::default(),
            checksum: 1,
        };
        let b = IndexEntry { offset: 65, ..a };

        let mut raw = Vec::new();
        raw.extend_from_slice(&a.to_bytes());
        raw.extend_from_slice(&b.to_bytes());

        assert_eq!(parse_index(&raw), vec![a, b]);
    }
}
