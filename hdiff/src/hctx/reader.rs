use std::io::{Cursor, Read, Seek, SeekFrom};

use log::{debug, trace};

use hcore::buf::{fill_buf, pump};
use hcore::hash::{checksum, Hasher};

use crate::codec;
use crate::hctx::error::{HdiffError, IntegrityError, StructuralError};
use crate::hctx::raw::{check_magic, parse_index, Footer, Header, IndexEntry};
use crate::hctx::{VersionPolicy, FOOTER_LEN, HEADER_LEN, MAX_CHUNK_SIZE};

pub const DEFAULT_WINDOW: usize = 1024 * 1024;

/// Random access reader over an HCTX container.
///
/// [`HdiffReader::open`] validates everything that can be checked without
/// reading the data section: magic, version, region layout against the real
/// file length and the index length. Digests are checked by
/// [`HdiffReader::verify_integrity`], and each payload is checked against its
/// own xxHash64 when read.
pub struct HdiffReader<R: Read + Seek> {
    inner: R,
    header: Header,
    index: Vec<u8>,
    entries: Vec<IndexEntry>,
    footer: Footer,
    file_len: u64,
    window: usize,
    max_chunk: usize,
}

impl<R: Read + Seek> HdiffReader<R> {
    pub fn open(mut reader: R, policy: VersionPolicy) -> Result<Self, HdiffError> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let mut head = [0u8; HEADER_LEN];
        let (_, got) = fill_buf(&mut reader, &mut head)?;
        if got < HEADER_LEN {
            // A bad magic is reported ahead of the truncation
            check_magic(&head[..got])?;
            return Err(StructuralError::Truncated {
                expected: HEADER_LEN as u64,
                actual: file_len,
            }
            .into());
        }

        let header = Header::from_bytes(&head)?;
        header.check_version(policy)?;
        header.check_layout(file_len)?;

        let mut index = vec![0u8; header.index_len as usize];
        reader.seek(SeekFrom::Start(header.index_offset))?;
        reader.read_exact(&mut index)?;
        let entries = parse_index(&index);

        let mut tail = [0u8; FOOTER_LEN];
        reader.seek(SeekFrom::Start(header.footer_offset))?;
        reader.read_exact(&mut tail)?;
        let footer = Footer::from_bytes(&tail);

        debug!(
            "Opened container: {}.{}, {} entries, {} bytes",
            header.major, header.minor, header.entry_count, file_len
        );

        Ok(HdiffReader {
            inner: reader,
            header,
            index,
            entries,
            footer,
            file_len,
            window: DEFAULT_WINDOW,
            max_chunk: MAX_CHUNK_SIZE,
        })
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Recomputes the footer digests.
    ///
    /// The BLAKE3 digest is streamed over `[0, footer_offset)` one window at a
    /// time so memory stays flat for large patches.
    pub fn verify_integrity(&mut self) -> Result<(), HdiffError> {
        let mut digest = Hasher::new();
        let span = self.header.footer_offset.min(self.window as u64) as usize;
        let mut window = vec![0u8; span.max(1)];

        self.inner.seek(SeekFrom::Start(0))?;
        pump(&mut self.inner, self.header.footer_offset, &mut window, |chunk| {
            digest.update(chunk);
            Ok(())
        })?;

        if digest.finalize() != self.footer.digest {
            return Err(IntegrityError::FooterDigest.into());
        }
        if checksum(&self.index) != self.footer.index_checksum {
            return Err(IntegrityError::IndexChecksum.into());
        }
        if self.footer.reserved != [0u8; 8] {
            return Err(IntegrityError::FooterReserved.into());
        }

        trace!("Integrity verified over {} bytes", self.header.footer_offset);
        Ok(())
    }

    /// Reads the raw payload of entry `i` and checks its xxHash64.
    pub fn read_payload(&mut self, i: usize) -> Result<Vec<u8>, HdiffError> {
        let entry = *self
            .entries
            .get(i)
            .ok_or(StructuralError::EntryBounds { index: i })?;

        if entry.offset < self.header.data_offset || entry.end() > self.header.footer_offset {
            return Err(StructuralError::EntryBounds { index: i }.into());
        }
        if entry.uncompressed_len as usize > self.max_chunk {
            return Err(StructuralError::ChunkTooLarge {
                index: i,
                len: entry.uncompressed_len as usize,
                limit: self.max_chunk,
            }
            .into());
        }

        let mut payload = vec![0u8; entry.compressed_len as usize];
        self.inner.seek(SeekFrom::Start(entry.offset))?;
        self.inner.read_exact(&mut payload)?;

        if checksum(&payload) != entry.checksum {
            return Err(IntegrityError::ChunkChecksum { index: i }.into());
        }
        Ok(payload)
    }

    /// Reads entry `i` and decodes its zstd frame.
    pub fn read_chunk(&mut self, i: usize, dict: Option<&[u8]>) -> Result<Vec<u8>, HdiffError> {
        let payload = self.read_payload(i)?;
        let uncompressed = self.entries[i].uncompressed_len as usize;

        Ok(codec::decompress(&payload, uncompressed, dict)?)
    }
}

/// A fully parsed in-memory container.
#[derive(Debug, PartialEq, Eq)]
pub struct Decoded<'a> {
    pub header: Header,
    pub entries: Vec<IndexEntry>,
    pub data: &'a [u8],
    pub footer: Footer,
}

/// Parses `bytes` into its four regions, checking structure but not digests.
pub fn decode(bytes: &[u8], policy: VersionPolicy) -> Result<Decoded<'_>, HdiffError> {
    let reader = HdiffReader::open(Cursor::new(bytes), policy)?;
    let header = reader.header;
    let data = &bytes[header.data_offset as usize..header.footer_offset as usize];

    Ok(Decoded {
        header,
        entries: reader.entries,
        data,
        footer: reader.footer,
    })
}

/// Structural plus integrity verification of an in-memory container.
pub fn verify_integrity(bytes: &[u8], policy: VersionPolicy) -> Result<(), HdiffError> {
    let mut reader = HdiffReader::open(Cursor::new(bytes), policy)?;
    reader.verify_integrity()?;
    for i in 0..reader.entries().len() {
        reader.read_payload(i)?;
    }
    Ok(())
}
