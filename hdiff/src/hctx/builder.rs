use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use log::debug;

use hcore::buf::pump;
use hcore::hash::{checksum, Hash, Hasher};

use crate::hctx::error::HdiffError;
use crate::hctx::flags::EntryFlags;
use crate::hctx::raw::{Footer, Header, IndexEntry};
use crate::hctx::ENTRY_LEN;

// Window used when copying the spooled data section into the output
pub const DEFAULT_COPY_WINDOW: usize = 1024 * 1024;

/// Summary of a finalized container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub header: Header,
    pub index_checksum: u64,
    pub digest: Hash,
    pub file_len: u64,
}

/// Footer-last container writer.
///
/// Payloads are appended to a spool (a `Cursor<Vec<u8>>` in memory or a
/// temporary file when streaming) while the index stays in memory. Nothing
/// reaches the final output until [`HdiffBuilder::finalize`] lays out the
/// header, the index, the spooled data and the footer in order.
pub struct HdiffBuilder<D: Read + Write + Seek> {
    spool: D,
    entries: Vec<IndexEntry>,
    data_len: u64,
    window: usize,
}

impl HdiffBuilder<Cursor<Vec<u8>>> {
    pub fn in_memory() -> Self {
        HdiffBuilder::new(Cursor::new(Vec::new()))
    }
}

impl<D: Read + Write + Seek> HdiffBuilder<D> {
    pub fn new(spool: D) -> Self {
        HdiffBuilder {
            spool,
            entries: Vec::new(),
            data_len: 0,
            window: DEFAULT_COPY_WINDOW,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn data_len(&self) -> u64 {
        self.data_len
    }

    /// Appends one payload (an encoded zstd frame) and returns its index.
    ///
    /// Offsets are recorded relative to the data section and made absolute
    /// at finalize time.
    pub fn append_chunk(
        &mut self,
        payload: &[u8],
        uncompressed_len: u32,
        flags: EntryFlags,
    ) -> Result<usize, HdiffError> {
        if self.entries.len() >= u32::MAX as usize {
            return Err(HdiffError::EntryLimit);
        }
        let compressed_len = u32::try_from(payload.len()).map_err(|_| HdiffError::EntryLimit)?;

        self.spool.write_all(payload)?;
        self.entries.push(IndexEntry {
            offset: self.data_len,
            compressed_len,
            uncompressed_len,
            flags,
            checksum: checksum(payload),
        });
        self.data_len += payload.len() as u64;

        Ok(self.entries.len() - 1)
    }

    /// Writes the complete container to `out` and returns its layout.
    pub fn finalize<W: Write>(mut self, mut out: W) -> Result<Layout, HdiffError> {
        let header = Header::for_layout(self.entries.len() as u32, self.data_len);

        let mut index = Vec::with_capacity(self.entries.len() * ENTRY_LEN);
        for entry in self.entries.iter() {
            let entry = IndexEntry {
                offset: entry.offset + header.data_offset,
                ..*entry
            };
            index.extend_from_slice(&entry.to_bytes());
        }
        let index_checksum = checksum(&index);

        let mut digest = Hasher::new();
        let header_bytes = header.to_bytes();
        out.write_all(&header_bytes)?;
        digest.update(&header_bytes);
        out.write_all(&index)?;
        digest.update(&index);

        self.spool.seek(SeekFrom::Start(0))?;
        let mut window = vec![0u8; (self.data_len.min(self.window as u64) as usize).max(1)];
        pump(&mut self.spool, self.data_len, &mut window, |chunk| {
            digest.update(chunk);
            out.write_all(chunk)
        })?;

        let digest = digest.finalize();
        out.write_all(&Footer::new(digest, index_checksum).to_bytes())?;
        out.flush()?;

        debug!(
            "Finalized container: {} entries, {} data bytes, {} total",
            header.entry_count,
            header.data_len,
            header.file_len()
        );

        Ok(Layout {
            header,
            index_checksum,
            digest,
            file_len: header.file_len(),
        })
    }
}

/// One payload for [`encode`].
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub payload: &'a [u8],
    pub uncompressed_len: u32,
    pub flags: EntryFlags,
}

/// Builds a complete in-memory container from ready-made payloads.
pub fn encode(chunks: &[Chunk<'_>]) -> Result<Vec<u8>, HdiffError> {
    let mut builder = HdiffBuilder::in_memory();
    for chunk in chunks {
        builder.append_chunk(chunk.payload, chunk.uncompressed_len, chunk.flags)?;
    }

    let mut out = Vec::new();
    builder.finalize(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod test_hdiff_builder {
    use super::*;
    use crate::codec::raw_frame;
    use crate::hctx::flags::Importance;
    use crate::hctx::raw::parse_index;
    use crate::hctx::{FOOTER_LEN, HEADER_LEN};
    use hcore::hash::hash_bytes;
    use proptest::prelude::*;

    fn user() -> EntryFlags {
        EntryFlags::new(Importance::User, 0).unwrap()
    }

    #[test]
    fn empty_container() {
        let bytes = encode(&[]).unwrap();

        assert_eq!(bytes.len(), HEADER_LEN + FOOTER_LEN);
        assert_eq!(&bytes[0..4], b"HAJI");

        let footer = Footer::from_bytes(bytes[64..].try_into().unwrap());
        assert_eq!(footer.digest, hash_bytes(&bytes[..64]));
        assert_eq!(footer.index_checksum, checksum(&[]));
    }

    #[test]
    fn single_chunk_layout() {
        let frame = raw_frame(b"Hello, Hajimi!");
        let bytes = encode(&[Chunk {
            payload: &frame,
            uncompressed_len: 14,
            flags: user(),
        }])
        .unwrap();

        assert_eq!(bytes.len(), 161);
        let header = Header::from_bytes(bytes[..64].try_into().unwrap()).unwrap();
        assert_eq!(header, Header::for_layout(1, 23));

        let entries = parse_index(&bytes[64..90]);
        assert_eq!(
            entries,
            vec![IndexEntry {
                offset: 90,
                compressed_len: 23,
                uncompressed_len: 14,
                flags: user(),
                checksum: checksum(&frame),
            }]
        );
        assert_eq!(&bytes[90..113], &frame[..]);

        let footer = Footer::from_bytes(bytes[113..].try_into().unwrap());
        assert_eq!(footer.digest, hash_bytes(&bytes[..113]));
        assert_eq!(footer.index_checksum, checksum(&bytes[64..90]));
        assert_eq!(footer.reserved, [0; 8]);
    }

    #[test]
    fn small_window_same_bytes() {
        let frames: Vec<Vec<u8>> = (0..5u8).map(|i| raw_frame(&vec![i; 1000])).collect();

        let mut wide = HdiffBuilder::in_memory();
        let mut narrow = HdiffBuilder::in_memory().with_window(7);
        for frame in frames.iter() {
            wide.append_chunk(frame, 1000, user()).unwrap();
            narrow.append_chunk(frame, 1000, user()).unwrap();
        }

        let mut a = Vec::new();
        let mut b = Vec::new();
        let layout = wide.finalize(&mut a).unwrap();
        narrow.finalize(&mut b).unwrap();

        assert_eq!(a, b);
        assert_eq!(layout.file_len, a.len() as u64);
        assert_eq!(layout.header.entry_count, 5);
    }

    #[test]
    fn returns_entry_indices() {
        let mut builder = HdiffBuilder::in_memory();

        assert_eq!(builder.append_chunk(&raw_frame(b"a"), 1, user()).unwrap(), 0);
        assert_eq!(builder.append_chunk(&raw_frame(b"b"), 1, user()).unwrap(), 1);
        assert_eq!(builder.entry_count(), 2);
        assert_eq!(builder.data_len(), 20);
    }

    proptest! {
        #[test]
        fn layout_invariants(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 0..12),
            window in 1usize..64,
        ) {
            let frames: Vec<Vec<u8>> = payloads.iter().map(|p| raw_frame(p)).collect();
            let mut builder = HdiffBuilder::in_memory().with_window(window);
            for (frame, payload) in frames.iter().zip(payloads.iter()) {
                builder.append_chunk(frame, payload.len() as u32, user()).unwrap();
            }
            let mut bytes = Vec::new();
            let layout = builder.finalize(&mut bytes).unwrap();
            let header = layout.header;

            prop_assert_eq!(header.index_offset, HEADER_LEN as u64);
            prop_assert_eq!(header.data_offset, header.index_offset + header.index_len);
            prop_assert_eq!(header.footer_offset, header.data_offset + header.data_len);
            prop_assert_eq!(header.file_len(), bytes.len() as u64);

            let index = &bytes[HEADER_LEN..header.data_offset as usize];
            for (entry, frame) in parse_index(index).iter().zip(frames.iter()) {
                prop_assert!(entry.offset >= header.data_offset);
                prop_assert!(entry.end() <= header.footer_offset);
                prop_assert_eq!(&bytes[entry.offset as usize..entry.end() as usize], &frame[..]);
            }
        }
    }
}
