//! GZI offset index — block address → cumulative uncompressed offset.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   entry count N (u64)
//!    8   N×16   N pairs of (compressed_offset u64, uncompressed_offset u64)
//! ```
//!
//! The entry for the first block is always (0, 0); it is implicit and MUST
//! NOT appear on disk.  Entries are strictly increasing in both coordinates.
//! With the index loaded, the block containing any uncompressed offset is
//! found by binary search, giving an O(log N) seek from a logical byte
//! position to a [`VirtualOffset`].

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::block::{self, BGZF_FOOTER_SIZE, BGZF_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::voffset::VirtualOffset;

/// One stored index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GziEntry {
    /// Byte offset of the block in the compressed stream.
    pub compressed_offset: u64,
    /// Total uncompressed bytes preceding the block.
    pub uncompressed_offset: u64,
}

// ── Streaming builder ────────────────────────────────────────────────────────

/// Streaming index builder, fed once per emitted block.
///
/// Attached to a [`crate::writer::BgzfWriter`] it receives
/// `(block_address, uncompressed_size)` for every block as it is written;
/// the leading (0, 0) entry is tracked but never stored.
#[derive(Debug, Default)]
pub struct GziIndexer {
    entries: Vec<GziEntry>,
    uncompressed_total: u64,
}

impl GziIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one block.  `compressed_offset` is the block's address in the
    /// output; `uncompressed_size` is its payload length.
    pub fn add_block(&mut self, compressed_offset: u64, uncompressed_size: u32) {
        // The first block's (0, 0) entry is implicit on disk.
        if compressed_offset != 0 || self.uncompressed_total != 0 {
            self.entries.push(GziEntry {
                compressed_offset,
                uncompressed_offset: self.uncompressed_total,
            });
        }
        self.uncompressed_total += u64::from(uncompressed_size);
    }

    /// Entries recorded so far (excluding the implicit first).
    pub fn entries(&self) -> &[GziEntry] {
        &self.entries
    }

    /// Total uncompressed bytes seen.
    pub fn uncompressed_total(&self) -> u64 {
        self.uncompressed_total
    }

    /// Freeze into an immutable [`GziIndex`].
    pub fn into_index(self) -> GziIndex {
        GziIndex {
            entries: self.entries,
        }
    }

    /// Write the serialization and return the frozen index.
    pub fn finish<W: Write>(self, sink: W) -> Result<GziIndex> {
        let index = self.into_index();
        index.write(sink)?;
        Ok(index)
    }
}

// ── Loaded form ──────────────────────────────────────────────────────────────

/// Immutable loaded index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GziIndex {
    entries: Vec<GziEntry>,
}

impl GziIndex {
    /// Ordered entries, excluding the implicit (0, 0).
    pub fn entries(&self) -> &[GziEntry] {
        &self.entries
    }

    /// Number of blocks the index describes: stored entries plus the
    /// implicit first block.
    pub fn block_count(&self) -> usize {
        self.entries.len() + 1
    }

    /// Map a logical position in the concatenated uncompressed stream to a
    /// virtual offset addressing it.
    ///
    /// Binary-searches the entries by uncompressed offset; a miss steps
    /// back one entry (or to the implicit (0, 0)).  The in-block remainder
    /// must fit in 16 bits, otherwise `Error::OutOfRange` — the offset does
    /// not fall inside any indexed block.
    pub fn virtual_offset_for_seek(&self, uncompressed_offset: u64) -> Result<VirtualOffset> {
        let entry = match self
            .entries
            .binary_search_by_key(&uncompressed_offset, |e| e.uncompressed_offset)
        {
            Ok(i) => return VirtualOffset::new(self.entries[i].compressed_offset, 0),
            Err(0) => GziEntry {
                compressed_offset: 0,
                uncompressed_offset: 0,
            },
            Err(i) => self.entries[i - 1],
        };
        let delta = uncompressed_offset - entry.uncompressed_offset;
        if delta > u64::from(u16::MAX) {
            return Err(Error::OutOfRange {
                what: "in-block offset",
                value: delta,
                max: u64::from(u16::MAX),
            });
        }
        VirtualOffset::new(entry.compressed_offset, delta as u16)
    }

    /// Serialize: count then pairs, little-endian throughout.
    pub fn write<W: Write>(&self, mut sink: W) -> Result<()> {
        sink.write_u64::<LittleEndian>(self.entries.len() as u64)?;
        for e in &self.entries {
            sink.write_u64::<LittleEndian>(e.compressed_offset)?;
            sink.write_u64::<LittleEndian>(e.uncompressed_offset)?;
        }
        Ok(())
    }

    /// Load and validate a serialized index.
    ///
    /// Rejects: a count above `i32::MAX`, a stored (0, 0) first entry, any
    /// non-strictly-monotone step in either coordinate (`InvalidFormat`),
    /// and data shorter than the count declares (`Truncated`).
    pub fn load<R: Read>(mut source: R) -> Result<Self> {
        let count = source
            .read_u64::<LittleEndian>()
            .map_err(|_| Error::truncated("GZI shorter than its 8-byte count".to_string()))?;
        if count > i32::MAX as u64 {
            return Err(Error::invalid_format(format!(
                "GZI declares {count} entries, more than i32::MAX"
            )));
        }

        let mut raw = vec![0u8; count as usize * 16];
        source.read_exact(&mut raw).map_err(|_| {
            Error::truncated(format!("GZI shorter than its declared {count} entries"))
        })?;

        let mut entries: Vec<GziEntry> = Vec::with_capacity(count as usize);
        for (i, pair) in raw.chunks_exact(16).enumerate() {
            let entry = GziEntry {
                compressed_offset: LittleEndian::read_u64(&pair[..8]),
                uncompressed_offset: LittleEndian::read_u64(&pair[8..]),
            };
            if i == 0 && entry.compressed_offset == 0 && entry.uncompressed_offset == 0 {
                return Err(Error::invalid_format(
                    "GZI stores the implicit (0, 0) entry".to_string(),
                ));
            }
            if let Some(prev) = entries.last() {
                if entry.compressed_offset <= prev.compressed_offset
                    || entry.uncompressed_offset <= prev.uncompressed_offset
                {
                    return Err(Error::invalid_format(format!(
                        "GZI entry {i} ({}, {}) does not increase over ({}, {})",
                        entry.compressed_offset,
                        entry.uncompressed_offset,
                        prev.compressed_offset,
                        prev.uncompressed_offset
                    )));
                }
            }
            entries.push(entry);
        }
        Ok(GziIndex { entries })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::load(BufReader::new(File::open(path)?))
    }

    pub fn to_path(&self, path: &Path) -> Result<()> {
        let mut sink = BufWriter::new(File::create(path)?);
        self.write(&mut sink)?;
        sink.flush()?;
        Ok(())
    }
}

/// Build an index by streaming over an existing BGZF source.
///
/// Walks block headers without inflating payloads: each block's size comes
/// from BSIZE and its uncompressed length from the ISIZE footer.  The
/// result is byte-identical to the index a writer-attached [`GziIndexer`]
/// would have produced for the same stream.
pub fn build_index<R: Read + Seek>(source: &mut R) -> Result<GziIndex> {
    source.seek(SeekFrom::Start(0))?;
    let mut indexer = GziIndexer::new();
    let mut address = 0u64;
    loop {
        let mut header = [0u8; BGZF_HEADER_SIZE];
        let mut got = 0;
        while got < BGZF_HEADER_SIZE {
            let n = source.read(&mut header[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            break;
        }
        if got < BGZF_HEADER_SIZE {
            return Err(Error::truncated("EOF inside block header".to_string()));
        }
        let total = block::parse_header(&header)?;

        // Skip the payload, read the footer for ISIZE.
        let body = total - BGZF_HEADER_SIZE;
        source.seek(SeekFrom::Current((body - BGZF_FOOTER_SIZE) as i64))?;
        let mut footer = [0u8; BGZF_FOOTER_SIZE];
        source
            .read_exact(&mut footer)
            .map_err(|_| Error::truncated("EOF inside block footer".to_string()))?;
        let isize = LittleEndian::read_u32(&footer[4..]);

        // The terminator carries no payload and gets no entry.
        if isize > 0 {
            indexer.add_block(address, isize);
        }
        address += total as u64;
    }
    Ok(indexer.into_index())
}
