//! BGZF block codec — one independently decompressible gzip member.
//!
//! # On-disk layout (all numeric fields little-endian)
//!
//! ```text
//! Offset  Size  Field            Value
//!    0      1   ID1              0x1f
//!    1      1   ID2              0x8b
//!    2      1   CM               0x08 (DEFLATE)
//!    3      1   FLG              FEXTRA bit (0x04) set
//!    4      4   MTIME            writers emit 0
//!    8      1   XFL              compression hint, any value accepted
//!    9      1   OS               0xff
//!   10      2   XLEN             0x0006
//!   12      1   SI1              0x42 ('B')
//!   13      1   SI2              0x43 ('C')
//!   14      2   SLEN             0x0002
//!   16      2   BSIZE            total block size minus one
//!   18      N   payload          raw DEFLATE stream, N = BSIZE + 1 − 26
//!   18+N    4   CRC32            of the uncompressed payload
//!   22+N    4   ISIZE            uncompressed payload size
//! ```
//!
//! The total block size never exceeds 65 536 bytes, which is what makes
//! BSIZE representable in its 16-bit field.  A writer therefore feeds the
//! encoder at most 65 280 bytes at a time; if DEFLATE expands the input past
//! the budget, the encoder re-runs at level 0 (stored blocks), whose bounded
//! framing overhead is guaranteed to fit.  The alternative — shrinking the
//! input until the output fits — would make the byte position of a write
//! unpredictable to the caller.
//!
//! # Terminator
//!
//! A clean BGZF stream ends with [`TERMINATOR_BLOCK`]: the fixed 28-byte
//! empty member produced by encoding zero bytes.  Its presence is how
//! readers distinguish a complete stream from a truncated one.

use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

use crate::deflate::{CompressionLevel, DeflateBackend, Deflater, Inflater};
use crate::error::{Error, Result};

// ── Wire constants ───────────────────────────────────────────────────────────

/// Fixed size of the gzip header including the "BC" extra subfield.
pub const BGZF_HEADER_SIZE: usize = 18;
/// CRC32 + ISIZE.
pub const BGZF_FOOTER_SIZE: usize = 8;
/// Header plus footer bytes around the DEFLATE payload.
pub const BLOCK_OVERHEAD: usize = BGZF_HEADER_SIZE + BGZF_FOOTER_SIZE;
/// Hard cap on the on-disk size of one block (BSIZE is 16 bits).
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;
/// Largest uncompressed payload a writer may stage per block.
pub const MAX_PAYLOAD_SIZE: usize = 65_280;
/// Smallest structurally valid block: empty DEFLATE stream (2 bytes).
const MIN_BLOCK_SIZE: usize = BLOCK_OVERHEAD + 2;

const GZIP_ID1: u8 = 0x1f;
const GZIP_ID2: u8 = 0x8b;
const GZIP_CM_DEFLATE: u8 = 0x08;
const GZIP_FLG_FEXTRA: u8 = 0x04;
const GZIP_OS_UNKNOWN: u8 = 0xff;
const BGZF_XLEN: u16 = 6;
const BGZF_SI1: u8 = b'B';
const BGZF_SI2: u8 = b'C';
const BGZF_SLEN: u16 = 2;

/// The fixed 28-byte empty block that marks a clean end of stream.
pub const TERMINATOR_BLOCK: [u8; 28] = [
    0x1f, 0x8b, // ID1, ID2
    0x08, // CM = DEFLATE
    0x04, // FLG = FEXTRA
    0x00, 0x00, 0x00, 0x00, // MTIME = 0
    0x00, // XFL
    0xff, // OS = unknown
    0x06, 0x00, // XLEN = 6
    0x42, 0x43, // 'B', 'C'
    0x02, 0x00, // SLEN = 2
    0x1b, 0x00, // BSIZE = 27
    0x03, 0x00, // empty DEFLATE stream
    0x00, 0x00, 0x00, 0x00, // CRC32 = 0
    0x00, 0x00, 0x00, 0x00, // ISIZE = 0
];

// ── Header ───────────────────────────────────────────────────────────────────

/// Validate the 18 fixed header bytes and return the total on-disk block
/// size (BSIZE + 1).
///
/// Validation is ordered cheapest-first; every rejection names the field
/// that failed.  MTIME, XFL and OS are accepted with any value.
pub fn parse_header(header: &[u8; BGZF_HEADER_SIZE]) -> Result<usize> {
    if header[0] != GZIP_ID1 || header[1] != GZIP_ID2 {
        return Err(Error::invalid_format(format!(
            "bad gzip magic {:#04x} {:#04x}",
            header[0], header[1]
        )));
    }
    if header[2] != GZIP_CM_DEFLATE {
        return Err(Error::invalid_format(format!(
            "compression method {} is not DEFLATE",
            header[2]
        )));
    }
    if header[3] & GZIP_FLG_FEXTRA == 0 {
        return Err(Error::invalid_format(
            "FEXTRA flag not set — plain gzip, not BGZF".to_string(),
        ));
    }
    let xlen = LittleEndian::read_u16(&header[10..12]);
    if xlen != BGZF_XLEN {
        return Err(Error::invalid_format(format!("XLEN {xlen}, expected 6")));
    }
    if header[12] != BGZF_SI1 || header[13] != BGZF_SI2 {
        return Err(Error::invalid_format(format!(
            "extra subfield id {:#04x} {:#04x}, expected \"BC\"",
            header[12], header[13]
        )));
    }
    let slen = LittleEndian::read_u16(&header[14..16]);
    if slen != BGZF_SLEN {
        return Err(Error::invalid_format(format!("SLEN {slen}, expected 2")));
    }
    let total = LittleEndian::read_u16(&header[16..18]) as usize + 1;
    if total < MIN_BLOCK_SIZE {
        return Err(Error::invalid_format(format!(
            "BSIZE declares {total}-byte block, minimum is {MIN_BLOCK_SIZE}"
        )));
    }
    Ok(total)
}

/// Read until `buf` is full or EOF.  Returns bytes read.
fn read_fully<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = src.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Read the complete on-disk bytes of the next block into `buf`.
///
/// Returns `Ok(None)` when the source is already at EOF (a legal stream
/// termination), the total block size otherwise.  EOF after the first
/// header byte is `Error::Truncated`.
pub fn read_raw_block<R: Read>(src: &mut R, buf: &mut Vec<u8>) -> Result<Option<usize>> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    let got = read_fully(src, &mut header)?;
    if got == 0 {
        return Ok(None);
    }
    if got < BGZF_HEADER_SIZE {
        return Err(Error::truncated(format!(
            "EOF inside block header after {got} of {BGZF_HEADER_SIZE} bytes"
        )));
    }
    let total = parse_header(&header)?;
    buf.resize(total, 0);
    buf[..BGZF_HEADER_SIZE].copy_from_slice(&header);
    let got = read_fully(src, &mut buf[BGZF_HEADER_SIZE..])?;
    if got < total - BGZF_HEADER_SIZE {
        return Err(Error::truncated(format!(
            "EOF inside block body: got {got} of {} bytes",
            total - BGZF_HEADER_SIZE
        )));
    }
    Ok(Some(total))
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// The uncompressed payload of one block plus its on-disk size.
#[derive(Debug)]
pub struct DecodedBlock {
    pub payload: Vec<u8>,
    pub compressed_size: usize,
}

/// Reusable block decoder.  Owns the inflater and the compressed scratch
/// buffer so steady-state decoding allocates nothing new; the caller may
/// additionally donate the previous payload buffer for reuse.
pub struct BlockDecoder {
    inflater: Box<dyn Inflater>,
    raw: Vec<u8>,
    verify_crc: bool,
}

impl BlockDecoder {
    pub fn new(backend: &dyn DeflateBackend) -> Self {
        BlockDecoder {
            inflater: backend.make_decompressor(),
            raw: Vec::with_capacity(MAX_BLOCK_SIZE),
            verify_crc: false,
        }
    }

    /// Enable CRC-32 verification of each decoded payload (off by default).
    pub fn set_verify_crc(&mut self, verify: bool) {
        self.verify_crc = verify;
    }

    /// Decode the next block from `src`.
    ///
    /// `recycle` is an optional previously owned payload buffer; it is
    /// reused iff its length equals the new uncompressed size, keeping
    /// steady-state allocation O(1) for runs of equally sized blocks.
    ///
    /// Returns `Ok(None)` at a clean EOF.
    pub fn decode_from<R: Read>(
        &mut self,
        src: &mut R,
        recycle: Option<Vec<u8>>,
    ) -> Result<Option<DecodedBlock>> {
        let mut raw = std::mem::take(&mut self.raw);
        let total = match read_raw_block(src, &mut raw) {
            Ok(Some(total)) => total,
            Ok(None) => {
                self.raw = raw;
                return Ok(None);
            }
            Err(e) => {
                self.raw = raw;
                return Err(e);
            }
        };
        let result = self.inflate_raw(&raw[..total], recycle);
        self.raw = raw;
        result.map(|payload| {
            Some(DecodedBlock {
                payload,
                compressed_size: total,
            })
        })
    }

    /// Inflate a complete raw block (header through footer) already in
    /// memory — the transform half of the async pipeline.
    pub fn inflate_raw(&mut self, raw: &[u8], recycle: Option<Vec<u8>>) -> Result<Vec<u8>> {
        if raw.len() < MIN_BLOCK_SIZE {
            return Err(Error::truncated(format!(
                "raw block of {} bytes is below the {MIN_BLOCK_SIZE}-byte minimum",
                raw.len()
            )));
        }
        let footer = &raw[raw.len() - BGZF_FOOTER_SIZE..];
        let expected_crc = LittleEndian::read_u32(&footer[..4]);
        let isize = LittleEndian::read_u32(&footer[4..]) as usize;
        if isize > MAX_BLOCK_SIZE {
            return Err(Error::invalid_format(format!(
                "ISIZE {isize} exceeds the {MAX_BLOCK_SIZE}-byte block budget"
            )));
        }

        let mut payload = match recycle {
            Some(buf) if buf.len() == isize => buf,
            _ => vec![0u8; isize],
        };
        self.inflater.inflate(
            &raw[BGZF_HEADER_SIZE..raw.len() - BGZF_FOOTER_SIZE],
            &mut payload,
        )?;

        if self.verify_crc {
            let mut h = Hasher::new();
            h.update(&payload);
            let actual = h.finalize();
            if actual != expected_crc {
                return Err(Error::invalid_format(format!(
                    "CRC32 mismatch: computed {actual:#010x}, footer declares {expected_crc:#010x}"
                )));
            }
        }
        Ok(payload)
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

/// Reusable block encoder holding two compressors: the configured level and
/// a level-0 fallback for payloads that DEFLATE would expand past the block
/// budget.
pub struct BlockEncoder {
    deflater: Box<dyn Deflater>,
    stored: Box<dyn Deflater>,
    level: CompressionLevel,
    scratch: Vec<u8>,
}

impl BlockEncoder {
    pub fn new(backend: &dyn DeflateBackend, level: CompressionLevel) -> Self {
        BlockEncoder {
            deflater: backend.make_compressor(level),
            stored: backend.make_compressor(CompressionLevel::NONE),
            level,
            scratch: Vec::with_capacity(MAX_BLOCK_SIZE),
        }
    }

    /// Encode up to [`MAX_PAYLOAD_SIZE`] bytes as one complete block into
    /// `out` (cleared first).  Returns the total bytes written.
    pub fn encode_into(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        if input.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::OutOfRange {
                what: "block payload",
                value: input.len() as u64,
                max: MAX_PAYLOAD_SIZE as u64,
            });
        }

        self.deflater.deflate(input, &mut self.scratch)?;
        if self.scratch.len() + BLOCK_OVERHEAD > MAX_BLOCK_SIZE {
            // Incompressible input expanded past the budget; stored framing
            // adds at most 10 bytes to 65 280 and always fits.
            self.stored.deflate(input, &mut self.scratch)?;
            if self.scratch.len() + BLOCK_OVERHEAD > MAX_BLOCK_SIZE {
                return Err(Error::invalid_format(format!(
                    "stored DEFLATE of {} bytes still exceeds the block budget",
                    input.len()
                )));
            }
        }

        let total = self.scratch.len() + BLOCK_OVERHEAD;
        out.clear();
        out.reserve(total);
        out.extend_from_slice(&header_bytes(self.level, total));
        out.extend_from_slice(&self.scratch);

        let mut h = Hasher::new();
        h.update(input);
        let mut footer = [0u8; BGZF_FOOTER_SIZE];
        LittleEndian::write_u32(&mut footer[..4], h.finalize());
        LittleEndian::write_u32(&mut footer[4..], input.len() as u32);
        out.extend_from_slice(&footer);

        Ok(total)
    }

    /// Encode into a fresh buffer.
    pub fn encode(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(input, &mut out)?;
        Ok(out)
    }
}

/// Assemble the fixed 18-byte header for a block of `total_size` bytes.
fn header_bytes(level: CompressionLevel, total_size: usize) -> [u8; BGZF_HEADER_SIZE] {
    debug_assert!(total_size <= MAX_BLOCK_SIZE);
    // XFL is advisory: 2 = maximum compression, 4 = fastest.
    let xfl = match level.level() {
        0 | 1 => 4,
        9 => 2,
        _ => 0,
    };
    let mut h = [0u8; BGZF_HEADER_SIZE];
    h[0] = GZIP_ID1;
    h[1] = GZIP_ID2;
    h[2] = GZIP_CM_DEFLATE;
    h[3] = GZIP_FLG_FEXTRA;
    // MTIME stays zero.
    h[8] = xfl;
    h[9] = GZIP_OS_UNKNOWN;
    LittleEndian::write_u16(&mut h[10..12], BGZF_XLEN);
    h[12] = BGZF_SI1;
    h[13] = BGZF_SI2;
    LittleEndian::write_u16(&mut h[14..16], BGZF_SLEN);
    LittleEndian::write_u16(&mut h[16..18], (total_size - 1) as u16);
    h
}
