//! DEFLATE capability — the one place the crate touches a compression
//! library.
//!
//! BGZF permits exactly one payload encoding: a raw DEFLATE stream (no zlib
//! or gzip wrapper — the block header and footer are the wrapper).  The
//! codec and writer take the implementation through the [`DeflateBackend`]
//! capability so an accelerated library can be swapped in without touching
//! the wire code.  The default backend is flate2.
//!
//! Compressor state is reused across blocks via `reset`; a steady-state
//! writer performs no per-block allocation for the DEFLATE machinery.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// DEFLATE level for block payloads.  Valid values are 0 (stored) through 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    /// Level 0: stored blocks, no compression.  Guaranteed not to expand
    /// input beyond a small fixed overhead, which the codec relies on for
    /// its incompressible-input fallback.
    pub const NONE: CompressionLevel = CompressionLevel(0);
    pub const FASTEST: CompressionLevel = CompressionLevel(1);
    pub const BEST: CompressionLevel = CompressionLevel(9);

    pub fn new(level: u32) -> Result<Self> {
        if level > 9 {
            return Err(Error::OutOfRange {
                what: "compression level",
                value: u64::from(level),
                max: 9,
            });
        }
        Ok(CompressionLevel(level))
    }

    #[inline]
    pub fn level(self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    /// The conventional BGZF default.
    fn default() -> Self {
        CompressionLevel(5)
    }
}

impl TryFrom<u8> for CompressionLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        CompressionLevel::new(u32::from(value))
    }
}

/// One reusable raw-DEFLATE compressor.
pub trait Deflater: Send {
    /// Compress `input` into `output` (cleared first).  Returns the
    /// compressed size.
    fn deflate(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize>;
}

/// One reusable raw-DEFLATE decompressor.
pub trait Inflater: Send {
    /// Inflate `input` into `output`, which must be sized exactly to the
    /// expected uncompressed length.  Returns the bytes produced; a stream
    /// that does not fill (or would overflow) `output` is invalid.
    fn inflate(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

/// Factory capability for the DEFLATE implementation.
pub trait DeflateBackend: Send + Sync {
    fn make_compressor(&self, level: CompressionLevel) -> Box<dyn Deflater>;
    fn make_decompressor(&self) -> Box<dyn Inflater>;
}

// ── flate2 backend ───────────────────────────────────────────────────────────

/// Headroom for incompressible input: DEFLATE can expand such data slightly.
#[inline]
fn extra_amount(input_len: usize) -> usize {
    std::cmp::max(128, input_len / 10)
}

/// Default backend over flate2's raw streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct Flate2Backend;

impl DeflateBackend for Flate2Backend {
    fn make_compressor(&self, level: CompressionLevel) -> Box<dyn Deflater> {
        Box::new(Flate2Deflater {
            inner: Compress::new(Compression::new(level.level()), false),
        })
    }

    fn make_decompressor(&self) -> Box<dyn Inflater> {
        Box::new(Flate2Inflater {
            inner: Decompress::new(false),
        })
    }
}

struct Flate2Deflater {
    inner: Compress,
}

impl Deflater for Flate2Deflater {
    fn deflate(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        output.clear();
        output.reserve(input.len() + extra_amount(input.len()));
        self.inner.reset();
        loop {
            let consumed = self.inner.total_in() as usize;
            let status = self
                .inner
                .compress_vec(&input[consumed..], output, FlushCompress::Finish)
                .map_err(|e| Error::invalid_format(format!("deflate failed: {e}")))?;
            match status {
                Status::StreamEnd => break,
                // Output capacity ran out — grow and continue.
                Status::Ok | Status::BufError => output.reserve(input.len() / 4 + 256),
            }
        }
        Ok(output.len())
    }
}

struct Flate2Inflater {
    inner: Decompress,
}

impl Inflater for Flate2Inflater {
    fn inflate(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        self.inner.reset(false);
        let status = self
            .inner
            .decompress(input, output, FlushDecompress::Finish)
            .map_err(|e| Error::invalid_format(format!("inflate failed: {e}")))?;
        let produced = self.inner.total_out() as usize;
        if status != Status::StreamEnd || produced != output.len() {
            return Err(Error::invalid_format(format!(
                "DEFLATE payload produced {produced} bytes, footer declares {}",
                output.len()
            )));
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_bounds() {
        assert!(CompressionLevel::new(0).is_ok());
        assert!(CompressionLevel::new(9).is_ok());
        assert!(matches!(
            CompressionLevel::new(10),
            Err(Error::OutOfRange { .. })
        ));
        assert_eq!(CompressionLevel::default().level(), 5);
    }

    #[test]
    fn deflate_inflate_roundtrip() {
        let backend = Flate2Backend;
        let mut comp = backend.make_compressor(CompressionLevel::default());
        let mut decomp = backend.make_decompressor();

        let input: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut compressed = Vec::new();
        comp.deflate(&input, &mut compressed).unwrap();
        assert!(!compressed.is_empty());

        let mut restored = vec![0u8; input.len()];
        let n = decomp.inflate(&compressed, &mut restored).unwrap();
        assert_eq!(n, input.len());
        assert_eq!(restored, input);
    }

    #[test]
    fn stored_level_bounded_overhead() {
        let backend = Flate2Backend;
        let mut comp = backend.make_compressor(CompressionLevel::NONE);
        // Incompressible-looking input must not blow past a small constant.
        let input: Vec<u8> = (0..65_280u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let mut out = Vec::new();
        comp.deflate(&input, &mut out).unwrap();
        assert!(out.len() <= input.len() + 10, "stored overhead {}", out.len() - input.len());
    }

    #[test]
    fn compressor_reuse_across_blocks() {
        let backend = Flate2Backend;
        let mut comp = backend.make_compressor(CompressionLevel::FASTEST);
        let mut decomp = backend.make_decompressor();
        let mut out = Vec::new();
        for round in 0..4u8 {
            let input = vec![round; 1000];
            comp.deflate(&input, &mut out).unwrap();
            let mut restored = vec![0u8; input.len()];
            decomp.inflate(&out, &mut restored).unwrap();
            assert_eq!(restored, input);
        }
    }

    #[test]
    fn inflate_rejects_size_mismatch() {
        let backend = Flate2Backend;
        let mut comp = backend.make_compressor(CompressionLevel::default());
        let mut decomp = backend.make_decompressor();
        let mut compressed = Vec::new();
        comp.deflate(&[1, 2, 3, 4, 5], &mut compressed).unwrap();
        // Claim a shorter uncompressed size than the stream actually holds.
        let mut too_small = vec![0u8; 3];
        assert!(decomp.inflate(&compressed, &mut too_small).is_err());
    }
}
