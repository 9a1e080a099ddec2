//! Block reader — sequential and random-access decompression.
//!
//! [`BgzfReader`] wraps any `Read` source and presents the concatenated
//! uncompressed payloads.  When the source is also `Seek`, virtual-offset
//! seeking becomes available: the upper half of a [`VirtualOffset`] is a
//! byte address the reader can jump to directly, because every block is an
//! independent gzip member.
//!
//! One uncompressed block is resident at a time.  When the next block is
//! decoded, the previous payload buffer is donated back to the codec and
//! reused if the sizes match, so steady-state reading performs no per-block
//! allocation.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::block::{BlockDecoder, TERMINATOR_BLOCK};
use crate::deflate::{DeflateBackend, Flate2Backend};
use crate::error::{Error, Result};
use crate::voffset::VirtualOffset;

/// Decompressing reader over a BGZF byte source.
pub struct BgzfReader<R> {
    inner: R,
    decoder: BlockDecoder,
    /// Uncompressed payload of the current block.
    payload: Vec<u8>,
    /// Cursor into `payload`.
    pos: usize,
    /// Compressed address of the current block.
    block_address: u64,
    /// Source cursor: compressed address of the next block to decode.
    stream_pos: u64,
    /// Address of the first block in a trailing run of empty blocks; the
    /// terminator anchors the reported end-of-stream position.
    empty_run_start: Option<u64>,
    block_loaded: bool,
    eof: bool,
    closed: bool,
    source_name: String,
}

impl BgzfReader<BufReader<File>> {
    /// Open a file, naming it in subsequent errors.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)).with_source_name(path.display().to_string()))
    }
}

impl<R: Read> BgzfReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_backend(inner, &Flate2Backend)
    }

    pub fn with_backend(inner: R, backend: &dyn DeflateBackend) -> Self {
        BgzfReader {
            inner,
            decoder: BlockDecoder::new(backend),
            payload: Vec::new(),
            pos: 0,
            block_address: 0,
            stream_pos: 0,
            empty_run_start: None,
            block_loaded: false,
            eof: false,
            closed: false,
            source_name: String::new(),
        }
    }

    /// Name used in error messages (usually the file path).
    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    /// Verify each block's CRC-32 after inflation (off by default).
    pub fn set_verify_crc(&mut self, verify: bool) {
        self.decoder.set_verify_crc(verify);
    }

    /// Bytes remaining in the current decoded block.  Zero at a block
    /// boundary, including before the first read and after EOF.
    pub fn available(&self) -> usize {
        self.payload.len().saturating_sub(self.pos)
    }

    /// True when the cursor sits at the end of the current block.
    pub fn at_block_end(&self) -> bool {
        self.pos >= self.payload.len()
    }

    /// Virtual offset of the next byte to be read.  At a block boundary
    /// this addresses the start of the following block; at end of stream
    /// it addresses the terminator block.
    pub fn virtual_position(&self) -> Result<VirtualOffset> {
        if self.block_loaded && self.pos < self.payload.len() {
            VirtualOffset::new(self.block_address, self.pos as u16)
        } else {
            let addr = self.empty_run_start.unwrap_or(self.stream_pos);
            VirtualOffset::new(addr, 0)
        }
    }

    /// Release the reader.  Idempotent; subsequent reads fail with
    /// `IllegalState`.
    pub fn close(&mut self) {
        self.closed = true;
        self.payload = Vec::new();
        self.pos = 0;
        self.block_loaded = false;
    }

    /// Read the next uncompressed byte; `None` at end of stream.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        self.check_open()?;
        loop {
            if self.pos < self.payload.len() {
                let b = self.payload[self.pos];
                self.pos += 1;
                return Ok(Some(b));
            }
            if !self.fetch_block()? {
                return Ok(None);
            }
        }
    }

    /// Read the next line, with `\n`, `\r`, or `\r\n` as terminator
    /// (excluded from the result).  `None` at end of stream.  Lines may
    /// span block boundaries; so may the two bytes of `\r\n`.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        self.check_open()?;
        let mut out: Vec<u8> = Vec::new();
        let mut consumed_any = false;
        loop {
            if self.pos >= self.payload.len() {
                if !self.fetch_block()? {
                    break;
                }
                continue;
            }
            let chunk = &self.payload[self.pos..];
            match memchr::memchr2(b'\n', b'\r', chunk) {
                Some(i) => {
                    out.extend_from_slice(&chunk[..i]);
                    let terminator = chunk[i];
                    self.pos += i + 1;
                    if terminator == b'\r' {
                        if let Some(b'\n') = self.peek_byte()? {
                            self.pos += 1;
                        }
                    }
                    return Ok(Some(String::from_utf8_lossy(&out).into_owned()));
                }
                None => {
                    consumed_any = true;
                    out.extend_from_slice(chunk);
                    self.pos = self.payload.len();
                }
            }
        }
        if consumed_any {
            Ok(Some(String::from_utf8_lossy(&out).into_owned()))
        } else {
            Ok(None)
        }
    }

    fn peek_byte(&mut self) -> Result<Option<u8>> {
        loop {
            if self.pos < self.payload.len() {
                return Ok(Some(self.payload[self.pos]));
            }
            if !self.fetch_block()? {
                return Ok(None);
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::illegal_state("reader is closed"));
        }
        Ok(())
    }

    /// Decode the next non-empty block, donating the previous payload
    /// buffer for reuse.  Returns false at end of stream.
    ///
    /// Empty blocks are skipped, but the address of a trailing empty run
    /// is remembered: the terminator is where the end-of-stream position
    /// points.
    fn fetch_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        loop {
            let recycle = std::mem::take(&mut self.payload);
            self.pos = 0;
            match self.decoder.decode_from(&mut self.inner, Some(recycle)) {
                Ok(Some(block)) if block.payload.is_empty() => {
                    if self.empty_run_start.is_none() {
                        self.empty_run_start = Some(self.stream_pos);
                    }
                    self.stream_pos += block.compressed_size as u64;
                    self.block_loaded = false;
                }
                Ok(Some(block)) => {
                    self.empty_run_start = None;
                    self.block_address = self.stream_pos;
                    self.stream_pos += block.compressed_size as u64;
                    self.payload = block.payload;
                    self.block_loaded = true;
                    return Ok(true);
                }
                Ok(None) => {
                    self.eof = true;
                    self.block_loaded = false;
                    return Ok(false);
                }
                Err(e) => return Err(self.annotate(e)),
            }
        }
    }

    /// Attach the source name to truncation reports.
    fn annotate(&self, e: Error) -> Error {
        match e {
            Error::Truncated(msg) if !self.source_name.is_empty() => {
                Error::truncated(format!("{}: {msg}", self.source_name))
            }
            other => other,
        }
    }
}

impl<R: Read + Seek> BgzfReader<R> {
    /// Position the reader at a virtual offset.
    ///
    /// When the target addresses the currently loaded block only the
    /// cursor moves.  Otherwise the underlying source seeks to the block
    /// address and the block there is decoded.  The in-block offset must
    /// lie within the block; the exact end is accepted only when nothing
    /// but the terminator (or nothing at all) follows.
    pub fn seek_virtual(&mut self, target: VirtualOffset) -> Result<()> {
        self.check_open()?;
        let addr = target.block_address();
        let offset = target.in_block_offset() as usize;

        if !(self.block_loaded && addr == self.block_address) {
            self.inner.seek(SeekFrom::Start(addr))?;
            self.eof = false;
            self.block_loaded = false;
            self.block_address = addr;
            self.stream_pos = addr;
            self.empty_run_start = None;
            self.payload.clear();
            self.pos = 0;
            if !self.fetch_block()? {
                // Seeking to the stream length itself is legal with a zero
                // in-block offset.
                if offset == 0 {
                    return Ok(());
                }
                return Err(Error::InvalidPointer {
                    offset: target.in_block_offset(),
                    block_len: 0,
                });
            }
        }

        if offset > self.payload.len()
            || (offset == self.payload.len() && !self.at_source_end()?)
        {
            return Err(Error::InvalidPointer {
                offset: target.in_block_offset(),
                block_len: self.payload.len(),
            });
        }
        self.pos = offset;
        Ok(())
    }

    /// True when at most the terminator block remains past the current
    /// position of the underlying source.
    fn at_source_end(&mut self) -> Result<bool> {
        let cur = self.inner.stream_position()?;
        let end = self.inner.seek(SeekFrom::End(0))?;
        if cur != end {
            self.inner.seek(SeekFrom::Start(cur))?;
        }
        Ok(end - cur <= TERMINATOR_BLOCK.len() as u64)
    }
}

impl<R: Read> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "reader is closed"));
        }
        let mut total = 0;
        while total < buf.len() {
            if self.pos >= self.payload.len() {
                match self.fetch_block() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            let n = (buf.len() - total).min(self.payload.len() - self.pos);
            buf[total..total + n].copy_from_slice(&self.payload[self.pos..self.pos + n]);
            self.pos += n;
            total += n;
        }
        Ok(total)
    }
}

impl<R: Read> BufRead for BgzfReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "reader is closed"));
        }
        while self.pos >= self.payload.len() {
            match self.fetch_block() {
                Ok(true) => {}
                Ok(false) => return Ok(&[]),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(&self.payload[self.pos..])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.payload.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockEncoder;
    use crate::deflate::CompressionLevel;
    use std::io::Cursor;

    fn encode_stream(payloads: &[&[u8]]) -> Vec<u8> {
        let mut enc = BlockEncoder::new(&Flate2Backend, CompressionLevel::default());
        let mut out = Vec::new();
        for p in payloads {
            out.extend_from_slice(&enc.encode(p).unwrap());
        }
        out.extend_from_slice(&TERMINATOR_BLOCK);
        out
    }

    #[test]
    fn empty_stream_reads_nothing() {
        let mut r = BgzfReader::new(Cursor::new(TERMINATOR_BLOCK.to_vec()));
        assert_eq!(r.virtual_position().unwrap(), VirtualOffset::ZERO);
        assert_eq!(r.read_byte().unwrap(), None);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn single_block_roundtrip_and_position() {
        let data = encode_stream(&[b"Hello BGZF!"]);
        let first_block_size = data.len() - TERMINATOR_BLOCK.len();

        let mut r = BgzfReader::new(Cursor::new(data));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"Hello BGZF!");
        assert_eq!(
            r.virtual_position().unwrap(),
            VirtualOffset::new(first_block_size as u64, 0).unwrap()
        );
    }

    #[test]
    fn read_byte_walks_blocks() {
        let data = encode_stream(&[b"ab", b"cd"]);
        let mut r = BgzfReader::new(Cursor::new(data));
        let mut got = Vec::new();
        while let Some(b) = r.read_byte().unwrap() {
            got.push(b);
        }
        assert_eq!(got, b"abcd");
    }

    #[test]
    fn available_and_block_end() {
        let data = encode_stream(&[b"0123456789"]);
        let mut r = BgzfReader::new(Cursor::new(data));
        assert_eq!(r.available(), 0);
        assert!(r.at_block_end());

        assert_eq!(r.read_byte().unwrap(), Some(b'0'));
        assert_eq!(r.available(), 9);
        assert!(!r.at_block_end());

        let mut rest = [0u8; 9];
        r.read_exact(&mut rest).unwrap();
        assert_eq!(r.available(), 0);
        assert!(r.at_block_end());
    }

    #[test]
    fn read_line_terminators() {
        let data = encode_stream(&[b"alpha\nbeta\r\ngamma\rdelta"]);
        let mut r = BgzfReader::new(Cursor::new(data));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("alpha"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("beta"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("gamma"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("delta"));
        assert_eq!(r.read_line().unwrap(), None);
    }

    #[test]
    fn read_line_spans_blocks_and_split_crlf() {
        // "\r" ends block one, "\n" begins block two: one terminator.
        let data = encode_stream(&[b"split li", b"ne one\r", b"\nline two"]);
        let mut r = BgzfReader::new(Cursor::new(data));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("split line one"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("line two"));
        assert_eq!(r.read_line().unwrap(), None);
    }

    #[test]
    fn seek_same_block_moves_cursor_only() {
        let data = encode_stream(&[b"0123456789"]);
        let mut r = BgzfReader::new(Cursor::new(data));
        r.read_byte().unwrap();
        let addr = 0;
        r.seek_virtual(VirtualOffset::new(addr, 7).unwrap()).unwrap();
        assert_eq!(r.read_byte().unwrap(), Some(b'7'));
        r.seek_virtual(VirtualOffset::new(addr, 2).unwrap()).unwrap();
        assert_eq!(r.read_byte().unwrap(), Some(b'2'));
    }

    #[test]
    fn seek_across_blocks() {
        let mut enc = BlockEncoder::new(&Flate2Backend, CompressionLevel::default());
        let b0 = enc.encode(b"first block").unwrap();
        let b1 = enc.encode(b"second block").unwrap();
        let mut data = b0.clone();
        data.extend_from_slice(&b1);
        data.extend_from_slice(&TERMINATOR_BLOCK);

        let mut r = BgzfReader::new(Cursor::new(data));
        let second = VirtualOffset::new(b0.len() as u64, 7).unwrap();
        r.seek_virtual(second).unwrap();
        assert_eq!(r.read_byte().unwrap(), Some(b'b'));
        assert_eq!(
            r.virtual_position().unwrap(),
            VirtualOffset::new(b0.len() as u64, 8).unwrap()
        );

        // Back to the start.
        r.seek_virtual(VirtualOffset::ZERO).unwrap();
        assert_eq!(r.read_byte().unwrap(), Some(b'f'));
    }

    #[test]
    fn seek_past_block_length_is_invalid_pointer() {
        let data = encode_stream(&[b"0123456789"]);
        let mut r = BgzfReader::new(Cursor::new(data));
        let err = r
            .seek_virtual(VirtualOffset::new(0, 11).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPointer { offset: 11, block_len: 10 }));
    }

    #[test]
    fn seek_to_exact_end_allowed_when_only_terminator_remains() {
        let data = encode_stream(&[b"0123456789"]);
        let mut r = BgzfReader::new(Cursor::new(data));
        r.seek_virtual(VirtualOffset::new(0, 10).unwrap()).unwrap();
        assert!(r.at_block_end());
    }

    #[test]
    fn truncated_stream_names_source() {
        let data = encode_stream(&[b"payload"]);
        let cut = data[..data.len() - TERMINATOR_BLOCK.len() - 2].to_vec();
        let mut r =
            BgzfReader::new(Cursor::new(cut)).with_source_name("reads.bgz");
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert!(err.to_string().contains("reads.bgz"), "{err}");
    }

    #[test]
    fn close_is_idempotent_and_fails_reads() {
        let data = encode_stream(&[b"x"]);
        let mut r = BgzfReader::new(Cursor::new(data));
        r.close();
        r.close();
        assert!(matches!(r.read_byte(), Err(Error::IllegalState(_))));
    }
}
