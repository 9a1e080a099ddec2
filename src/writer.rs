//! Block writer — buffered compression with terminator discipline.
//!
//! [`BgzfWriter`] stages uncompressed bytes in a 65 280-byte buffer and
//! emits one block per full buffer.  `finish` (or drop) emits any staged
//! remainder, then the fixed terminator block; a stream without the
//! terminator reads as truncated.
//!
//! An optional [`GziIndexer`] can be attached before the first block; the
//! writer notifies it once per emitted block and writes the serialized
//! index to the attached sink during `finish`.  Only one indexer may be
//! attached, and only the block-emitting thread touches it.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::block::{BlockEncoder, MAX_PAYLOAD_SIZE, TERMINATOR_BLOCK};
use crate::deflate::{CompressionLevel, DeflateBackend, Flate2Backend};
use crate::error::{Error, Result};
use crate::gzi::GziIndexer;
use crate::voffset::VirtualOffset;

/// Compressing writer producing a terminated BGZF stream.
pub struct BgzfWriter<W: Write> {
    inner: Option<W>,
    encoder: BlockEncoder,
    /// Uncompressed bytes staged for the next block.
    staging: Vec<u8>,
    /// Encoded-block scratch buffer.
    compressed: Vec<u8>,
    /// Compressed address the next block will land at.
    block_address: u64,
    blocks_written: u64,
    indexer: Option<GziIndexer>,
    index_sink: Option<Box<dyn Write + Send>>,
    /// Set for regular-file outputs; enables the post-close tail check.
    verify_path: Option<PathBuf>,
    finished: bool,
}

impl BgzfWriter<BufWriter<File>> {
    /// Create a file-backed writer.  On `finish` the file tail is
    /// re-opened and verified to be the terminator block.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with_level(path, CompressionLevel::default())
    }

    pub fn create_with_level<P: AsRef<Path>>(path: P, level: CompressionLevel) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)?;
        let mut w = Self::with_options(BufWriter::new(file), level, &Flate2Backend);
        w.verify_path = Some(path.to_path_buf());
        Ok(w)
    }
}

impl<W: Write> BgzfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_options(inner, CompressionLevel::default(), &Flate2Backend)
    }

    pub fn with_level(inner: W, level: CompressionLevel) -> Self {
        Self::with_options(inner, level, &Flate2Backend)
    }

    pub fn with_options(inner: W, level: CompressionLevel, backend: &dyn DeflateBackend) -> Self {
        BgzfWriter {
            inner: Some(inner),
            encoder: BlockEncoder::new(backend, level),
            staging: Vec::with_capacity(MAX_PAYLOAD_SIZE),
            compressed: Vec::new(),
            block_address: 0,
            blocks_written: 0,
            indexer: None,
            index_sink: None,
            verify_path: None,
            finished: false,
        }
    }

    /// Attach a GZI indexer whose serialization will be written to `sink`
    /// during `finish`.  Fails with `IllegalState` once any block has been
    /// emitted, or when an indexer is already attached.
    pub fn add_indexer<S: Write + Send + 'static>(&mut self, sink: S) -> Result<()> {
        if self.blocks_written > 0 {
            return Err(Error::illegal_state(
                "cannot attach an indexer after the first block was written",
            ));
        }
        if self.indexer.is_some() {
            return Err(Error::illegal_state("an indexer is already attached"));
        }
        self.indexer = Some(GziIndexer::new());
        self.index_sink = Some(Box::new(sink));
        Ok(())
    }

    /// Virtual offset of the next byte to be written: the address the next
    /// block will land at, paired with the staged byte count.
    pub fn virtual_position(&self) -> Result<VirtualOffset> {
        VirtualOffset::new(self.block_address, self.staging.len() as u16)
    }

    /// Force the staged bytes out as a short block.
    ///
    /// Dangerous: it creates a block boundary at a byte position the
    /// consumer did not anticipate, which defeats block-aligned seeking
    /// schemes layered on top.  A no-op when nothing is staged.
    pub fn flush_block(&mut self) -> Result<()> {
        self.emit_block()
    }

    /// Emit the remainder, the terminator block, and the index (when an
    /// indexer is attached), then return the underlying sink.
    pub fn finish(mut self) -> Result<W> {
        self.do_finish()?;
        self.inner
            .take()
            .ok_or_else(|| Error::illegal_state("writer already finished"))
    }

    fn inner_mut(&mut self) -> Result<&mut W> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::illegal_state("writer already finished"))
    }

    fn emit_block(&mut self) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let uncompressed = self.staging.len() as u32;
        let total = self.encoder.encode_into(&self.staging, &mut self.compressed)?;

        self.inner
            .as_mut()
            .ok_or_else(|| Error::illegal_state("writer already finished"))?
            .write_all(&self.compressed)?;
        if let Some(ix) = self.indexer.as_mut() {
            ix.add_block(self.block_address, uncompressed);
        }
        self.block_address += total as u64;
        self.blocks_written += 1;
        self.staging.clear();
        Ok(())
    }

    fn do_finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.emit_block()?;
        let inner = self.inner_mut()?;
        inner.write_all(&TERMINATOR_BLOCK)?;
        inner.flush()?;

        if let Some(ix) = self.indexer.take() {
            if let Some(mut sink) = self.index_sink.take() {
                ix.finish(&mut sink)?;
                sink.flush()?;
            }
        }
        self.finished = true;

        if let Some(path) = self.verify_path.take() {
            verify_terminated_file(&path)?;
        }
        Ok(())
    }
}

/// Confirm a just-written file ends with the terminator block.
fn verify_terminated_file(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;
    let len = file.seek(SeekFrom::End(0))?;
    let tail_len = TERMINATOR_BLOCK.len() as u64;
    if len < tail_len {
        return Err(Error::truncated(format!(
            "{}: file shorter than the terminator block",
            path.display()
        )));
    }
    file.seek(SeekFrom::End(-(tail_len as i64)))?;
    let mut tail = [0u8; TERMINATOR_BLOCK.len()];
    file.read_exact(&mut tail)?;
    if tail != TERMINATOR_BLOCK {
        return Err(Error::truncated(format!(
            "{}: terminator block missing after close",
            path.display()
        )));
    }
    Ok(())
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(io::ErrorKind::Other, "writer already finished"));
        }
        let mut written = 0;
        while written < buf.len() {
            let room = MAX_PAYLOAD_SIZE - self.staging.len();
            let n = room.min(buf.len() - written);
            self.staging.extend_from_slice(&buf[written..written + n]);
            written += n;
            if self.staging.len() == MAX_PAYLOAD_SIZE {
                self.emit_block().map_err(io::Error::from)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_block().map_err(io::Error::from)?;
        self.inner_mut().map_err(io::Error::from)?.flush()
    }
}

impl<W: Write> Drop for BgzfWriter<W> {
    fn drop(&mut self) {
        if !self.finished && self.inner.is_some() {
            if let Err(e) = self.do_finish() {
                log::error!("BgzfWriter dropped without finish; terminator write failed: {e}");
            }
        }
    }
}
