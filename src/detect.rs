//! Stream sniffing and end-of-stream classification.
//!
//! Two independent questions about a byte source:
//!
//! 1. Does it look like BGZF at all?  [`is_bgzf`] answers from the first
//!    18 bytes without consuming meaning from the rest.
//! 2. Is it complete?  [`check_termination`] classifies the tail of a
//!    finite seekable source.  A clean stream ends with the 28-byte
//!    terminator block; a stream whose final block is structurally whole
//!    but not the terminator was likely produced by a writer that died
//!    before `finish`; anything else is a truncation.
//!
//! Verdicts are values, not errors — corruption is an answer here, not a
//! failure.  [`assert_terminated`] upgrades `Defective` to
//! `Error::Truncated` for callers that require a complete stream.

use std::io::{Read, Seek, SeekFrom};

use crate::block::{self, BGZF_HEADER_SIZE, TERMINATOR_BLOCK};
use crate::error::{Error, Result};

/// Verdict on the tail of a finite BGZF source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    /// The stream ends with the terminator block.
    HasTerminatorBlock,
    /// Every block is structurally complete but the last one is not the
    /// terminator.
    HasHealthyLastBlock,
    /// The final block is cut short, or the stream is not block-shaped.
    Defective,
}

impl TerminationState {
    pub fn is_terminated(self) -> bool {
        matches!(self, TerminationState::HasTerminatorBlock)
    }
}

/// Quick sniff: do the first 18 bytes carry the BGZF header shape?
///
/// Consumes up to one header from `source`; callers that need to keep
/// their position should hand in a rewindable source and reset it
/// themselves.
pub fn is_bgzf<R: Read>(source: &mut R) -> Result<bool> {
    let mut header = [0u8; BGZF_HEADER_SIZE];
    let mut got = 0;
    while got < header.len() {
        let n = source.read(&mut header[got..])?;
        if n == 0 {
            return Ok(false);
        }
        got += n;
    }
    Ok(block::parse_header(&header).is_ok())
}

/// Classify the tail of a finite seekable source.
///
/// The fast path inspects only the final 28 bytes.  When they are not the
/// terminator, the source is walked from the start so a mid-stream cut is
/// not mistaken for a merely unterminated file.  The source's position is
/// left unspecified.
pub fn check_termination<R: Read + Seek>(source: &mut R) -> Result<TerminationState> {
    let len = source.seek(SeekFrom::End(0))?;
    if len < TERMINATOR_BLOCK.len() as u64 {
        return Ok(TerminationState::Defective);
    }

    let mut tail = [0u8; TERMINATOR_BLOCK.len()];
    source.seek(SeekFrom::End(-(TERMINATOR_BLOCK.len() as i64)))?;
    source.read_exact(&mut tail)?;
    if tail == TERMINATOR_BLOCK {
        return Ok(TerminationState::HasTerminatorBlock);
    }

    // No terminator.  Walk the block headers to decide whether the final
    // block is at least whole.
    source.seek(SeekFrom::Start(0))?;
    let mut pos = 0u64;
    loop {
        let mut header = [0u8; BGZF_HEADER_SIZE];
        let mut got = 0;
        while got < header.len() {
            match source.read(&mut header[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) => return Err(e.into()),
            }
        }
        if got == 0 {
            // Previous block ended exactly at EOF.
            return Ok(TerminationState::HasHealthyLastBlock);
        }
        if got < BGZF_HEADER_SIZE {
            return Ok(TerminationState::Defective);
        }
        let total = match block::parse_header(&header) {
            Ok(t) => t as u64,
            Err(_) => return Ok(TerminationState::Defective),
        };
        if pos + total > len {
            return Ok(TerminationState::Defective);
        }
        pos += total;
        source.seek(SeekFrom::Start(pos))?;
    }
}

/// Require a terminated stream; `Defective` becomes `Error::Truncated`
/// naming the source.
pub fn assert_terminated<R: Read + Seek>(source: &mut R, source_name: &str) -> Result<()> {
    match check_termination(source)? {
        TerminationState::Defective => Err(Error::truncated(format!(
            "{source_name}: no terminator block and final block incomplete"
        ))),
        _ => Ok(()),
    }
}
