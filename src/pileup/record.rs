//! Aligned-record collaborator contracts.
//!
//! The pileup engine consumes records through the [`AlignedRecord`] trait;
//! parsing them out of any particular container is someone else's job.  The
//! engine needs coordinates, a CIGAR, bases, qualities and a handful of
//! flags — reads and qualities are otherwise opaque.
//!
//! [`SimpleRecord`] is a plain owned implementation, enough to drive the
//! engine from synthesized data in tests and examples.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// ── CIGAR ────────────────────────────────────────────────────────────────────

/// One CIGAR operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarOp {
    /// M — alignment match or mismatch.
    AlnMatch,
    /// I — insertion to the reference.
    Insertion,
    /// D — deletion from the reference.
    Deletion,
    /// N — skipped reference region.
    Skip,
    /// S — soft clip.
    SoftClip,
    /// H — hard clip.
    HardClip,
    /// P — padding.
    Padding,
    /// = — sequence match.
    SeqMatch,
    /// X — sequence mismatch.
    SeqMismatch,
}

impl CigarOp {
    pub fn consumes_read(self) -> bool {
        matches!(
            self,
            CigarOp::AlnMatch
                | CigarOp::Insertion
                | CigarOp::SoftClip
                | CigarOp::SeqMatch
                | CigarOp::SeqMismatch
        )
    }

    pub fn consumes_reference(self) -> bool {
        matches!(
            self,
            CigarOp::AlnMatch
                | CigarOp::Deletion
                | CigarOp::Skip
                | CigarOp::SeqMatch
                | CigarOp::SeqMismatch
        )
    }

    /// True for operators whose bases align read to reference.
    pub fn is_alignment(self) -> bool {
        matches!(
            self,
            CigarOp::AlnMatch | CigarOp::SeqMatch | CigarOp::SeqMismatch
        )
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'M' => CigarOp::AlnMatch,
            'I' => CigarOp::Insertion,
            'D' => CigarOp::Deletion,
            'N' => CigarOp::Skip,
            'S' => CigarOp::SoftClip,
            'H' => CigarOp::HardClip,
            'P' => CigarOp::Padding,
            '=' => CigarOp::SeqMatch,
            'X' => CigarOp::SeqMismatch,
            _ => return None,
        })
    }

    pub fn as_char(self) -> char {
        match self {
            CigarOp::AlnMatch => 'M',
            CigarOp::Insertion => 'I',
            CigarOp::Deletion => 'D',
            CigarOp::Skip => 'N',
            CigarOp::SoftClip => 'S',
            CigarOp::HardClip => 'H',
            CigarOp::Padding => 'P',
            CigarOp::SeqMatch => '=',
            CigarOp::SeqMismatch => 'X',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CigarElement {
    pub len: u32,
    pub op: CigarOp,
}

/// An owned CIGAR string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cigar(Vec<CigarElement>);

impl Cigar {
    pub fn new(elements: Vec<CigarElement>) -> Self {
        Cigar(elements)
    }

    pub fn elements(&self) -> &[CigarElement] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Read bases consumed.
    pub fn read_length(&self) -> u32 {
        self.0
            .iter()
            .filter(|e| e.op.consumes_read())
            .map(|e| e.len)
            .sum()
    }

    /// Reference bases consumed.
    pub fn reference_length(&self) -> u32 {
        self.0
            .iter()
            .filter(|e| e.op.consumes_reference())
            .map(|e| e.len)
            .sum()
    }

    /// True when the first non-clip operator is an insertion.
    pub fn starts_with_insertion(&self) -> bool {
        for e in &self.0 {
            match e.op {
                CigarOp::Insertion => return true,
                CigarOp::SoftClip | CigarOp::HardClip => continue,
                _ => return false,
            }
        }
        false
    }
}

impl FromStr for Cigar {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut elements = Vec::new();
        let mut len: u32 = 0;
        let mut have_len = false;
        for c in s.chars() {
            if let Some(d) = c.to_digit(10) {
                len = len
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(d))
                    .ok_or_else(|| Error::invalid_format(format!("CIGAR length overflow in {s:?}")))?;
                have_len = true;
            } else {
                let op = CigarOp::from_char(c).ok_or_else(|| {
                    Error::invalid_format(format!("unknown CIGAR operator {c:?} in {s:?}"))
                })?;
                if !have_len || len == 0 {
                    return Err(Error::invalid_format(format!(
                        "CIGAR operator {c} without a positive length in {s:?}"
                    )));
                }
                elements.push(CigarElement { len, op });
                len = 0;
                have_len = false;
            }
        }
        if have_len {
            return Err(Error::invalid_format(format!(
                "trailing CIGAR length without operator in {s:?}"
            )));
        }
        Ok(Cigar(elements))
    }
}

impl fmt::Display for Cigar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.0 {
            write!(f, "{}{}", e.len, e.op.as_char())?;
        }
        Ok(())
    }
}

// ── Alignment blocks ─────────────────────────────────────────────────────────

/// A run of contiguously aligned bases.  All coordinates are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentBlock {
    pub read_start: u32,
    pub reference_start: u32,
    pub length: u32,
}

// ── Record contract ──────────────────────────────────────────────────────────

/// Coordinate-sorted aligned record, as the pileup engine sees it.
pub trait AlignedRecord {
    fn read_name(&self) -> &str;
    /// `None` for unmapped records.
    fn reference_index(&self) -> Option<u32>;
    /// 1-based leftmost aligned position.
    fn alignment_start(&self) -> u32;
    fn cigar(&self) -> &Cigar;
    fn read_bases(&self) -> &[u8];
    fn base_qualities(&self) -> &[u8];
    fn mapping_quality(&self) -> u8;
    fn is_negative_strand(&self) -> bool;
    fn fails_platform_qc(&self) -> bool;
    fn is_duplicate(&self) -> bool;
    fn is_secondary_or_supplementary(&self) -> bool;

    /// 1-based inclusive rightmost aligned position.
    fn alignment_end(&self) -> u32 {
        self.alignment_start() + self.cigar().reference_length().saturating_sub(1)
    }

    /// Contiguously aligned runs, derived from the CIGAR.
    fn alignment_blocks(&self) -> Vec<AlignmentBlock> {
        let mut blocks = Vec::new();
        let mut read_pos: u32 = 1;
        let mut ref_pos = self.alignment_start();
        for e in self.cigar().elements() {
            if e.op.is_alignment() {
                blocks.push(AlignmentBlock {
                    read_start: read_pos,
                    reference_start: ref_pos,
                    length: e.len,
                });
            }
            if e.op.consumes_read() {
                read_pos += e.len;
            }
            if e.op.consumes_reference() {
                ref_pos += e.len;
            }
        }
        blocks
    }
}

// ── Record source ────────────────────────────────────────────────────────────

/// Declared sort order of a record source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Coordinate,
    QueryName,
    Unsorted,
    Unknown,
}

/// Iterator-of-records collaborator.  The pileup engine requires
/// coordinate order and checks the declaration at construction.
pub trait RecordSource {
    type Record: AlignedRecord;

    fn sort_order(&self) -> SortOrder;
    fn next_record(&mut self) -> Result<Option<Self::Record>>;
}

// ── Plain implementations ────────────────────────────────────────────────────

/// Owned record, mostly for synthesized inputs.
#[derive(Debug, Clone)]
pub struct SimpleRecord {
    name: String,
    reference_index: Option<u32>,
    alignment_start: u32,
    cigar: Cigar,
    bases: Vec<u8>,
    qualities: Vec<u8>,
    mapping_quality: u8,
    negative_strand: bool,
    fails_qc: bool,
    duplicate: bool,
    secondary: bool,
}

impl SimpleRecord {
    /// A mapped record with uniform base quality 30 and mapping quality 60.
    pub fn new(
        name: &str,
        reference_index: u32,
        alignment_start: u32,
        cigar: &str,
        bases: &[u8],
    ) -> Result<Self> {
        let cigar: Cigar = cigar.parse()?;
        Ok(SimpleRecord {
            name: name.to_string(),
            reference_index: Some(reference_index),
            alignment_start,
            qualities: vec![30; bases.len()],
            bases: bases.to_vec(),
            cigar,
            mapping_quality: 60,
            negative_strand: false,
            fails_qc: false,
            duplicate: false,
            secondary: false,
        })
    }

    pub fn with_qualities(mut self, qualities: Vec<u8>) -> Self {
        self.qualities = qualities;
        self
    }

    pub fn with_mapping_quality(mut self, mapq: u8) -> Self {
        self.mapping_quality = mapq;
        self
    }

    pub fn with_negative_strand(mut self, negative: bool) -> Self {
        self.negative_strand = negative;
        self
    }

    pub fn with_fails_qc(mut self, fails: bool) -> Self {
        self.fails_qc = fails;
        self
    }

    pub fn with_duplicate(mut self, duplicate: bool) -> Self {
        self.duplicate = duplicate;
        self
    }

    pub fn with_secondary(mut self, secondary: bool) -> Self {
        self.secondary = secondary;
        self
    }
}

impl AlignedRecord for SimpleRecord {
    fn read_name(&self) -> &str {
        &self.name
    }

    fn reference_index(&self) -> Option<u32> {
        self.reference_index
    }

    fn alignment_start(&self) -> u32 {
        self.alignment_start
    }

    fn cigar(&self) -> &Cigar {
        &self.cigar
    }

    fn read_bases(&self) -> &[u8] {
        &self.bases
    }

    fn base_qualities(&self) -> &[u8] {
        &self.qualities
    }

    fn mapping_quality(&self) -> u8 {
        self.mapping_quality
    }

    fn is_negative_strand(&self) -> bool {
        self.negative_strand
    }

    fn fails_platform_qc(&self) -> bool {
        self.fails_qc
    }

    fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    fn is_secondary_or_supplementary(&self) -> bool {
        self.secondary
    }
}

/// In-memory record source with a declared sort order.
pub struct VecRecordSource<R> {
    records: std::vec::IntoIter<R>,
    sort_order: SortOrder,
}

impl<R: AlignedRecord> VecRecordSource<R> {
    pub fn coordinate_sorted(records: Vec<R>) -> Self {
        VecRecordSource {
            records: records.into_iter(),
            sort_order: SortOrder::Coordinate,
        }
    }

    pub fn with_sort_order(records: Vec<R>, sort_order: SortOrder) -> Self {
        VecRecordSource {
            records: records.into_iter(),
            sort_order,
        }
    }
}

impl<R: AlignedRecord> RecordSource for VecRecordSource<R> {
    type Record = R;

    fn sort_order(&self) -> SortOrder {
        self.sort_order
    }

    fn next_record(&mut self) -> Result<Option<R>> {
        Ok(self.records.next())
    }
}
