//! The shared pileup skeleton and its two accumulation behaviors.
//!
//! The engine maintains two ordered queues:
//!
//! - *accumulator* — loci that may still receive contributions.  Its head
//!   always corresponds to the first aligned base of the next incoming
//!   record; positions in it are contiguous on one reference.
//! - *complete* — loci ready to emit.
//!
//! For each record: retire accumulator heads that precede the record's
//! start (interleaving zero-coverage loci from the mask when uncovered
//! emission is on), extend the accumulator through the record's span, then
//! fold the record's contributions in.  When the source drains, the
//! accumulator is flushed and the remaining masked positions are emitted.
//!
//! Emission is strictly increasing in (reference, position); a violation
//! means the input broke coordinate order or the engine state is
//! corrupted, and surfaces as `IllegalState` rather than silently wrong
//! output.

use std::collections::VecDeque;
use std::rc::Rc;

use super::mask::ReferenceMask;
use super::record::{AlignedRecord, CigarOp, RecordSource, SortOrder};
use super::{EdgeKind, Locus, LocusInfo, RecordAndOffset};
use crate::error::{Error, Result};

/// Accumulation behavior: one entry per aligned base, or one BEGIN/END
/// pair per alignment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PileupMode {
    PerBase,
    Edging,
}

/// Locus pileup over a coordinate-sorted record source.
pub struct LocusPileup<S: RecordSource> {
    source: S,
    mode: PileupMode,
    mask: Option<Box<dyn ReferenceMask>>,

    // Switches; the edging variant locks several of these.
    emit_uncovered: bool,
    include_indels: bool,
    include_non_pf: bool,
    quality_cutoff: u8,
    mapping_quality_cutoff: u8,
    max_depth_per_locus: usize,
    filters: Vec<Box<dyn Fn(&S::Record) -> bool>>,

    // Iteration state.
    started: bool,
    finished: bool,
    source_drained: bool,
    accumulator: VecDeque<LocusInfo<S::Record>>,
    complete: VecDeque<LocusInfo<S::Record>>,
    last_emitted: Option<Locus>,
    /// Uncovered-loci emission is settled up to and including this locus.
    mask_cursor: Locus,
    last_record_start: Option<Locus>,
    depth_warning_logged: bool,
}

impl<S: RecordSource> LocusPileup<S> {
    /// Per-base variant: every aligned base contributes an entry.
    pub fn per_base(source: S) -> Result<Self> {
        Self::with_mode(source, PileupMode::PerBase)
    }

    /// Edging variant: one BEGIN and one END per alignment block.
    pub fn edging(source: S) -> Result<Self> {
        Self::with_mode(source, PileupMode::Edging)
    }

    fn with_mode(source: S, mode: PileupMode) -> Result<Self> {
        match source.sort_order() {
            SortOrder::Coordinate => {}
            SortOrder::Unsorted | SortOrder::Unknown => {
                log::warn!(
                    "record source declares {:?} sort order; coordinate order is assumed",
                    source.sort_order()
                );
            }
            SortOrder::QueryName => {
                return Err(Error::illegal_state(
                    "record source is query-name sorted; the pileup requires coordinate order",
                ));
            }
        }
        Ok(LocusPileup {
            source,
            mode,
            mask: None,
            emit_uncovered: mode == PileupMode::Edging,
            include_indels: false,
            include_non_pf: false,
            quality_cutoff: 0,
            mapping_quality_cutoff: 0,
            max_depth_per_locus: usize::MAX,
            filters: vec![Box::new(|r: &S::Record| {
                r.is_duplicate() || r.is_secondary_or_supplementary()
            })],
            started: false,
            finished: false,
            source_drained: false,
            accumulator: VecDeque::new(),
            complete: VecDeque::new(),
            last_emitted: None,
            mask_cursor: Locus {
                reference_index: 0,
                position: 0,
            },
            last_record_start: None,
            depth_warning_logged: false,
        })
    }

    pub fn mode(&self) -> PileupMode {
        self.mode
    }

    // ── Configuration ────────────────────────────────────────────────────

    fn ensure_not_started(&self) -> Result<()> {
        if self.started {
            return Err(Error::illegal_state(
                "pileup configuration is frozen once iteration has begun",
            ));
        }
        Ok(())
    }

    fn ensure_per_base(&self, what: &'static str) -> Result<()> {
        if self.mode == PileupMode::Edging {
            return Err(Error::Unsupported(what));
        }
        Ok(())
    }

    /// Restrict (and, with uncovered emission, extend) reporting to the
    /// masked positions.
    pub fn set_mask(&mut self, mask: Box<dyn ReferenceMask>) -> Result<()> {
        self.ensure_not_started()?;
        self.mask = Some(mask);
        Ok(())
    }

    /// Emit zero-coverage loci for masked positions (per-base only; the
    /// edging variant always emits them).
    pub fn set_emit_uncovered_loci(&mut self, on: bool) -> Result<()> {
        self.ensure_not_started()?;
        self.ensure_per_base("uncovered-locus emission is fixed for the edging pileup")?;
        self.emit_uncovered = on;
        Ok(())
    }

    /// Track insertions and deletions in per-locus side lists (per-base
    /// only).
    pub fn set_include_indels(&mut self, on: bool) -> Result<()> {
        self.ensure_not_started()?;
        self.ensure_per_base("indel tracking is not supported by the edging pileup")?;
        self.include_indels = on;
        Ok(())
    }

    /// Minimum base quality for a base to contribute (per-base only).
    pub fn set_quality_cutoff(&mut self, cutoff: u8) -> Result<()> {
        self.ensure_not_started()?;
        self.ensure_per_base("base-quality filtering is fixed for the edging pileup")?;
        self.quality_cutoff = cutoff;
        Ok(())
    }

    /// Cap on entries per locus; once reached, further reads are dropped
    /// with a single warning (per-base only).
    pub fn set_max_depth_per_locus(&mut self, cap: usize) -> Result<()> {
        self.ensure_not_started()?;
        self.ensure_per_base("the per-locus cap is fixed for the edging pileup")?;
        self.max_depth_per_locus = cap;
        Ok(())
    }

    /// Minimum mapping quality for a record to contribute.
    pub fn set_mapping_quality_cutoff(&mut self, cutoff: u8) -> Result<()> {
        self.ensure_not_started()?;
        self.mapping_quality_cutoff = cutoff;
        Ok(())
    }

    /// Include reads that fail platform QC.
    pub fn set_include_non_pf_reads(&mut self, on: bool) -> Result<()> {
        self.ensure_not_started()?;
        self.include_non_pf = on;
        Ok(())
    }

    /// Add a record filter; records for which it returns true are skipped.
    pub fn add_record_filter(
        &mut self,
        filter: impl Fn(&S::Record) -> bool + 'static,
    ) -> Result<()> {
        self.ensure_not_started()?;
        self.filters.push(Box::new(filter));
        Ok(())
    }

    /// Remove all filters, including the default duplicate and
    /// secondary/supplementary filters.
    pub fn clear_record_filters(&mut self) -> Result<()> {
        self.ensure_not_started()?;
        self.filters.clear();
        Ok(())
    }

    // ── Iteration ────────────────────────────────────────────────────────

    /// Single-use iterator over the emitted loci.
    pub fn iter(&mut self) -> Result<PileupIter<'_, S>> {
        if self.started {
            return Err(Error::illegal_state("pileup can only be iterated once"));
        }
        self.started = true;
        Ok(PileupIter { pileup: self })
    }

    /// The next emitted locus, or `None` once drained.
    pub fn next_locus(&mut self) -> Result<Option<LocusInfo<S::Record>>> {
        self.started = true;
        loop {
            if let Some(li) = self.complete.pop_front() {
                if let Some(last) = self.last_emitted {
                    if li.locus() <= last {
                        return Err(Error::illegal_state(format!(
                            "pileup emitted {} after {}; emission must be strictly increasing",
                            li.locus(),
                            last
                        )));
                    }
                }
                self.last_emitted = Some(li.locus());
                return Ok(Some(li));
            }
            if self.finished {
                return Ok(None);
            }
            if !self.source_drained {
                match self.source.next_record()? {
                    Some(rec) => self.process_record(rec)?,
                    None => self.source_drained = true,
                }
                continue;
            }
            self.flush_accumulator();
            self.emit_tail_uncovered();
            self.finished = true;
        }
    }

    // ── Record processing ────────────────────────────────────────────────

    fn process_record(&mut self, rec: S::Record) -> Result<()> {
        let Some(ref_index) = rec.reference_index() else {
            return Ok(());
        };
        if !self.include_non_pf && rec.fails_platform_qc() {
            return Ok(());
        }
        if rec.mapping_quality() < self.mapping_quality_cutoff {
            return Ok(());
        }
        if self.filters.iter().any(|f| f(&rec)) {
            return Ok(());
        }
        if rec.cigar().is_empty() {
            return Ok(());
        }

        let start = rec.alignment_start();
        // A leading insertion is attributed to the position before the
        // alignment start, so the accumulator must reach back one locus.
        let effective_start = if self.include_indels
            && rec.cigar().starts_with_insertion()
            && start > 1
        {
            start - 1
        } else {
            start
        };
        let start_locus = Locus {
            reference_index: ref_index,
            position: effective_start,
        };

        // Order is checked on the true alignment start; the backstep is an
        // accumulator concern, not a sort-order one.
        let record_start = Locus {
            reference_index: ref_index,
            position: start,
        };
        if let Some(prev) = self.last_record_start {
            if record_start < prev {
                return Err(Error::illegal_state(format!(
                    "record {:?} at {} violates coordinate order (previous record started at {})",
                    rec.read_name(),
                    record_start,
                    prev
                )));
            }
        }
        self.last_record_start = Some(record_start);

        // Retire loci that can no longer receive contributions.
        while self
            .accumulator
            .front()
            .is_some_and(|head| head.locus() < start_locus)
        {
            if let Some(li) = self.accumulator.pop_front() {
                self.push_complete(li);
            }
        }

        let end = rec.alignment_end();
        let extend_to = match self.mode {
            // Edging needs one locus past the last covered position for
            // the END entries.
            PileupMode::Edging => end + 1,
            PileupMode::PerBase => end,
        };
        if extend_to >= effective_start {
            self.extend_accumulator(ref_index, effective_start, extend_to);
        }

        let rec = Rc::new(rec);
        match self.mode {
            PileupMode::PerBase => self.accumulate_bases(&rec),
            PileupMode::Edging => self.accumulate_edges(&rec),
        }
        Ok(())
    }

    fn extend_accumulator(&mut self, ref_index: u32, start: u32, end: u32) {
        let from = match self.accumulator.back() {
            Some(back) => {
                let tail = back.locus();
                debug_assert_eq!(tail.reference_index, ref_index);
                tail.position + 1
            }
            None => start,
        };
        for position in from..=end {
            self.accumulator.push_back(LocusInfo::new(Locus {
                reference_index: ref_index,
                position,
            }));
        }
    }

    fn accumulate_bases(&mut self, rec: &Rc<S::Record>) {
        let Some(head) = self.accumulator.front().map(|li| li.locus()) else {
            return;
        };
        for block in rec.alignment_blocks() {
            for i in 0..block.length {
                let ref_pos = block.reference_start + i;
                let read_offset = (block.read_start - 1 + i) as usize;
                // Records without stored qualities pass the cutoff.
                let quality = rec
                    .base_qualities()
                    .get(read_offset)
                    .copied()
                    .unwrap_or(u8::MAX);
                if quality < self.quality_cutoff {
                    continue;
                }
                if let Some(mask) = &self.mask {
                    if !mask.get(head.reference_index, ref_pos) {
                        continue;
                    }
                }
                let idx = (ref_pos - head.position) as usize;
                let Some(li) = self.accumulator.get_mut(idx) else {
                    debug_assert!(false, "accumulator does not span {ref_pos}");
                    continue;
                };
                if li.depth() >= self.max_depth_per_locus {
                    if !self.depth_warning_logged {
                        log::warn!(
                            "locus {} reached the {}-read accumulation cap; further reads are dropped",
                            li.locus(),
                            self.max_depth_per_locus
                        );
                        self.depth_warning_logged = true;
                    }
                    continue;
                }
                li.push_record(RecordAndOffset::PerBase {
                    record: rec.clone(),
                    read_offset,
                });
            }
        }
        if self.include_indels {
            self.accumulate_indels(rec, head);
        }
    }

    /// Indel attribution: an insertion belongs to the base just before it;
    /// a deletion spans every deleted position and carries the read offset
    /// of the preceding base.
    fn accumulate_indels(&mut self, rec: &Rc<S::Record>, head: Locus) {
        let mut read_off: usize = 0;
        let mut ref_pos: u32 = rec.alignment_start();
        for e in rec.cigar().elements() {
            match e.op {
                CigarOp::Insertion => {
                    if ref_pos > 1 {
                        let target = ref_pos - 1;
                        let masked_out = self
                            .mask
                            .as_ref()
                            .is_some_and(|m| !m.get(head.reference_index, target));
                        if !masked_out && target >= head.position {
                            let idx = (target - head.position) as usize;
                            if let Some(li) = self.accumulator.get_mut(idx) {
                                li.push_inserted(RecordAndOffset::PerBase {
                                    record: rec.clone(),
                                    read_offset: read_off,
                                });
                            }
                        }
                    }
                    read_off += e.len as usize;
                }
                CigarOp::Deletion => {
                    let preceding = read_off.saturating_sub(1);
                    for target in ref_pos..ref_pos + e.len {
                        let masked_out = self
                            .mask
                            .as_ref()
                            .is_some_and(|m| !m.get(head.reference_index, target));
                        if !masked_out && target >= head.position {
                            let idx = (target - head.position) as usize;
                            if let Some(li) = self.accumulator.get_mut(idx) {
                                li.push_deleted(RecordAndOffset::PerBase {
                                    record: rec.clone(),
                                    read_offset: preceding,
                                });
                            }
                        }
                    }
                    ref_pos += e.len;
                }
                op => {
                    if op.consumes_read() {
                        read_off += e.len as usize;
                    }
                    if op.consumes_reference() {
                        ref_pos += e.len;
                    }
                }
            }
        }
    }

    fn accumulate_edges(&mut self, rec: &Rc<S::Record>) {
        let Some(head) = self.accumulator.front().map(|li| li.locus()) else {
            return;
        };
        for block in rec.alignment_blocks() {
            let begin = block.reference_start;
            let last = begin + block.length - 1;
            let segments = match &self.mask {
                Some(m) => m.clip(head.reference_index, begin, last),
                None => vec![(begin, last)],
            };
            for (s, e) in segments {
                let shift = s - block.reference_start;
                let read_offset = (block.read_start - 1 + shift) as usize;
                let length = e - s + 1;

                let begin_idx = (s - head.position) as usize;
                if let Some(li) = self.accumulator.get_mut(begin_idx) {
                    li.push_record(RecordAndOffset::Edge {
                        record: rec.clone(),
                        read_offset,
                        length,
                        ref_position: s,
                        kind: EdgeKind::Begin,
                    });
                }
                // The END sits one past the last covered position, which
                // may fall outside the mask; it is emitted regardless so
                // every BEGIN keeps its pair.
                let end_idx = (e + 1 - head.position) as usize;
                if let Some(li) = self.accumulator.get_mut(end_idx) {
                    li.push_record(RecordAndOffset::Edge {
                        record: rec.clone(),
                        read_offset,
                        length,
                        ref_position: s,
                        kind: EdgeKind::End,
                    });
                }
            }
        }
    }

    // ── Emission ─────────────────────────────────────────────────────────

    fn push_complete(&mut self, li: LocusInfo<S::Record>) {
        self.interleave_uncovered_before(li.locus());
        let locus = li.locus();
        let keep = if li.is_empty() {
            self.emit_uncovered
                && self
                    .mask
                    .as_ref()
                    .is_some_and(|m| m.get(locus.reference_index, locus.position))
        } else {
            true
        };
        if self.mask_cursor < locus {
            self.mask_cursor = locus;
        }
        if keep {
            self.complete.push_back(li);
        }
    }

    /// Queue zero-coverage loci for masked positions between the cursor
    /// and `target` (exclusive).
    fn interleave_uncovered_before(&mut self, target: Locus) {
        if !self.emit_uncovered {
            return;
        }
        let Some(mask) = &self.mask else {
            return;
        };
        let mut cur = self.mask_cursor;
        while let Some(next) = mask.next_position(cur.reference_index, cur.position) {
            if next >= target {
                break;
            }
            self.complete.push_back(LocusInfo::new(next));
            cur = next;
        }
        if self.mask_cursor < cur {
            self.mask_cursor = cur;
        }
    }

    fn flush_accumulator(&mut self) {
        while let Some(li) = self.accumulator.pop_front() {
            self.push_complete(li);
        }
    }

    /// After the source drains: zero-coverage loci for the rest of the
    /// mask.
    fn emit_tail_uncovered(&mut self) {
        if !self.emit_uncovered {
            return;
        }
        let Some(mask) = &self.mask else {
            return;
        };
        let mut cur = self.mask_cursor;
        while let Some(next) = mask.next_position(cur.reference_index, cur.position) {
            self.complete.push_back(LocusInfo::new(next));
            cur = next;
        }
        self.mask_cursor = cur;
    }
}

/// Single-use iterator handle over a [`LocusPileup`].
pub struct PileupIter<'a, S: RecordSource> {
    pileup: &'a mut LocusPileup<S>,
}

impl<'a, S: RecordSource> Iterator for PileupIter<'a, S> {
    type Item = Result<LocusInfo<S::Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pileup.next_locus().transpose()
    }
}
