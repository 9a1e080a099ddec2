//! Reference masks — which positions the pileup reports on.
//!
//! A mask answers membership and next-member queries over (reference,
//! position) space.  [`IntervalMask`] is the usual concrete form, built
//! from 1-based inclusive intervals; [`WholeReferenceMask`] covers entire
//! sequences for whole-reference emission.

use std::collections::BTreeMap;

use super::Locus;

/// Membership oracle over reference positions.  Positions are 1-based.
pub trait ReferenceMask {
    fn get(&self, reference_index: u32, position: u32) -> bool;

    /// The first masked locus strictly after (reference_index, position),
    /// possibly on a later sequence; `None` once the mask is exhausted.
    fn next_position(&self, reference_index: u32, position: u32) -> Option<Locus>;

    /// Highest sequence index with any masked position.
    fn max_sequence_index(&self) -> Option<u32>;

    /// Highest masked position on any sequence.
    fn max_position(&self) -> Option<u32>;

    /// Maximal masked sub-ranges of `[start, end]` (inclusive) on one
    /// sequence, in order.  The default scans; indexed masks override
    /// with an overlap query.
    fn clip(&self, reference_index: u32, start: u32, end: u32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut run_start = None;
        for pos in start..=end {
            if self.get(reference_index, pos) {
                run_start.get_or_insert(pos);
            } else if let Some(s) = run_start.take() {
                out.push((s, pos - 1));
            }
        }
        if let Some(s) = run_start {
            out.push((s, end));
        }
        out
    }
}

// ── Interval mask ────────────────────────────────────────────────────────────

/// Mask backed by sorted, merged, 1-based inclusive intervals per
/// sequence.  Lookups are binary searches.
#[derive(Debug, Clone, Default)]
pub struct IntervalMask {
    intervals: BTreeMap<u32, Vec<(u32, u32)>>,
}

impl IntervalMask {
    /// Build from (reference_index, start, end) triples.  Overlapping and
    /// adjacent intervals are merged; empty intervals (end < start) are
    /// dropped.
    pub fn new(triples: impl IntoIterator<Item = (u32, u32, u32)>) -> Self {
        let mut by_ref: BTreeMap<u32, Vec<(u32, u32)>> = BTreeMap::new();
        for (r, s, e) in triples {
            if e >= s && s > 0 {
                by_ref.entry(r).or_default().push((s, e));
            }
        }
        for ivs in by_ref.values_mut() {
            ivs.sort_unstable();
            let mut merged: Vec<(u32, u32)> = Vec::with_capacity(ivs.len());
            for &(s, e) in ivs.iter() {
                match merged.last_mut() {
                    Some(last) if s <= last.1.saturating_add(1) => last.1 = last.1.max(e),
                    _ => merged.push((s, e)),
                }
            }
            *ivs = merged;
        }
        by_ref.retain(|_, v| !v.is_empty());
        IntervalMask { intervals: by_ref }
    }

    fn intervals_of(&self, reference_index: u32) -> &[(u32, u32)] {
        self.intervals
            .get(&reference_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl ReferenceMask for IntervalMask {
    fn get(&self, reference_index: u32, position: u32) -> bool {
        let ivs = self.intervals_of(reference_index);
        let i = ivs.partition_point(|&(s, _)| s <= position);
        i > 0 && ivs[i - 1].1 >= position
    }

    fn next_position(&self, reference_index: u32, position: u32) -> Option<Locus> {
        // Same sequence first.
        let ivs = self.intervals_of(reference_index);
        let i = ivs.partition_point(|&(_, e)| e <= position);
        if let Some(&(s, _)) = ivs.get(i) {
            return Some(Locus {
                reference_index,
                position: s.max(position + 1),
            });
        }
        // Then the first interval of any later sequence.
        self.intervals
            .range(reference_index + 1..)
            .next()
            .map(|(&r, ivs)| Locus {
                reference_index: r,
                position: ivs[0].0,
            })
    }

    fn max_sequence_index(&self) -> Option<u32> {
        self.intervals.keys().next_back().copied()
    }

    fn max_position(&self) -> Option<u32> {
        self.intervals
            .values()
            .filter_map(|ivs| ivs.last().map(|&(_, e)| e))
            .max()
    }

    fn clip(&self, reference_index: u32, start: u32, end: u32) -> Vec<(u32, u32)> {
        let ivs = self.intervals_of(reference_index);
        let mut out = Vec::new();
        // First interval that could overlap [start, end].
        let mut i = ivs.partition_point(|&(_, e)| e < start);
        while let Some(&(s, e)) = ivs.get(i) {
            if s > end {
                break;
            }
            out.push((s.max(start), e.min(end)));
            i += 1;
        }
        out
    }
}

// ── Whole-reference mask ─────────────────────────────────────────────────────

/// Every position of every sequence is masked; sequence `i` spans
/// 1..=lengths[i].
#[derive(Debug, Clone)]
pub struct WholeReferenceMask {
    lengths: Vec<u32>,
}

impl WholeReferenceMask {
    pub fn new(lengths: Vec<u32>) -> Self {
        WholeReferenceMask { lengths }
    }
}

impl ReferenceMask for WholeReferenceMask {
    fn get(&self, reference_index: u32, position: u32) -> bool {
        self.lengths
            .get(reference_index as usize)
            .is_some_and(|&len| position >= 1 && position <= len)
    }

    fn next_position(&self, reference_index: u32, position: u32) -> Option<Locus> {
        let mut r = reference_index;
        let mut pos = position;
        loop {
            let len = *self.lengths.get(r as usize)?;
            if pos < len {
                return Some(Locus {
                    reference_index: r,
                    position: pos + 1,
                });
            }
            r += 1;
            pos = 0;
        }
    }

    fn max_sequence_index(&self) -> Option<u32> {
        if self.lengths.is_empty() {
            None
        } else {
            Some(self.lengths.len() as u32 - 1)
        }
    }

    fn max_position(&self) -> Option<u32> {
        self.lengths.iter().copied().max()
    }
}
