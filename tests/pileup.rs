//! Pileup engine scenarios and invariants over synthesized record sets.

use bgzkit::pileup::{
    AlignedRecord, IntervalMask, LocusPileup, SimpleRecord, VecRecordSource,
};

fn src(records: Vec<SimpleRecord>) -> VecRecordSource<SimpleRecord> {
    VecRecordSource::coordinate_sorted(records)
}

#[test]
fn one_read_ten_loci() {
    let rec = SimpleRecord::new("read1", 0, 100, "10M", b"ACGTACGTAC").unwrap();
    let mut pileup = LocusPileup::per_base(src(vec![rec])).unwrap();

    let mut count = 0;
    while let Some(li) = pileup.next_locus().unwrap() {
        assert_eq!(li.reference_index(), 0);
        assert_eq!(li.position(), 100 + count);
        assert_eq!(li.depth(), 1);
        assert_eq!(
            li.record_and_offsets()[0].read_offset() as u32,
            li.position() - 100
        );
        count += 1;
    }
    assert_eq!(count, 10);
}

#[test]
fn emission_strictly_increasing_and_base_conservation() {
    // A mixed pile of overlapping reads with assorted CIGARs.
    let records = vec![
        SimpleRecord::new("a", 0, 10, "20M", &[b'A'; 20]).unwrap(),
        SimpleRecord::new("b", 0, 15, "5M2D10M", &[b'C'; 15]).unwrap(),
        SimpleRecord::new("c", 0, 15, "3S12M", &[b'G'; 15]).unwrap(),
        SimpleRecord::new("d", 0, 40, "10M5N10M", &[b'T'; 20]).unwrap(),
        SimpleRecord::new("e", 1, 5, "8M", &[b'A'; 8]).unwrap(),
    ];
    let aligned_bases: usize = records
        .iter()
        .map(|r| {
            r.alignment_blocks()
                .iter()
                .map(|b| b.length as usize)
                .sum::<usize>()
        })
        .sum();

    let mut pileup = LocusPileup::per_base(src(records)).unwrap();
    let mut last = None;
    let mut total_entries = 0usize;
    while let Some(li) = pileup.next_locus().unwrap() {
        let locus = (li.reference_index(), li.position());
        if let Some(prev) = last {
            assert!(locus > prev, "{locus:?} after {prev:?}");
        }
        last = Some(locus);
        total_entries += li.depth();
    }
    // Every aligned base passing the (zero) cutoff contributes exactly one
    // entry somewhere.
    assert_eq!(total_entries, aligned_bases);
}

#[test]
fn interval_mask_bounds_reporting() {
    let records = vec![
        SimpleRecord::new("a", 0, 90, "30M", &[b'A'; 30]).unwrap(),
        SimpleRecord::new("b", 0, 200, "10M", &[b'C'; 10]).unwrap(),
    ];
    let mut pileup = LocusPileup::per_base(src(records)).unwrap();
    pileup
        .set_mask(Box::new(IntervalMask::new([(0, 100, 110)])))
        .unwrap();

    let mut positions = Vec::new();
    while let Some(li) = pileup.next_locus().unwrap() {
        positions.push(li.position());
        assert_eq!(li.depth(), 1);
    }
    // Read a covers 90..=119; only the masked window reports.  Read b is
    // entirely outside the mask.
    assert_eq!(positions, (100..=110).collect::<Vec<u32>>());
}

#[test]
fn uncovered_emission_fills_the_mask() {
    let records = vec![SimpleRecord::new("a", 0, 5, "3M", b"AAA").unwrap()];
    let mut pileup = LocusPileup::per_base(src(records)).unwrap();
    pileup
        .set_mask(Box::new(IntervalMask::new([(0, 1, 12)])))
        .unwrap();
    pileup.set_emit_uncovered_loci(true).unwrap();

    let mut got = Vec::new();
    while let Some(li) = pileup.next_locus().unwrap() {
        got.push((li.position(), li.depth()));
    }
    let expected: Vec<(u32, usize)> = (1..=12)
        .map(|p| (p, usize::from((5..=7).contains(&p))))
        .collect();
    assert_eq!(got, expected);
}

#[test]
fn edging_reconstructs_coverage() {
    use bgzkit::pileup::{EdgeKind, RecordAndOffset};

    let records = vec![
        SimpleRecord::new("a", 0, 10, "10M", &[b'A'; 10]).unwrap(),
        SimpleRecord::new("b", 0, 14, "10M", &[b'C'; 10]).unwrap(),
        SimpleRecord::new("c", 0, 30, "5M", &[b'G'; 5]).unwrap(),
    ];
    let mut pileup = LocusPileup::edging(src(records)).unwrap();

    // Integrate begins/ends back into a coverage profile.
    let mut events: Vec<(u32, i32)> = Vec::new();
    while let Some(li) = pileup.next_locus().unwrap() {
        for e in li.record_and_offsets() {
            if let RecordAndOffset::Edge { kind, .. } = e {
                let delta = match kind {
                    EdgeKind::Begin => 1,
                    EdgeKind::End => -1,
                };
                events.push((li.position(), delta));
            }
        }
    }

    let mut depth = 0;
    let mut profile = std::collections::BTreeMap::new();
    for (pos, delta) in events {
        depth += delta;
        profile.insert(pos, depth);
    }
    // Begins/ends balance out and the peaks are where reads overlap.
    assert_eq!(depth, 0);
    assert_eq!(profile[&10], 1);
    assert_eq!(profile[&14], 2);
    assert_eq!(profile[&20], 1);
    assert_eq!(profile[&24], 0);
    assert_eq!(profile[&30], 1);
    assert_eq!(profile[&35], 0);
}
