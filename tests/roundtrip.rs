//! End-to-end stream scenarios: write, reopen, seek, index.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use proptest::prelude::*;
use tempfile::tempdir;

use bgzkit::{
    build_index, check_termination, BgzfReader, BgzfWriter, CompressionLevel, GziIndex,
    TerminationState, VirtualOffset, MAX_PAYLOAD_SIZE, TERMINATOR_BLOCK,
};

#[test]
fn empty_stream() {
    // The 28-byte terminator alone is a complete, empty stream.
    let data = TERMINATOR_BLOCK.to_vec();

    let mut reader = BgzfReader::new(Cursor::new(data.clone()));
    assert_eq!(reader.virtual_position().unwrap(), VirtualOffset::ZERO);
    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&mut buf).unwrap(), 0);

    assert_eq!(
        check_termination(&mut Cursor::new(data)).unwrap(),
        TerminationState::HasTerminatorBlock
    );
}

#[test]
fn single_block_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hello.bgz");

    let mut writer = BgzfWriter::create(&path).unwrap();
    writer.write_all(b"Hello BGZF!").unwrap();
    writer.finish().unwrap();

    let total = File::open(&path).unwrap().metadata().unwrap().len();
    let block_size = total - TERMINATOR_BLOCK.len() as u64;

    let mut reader = BgzfReader::open(&path).unwrap();
    let mut restored = String::new();
    reader.read_to_string(&mut restored).unwrap();
    assert_eq!(restored, "Hello BGZF!");
    assert_eq!(
        reader.virtual_position().unwrap(),
        VirtualOffset::new(block_size, 0).unwrap()
    );
}

#[test]
fn two_block_seek_via_indexer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("two.bgz");
    let gzi_path = dir.path().join("two.bgz.gzi");

    // 70 000 bytes force two blocks: 65 280 + 4 720.
    let mut writer = BgzfWriter::create(&path).unwrap();
    writer.add_indexer(File::create(&gzi_path).unwrap()).unwrap();
    writer.write_all(&vec![0xa5u8; 70_000]).unwrap();
    writer.finish().unwrap();

    let index = GziIndex::from_path(&gzi_path).unwrap();
    assert_eq!(index.entries().len(), 1);
    let entry = index.entries()[0];
    assert_eq!(entry.uncompressed_offset, MAX_PAYLOAD_SIZE as u64);
    let second_block = entry.compressed_offset;

    let mut reader = BgzfReader::open(&path).unwrap();
    reader
        .seek_virtual(VirtualOffset::new(second_block, 17).unwrap())
        .unwrap();
    assert_eq!(reader.read_byte().unwrap(), Some(0xa5));
    assert_eq!(
        reader.virtual_position().unwrap(),
        VirtualOffset::new(second_block, 18).unwrap()
    );

    // The index maps logical offsets into the right blocks.
    assert_eq!(
        index.virtual_offset_for_seek(MAX_PAYLOAD_SIZE as u64).unwrap(),
        VirtualOffset::new(second_block, 0).unwrap()
    );
    assert_eq!(
        index.virtual_offset_for_seek(1000).unwrap(),
        VirtualOffset::new(0, 1000).unwrap()
    );
}

#[test]
fn incremental_index_equals_streamed_build() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("indexed.bgz");
    let gzi_path = dir.path().join("indexed.bgz.gzi");

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let mut writer = BgzfWriter::create(&path).unwrap();
    writer.add_indexer(File::create(&gzi_path).unwrap()).unwrap();
    writer.write_all(&payload).unwrap();
    writer.finish().unwrap();

    let incremental = GziIndex::from_path(&gzi_path).unwrap();
    let streamed = build_index(&mut File::open(&path).unwrap()).unwrap();
    assert_eq!(incremental, streamed);

    // Same bytes on disk too.
    let mut a = Vec::new();
    let mut b = Vec::new();
    incremental.write(&mut a).unwrap();
    streamed.write(&mut b).unwrap();
    assert_eq!(a, b);
}

#[test]
fn termination_flips_on_any_truncation() {
    let mut writer = BgzfWriter::new(Vec::new());
    writer.write_all(b"a healthy little stream").unwrap();
    let data = writer.finish().unwrap();

    assert_eq!(
        check_termination(&mut Cursor::new(data.clone())).unwrap(),
        TerminationState::HasTerminatorBlock
    );
    for cut in [1usize, 5, 27, 28, 30] {
        let short = data[..data.len() - cut].to_vec();
        let state = check_termination(&mut Cursor::new(short)).unwrap();
        assert_ne!(
            state,
            TerminationState::HasTerminatorBlock,
            "cut of {cut} bytes still reads as terminated"
        );
    }
}

#[test]
fn seek_roundtrip_through_gzi_lookup() {
    // Write enough for several blocks, then hop around via the index.
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut writer = BgzfWriter::new(Vec::new());
    writer.write_all(&payload).unwrap();
    let data = writer.finish().unwrap();

    let mut cursor = Cursor::new(data);
    let index = build_index(&mut cursor).unwrap();
    cursor.seek(SeekFrom::Start(0)).unwrap();
    let mut reader = BgzfReader::new(cursor);

    for logical in [0u64, 1, 65_279, 65_280, 65_281, 150_000, 199_999] {
        let v = index.virtual_offset_for_seek(logical).unwrap();
        reader.seek_virtual(v).unwrap();
        assert_eq!(
            reader.read_byte().unwrap(),
            Some(payload[logical as usize]),
            "logical offset {logical}"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn stream_roundtrip(
        payload in prop::collection::vec(any::<u8>(), 0..200_000),
        level in 0u32..=9,
        write_size in 1usize..100_000,
    ) {
        let mut writer = BgzfWriter::with_level(
            Vec::new(),
            CompressionLevel::new(level).unwrap(),
        );
        for chunk in payload.chunks(write_size.max(1)) {
            writer.write_all(chunk).unwrap();
        }
        let data = writer.finish().unwrap();
        prop_assert!(data.ends_with(&TERMINATOR_BLOCK));

        let mut reader = BgzfReader::new(Cursor::new(data));
        reader.set_verify_crc(true);
        let mut restored = Vec::new();
        reader.read_to_end(&mut restored).unwrap();
        prop_assert_eq!(restored, payload);
    }
}
