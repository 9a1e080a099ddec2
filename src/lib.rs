//! # bgzkit — BGZF blocked-gzip toolkit
//!
//! Reading and writing the BGZF compressed stream used by high-throughput
//! sequencing formats, the ".gzi" offset index that makes it seekable, an
//! async harness that overlaps blocking I/O with CPU-bound block
//! transforms, and a locus pileup engine over coordinate-sorted aligned
//! records.
//!
//! Format guarantees:
//! - Every numeric wire field is little-endian; never negotiated
//! - Each block is an independent gzip member ≤ 64 KiB, self-describing
//!   via the "BC" extra subfield carrying its total size
//! - A clean stream ends with the fixed 28-byte terminator block; readers
//!   classify anything else as unterminated or truncated
//! - Virtual offsets pack (block address, in-block offset) into 64 bits
//!   whose integer order is the seek order
//! - The GZI index never stores the implicit (0, 0) entry and is strictly
//!   increasing in both coordinates
//! - Async pipelines deliver transformed items in source order, whatever
//!   order the CPU workers finish in

pub mod block;
pub mod deflate;
pub mod detect;
pub mod error;
pub mod gzi;
pub mod pileup;
pub mod pipeline;
pub mod reader;
pub mod voffset;
pub mod writer;

// Flat re-exports for the most common types.
pub use block::{
    BlockDecoder, BlockEncoder, DecodedBlock, MAX_BLOCK_SIZE, MAX_PAYLOAD_SIZE, TERMINATOR_BLOCK,
};
pub use deflate::{CompressionLevel, DeflateBackend, Flate2Backend};
pub use detect::{assert_terminated, check_termination, is_bgzf, TerminationState};
pub use error::{Error, Result};
pub use gzi::{build_index, GziIndex, GziIndexer};
pub use pileup::{LocusInfo, LocusPileup, RecordAndOffset};
pub use pipeline::{
    AsyncBgzfReader, AsyncPipeline, Executors, PipelineConfig, PooledWriter, ReadAhead, WriterPool,
    WriterPoolConfig,
};
pub use reader::BgzfReader;
pub use voffset::VirtualOffset;
pub use writer::BgzfWriter;
