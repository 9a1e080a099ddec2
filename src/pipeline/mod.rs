//! Batched read-ahead/transform pipeline.
//!
//! Overlaps blocking I/O with CPU-bound transformation while preserving
//! source order.  The shape mirrors parallel block-gzip tools: one
//! dedicated reader thread pulls raw items from the source (serializing
//! all access to it), fans each item out to a shared CPU pool, and hands
//! the consumer a chain of per-item result channels slotted in submission
//! order.  Transforms finish in any order; the consumer observes them in
//! the order the source produced them.
//!
//! Work is grouped into *batches*: the reader accumulates items until
//! their reported sizes reach `batch_budget`, then publishes the batch.
//! The batch channel is bounded at `batches`, so that many batches are in
//! flight at most — the reader parks on the channel until the consumer
//! catches up.
//!
//! Cancellation is cooperative: `flush` raises a shared flag that both
//! roles test between items, then drains and discards everything in
//! flight.  Nothing is forcibly killed.  Lifecycle is the state machine
//! {Idle → Running → Draining → Closed} with Error absorbing; all flags
//! live in the one `phase` field rather than scattered booleans.

pub mod executors;
pub mod writer_pool;

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::block::{self, BlockDecoder};
use crate::deflate::Flate2Backend;
use crate::error::{Error, Result};

pub use executors::{
    default_transform_pool, set_default_transform_pool, Executors, TransformPool,
};
pub use writer_pool::{PooledWriter, WriterPool, WriterPoolConfig};

// ── Capabilities ─────────────────────────────────────────────────────────────

/// The blocking half of a pipeline: produce the next raw item.
///
/// The pipeline guarantees at most one concurrent invocation — the source
/// is owned by a single reader thread for as long as the pipeline runs.
pub trait ReadAhead: Send + 'static {
    type Raw: Send + 'static;

    /// Produce the next item and its size against the batch budget, or
    /// `None` at end of stream.  `budget` is the remaining batch budget,
    /// advisory for sources that can size their reads.
    fn read_ahead(&mut self, budget: usize) -> Result<Option<(Self::Raw, usize)>>;
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    batch_budget: usize,
    batches: usize,
}

impl PipelineConfig {
    /// `batch_budget`: bytes of raw items per batch.  `batches`: maximum
    /// batches in flight.  Both must be positive.
    pub fn new(batch_budget: u32, batches: u32) -> Result<Self> {
        if batch_budget == 0 {
            return Err(Error::OutOfRange {
                what: "batch budget",
                value: 0,
                max: u64::from(u32::MAX),
            });
        }
        if batches == 0 {
            return Err(Error::OutOfRange {
                what: "batch count",
                value: 0,
                max: u64::from(u32::MAX),
            });
        }
        Ok(PipelineConfig {
            batch_budget: batch_budget as usize,
            batches: batches as usize,
        })
    }

    pub fn batch_budget(&self) -> usize {
        self.batch_budget
    }

    pub fn batches(&self) -> usize {
        self.batches
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            // 128 KiB of raw input per batch, four batches in flight.
            batch_budget: 128 * 1024,
            batches: 4,
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Draining,
    Closed,
    Error,
}

enum Terminal {
    Eof,
    Failed(Error),
    Cancelled,
}

struct Batch<T> {
    /// Per-item result channels, in submission order.
    items: Vec<flume::Receiver<Result<T>>>,
    /// Present on the final batch of a run.
    terminal: Option<Terminal>,
}

struct Running<S, T> {
    batch_rx: flume::Receiver<Batch<T>>,
    current: VecDeque<flume::Receiver<Result<T>>>,
    terminal: Option<Terminal>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<S>,
}

/// Ordered async pipeline over a [`ReadAhead`] source and a transform
/// function.
pub struct AsyncPipeline<S: ReadAhead, T: Send + 'static> {
    source: Option<S>,
    transform: Arc<dyn Fn(S::Raw) -> Result<T> + Send + Sync>,
    config: PipelineConfig,
    executors: Executors,
    phase: Phase,
    running: Option<Running<S, T>>,
    eof_delivered: bool,
}

impl<S: ReadAhead, T: Send + 'static> AsyncPipeline<S, T> {
    pub fn new<F>(source: S, transform: F, config: PipelineConfig) -> Self
    where
        F: Fn(S::Raw) -> Result<T> + Send + Sync + 'static,
    {
        Self::with_executors(source, transform, config, Executors::default())
    }

    pub fn with_executors<F>(
        source: S,
        transform: F,
        config: PipelineConfig,
        executors: Executors,
    ) -> Self
    where
        F: Fn(S::Raw) -> Result<T> + Send + Sync + 'static,
    {
        AsyncPipeline {
            source: Some(source),
            transform: Arc::new(transform),
            config,
            executors,
            phase: Phase::Idle,
            running: None,
            eof_delivered: false,
        }
    }

    /// Enable async production and pre-schedule read-ahead.
    pub fn start(&mut self) -> Result<()> {
        match self.phase {
            Phase::Running => return Ok(()),
            Phase::Idle => {}
            Phase::Draining | Phase::Error => {
                return Err(Error::illegal_state(
                    "pipeline must be flushed before restarting",
                ));
            }
            Phase::Closed => {
                return Err(Error::illegal_state("end of stream already delivered"));
            }
        }
        let source = self
            .source
            .take()
            .ok_or_else(|| Error::illegal_state("pipeline source already taken"))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let (batch_tx, batch_rx) = flume::bounded(self.config.batches);
        let transform = self.transform.clone();
        let pool = self.executors.transform.clone();
        let budget = self.config.batch_budget;
        let cancel_for_reader = cancel.clone();

        log::debug!("pipeline start: budget={budget} batches={}", self.config.batches);
        let handle = executors::spawn_blocking("bgzkit-read-ahead", move || {
            run_read_ahead(source, budget, transform, pool, cancel_for_reader, batch_tx)
        });

        self.running = Some(Running {
            batch_rx,
            current: VecDeque::new(),
            terminal: None,
            cancel,
            handle,
        });
        self.phase = Phase::Running;
        Ok(())
    }

    /// Re-arm after `disable`/`flush`.  Fails once EOF has been delivered.
    pub fn enable(&mut self) -> Result<()> {
        if self.eof_delivered {
            return Err(Error::illegal_state("end of stream already delivered"));
        }
        self.start()
    }

    /// Stop scheduling further work.  In-flight tasks are not cancelled;
    /// their results are discarded by the next `flush`.
    pub fn disable(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.store(true, Ordering::Relaxed);
        }
        if self.phase == Phase::Running {
            self.phase = Phase::Draining;
        }
    }

    /// The next transformed item in source order, or `None` at end of
    /// stream.  Suspends until the head of the current batch is ready.
    /// An error raised inside read-ahead or transform is surfaced here and
    /// disables the pipeline until it is flushed and re-enabled.
    pub fn next_record(&mut self) -> Result<Option<T>> {
        match self.phase {
            Phase::Running => {}
            Phase::Closed => return Ok(None),
            Phase::Idle => return Err(Error::illegal_state("pipeline not started")),
            Phase::Draining => return Err(Error::illegal_state("pipeline disabled")),
            Phase::Error => {
                return Err(Error::illegal_state(
                    "pipeline disabled by an earlier failure",
                ));
            }
        }
        loop {
            enum Step<T> {
                Await(flume::Receiver<Result<T>>),
                Terminal(Terminal),
                NextBatch,
            }

            let step = {
                let running = self
                    .running
                    .as_mut()
                    .ok_or_else(|| Error::illegal_state("pipeline not started"))?;
                if let Some(rx) = running.current.pop_front() {
                    Step::Await(rx)
                } else if let Some(terminal) = running.terminal.take() {
                    Step::Terminal(terminal)
                } else {
                    Step::NextBatch
                }
            };

            match step {
                Step::Await(rx) => match rx.recv() {
                    Ok(Ok(item)) => return Ok(Some(item)),
                    Ok(Err(e)) => {
                        self.phase = Phase::Error;
                        return Err(e);
                    }
                    Err(_) => {
                        self.phase = Phase::Error;
                        return Err(Error::Interrupted);
                    }
                },
                Step::Terminal(Terminal::Eof) => {
                    self.eof_delivered = true;
                    self.reclaim_source()?;
                    self.phase = Phase::Closed;
                    return Ok(None);
                }
                Step::Terminal(Terminal::Failed(e)) => {
                    self.phase = Phase::Error;
                    return Err(e);
                }
                Step::Terminal(Terminal::Cancelled) => {
                    self.phase = Phase::Error;
                    return Err(Error::Cancelled);
                }
                Step::NextBatch => {
                    let running = self
                        .running
                        .as_mut()
                        .ok_or_else(|| Error::illegal_state("pipeline not started"))?;
                    match running.batch_rx.recv() {
                        Ok(batch) => {
                            running.current = batch.items.into();
                            running.terminal = batch.terminal;
                        }
                        Err(_) => {
                            self.phase = Phase::Error;
                            return Err(Error::Interrupted);
                        }
                    }
                }
            }
        }
    }

    /// Disable, wait for every in-flight task to finish, and discard their
    /// results.  Errors raised by discarded tasks are swallowed.  The
    /// pipeline returns to Idle (re-armable) unless EOF was already
    /// delivered.
    pub fn flush(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.cancel.store(true, Ordering::Relaxed);

        // Await every already-scheduled transform; results are dropped.
        for rx in running.current {
            let _ = rx.recv();
        }
        // Drain batches until the reader thread exits and the channel
        // disconnects.  Receiving also unparks a reader blocked on send.
        loop {
            match running.batch_rx.recv() {
                Ok(batch) => {
                    for rx in batch.items {
                        let _ = rx.recv();
                    }
                }
                Err(_) => break,
            }
        }

        match running.handle.join() {
            Ok(source) => self.source = Some(source),
            Err(_) => {
                self.phase = Phase::Error;
                return Err(Error::Interrupted);
            }
        }
        self.phase = if self.eof_delivered {
            Phase::Closed
        } else {
            Phase::Idle
        };
        log::debug!("pipeline flushed");
        Ok(())
    }

    /// Join the reader thread after a natural EOF and take the source back.
    fn reclaim_source(&mut self) -> Result<()> {
        if let Some(running) = self.running.take() {
            match running.handle.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => return Err(Error::Interrupted),
            }
        }
        Ok(())
    }

    /// Borrow the source; only possible while the pipeline is quiescent.
    pub fn source_mut(&mut self) -> Option<&mut S> {
        self.source.as_mut()
    }
}

fn run_read_ahead<S, T>(
    mut source: S,
    budget: usize,
    transform: Arc<dyn Fn(S::Raw) -> Result<T> + Send + Sync>,
    pool: Arc<TransformPool>,
    cancel: Arc<AtomicBool>,
    batch_tx: flume::Sender<Batch<T>>,
) -> S
where
    S: ReadAhead,
    T: Send + 'static,
{
    loop {
        let mut items = Vec::new();
        let mut used = 0usize;
        let mut terminal = None;

        while used < budget {
            if cancel.load(Ordering::Relaxed) {
                terminal = Some(Terminal::Cancelled);
                break;
            }
            match source.read_ahead(budget - used) {
                Ok(Some((raw, cost))) => {
                    let (tx, rx) = flume::bounded(1);
                    let transform = transform.clone();
                    let cancel = cancel.clone();
                    pool.execute(move || {
                        let result = if cancel.load(Ordering::Relaxed) {
                            Err(Error::Cancelled)
                        } else {
                            transform(raw)
                        };
                        let _ = tx.send(result);
                    });
                    items.push(rx);
                    used += cost.max(1);
                }
                Ok(None) => {
                    terminal = Some(Terminal::Eof);
                    break;
                }
                Err(e) => {
                    terminal = Some(Terminal::Failed(e));
                    break;
                }
            }
        }

        let stop = terminal.is_some();
        if batch_tx.send(Batch { items, terminal }).is_err() || stop {
            break;
        }
    }
    source
}

// ── BGZF composition ─────────────────────────────────────────────────────────

/// One compressed block read verbatim off the source.
pub struct RawBgzfBlock {
    pub address: u64,
    pub bytes: Vec<u8>,
}

/// One inflated block with its compressed address.
pub struct DecodedBgzfBlock {
    pub address: u64,
    pub payload: Vec<u8>,
}

/// [`ReadAhead`] over a BGZF byte source: each item is one complete raw
/// block, costed at its on-disk size.
pub struct BgzfBlockSource<R> {
    inner: R,
    address: u64,
}

impl<R: Read + Send + 'static> BgzfBlockSource<R> {
    pub fn new(inner: R) -> Self {
        BgzfBlockSource { inner, address: 0 }
    }
}

impl<R: Read + Send + 'static> ReadAhead for BgzfBlockSource<R> {
    type Raw = RawBgzfBlock;

    fn read_ahead(&mut self, _budget: usize) -> Result<Option<(RawBgzfBlock, usize)>> {
        let mut bytes = Vec::new();
        match block::read_raw_block(&mut self.inner, &mut bytes)? {
            Some(total) => {
                bytes.truncate(total);
                let address = self.address;
                self.address += total as u64;
                Ok(Some((RawBgzfBlock { address, bytes }, total)))
            }
            None => Ok(None),
        }
    }
}

/// Async decompressing block reader: a [`BgzfBlockSource`] whose transform
/// inflates on the CPU pool.  Blocks come back fully ordered, so the
/// `Read` impl presents the same byte stream a synchronous reader would.
pub struct AsyncBgzfReader<R: Read + Send + 'static> {
    pipeline: AsyncPipeline<BgzfBlockSource<R>, DecodedBgzfBlock>,
    current: Vec<u8>,
    pos: usize,
}

impl<R: Read + Send + 'static> AsyncBgzfReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, PipelineConfig::default(), false)
    }

    pub fn with_config(inner: R, config: PipelineConfig, verify_crc: bool) -> Self {
        let transform = move |raw: RawBgzfBlock| -> Result<DecodedBgzfBlock> {
            let mut decoder = BlockDecoder::new(&Flate2Backend);
            decoder.set_verify_crc(verify_crc);
            let payload = decoder.inflate_raw(&raw.bytes, None)?;
            Ok(DecodedBgzfBlock {
                address: raw.address,
                payload,
            })
        };
        AsyncBgzfReader {
            pipeline: AsyncPipeline::new(BgzfBlockSource::new(inner), transform, config),
            current: Vec::new(),
            pos: 0,
        }
    }

    /// The next inflated block in stream order; `None` after the final
    /// block.  Starts the pipeline on first use.
    pub fn next_block(&mut self) -> Result<Option<DecodedBgzfBlock>> {
        if self.pipeline.phase == Phase::Idle {
            self.pipeline.start()?;
        }
        self.pipeline.next_block_skipping_empty()
    }

    /// Quiesce in-flight work (see [`AsyncPipeline::flush`]).
    pub fn flush(&mut self) -> Result<()> {
        self.pipeline.flush()
    }
}

impl<R: Read + Send + 'static> Read for AsyncBgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            if self.pos >= self.current.len() {
                match self.next_block() {
                    Ok(Some(block)) => {
                        self.current = block.payload;
                        self.pos = 0;
                        continue;
                    }
                    Ok(None) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            let n = (buf.len() - total).min(self.current.len() - self.pos);
            buf[total..total + n].copy_from_slice(&self.current[self.pos..self.pos + n]);
            self.pos += n;
            total += n;
        }
        Ok(total)
    }
}

impl<R: Read + Send + 'static> AsyncPipeline<BgzfBlockSource<R>, DecodedBgzfBlock> {
    /// Skip zero-length blocks (flush artifacts and the terminator).
    fn next_block_skipping_empty(&mut self) -> Result<Option<DecodedBgzfBlock>> {
        loop {
            match self.next_record()? {
                Some(block) if block.payload.is_empty() => continue,
                other => return Ok(other),
            }
        }
    }
}
