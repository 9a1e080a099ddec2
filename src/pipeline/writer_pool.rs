//! Shared worker pool multiplexing many batched writers.
//!
//! Each registered writer owns a bounded queue of pending items and a
//! flush threshold (`buff_size`).  When the queue reaches the threshold
//! and no flush is in flight, a flush job draining up to `buff_size` items
//! is scheduled on the shared pool.  At most one flush per writer runs at
//! a time, which is what guarantees the underlying sink observes items in
//! submission order; across different writers nothing is promised.
//!
//! A failure inside a flush is latched on its writer and re-raised on the
//! next `write` or `close`; after that the writer is closed and further
//! writes fail fast.  Only the owning producer calls `write` on a given
//! writer; registration and close are safe under concurrency (the pool
//! keeps a locked map of writer states).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};

/// Lock helper that shrugs off poisoning — a panicked flush job must not
/// wedge every other writer on the pool.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Batch-consuming sink under a pooled writer.
pub trait ItemSink<T>: Send {
    /// Consume one drained batch, in order.
    fn write_batch(&mut self, items: Vec<T>) -> Result<()>;

    /// Flush and release the sink.  Called exactly once.
    fn close(&mut self) -> Result<()>;
}

// ── Pool configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct WriterPoolConfig {
    threads: usize,
}

impl WriterPoolConfig {
    pub fn new(threads: u32) -> Result<Self> {
        if threads == 0 {
            return Err(Error::OutOfRange {
                what: "writer pool threads",
                value: 0,
                max: u64::from(u32::MAX),
            });
        }
        Ok(WriterPoolConfig {
            threads: threads as usize,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Default for WriterPoolConfig {
    fn default() -> Self {
        WriterPoolConfig {
            threads: num_cpus::get(),
        }
    }
}

// ── Per-writer state ─────────────────────────────────────────────────────────

struct WriterInner<T> {
    pending: VecDeque<T>,
    in_flight: bool,
    latched: Option<Error>,
    closed: bool,
}

struct WriterState<T> {
    inner: Mutex<WriterInner<T>>,
    cv: Condvar,
    sink: Mutex<Box<dyn ItemSink<T>>>,
    buff_size: usize,
    /// Bounded pending capacity; `write` blocks when reached.
    capacity: usize,
}

impl<T: Send + 'static> WriterState<T> {
    /// Drain up to `buff_size` items and schedule their flush.  Caller
    /// holds the inner lock and has verified no flush is in flight.
    fn schedule_flush(
        self: &Arc<Self>,
        inner: &mut WriterInner<T>,
        job_tx: &flume::Sender<Msg>,
    ) {
        let take = self.buff_size.min(inner.pending.len());
        if take == 0 {
            return;
        }
        let batch: Vec<T> = inner.pending.drain(..take).collect();
        inner.in_flight = true;

        let state = Arc::clone(self);
        let tx = job_tx.clone();
        let job = move || {
            let result = lock(&state.sink).write_batch(batch);
            let mut inner = lock(&state.inner);
            inner.in_flight = false;
            match result {
                Err(e) => inner.latched = Some(e),
                // Writers blocked on a full queue cannot schedule; chain
                // the next flush from here when the backlog warrants it.
                Ok(()) if inner.pending.len() >= state.buff_size && !inner.closed => {
                    state.schedule_flush(&mut inner, &tx);
                }
                Ok(()) => {}
            }
            state.cv.notify_all();
        };
        // Send fails only after the pool shut down; latch that as a
        // failure so the writer does not wait forever.
        if job_tx.send(Msg::Job(Box::new(job))).is_err() {
            inner.in_flight = false;
            inner.latched = Some(Error::illegal_state("writer pool is closed"));
        }
    }

    /// Spec'd close sequence: wait for the in-flight flush, drain the
    /// remainder, wait again, then close the sink.
    fn close_writer(self: &Arc<Self>, job_tx: &flume::Sender<Msg>) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return match inner.latched.take() {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        loop {
            while inner.in_flight {
                inner = match self.cv.wait(inner) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            if let Some(e) = inner.latched.take() {
                inner.closed = true;
                self.cv.notify_all();
                return Err(e);
            }
            if inner.pending.is_empty() {
                break;
            }
            self.schedule_flush(&mut inner, job_tx);
        }

        inner.closed = true;
        self.cv.notify_all();
        drop(inner);

        lock(&self.sink).close()
    }
}

trait PoolMember: Send + Sync {
    fn close_member(&self) -> Result<()>;
}

struct Member<T: Send + 'static> {
    state: Arc<WriterState<T>>,
    job_tx: flume::Sender<Msg>,
}

impl<T: Send + 'static> PoolMember for Member<T> {
    fn close_member(&self) -> Result<()> {
        self.state.close_writer(&self.job_tx)
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────────

enum Msg {
    Job(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

/// Fixed-size worker pool shared by many writers.
pub struct WriterPool {
    job_tx: flume::Sender<Msg>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    members: Mutex<HashMap<u64, Arc<dyn PoolMember>>>,
    next_id: AtomicU64,
}

impl WriterPool {
    pub fn new(config: WriterPoolConfig) -> Self {
        let (job_tx, job_rx) = flume::unbounded::<Msg>();
        let workers = (0..config.threads)
            .map(|i| {
                let rx = job_rx.clone();
                thread::Builder::new()
                    .name(format!("bgzkit-writer-{i}"))
                    .spawn(move || {
                        while let Ok(msg) = rx.recv() {
                            match msg {
                                Msg::Job(job) => job(),
                                Msg::Shutdown => break,
                            }
                        }
                    })
                    .unwrap_or_else(|_| {
                        let rx = job_rx.clone();
                        thread::spawn(move || {
                            while let Ok(msg) = rx.recv() {
                                match msg {
                                    Msg::Job(job) => job(),
                                    Msg::Shutdown => break,
                                }
                            }
                        })
                    })
            })
            .collect();
        WriterPool {
            job_tx,
            workers: Mutex::new(workers),
            members: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a sink and get its pooled writer handle.
    ///
    /// `buff_size` is the flush-batch threshold; the pending queue holds
    /// twice that before `write` blocks.
    pub fn register<T, K>(&self, sink: K, buff_size: u32) -> Result<PooledWriter<T>>
    where
        T: Send + 'static,
        K: ItemSink<T> + 'static,
    {
        if buff_size == 0 {
            return Err(Error::OutOfRange {
                what: "writer buff_size",
                value: 0,
                max: u64::from(u32::MAX),
            });
        }
        let buff_size = buff_size as usize;
        let state = Arc::new(WriterState {
            inner: Mutex::new(WriterInner {
                pending: VecDeque::with_capacity(buff_size),
                in_flight: false,
                latched: None,
                closed: false,
            }),
            cv: Condvar::new(),
            sink: Mutex::new(Box::new(sink)),
            buff_size,
            capacity: buff_size * 2,
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.members).insert(
            id,
            Arc::new(Member {
                state: state.clone(),
                job_tx: self.job_tx.clone(),
            }) as Arc<dyn PoolMember>,
        );

        Ok(PooledWriter {
            id,
            state,
            job_tx: self.job_tx.clone(),
        })
    }

    /// Close every registered writer, then shut the pool down.
    ///
    /// The first writer failure is reported; remaining writers are still
    /// closed and the workers are always joined.
    pub fn close(&self) -> Result<()> {
        let members: Vec<Arc<dyn PoolMember>> = lock(&self.members).drain().map(|(_, m)| m).collect();
        let mut first_err = None;
        for member in members {
            if let Err(e) = member.close_member() {
                first_err.get_or_insert(e);
            }
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for _ in &workers {
            let _ = self.job_tx.send(Msg::Shutdown);
        }
        for handle in workers {
            if handle.join().is_err() {
                first_err.get_or_insert(Error::Interrupted);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("writer pool dropped with failure: {e}");
        }
    }
}

// ── Writer handle ────────────────────────────────────────────────────────────

/// Handle for the single owning producer of one pooled writer.
pub struct PooledWriter<T: Send + 'static> {
    id: u64,
    state: Arc<WriterState<T>>,
    job_tx: flume::Sender<Msg>,
}

impl<T: Send + 'static> PooledWriter<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enqueue one item.  Blocks when the pending queue is full.  Raises a
    /// latched flush failure from an earlier batch; after that the writer
    /// is closed and writes fail fast.
    pub fn write(&mut self, item: T) -> Result<()> {
        let mut inner = lock(&self.state.inner);
        loop {
            if let Some(e) = inner.latched.take() {
                inner.closed = true;
                self.state.cv.notify_all();
                return Err(e);
            }
            if inner.closed {
                return Err(Error::illegal_state("writer is closed"));
            }
            if inner.pending.len() < self.state.capacity {
                break;
            }
            inner = match self.state.cv.wait(inner) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }

        inner.pending.push_back(item);
        if inner.pending.len() >= self.state.buff_size && !inner.in_flight {
            self.state.schedule_flush(&mut inner, &self.job_tx);
        }
        Ok(())
    }

    /// Flush everything pending and close the underlying sink.
    pub fn close(&mut self) -> Result<()> {
        self.state.close_writer(&self.job_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink recording batches into shared storage, optionally failing.
    struct RecordingSink {
        out: Arc<Mutex<Vec<u32>>>,
        closed: Arc<Mutex<bool>>,
        fail_after: Option<usize>,
        seen: usize,
    }

    impl ItemSink<u32> for RecordingSink {
        fn write_batch(&mut self, items: Vec<u32>) -> Result<()> {
            self.seen += items.len();
            if let Some(limit) = self.fail_after {
                if self.seen > limit {
                    return Err(Error::invalid_format("sink failure"));
                }
            }
            lock(&self.out).extend(items);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            *lock(&self.closed) = true;
            Ok(())
        }
    }

    fn sink(fail_after: Option<usize>) -> (RecordingSink, Arc<Mutex<Vec<u32>>>, Arc<Mutex<bool>>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        (
            RecordingSink {
                out: out.clone(),
                closed: closed.clone(),
                fail_after,
                seen: 0,
            },
            out,
            closed,
        )
    }

    #[test]
    fn single_writer_preserves_submission_order() {
        let pool = WriterPool::new(WriterPoolConfig::new(4).unwrap());
        let (s, out, closed) = sink(None);
        let mut w = pool.register(s, 16).unwrap();
        for i in 0..10_000u32 {
            w.write(i).unwrap();
        }
        w.close().unwrap();

        let got = lock(&out).clone();
        assert_eq!(got, (0..10_000).collect::<Vec<u32>>());
        assert!(*lock(&closed));
        pool.close().unwrap();
    }

    #[test]
    fn many_writers_share_the_pool() {
        let pool = WriterPool::new(WriterPoolConfig::new(2).unwrap());
        let mut writers = Vec::new();
        let mut outs = Vec::new();
        for _ in 0..8 {
            let (s, out, _) = sink(None);
            writers.push(pool.register(s, 8).unwrap());
            outs.push(out);
        }
        for i in 0..500u32 {
            for w in writers.iter_mut() {
                w.write(i).unwrap();
            }
        }
        pool.close().unwrap();
        for out in outs {
            assert_eq!(lock(&out).clone(), (0..500).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn flush_failure_latches_then_fails_fast() {
        let pool = WriterPool::new(WriterPoolConfig::new(1).unwrap());
        let (s, _, _) = sink(Some(4));
        let mut w = pool.register(s, 4).unwrap();

        // First batch of 4 succeeds, second fails inside the pool.
        for i in 0..8u32 {
            w.write(i).unwrap();
        }
        // Eventually a write (or close) surfaces the latched failure...
        let mut latched = None;
        for i in 8..10_000u32 {
            if let Err(e) = w.write(i) {
                latched = Some(e);
                break;
            }
        }
        let latched = match latched {
            Some(e) => e,
            None => w.close().unwrap_err(),
        };
        assert!(matches!(latched, Error::InvalidFormat(_)));

        // ...and afterwards the writer is closed.
        assert!(matches!(w.write(0), Err(Error::IllegalState(_))));
        let _ = pool.close();
    }

    #[test]
    fn pool_close_drains_all_writers() {
        let pool = WriterPool::new(WriterPoolConfig::default());
        let (s, out, closed) = sink(None);
        let mut w = pool.register(s, 64).unwrap();
        // Fewer than buff_size items: nothing flushed until close.
        for i in 0..10u32 {
            w.write(i).unwrap();
        }
        pool.close().unwrap();
        assert_eq!(lock(&out).clone(), (0..10).collect::<Vec<u32>>());
        assert!(*lock(&closed));
        // Writes after pool close fail fast.
        assert!(w.write(99).is_err());
    }

    #[test]
    fn zero_buff_size_rejected() {
        let pool = WriterPool::new(WriterPoolConfig::default());
        let (s, _, _) = sink(None);
        assert!(matches!(
            pool.register::<u32, _>(s, 0),
            Err(Error::OutOfRange { .. })
        ));
        pool.close().unwrap();
    }
}
