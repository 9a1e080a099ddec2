//! Process-wide worker pools.
//!
//! Two roles, per the crate's concurrency model:
//!
//! - **Blocking I/O** — one dedicated thread per stream, created on demand
//!   and retired when its stream closes ([`spawn_blocking`]).  Chaining all
//!   of a stream's read-aheads onto one thread is what enforces the
//!   single-writer discipline on the underlying byte source.
//! - **CPU transforms** — a fixed [`TransformPool`] sized to the machine,
//!   shared by every pipeline in the process.
//!
//! The process-wide default pool is owned by this module's registry: it is
//! lazily created on first use and can be swapped with
//! [`set_default_transform_pool`].  Components never reach for the registry
//! directly — they receive an [`Executors`] value at construction, which
//! merely defaults to it.

use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of CPU workers.
pub struct TransformPool {
    tx: flume::Sender<Job>,
    threads: usize,
}

impl TransformPool {
    /// Spawn `threads` workers (at least one).  Workers exit when the pool
    /// is dropped and its queue drains.
    pub fn new(threads: usize) -> Arc<Self> {
        let threads = threads.max(1);
        let (tx, rx) = flume::unbounded::<Job>();
        for _ in 0..threads {
            let rx = rx.clone();
            thread::spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            });
        }
        Arc::new(TransformPool { tx, threads })
    }

    /// Queue a job.  Jobs may execute in any order relative to each other.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        // Send only fails when every worker is gone, which means the
        // process is tearing down; the job is dropped with it.
        let _ = self.tx.send(Box::new(job));
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

/// Spawn a dedicated blocking-I/O thread.
pub fn spawn_blocking<T, F>(name: &str, f: F) -> JoinHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(f) {
        Ok(handle) => handle,
        // Name rejection is the only non-resource failure; retry unnamed.
        Err(_) => thread::spawn(f),
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

static DEFAULT_TRANSFORM: OnceLock<Mutex<Arc<TransformPool>>> = OnceLock::new();

fn registry() -> &'static Mutex<Arc<TransformPool>> {
    DEFAULT_TRANSFORM.get_or_init(|| Mutex::new(TransformPool::new(num_cpus::get())))
}

/// The process-wide default transform pool (lazily created, one CPU worker
/// per core).
pub fn default_transform_pool() -> Arc<TransformPool> {
    match registry().lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Replace the process-wide default pool.  Pipelines already constructed
/// keep the pool they were handed.
pub fn set_default_transform_pool(pool: Arc<TransformPool>) {
    match registry().lock() {
        Ok(mut guard) => *guard = pool,
        Err(poisoned) => *poisoned.into_inner() = pool,
    }
}

/// The worker-pool configuration handed to parallel components at
/// construction.
#[derive(Clone)]
pub struct Executors {
    pub(crate) transform: Arc<TransformPool>,
}

impl Executors {
    pub fn with_transform_pool(pool: Arc<TransformPool>) -> Self {
        Executors { transform: pool }
    }
}

impl Default for Executors {
    fn default() -> Self {
        Executors {
            transform: default_transform_pool(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn pool_runs_jobs_on_workers() {
        let pool = TransformPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = flume::unbounded();
        for _ in 0..32 {
            let counter = counter.clone();
            let tx = tx.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }
        for _ in 0..32 {
            rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn default_pool_is_shared_and_swappable() {
        let a = default_transform_pool();
        let b = default_transform_pool();
        assert!(Arc::ptr_eq(&a, &b));

        let replacement = TransformPool::new(1);
        set_default_transform_pool(replacement.clone());
        assert!(Arc::ptr_eq(&default_transform_pool(), &replacement));

        // Restore so other tests see a full-width pool.
        set_default_transform_pool(TransformPool::new(num_cpus::get()));
    }
}
