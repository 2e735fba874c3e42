//! Asynchronous batch flusher.
//!
//! Decouples a write from its slower, non-critical propagation into the
//! search index.  [`Flusher::enter`] enqueues and returns immediately; a
//! bounded worker pool drains the shared queue.  At any moment exactly one
//! worker is the listener: it claims the queue, accumulates entries until
//! the batch-size threshold is reached or the idle period elapses, then
//! releases the queue to the next worker *before* running the batch
//! function on what it collected.
//!
//! Guarantees: every entered value is eventually handed to the batch
//! function at least once while the process lives.  No ordering across
//! entries, no durability across a crash.  Batch functions must therefore
//! be idempotent upserts or deletes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

pub struct FlusherEntry<K, V> {
    pub key: K,
    pub value: V,
}

pub struct Flusher<K, V> {
    entries: Sender<FlusherEntry<K, V>>,
    running: Arc<AtomicUsize>,
}

impl<K, V> Flusher<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub fn new<F>(max_batch: usize, workers: usize, flush_period: Duration, batch_fn: F) -> Self
    where
        F: Fn(Vec<FlusherEntry<K, V>>) + Send + Sync + 'static,
    {
        let (tx, rx) = bounded::<FlusherEntry<K, V>>(max_batch);
        let rx = Arc::new(Mutex::new(rx));
        let batch_fn = Arc::new(batch_fn);
        let running = Arc::new(AtomicUsize::new(0));

        for i in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let batch_fn = Arc::clone(&batch_fn);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name(format!("flusher-{i}"))
                .spawn(move || worker(rx, batch_fn, running, max_batch, flush_period))
                .expect("spawning a flusher worker cannot fail");
        }

        Self {
            entries: tx,
            running,
        }
    }

    /// Enqueue a value for later processing.  Blocks only when the queue
    /// is at capacity (backpressure), never on the batch function.
    pub fn enter(&self, key: K, value: V) {
        let _ = self.entries.send(FlusherEntry { key, value });
    }

    /// Number of entries not yet claimed by a worker.
    pub fn pending_items(&self) -> usize {
        self.entries.len()
    }

    /// Number of workers currently collecting or running the batch function.
    pub fn running_jobs(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }
}

fn worker<K, V, F>(
    rx: Arc<Mutex<Receiver<FlusherEntry<K, V>>>>,
    batch_fn: Arc<F>,
    running: Arc<AtomicUsize>,
    max_batch: usize,
    flush_period: Duration,
) where
    F: Fn(Vec<FlusherEntry<K, V>>) + Send + Sync,
{
    loop {
        let mut items = Vec::new();
        let mut disconnected = false;
        {
            // Claim the listener slot.
            let rx = match rx.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            match rx.recv() {
                Ok(entry) => items.push(entry),
                Err(_) => return,
            }
            running.fetch_add(1, Ordering::Relaxed);
            let deadline = Instant::now() + flush_period;
            while items.len() < max_batch {
                match rx.recv_deadline(deadline) {
                    Ok(entry) => items.push(entry),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            // Guard drops here: the next worker starts listening while this
            // one is still flushing.
        }
        batch_fn(items);
        running.fetch_sub(1, Ordering::Relaxed);
        if disconnected {
            return;
        }
    }
}
