//! Transactional key-value engine wrapper.
//!
//! The [`Engine`] owns a RocksDB [`OptimisticTransactionDB`] and funnels
//! every repository mutation through [`Engine::update`], which retries
//! optimistic-concurrency conflicts with a small random backoff before
//! surfacing them.  No repository talks to the raw database directly.

use std::path::Path;
use std::time::Duration;

use rand::Rng;
use rocksdb::{
    Direction, ErrorKind, IteratorMode, MultiThreaded, OptimisticTransactionDB, Options,
    Transaction,
};

use crate::error::{Result, StoreError};

/// Transaction handle passed to `update`/`view` closures.
pub type Txn<'a> = Transaction<'a, OptimisticTransactionDB<MultiThreaded>>;

/// Bounded-attempt conflict retry policy.
///
/// Expressed as a value object so tests can tighten it to deterministic
/// settings instead of relying on a hard-coded loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Upper bound of the uniform random sleep between attempts.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            max_jitter: Duration::from_millis(10),
        }
    }
}

pub struct Engine {
    db: OptimisticTransactionDB<MultiThreaded>,
    policy: RetryPolicy,
}

impl Engine {
    pub fn open(path: &Path, low_memory: bool, policy: RetryPolicy) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        if low_memory {
            opts.set_write_buffer_size(4 << 20);
            opts.set_max_write_buffer_number(2);
            opts.set_max_open_files(64);
        }

        let db = OptimisticTransactionDB::open(&opts, path)?;
        Ok(Self { db, policy })
    }

    /// Run `f` inside a read-write transaction, committing on success.
    ///
    /// Conflicting commits are retried silently up to the policy's attempt
    /// budget; only after exhaustion does the caller see
    /// [`StoreError::Conflict`].  Non-conflict errors abort immediately and
    /// the transaction is rolled back.
    pub fn update<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Txn<'_>) -> Result<T>,
    {
        let mut rng = rand::thread_rng();
        for attempt in 0..self.policy.max_attempts {
            let txn = self.db.transaction();
            let out = f(&txn)?;
            match txn.commit() {
                Ok(()) => return Ok(out),
                Err(e) if is_conflict(&e) => {
                    tracing::debug!(attempt, "engine update conflict");
                }
                Err(e) => return Err(e.into()),
            }
            let jitter = rng.gen_range(Duration::ZERO..=self.policy.max_jitter);
            std::thread::sleep(jitter);
        }
        Err(StoreError::Conflict)
    }

    /// Run `f` against a read-only transaction.  The transaction is never
    /// committed; dropping it discards any accidental writes.
    pub fn view<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Txn<'_>) -> Result<T>,
    {
        let txn = self.db.transaction();
        f(&txn)
    }

    /// Iterate every live entry whose key starts with `prefix`, outside of
    /// any repository transaction.  Used by full-table aggregation and
    /// reindex scans; the callback returns `false` to stop early.
    pub fn scan_prefix<F>(&self, prefix: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if !f(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    /// Delete every entry whose key starts with `prefix`.
    pub fn drop_prefix(&self, prefix: &[u8]) -> Result<()> {
        self.update(|txn| {
            let mut doomed = Vec::new();
            let iter = txn.iterator(IteratorMode::From(prefix, Direction::Forward));
            for item in iter {
                let (key, _) = item?;
                if !key.starts_with(prefix) {
                    break;
                }
                doomed.push(key);
            }
            for key in doomed {
                txn.delete(&key)?;
            }
            Ok(())
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Rough (live data, memtable) size estimate in bytes.
    pub fn estimated_size(&self) -> (u64, u64) {
        let live = self
            .db
            .property_int_value("rocksdb.estimate-live-data-size")
            .ok()
            .flatten()
            .unwrap_or(0);
        let mem = self
            .db
            .property_int_value("rocksdb.size-all-mem-tables")
            .ok()
            .flatten()
            .unwrap_or(0);
        (live, mem)
    }

    /// Compact the whole key range.  Cheap to call occasionally; RocksDB
    /// does the real garbage collection in the background.
    pub fn compact(&self) {
        self.db.compact_range::<&[u8], &[u8]>(None, None);
    }
}

fn is_conflict(e: &rocksdb::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::MergeInProgress
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_engine(dir: &Path) -> Engine {
        Engine::open(dir, false, RetryPolicy::default()).expect("engine should open")
    }

    #[test]
    fn update_then_view_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_test_engine(dir.path());

        engine
            .update(|txn| {
                txn.put(b"k1", b"v1")?;
                txn.put(b"k2", b"v2")?;
                Ok(())
            })
            .unwrap();

        let v = engine
            .view(|txn| Ok(txn.get(b"k1")?))
            .unwrap()
            .expect("k1 should exist");
        assert_eq!(v, b"v1");
    }

    #[test]
    fn closure_error_aborts_without_committing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_test_engine(dir.path());

        let res: Result<()> = engine.update(|txn| {
            txn.put(b"ghost", b"x")?;
            Err(StoreError::NotFound)
        });
        assert!(matches!(res, Err(StoreError::NotFound)));

        let v = engine.view(|txn| Ok(txn.get(b"ghost")?)).unwrap();
        assert!(v.is_none());
    }

    #[test]
    fn scan_prefix_stays_inside_the_family() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_test_engine(dir.path());

        engine
            .update(|txn| {
                txn.put(b"A.1", b"a1")?;
                txn.put(b"A.2", b"a2")?;
                txn.put(b"B.1", b"b1")?;
                Ok(())
            })
            .unwrap();

        let mut seen = Vec::new();
        engine
            .scan_prefix(b"A.", |k, _| {
                seen.push(k.to_vec());
                true
            })
            .unwrap();
        assert_eq!(seen, vec![b"A.1".to_vec(), b"A.2".to_vec()]);
    }

    #[test]
    fn drop_prefix_removes_only_that_family() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_test_engine(dir.path());

        engine
            .update(|txn| {
                txn.put(b"A.1", b"a1")?;
                txn.put(b"B.1", b"b1")?;
                Ok(())
            })
            .unwrap();
        engine.drop_prefix(b"A.").unwrap();

        assert!(engine.view(|t| Ok(t.get(b"A.1")?)).unwrap().is_none());
        assert!(engine.view(|t| Ok(t.get(b"B.1")?)).unwrap().is_some());
    }
}
