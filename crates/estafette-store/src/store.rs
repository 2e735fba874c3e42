//! Store lifecycle and wiring.
//!
//! [`Store`] owns the three physical stores (RocksDB engine, redb sorted
//! index, tantivy search directories) plus the indexing flushers, and hands
//! out per-entity repositories that share the same handles.  It replaces
//! the process-wide singleton of older designs: construct it once, clone
//! it freely, pass it where needed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;

use crate::account::Account;
use crate::dialogs::Dialogs;
use crate::engine::{Engine, RetryPolicy};
use crate::error::{Result, StoreError};
use crate::files::Files;
use crate::flusher::{Flusher, FlusherEntry};
use crate::gifs::Gifs;
use crate::groups::Groups;
use crate::index::SortedIndex;
use crate::labels::Labels;
use crate::messages::Messages;
use crate::pending::PendingMessages;
use crate::reactions::Reactions;
use crate::recent::RecentSearches;
use crate::search::{wait_until, MessageDoc, MessageIndex, PeerDoc, PeerIndex, SearchSlot};
use crate::system::System;
use crate::teams::Teams;
use crate::top_peers::TopPeers;
use crate::users::Users;
use crate::wallpapers::Wallpapers;

const FLUSH_BATCH: usize = 1000;
const FLUSH_WORKERS: usize = 1;
const FLUSH_PERIOD: Duration = Duration::from_millis(1);

/// Open-time configuration.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Trade throughput for a smaller memory footprint (mobile targets).
    pub low_memory: bool,
    /// Conflict retry policy for the transactional engine.
    pub retry: RetryPolicy,
}

pub(crate) struct StoreInner {
    pub(crate) root: PathBuf,
    pub(crate) engine: Engine,
    pub(crate) index: SortedIndex,
    pub(crate) msg_search: Arc<SearchSlot<MessageIndex>>,
    pub(crate) peer_search: Arc<SearchSlot<PeerIndex>>,
    pub(crate) msg_indexer: Flusher<String, MessageDoc>,
    pub(crate) msg_remover: Flusher<String, ()>,
    pub(crate) peer_indexer: Flusher<String, PeerDoc>,
    pub(crate) peer_remover: Flusher<String, ()>,
    self_user_id: AtomicI64,
}

impl StoreInner {
    pub(crate) fn self_user_id(&self) -> i64 {
        self.self_user_id.load(Ordering::Relaxed)
    }
}

/// Handle to the local store.  Cheap to clone; all clones share the same
/// underlying engines.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open (or create) the store in the platform data directory.
    pub fn open(options: StoreOptions) -> Result<Self> {
        let dirs =
            ProjectDirs::from("com", "estafette", "estafette").ok_or(StoreError::NoDataDir)?;
        Self::open_at(&dirs.data_dir().join("store"), options)
    }

    /// Open (or create) the store at an explicit root directory.  Used by
    /// tests and custom layouts.
    pub fn open_at(root: &Path, options: StoreOptions) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        tracing::info!(root = %root.display(), "opening store");

        let engine = Engine::open(&root.join("engine"), options.low_memory, options.retry)?;
        let index = SortedIndex::open(&root.join("index").join("sorted.redb"))?;

        for dir in ["audio", "video", "photo", "file", "cache"] {
            std::fs::create_dir_all(root.join(dir))?;
        }

        let msg_search: Arc<SearchSlot<MessageIndex>> = Arc::new(SearchSlot::new(None));
        let peer_search: Arc<SearchSlot<PeerIndex>> = Arc::new(SearchSlot::new(None));

        // Search indexes open in the background; writers that outrun them
        // wait inside the flusher, never on the caller's thread.
        spawn_index_opener(
            "msg",
            root.join("searchdb").join("msg"),
            Arc::clone(&msg_search),
            MessageIndex::open,
        );
        spawn_index_opener(
            "peer",
            root.join("searchdb").join("peer"),
            Arc::clone(&peer_search),
            PeerIndex::open,
        );

        let msg_indexer = {
            let slot = Arc::clone(&msg_search);
            Flusher::new(
                FLUSH_BATCH,
                FLUSH_WORKERS,
                FLUSH_PERIOD,
                move |items: Vec<FlusherEntry<String, MessageDoc>>| {
                    if !await_slot(&slot) {
                        tracing::warn!(dropped = items.len(), "message index never came up");
                        return;
                    }
                    let guard = read_slot(&slot);
                    if let Some(ix) = guard.as_ref() {
                        let docs = items.into_iter().map(|e| (e.key, e.value)).collect();
                        if let Err(err) = ix.index_batch(docs) {
                            tracing::warn!(%err, "message indexer got error");
                        }
                    }
                },
            )
        };
        let msg_remover = {
            let slot = Arc::clone(&msg_search);
            Flusher::new(
                FLUSH_BATCH,
                FLUSH_WORKERS,
                FLUSH_PERIOD,
                move |items: Vec<FlusherEntry<String, ()>>| {
                    if !await_slot(&slot) {
                        return;
                    }
                    let guard = read_slot(&slot);
                    if let Some(ix) = guard.as_ref() {
                        let keys = items.into_iter().map(|e| e.key).collect();
                        if let Err(err) = ix.delete_batch(keys) {
                            tracing::warn!(%err, "message index remover got error");
                        }
                    }
                },
            )
        };
        let peer_indexer = {
            let slot = Arc::clone(&peer_search);
            Flusher::new(
                FLUSH_BATCH,
                FLUSH_WORKERS,
                FLUSH_PERIOD,
                move |items: Vec<FlusherEntry<String, PeerDoc>>| {
                    if !await_slot(&slot) {
                        tracing::warn!(dropped = items.len(), "peer index never came up");
                        return;
                    }
                    let guard = read_slot(&slot);
                    if let Some(ix) = guard.as_ref() {
                        let docs = items.into_iter().map(|e| (e.key, e.value)).collect();
                        if let Err(err) = ix.index_batch(docs) {
                            tracing::warn!(%err, "peer indexer got error");
                        }
                    }
                },
            )
        };
        let peer_remover = {
            let slot = Arc::clone(&peer_search);
            Flusher::new(
                FLUSH_BATCH,
                FLUSH_WORKERS,
                FLUSH_PERIOD,
                move |items: Vec<FlusherEntry<String, ()>>| {
                    if !await_slot(&slot) {
                        return;
                    }
                    let guard = read_slot(&slot);
                    if let Some(ix) = guard.as_ref() {
                        let keys = items.into_iter().map(|e| e.key).collect();
                        if let Err(err) = ix.delete_batch(keys) {
                            tracing::warn!(%err, "peer index remover got error");
                        }
                    }
                },
            )
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                root: root.to_path_buf(),
                engine,
                index,
                msg_search,
                peer_search,
                msg_indexer,
                msg_remover,
                peer_indexer,
                peer_remover,
                self_user_id: AtomicI64::new(0),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Repositories
    // ------------------------------------------------------------------

    pub fn dialogs(&self) -> Dialogs {
        Dialogs::new(Arc::clone(&self.inner))
    }

    pub fn messages(&self) -> Messages {
        Messages::new(Arc::clone(&self.inner))
    }

    pub fn pending_messages(&self) -> PendingMessages {
        PendingMessages::new(Arc::clone(&self.inner))
    }

    pub fn labels(&self) -> Labels {
        Labels::new(Arc::clone(&self.inner))
    }

    pub fn users(&self) -> Users {
        Users::new(Arc::clone(&self.inner))
    }

    pub fn groups(&self) -> Groups {
        Groups::new(Arc::clone(&self.inner))
    }

    pub fn files(&self) -> Files {
        Files::new(Arc::clone(&self.inner))
    }

    pub fn gifs(&self) -> Gifs {
        Gifs::new(Arc::clone(&self.inner))
    }

    pub fn teams(&self) -> Teams {
        Teams::new(Arc::clone(&self.inner))
    }

    pub fn top_peers(&self) -> TopPeers {
        TopPeers::new(Arc::clone(&self.inner))
    }

    pub fn wallpapers(&self) -> Wallpapers {
        Wallpapers::new(Arc::clone(&self.inner))
    }

    pub fn recent_searches(&self) -> RecentSearches {
        RecentSearches::new(Arc::clone(&self.inner))
    }

    pub fn system(&self) -> System {
        System::new(Arc::clone(&self.inner))
    }

    pub fn account(&self) -> Account {
        Account::new(Arc::clone(&self.inner))
    }

    pub fn reactions(&self) -> Reactions {
        Reactions::new(Arc::clone(&self.inner))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Record the acting user; unread/mention ownership checks depend on it.
    pub fn set_self_user_id(&self, user_id: i64) {
        self.inner.self_user_id.store(user_id, Ordering::Relaxed);
    }

    pub fn self_user_id(&self) -> i64 {
        self.inner.self_user_id.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.inner.root
    }

    /// Flush and compact the engine.  Safe to call at any time.
    pub fn gc(&self) -> Result<()> {
        self.inner.engine.flush()?;
        self.inner.engine.compact();
        tracing::info!("store GC executed");
        Ok(())
    }

    /// Rough (live data, memtables) engine size estimate in bytes.
    pub fn db_size(&self) -> (u64, u64) {
        self.inner.engine.estimated_size()
    }

    /// Close everything and delete the store root.  All three physical
    /// stores go together; deleting only one would leave the others
    /// referencing documents that no longer exist.
    pub fn drop_all(self) -> Result<()> {
        self.set_self_user_id(0);
        let root = self.inner.root.clone();
        {
            let mut guard = self
                .inner
                .msg_search
                .write()
                .unwrap_or_else(|p| p.into_inner());
            *guard = None;
        }
        {
            let mut guard = self
                .inner
                .peer_search
                .write()
                .unwrap_or_else(|p| p.into_inner());
            *guard = None;
        }
        drop(self);

        let mut last = None;
        for _ in 0..50 {
            match std::fs::remove_dir_all(&root) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    last = Some(e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
        Err(last.expect("loop ran at least once").into())
    }
}

fn spawn_index_opener<T, F>(name: &'static str, dir: PathBuf, slot: Arc<SearchSlot<T>>, open: F)
where
    T: Send + Sync + 'static,
    F: Fn(&Path) -> tantivy::Result<T> + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("search-open-{name}"))
        .spawn(move || {
            let ok = wait_until(10, Duration::from_millis(100), || match open(&dir) {
                Ok(ix) => {
                    let mut guard = slot.write().unwrap_or_else(|p| p.into_inner());
                    *guard = Some(ix);
                    true
                }
                Err(err) => {
                    tracing::warn!(name, %err, "error opening search index");
                    false
                }
            });
            if ok {
                tracing::info!(name, "search index initialized");
            }
        })
        .expect("spawning the search opener cannot fail");
}

fn await_slot<T>(slot: &Arc<SearchSlot<T>>) -> bool {
    wait_until(100, Duration::from_secs(1), || {
        read_slot(slot).is_some()
    })
}

fn read_slot<T>(slot: &Arc<SearchSlot<T>>) -> std::sync::RwLockReadGuard<'_, Option<T>> {
    slot.read().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).expect("should open");
        store.set_self_user_id(42);
        assert_eq!(store.self_user_id(), 42);
        assert!(store.path().join("engine").exists());
        assert!(store.path().join("index").join("sorted.redb").exists());
    }

    #[test]
    fn drop_all_removes_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let store = Store::open_at(&root, StoreOptions::default()).unwrap();
        store.system().save_string("conn-info", "state").unwrap();
        store.drop_all().unwrap();
        assert!(!root.exists());
    }
}
