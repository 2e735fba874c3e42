//! Recent-search repository: the short list of peers the user looked up
//! lately, shown when the search panel opens.

use std::sync::Arc;

use estafette_shared::{Peer, RecentSearch};

use crate::error::Result;
use crate::keys;
use crate::store::StoreInner;

const PREFIX_RECENT: &str = "RECENT_SEARCH";

pub struct RecentSearches {
    inner: Arc<StoreInner>,
}

fn recent_key(team_id: i64, peer_id: i64, peer_type: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_RECENT);
    keys::push_i64(&mut k, team_id);
    keys::push_i64(&mut k, peer_id);
    keys::push_i32(&mut k, peer_type);
    k
}

fn recent_prefix(team_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_RECENT);
    keys::push_i64(&mut k, team_id);
    k
}

impl RecentSearches {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn put(&self, team_id: i64, entry: &RecentSearch) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.put(
                recent_key(team_id, entry.peer.id, entry.peer.kind.code()),
                bincode::serialize(entry)?,
            )?;
            Ok(())
        })
    }

    /// The team's recent searches, newest first.
    pub fn list(&self, team_id: i64, limit: i32) -> Result<Vec<RecentSearch>> {
        let prefix = recent_prefix(team_id);
        let mut out = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            match bincode::deserialize::<RecentSearch>(value) {
                Ok(entry) => out.push(entry),
                Err(err) => tracing::warn!(%err, "skipping undecodable recent search"),
            }
            true
        })?;
        out.sort_by_key(|e| std::cmp::Reverse(e.date));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    pub fn delete(&self, team_id: i64, peer: &Peer) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(recent_key(team_id, peer.id, peer.kind.code()))?;
            Ok(())
        })
    }

    pub fn clear(&self, team_id: i64) -> Result<()> {
        self.inner.engine.drop_prefix(&recent_prefix(team_id))
    }
}
