//! Top-peer repository.
//!
//! Tracks how often the user interacts with each peer, per category, and
//! serves the "frequently contacted" suggestion lists.  Rates live in a
//! numeric secondary index per category; each interaction adds an
//! exponentially time-weighted increment, so recent activity dominates
//! without ever rescanning history.

use std::sync::Arc;

use estafette_shared::{Peer, PeerType, TopPeer, TopPeerCategory};

use crate::error::Result;
use crate::keys;
use crate::store::StoreInner;

const PREFIX_TOP_PEERS: &str = "TOP_PEERS";

/// Reference instant for the rate exponent.  2019-01-01T00:00:00Z.
const RATE_EPOCH: i64 = 1_546_300_800;

/// One increment's weight doubles roughly every three and a half days.
const RATE_HALF_LIFE: f64 = 300_000.0;

pub struct TopPeers {
    inner: Arc<StoreInner>,
}

fn category_index(cat: TopPeerCategory) -> &'static str {
    match cat {
        TopPeerCategory::Users => "top_peers_users",
        TopPeerCategory::Groups => "top_peers_groups",
        TopPeerCategory::Forwards => "top_peers_forwards",
        TopPeerCategory::BotsMessage => "top_peers_bots_message",
        TopPeerCategory::BotsInline => "top_peers_bots_inline",
    }
}

fn category_tag(cat: TopPeerCategory) -> u8 {
    match cat {
        TopPeerCategory::Users => 1,
        TopPeerCategory::Groups => 2,
        TopPeerCategory::Forwards => 3,
        TopPeerCategory::BotsMessage => 4,
        TopPeerCategory::BotsInline => 5,
    }
}

fn top_peer_key(cat: TopPeerCategory, team_id: i64, peer_id: i64, peer_type: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_TOP_PEERS);
    k.push(category_tag(cat));
    keys::push_i64(&mut k, team_id);
    keys::push_i64(&mut k, peer_id);
    keys::push_i32(&mut k, peer_type);
    k
}

fn top_peer_index_key(team_id: i64, peer_id: i64, peer_type: i32) -> String {
    format!("{team_id}.{peer_id}.{peer_type}")
}

fn parse_index_key(key: &str) -> Option<(i64, i64, i32)> {
    let mut parts = key.split('.');
    let team_id = parts.next()?.parse().ok()?;
    let peer_id = parts.next()?.parse().ok()?;
    let peer_type = parts.next()?.parse().ok()?;
    Some((team_id, peer_id, peer_type))
}

/// The weight of one interaction happening at `now`.
fn rate_increment(now: i64) -> f64 {
    (((now - RATE_EPOCH) as f64) / RATE_HALF_LIFE).exp2()
}

impl TopPeers {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Record one interaction with a peer.  Interactions with the acting
    /// user (saved messages) are not tracked.
    pub fn update(
        &self,
        cat: TopPeerCategory,
        user_id: i64,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
    ) -> Result<()> {
        if peer_id == user_id {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let key = top_peer_key(cat, team_id, peer_id, peer_type);
        let rate = self.inner.engine.update(|txn| {
            let mut top_peer = match txn.get(&key)? {
                Some(val) => bincode::deserialize::<TopPeer>(&val)?,
                None => TopPeer {
                    team_id,
                    peer: Peer {
                        id: peer_id,
                        kind: PeerType::from_code(peer_type).unwrap_or(PeerType::User),
                        access_hash: 0,
                    },
                    rate: 0.0,
                    last_update: 0,
                },
            };
            top_peer.rate += rate_increment(now);
            top_peer.last_update = now;
            txn.put(&key, bincode::serialize(&top_peer)?)?;
            Ok(top_peer.rate)
        })?;
        self.inner.index.set_f64(
            category_index(cat),
            &top_peer_index_key(team_id, peer_id, peer_type),
            rate,
        )
    }

    /// Top peers of a category, highest rate first.
    pub fn list(
        &self,
        team_id: i64,
        cat: TopPeerCategory,
        offset: i32,
        limit: i32,
    ) -> Result<Vec<TopPeer>> {
        let mut refs = Vec::new();
        let mut to_skip = offset;
        let mut remaining = limit;
        self.inner.index.descend(category_index(cat), |key, _| {
            let Some((t, peer_id, peer_type)) = parse_index_key(key) else {
                return true;
            };
            if t != team_id {
                return true;
            }
            if to_skip > 0 {
                to_skip -= 1;
                return true;
            }
            if remaining <= 0 {
                return false;
            }
            remaining -= 1;
            refs.push((peer_id, peer_type));
            true
        })?;

        self.inner.engine.view(|txn| {
            let mut out = Vec::with_capacity(refs.len());
            for &(peer_id, peer_type) in &refs {
                match txn.get(top_peer_key(cat, team_id, peer_id, peer_type))? {
                    Some(val) => out.push(bincode::deserialize::<TopPeer>(&val)?),
                    None => continue,
                }
            }
            Ok(out)
        })
    }

    pub fn delete(
        &self,
        cat: TopPeerCategory,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(top_peer_key(cat, team_id, peer_id, peer_type))?;
            Ok(())
        })?;
        self.inner.index.delete(
            category_index(cat),
            &top_peer_index_key(team_id, peer_id, peer_type),
        )
    }

    /// Forget every rate of a category within one team.
    pub fn reset(&self, cat: TopPeerCategory, team_id: i64) -> Result<()> {
        let mut doomed = Vec::new();
        self.inner.index.descend(category_index(cat), |key, _| {
            if let Some((t, peer_id, peer_type)) = parse_index_key(key) {
                if t == team_id {
                    doomed.push((key.to_string(), peer_id, peer_type));
                }
            }
            true
        })?;
        for (index_key, peer_id, peer_type) in doomed {
            self.inner.engine.update(|txn| {
                txn.delete(top_peer_key(cat, team_id, peer_id, peer_type))?;
                Ok(())
            })?;
            self.inner.index.delete(category_index(cat), &index_key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};

    #[test]
    fn rates_accumulate_and_order_the_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        let top = store.top_peers();

        for _ in 0..3 {
            top.update(TopPeerCategory::Users, 1, 0, 50, 1).unwrap();
        }
        top.update(TopPeerCategory::Users, 1, 0, 60, 1).unwrap();
        // Interactions with the acting user are not tracked.
        top.update(TopPeerCategory::Users, 1, 0, 1, 1).unwrap();

        let list = top.list(0, TopPeerCategory::Users, 0, 10).unwrap();
        let peers: Vec<i64> = list.iter().map(|t| t.peer.id).collect();
        assert_eq!(peers, vec![50, 60]);
        assert!(list[0].rate > list[1].rate);

        // Categories are independent.
        assert!(top
            .list(0, TopPeerCategory::Forwards, 0, 10)
            .unwrap()
            .is_empty());

        top.delete(TopPeerCategory::Users, 0, 50, 1).unwrap();
        let peers: Vec<i64> = top
            .list(0, TopPeerCategory::Users, 0, 10)
            .unwrap()
            .iter()
            .map(|t| t.peer.id)
            .collect();
        assert_eq!(peers, vec![60]);

        top.reset(TopPeerCategory::Users, 0).unwrap();
        assert!(top.list(0, TopPeerCategory::Users, 0, 10).unwrap().is_empty());
    }
}
