//! Label repository and hole tracking.
//!
//! Label definitions are global (`LBL.`); usage counts are per team
//! (`LBLC.`).  Each (label, message) association is an ordered `LBLM.`
//! entry whose value encodes `peer_type.peer_id.message_id`, so a label's
//! messages iterate in message-ID order without touching the message
//! table.  The `LBLF.` bars record, per (team, label), the inclusive
//! range of message IDs for which the local membership view is complete;
//! the range only ever widens.

use std::collections::BTreeSet;
use std::sync::Arc;

use estafette_shared::{Label, LabelBar, UserMessage};
use rocksdb::{Direction, IteratorMode};

use crate::engine::Txn;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::messages;
use crate::store::StoreInner;

const PREFIX_LABEL: &str = "LBL";
const PREFIX_LABEL_COUNT: &str = "LBLC";
const PREFIX_LABEL_MESSAGES: &str = "LBLM";
const PREFIX_LABEL_FILL: &str = "LBLF";

pub struct Labels {
    inner: Arc<StoreInner>,
}

fn label_key(label_id: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_LABEL);
    keys::push_i32(&mut k, label_id);
    k
}

fn label_count_key(team_id: i64, label_id: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_LABEL_COUNT);
    keys::push_i32(&mut k, label_id);
    keys::push_i64(&mut k, team_id);
    k
}

fn label_count_prefix(label_id: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_LABEL_COUNT);
    keys::push_i32(&mut k, label_id);
    k
}

fn label_message_key(label_id: i32, msg_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_LABEL_MESSAGES);
    keys::push_i32(&mut k, label_id);
    keys::push_i64(&mut k, msg_id);
    k
}

fn label_message_prefix(label_id: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_LABEL_MESSAGES);
    keys::push_i32(&mut k, label_id);
    k
}

fn label_bar_max_key(team_id: i64, label_id: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_LABEL_FILL);
    keys::push_i64(&mut k, team_id);
    keys::push_i32(&mut k, label_id);
    keys::push_str(&mut k, ".MAXID");
    k
}

fn label_bar_min_key(team_id: i64, label_id: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_LABEL_FILL);
    keys::push_i64(&mut k, team_id);
    keys::push_i32(&mut k, label_id);
    keys::push_str(&mut k, ".MINID");
    k
}

fn get_label(txn: &Txn<'_>, team_id: i64, label_id: i32) -> Result<Label> {
    let val = txn.get(label_key(label_id))?.ok_or(StoreError::NotFound)?;
    let mut label: Label = bincode::deserialize(&val)?;
    label.count = get_label_count(txn, team_id, label_id)?;
    Ok(label)
}

fn save_label(txn: &Txn<'_>, label: &Label) -> Result<()> {
    txn.put(label_key(label.id), bincode::serialize(label)?)?;
    Ok(())
}

fn save_label_count(txn: &Txn<'_>, team_id: i64, label_id: i32, count: i32) -> Result<()> {
    txn.put(
        label_count_key(team_id, label_id),
        (count as u32).to_be_bytes(),
    )?;
    Ok(())
}

fn get_label_count(txn: &Txn<'_>, team_id: i64, label_id: i32) -> Result<i32> {
    match txn.get(label_count_key(team_id, label_id))? {
        Some(val) => {
            let arr: [u8; 4] = val.as_slice().try_into().map_err(|_| StoreError::InvalidData)?;
            Ok(u32::from_be_bytes(arr) as i32)
        }
        None => Ok(0),
    }
}

pub(crate) fn add_label_to_message(
    txn: &Txn<'_>,
    label_id: i32,
    peer_type: i32,
    peer_id: i64,
    msg_id: i64,
) -> Result<()> {
    txn.put(
        label_message_key(label_id, msg_id),
        format!("{peer_type}.{peer_id}.{msg_id}").as_bytes(),
    )?;
    Ok(())
}

pub(crate) fn remove_label_from_message(txn: &Txn<'_>, label_id: i32, msg_id: i64) -> Result<()> {
    txn.delete(label_message_key(label_id, msg_id))?;
    Ok(())
}

pub(crate) fn decrease_label_count(txn: &Txn<'_>, team_id: i64, label_id: i32) -> Result<()> {
    let count = get_label_count(txn, team_id, label_id)?;
    if count == 0 {
        tracing::warn!(label_id, "label count already zero on decrement");
        return Ok(());
    }
    save_label_count(txn, team_id, label_id, count - 1)
}

/// Parse a `LBLM.` association value into `(peer_type, peer_id, msg_id)`.
fn parse_association(value: &[u8]) -> Result<(i32, i64, i64)> {
    let text = std::str::from_utf8(value).map_err(|_| StoreError::InvalidData)?;
    let mut parts = text.split('.');
    let (Some(pt), Some(peer), Some(msg), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(StoreError::InvalidData);
    };
    let peer_type = pt.parse().map_err(|_| StoreError::InvalidData)?;
    let peer_id = peer.parse().map_err(|_| StoreError::InvalidData)?;
    let msg_id = msg.parse().map_err(|_| StoreError::InvalidData)?;
    Ok((peer_type, peer_id, msg_id))
}

impl Labels {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Save label definitions without touching the per-team counts.
    pub fn set(&self, labels: &[Label]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for label in labels {
                save_label(txn, label)?;
            }
            Ok(())
        })
    }

    /// Save label definitions together with their count for this team.
    pub fn save(&self, team_id: i64, labels: &[Label]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for label in labels {
                save_label(txn, label)?;
                save_label_count(txn, team_id, label.id, label.count)?;
            }
            Ok(())
        })
    }

    /// Delete label definitions, their counts across every team and every
    /// message association.
    pub fn delete(&self, label_ids: &[i32]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for &label_id in label_ids {
                txn.delete(label_key(label_id))?;

                let count_prefix = label_count_prefix(label_id);
                let iter = txn.iterator(IteratorMode::From(&count_prefix, Direction::Forward));
                let mut doomed = Vec::new();
                for item in iter {
                    let (key, _) = item?;
                    if !key.starts_with(&count_prefix) {
                        break;
                    }
                    doomed.push(key);
                }
                for key in doomed {
                    txn.delete(&key)?;
                }

                let assoc_prefix = label_message_prefix(label_id);
                let iter = txn.iterator(IteratorMode::From(&assoc_prefix, Direction::Forward));
                let mut doomed = Vec::new();
                for item in iter {
                    let (key, value) = item?;
                    if !key.starts_with(&assoc_prefix) {
                        break;
                    }
                    // Associations that fail to parse are invalid data, not
                    // a silent skip.
                    parse_association(&value)?;
                    doomed.push(key);
                }
                for key in doomed {
                    txn.delete(&key)?;
                }
            }
            Ok(())
        })
    }

    pub fn get_many(&self, team_id: i64, label_ids: &[i32]) -> Result<Vec<Label>> {
        self.inner.engine.view(|txn| {
            let mut out = Vec::with_capacity(label_ids.len());
            for &label_id in label_ids {
                if let Ok(label) = get_label(txn, team_id, label_id) {
                    out.push(label);
                }
            }
            Ok(out)
        })
    }

    pub fn get_all(&self, team_id: i64) -> Result<Vec<Label>> {
        self.inner.engine.view(|txn| {
            let prefix = keys::tag(PREFIX_LABEL);
            let mut out = Vec::new();
            let iter = txn.iterator(IteratorMode::From(&prefix, Direction::Forward));
            for item in iter {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                match bincode::deserialize::<Label>(&value) {
                    Ok(mut label) => {
                        label.count = get_label_count(txn, team_id, label.id)?;
                        out.push(label);
                    }
                    Err(err) => tracing::warn!(%err, "skipping undecodable label"),
                }
            }
            Ok(out)
        })
    }

    /// Attach labels to messages.  The association entries are upserts and
    /// the message's `label_ids` set is re-resolved from scratch, so the
    /// operation is idempotent.
    pub fn add_to_messages(
        &self,
        label_ids: &[i32],
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        msg_ids: &[i64],
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            for &label_id in label_ids {
                for &msg_id in msg_ids {
                    add_label_to_message(txn, label_id, peer_type, peer_id, msg_id)?;
                }
            }
            for &msg_id in msg_ids {
                let mut message = match messages::get_message_by_key(
                    txn,
                    &messages::message_key(team_id, peer_id, peer_type, msg_id),
                ) {
                    Ok(m) => m,
                    Err(StoreError::NotFound) => continue,
                    Err(e) => return Err(e),
                };
                let mut set: BTreeSet<i32> = message.label_ids.iter().copied().collect();
                set.extend(label_ids.iter().copied());
                message.label_ids = set.into_iter().collect();
                messages::save_message(txn, &self.inner, &message)?;
            }
            Ok(())
        })
    }

    /// Remove labels from messages; removing an absent label is a no-op.
    pub fn remove_from_messages(
        &self,
        label_ids: &[i32],
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        msg_ids: &[i64],
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            for &label_id in label_ids {
                for &msg_id in msg_ids {
                    remove_label_from_message(txn, label_id, msg_id)?;
                }
            }
            for &msg_id in msg_ids {
                let mut message = match messages::get_message_by_key(
                    txn,
                    &messages::message_key(team_id, peer_id, peer_type, msg_id),
                ) {
                    Ok(m) => m,
                    Err(StoreError::NotFound) => continue,
                    Err(e) => return Err(e),
                };
                let mut set: BTreeSet<i32> = message.label_ids.iter().copied().collect();
                for label_id in label_ids {
                    set.remove(label_id);
                }
                message.label_ids = set.into_iter().collect();
                messages::save_message(txn, &self.inner, &message)?;
            }
            Ok(())
        })
    }

    /// List a label's messages by walking the ordered association entries.
    ///
    /// With both bounds zero the newest `limit` associations are returned,
    /// newest first.  With only `max_id` the scan runs downward from it.
    /// With only `min_id` the scan runs upward and the result is returned
    /// ascending.  Setting both bounds is not a supported addressing mode
    /// and yields nothing.  Messages from other teams are skipped.
    pub fn list_messages(
        &self,
        label_id: i32,
        team_id: i64,
        limit: i32,
        min_id: i64,
        max_id: i64,
    ) -> Result<Vec<UserMessage>> {
        self.inner.engine.view(|txn| {
            let prefix = label_message_prefix(label_id);
            let mut out = Vec::with_capacity(limit.max(0) as usize);
            let mut remaining = limit;

            let mut visit = |value: &[u8]| -> Result<bool> {
                if remaining <= 0 {
                    return Ok(false);
                }
                let (_, _, msg_id) = parse_association(value)?;
                match messages::get_message_by_id(txn, msg_id) {
                    Ok(message) => {
                        if message.team_id == team_id {
                            out.push(message);
                            remaining -= 1;
                        }
                    }
                    Err(StoreError::NotFound) => {
                        tracing::warn!(msg_id, label_id, "label points at a missing message");
                    }
                    Err(e) => return Err(e),
                }
                Ok(true)
            };

            match (min_id, max_id) {
                (0, _) => {
                    // Newest first, from max_id (or the end of the label).
                    let seek = if max_id > 0 {
                        label_message_key(label_id, max_id)
                    } else {
                        label_message_key(label_id, i64::MAX)
                    };
                    let iter = txn.iterator(IteratorMode::From(&seek, Direction::Reverse));
                    for item in iter {
                        let (key, value) = item?;
                        if !key.starts_with(&prefix) {
                            break;
                        }
                        if !visit(&value)? {
                            break;
                        }
                    }
                }
                (_, 0) => {
                    let seek = label_message_key(label_id, min_id);
                    let iter = txn.iterator(IteratorMode::From(&seek, Direction::Forward));
                    for item in iter {
                        let (key, value) = item?;
                        if !key.starts_with(&prefix) {
                            break;
                        }
                        if !visit(&value)? {
                            break;
                        }
                    }
                    out.sort_by_key(|m| m.id);
                }
                _ => {}
            }
            Ok(out)
        })
    }

    // ------------------------------------------------------------------
    // Hole tracking
    // ------------------------------------------------------------------

    /// Record that the local store now holds the label's complete
    /// membership for `[min_id, max_id]`.  The bar only ever widens: the
    /// stored max rises, the stored min falls, neither moves back.
    pub fn fill(&self, team_id: i64, label_id: i32, min_id: i64, max_id: i64) -> Result<()> {
        self.inner.engine.update(|txn| {
            let bar = read_bar(txn, team_id, label_id)?;
            if max_id > bar.max_id {
                txn.put(
                    label_bar_max_key(team_id, label_id),
                    (max_id as u64).to_be_bytes(),
                )?;
            }
            if bar.min_id == 0 || min_id < bar.min_id {
                txn.put(
                    label_bar_min_key(team_id, label_id),
                    (min_id as u64).to_be_bytes(),
                )?;
            }
            Ok(())
        })
    }

    pub fn get_filled(&self, team_id: i64, label_id: i32) -> Result<LabelBar> {
        self.inner.engine.view(|txn| read_bar(txn, team_id, label_id))
    }

    /// Can a "list up to `max_id`" query be answered locally?  On success
    /// the returned bar's max is narrowed to `max_id` — the caller asked
    /// for that much and the bar confirms it is coverable.
    pub fn get_lower_filled(
        &self,
        team_id: i64,
        label_id: i32,
        max_id: i64,
    ) -> Result<(bool, LabelBar)> {
        let mut bar = self.get_filled(team_id, label_id)?;
        if bar.min_id == 0 && bar.max_id == 0 {
            return Ok((false, bar));
        }
        if max_id > bar.max_id || max_id < bar.min_id {
            return Ok((false, bar));
        }
        bar.max_id = max_id;
        Ok((true, bar))
    }

    /// Symmetric lower-bound check: narrows the returned bar's min to
    /// `min_id` when the range covers it.
    pub fn get_upper_filled(
        &self,
        team_id: i64,
        label_id: i32,
        min_id: i64,
    ) -> Result<(bool, LabelBar)> {
        let mut bar = self.get_filled(team_id, label_id)?;
        if bar.min_id == 0 && bar.max_id == 0 {
            return Ok((false, bar));
        }
        if min_id < bar.min_id || min_id > bar.max_id {
            return Ok((false, bar));
        }
        bar.min_id = min_id;
        Ok((true, bar))
    }
}

fn read_bar(txn: &Txn<'_>, team_id: i64, label_id: i32) -> Result<LabelBar> {
    let mut bar = LabelBar::default();
    if let Some(val) = txn.get(label_bar_min_key(team_id, label_id))? {
        let arr: [u8; 8] = val.as_slice().try_into().map_err(|_| StoreError::InvalidData)?;
        bar.min_id = u64::from_be_bytes(arr) as i64;
    }
    if let Some(val) = txn.get(label_bar_max_key(team_id, label_id))? {
        let arr: [u8; 8] = val.as_slice().try_into().map_err(|_| StoreError::InvalidData)?;
        bar.max_id = u64::from_be_bytes(arr) as i64;
    }
    Ok(bar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};
    use estafette_shared::Dialog;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        (dir, store)
    }

    fn seed_conversation(store: &Store, peer_id: i64, msg_count: i64) {
        store
            .dialogs()
            .save_new(
                &Dialog {
                    peer_id,
                    peer_type: 1,
                    top_message_id: msg_count,
                    ..Default::default()
                },
                1_600_000_000,
            )
            .unwrap();
        let batch: Vec<UserMessage> = (1..=msg_count)
            .map(|id| UserMessage {
                id,
                peer_id,
                peer_type: 1,
                sender_id: peer_id,
                body: format!("message {id}"),
                ..Default::default()
            })
            .collect();
        store.messages().save(&batch).unwrap();
    }

    #[test]
    fn save_and_get_all_with_counts() {
        let (_dir, store) = open_store();
        let labels = store.labels();

        labels
            .save(
                0,
                &[
                    Label {
                        id: 1,
                        name: "Important".into(),
                        colour: "#FF0000".into(),
                        count: 3,
                    },
                    Label {
                        id: 2,
                        name: "Later".into(),
                        colour: "#00FF00".into(),
                        count: 0,
                    },
                ],
            )
            .unwrap();

        let all = labels.get_all(0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].count, 3);

        // Counts are per team: another team sees zero.
        let other = labels.get_all(9).unwrap();
        assert_eq!(other[0].count, 0);
    }

    #[test]
    fn adding_labels_twice_is_idempotent() {
        let (_dir, store) = open_store();
        let labels = store.labels();
        let peer_id = 7;
        seed_conversation(&store, peer_id, 10);

        let targets = [1i64, 2, 3, 6, 8, 9, 10];
        labels
            .add_to_messages(&[1], 0, peer_id, 1, &targets)
            .unwrap();
        labels
            .add_to_messages(&[1], 0, peer_id, 1, &targets)
            .unwrap();

        let m = store.messages().get(6).unwrap();
        assert_eq!(m.label_ids, vec![1]);

        let listed = labels.list_messages(1, 0, 100, 0, 0).unwrap();
        assert_eq!(listed.len(), targets.len());

        // Removing an absent label stays a no-op.
        labels
            .remove_from_messages(&[1, 5], 0, peer_id, 1, &[6])
            .unwrap();
        assert!(store.messages().get(6).unwrap().label_ids.is_empty());
    }

    #[test]
    fn list_messages_addressing_modes() {
        let (_dir, store) = open_store();
        let labels = store.labels();
        let peer_id = 8;
        seed_conversation(&store, peer_id, 10);
        labels
            .add_to_messages(&[1], 0, peer_id, 1, &[1, 2, 3, 6, 8, 9, 10])
            .unwrap();

        // Both bounds zero: newest first.
        let ids: Vec<i64> = labels
            .list_messages(1, 0, 3, 0, 0)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![10, 9, 8]);

        // Only max: downward from it.
        let ids: Vec<i64> = labels
            .list_messages(1, 0, 2, 0, 9)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![9, 8]);

        // Only min: upward, returned ascending.
        let ids: Vec<i64> = labels
            .list_messages(1, 0, 2, 6, 0)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![6, 8]);

        // Both set is not a supported addressing mode.
        assert!(labels.list_messages(1, 0, 5, 2, 9).unwrap().is_empty());
    }

    #[test]
    fn fill_only_ever_widens() {
        let (_dir, store) = open_store();
        let labels = store.labels();

        labels.fill(0, 1, 10, 100).unwrap();
        labels.fill(0, 1, 40, 60).unwrap();
        let bar = labels.get_filled(0, 1).unwrap();
        assert_eq!((bar.min_id, bar.max_id), (10, 100));

        labels.fill(0, 1, 5, 120).unwrap();
        let bar = labels.get_filled(0, 1).unwrap();
        assert_eq!((bar.min_id, bar.max_id), (5, 120));
    }

    #[test]
    fn filled_range_lookups() {
        let (_dir, store) = open_store();
        let labels = store.labels();
        labels.fill(0, 1, 10, 100).unwrap();

        let (ok, bar) = labels.get_upper_filled(0, 1, 90).unwrap();
        assert!(ok);
        assert_eq!((bar.min_id, bar.max_id), (90, 100));

        let (ok, bar) = labels.get_lower_filled(0, 1, 90).unwrap();
        assert!(ok);
        assert_eq!((bar.min_id, bar.max_id), (10, 90));

        // Outside the range.
        let (ok, _) = labels.get_upper_filled(0, 1, 5).unwrap();
        assert!(!ok);

        // A label never filled reports nothing.
        let (ok, bar) = labels.get_lower_filled(0, 10, 100).unwrap();
        assert!(!ok);
        assert_eq!((bar.min_id, bar.max_id), (0, 0));
    }

    #[test]
    fn search_by_labels_filters_tagged_messages() {
        let (_dir, store) = open_store();
        let labels = store.labels();
        let peer_id = 9;
        seed_conversation(&store, peer_id, 100);

        for id in 1..=100i64 {
            let label_id = (id % 5) as i32;
            if label_id > 0 {
                labels
                    .add_to_messages(&[label_id], 0, peer_id, 1, &[id])
                    .unwrap();
            }
        }

        let hits = store.messages().search_by_labels(0, &[1], 0, 200).unwrap();
        assert_eq!(hits.len(), 20);
        assert!(hits.iter().all(|m| m.label_ids.contains(&1)));
    }

    #[test]
    fn deleting_messages_decrements_label_counts() {
        let (_dir, store) = open_store();
        let labels = store.labels();
        let peer_id = 12;
        seed_conversation(&store, peer_id, 5);

        labels
            .save(
                0,
                &[Label {
                    id: 3,
                    name: "Todo".into(),
                    colour: "#0000FF".into(),
                    count: 2,
                }],
            )
            .unwrap();
        labels.add_to_messages(&[3], 0, peer_id, 1, &[1, 2]).unwrap();

        store.messages().delete(1, 0, peer_id, 1, &[2]).unwrap();
        let l = &labels.get_many(0, &[3]).unwrap()[0];
        assert_eq!(l.count, 1);

        let listed = labels.list_messages(3, 0, 10, 0, 0).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 1);
    }
}
