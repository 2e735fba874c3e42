//! Dialog repository.
//!
//! A dialog is the per-(team, peer) conversation summary.  The primary
//! record lives in the engine under `DLG.`; listing order (most recently
//! active first) comes from the `dialogs` secondary index whose value is
//! the zero-padded last-activity timestamp.  Pinned dialogs keep a
//! parallel `PDLG.` entry.

use std::sync::Arc;

use estafette_shared::{Dialog, NotifySettings};

use crate::engine::Txn;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::messages;
use crate::store::StoreInner;

const PREFIX_DIALOGS: &str = "DLG";
const PREFIX_PINNED: &str = "PDLG";
pub(crate) const INDEX_DIALOGS: &str = "dialogs";

pub struct Dialogs {
    inner: Arc<StoreInner>,
}

pub(crate) fn dialog_key(team_id: i64, peer_id: i64, peer_type: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_DIALOGS);
    keys::push_i64(&mut k, team_id);
    keys::push_i64(&mut k, peer_id);
    keys::push_i32(&mut k, peer_type);
    k
}

fn dialog_prefix(team_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_DIALOGS);
    keys::push_i64(&mut k, team_id);
    k
}

fn pinned_dialog_key(team_id: i64, peer_id: i64, peer_type: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_PINNED);
    keys::push_i64(&mut k, team_id);
    keys::push_i64(&mut k, peer_id);
    keys::push_i32(&mut k, peer_type);
    k
}

/// Entry key used inside the `dialogs` secondary index.
fn dialog_index_key(team_id: i64, peer_id: i64, peer_type: i32) -> String {
    format!("{PREFIX_DIALOGS}.{team_id}.{peer_id}.{peer_type}")
}

/// Parse `(team, peer, peer_type)` back out of a secondary index key.
fn peer_from_index_key(key: &str) -> Option<(i64, i64, i32)> {
    let mut parts = key.split('.');
    if parts.next() != Some(PREFIX_DIALOGS) {
        return None;
    }
    let team_id = parts.next()?.parse().ok()?;
    let peer_id = parts.next()?.parse().ok()?;
    let peer_type = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((team_id, peer_id, peer_type))
}

pub(crate) fn get_dialog(
    txn: &Txn<'_>,
    team_id: i64,
    peer_id: i64,
    peer_type: i32,
) -> Result<Dialog> {
    let val = txn
        .get(dialog_key(team_id, peer_id, peer_type))?
        .ok_or(StoreError::NotFound)?;
    Ok(bincode::deserialize(&val)?)
}

pub(crate) fn save_dialog(txn: &Txn<'_>, dialog: &Dialog) -> Result<()> {
    let bytes = bincode::serialize(dialog)?;
    txn.put(
        dialog_key(dialog.team_id, dialog.peer_id, dialog.peer_type),
        &bytes,
    )?;
    let pinned_key = pinned_dialog_key(dialog.team_id, dialog.peer_id, dialog.peer_type);
    if dialog.pinned {
        txn.put(pinned_key, &bytes)?;
    } else {
        txn.delete(pinned_key)?;
    }
    Ok(())
}

/// Recompute unread and mention counters by scanning every message of the
/// conversation with ID >= `from_id`.  Recompute-on-write keeps the
/// counters correct even when individual updates were missed.
pub(crate) fn count_dialog_unread(
    txn: &Txn<'_>,
    team_id: i64,
    peer_id: i64,
    peer_type: i32,
    user_id: i64,
    from_id: i64,
) -> Result<(i32, i32)> {
    let mut unread = 0;
    let mut mentioned = 0;
    messages::scan_conversation(txn, team_id, peer_id, peer_type, from_id, |message| {
        if message.sender_id != user_id {
            unread += 1;
        }
        for entity in &message.entities {
            use estafette_shared::EntityKind;
            match entity.kind {
                EntityKind::Mention if entity.user_id == user_id => mentioned += 1,
                EntityKind::MentionAll if message.sender_id != user_id => mentioned += 1,
                _ => {}
            }
        }
        true
    })?;
    Ok((unread, mentioned))
}

/// Bump a dialog's position in the last-activity ordering.
pub(crate) fn update_dialog_last_update(
    inner: &StoreInner,
    team_id: i64,
    peer_id: i64,
    peer_type: i32,
    last_update: i64,
) -> Result<()> {
    inner.index.set(
        INDEX_DIALOGS,
        &dialog_index_key(team_id, peer_id, peer_type),
        format!("{last_update:021}").as_bytes(),
    )
}

impl Dialogs {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn get(&self, team_id: i64, peer_id: i64, peer_type: i32) -> Result<Dialog> {
        self.inner
            .engine
            .view(|txn| get_dialog(txn, team_id, peer_id, peer_type))
    }

    /// Save a dialog seen for the first time and register it in the
    /// last-activity ordering.
    pub fn save_new(&self, dialog: &Dialog, last_update: i64) -> Result<()> {
        self.inner.engine.update(|txn| save_dialog(txn, dialog))?;
        update_dialog_last_update(
            &self.inner,
            dialog.team_id,
            dialog.peer_id,
            dialog.peer_type,
            last_update,
        )
    }

    pub fn save(&self, dialog: &Dialog) -> Result<()> {
        self.inner.engine.update(|txn| save_dialog(txn, dialog))
    }

    /// Advance the inbox read marker and recompute unread counters.
    ///
    /// A marker that is not newer than the current one, or that points
    /// beyond the dialog's top message, is stale and silently ignored.
    pub fn update_read_inbox_max_id(
        &self,
        user_id: i64,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        max_id: i64,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut dialog = get_dialog(txn, team_id, peer_id, peer_type)?;
            if dialog.read_inbox_max_id > max_id || max_id > dialog.top_message_id {
                return Ok(());
            }
            dialog.read_inbox_max_id = max_id;
            let (unread, mentioned) =
                count_dialog_unread(txn, team_id, peer_id, peer_type, user_id, max_id + 1)?;
            dialog.unread_count = unread;
            dialog.mentioned_count = mentioned;
            save_dialog(txn, &dialog)
        })
    }

    pub fn update_read_outbox_max_id(
        &self,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        max_id: i64,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut dialog = get_dialog(txn, team_id, peer_id, peer_type)?;
            if dialog.read_outbox_max_id > max_id || max_id > dialog.top_message_id {
                return Ok(());
            }
            dialog.read_outbox_max_id = max_id;
            save_dialog(txn, &dialog)
        })
    }

    pub fn update_notify_settings(
        &self,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        settings: NotifySettings,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut dialog = get_dialog(txn, team_id, peer_id, peer_type)?;
            dialog.notify_settings = Some(settings.clone());
            save_dialog(txn, &dialog)
        })
    }

    pub fn update_pinned(
        &self,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        pinned: bool,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut dialog = get_dialog(txn, team_id, peer_id, peer_type)?;
            dialog.pinned = pinned;
            save_dialog(txn, &dialog)
        })
    }

    pub fn update_pin_message_id(
        &self,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        message_id: i64,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut dialog = get_dialog(txn, team_id, peer_id, peer_type)?;
            dialog.pinned_message_id = message_id;
            save_dialog(txn, &dialog)
        })
    }

    pub fn update_call_started(
        &self,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        call_id: i64,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut dialog = get_dialog(txn, team_id, peer_id, peer_type)?;
            dialog.active_call_id = call_id;
            save_dialog(txn, &dialog)
        })
    }

    pub fn update_call_ended(&self, team_id: i64, peer_id: i64, peer_type: i32) -> Result<()> {
        self.update_call_started(team_id, peer_id, peer_type, 0)
    }

    pub fn delete(&self, team_id: i64, peer_id: i64, peer_type: i32) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(dialog_key(team_id, peer_id, peer_type))?;
            txn.delete(pinned_dialog_key(team_id, peer_id, peer_type))?;
            Ok(())
        })?;
        self.inner
            .index
            .delete(INDEX_DIALOGS, &dialog_index_key(team_id, peer_id, peer_type))
    }

    /// List the team's dialogs ordered by last activity, newest first.
    ///
    /// A dialog present in the index but missing from the primary store is
    /// skipped, tolerating races between the two.
    pub fn list(&self, team_id: i64, offset: i32, limit: i32) -> Result<Vec<Dialog>> {
        let mut dialogs = Vec::with_capacity(limit.max(0) as usize);
        let mut to_skip = offset;
        let mut remaining = limit;
        self.inner.engine.view(|txn| {
            dialogs.clear();
            to_skip = offset;
            remaining = limit;
            self.inner.index.descend(INDEX_DIALOGS, |key, _value| {
                let Some((t, peer_id, peer_type)) = peer_from_index_key(key) else {
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
                if let Ok(dialog) = get_dialog(txn, team_id, peer_id, peer_type) {
                    dialogs.push(dialog);
                    remaining -= 1;
                }
                true
            })
        })?;
        Ok(dialogs)
    }

    pub fn count_dialogs(&self, team_id: i64) -> Result<i32> {
        let prefix = dialog_prefix(team_id);
        let mut count = 0;
        self.inner.engine.scan_prefix(&prefix, |_k, _v| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    pub fn get_pinned(&self, team_id: i64) -> Result<Vec<Dialog>> {
        let mut prefix = keys::tag(PREFIX_PINNED);
        keys::push_i64(&mut prefix, team_id);
        let mut dialogs = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_k, v| {
            if let Ok(dialog) = bincode::deserialize::<Dialog>(v) {
                dialogs.push(dialog);
            }
            true
        })?;
        Ok(dialogs)
    }

    /// Total unread and mention counts across the team's dialogs.  Muted
    /// dialogs contribute unread only when `include_muted` is set;
    /// mentions always count.
    pub fn count_all_unread(
        &self,
        user_id: i64,
        team_id: i64,
        include_muted: bool,
    ) -> Result<(i32, i32)> {
        let now = chrono::Utc::now().timestamp();
        self.inner.engine.view(|txn| {
            let mut unread = 0;
            let mut mentioned = 0;
            let prefix = dialog_prefix(team_id);
            let iter = txn.iterator(rocksdb::IteratorMode::From(
                &prefix,
                rocksdb::Direction::Forward,
            ));
            for item in iter {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                let Ok(dialog) = bincode::deserialize::<Dialog>(&value) else {
                    continue;
                };
                let (u, m) = count_dialog_unread(
                    txn,
                    dialog.team_id,
                    dialog.peer_id,
                    dialog.peer_type,
                    user_id,
                    dialog.read_inbox_max_id + 1,
                )?;
                let muted = dialog
                    .notify_settings
                    .as_ref()
                    .map(|s| s.mute_until > now)
                    .unwrap_or(false);
                if include_muted || !muted {
                    unread += u;
                }
                mentioned += m;
            }
            Ok((unread, mentioned))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};
    use estafette_shared::{EntityKind, MessageEntity, UserMessage};

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        (dir, store)
    }

    fn dialog(team_id: i64, peer_id: i64, top: i64) -> Dialog {
        Dialog {
            team_id,
            peer_id,
            peer_type: 1,
            top_message_id: top,
            ..Default::default()
        }
    }

    #[test]
    fn save_then_get_round_trip() {
        let (_dir, store) = open_store();
        let dialogs = store.dialogs();

        let mut d = dialog(0, 5, 10);
        d.unread_count = 2;
        dialogs.save_new(&d, 1_600_000_000).unwrap();
        assert_eq!(dialogs.get(0, 5, 1).unwrap(), d);

        assert!(matches!(dialogs.get(0, 6, 1), Err(StoreError::NotFound)));
    }

    #[test]
    fn list_orders_by_last_activity() {
        let (_dir, store) = open_store();
        let dialogs = store.dialogs();

        dialogs.save_new(&dialog(0, 1, 0), 100).unwrap();
        dialogs.save_new(&dialog(0, 2, 0), 300).unwrap();
        dialogs.save_new(&dialog(0, 3, 0), 200).unwrap();
        // Another team's dialog must not leak into the listing.
        dialogs.save_new(&dialog(9, 4, 0), 400).unwrap();

        let peers: Vec<i64> = dialogs
            .list(0, 0, 10)
            .unwrap()
            .iter()
            .map(|d| d.peer_id)
            .collect();
        assert_eq!(peers, vec![2, 3, 1]);

        let peers: Vec<i64> = dialogs
            .list(0, 1, 1)
            .unwrap()
            .iter()
            .map(|d| d.peer_id)
            .collect();
        assert_eq!(peers, vec![3]);
    }

    #[test]
    fn read_inbox_marker_recomputes_unread() {
        let (_dir, store) = open_store();
        store.set_self_user_id(1);
        let peer_id = 70;

        store.dialogs().save_new(&dialog(0, peer_id, 0), 1).unwrap();
        for id in 1..=10i64 {
            let mut m = UserMessage {
                id,
                peer_id,
                peer_type: 1,
                sender_id: if id % 2 == 0 { 1 } else { peer_id },
                ..Default::default()
            };
            if id == 9 {
                m.entities.push(MessageEntity {
                    kind: EntityKind::Mention,
                    offset: 0,
                    length: 4,
                    user_id: 1,
                });
            }
            store.messages().save_new(&m, 1).unwrap();
        }

        store
            .dialogs()
            .update_read_inbox_max_id(1, 0, peer_id, 1, 4)
            .unwrap();
        let d = store.dialogs().get(0, peer_id, 1).unwrap();
        // Messages 5..10 from the peer: 5, 7, 9 (even ones are ours).
        assert_eq!(d.unread_count, 3);
        assert_eq!(d.mentioned_count, 1);

        // A stale marker is silently ignored.
        store
            .dialogs()
            .update_read_inbox_max_id(1, 0, peer_id, 1, 2)
            .unwrap();
        assert_eq!(store.dialogs().get(0, peer_id, 1).unwrap().read_inbox_max_id, 4);

        // A marker beyond the top message is ignored too.
        store
            .dialogs()
            .update_read_inbox_max_id(1, 0, peer_id, 1, 99)
            .unwrap();
        assert_eq!(store.dialogs().get(0, peer_id, 1).unwrap().read_inbox_max_id, 4);
    }

    #[test]
    fn pinned_dialogs_listing() {
        let (_dir, store) = open_store();
        let dialogs = store.dialogs();

        dialogs.save_new(&dialog(0, 1, 0), 1).unwrap();
        dialogs.save_new(&dialog(0, 2, 0), 2).unwrap();
        dialogs.update_pinned(0, 2, 1, true).unwrap();

        let pinned = dialogs.get_pinned(0).unwrap();
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].peer_id, 2);

        dialogs.update_pinned(0, 2, 1, false).unwrap();
        assert!(dialogs.get_pinned(0).unwrap().is_empty());
    }

    #[test]
    fn count_all_unread_honors_mutes() {
        let (_dir, store) = open_store();
        store.set_self_user_id(1);
        let dialogs = store.dialogs();

        for peer_id in [81i64, 82] {
            dialogs.save_new(&dialog(0, peer_id, 0), peer_id).unwrap();
            for id in 1..=3i64 {
                store
                    .messages()
                    .save_new(
                        &UserMessage {
                            id,
                            peer_id,
                            peer_type: 1,
                            sender_id: peer_id,
                            ..Default::default()
                        },
                        1,
                    )
                    .unwrap();
            }
        }
        dialogs
            .update_notify_settings(
                0,
                82,
                1,
                NotifySettings {
                    mute_until: chrono::Utc::now().timestamp() + 3600,
                    ..Default::default()
                },
            )
            .unwrap();

        let (unread, _) = dialogs.count_all_unread(1, 0, false).unwrap();
        assert_eq!(unread, 3);
        let (unread, _) = dialogs.count_all_unread(1, 0, true).unwrap();
        assert_eq!(unread, 6);
    }
}
