//! Pending-message (outbox) repository.
//!
//! A locally sent message is tracked under three independent key paths:
//! its locally generated ID, the client random/request ID, and — once the
//! server confirms — the server-assigned real ID.  That triple lets a
//! late acknowledgement be matched idempotently whichever identifier it
//! arrives with.  Deletion must always remove the by-ID and by-random
//! entries together; leaving one behind would let a stale outbox entry
//! resurface.

use std::sync::Arc;

use estafette_shared::{
    DraftMessage, FileLocation, InputPeer, MessageMedia, PendingMessage, UserMessage,
};

use crate::dialogs;
use crate::engine::Txn;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::store::StoreInner;

const PREFIX_BY_ID: &str = "PMSG_ID";
const PREFIX_BY_RANDOM: &str = "PMSG_RND";
const PREFIX_BY_REAL: &str = "PMSG_RID";

pub struct PendingMessages {
    inner: Arc<StoreInner>,
}

fn pending_key(msg_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_BY_ID);
    keys::push_i64(&mut k, msg_id.abs());
    k
}

fn pending_random_key(random_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_BY_RANDOM);
    keys::push_i64(&mut k, random_id.abs());
    k
}

fn pending_real_key(msg_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_BY_REAL);
    keys::push_i64(&mut k, msg_id);
    k
}

fn get_pending(txn: &Txn<'_>, msg_id: i64) -> Result<PendingMessage> {
    let val = txn.get(pending_key(msg_id))?.ok_or(StoreError::NotFound)?;
    Ok(bincode::deserialize(&val)?)
}

fn put_pending(txn: &Txn<'_>, pm: &PendingMessage) -> Result<()> {
    let bytes = bincode::serialize(pm)?;
    txn.put(pending_key(pm.id), &bytes)?;
    txn.put(pending_random_key(pm.request_id), &bytes)?;
    Ok(())
}

fn delete_pending(txn: &Txn<'_>, msg_id: i64) -> Result<()> {
    let pm = get_pending(txn, msg_id)?;
    txn.delete(pending_key(pm.id))?;
    txn.delete(pending_random_key(pm.request_id))?;
    Ok(())
}

impl PendingMessages {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Store a freshly drafted text message under its local ID and its
    /// request ID, and bump the dialog's last-activity ordering.
    pub fn save(
        &self,
        team_id: i64,
        team_access_hash: u64,
        msg_id: i64,
        sender_id: i64,
        draft: &DraftMessage,
    ) -> Result<PendingMessage> {
        let pm = PendingMessage {
            id: msg_id,
            request_id: draft.random_id,
            team_id,
            team_access_hash,
            access_hash: draft.peer.access_hash,
            peer_id: draft.peer.id,
            peer_type: draft.peer.kind,
            sender_id,
            created_on: chrono::Utc::now().timestamp(),
            body: draft.body.clone(),
            entities: draft.entities.clone(),
            reply_to: draft.reply_to,
            clear_draft: draft.clear_draft,
            ..Default::default()
        };

        self.inner.engine.update(|txn| put_pending(txn, &pm))?;
        dialogs::update_dialog_last_update(
            &self.inner,
            pm.team_id,
            pm.peer_id,
            pm.peer_type,
            pm.created_on,
        )?;
        Ok(pm)
    }

    /// Store a drafted media message before its upload has finished.
    #[allow(clippy::too_many_arguments)]
    pub fn save_media(
        &self,
        team_id: i64,
        team_access_hash: u64,
        msg_id: i64,
        sender_id: i64,
        request_id: i64,
        file_id: i64,
        thumb_id: i64,
        peer: InputPeer,
        caption: String,
        media: MessageMedia,
        sha256: Vec<u8>,
    ) -> Result<PendingMessage> {
        let mut pm = PendingMessage {
            id: msg_id,
            request_id,
            team_id,
            team_access_hash,
            access_hash: peer.access_hash,
            peer_id: peer.id,
            peer_type: peer.kind,
            sender_id,
            created_on: chrono::Utc::now().timestamp(),
            body: caption,
            media,
            file_id,
            file_upload_id: file_id.to_string(),
            sha256,
            ..Default::default()
        };
        if thumb_id > 0 {
            pm.thumb_id = thumb_id;
            pm.thumb_upload_id = thumb_id.to_string();
        }

        self.inner.engine.update(|txn| put_pending(txn, &pm))?;
        dialogs::update_dialog_last_update(
            &self.inner,
            pm.team_id,
            pm.peer_id,
            pm.peer_type,
            pm.created_on,
        )?;
        Ok(pm)
    }

    /// Record upload progress metadata once the file controller has
    /// resolved the server-side location.
    pub fn update_media(
        &self,
        pm: &mut PendingMessage,
        total_parts: i32,
        server_file: FileLocation,
    ) -> Result<()> {
        pm.file_total_parts = total_parts;
        pm.server_file = Some(server_file);
        let snapshot = pm.clone();
        self.inner.engine.update(|txn| put_pending(txn, &snapshot))
    }

    pub fn get_by_id(&self, msg_id: i64) -> Result<PendingMessage> {
        self.inner.engine.view(|txn| get_pending(txn, msg_id))
    }

    pub fn get_by_random_id(&self, random_id: i64) -> Result<PendingMessage> {
        self.inner.engine.view(|txn| {
            let val = txn
                .get(pending_random_key(random_id))?
                .ok_or(StoreError::NotFound)?;
            Ok(bincode::deserialize(&val)?)
        })
    }

    pub fn get_by_real_id(&self, real_id: i64) -> Result<PendingMessage> {
        self.inner.engine.view(|txn| {
            let val = txn
                .get(pending_real_key(real_id))?
                .ok_or(StoreError::NotFound)?;
            Ok(bincode::deserialize(&val)?)
        })
    }

    /// Copy the entry found by its random ID under the server-assigned
    /// real ID, so lookups succeed either way during the confirmation
    /// race window.
    pub fn save_by_real_id(&self, random_id: i64, real_id: i64) -> Result<()> {
        self.inner.engine.update(|txn| {
            let val = txn
                .get(pending_random_key(random_id))?
                .ok_or(StoreError::NotFound)?;
            txn.put(pending_real_key(real_id), &val)?;
            Ok(())
        })
    }

    /// Remove the by-ID and by-random entries together.
    pub fn delete(&self, msg_id: i64) -> Result<()> {
        self.inner.engine.update(|txn| delete_pending(txn, msg_id))
    }

    pub fn delete_by_real_id(&self, real_id: i64) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(pending_real_key(real_id))?;
            Ok(())
        })
    }

    pub fn delete_many(&self, msg_ids: &[i64]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for &msg_id in msg_ids {
                match delete_pending(txn, msg_id) {
                    Ok(()) | Err(StoreError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }

    /// Outbox entries for one conversation, rendered as user messages.
    pub fn get_by_peer(
        &self,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
    ) -> Result<Vec<UserMessage>> {
        let mut out = Vec::new();
        self.for_each(|pm| {
            if pm.team_id == team_id && pm.peer_id == peer_id && pm.peer_type == peer_type {
                out.push(to_user_message(&pm));
            }
        })?;
        Ok(out)
    }

    pub fn get_all(&self) -> Result<Vec<PendingMessage>> {
        let mut out = Vec::new();
        self.for_each(|pm| out.push(pm))?;
        Ok(out)
    }

    pub fn all_as_messages(&self) -> Result<Vec<UserMessage>> {
        let mut out = Vec::new();
        self.for_each(|pm| out.push(to_user_message(&pm)))?;
        Ok(out)
    }

    /// Delete every outbox entry addressed to a peer; returns the deleted
    /// local message IDs so callers can propagate the removal upward.
    pub fn delete_peer_all(&self, peer_id: i64, peer_type: i32) -> Result<Vec<i64>> {
        let mut doomed = Vec::new();
        self.for_each(|pm| {
            if pm.peer_id == peer_id && pm.peer_type == peer_type {
                doomed.push(pm.id);
            }
        })?;
        self.delete_many(&doomed)?;
        Ok(doomed)
    }

    pub fn request_ids_for(&self, msg_ids: &[i64]) -> Result<Vec<i64>> {
        self.inner.engine.view(|txn| {
            let mut out = Vec::with_capacity(msg_ids.len());
            for &msg_id in msg_ids {
                match get_pending(txn, msg_id) {
                    Ok(pm) => out.push(pm.request_id),
                    Err(StoreError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(out)
        })
    }

    fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(PendingMessage),
    {
        let prefix = keys::tag(PREFIX_BY_ID);
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            match bincode::deserialize::<PendingMessage>(value) {
                Ok(pm) => f(pm),
                Err(err) => tracing::warn!(%err, "skipping undecodable pending message"),
            }
            true
        })
    }
}

/// Render an outbox entry the way the history view expects it, so pending
/// and confirmed messages interleave naturally.
pub fn to_user_message(pm: &PendingMessage) -> UserMessage {
    UserMessage {
        id: pm.id,
        team_id: pm.team_id,
        peer_id: pm.peer_id,
        peer_type: pm.peer_type,
        sender_id: pm.sender_id,
        created_on: pm.created_on,
        body: pm.body.clone(),
        media: pm.media.clone(),
        entities: pm.entities.clone(),
        reply_to: pm.reply_to,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        (dir, store)
    }

    fn draft(random_id: i64, peer_id: i64, body: &str) -> DraftMessage {
        DraftMessage {
            random_id,
            peer: InputPeer {
                id: peer_id,
                kind: 1,
                access_hash: 99,
            },
            body: body.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn save_then_lookup_by_all_three_paths() {
        let (_dir, store) = open_store();
        let pending = store.pending_messages();

        let pm = pending.save(0, 7, -5, 1, &draft(12345, 42, "outgoing")).unwrap();
        assert_eq!(pm.id, -5);
        assert_eq!(pm.request_id, 12345);

        assert_eq!(pending.get_by_id(-5).unwrap().body, "outgoing");
        assert_eq!(pending.get_by_random_id(12345).unwrap().body, "outgoing");

        pending.save_by_real_id(12345, 900).unwrap();
        assert_eq!(pending.get_by_real_id(900).unwrap().body, "outgoing");
    }

    #[test]
    fn delete_removes_both_key_paths() {
        let (_dir, store) = open_store();
        let pending = store.pending_messages();

        pending.save(0, 7, -6, 1, &draft(777, 42, "bye")).unwrap();
        pending.delete(-6).unwrap();

        assert!(matches!(pending.get_by_id(-6), Err(StoreError::NotFound)));
        assert!(matches!(
            pending.get_by_random_id(777),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn per_peer_listing_and_bulk_delete() {
        let (_dir, store) = open_store();
        let pending = store.pending_messages();

        pending.save(0, 7, -1, 1, &draft(101, 42, "a")).unwrap();
        pending.save(0, 7, -2, 1, &draft(102, 42, "b")).unwrap();
        pending.save(0, 7, -3, 1, &draft(103, 43, "c")).unwrap();

        let msgs = pending.get_by_peer(0, 42, 1).unwrap();
        assert_eq!(msgs.len(), 2);

        assert_eq!(pending.request_ids_for(&[-1, -3, -9]).unwrap(), vec![101, 103]);

        let deleted = pending.delete_peer_all(42, 1).unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(pending.get_all().unwrap().len(), 1);
    }

    #[test]
    fn outbox_entries_render_as_user_messages() {
        let (_dir, store) = open_store();
        let pending = store.pending_messages();

        let pm = pending.save(0, 7, -8, 3, &draft(555, 42, "draft body")).unwrap();
        let um = to_user_message(&pm);
        assert_eq!(um.id, -8);
        assert_eq!(um.sender_id, 3);
        assert_eq!(um.body, "draft body");
        assert_eq!(um.peer_id, 42);
    }
}
