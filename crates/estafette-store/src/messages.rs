//! Message repository.
//!
//! Primary key `MSG.(team, peer, peer_type, id)` gives natural per-
//! conversation ordering; a secondary `UMSG.(id)` pointer resolves a bare
//! message ID back to its conversation in O(1).  Both entries are written
//! in the same transaction — a pointer without its record (or the
//! reverse) must never be observable.
//!
//! Every stored value is prefixed with one media-class byte so history
//! filters can skip entries on a metadata comparison instead of a
//! deserialize-and-inspect round trip.

use std::sync::Arc;

use estafette_shared::{MediaClass, ReactionCounter, UserMessage};
use rocksdb::{Direction, IteratorMode};
use serde::{Deserialize, Serialize};

use crate::dialogs;
use crate::engine::Txn;
use crate::error::{Result, StoreError};
use crate::files;
use crate::keys;
use crate::labels;
use crate::search::MessageDoc;
use crate::store::StoreInner;

pub(crate) const PREFIX_MESSAGES: &str = "MSG";
const PREFIX_USER_MESSAGES: &str = "UMSG";
const PREFIX_MESSAGE_EXTRA: &str = "MSG_EX";

pub struct Messages {
    inner: Arc<StoreInner>,
}

// ---------------------------------------------------------------------------
// Keys and value envelope
// ---------------------------------------------------------------------------

pub(crate) fn message_key(team_id: i64, peer_id: i64, peer_type: i32, msg_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_MESSAGES);
    keys::push_i64(&mut k, team_id);
    keys::push_i64(&mut k, peer_id);
    keys::push_i32(&mut k, peer_type);
    keys::push_i64(&mut k, msg_id);
    k
}

pub(crate) fn message_prefix(team_id: i64, peer_id: i64, peer_type: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_MESSAGES);
    keys::push_i64(&mut k, team_id);
    keys::push_i64(&mut k, peer_id);
    keys::push_i32(&mut k, peer_type);
    k
}

fn user_message_key(msg_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_USER_MESSAGES);
    keys::push_i64(&mut k, msg_id);
    k
}

fn message_extra_key(team_id: i64, peer_id: i64, peer_type: i32) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_MESSAGE_EXTRA);
    keys::push_i64(&mut k, team_id);
    keys::push_i64(&mut k, peer_id);
    keys::push_i32(&mut k, peer_type);
    k
}

/// `[media class byte][bincode payload]`.
pub(crate) fn encode_message(message: &UserMessage) -> Result<(Vec<u8>, MediaClass)> {
    let class = MediaClass::derive(&message.media);
    let payload = bincode::serialize(message)?;
    let mut value = Vec::with_capacity(payload.len() + 1);
    value.push(class.as_byte());
    value.extend_from_slice(&payload);
    Ok((value, class))
}

pub(crate) fn decode_message(value: &[u8]) -> Result<UserMessage> {
    let (_meta, payload) = value.split_first().ok_or(StoreError::InvalidData)?;
    Ok(bincode::deserialize(payload)?)
}

pub(crate) fn entry_media_class(value: &[u8]) -> Option<MediaClass> {
    value.first().copied().and_then(MediaClass::from_byte)
}

/// Textual key used for search documents; also what search hits hand back.
pub(crate) fn message_doc_key(team_id: i64, peer_id: i64, peer_type: i32, msg_id: i64) -> String {
    format!("{team_id}.{peer_id}.{peer_type}.{msg_id}")
}

fn parse_doc_key(key: &str) -> Option<(i64, i64, i32, i64)> {
    let mut parts = key.split('.');
    let team_id = parts.next()?.parse().ok()?;
    let peer_id = parts.next()?.parse().ok()?;
    let peer_type = parts.next()?.parse().ok()?;
    let msg_id = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((team_id, peer_id, peer_type, msg_id))
}

// ---------------------------------------------------------------------------
// Transaction-level helpers shared with the other repositories
// ---------------------------------------------------------------------------

pub(crate) fn get_message_by_id(txn: &Txn<'_>, msg_id: i64) -> Result<UserMessage> {
    let pointer = txn
        .get(user_message_key(msg_id))?
        .ok_or(StoreError::NotFound)?;
    let pointer = std::str::from_utf8(&pointer).map_err(|_| StoreError::InvalidData)?;
    let mut parts = pointer.split('.');
    let (Some(team), Some(peer), Some(ptype), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(StoreError::InvalidData);
    };
    let team_id: i64 = team.parse().map_err(|_| StoreError::InvalidData)?;
    let peer_id: i64 = peer.parse().map_err(|_| StoreError::InvalidData)?;
    let peer_type: i32 = ptype.parse().map_err(|_| StoreError::InvalidData)?;
    get_message_by_key(txn, &message_key(team_id, peer_id, peer_type, msg_id))
}

pub(crate) fn get_message_by_key(txn: &Txn<'_>, key: &[u8]) -> Result<UserMessage> {
    let value = txn.get(key)?.ok_or(StoreError::NotFound)?;
    decode_message(&value)
}

/// Write the primary record and its global pointer, then enqueue the
/// search document.  The two engine entries commit atomically; the search
/// write is eventual by design.
pub(crate) fn save_message(txn: &Txn<'_>, inner: &StoreInner, message: &UserMessage) -> Result<()> {
    let (value, _class) = encode_message(message)?;
    txn.put(
        message_key(
            message.team_id,
            message.peer_id,
            message.peer_type,
            message.id,
        ),
        &value,
    )?;

    let pointer = format!(
        "{}.{}.{}",
        message.team_id, message.peer_id, message.peer_type
    );
    txn.put(user_message_key(message.id), pointer.as_bytes())?;

    inner.msg_indexer.enter(
        message_doc_key(
            message.team_id,
            message.peer_id,
            message.peer_type,
            message.id,
        ),
        MessageDoc {
            body: message.body.clone(),
            team_id: message.team_id,
            peer_id: message.peer_id,
            sender_id: message.sender_id,
        },
    );
    Ok(())
}

/// Forward-scan a conversation starting at `from_id` (inclusive), calling
/// `f` per decoded message until it returns `false`.  Records that fail to
/// decode are skipped, not fatal.
pub(crate) fn scan_conversation<F>(
    txn: &Txn<'_>,
    team_id: i64,
    peer_id: i64,
    peer_type: i32,
    from_id: i64,
    mut f: F,
) -> Result<()>
where
    F: FnMut(&UserMessage) -> bool,
{
    let prefix = message_prefix(team_id, peer_id, peer_type);
    let start = message_key(team_id, peer_id, peer_type, from_id);
    let iter = txn.iterator(IteratorMode::From(&start, Direction::Forward));
    for item in iter {
        let (key, value) = item?;
        if !key.starts_with(&prefix) {
            break;
        }
        match decode_message(&value) {
            Ok(message) => {
                if !f(&message) {
                    break;
                }
            }
            Err(err) => tracing::warn!(%err, "skipping undecodable message entry"),
        }
    }
    Ok(())
}

fn matches_filter(value: &[u8], filters: &[MediaClass]) -> bool {
    if filters.is_empty() {
        return true;
    }
    match entry_media_class(value) {
        Some(class) => filters.contains(&class),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Per-peer extras
// ---------------------------------------------------------------------------

/// Loosely typed per-conversation client state (scroll anchor).  Kept as a
/// JSON blob so upper layers can evolve it without a store migration.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MessagesExtra {
    scroll_id: i64,
}

impl Messages {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn get(&self, msg_id: i64) -> Result<UserMessage> {
        self.inner.engine.view(|txn| get_message_by_id(txn, msg_id))
    }

    /// Fetch a batch by bare IDs; missing or undecodable ones are skipped.
    pub fn get_many(&self, msg_ids: &[i64]) -> Result<Vec<UserMessage>> {
        self.inner.engine.view(|txn| {
            let mut out = Vec::with_capacity(msg_ids.len());
            for &msg_id in msg_ids {
                match get_message_by_id(txn, msg_id) {
                    Ok(m) => out.push(m),
                    Err(StoreError::NotFound) => {
                        tracing::warn!(msg_id, "get_many: message not found");
                    }
                    Err(err) => tracing::warn!(msg_id, %err, "get_many: skipping message"),
                }
            }
            Ok(out)
        })
    }

    pub fn top_message_id(&self, team_id: i64, peer_id: i64, peer_type: i32) -> Result<i64> {
        self.inner.engine.view(|txn| {
            let prefix = message_prefix(team_id, peer_id, peer_type);
            let seek = message_key(team_id, peer_id, peer_type, i64::MAX);
            let mut iter = txn.iterator(IteratorMode::From(&seek, Direction::Reverse));
            if let Some(item) = iter.next() {
                let (key, value) = item?;
                if key.starts_with(&prefix) {
                    return Ok(decode_message(&value)?.id);
                }
            }
            Ok(0)
        })
    }

    /// Paginated conversation history, newest first.
    ///
    /// Four addressing modes: both bounds zero resolves `max_id` from the
    /// dialog's top message; only `max_id` reverse-scans downward; only
    /// `min_id` forward-scans upward (result re-sorted descending); both
    /// set reverse-scans from `max_id` and stops once an item at or below
    /// `min_id` has been collected.  Filtered-out entries do not consume
    /// the limit.
    pub fn get_history(
        &self,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        min_id: i64,
        max_id: i64,
        limit: i32,
        filters: &[MediaClass],
    ) -> Result<Vec<UserMessage>> {
        let mut max_id = max_id;
        if max_id == 0 && min_id == 0 {
            max_id = match self.inner.engine.view(|txn| {
                Ok(dialogs::get_dialog(txn, team_id, peer_id, peer_type)?.top_message_id)
            }) {
                Ok(top) => top,
                Err(StoreError::NotFound) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
        }

        self.inner.engine.view(|txn| {
            let prefix = message_prefix(team_id, peer_id, peer_type);
            let mut out: Vec<UserMessage> = Vec::with_capacity(limit.max(0) as usize);
            let mut remaining = limit;

            if max_id != 0 {
                // Reverse scan from max_id downward.
                let seek = message_key(team_id, peer_id, peer_type, max_id);
                let iter = txn.iterator(IteratorMode::From(&seek, Direction::Reverse));
                for item in iter {
                    let (key, value) = item?;
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    if remaining <= 0 {
                        break;
                    }
                    if !matches_filter(&value, filters) {
                        continue;
                    }
                    match decode_message(&value) {
                        Ok(message) => {
                            let id = message.id;
                            out.push(message);
                            remaining -= 1;
                            if min_id != 0 && id <= min_id {
                                break;
                            }
                        }
                        Err(err) => tracing::warn!(%err, "skipping undecodable message entry"),
                    }
                }
            } else if min_id != 0 {
                // Forward scan from min_id, then newest first for a
                // consistent return order.
                let seek = message_key(team_id, peer_id, peer_type, min_id);
                let iter = txn.iterator(IteratorMode::From(&seek, Direction::Forward));
                for item in iter {
                    let (key, value) = item?;
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    if remaining <= 0 {
                        break;
                    }
                    if !matches_filter(&value, filters) {
                        continue;
                    }
                    match decode_message(&value) {
                        Ok(message) => {
                            out.push(message);
                            remaining -= 1;
                        }
                        Err(err) => tracing::warn!(%err, "skipping undecodable message entry"),
                    }
                }
                out.sort_by(|a, b| b.id.cmp(&a.id));
            }
            Ok(out)
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Save messages already known to the server (sync path): primary
    /// record, pointer, extracted file records and label associations.
    pub fn save(&self, messages: &[UserMessage]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for message in messages {
                save_message(txn, &self.inner, message)?;
                files::save_message_media(txn, message)?;
                for &label_id in &message.label_ids {
                    labels::add_label_to_message(
                        txn,
                        label_id,
                        message.peer_type,
                        message.peer_id,
                        message.id,
                    )?;
                }
            }
            Ok(())
        })
    }

    /// Save a newly arrived message and maintain its dialog: top message,
    /// last-activity ordering (unpinned dialogs only) and unread/mention
    /// counters for messages from others.
    pub fn save_new(&self, message: &UserMessage, user_id: i64) -> Result<()> {
        self.inner.engine.update(|txn| {
            save_message(txn, &self.inner, message)?;
            files::save_message_media(txn, message)?;

            let mut dialog = match dialogs::get_dialog(
                txn,
                message.team_id,
                message.peer_id,
                message.peer_type,
            ) {
                Ok(d) => d,
                Err(StoreError::NotFound) => {
                    tracing::info!(
                        team_id = message.team_id,
                        msg_id = message.id,
                        "new message without a dialog"
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if message.id > dialog.top_message_id {
                dialog.top_message_id = message.id;
                if !dialog.pinned {
                    dialogs::update_dialog_last_update(
                        &self.inner,
                        message.team_id,
                        message.peer_id,
                        message.peer_type,
                        message.created_on,
                    )?;
                }
                if message.sender_id != user_id {
                    dialog.unread_count += 1;
                    for entity in &message.entities {
                        use estafette_shared::EntityKind;
                        match entity.kind {
                            EntityKind::Mention if entity.user_id == user_id => {
                                dialog.mentioned_count += 1
                            }
                            EntityKind::MentionAll => dialog.mentioned_count += 1,
                            _ => {}
                        }
                    }
                }
            }
            dialogs::save_dialog(txn, &dialog)
        })
    }

    pub fn set_content_read(&self, msg_ids: &[i64]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for &msg_id in msg_ids {
                let mut message = get_message_by_id(txn, msg_id)?;
                message.content_read = true;
                save_message(txn, &self.inner, &message)?;
            }
            Ok(())
        })
    }

    pub fn update_reaction_counters(
        &self,
        msg_id: i64,
        reactions: Vec<ReactionCounter>,
        your_reactions: Vec<String>,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut message = match get_message_by_id(txn, msg_id) {
                Ok(m) => m,
                Err(StoreError::NotFound) => return Ok(()),
                Err(e) => return Err(e),
            };
            message.reactions = reactions.clone();
            message.your_reactions = your_reactions.clone();
            save_message(txn, &self.inner, &message)
        })
    }

    /// Delete messages from a conversation.
    ///
    /// Unwinds label associations and per-team label counts, keeps the
    /// `UMSG` pointer in lockstep, recomputes the dialog's new top message
    /// when the current top was deleted, and recomputes unread counters.
    /// When the last message of a dialog goes away the dialog is kept with
    /// its top unresolved — deliberately not deleted.
    pub fn delete(
        &self,
        user_id: i64,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        msg_ids: &[i64],
    ) -> Result<()> {
        if msg_ids.is_empty() {
            return Ok(());
        }
        let mut msg_ids = msg_ids.to_vec();
        msg_ids.sort_unstable();
        self.inner.engine.update(|txn| {
            let mut dialog = dialogs::get_dialog(txn, team_id, peer_id, peer_type)?;

            for &msg_id in &msg_ids {
                if let Ok(message) = get_message_by_id(txn, msg_id) {
                    for &label_id in &message.label_ids {
                        labels::remove_label_from_message(txn, label_id, msg_id)?;
                        labels::decrease_label_count(txn, team_id, label_id)?;
                    }
                }
                txn.delete(message_key(team_id, peer_id, peer_type, msg_id))?;
                txn.delete(user_message_key(msg_id))?;
            }

            let last = *msg_ids.last().expect("delete called with ids");
            if dialog.top_message_id == last {
                let prefix = message_prefix(team_id, peer_id, peer_type);
                let seek = message_key(team_id, peer_id, peer_type, dialog.top_message_id);
                let mut iter = txn.iterator(IteratorMode::From(&seek, Direction::Reverse));
                if let Some(item) = iter.next() {
                    let (key, value) = item?;
                    if key.starts_with(&prefix) {
                        if let Ok(message) = decode_message(&value) {
                            dialog.top_message_id = message.id;
                        }
                    }
                }
                // No older message found: the dialog stays, top unresolved.
            }

            let (unread, mentioned) = dialogs::count_dialog_unread(
                txn,
                team_id,
                peer_id,
                peer_type,
                user_id,
                dialog.read_inbox_max_id + 1,
            )?;
            dialog.unread_count = unread;
            dialog.mentioned_count = mentioned;
            dialogs::save_dialog(txn, &dialog)?;

            for &msg_id in &msg_ids {
                self.inner
                    .msg_remover
                    .enter(message_doc_key(team_id, peer_id, peer_type, msg_id), ());
            }
            Ok(())
        })
    }

    /// Delete every message of the conversation with ID <= `max_id`, then
    /// recompute the dialog counters.  The dialog's top message is left
    /// untouched.
    pub fn clear_history(
        &self,
        user_id: i64,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        max_id: i64,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let prefix = message_prefix(team_id, peer_id, peer_type);
            let max_key = message_key(team_id, peer_id, peer_type, max_id);
            let mut doomed = Vec::new();
            let iter = txn.iterator(IteratorMode::From(&prefix, Direction::Forward));
            for item in iter {
                let (key, value) = item?;
                if !key.starts_with(&prefix) || key.as_ref() > max_key.as_slice() {
                    break;
                }
                doomed.push((key, decode_message(&value).ok()));
            }
            for (key, message) in doomed {
                if let Some(message) = message {
                    for &label_id in &message.label_ids {
                        labels::remove_label_from_message(txn, label_id, message.id)?;
                        labels::decrease_label_count(txn, team_id, label_id)?;
                    }
                    txn.delete(user_message_key(message.id))?;
                    self.inner.msg_remover.enter(
                        message_doc_key(team_id, peer_id, peer_type, message.id),
                        (),
                    );
                }
                txn.delete(&key)?;
            }

            let mut dialog = dialogs::get_dialog(txn, team_id, peer_id, peer_type)?;
            let (unread, mentioned) =
                dialogs::count_dialog_unread(txn, team_id, peer_id, peer_type, user_id, max_id)?;
            dialog.unread_count = unread;
            dialog.mentioned_count = mentioned;
            dialogs::save_dialog(txn, &dialog)
        })
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    pub fn search_text(&self, team_id: i64, text: &str, limit: i32) -> Result<Vec<UserMessage>> {
        self.search(team_id, text, None, None, limit)
    }

    pub fn search_text_by_peer(
        &self,
        team_id: i64,
        text: &str,
        peer_id: i64,
        limit: i32,
    ) -> Result<Vec<UserMessage>> {
        self.search(team_id, text, Some(peer_id), None, limit)
    }

    pub fn search_by_sender(
        &self,
        team_id: i64,
        text: &str,
        sender_id: i64,
        peer_id: i64,
        limit: i32,
    ) -> Result<Vec<UserMessage>> {
        self.search(team_id, text, Some(peer_id), Some(sender_id), limit)
    }

    fn search(
        &self,
        team_id: i64,
        text: &str,
        peer_id: Option<i64>,
        sender_id: Option<i64>,
        limit: i32,
    ) -> Result<Vec<UserMessage>> {
        let guard = self
            .inner
            .msg_search
            .read()
            .unwrap_or_else(|p| p.into_inner());
        let Some(ix) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let hits = ix.search(team_id, text, peer_id, sender_id, limit.max(0) as usize);
        drop(guard);

        self.inner.engine.view(|txn| {
            let mut out = Vec::with_capacity(hits.len());
            for key in &hits {
                let Some((t, p, pt, id)) = parse_doc_key(key) else {
                    continue;
                };
                if t != team_id {
                    continue;
                }
                if let Ok(message) = get_message_by_key(txn, &message_key(t, p, pt, id)) {
                    out.push(message);
                }
            }
            Ok(out)
        })
    }

    /// Full-scan filter for messages carrying every one of `label_ids`,
    /// optionally narrowed to one peer.  Slow by design; label-first
    /// listing goes through the label repository instead.
    pub fn search_by_labels(
        &self,
        team_id: i64,
        label_ids: &[i32],
        peer_id: i64,
        limit: i32,
    ) -> Result<Vec<UserMessage>> {
        let prefix = keys::tag(PREFIX_MESSAGES);
        let mut out = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            if out.len() >= limit.max(0) as usize {
                return false;
            }
            let Ok(message) = decode_message(value) else {
                return true;
            };
            if message.team_id != team_id {
                return true;
            }
            if !label_ids.iter().all(|l| message.label_ids.contains(l)) {
                return true;
            }
            if peer_id != 0 && message.peer_id != peer_id {
                return true;
            }
            out.push(message);
            true
        })?;
        Ok(out)
    }

    /// All messages of one media class, via the metadata byte only.
    pub fn all_media(&self, class: MediaClass) -> Result<Vec<UserMessage>> {
        let prefix = keys::tag(PREFIX_MESSAGES);
        let mut out = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            if entry_media_class(value) == Some(class) {
                if let Ok(message) = decode_message(value) {
                    out.push(message);
                }
            }
            true
        })?;
        Ok(out)
    }

    /// Backfill the search index with any message it does not know yet.
    pub fn reindex(&self) -> Result<()> {
        let ready = crate::search::wait_until(10, std::time::Duration::from_secs(1), || {
            self.inner
                .msg_search
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .is_some()
        });
        if !ready {
            tracing::warn!("reindex skipped, message index unavailable");
            return Ok(());
        }

        let prefix = keys::tag(PREFIX_MESSAGES);
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            let Ok(message) = decode_message(value) else {
                return true;
            };
            let doc_key = message_doc_key(
                message.team_id,
                message.peer_id,
                message.peer_type,
                message.id,
            );
            let known = {
                let guard = self
                    .inner
                    .msg_search
                    .read()
                    .unwrap_or_else(|p| p.into_inner());
                guard.as_ref().map(|ix| ix.contains(&doc_key)).unwrap_or(true)
            };
            if !known {
                self.inner.msg_indexer.enter(
                    doc_key,
                    MessageDoc {
                        body: message.body.clone(),
                        team_id: message.team_id,
                        peer_id: message.peer_id,
                        sender_id: message.sender_id,
                    },
                );
            }
            true
        })
    }

    // ------------------------------------------------------------------
    // Per-peer extras
    // ------------------------------------------------------------------

    pub fn save_scroll_id(
        &self,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        msg_id: i64,
    ) -> Result<()> {
        let extra = MessagesExtra { scroll_id: msg_id };
        let bytes = serde_json::to_vec(&extra)?;
        self.inner.engine.update(|txn| {
            txn.put(message_extra_key(team_id, peer_id, peer_type), &bytes)?;
            Ok(())
        })
    }

    pub fn scroll_id(&self, team_id: i64, peer_id: i64, peer_type: i32) -> Result<i64> {
        self.inner.engine.view(|txn| {
            match txn.get(message_extra_key(team_id, peer_id, peer_type))? {
                Some(bytes) => {
                    let extra: MessagesExtra = serde_json::from_slice(&bytes)?;
                    Ok(extra.scroll_id)
                }
                None => Ok(0),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};
    use estafette_shared::{
        Dialog, DocumentAttribute, Document, MediaDocument, MessageMedia,
    };

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        (dir, store)
    }

    fn text_message(team_id: i64, peer_id: i64, id: i64, sender_id: i64, body: &str) -> UserMessage {
        UserMessage {
            id,
            team_id,
            peer_id,
            peer_type: 1,
            sender_id,
            created_on: 1_600_000_000 + id,
            body: body.to_string(),
            ..Default::default()
        }
    }

    fn media_message(team_id: i64, peer_id: i64, id: i64, sender_id: i64) -> UserMessage {
        let mut m = text_message(team_id, peer_id, id, sender_id, "clip");
        m.media = MessageMedia::Document(MediaDocument {
            doc: Document {
                id: id + 50_000,
                cluster_id: 1,
                access_hash: 7,
                file_size: 1024,
                mime_type: "video/mp4".into(),
                attributes: vec![DocumentAttribute::Video {
                    width: 640,
                    height: 480,
                }],
                ..Default::default()
            },
            ..Default::default()
        });
        m
    }

    fn seed_dialog(store: &Store, team_id: i64, peer_id: i64, top: i64) {
        let dialog = Dialog {
            team_id,
            peer_id,
            peer_type: 1,
            top_message_id: top,
            ..Default::default()
        };
        store.dialogs().save_new(&dialog, 1_600_000_000).unwrap();
    }

    #[test]
    fn save_then_get_round_trip() {
        let (_dir, store) = open_store();
        let messages = store.messages();

        let m = text_message(0, 11, 5, 3, "hello there");
        messages.save(std::slice::from_ref(&m)).unwrap();

        let got = messages.get(5).unwrap();
        assert_eq!(got, m);
    }

    #[test]
    fn missing_message_is_not_found() {
        let (_dir, store) = open_store();
        assert!(matches!(
            store.messages().get(404),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn clear_history_then_page_then_delete_top() {
        let (_dir, store) = open_store();
        store.set_self_user_id(1);
        let messages = store.messages();
        let peer_id = 21;

        seed_dialog(&store, 0, peer_id, 999);
        let batch: Vec<UserMessage> = (1..=999)
            .map(|id| text_message(0, peer_id, id, peer_id, "m"))
            .collect();
        messages.save(&batch).unwrap();

        messages.clear_history(1, 0, peer_id, 1, 995).unwrap();

        let history = messages.get_history(0, peer_id, 1, 0, 0, 100, &[]).unwrap();
        let ids: Vec<i64> = history.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![999, 998, 997, 996]);
        assert_eq!(
            store.dialogs().get(0, peer_id, 1).unwrap().top_message_id,
            999
        );

        messages.delete(1, 0, peer_id, 1, &[999]).unwrap();
        assert_eq!(
            store.dialogs().get(0, peer_id, 1).unwrap().top_message_id,
            998
        );
    }

    #[test]
    fn history_paging_modes() {
        let (_dir, store) = open_store();
        let messages = store.messages();
        let peer_id = 31;

        seed_dialog(&store, 0, peer_id, 50);
        let batch: Vec<UserMessage> = (1..=50)
            .map(|id| text_message(0, peer_id, id, peer_id, "m"))
            .collect();
        messages.save(&batch).unwrap();

        // Only max: reverse from it, inclusive.
        let ids: Vec<i64> = messages
            .get_history(0, peer_id, 1, 0, 30, 5, &[])
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![30, 29, 28, 27, 26]);

        // Only min: forward from it, returned newest first.
        let ids: Vec<i64> = messages
            .get_history(0, peer_id, 1, 40, 0, 5, &[])
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![44, 43, 42, 41, 40]);

        // Both: reverse from max, stops once min is collected.
        let ids: Vec<i64> = messages
            .get_history(0, peer_id, 1, 18, 20, 10, &[])
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![20, 19, 18]);
    }

    #[test]
    fn media_filter_does_not_consume_the_limit() {
        let (_dir, store) = open_store();
        let messages = store.messages();
        let peer_id = 41;

        seed_dialog(&store, 0, peer_id, 40);
        let batch: Vec<UserMessage> = (1..=40)
            .map(|id| {
                if id % 4 == 0 {
                    media_message(0, peer_id, id, peer_id)
                } else {
                    text_message(0, peer_id, id, peer_id, "m")
                }
            })
            .collect();
        messages.save(&batch).unwrap();

        let hits = messages
            .get_history(0, peer_id, 1, 0, 0, 10, &[MediaClass::Media])
            .unwrap();
        let ids: Vec<i64> = hits.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![40, 36, 32, 28, 24, 20, 16, 12, 8, 4]);
    }

    #[test]
    fn dialog_unread_after_delete() {
        let (_dir, store) = open_store();
        store.set_self_user_id(1);
        let messages = store.messages();
        let peer_id = 51;

        seed_dialog(&store, 0, peer_id, 0);
        for id in 10..=19 {
            messages
                .save_new(&text_message(0, peer_id, id, peer_id, "ping"), 1)
                .unwrap();
        }
        assert_eq!(
            store.dialogs().get(0, peer_id, 1).unwrap().top_message_id,
            19
        );
        assert_eq!(store.dialogs().get(0, peer_id, 1).unwrap().unread_count, 10);

        messages.delete(1, 0, peer_id, 1, &[19]).unwrap();
        let dialog = store.dialogs().get(0, peer_id, 1).unwrap();
        assert_eq!(dialog.top_message_id, 18);
        assert_eq!(dialog.unread_count, 9);
    }

    #[test]
    fn all_media_scans_by_metadata_byte() {
        let (_dir, store) = open_store();
        let messages = store.messages();

        seed_dialog(&store, 0, 61, 0);
        messages
            .save(&[
                text_message(0, 61, 1, 61, "plain"),
                media_message(0, 61, 2, 61),
                media_message(0, 61, 3, 61),
            ])
            .unwrap();

        let media = messages.all_media(MediaClass::Media).unwrap();
        let ids: Vec<i64> = media.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn scroll_id_round_trip() {
        let (_dir, store) = open_store();
        let messages = store.messages();
        assert_eq!(messages.scroll_id(0, 71, 1).unwrap(), 0);
        messages.save_scroll_id(0, 71, 1, 123).unwrap();
        assert_eq!(messages.scroll_id(0, 71, 1).unwrap(), 123);
    }

    #[test]
    fn search_text_is_eventually_consistent() {
        let (_dir, store) = open_store();
        let messages = store.messages();

        seed_dialog(&store, 0, 81, 0);
        messages
            .save(&[text_message(0, 81, 1, 81, "the quick brown fox")])
            .unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            let hits = messages.search_text(0, "quick", 10).unwrap();
            if hits.len() == 1 {
                assert_eq!(hits[0].id, 1);
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "message never became searchable"
            );
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }
}
