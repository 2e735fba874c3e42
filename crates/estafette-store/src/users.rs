//! User and contact repository.
//!
//! Users are global records; contacts are a per-team overlay on top of
//! them (the same person can be a contact in one team and a stranger in
//! another).  Every profile save also feeds the peer search index, with
//! the acting user indexed as the "Saved Messages" pseudo-contact.

use std::sync::Arc;

use estafette_shared::constants;
use estafette_shared::{ContactUser, PhoneContact, User, UserPhoto, UserStatus};

use crate::engine::Txn;
use crate::error::{Result, StoreError};
use crate::files;
use crate::keys;
use crate::search::{PeerDoc, PeerKind};
use crate::store::StoreInner;

const PREFIX_USERS: &str = "USERS";
const PREFIX_CONTACTS: &str = "CONTACTS";
const PREFIX_PHONE_CONTACTS: &str = "PH_CONTACTS";

pub struct Users {
    inner: Arc<StoreInner>,
}

fn user_key(user_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_USERS);
    keys::push_i64(&mut k, user_id);
    k
}

fn contact_key(team_id: i64, user_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_CONTACTS);
    keys::push_i64(&mut k, team_id);
    keys::push_i64(&mut k, user_id);
    k
}

fn contact_team_prefix(team_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_CONTACTS);
    keys::push_i64(&mut k, team_id);
    k
}

fn phone_contact_key(phone: &str) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_PHONE_CONTACTS);
    keys::push_str(&mut k, phone);
    k
}

pub(crate) fn user_doc_key(user_id: i64) -> String {
    format!("u.{user_id}")
}

fn contact_doc_key(team_id: i64, user_id: i64) -> String {
    format!("c.{team_id}.{user_id}")
}

fn parse_user_doc_key(key: &str) -> Option<i64> {
    key.strip_prefix("u.")?.parse().ok()
}

fn parse_contact_doc_key(key: &str) -> Option<(i64, i64)> {
    let rest = key.strip_prefix("c.")?;
    let (team, user) = rest.split_once('.')?;
    Some((team.parse().ok()?, user.parse().ok()?))
}

fn get_user(txn: &Txn<'_>, user_id: i64) -> Result<User> {
    let val = txn.get(user_key(user_id))?.ok_or(StoreError::NotFound)?;
    Ok(bincode::deserialize(&val)?)
}

fn get_contact(txn: &Txn<'_>, team_id: i64, user_id: i64) -> Result<ContactUser> {
    let val = txn
        .get(contact_key(team_id, user_id))?
        .ok_or(StoreError::NotFound)?;
    Ok(bincode::deserialize(&val)?)
}

/// Persist a user profile, stamping `last_update` and keeping the photo
/// gallery merged: a partial profile (photo without gallery) must not
/// wipe a previously stored gallery.
fn save_user(txn: &Txn<'_>, inner: &StoreInner, user: &User) -> Result<()> {
    let mut user = user.clone();
    user.last_update = chrono::Utc::now().timestamp();

    match (&user.photo, user.photo_gallery.is_empty()) {
        (None, _) => user.photo_gallery.clear(),
        (Some(photo), true) => {
            if let Ok(stored) = get_user(txn, user.id) {
                user.photo_gallery = stored.photo_gallery;
            }
            files::save_peer_photo(txn, user.id, 0, 1, photo)?;
        }
        (Some(_), false) => {
            for photo in &user.photo_gallery {
                files::save_peer_photo(txn, user.id, 0, 1, photo)?;
            }
        }
    }

    txn.put(user_key(user.id), bincode::serialize(&user)?)?;

    let doc = if user.id == inner.self_user_id() {
        PeerDoc {
            kind: PeerKind::User,
            name: "Saved Messages".into(),
            username: "savedmessages".into(),
            phone: String::new(),
            team_id: 0,
        }
    } else {
        PeerDoc {
            kind: PeerKind::User,
            name: format!("{} {}", user.first_name, user.last_name)
                .trim()
                .to_string(),
            username: user.username.clone(),
            phone: user.phone.clone(),
            team_id: 0,
        }
    };
    inner.peer_indexer.enter(user_doc_key(user.id), doc);
    Ok(())
}

fn save_contact(txn: &Txn<'_>, inner: &StoreInner, team_id: i64, contact: &ContactUser) -> Result<()> {
    txn.put(
        contact_key(team_id, contact.id),
        bincode::serialize(contact)?,
    )?;
    inner.peer_indexer.enter(
        contact_doc_key(team_id, contact.id),
        PeerDoc {
            kind: PeerKind::Contact,
            name: format!("{} {}", contact.first_name, contact.last_name)
                .trim()
                .to_string(),
            username: contact.username.clone(),
            phone: contact.phone.clone(),
            team_id,
        },
    );
    Ok(())
}

/// Presence shown in dialog lists decays with time since last seen.
fn refresh_status(user: &mut User) {
    let delta = chrono::Utc::now().timestamp() - user.last_seen;
    if user.status == UserStatus::Online && delta < constants::MINUTE {
        return;
    }
    user.status = if delta < constants::HOUR {
        UserStatus::Recently
    } else if delta < constants::WEEK {
        UserStatus::LastWeek
    } else if delta < constants::MONTH {
        UserStatus::LastMonth
    } else {
        UserStatus::Offline
    };
}

impl Users {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn get(&self, user_id: i64) -> Result<User> {
        let mut user = self.inner.engine.view(|txn| get_user(txn, user_id))?;
        refresh_status(&mut user);
        Ok(user)
    }

    pub fn get_many(&self, user_ids: &[i64]) -> Result<Vec<User>> {
        self.inner.engine.view(|txn| {
            let mut out = Vec::with_capacity(user_ids.len());
            for &user_id in user_ids {
                match get_user(txn, user_id) {
                    Ok(mut user) => {
                        refresh_status(&mut user);
                        out.push(user);
                    }
                    Err(StoreError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(out)
        })
    }

    /// Save profiles.  Records with a blank name are dropped: they are
    /// placeholder objects the server sends for inaccessible users.
    pub fn save(&self, users: &[User]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for user in users {
                if user.first_name.trim().is_empty() && user.last_name.trim().is_empty() {
                    continue;
                }
                save_user(txn, &self.inner, user)?;
            }
            Ok(())
        })
    }

    pub fn update_profile(
        &self,
        user_id: i64,
        first_name: &str,
        last_name: &str,
        username: &str,
        bio: &str,
        phone: &str,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut user = get_user(txn, user_id)?;
            user.first_name = first_name.to_string();
            user.last_name = last_name.to_string();
            user.username = username.to_string();
            user.bio = bio.to_string();
            user.phone = phone.to_string();
            save_user(txn, &self.inner, &user)
        })
    }

    pub fn update_blocked(&self, user_id: i64, blocked: bool) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut user = match get_user(txn, user_id) {
                Ok(u) => u,
                Err(StoreError::NotFound) => return Ok(()),
                Err(e) => return Err(e),
            };
            user.blocked = blocked;
            save_user(txn, &self.inner, &user)
        })
    }

    pub fn update_photo(&self, user_id: i64, photo: Option<UserPhoto>) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut user = get_user(txn, user_id)?;
            user.photo = photo.clone();
            save_user(txn, &self.inner, &user)
        })
    }

    pub fn access_hash(&self, user_id: i64) -> Result<u64> {
        Ok(self.get(user_id)?.access_hash)
    }

    // ------------------------------------------------------------------
    // Contacts
    // ------------------------------------------------------------------

    pub fn save_contact(&self, team_id: i64, contacts: &[ContactUser]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for contact in contacts {
                save_contact(txn, &self.inner, team_id, contact)?;
            }
            Ok(())
        })
    }

    pub fn get_contact(&self, team_id: i64, user_id: i64) -> Result<ContactUser> {
        self.inner
            .engine
            .view(|txn| get_contact(txn, team_id, user_id))
    }

    pub fn get_contacts(&self, team_id: i64) -> Result<Vec<ContactUser>> {
        let prefix = contact_team_prefix(team_id);
        let mut out = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            match bincode::deserialize::<ContactUser>(value) {
                Ok(contact) => out.push(contact),
                Err(err) => tracing::warn!(%err, "skipping undecodable contact"),
            }
            true
        })?;
        Ok(out)
    }

    pub fn update_contact_info(
        &self,
        team_id: i64,
        user_id: i64,
        first_name: &str,
        last_name: &str,
    ) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut contact = get_contact(txn, team_id, user_id)?;
            contact.first_name = first_name.to_string();
            contact.last_name = last_name.to_string();
            save_contact(txn, &self.inner, team_id, &contact)
        })
    }

    pub fn delete_contact(&self, team_id: i64, user_ids: &[i64]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for &user_id in user_ids {
                txn.delete(contact_key(team_id, user_id))?;
                self.inner
                    .peer_remover
                    .enter(contact_doc_key(team_id, user_id), ());
            }
            Ok(())
        })
    }

    pub fn delete_all_contacts(&self, team_id: i64) -> Result<()> {
        let doomed: Vec<i64> = self.get_contacts(team_id)?.iter().map(|c| c.id).collect();
        self.delete_contact(team_id, &doomed)
    }

    // ------------------------------------------------------------------
    // Phone contacts
    // ------------------------------------------------------------------

    pub fn save_phone_contact(&self, contacts: &[PhoneContact]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for contact in contacts {
                txn.put(
                    phone_contact_key(&contact.phone),
                    bincode::serialize(contact)?,
                )?;
            }
            Ok(())
        })
    }

    pub fn phone_contacts(&self, limit: usize) -> Result<Vec<PhoneContact>> {
        let prefix = keys::tag(PREFIX_PHONE_CONTACTS);
        let mut out = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            if out.len() >= limit {
                return false;
            }
            if let Ok(contact) = bincode::deserialize::<PhoneContact>(value) {
                out.push(contact);
            }
            true
        })?;
        Ok(out)
    }

    pub fn delete_phone_contact(&self, contacts: &[PhoneContact]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for contact in contacts {
                txn.delete(phone_contact_key(&contact.phone))?;
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    pub fn search_users(&self, phrase: &str) -> Result<Vec<User>> {
        let hits = self.peer_hits(&[PeerKind::User], None, phrase);
        let ids: Vec<i64> = hits.iter().filter_map(|k| parse_user_doc_key(k)).collect();
        self.get_many(&ids)
    }

    pub fn search_contacts(&self, team_id: i64, phrase: &str) -> Result<Vec<ContactUser>> {
        let hits = self.peer_hits(&[PeerKind::Contact], Some(team_id), phrase);
        self.inner.engine.view(|txn| {
            let mut out = Vec::with_capacity(hits.len());
            for key in &hits {
                let Some((team, user_id)) = parse_contact_doc_key(key) else {
                    continue;
                };
                if team != team_id {
                    continue;
                }
                if let Ok(contact) = get_contact(txn, team, user_id) {
                    out.push(contact);
                }
            }
            Ok(out)
        })
    }

    /// Users matching the phrase who are not contacts in any team,
    /// rendered as contact entries for the compose screen.
    pub fn search_non_contacts(&self, phrase: &str) -> Result<Vec<ContactUser>> {
        let users = self.search_users(phrase)?;
        Ok(users
            .into_iter()
            .map(|u| ContactUser {
                id: u.id,
                first_name: u.first_name,
                last_name: u.last_name,
                username: u.username,
                phone: u.phone,
                access_hash: u.access_hash,
                client_id: 0,
                photo: u.photo,
            })
            .collect())
    }

    fn peer_hits(&self, kinds: &[PeerKind], team_id: Option<i64>, phrase: &str) -> Vec<String> {
        let guard = self
            .inner
            .peer_search
            .read()
            .unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(ix) => ix.search(kinds, team_id, phrase, 64),
            None => Vec::new(),
        }
    }

    /// Re-feed every user and contact into the peer search index.
    pub fn reindex(&self, team_id: i64) -> Result<()> {
        let prefix = keys::tag(PREFIX_USERS);
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            if let Ok(user) = bincode::deserialize::<User>(value) {
                self.inner.peer_indexer.enter(
                    user_doc_key(user.id),
                    PeerDoc {
                        kind: PeerKind::User,
                        name: format!("{} {}", user.first_name, user.last_name)
                            .trim()
                            .to_string(),
                        username: user.username,
                        phone: user.phone,
                        team_id: 0,
                    },
                );
            }
            true
        })?;

        let prefix = contact_team_prefix(team_id);
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            if let Ok(contact) = bincode::deserialize::<ContactUser>(value) {
                self.inner.peer_indexer.enter(
                    contact_doc_key(team_id, contact.id),
                    PeerDoc {
                        kind: PeerKind::Contact,
                        name: format!("{} {}", contact.first_name, contact.last_name)
                            .trim()
                            .to_string(),
                        username: contact.username,
                        phone: contact.phone,
                        team_id,
                    },
                );
            }
            true
        })
    }
}
