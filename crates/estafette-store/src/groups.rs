//! Group repository.

use std::sync::Arc;

use estafette_shared::{Group, GroupParticipant, ParticipantType, UserPhoto};

use crate::engine::Txn;
use crate::error::{Result, StoreError};
use crate::files;
use crate::keys;
use crate::search::{PeerDoc, PeerKind};
use crate::store::StoreInner;

const PREFIX_GROUPS: &str = "GRP";
const PREFIX_PARTICIPANTS: &str = "GRP_P";

pub struct Groups {
    inner: Arc<StoreInner>,
}

fn group_key(group_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_GROUPS);
    keys::push_i64(&mut k, group_id);
    k
}

fn participant_key(group_id: i64, user_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_PARTICIPANTS);
    keys::push_i64(&mut k, group_id);
    keys::push_i64(&mut k, user_id);
    k
}

fn participant_prefix(group_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_PARTICIPANTS);
    keys::push_i64(&mut k, group_id);
    k
}

fn group_doc_key(group_id: i64) -> String {
    format!("g.{group_id}")
}

fn parse_group_doc_key(key: &str) -> Option<i64> {
    key.strip_prefix("g.")?.parse().ok()
}

fn get_group(txn: &Txn<'_>, group_id: i64) -> Result<Group> {
    let val = txn.get(group_key(group_id))?.ok_or(StoreError::NotFound)?;
    Ok(bincode::deserialize(&val)?)
}

fn save_group(txn: &Txn<'_>, inner: &StoreInner, group: &Group) -> Result<()> {
    if let Some(photo) = &group.photo {
        files::save_peer_photo(txn, 0, group.id, 2, photo)?;
    }
    txn.put(group_key(group.id), bincode::serialize(group)?)?;
    inner.peer_indexer.enter(
        group_doc_key(group.id),
        PeerDoc {
            kind: PeerKind::Group,
            name: group.title.clone(),
            username: String::new(),
            phone: String::new(),
            team_id: group.team_id,
        },
    );
    Ok(())
}

impl Groups {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn save(&self, groups: &[Group]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for group in groups {
                save_group(txn, &self.inner, group)?;
            }
            Ok(())
        })
    }

    pub fn get(&self, group_id: i64) -> Result<Group> {
        self.inner.engine.view(|txn| get_group(txn, group_id))
    }

    pub fn get_many(&self, group_ids: &[i64]) -> Result<Vec<Group>> {
        self.inner.engine.view(|txn| {
            let mut out = Vec::with_capacity(group_ids.len());
            for &group_id in group_ids {
                match get_group(txn, group_id) {
                    Ok(group) => out.push(group),
                    Err(StoreError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(out)
        })
    }

    /// Delete the group record, its participants and its search document.
    pub fn delete(&self, group_id: i64) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(group_key(group_id))?;
            let prefix = participant_prefix(group_id);
            let iter = txn.iterator(rocksdb::IteratorMode::From(
                &prefix,
                rocksdb::Direction::Forward,
            ));
            let mut doomed = Vec::new();
            for item in iter {
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                doomed.push(key);
            }
            for key in doomed {
                txn.delete(&key)?;
            }
            self.inner.peer_remover.enter(group_doc_key(group_id), ());
            Ok(())
        })
    }

    pub fn add_participant(&self, group_id: i64, participant: &GroupParticipant) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.put(
                participant_key(group_id, participant.user_id),
                bincode::serialize(participant)?,
            )?;
            let mut group = get_group(txn, group_id)?;
            group.participants += 1;
            txn.put(group_key(group.id), bincode::serialize(&group)?)?;
            Ok(())
        })
    }

    pub fn remove_participant(&self, group_id: i64, user_ids: &[i64]) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut removed = 0;
            for &user_id in user_ids {
                if txn.get(participant_key(group_id, user_id))?.is_some() {
                    txn.delete(participant_key(group_id, user_id))?;
                    removed += 1;
                }
            }
            if removed > 0 {
                let mut group = get_group(txn, group_id)?;
                group.participants = (group.participants - removed).max(0);
                txn.put(group_key(group.id), bincode::serialize(&group)?)?;
            }
            Ok(())
        })
    }

    pub fn participants(&self, group_id: i64) -> Result<Vec<GroupParticipant>> {
        let prefix = participant_prefix(group_id);
        let mut out = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            match bincode::deserialize::<GroupParticipant>(value) {
                Ok(p) => out.push(p),
                Err(err) => tracing::warn!(%err, "skipping undecodable participant"),
            }
            true
        })?;
        Ok(out)
    }

    pub fn update_title(&self, group_id: i64, title: &str) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut group = get_group(txn, group_id)?;
            group.title = title.to_string();
            group.edited_on = chrono::Utc::now().timestamp();
            save_group(txn, &self.inner, &group)
        })
    }

    pub fn update_member_type(&self, group_id: i64, user_id: i64, admin: bool) -> Result<()> {
        self.inner.engine.update(|txn| {
            let val = txn
                .get(participant_key(group_id, user_id))?
                .ok_or(StoreError::NotFound)?;
            let mut participant: GroupParticipant = bincode::deserialize(&val)?;
            if participant.kind != ParticipantType::Creator {
                participant.kind = if admin {
                    ParticipantType::Admin
                } else {
                    ParticipantType::Member
                };
            }
            txn.put(
                participant_key(group_id, user_id),
                bincode::serialize(&participant)?,
            )?;
            Ok(())
        })
    }

    pub fn update_photo(&self, group_id: i64, photo: Option<UserPhoto>) -> Result<()> {
        self.inner.engine.update(|txn| {
            let mut group = get_group(txn, group_id)?;
            group.photo = photo.clone();
            save_group(txn, &self.inner, &group)
        })
    }

    pub fn search(&self, team_id: i64, phrase: &str) -> Result<Vec<Group>> {
        let hits = {
            let guard = self
                .inner
                .peer_search
                .read()
                .unwrap_or_else(|p| p.into_inner());
            match guard.as_ref() {
                Some(ix) => ix.search(&[PeerKind::Group], None, phrase, 64),
                None => Vec::new(),
            }
        };
        let ids: Vec<i64> = hits.iter().filter_map(|k| parse_group_doc_key(k)).collect();
        Ok(self
            .get_many(&ids)?
            .into_iter()
            .filter(|g| g.team_id == team_id)
            .collect())
    }

    pub fn reindex(&self) -> Result<()> {
        let prefix = keys::tag(PREFIX_GROUPS);
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            if let Ok(group) = bincode::deserialize::<Group>(value) {
                self.inner.peer_indexer.enter(
                    group_doc_key(group.id),
                    PeerDoc {
                        kind: PeerKind::Group,
                        name: group.title,
                        username: String::new(),
                        phone: String::new(),
                        team_id: group.team_id,
                    },
                );
            }
            true
        })
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

    fn group(id: i64, title: &str) -> Group {
        Group {
            id,
            team_id: 0,
            title: title.into(),
            created_on: 1_600_000_000,
            ..Default::default()
        }
    }

    fn participant(user_id: i64) -> GroupParticipant {
        GroupParticipant {
            user_id,
            first_name: format!("User{user_id}"),
            last_name: String::new(),
            access_hash: 0,
            kind: ParticipantType::Member,
        }
    }

    #[test]
    fn save_then_get_round_trip() {
        let (_dir, store) = open_store();
        let groups = store.groups();

        groups.save(&[group(1, "Rustaceans")]).unwrap();
        assert_eq!(groups.get(1).unwrap().title, "Rustaceans");

        groups.update_title(1, "Crustaceans").unwrap();
        let got = groups.get(1).unwrap();
        assert_eq!(got.title, "Crustaceans");
        assert!(got.edited_on > 0);
    }

    #[test]
    fn participant_management() {
        let (_dir, store) = open_store();
        let groups = store.groups();
        groups.save(&[group(2, "Team")]).unwrap();

        groups.add_participant(2, &participant(10)).unwrap();
        groups.add_participant(2, &participant(11)).unwrap();
        assert_eq!(groups.get(2).unwrap().participants, 2);
        assert_eq!(groups.participants(2).unwrap().len(), 2);

        groups.update_member_type(2, 10, true).unwrap();
        let ps = groups.participants(2).unwrap();
        let p10 = ps.iter().find(|p| p.user_id == 10).unwrap();
        assert_eq!(p10.kind, ParticipantType::Admin);

        groups.remove_participant(2, &[10, 99]).unwrap();
        assert_eq!(groups.get(2).unwrap().participants, 1);

        groups.delete(2).unwrap();
        assert!(matches!(groups.get(2), Err(StoreError::NotFound)));
        assert!(groups.participants(2).unwrap().is_empty());
    }
}
