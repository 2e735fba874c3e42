//! Team repository.

use std::sync::Arc;

use estafette_shared::Team;

use crate::error::{Result, StoreError};
use crate::keys;
use crate::store::StoreInner;

const PREFIX_TEAMS: &str = "TEAMS";

pub struct Teams {
    inner: Arc<StoreInner>,
}

fn team_key(team_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_TEAMS);
    keys::push_i64(&mut k, team_id);
    k
}

impl Teams {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn list(&self) -> Result<Vec<Team>> {
        let prefix = keys::tag(PREFIX_TEAMS);
        let mut out = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            match bincode::deserialize::<Team>(value) {
                Ok(team) => out.push(team),
                Err(err) => tracing::warn!(%err, "skipping undecodable team"),
            }
            true
        })?;
        Ok(out)
    }

    pub fn get(&self, team_id: i64) -> Result<Team> {
        self.inner.engine.view(|txn| {
            let val = txn.get(team_key(team_id))?.ok_or(StoreError::NotFound)?;
            Ok(bincode::deserialize(&val)?)
        })
    }

    pub fn save(&self, teams: &[Team]) -> Result<()> {
        self.inner.engine.update(|txn| {
            for team in teams {
                txn.put(team_key(team.id), bincode::serialize(team)?)?;
            }
            Ok(())
        })
    }

    pub fn delete(&self, team_id: i64) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(team_key(team_id))?;
            Ok(())
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.inner.engine.drop_prefix(&keys::tag(PREFIX_TEAMS))
    }
}
