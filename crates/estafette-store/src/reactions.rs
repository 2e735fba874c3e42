//! Reaction usage counters, backing the "frequently used" reaction row.

use std::sync::Arc;

use crate::engine::Txn;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::store::StoreInner;

const PREFIX_USE_COUNT: &str = "REACTIONS_USE_CNT";

pub struct Reactions {
    inner: Arc<StoreInner>,
}

fn use_count_key(reaction: &str) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_USE_COUNT);
    keys::push_str(&mut k, reaction);
    k
}

fn get_use_count(txn: &Txn<'_>, reaction: &str) -> Result<u32> {
    match txn.get(use_count_key(reaction))? {
        Some(val) => {
            let arr: [u8; 4] = val.as_slice().try_into().map_err(|_| StoreError::InvalidData)?;
            Ok(u32::from_be_bytes(arr))
        }
        None => Ok(0),
    }
}

impl Reactions {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn use_count(&self, reaction: &str) -> Result<u32> {
        self.inner.engine.view(|txn| get_use_count(txn, reaction))
    }

    /// Adjust a reaction's usage counter, saturating at zero on the way
    /// down.
    pub fn increment_use_count(&self, reaction: &str, delta: i32) -> Result<()> {
        self.inner.engine.update(|txn| {
            let current = get_use_count(txn, reaction)?;
            let next = if delta < 0 {
                current.saturating_sub(delta.unsigned_abs())
            } else {
                current.saturating_add(delta as u32)
            };
            txn.put(use_count_key(reaction), next.to_be_bytes())?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};

    #[test]
    fn counters_saturate_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        let reactions = store.reactions();

        assert_eq!(reactions.use_count(":+1:").unwrap(), 0);
        reactions.increment_use_count(":+1:", 3).unwrap();
        reactions.increment_use_count(":+1:", -1).unwrap();
        assert_eq!(reactions.use_count(":+1:").unwrap(), 2);

        reactions.increment_use_count(":+1:", -10).unwrap();
        assert_eq!(reactions.use_count(":+1:").unwrap(), 0);
    }
}
