//! System key/value repository: connection state, server salts, update
//! offsets and other small untyped values the sync layer tracks.

use std::sync::Arc;

use crate::error::{Result, StoreError};
use crate::keys;
use crate::store::StoreInner;

const PREFIX_SYSTEM: &str = "SYS";

pub struct System {
    inner: Arc<StoreInner>,
}

fn system_key(name: &str) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_SYSTEM);
    keys::push_str(&mut k, name);
    k
}

impl System {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Missing keys read as zero; older 4-byte values are still accepted.
    pub fn load_int(&self, name: &str) -> Result<u64> {
        self.inner.engine.view(|txn| {
            match txn.get(system_key(name))? {
                Some(val) => match val.len() {
                    4 => {
                        let arr: [u8; 4] = val.as_slice().try_into().unwrap();
                        Ok(u32::from_be_bytes(arr) as u64)
                    }
                    8 => {
                        let arr: [u8; 8] = val.as_slice().try_into().unwrap();
                        Ok(u64::from_be_bytes(arr))
                    }
                    _ => Err(StoreError::InvalidData),
                },
                None => Ok(0),
            }
        })
    }

    pub fn load_string(&self, name: &str) -> Result<String> {
        self.inner.engine.view(|txn| {
            let val = txn.get(system_key(name))?.ok_or(StoreError::NotFound)?;
            String::from_utf8(val).map_err(|_| StoreError::InvalidData)
        })
    }

    pub fn load_bytes(&self, name: &str) -> Result<Vec<u8>> {
        self.inner.engine.view(|txn| {
            txn.get(system_key(name))?.ok_or(StoreError::NotFound)
        })
    }

    pub fn save_int(&self, name: &str, value: u64) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.put(system_key(name), value.to_be_bytes())?;
            Ok(())
        })
    }

    pub fn save_string(&self, name: &str, value: &str) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.put(system_key(name), value.as_bytes())?;
            Ok(())
        })
    }

    pub fn save_bytes(&self, name: &str, value: &[u8]) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.put(system_key(name), value)?;
            Ok(())
        })
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(system_key(name))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};

    #[test]
    fn typed_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        let system = store.system();

        assert_eq!(system.load_int("update-id").unwrap(), 0);
        system.save_int("update-id", 42).unwrap();
        assert_eq!(system.load_int("update-id").unwrap(), 42);

        system.save_string("auth-state", "ready").unwrap();
        assert_eq!(system.load_string("auth-state").unwrap(), "ready");

        system.save_bytes("salt", &[1, 2, 3]).unwrap();
        assert_eq!(system.load_bytes("salt").unwrap(), vec![1, 2, 3]);

        system.delete("auth-state").unwrap();
        assert!(matches!(
            system.load_string("auth-state"),
            Err(StoreError::NotFound)
        ));
    }
}
