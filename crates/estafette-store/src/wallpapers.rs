//! Wallpaper repository.  The server sends the full gallery at once, so
//! `set` replaces everything.

use std::sync::Arc;

use estafette_shared::WallPaper;

use crate::error::Result;
use crate::files;
use crate::keys;
use crate::store::StoreInner;

const PREFIX_WALLPAPERS: &str = "WALLPAPER";

pub struct Wallpapers {
    inner: Arc<StoreInner>,
}

fn wallpaper_key(wallpaper_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_WALLPAPERS);
    keys::push_i64(&mut k, wallpaper_id);
    k
}

impl Wallpapers {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    /// Replace the stored gallery with `wallpapers`, registering their
    /// file records along the way.
    pub fn set(&self, wallpapers: &[WallPaper]) -> Result<()> {
        self.inner.engine.drop_prefix(&keys::tag(PREFIX_WALLPAPERS))?;
        self.inner.engine.update(|txn| {
            for wallpaper in wallpapers {
                txn.put(wallpaper_key(wallpaper.id), bincode::serialize(wallpaper)?)?;
                files::save_wallpaper(txn, wallpaper)?;
            }
            Ok(())
        })
    }

    pub fn list(&self) -> Result<Vec<WallPaper>> {
        let prefix = keys::tag(PREFIX_WALLPAPERS);
        let mut out = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            match bincode::deserialize::<WallPaper>(value) {
                Ok(w) => out.push(w),
                Err(err) => tracing::warn!(%err, "skipping undecodable wallpaper"),
            }
            true
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};
    use estafette_shared::Document;

    fn wallpaper(id: i64) -> WallPaper {
        WallPaper {
            id,
            document: Some(Document {
                id: id + 1000,
                cluster_id: 1,
                access_hash: 4,
                mime_type: "image/jpeg".into(),
                ..Default::default()
            }),
            dark: false,
        }
    }

    #[test]
    fn set_replaces_the_whole_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        let wallpapers = store.wallpapers();

        wallpapers.set(&[wallpaper(1), wallpaper(2)]).unwrap();
        assert_eq!(wallpapers.list().unwrap().len(), 2);

        wallpapers.set(&[wallpaper(3)]).unwrap();
        let listed = wallpapers.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 3);

        // The wallpaper's file record is registered too.
        assert!(store.files().get(1, 1003, 4).is_ok());
    }
}
