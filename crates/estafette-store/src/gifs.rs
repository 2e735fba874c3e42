//! Saved-gif repository.
//!
//! Gif documents are keyed by `(cluster, doc)`; the listing order (most
//! recently used first) comes from the `gifs` secondary index keyed on
//! the last-access timestamp.

use std::sync::Arc;

use estafette_shared::{ClientFile, ClientFileType, MediaDocument};

use crate::engine::Txn;
use crate::error::{Result, StoreError};
use crate::files;
use crate::keys;
use crate::store::StoreInner;

const PREFIX_GIF: &str = "GIF";
const INDEX_GIFS: &str = "gifs";

pub struct Gifs {
    inner: Arc<StoreInner>,
}

fn gif_key(cluster_id: i32, doc_id: i64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_GIF);
    keys::push_i32(&mut k, cluster_id);
    keys::push_i64(&mut k, doc_id);
    k
}

fn gif_index_key(cluster_id: i32, doc_id: i64) -> String {
    format!("{PREFIX_GIF}.{cluster_id}.{doc_id}")
}

fn parse_gif_index_key(key: &str) -> Option<(i32, i64)> {
    let rest = key.strip_prefix("GIF.")?;
    let (cluster, doc) = rest.split_once('.')?;
    Some((cluster.parse().ok()?, doc.parse().ok()?))
}

fn get_gif(txn: &Txn<'_>, cluster_id: i32, doc_id: i64) -> Result<MediaDocument> {
    let val = txn
        .get(gif_key(cluster_id, doc_id))?
        .ok_or(StoreError::NotFound)?;
    Ok(bincode::deserialize(&val)?)
}

impl Gifs {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn save(&self, md: &MediaDocument) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.put(gif_key(md.doc.cluster_id, md.doc.id), bincode::serialize(md)?)?;
            files::save_file(
                txn,
                &ClientFile {
                    cluster_id: md.doc.cluster_id,
                    file_id: md.doc.id,
                    access_hash: md.doc.access_hash,
                    kind: ClientFileType::Gif,
                    mime_type: md.doc.mime_type.clone(),
                    extension: md.doc.extension(),
                    file_size: md.doc.file_size,
                    version: md.doc.version,
                    ..Default::default()
                },
            )
        })?;
        self.update_last_access(
            md.doc.cluster_id,
            md.doc.id,
            chrono::Utc::now().timestamp(),
        )
    }

    pub fn get(&self, cluster_id: i32, doc_id: i64) -> Result<MediaDocument> {
        self.inner
            .engine
            .view(|txn| get_gif(txn, cluster_id, doc_id))
    }

    pub fn is_saved(&self, cluster_id: i32, doc_id: i64) -> Result<bool> {
        match self.get(cluster_id, doc_id) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn update_last_access(
        &self,
        cluster_id: i32,
        doc_id: i64,
        access_time: i64,
    ) -> Result<()> {
        self.inner.index.set(
            INDEX_GIFS,
            &gif_index_key(cluster_id, doc_id),
            format!("{access_time:021}").as_bytes(),
        )
    }

    /// The saved gifs, most recently used first.
    pub fn saved(&self) -> Result<Vec<MediaDocument>> {
        let mut refs = Vec::new();
        self.inner.index.descend(INDEX_GIFS, |key, _| {
            if let Some(parsed) = parse_gif_index_key(key) {
                refs.push(parsed);
            }
            true
        })?;
        self.inner.engine.view(|txn| {
            let mut out = Vec::with_capacity(refs.len());
            for &(cluster_id, doc_id) in &refs {
                match get_gif(txn, cluster_id, doc_id) {
                    Ok(md) => out.push(md),
                    Err(StoreError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(out)
        })
    }

    pub fn delete(&self, cluster_id: i32, doc_id: i64) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(gif_key(cluster_id, doc_id))?;
            Ok(())
        })?;
        self.inner
            .index
            .delete(INDEX_GIFS, &gif_index_key(cluster_id, doc_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Store, StoreOptions};
    use estafette_shared::Document;

    fn gif(cluster_id: i32, doc_id: i64) -> MediaDocument {
        MediaDocument {
            doc: Document {
                id: doc_id,
                cluster_id,
                access_hash: 5,
                mime_type: "video/mp4".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn saved_lists_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        let gifs = store.gifs();

        gifs.save(&gif(1, 100)).unwrap();
        gifs.save(&gif(1, 200)).unwrap();
        gifs.update_last_access(1, 100, chrono::Utc::now().timestamp() + 60).unwrap();

        assert!(gifs.is_saved(1, 100).unwrap());
        assert!(!gifs.is_saved(1, 300).unwrap());

        let ids: Vec<i64> = gifs.saved().unwrap().iter().map(|g| g.doc.id).collect();
        assert_eq!(ids, vec![100, 200]);

        gifs.delete(1, 100).unwrap();
        let ids: Vec<i64> = gifs.saved().unwrap().iter().map(|g| g.doc.id).collect();
        assert_eq!(ids, vec![200]);
    }
}
