//! File repository.
//!
//! Tracks every file the client knows about (message attachments,
//! avatars, thumbnails, wallpapers, gifs) keyed by
//! `(cluster, file, access_hash)`, and maps each record to a
//! deterministic local path routed by media kind.  Voice notes go to the
//! non-user-visible cache directory instead of the audio directory, so
//! they never show up in the user's file manager.

use std::path::PathBuf;
use std::sync::Arc;

use estafette_shared::{
    ClientFile, ClientFileType, MediaClass, MediaSize, MessageMedia, PeerMediaInfo, FileRequest,
    UserMessage, UserPhoto, WallPaper,
};

use crate::engine::Txn;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::messages;
use crate::store::StoreInner;

const PREFIX_FILES: &str = "FILES";
const PREFIX_FILE_REQUESTS: &str = "FILES_REQ";

pub struct Files {
    inner: Arc<StoreInner>,
}

fn file_key(cluster_id: i32, file_id: i64, access_hash: u64) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_FILES);
    keys::push_i32(&mut k, cluster_id);
    keys::push_i64(&mut k, file_id);
    keys::push_u64(&mut k, access_hash);
    k
}

fn file_request_key(req_id: &str) -> Vec<u8> {
    let mut k = keys::tag(PREFIX_FILE_REQUESTS);
    keys::push_str(&mut k, req_id);
    k
}

pub(crate) fn save_file(txn: &Txn<'_>, file: &ClientFile) -> Result<()> {
    txn.put(
        file_key(file.cluster_id, file.file_id, file.access_hash),
        bincode::serialize(file)?,
    )?;
    Ok(())
}

fn get_file(txn: &Txn<'_>, cluster_id: i32, file_id: i64, access_hash: u64) -> Result<ClientFile> {
    let val = txn
        .get(file_key(cluster_id, file_id, access_hash))?
        .ok_or(StoreError::NotFound)?;
    Ok(bincode::deserialize(&val)?)
}

/// Extract and persist the file records referenced by a message's media
/// document (the document itself plus its thumbnail, if any).
pub(crate) fn save_message_media(txn: &Txn<'_>, message: &UserMessage) -> Result<()> {
    let MessageMedia::Document(md) = &message.media else {
        return Ok(());
    };
    save_file(
        txn,
        &ClientFile {
            cluster_id: md.doc.cluster_id,
            file_id: md.doc.id,
            access_hash: md.doc.access_hash,
            kind: ClientFileType::Message,
            mime_type: md.doc.mime_type.clone(),
            extension: md.doc.extension(),
            file_size: md.doc.file_size,
            message_id: message.id,
            peer_id: message.peer_id,
            peer_type: message.peer_type,
            version: md.doc.version,
            ..Default::default()
        },
    )?;
    if let Some(thumb) = &md.doc.thumbnail {
        save_file(
            txn,
            &ClientFile {
                cluster_id: thumb.cluster_id,
                file_id: thumb.file_id,
                access_hash: thumb.access_hash,
                kind: ClientFileType::Thumbnail,
                mime_type: "jpeg".into(),
                message_id: message.id,
                peer_id: message.peer_id,
                peer_type: message.peer_type,
                ..Default::default()
            },
        )?;
    }
    Ok(())
}

/// Persist the avatar file records of a user or group profile photo.
pub(crate) fn save_peer_photo(
    txn: &Txn<'_>,
    user_id: i64,
    group_id: i64,
    peer_type: i32,
    photo: &UserPhoto,
) -> Result<()> {
    let kind = if group_id != 0 {
        ClientFileType::GroupProfilePhoto
    } else {
        ClientFileType::AccountProfilePhoto
    };
    let peer_id = if group_id != 0 { group_id } else { user_id };
    save_file(
        txn,
        &ClientFile {
            cluster_id: photo.photo_big.cluster_id,
            file_id: photo.photo_big.file_id,
            access_hash: photo.photo_big.access_hash,
            kind,
            user_id,
            group_id,
            peer_id,
            peer_type,
            ..Default::default()
        },
    )?;
    save_file(
        txn,
        &ClientFile {
            cluster_id: photo.photo_small.cluster_id,
            file_id: photo.photo_small.file_id,
            access_hash: photo.photo_small.access_hash,
            kind: ClientFileType::Thumbnail,
            user_id,
            group_id,
            peer_id,
            peer_type,
            ..Default::default()
        },
    )?;
    Ok(())
}

pub(crate) fn save_wallpaper(txn: &Txn<'_>, wallpaper: &WallPaper) -> Result<()> {
    let Some(doc) = &wallpaper.document else {
        return Ok(());
    };
    save_file(
        txn,
        &ClientFile {
            cluster_id: doc.cluster_id,
            file_id: doc.id,
            access_hash: doc.access_hash,
            kind: ClientFileType::Wallpaper,
            mime_type: doc.mime_type.clone(),
            extension: doc.extension(),
            file_size: doc.file_size,
            wallpaper_id: wallpaper.id,
            version: doc.version,
            ..Default::default()
        },
    )?;
    if let Some(thumb) = &doc.thumbnail {
        save_file(
            txn,
            &ClientFile {
                cluster_id: thumb.cluster_id,
                file_id: thumb.file_id,
                access_hash: thumb.access_hash,
                kind: ClientFileType::Thumbnail,
                mime_type: "jpeg".into(),
                wallpaper_id: wallpaper.id,
                ..Default::default()
            },
        )?;
    }
    Ok(())
}

fn extension_for_mime(mime_type: &str) -> &'static str {
    match mime_type {
        "audio/ogg" => ".ogg",
        "audio/mpeg" => ".mp3",
        "audio/mp4" => ".m4a",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "application/pdf" => ".pdf",
        _ => "",
    }
}

impl Files {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub fn get(&self, cluster_id: i32, file_id: i64, access_hash: u64) -> Result<ClientFile> {
        self.inner
            .engine
            .view(|txn| get_file(txn, cluster_id, file_id, access_hash))
    }

    pub fn save(&self, file: &ClientFile) -> Result<()> {
        self.inner.engine.update(|txn| save_file(txn, file))
    }

    pub fn delete(&self, cluster_id: i32, file_id: i64, access_hash: u64) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(file_key(cluster_id, file_id, access_hash))?;
            Ok(())
        })
    }

    /// The file record behind a message's media document.
    pub fn get_media_document(&self, message: &UserMessage) -> Result<ClientFile> {
        let MessageMedia::Document(md) = &message.media else {
            return Err(StoreError::NotFound);
        };
        self.get(md.doc.cluster_id, md.doc.id, md.doc.access_hash)
    }

    /// Deterministic local path for a tracked file.
    ///
    /// Message and gif files route by mime type; `audio/ogg` is the voice
    /// note container and goes to the cache directory.
    pub fn file_path(&self, file: &ClientFile) -> PathBuf {
        let root = &self.inner.root;
        match file.kind {
            ClientFileType::Message | ClientFileType::Gif => {
                let mime = file.mime_type.to_lowercase();
                let ext = if file.extension.is_empty() {
                    extension_for_mime(&mime).to_string()
                } else {
                    file.extension.clone()
                };
                let name = format!("{}{}", file.file_id, ext);
                if mime == "audio/ogg" {
                    root.join("cache").join(format!("{}.ogg", file.file_id))
                } else if mime.starts_with("video/") {
                    root.join("video").join(name)
                } else if mime.starts_with("audio/") {
                    root.join("audio").join(name)
                } else if mime.starts_with("image/") {
                    root.join("photo").join(name)
                } else {
                    root.join("file").join(name)
                }
            }
            ClientFileType::AccountProfilePhoto => root
                .join("cache")
                .join(format!("u{}_{}.jpg", file.user_id, file.file_id)),
            ClientFileType::GroupProfilePhoto => root
                .join("cache")
                .join(format!("g{}_{}.jpg", file.group_id, file.file_id)),
            ClientFileType::Thumbnail => root
                .join("cache")
                .join(format!("{}{}.jpg", file.file_id, file.cluster_id)),
            ClientFileType::Wallpaper => root
                .join("photo")
                .join(format!("Wallpaper_{}{}.jpg", file.file_id, file.cluster_id)),
        }
    }

    /// Aggregate on-disk media size per (peer, media class) for one team.
    ///
    /// Streams the whole message table; records whose file no longer
    /// exists on disk are excluded silently — a stale entry is not an
    /// error here.
    pub fn cached_media(&self, team_id: i64) -> Result<Vec<PeerMediaInfo>> {
        use std::collections::HashMap;
        let mut sizes: HashMap<(i64, i32), HashMap<MediaClass, i64>> = HashMap::new();

        let prefix = keys::tag(messages::PREFIX_MESSAGES);
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            let Some(class) = messages::entry_media_class(value) else {
                return true;
            };
            if class == MediaClass::None {
                return true;
            }
            let Ok(message) = messages::decode_message(value) else {
                return true;
            };
            if message.team_id != team_id {
                return true;
            }
            let MessageMedia::Document(md) = &message.media else {
                return true;
            };
            let Ok(file) = self.get(md.doc.cluster_id, md.doc.id, md.doc.access_hash) else {
                return true;
            };
            if !self.file_path(&file).exists() {
                return true;
            }
            *sizes
                .entry((message.peer_id, message.peer_type))
                .or_default()
                .entry(class)
                .or_default() += md.doc.file_size;
            true
        })?;

        let mut out = Vec::with_capacity(sizes.len());
        for ((peer_id, peer_type), classes) in sizes {
            out.push(PeerMediaInfo {
                peer_id,
                peer_type,
                media: classes
                    .into_iter()
                    .map(|(class, total_size)| MediaSize { class, total_size })
                    .collect(),
            });
        }
        Ok(out)
    }

    /// Remove the on-disk files of a conversation's media in the given
    /// classes.  The store records stay; only the cached bytes go.
    pub fn delete_cached_media(
        &self,
        team_id: i64,
        peer_id: i64,
        peer_type: i32,
        classes: &[MediaClass],
    ) -> Result<()> {
        let prefix = messages::message_prefix(team_id, peer_id, peer_type);
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            let Some(class) = messages::entry_media_class(value) else {
                return true;
            };
            if !classes.contains(&class) {
                return true;
            }
            let Ok(message) = messages::decode_message(value) else {
                return true;
            };
            let MessageMedia::Document(md) = &message.media else {
                return true;
            };
            if let Ok(file) = self.get(md.doc.cluster_id, md.doc.id, md.doc.access_hash) {
                let _ = std::fs::remove_file(self.file_path(&file));
            }
            true
        })
    }

    /// Wipe every cached media file.
    pub fn clear_cache(&self) {
        for dir in ["audio", "file", "photo", "video", "cache"] {
            let path = self.inner.root.join(dir);
            let Ok(entries) = std::fs::read_dir(&path) else {
                continue;
            };
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Transfer requests
    // ------------------------------------------------------------------

    /// Persist a transfer request.  With `overwrite_only` set the request
    /// is written only when one already exists; returns whether a write
    /// happened.
    pub fn save_file_request(
        &self,
        req_id: &str,
        req: &FileRequest,
        overwrite_only: bool,
    ) -> Result<bool> {
        self.inner.engine.update(|txn| {
            let key = file_request_key(req_id);
            if overwrite_only && txn.get(&key)?.is_none() {
                return Ok(false);
            }
            txn.put(&key, bincode::serialize(req)?)?;
            Ok(true)
        })
    }

    pub fn file_request(&self, req_id: &str) -> Result<FileRequest> {
        self.inner.engine.view(|txn| {
            let val = txn
                .get(file_request_key(req_id))?
                .ok_or(StoreError::NotFound)?;
            Ok(bincode::deserialize(&val)?)
        })
    }

    pub fn delete_file_request(&self, req_id: &str) -> Result<()> {
        self.inner.engine.update(|txn| {
            txn.delete(file_request_key(req_id))?;
            Ok(())
        })
    }

    pub fn all_file_requests(&self) -> Result<Vec<FileRequest>> {
        let prefix = keys::tag(PREFIX_FILE_REQUESTS);
        let mut out = Vec::new();
        self.inner.engine.scan_prefix(&prefix, |_key, value| {
            match bincode::deserialize::<FileRequest>(value) {
                Ok(req) => out.push(req),
                Err(err) => tracing::warn!(%err, "skipping undecodable file request"),
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
    use estafette_shared::{Document, MediaDocument};

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_at(dir.path(), StoreOptions::default()).unwrap();
        (dir, store)
    }

    fn message_file(mime: &str, ext: &str) -> ClientFile {
        ClientFile {
            cluster_id: 1,
            file_id: 42,
            access_hash: 7,
            kind: ClientFileType::Message,
            mime_type: mime.into(),
            extension: ext.into(),
            ..Default::default()
        }
    }

    #[test]
    fn save_then_get_round_trip() {
        let (_dir, store) = open_store();
        let files = store.files();

        let f = message_file("application/pdf", ".pdf");
        files.save(&f).unwrap();
        assert_eq!(files.get(1, 42, 7).unwrap(), f);

        files.delete(1, 42, 7).unwrap();
        assert!(matches!(files.get(1, 42, 7), Err(StoreError::NotFound)));
    }

    #[test]
    fn path_routing_by_media_kind() {
        let (_dir, store) = open_store();
        let files = store.files();

        // Voice notes are hidden in the cache directory.
        let voice = message_file("audio/ogg", "");
        assert!(files.file_path(&voice).ends_with("cache/42.ogg"));

        let song = message_file("audio/mpeg", ".mp3");
        assert!(files.file_path(&song).ends_with("audio/42.mp3"));

        let clip = message_file("video/mp4", ".mp4");
        assert!(files.file_path(&clip).ends_with("video/42.mp4"));

        let photo = message_file("image/jpeg", "");
        assert!(files.file_path(&photo).ends_with("photo/42.jpg"));

        let other = message_file("application/zip", ".zip");
        assert!(files.file_path(&other).ends_with("file/42.zip"));

        let avatar = ClientFile {
            kind: ClientFileType::AccountProfilePhoto,
            user_id: 9,
            file_id: 42,
            ..Default::default()
        };
        assert!(files.file_path(&avatar).ends_with("cache/u9_42.jpg"));
    }

    #[test]
    fn message_media_extraction_registers_files() {
        let (_dir, store) = open_store();

        let message = UserMessage {
            id: 5,
            peer_id: 3,
            peer_type: 1,
            media: MessageMedia::Document(MediaDocument {
                doc: Document {
                    id: 1000,
                    cluster_id: 2,
                    access_hash: 11,
                    file_size: 2048,
                    mime_type: "image/png".into(),
                    thumbnail: Some(estafette_shared::FileLocation {
                        cluster_id: 2,
                        file_id: 1001,
                        access_hash: 12,
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        store.messages().save(std::slice::from_ref(&message)).unwrap();

        let files = store.files();
        assert_eq!(files.get(2, 1000, 11).unwrap().message_id, 5);
        let thumb = files.get(2, 1001, 12).unwrap();
        assert_eq!(thumb.kind, ClientFileType::Thumbnail);
    }

    #[test]
    fn cached_media_counts_only_files_present_on_disk() {
        let (_dir, store) = open_store();
        store
            .dialogs()
            .save_new(
                &estafette_shared::Dialog {
                    peer_id: 3,
                    peer_type: 1,
                    ..Default::default()
                },
                1,
            )
            .unwrap();

        let on_disk = UserMessage {
            id: 1,
            peer_id: 3,
            peer_type: 1,
            media: MessageMedia::Document(MediaDocument {
                doc: Document {
                    id: 2000,
                    cluster_id: 1,
                    access_hash: 1,
                    file_size: 512,
                    mime_type: "video/mp4".into(),
                    attributes: vec![estafette_shared::DocumentAttribute::Video {
                        width: 1,
                        height: 1,
                    }],
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut missing = on_disk.clone();
        missing.id = 2;
        if let MessageMedia::Document(md) = &mut missing.media {
            md.doc.id = 2001;
        }
        store
            .messages()
            .save(&[on_disk.clone(), missing.clone()])
            .unwrap();

        // Materialize only the first file.
        let files = store.files();
        let f = files.get(1, 2000, 1).unwrap();
        std::fs::write(files.file_path(&f), b"0000").unwrap();

        let report = files.cached_media(0).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].peer_id, 3);
        assert_eq!(report[0].media.len(), 1);
        assert_eq!(report[0].media[0].total_size, 512);
    }

    #[test]
    fn file_requests_round_trip() {
        let (_dir, store) = open_store();
        let files = store.files();

        let req = FileRequest {
            message_id: 1,
            cluster_id: 1,
            file_id: 10,
            access_hash: 3,
            total_parts: 8,
            ..Default::default()
        };

        // overwrite_only refuses to create.
        assert!(!files.save_file_request("req-1", &req, true).unwrap());
        assert!(files.save_file_request("req-1", &req, false).unwrap());
        assert!(files.save_file_request("req-1", &req, true).unwrap());

        assert_eq!(files.file_request("req-1").unwrap().total_parts, 8);
        assert_eq!(files.all_file_requests().unwrap().len(), 1);

        files.delete_file_request("req-1").unwrap();
        assert!(matches!(
            files.file_request("req-1"),
            Err(StoreError::NotFound)
        ));
    }
}
