//! Domain model structs persisted in the local store.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be encoded
//! with bincode for the key-value engine and handed directly to the UI
//! layer over IPC.  Identifiers are server-assigned `i64`s throughout.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

/// The kind of conversation partner a peer identifier refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PeerType {
    User,
    Group,
}

impl PeerType {
    /// Stable numeric code used inside composite store keys.
    pub fn code(self) -> i32 {
        match self {
            PeerType::User => 1,
            PeerType::Group => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(PeerType::User),
            2 => Some(PeerType::Group),
            _ => None,
        }
    }
}

/// A conversation partner reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Peer {
    pub id: i64,
    pub kind: PeerType,
    pub access_hash: u64,
}

// ---------------------------------------------------------------------------
// Dialog
// ---------------------------------------------------------------------------

/// Per-peer notification preferences, persisted on the dialog record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifySettings {
    /// Epoch seconds until which the dialog is muted; 0 means not muted.
    pub mute_until: i64,
    pub sound: String,
    pub flags: i32,
}

/// The per-(team, peer) conversation summary record.
///
/// `unread_count` and `mentioned_count` are derived values: they are always
/// recomputable by scanning the conversation's messages with an ID above
/// `read_inbox_max_id` whose sender is not the acting user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dialog {
    pub team_id: i64,
    pub peer_id: i64,
    pub peer_type: i32,
    pub top_message_id: i64,
    pub read_inbox_max_id: i64,
    pub read_outbox_max_id: i64,
    pub unread_count: i32,
    pub mentioned_count: i32,
    pub pinned: bool,
    pub notify_settings: Option<NotifySettings>,
    pub active_call_id: i64,
    pub pinned_message_id: i64,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Rich-text annotation kinds carried alongside a message body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntityKind {
    Mention,
    MentionAll,
    Bold,
    Italic,
    Code,
    Url,
    Hashtag,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEntity {
    pub kind: EntityKind,
    pub offset: u32,
    pub length: u32,
    /// For `Mention`: the user the entity addresses.  Zero otherwise.
    pub user_id: i64,
}

/// Typed attributes attached to a media document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DocumentAttribute {
    File { name: String },
    Audio { voice: bool, duration: i32 },
    Video { width: u32, height: u32 },
    Photo { width: u32, height: u32 },
    Animated,
}

/// A reference to a file stored on a file cluster.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileLocation {
    pub cluster_id: i32,
    pub file_id: i64,
    pub access_hash: u64,
}

/// A server-side document (the payload of an attachment).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: i64,
    pub access_hash: u64,
    pub cluster_id: i32,
    pub file_size: i64,
    pub mime_type: String,
    pub attributes: Vec<DocumentAttribute>,
    pub thumbnail: Option<FileLocation>,
    pub version: i32,
}

impl Document {
    /// File extension carried by the document's file attribute, if any.
    pub fn extension(&self) -> String {
        for attr in &self.attributes {
            if let DocumentAttribute::File { name } = attr {
                if let Some(idx) = name.rfind('.') {
                    return name[idx..].to_string();
                }
            }
        }
        String::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaDocument {
    pub doc: Document,
    pub caption: String,
}

/// A document hosted outside the file clusters, addressed by URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaWebDocument {
    pub url: String,
    pub attributes: Vec<DocumentAttribute>,
}

/// Message attachment payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum MessageMedia {
    #[default]
    None,
    Document(MediaDocument),
    WebDocument(MediaWebDocument),
    Contact {
        first_name: String,
        last_name: String,
        phone: String,
    },
    Geo {
        lat: f64,
        long: f64,
    },
}

/// Coarse media category derived once at write time and stored as entry
/// metadata, so media-only history filters compare a single byte instead of
/// deserializing every message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaClass {
    None = 0,
    /// Photos and videos.
    Media = 1,
    Audio = 2,
    Voice = 3,
    Gif = 4,
    File = 5,
}

impl MediaClass {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MediaClass::None),
            1 => Some(MediaClass::Media),
            2 => Some(MediaClass::Audio),
            3 => Some(MediaClass::Voice),
            4 => Some(MediaClass::Gif),
            5 => Some(MediaClass::File),
            _ => None,
        }
    }

    /// Derive the class of a message attachment.
    ///
    /// Walks the document attributes in order: an audio attribute maps to
    /// `Voice` or `Audio` depending on its voice flag, photo and video map
    /// to `Media`, animated maps to `Gif`, and a file attribute only
    /// upgrades `None` to `File`.  `Gif` is terminal; once seen, later
    /// attributes cannot change the class.  Both cluster documents and web
    /// documents are classified from their attributes the same way.
    pub fn derive(media: &MessageMedia) -> Self {
        let attrs = match media {
            MessageMedia::Document(d) => &d.doc.attributes,
            MessageMedia::WebDocument(d) => &d.attributes,
            _ => return MediaClass::None,
        };
        let mut class = MediaClass::None;
        for attr in attrs {
            if class == MediaClass::Gif {
                break;
            }
            match attr {
                DocumentAttribute::Audio { voice: true, .. } => class = MediaClass::Voice,
                DocumentAttribute::Audio { voice: false, .. } => class = MediaClass::Audio,
                DocumentAttribute::Video { .. } | DocumentAttribute::Photo { .. } => {
                    class = MediaClass::Media
                }
                DocumentAttribute::Animated => class = MediaClass::Gif,
                DocumentAttribute::File { .. } => {
                    if class == MediaClass::None {
                        class = MediaClass::File;
                    }
                }
            }
        }
        class
    }
}

/// A single chat message as stored locally.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserMessage {
    pub id: i64,
    pub team_id: i64,
    pub peer_id: i64,
    pub peer_type: i32,
    pub sender_id: i64,
    pub created_on: i64,
    pub edited_on: i64,
    pub fwd_sender_id: i64,
    pub body: String,
    pub media: MessageMedia,
    pub entities: Vec<MessageEntity>,
    pub reply_to: i64,
    pub content_read: bool,
    pub label_ids: Vec<i32>,
    pub reactions: Vec<ReactionCounter>,
    pub your_reactions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionCounter {
    pub reaction: String,
    pub total: i32,
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A message label.  Definitions are global; the usage `count` is tracked
/// per team and filled in by the store on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Label {
    pub id: i32,
    pub name: String,
    pub colour: String,
    pub count: i32,
}

/// The contiguous span of message IDs for which the local store holds a
/// complete view of a label's membership.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelBar {
    pub min_id: i64,
    pub max_id: i64,
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// The user-supplied part of an outgoing text message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DraftMessage {
    pub random_id: i64,
    pub peer: InputPeer,
    pub body: String,
    pub entities: Vec<MessageEntity>,
    pub reply_to: i64,
    pub clear_draft: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputPeer {
    pub id: i64,
    pub kind: i32,
    pub access_hash: u64,
}

/// A locally created message awaiting server confirmation.
///
/// Tracked under three key paths: the locally generated ID, the client
/// random/request ID, and (after confirmation) the server-assigned real ID.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PendingMessage {
    pub id: i64,
    pub request_id: i64,
    pub team_id: i64,
    pub team_access_hash: u64,
    pub access_hash: u64,
    pub peer_id: i64,
    pub peer_type: i32,
    pub sender_id: i64,
    pub created_on: i64,
    pub body: String,
    pub entities: Vec<MessageEntity>,
    pub reply_to: i64,
    pub clear_draft: bool,
    pub media: MessageMedia,
    pub file_id: i64,
    pub thumb_id: i64,
    pub file_upload_id: String,
    pub thumb_upload_id: String,
    pub file_total_parts: i32,
    pub sha256: Vec<u8>,
    pub server_file: Option<FileLocation>,
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// What a locally tracked file is used for; decides its on-disk routing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientFileType {
    #[default]
    Message,
    AccountProfilePhoto,
    GroupProfilePhoto,
    Thumbnail,
    Wallpaper,
    Gif,
}

/// Metadata for a file referenced by a message, avatar, wallpaper or gif.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientFile {
    pub cluster_id: i32,
    pub file_id: i64,
    pub access_hash: u64,
    pub kind: ClientFileType,
    pub mime_type: String,
    pub extension: String,
    pub user_id: i64,
    pub group_id: i64,
    pub file_size: i64,
    pub message_id: i64,
    pub peer_id: i64,
    pub peer_type: i32,
    pub wallpaper_id: i64,
    pub version: i32,
}

/// State of an in-flight file transfer, persisted so a download or upload
/// can resume across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileRequest {
    pub message_id: i64,
    pub cluster_id: i32,
    pub file_id: i64,
    pub access_hash: u64,
    pub file_path: String,
    pub temp_path: String,
    pub downloaded_parts: Vec<i32>,
    pub total_parts: i32,
    pub canceled: bool,
    pub peer_id: i64,
    pub peer_type: i32,
}

/// Aggregated on-disk media usage for one peer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PeerMediaInfo {
    pub peer_id: i64,
    pub peer_type: i32,
    pub media: Vec<MediaSize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaSize {
    pub class: MediaClass,
    pub total_size: i64,
}

// ---------------------------------------------------------------------------
// Users, contacts, groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum UserStatus {
    #[default]
    Offline,
    Online,
    Recently,
    LastWeek,
    LastMonth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserPhoto {
    pub photo_id: i64,
    pub photo_big: FileLocation,
    pub photo_small: FileLocation,
}

/// A user profile.  `last_update` records when the profile was last written
/// and is used to decide staleness independently of the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub phone: String,
    pub bio: String,
    pub access_hash: u64,
    pub status: UserStatus,
    pub last_seen: i64,
    pub last_update: i64,
    pub photo: Option<UserPhoto>,
    pub photo_gallery: Vec<UserPhoto>,
    pub blocked: bool,
    pub is_bot: bool,
}

/// A contact entry.  Contacts are a per-team overlay on users: the same
/// user may be a contact in one team and a stranger in another.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContactUser {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub phone: String,
    pub access_hash: u64,
    pub client_id: i64,
    pub photo: Option<UserPhoto>,
}

/// A device address-book entry not (yet) matched to a server user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhoneContact {
    pub client_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ParticipantType {
    Member,
    Admin,
    Creator,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupParticipant {
    pub user_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub access_hash: u64,
    pub kind: ParticipantType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: i64,
    pub team_id: i64,
    pub title: String,
    pub created_on: i64,
    pub edited_on: i64,
    pub participants: i32,
    pub photo: Option<UserPhoto>,
}

// ---------------------------------------------------------------------------
// Teams, top peers, misc client state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub creator_id: i64,
    pub access_hash: u64,
}

/// Frequency categories tracked for the "top peers" suggestion lists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TopPeerCategory {
    Users,
    Groups,
    Forwards,
    BotsMessage,
    BotsInline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopPeer {
    pub team_id: i64,
    pub peer: Peer,
    pub rate: f64,
    pub last_update: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WallPaper {
    pub id: i64,
    pub document: Option<Document>,
    pub dark: bool,
}

/// A remembered search target shown in the search panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentSearch {
    pub peer: Peer,
    pub date: i64,
}

// ---------------------------------------------------------------------------
// Account privacy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PrivacyKey {
    LastSeen,
    ProfilePhoto,
    ForwardedMessage,
    Call,
    ChatInvite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PrivacyRule {
    AllowAll,
    AllowContacts,
    AllowUsers(Vec<i64>),
    DenyAll,
    DenyContacts,
    DenyUsers(Vec<i64>),
}
