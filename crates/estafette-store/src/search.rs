//! Full-text search glue.
//!
//! Two tantivy indexes live next to the primary store: one for message
//! bodies, one for peers (users, groups, contacts).  Both are best-effort
//! accelerators: they are opened in the background, fed through the async
//! flushers, and every read path tolerates an absent index by returning
//! empty results.  Nothing here is a source of truth.

use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, TantivyDocument, Term};

/// Shared handle slot for an index that may still be opening (or may have
/// failed to open) in the background.
pub(crate) type SearchSlot<T> = RwLock<Option<T>>;

/// Run `f` until it returns true, at most `attempts` times, sleeping
/// `delay` between tries.
pub(crate) fn wait_until<F>(attempts: u32, delay: Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..attempts {
        if f() {
            return true;
        }
        std::thread::sleep(delay);
    }
    false
}

fn open_or_create(dir: &Path, schema: Schema) -> tantivy::Result<Index> {
    match Index::open_in_dir(dir) {
        Ok(index) => Ok(index),
        Err(err) => {
            tracing::debug!(?dir, %err, "search index not openable, creating fresh");
            let _ = std::fs::remove_dir_all(dir);
            let _ = std::fs::create_dir_all(dir);
            Index::create_in_dir(dir, schema)
        }
    }
}

// ---------------------------------------------------------------------------
// Message index
// ---------------------------------------------------------------------------

/// Document fed into the message index.  Identifier fields are indexed as
/// raw keyword terms, mirroring how they are queried.
#[derive(Debug, Clone)]
pub(crate) struct MessageDoc {
    pub body: String,
    pub team_id: i64,
    pub peer_id: i64,
    pub sender_id: i64,
}

pub(crate) struct MessageIndex {
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    f_key: Field,
    f_body: Field,
    f_team: Field,
    f_peer: Field,
    f_sender: Field,
}

impl MessageIndex {
    pub fn open(dir: &Path) -> tantivy::Result<Self> {
        std::fs::create_dir_all(dir).map_err(tantivy::TantivyError::from)?;

        let mut builder = Schema::builder();
        let f_key = builder.add_text_field("key", STRING | STORED);
        let f_body = builder.add_text_field("body", TEXT);
        let f_team = builder.add_text_field("team_id", STRING);
        let f_peer = builder.add_text_field("peer_id", STRING);
        let f_sender = builder.add_text_field("sender_id", STRING);
        let schema = builder.build();

        let index = open_or_create(dir, schema)?;
        let writer = index.writer(15_000_000)?;
        let reader = index.reader()?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader,
            f_key,
            f_body,
            f_team,
            f_peer,
            f_sender,
        })
    }

    /// Idempotent batch upsert keyed by the document key.
    pub fn index_batch(&self, docs: Vec<(String, MessageDoc)>) -> tantivy::Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for (key, d) in docs {
            writer.delete_term(Term::from_field_text(self.f_key, &key));
            writer.add_document(doc!(
                self.f_key => key,
                self.f_body => d.body,
                self.f_team => d.team_id.to_string(),
                self.f_peer => d.peer_id.to_string(),
                self.f_sender => d.sender_id.to_string(),
            ))?;
        }
        writer.commit()?;
        Ok(())
    }

    pub fn delete_batch(&self, keys: Vec<String>) -> tantivy::Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for key in keys {
            writer.delete_term(Term::from_field_text(self.f_key, &key));
        }
        writer.commit()?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        let _ = self.reader.reload();
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.f_key, key),
            IndexRecordOption::Basic,
        );
        searcher
            .search(&query, &TopDocs::with_limit(1))
            .map(|hits| !hits.is_empty())
            .unwrap_or(false)
    }

    /// Search message bodies, optionally narrowed to a peer and/or sender.
    /// Returns the stored document keys, best match first.
    pub fn search(
        &self,
        team_id: i64,
        text: &str,
        peer_id: Option<i64>,
        sender_id: Option<i64>,
        limit: usize,
    ) -> Vec<String> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(
            Occur::Must,
            Box::new(TermQuery::new(
                Term::from_field_text(self.f_team, &team_id.to_string()),
                IndexRecordOption::Basic,
            )),
        )];
        if let Some(peer_id) = peer_id {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.f_peer, &peer_id.to_string()),
                    IndexRecordOption::Basic,
                )),
            ));
        }
        if let Some(sender_id) = sender_id {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.f_sender, &sender_id.to_string()),
                    IndexRecordOption::Basic,
                )),
            ));
        }
        if let Some(tokens) = token_disjunction(self.f_body, text) {
            clauses.push((Occur::Must, Box::new(tokens)));
        }

        self.run(BooleanQuery::new(clauses), limit)
    }

    fn run(&self, query: BooleanQuery, limit: usize) -> Vec<String> {
        let _ = self.reader.reload();
        let searcher = self.reader.searcher();
        let hits = match searcher.search(&query, &TopDocs::with_limit(limit.max(1))) {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(%err, "message search failed");
                return Vec::new();
            }
        };
        let mut keys = Vec::with_capacity(hits.len());
        for (_score, addr) in hits {
            if let Ok(doc) = searcher.doc::<TantivyDocument>(addr) {
                if let Some(key) = doc.get_first(self.f_key).and_then(|v| v.as_str()) {
                    keys.push(key.to_string());
                }
            }
        }
        keys
    }
}

// ---------------------------------------------------------------------------
// Peer index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerKind {
    User,
    Group,
    Contact,
}

impl PeerKind {
    fn as_str(self) -> &'static str {
        match self {
            PeerKind::User => "user",
            PeerKind::Group => "group",
            PeerKind::Contact => "contact",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PeerDoc {
    pub kind: PeerKind,
    pub name: String,
    pub username: String,
    pub phone: String,
    /// Zero for records that are not team-scoped (plain users, groups).
    pub team_id: i64,
}

pub(crate) struct PeerIndex {
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    f_key: Field,
    f_kind: Field,
    f_name: Field,
    f_username: Field,
    f_phone: Field,
    f_team: Field,
}

impl PeerIndex {
    pub fn open(dir: &Path) -> tantivy::Result<Self> {
        std::fs::create_dir_all(dir).map_err(tantivy::TantivyError::from)?;

        let mut builder = Schema::builder();
        let f_key = builder.add_text_field("key", STRING | STORED);
        let f_kind = builder.add_text_field("kind", STRING);
        let f_name = builder.add_text_field("name", TEXT);
        let f_username = builder.add_text_field("username", STRING);
        let f_phone = builder.add_text_field("phone", STRING);
        let f_team = builder.add_text_field("team_id", STRING);
        let schema = builder.build();

        let index = open_or_create(dir, schema)?;
        let writer = index.writer(15_000_000)?;
        let reader = index.reader()?;
        Ok(Self {
            writer: Mutex::new(writer),
            reader,
            f_key,
            f_kind,
            f_name,
            f_username,
            f_phone,
            f_team,
        })
    }

    pub fn index_batch(&self, docs: Vec<(String, PeerDoc)>) -> tantivy::Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for (key, d) in docs {
            writer.delete_term(Term::from_field_text(self.f_key, &key));
            writer.add_document(doc!(
                self.f_key => key,
                self.f_kind => d.kind.as_str(),
                self.f_name => d.name,
                self.f_username => d.username,
                self.f_phone => d.phone,
                self.f_team => d.team_id.to_string(),
            ))?;
        }
        writer.commit()?;
        Ok(())
    }

    pub fn delete_batch(&self, keys: Vec<String>) -> tantivy::Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        for key in keys {
            writer.delete_term(Term::from_field_text(self.f_key, &key));
        }
        writer.commit()?;
        Ok(())
    }

    /// Search peers of the given kinds by name, username or phone.
    /// `team_id` narrows to team-scoped records (contacts).
    pub fn search(
        &self,
        kinds: &[PeerKind],
        team_id: Option<i64>,
        phrase: &str,
        limit: usize,
    ) -> Vec<String> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();

        let kind_terms: Vec<(Occur, Box<dyn Query>)> = kinds
            .iter()
            .map(|k| {
                (
                    Occur::Should,
                    Box::new(TermQuery::new(
                        Term::from_field_text(self.f_kind, k.as_str()),
                        IndexRecordOption::Basic,
                    )) as Box<dyn Query>,
                )
            })
            .collect();
        clauses.push((Occur::Must, Box::new(BooleanQuery::new(kind_terms))));

        if let Some(team_id) = team_id {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.f_team, &team_id.to_string()),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        let mut text_clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        if let Some(tokens) = token_disjunction(self.f_name, phrase) {
            text_clauses.push((Occur::Should, Box::new(tokens)));
        }
        let exact = phrase.trim().to_lowercase();
        if !exact.is_empty() {
            text_clauses.push((
                Occur::Should,
                Box::new(FuzzyTermQuery::new_prefix(
                    Term::from_field_text(self.f_username, &exact),
                    0,
                    true,
                )),
            ));
            text_clauses.push((
                Occur::Should,
                Box::new(FuzzyTermQuery::new_prefix(
                    Term::from_field_text(self.f_phone, &exact),
                    0,
                    true,
                )),
            ));
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(text_clauses))));
        }

        let _ = self.reader.reload();
        let searcher = self.reader.searcher();
        let query = BooleanQuery::new(clauses);
        let hits = match searcher.search(&query, &TopDocs::with_limit(limit.max(1))) {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(%err, "peer search failed");
                return Vec::new();
            }
        };
        let mut keys = Vec::with_capacity(hits.len());
        for (_score, addr) in hits {
            if let Ok(doc) = searcher.doc::<TantivyDocument>(addr) {
                if let Some(key) = doc.get_first(self.f_key).and_then(|v| v.as_str()) {
                    keys.push(key.to_string());
                }
            }
        }
        keys
    }
}

/// Per-token disjunction over a text field: exact term or fuzzy prefix,
/// the closest tantivy rendition of match-or-prefix-or-fuzzy.
fn token_disjunction(field: Field, text: &str) -> Option<BooleanQuery> {
    let mut shoulds: Vec<(Occur, Box<dyn Query>)> = Vec::new();
    for token in text.split_whitespace() {
        let term = Term::from_field_text(field, &token.to_lowercase());
        shoulds.push((
            Occur::Should,
            Box::new(TermQuery::new(term.clone(), IndexRecordOption::Basic)),
        ));
        shoulds.push((
            Occur::Should,
            Box::new(FuzzyTermQuery::new_prefix(term, 1, true)),
        ));
    }
    if shoulds.is_empty() {
        None
    } else {
        Some(BooleanQuery::new(shoulds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = MessageIndex::open(dir.path()).unwrap();

        index
            .index_batch(vec![
                (
                    "0.5.1.10".into(),
                    MessageDoc {
                        body: "hello storage world".into(),
                        team_id: 0,
                        peer_id: 5,
                        sender_id: 7,
                    },
                ),
                (
                    "0.6.1.11".into(),
                    MessageDoc {
                        body: "unrelated chatter".into(),
                        team_id: 0,
                        peer_id: 6,
                        sender_id: 7,
                    },
                ),
            ])
            .unwrap();

        let hits = index.search(0, "storage", None, None, 10);
        assert_eq!(hits, vec!["0.5.1.10".to_string()]);

        // Peer narrowing excludes the other conversation.
        let hits = index.search(0, "chatter", Some(5), None, 10);
        assert!(hits.is_empty());

        index.delete_batch(vec!["0.5.1.10".into()]).unwrap();
        assert!(!index.contains("0.5.1.10"));
    }

    #[test]
    fn peer_index_kind_filter() {
        let dir = tempfile::tempdir().unwrap();
        let index = PeerIndex::open(dir.path()).unwrap();

        index
            .index_batch(vec![
                (
                    "u.1".into(),
                    PeerDoc {
                        kind: PeerKind::User,
                        name: "Arthur Dent".into(),
                        username: "adent".into(),
                        phone: "42".into(),
                        team_id: 0,
                    },
                ),
                (
                    "g.2".into(),
                    PeerDoc {
                        kind: PeerKind::Group,
                        name: "Arthur Fan Club".into(),
                        username: String::new(),
                        phone: String::new(),
                        team_id: 0,
                    },
                ),
            ])
            .unwrap();

        let hits = index.search(&[PeerKind::User], None, "arthur", 10);
        assert_eq!(hits, vec!["u.1".to_string()]);

        let hits = index.search(&[PeerKind::User, PeerKind::Group], None, "arthur", 10);
        assert_eq!(hits.len(), 2);
    }
}
