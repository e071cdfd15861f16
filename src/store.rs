//! Document store - per-URI state for primary documents and their
//! markup projections.
//!
//! The store is a sharded concurrent map, so mutations of distinct documents
//! never contend on a shared lock. The projected content and its checksum
//! live in a single field and are always replaced as one unit, which is what
//! keeps the checksum gate sound: a reader can never observe new content
//! paired with an old checksum.
//!
//! Projection updates carrying an unchanged checksum are rejected without
//! side effects; the boolean return from [`DocumentStore::update_projection`]
//! is the signal callers use to decide whether downstream consumers need to
//! be notified.

use dashmap::DashMap;

/// Default language identifier for newly created documents.
pub const DEFAULT_LANGUAGE_ID: &str = "markup-host";

/// Projected markup text plus the checksum that identifies it.
///
/// Two projections are the same content iff their checksums are equal;
/// content is never diffed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// Opaque tag supplied by the projection producer.
    pub checksum: String,
    /// Derived markup text (HTML).
    pub content: String,
}

/// State of one open document.
#[derive(Debug, Clone)]
pub struct Document {
    /// Full text of the primary document.
    pub content: String,
    /// Editor-assigned version; monotonically increasing, not necessarily
    /// by exactly 1.
    pub version: i64,
    /// Advisory language identifier.
    pub language_id: String,
    /// Current projection, if the producer has supplied one.
    pub projection: Option<Projection>,
}

impl Document {
    fn empty() -> Self {
        Self {
            content: String::new(),
            version: 0,
            language_id: DEFAULT_LANGUAGE_ID.to_string(),
            projection: None,
        }
    }
}

/// Owned point-in-time copy of a document, paired with its URI.
///
/// Reads hand out snapshots rather than references so no shard lock ever
/// escapes the store.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub uri: String,
    pub document: Document,
}

/// Thread-safe registry of documents keyed by URI.
///
/// Per-document field updates are linearizable (they happen under the entry
/// lock); store-wide iteration sees a point-in-time snapshot that may be
/// stale by the time the caller acts on it. The checksum gate, not store-wide
/// locking, is the cross-component correctness mechanism.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: DashMap<String, Document>,
}

impl DocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
        }
    }

    /// Fetch a snapshot of the document, creating an empty one if absent.
    ///
    /// Idempotent; never overwrites existing state.
    pub fn get_or_create(&self, uri: &str) -> DocumentSnapshot {
        let entry = self
            .documents
            .entry(uri.to_string())
            .or_insert_with(Document::empty);
        DocumentSnapshot {
            uri: uri.to_string(),
            document: entry.clone(),
        }
    }

    /// Open a document, unconditionally setting its primary fields.
    ///
    /// An existing projection for the URI is kept; the projection producer
    /// owns that field.
    pub fn open(
        &self,
        uri: &str,
        language_id: &str,
        version: i64,
        content: &str,
    ) -> DocumentSnapshot {
        let mut entry = self
            .documents
            .entry(uri.to_string())
            .or_insert_with(Document::empty);
        entry.language_id = language_id.to_string();
        entry.version = version;
        entry.content = content.to_string();
        DocumentSnapshot {
            uri: uri.to_string(),
            document: entry.clone(),
        }
    }

    /// Overwrite primary content and version.
    ///
    /// Returns `false` without mutating anything if the URI is unknown.
    pub fn update(&self, uri: &str, version: i64, content: &str) -> bool {
        match self.documents.get_mut(uri) {
            Some(mut entry) => {
                entry.version = version;
                entry.content = content.to_string();
                true
            }
            None => false,
        }
    }

    /// Remove a document; returns whether it existed.
    pub fn close(&self, uri: &str) -> bool {
        self.documents.remove(uri).is_some()
    }

    /// Replace the projection pair, gated on the checksum.
    ///
    /// Creates the document if absent (projections can arrive before an
    /// explicit open). Returns `false` and performs no mutation when the
    /// stored checksum already matches; callers must not notify downstream
    /// consumers in that case.
    pub fn update_projection(&self, uri: &str, checksum: &str, content: &str) -> bool {
        let mut entry = self
            .documents
            .entry(uri.to_string())
            .or_insert_with(Document::empty);

        if let Some(existing) = &entry.projection {
            if existing.checksum == checksum {
                return false;
            }
        }

        entry.projection = Some(Projection {
            checksum: checksum.to_string(),
            content: content.to_string(),
        });
        true
    }

    /// Fetch a snapshot only if the stored projection checksum matches.
    ///
    /// Returns `None` on unknown URI, on a document with no projection, and
    /// on a checksum mismatch (the caller is stale and should re-fetch).
    pub fn get_if_checksum_matches(&self, uri: &str, checksum: &str) -> Option<DocumentSnapshot> {
        let entry = self.documents.get(uri)?;
        match &entry.projection {
            Some(projection) if projection.checksum == checksum => Some(DocumentSnapshot {
                uri: uri.to_string(),
                document: entry.clone(),
            }),
            _ => None,
        }
    }

    /// Snapshot every open document, e.g. for bulk re-sync.
    pub fn list_all(&self) -> Vec<DocumentSnapshot> {
        self.documents
            .iter()
            .map(|entry| DocumentSnapshot {
                uri: entry.key().clone(),
                document: entry.value().clone(),
            })
            .collect()
    }

    /// Number of currently open documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check whether the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let store = DocumentStore::new();

        store.open("file:///a.host", "markup-host", 3, "text");
        let snap = store.get_or_create("file:///a.host");

        assert_eq!(snap.document.version, 3);
        assert_eq!(snap.document.content, "text");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_open_overwrites_primary_fields() {
        let store = DocumentStore::new();

        store.open("file:///a.host", "markup-host", 1, "one");
        store.open("file:///a.host", "markup-host", 5, "five");

        let snap = store.get_or_create("file:///a.host");
        assert_eq!(snap.document.version, 5);
        assert_eq!(snap.document.content, "five");
    }

    #[test]
    fn test_open_keeps_existing_projection() {
        let store = DocumentStore::new();

        assert!(store.update_projection("file:///a.host", "c1", "<p/>"));
        store.open("file:///a.host", "markup-host", 1, "body");

        let snap = store.get_or_create("file:///a.host");
        assert_eq!(snap.document.projection.unwrap().checksum, "c1");
    }

    #[test]
    fn test_update_unknown_uri_fails() {
        let store = DocumentStore::new();
        assert!(!store.update("file:///missing.host", 1, "text"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_close_reports_existence() {
        let store = DocumentStore::new();
        store.open("file:///a.host", "markup-host", 1, "");

        assert!(store.close("file:///a.host"));
        assert!(!store.close("file:///a.host"));
    }

    #[test]
    fn test_checksum_gate_idempotence() {
        let store = DocumentStore::new();

        assert!(store.update_projection("file:///a.host", "abc", "<div/>"));
        assert!(!store.update_projection("file:///a.host", "abc", "<div/>"));

        let snap = store.get_or_create("file:///a.host");
        let projection = snap.document.projection.unwrap();
        assert_eq!(projection.checksum, "abc");
        assert_eq!(projection.content, "<div/>");
    }

    #[test]
    fn test_projection_creates_unseen_document() {
        let store = DocumentStore::new();

        assert!(store.update_projection("file:///new.host", "c1", "<p/>"));

        let snap = store.get_or_create("file:///new.host");
        assert_eq!(snap.document.language_id, DEFAULT_LANGUAGE_ID);
        assert!(snap.document.content.is_empty());
    }

    #[test]
    fn test_checksum_change_replaces_pair() {
        let store = DocumentStore::new();

        assert!(store.update_projection("file:///a.host", "c1", "<p>1</p>"));
        assert!(store.update_projection("file:///a.host", "c2", "<p>2</p>"));

        let snap = store.get_or_create("file:///a.host");
        let projection = snap.document.projection.unwrap();
        assert_eq!(projection.checksum, "c2");
        assert_eq!(projection.content, "<p>2</p>");
    }

    #[test]
    fn test_get_if_checksum_matches() {
        let store = DocumentStore::new();
        store.update_projection("file:///a.host", "c1", "<p/>");

        assert!(store.get_if_checksum_matches("file:///a.host", "c1").is_some());
        // Stale caller is a normal race, not an error.
        assert!(store.get_if_checksum_matches("file:///a.host", "c0").is_none());
        assert!(store.get_if_checksum_matches("file:///other.host", "c1").is_none());
    }

    #[test]
    fn test_list_all_snapshots() {
        let store = DocumentStore::new();
        store.open("file:///a.host", "markup-host", 1, "a");
        store.open("file:///b.host", "markup-host", 2, "b");

        let mut uris: Vec<String> = store.list_all().into_iter().map(|s| s.uri).collect();
        uris.sort();
        assert_eq!(uris, vec!["file:///a.host", "file:///b.host"]);
    }

    #[tokio::test]
    async fn test_per_document_isolation() {
        let store = Arc::new(DocumentStore::new());
        for i in 0..8 {
            store.open(&format!("file:///doc{}.host", i), "markup-host", 0, "");
        }

        let mut tasks = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let uri = format!("file:///doc{}.host", i);
                for version in 1..=50i64 {
                    assert!(store.update(&uri, version, &format!("v{}", version)));
                    assert!(store.update_projection(
                        &uri,
                        &format!("sum-{}-{}", i, version),
                        &format!("<p>{}</p>", version),
                    ));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for i in 0..8 {
            let snap = store.get_or_create(&format!("file:///doc{}.host", i));
            assert_eq!(snap.document.version, 50);
            assert_eq!(
                snap.document.projection.unwrap().checksum,
                format!("sum-{}-50", i)
            );
        }
    }
}
