//! Data model for everything the synchronization layer persists or carries.
//!
//! The central record is [`StoredEntry`], the on-disk shape of one cached key:
//! the JSON value itself plus the two pieces of metadata that decide whether
//! it may still be served, its schema `version` and the `savedAt` timestamp of
//! the last local write.
//!
//! [`CacheEntry`] is the typed view a caller gets back, [`QueueItem`] is one
//! pending remote write, and [`ClearSignal`] is the marker left behind by an
//! invalidation cascade.
//!
//! The document types at the bottom ([`DocumentKind`], [`DocumentStatus`],
//! [`DocumentsStatus`]) are not owned by the core. They are the payload the
//! core most commonly carries, and the invalidation map is keyed by
//! [`DocumentKind`].

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Physical record written to the local store for one key.
///
/// # Examples
///
/// ```rust
/// use persistent_sync_core::cache_entry::StoredEntry;
/// use serde_json::json;
///
/// let entry = StoredEntry {
///     value: json!({"messages": []}),
///     saved_at: 1_000,
///     version: 1,
/// };
///
/// // 24h window, current schema version 1
/// assert!(entry.is_fresh(2_000, 86_400_000, 1));
/// // a schema bump makes the same record logically absent
/// assert!(!entry.is_fresh(2_000, 86_400_000, 2));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEntry {
    /// JSON-compatible payload.
    pub value: JsonValue,

    /// Milliseconds since epoch of the last local write.
    pub saved_at: i64,

    /// Schema version tag. A mismatch makes the entry logically absent.
    pub version: u32,
}

impl StoredEntry {
    /// An entry is fresh iff `now - savedAt < maxAge` and its version is current.
    pub fn is_fresh(&self, now_millis: i64, max_age_millis: i64, current_version: u32) -> bool {
        self.version == current_version && now_millis.saturating_sub(self.saved_at) < max_age_millis
    }
}

/// Typed view of a fresh cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub version: u32,
    pub saved_at: i64,
}

/// One pending remote write. At most one exists per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub key: String,
    pub payload: JsonValue,
    pub enqueued_at: i64,
}

/// Marker written on every invalidation so other consumers of the same store
/// can see that a purge happened and what it covered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearSignal {
    pub document_kind: Option<DocumentKind>,
    pub keys: Vec<String>,
    pub cleared_at: i64,
}

/// The document slots a session can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Cv,
    OffreEmploi,
    MetierSouhaite,
    Questionnaire,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 4] = [
        DocumentKind::Cv,
        DocumentKind::OffreEmploi,
        DocumentKind::MetierSouhaite,
        DocumentKind::Questionnaire,
    ];

    /// Wire name, as used by the remote `document_type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Cv => "cv",
            DocumentKind::OffreEmploi => "offre_emploi",
            DocumentKind::MetierSouhaite => "metier_souhaite",
            DocumentKind::Questionnaire => "questionnaire",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload/processing state of one document slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatus {
    pub uploaded: bool,
    pub processed: bool,
    pub name: Option<String>,
    pub size: Option<u64>,
    pub content: Option<String>,
    pub upload_timestamp: Option<i64>,
}

impl DocumentStatus {
    /// Optimistic transition taken as soon as the user submits a file.
    pub fn mark_uploaded(
        &mut self,
        name: impl Into<String>,
        size: u64,
        content: Option<String>,
        uploaded_at: i64,
    ) {
        self.uploaded = true;
        self.processed = false;
        self.name = Some(name.into());
        self.size = Some(size);
        self.content = content;
        self.upload_timestamp = Some(uploaded_at);
    }

    /// Remote acknowledged the upload.
    pub fn confirm_processed(&mut self) {
        if self.uploaded {
            self.processed = true;
        }
    }

    /// Remote refused the upload, or an invalidation destroyed the slot.
    pub fn reset(&mut self) {
        *self = DocumentStatus::default();
    }

    /// Two statuses describe the same document when name, size and upload
    /// time all match. An empty slot is never the same as anything.
    pub fn same_document(&self, other: &DocumentStatus) -> bool {
        self.uploaded
            && other.uploaded
            && self.name == other.name
            && self.size == other.size
            && self.upload_timestamp == other.upload_timestamp
    }
}

/// The `documents_status` payload: one [`DocumentStatus`] per slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentsStatus {
    pub cv: DocumentStatus,
    pub offre_emploi: DocumentStatus,
    pub metier_souhaite: DocumentStatus,
    pub questionnaire: DocumentStatus,
}

impl DocumentsStatus {
    pub fn get(&self, kind: DocumentKind) -> &DocumentStatus {
        match kind {
            DocumentKind::Cv => &self.cv,
            DocumentKind::OffreEmploi => &self.offre_emploi,
            DocumentKind::MetierSouhaite => &self.metier_souhaite,
            DocumentKind::Questionnaire => &self.questionnaire,
        }
    }

    pub fn get_mut(&mut self, kind: DocumentKind) -> &mut DocumentStatus {
        match kind {
            DocumentKind::Cv => &mut self.cv,
            DocumentKind::OffreEmploi => &mut self.offre_emploi,
            DocumentKind::MetierSouhaite => &mut self.metier_souhaite,
            DocumentKind::Questionnaire => &mut self.questionnaire,
        }
    }
}
