//! FileRecord: the unit of the local store.

use crate::path;
use crate::shadow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Unordered tag set. Sorted so serialized forms are stable.
pub type Tags = BTreeSet<String>;

/// Free-form JSON metadata attached to a record.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key marking a record as an extracted source document.
pub const IS_SOURCE_KEY: &str = "isSource";

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    File,
    Folder,
    Source,
}

impl RecordKind {
    /// Kind for a non-folder record at `path`.
    pub fn for_file_path(path: &str) -> Self {
        if shadow::is_source_path(path) {
            RecordKind::Source
        } else {
            RecordKind::File
        }
    }

    pub fn is_folder(self) -> bool {
        self == RecordKind::Folder
    }
}

/// Record payload: text for documents, raw bytes for binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum Content {
    Text(String),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl Content {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            Content::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Content::Text(text) => text.as_bytes(),
            Content::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Content::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Content::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Content {
    fn from(bytes: Vec<u8>) -> Self {
        Content::Binary(bytes)
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A file, folder or source document in the local store, keyed by `path`.
///
/// `dirty` means the record has local changes not yet pushed. `deleted`
/// marks a tombstone: the record is hidden from listings but kept until the
/// deletion has been pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    pub kind: RecordKind,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl FileRecord {
    /// A clean folder record with no remote counterpart yet.
    pub fn folder(path: impl Into<String>, updated_at: i64) -> Self {
        Self {
            path: path.into(),
            content: None,
            kind: RecordKind::Folder,
            updated_at,
            remote_id: None,
            dirty: false,
            deleted: false,
            tags: Tags::new(),
            metadata: Metadata::new(),
        }
    }

    /// A file record whose kind follows from its path.
    pub fn file(path: impl Into<String>, content: impl Into<Content>, updated_at: i64) -> Self {
        let path = path.into();
        Self {
            kind: RecordKind::for_file_path(&path),
            path,
            content: Some(content.into()),
            updated_at,
            remote_id: None,
            dirty: false,
            deleted: false,
            tags: Tags::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn name(&self) -> &str {
        path::name(&self.path)
    }

    pub fn parent(&self) -> Option<&str> {
        path::parent(&self.path)
    }

    pub fn depth(&self) -> usize {
        path::depth(&self.path)
    }

    /// Not tombstoned.
    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    pub fn is_folder(&self) -> bool {
        self.kind.is_folder()
    }

    pub fn text(&self) -> Option<&str> {
        self.content.as_ref().and_then(Content::as_text)
    }

    /// Local edit: mark dirty and stamp with the current time.
    pub fn touch(&mut self) {
        self.dirty = true;
        self.updated_at = now_millis();
    }
}
