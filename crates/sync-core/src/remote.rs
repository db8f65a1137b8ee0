//! RemoteProvider trait for the cloud drive the vault syncs with.
//!
//! Implementations:
//! - `DriveClient` (in sync-daemon) - Google Drive v3 over HTTPS
//! - `MemoryRemote` - In-memory drive for testing

use crate::record::{Content, FileRecord, Metadata, Tags};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// MIME type marking a remote object as a folder.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Remote property holding the JSON-encoded tags and metadata of a record.
pub const META_PROPERTY: &str = "meechi_meta";

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Worth trying again on a later pass.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Timeout(_) | RemoteError::Network(_) => true,
            RemoteError::Server { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, RemoteError::PermissionDenied(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// String key/value properties stored on a remote object.
pub type Properties = BTreeMap<String, String>;

/// A file or folder as reported by the remote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub parent_ids: Vec<String>,
    pub modified_time: Option<DateTime<Utc>>,
    pub properties: Properties,
    pub trashed: bool,
    pub can_add_children: bool,
}

impl RemoteEntry {
    pub fn is_container(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_ids.first().map(String::as_str)
    }

    pub fn modified_millis(&self) -> Option<i64> {
        self.modified_time.map(|t| t.timestamp_millis())
    }

    /// Decoded `meechi_meta` app property, if present.
    pub fn sync_meta(&self) -> std::result::Result<Option<SyncMeta>, serde_json::Error> {
        SyncMeta::from_properties(&self.properties)
    }
}

/// Listing query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Non-trashed children of a folder.
    Children { parent_id: String },
    /// Non-trashed folders with an exact name, optionally under one parent.
    FolderNamed {
        name: String,
        parent_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    /// The object no longer exists.
    Removed { id: String },
    /// Current state of a changed object. May be trashed.
    Changed(RemoteEntry),
}

/// One page of the remote change feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangePage {
    pub changes: Vec<RemoteChange>,
    /// More pages follow.
    pub next_page_token: Option<String>,
    /// Present on the last page: where the next pull starts.
    pub new_start_page_token: Option<String>,
}

/// Partial metadata update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataUpdate {
    pub name: Option<String>,
    pub add_parents: Vec<String>,
    pub remove_parents: Vec<String>,
    pub properties: Option<Properties>,
}

impl MetadataUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.add_parents.is_empty()
            && self.remove_parents.is_empty()
            && self.properties.is_none()
    }
}

/// Tags and metadata as carried in the `meechi_meta` app property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SyncMeta {
    pub fn from_record(record: &FileRecord) -> Self {
        Self {
            tags: record.tags.clone(),
            metadata: record.metadata.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.metadata.is_empty()
    }

    pub fn from_properties(
        properties: &Properties,
    ) -> std::result::Result<Option<Self>, serde_json::Error> {
        properties
            .get(META_PROPERTY)
            .map(|raw| serde_json::from_str(raw))
            .transpose()
    }

    pub fn to_properties(&self) -> Properties {
        // Sets and string-keyed maps always serialize.
        let encoded = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Properties::from([(META_PROPERTY.to_string(), encoded)])
    }
}

/// Cloud drive the sync engine pulls from and pushes to.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// All entries matching the query, across pages.
    async fn list_files(&self, query: &Query) -> Result<Vec<RemoteEntry>>;

    /// Token marking "now" in the change feed.
    async fn start_page_token(&self) -> Result<String>;

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage>;

    async fn download_text(&self, id: &str) -> Result<String>;

    async fn download_binary(&self, id: &str) -> Result<Vec<u8>>;

    async fn get_metadata(&self, id: &str) -> Result<RemoteEntry>;

    async fn update_metadata(&self, id: &str, update: &MetadataUpdate) -> Result<()>;

    async fn update_content(&self, id: &str, content: &Content) -> Result<()>;

    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        content: &Content,
        properties: &Properties,
    ) -> Result<RemoteEntry>;

    /// Create a folder; `None` parent means the drive's top level.
    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<RemoteEntry>;

    async fn delete(&self, id: &str) -> Result<()>;
}

#[async_trait]
impl<T: RemoteProvider + ?Sized> RemoteProvider for Arc<T> {
    async fn list_files(&self, query: &Query) -> Result<Vec<RemoteEntry>> {
        (**self).list_files(query).await
    }

    async fn start_page_token(&self) -> Result<String> {
        (**self).start_page_token().await
    }

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage> {
        (**self).list_changes(page_token).await
    }

    async fn download_text(&self, id: &str) -> Result<String> {
        (**self).download_text(id).await
    }

    async fn download_binary(&self, id: &str) -> Result<Vec<u8>> {
        (**self).download_binary(id).await
    }

    async fn get_metadata(&self, id: &str) -> Result<RemoteEntry> {
        (**self).get_metadata(id).await
    }

    async fn update_metadata(&self, id: &str, update: &MetadataUpdate) -> Result<()> {
        (**self).update_metadata(id, update).await
    }

    async fn update_content(&self, id: &str, content: &Content) -> Result<()> {
        (**self).update_content(id, content).await
    }

    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        content: &Content,
        properties: &Properties,
    ) -> Result<RemoteEntry> {
        (**self).create_file(name, parent_id, content, properties).await
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<RemoteEntry> {
        (**self).create_folder(name, parent_id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        (**self).delete(id).await
    }
}
