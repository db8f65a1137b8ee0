//! Vault: the file API the application writes through.
//!
//! Every mutation is one store transaction that also materializes missing
//! ancestor folders, marks the touched records dirty for the next push, and
//! notifies the indexer once committed.

use crate::indexer::{IndexNotifier, Indexer};
use crate::path::{self, PathError};
use crate::record::{Content, FileRecord, Metadata, Tags, now_millis};
use crate::store::{
    CHANGE_TOKEN_KEY, ROOT_FOLDER_KEY, RecordStore, StoreBackend, StoreError, Visibility,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a text file: {0}")]
    NotText(String),

    #[error("Cannot move {from} into itself ({to})")]
    MoveIntoSelf { from: String, to: String },
}

impl From<PathError> for VaultError {
    fn from(e: PathError) -> Self {
        VaultError::Store(StoreError::InvalidPath(e))
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Replacement tags and/or metadata. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    pub tags: Option<Tags>,
    pub metadata: Option<Metadata>,
}

/// Manages the records of one vault.
pub struct Vault<B: StoreBackend> {
    store: Arc<RecordStore<B>>,
    index: IndexNotifier,
    default_folders: Vec<String>,
}

impl<B: StoreBackend> Vault<B> {
    pub fn new(store: Arc<RecordStore<B>>, indexer: Arc<dyn Indexer>) -> Self {
        Self {
            store,
            index: IndexNotifier::new(indexer),
            default_folders: crate::config::DEFAULT_FOLDERS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }

    /// Folders recreated by [`factory_reset`](Self::factory_reset).
    pub fn with_default_folders(mut self, folders: Vec<String>) -> Self {
        self.default_folders = folders;
        self
    }

    pub fn store(&self) -> &Arc<RecordStore<B>> {
        &self.store
    }

    /// Create or overwrite a file.
    ///
    /// Keeps the remote id of an existing record at `path`, and its tags and
    /// metadata unless new ones are given.
    pub async fn save_file(
        &self,
        path: &str,
        content: impl Into<Content>,
        tags: Option<Tags>,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        path::validate(path)?;
        let content = content.into();
        let text = content.as_text().map(str::to_owned);

        self.store
            .try_transaction(|tx| {
                let existing = tx.get(path);
                if existing.as_ref().is_some_and(|r| r.is_folder() && r.is_live()) {
                    return Err(StoreError::IsAFolder(path.to_string()));
                }
                tx.ensure_parent(path)?;

                let mut record = FileRecord::file(path, content, now_millis());
                match existing {
                    Some(previous) => {
                        record.remote_id = previous.remote_id;
                        record.tags = tags.unwrap_or(previous.tags);
                        record.metadata = metadata.unwrap_or(previous.metadata);
                    }
                    None => {
                        record.tags = tags.unwrap_or_default();
                        record.metadata = metadata.unwrap_or_default();
                    }
                }
                record.dirty = true;
                tx.put(record)
            })
            .await?;

        debug!("Saved {}", path);
        if let Some(text) = text {
            self.index.index(path, text);
        }
        Ok(())
    }

    /// Append `text` to a text file, separated by a blank line. Creates the
    /// file if it does not exist.
    pub async fn append_file(&self, path: &str, text: &str) -> Result<()> {
        path::validate(path)?;

        let combined = self
            .store
            .try_transaction(|tx| {
                let existing = tx.get(path);
                let mut record = match existing {
                    Some(record) if record.is_live() => {
                        if record.is_folder() {
                            return Err(VaultError::Store(StoreError::IsAFolder(path.into())));
                        }
                        record
                    }
                    Some(tombstone) => FileRecord {
                        remote_id: tombstone.remote_id,
                        tags: tombstone.tags,
                        metadata: tombstone.metadata,
                        ..FileRecord::file(path, String::new(), now_millis())
                    },
                    None => FileRecord::file(path, String::new(), now_millis()),
                };

                let combined = match &record.content {
                    Some(Content::Text(current)) if !current.is_empty() => {
                        format!("{current}\n\n{text}")
                    }
                    Some(Content::Binary(_)) => return Err(VaultError::NotText(path.into())),
                    _ => text.to_string(),
                };
                record.content = Some(Content::Text(combined.clone()));
                record.touch();
                tx.ensure_parent(path)?;
                tx.put(record)?;
                Ok(combined)
            })
            .await?;

        self.index.index(path, combined);
        Ok(())
    }

    /// Replace the content of an existing live file.
    pub async fn update_file(&self, path: &str, content: impl Into<Content>) -> Result<()> {
        let content = content.into();
        let text = content.as_text().map(str::to_owned);

        self.store
            .try_transaction(|tx| {
                let mut record = tx
                    .get_live(path)
                    .ok_or_else(|| VaultError::NotFound(path.to_string()))?;
                if record.is_folder() {
                    return Err(VaultError::Store(StoreError::IsAFolder(path.into())));
                }
                record.content = Some(content);
                record.touch();
                tx.put(record)?;
                Ok(())
            })
            .await?;

        if let Some(text) = text {
            self.index.index(path, text);
        }
        Ok(())
    }

    pub async fn update_metadata(&self, path: &str, patch: MetadataPatch) -> Result<()> {
        self.store
            .try_transaction(|tx| {
                let mut record = tx
                    .get_live(path)
                    .ok_or_else(|| VaultError::NotFound(path.to_string()))?;
                if let Some(tags) = patch.tags {
                    record.tags = tags;
                }
                if let Some(metadata) = patch.metadata {
                    record.metadata = metadata;
                }
                record.touch();
                tx.put(record)?;
                Ok(())
            })
            .await
    }

    /// Content of a live record.
    pub async fn read_file(&self, path: &str) -> Option<Content> {
        self.get_file(path).await.and_then(|r| r.content)
    }

    pub async fn get_file(&self, path: &str) -> Option<FileRecord> {
        self.store.read(|tx| tx.get_live(path)).await
    }

    /// Live records at or under `prefix`; empty prefix lists everything.
    pub async fn list_files(&self, prefix: &str) -> Vec<FileRecord> {
        self.store.list_by_prefix(prefix, Visibility::Live).await
    }

    pub async fn files_by_tag(&self, tag: &str) -> Vec<FileRecord> {
        self.store
            .read(|tx| {
                tx.list_by_prefix("", Visibility::Live)
                    .into_iter()
                    .filter(|r| r.tags.contains(tag))
                    .collect()
            })
            .await
    }

    pub async fn create_folder(&self, path: &str) -> Result<()> {
        path::validate(path)?;

        self.store
            .try_transaction(|tx| {
                let record = match tx.get(path) {
                    Some(existing) if existing.is_folder() => FileRecord {
                        deleted: false,
                        ..existing
                    },
                    Some(existing) if existing.is_live() => {
                        return Err(VaultError::AlreadyExists(path.to_string()));
                    }
                    Some(tombstone) => FileRecord {
                        remote_id: tombstone.remote_id,
                        ..FileRecord::folder(path, now_millis())
                    },
                    None => FileRecord::folder(path, now_millis()),
                };
                let mut record = record;
                record.touch();
                tx.ensure_parent(path)?;
                tx.put(record)?;
                Ok(())
            })
            .await
    }

    /// Move a file or folder. Folder contents move with it.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        path::validate(old_path)?;
        path::validate(new_path)?;
        if old_path == new_path {
            return Ok(());
        }
        if path::is_descendant(new_path, old_path) {
            return Err(VaultError::MoveIntoSelf {
                from: old_path.to_string(),
                to: new_path.to_string(),
            });
        }

        let moved = self
            .store
            .try_transaction(|tx| {
                let mut record = tx
                    .get_live(old_path)
                    .ok_or_else(|| VaultError::NotFound(old_path.to_string()))?;

                // A live record, or a tombstone still waiting for its remote
                // delete, owns the destination.
                let occupied = tx
                    .list_by_prefix(new_path, Visibility::All)
                    .into_iter()
                    .any(|r| r.is_live() || r.remote_id.is_some());
                if occupied {
                    return Err(VaultError::AlreadyExists(new_path.to_string()));
                }

                tx.ensure_parent(new_path)?;
                let mut moved = vec![(old_path.to_string(), new_path.to_string())];
                if record.is_folder() {
                    moved.extend(tx.move_descendants(old_path, new_path, FileRecord::touch)?);
                }
                tx.remove(old_path);
                record.path = new_path.to_string();
                record.deleted = false;
                record.touch();
                tx.put(record)?;
                Ok(moved)
            })
            .await?;

        info!("Renamed {} -> {} ({} records)", old_path, new_path, moved.len());
        for (from, to) in moved {
            self.index.rename(from, to);
        }
        Ok(())
    }

    /// Tombstone a record and, for folders, everything under it.
    ///
    /// Deleting a missing path does nothing.
    pub async fn delete(&self, path: &str) -> Result<()> {
        path::validate(path)?;

        let removed = self
            .store
            .transaction(|tx| {
                let Some(record) = tx.get(path) else {
                    return Ok(Vec::new());
                };
                let mut targets = vec![record.clone()];
                if record.is_folder() {
                    targets.extend(tx.descendants(path, Visibility::All));
                }

                let mut removed = Vec::with_capacity(targets.len());
                for mut target in targets {
                    target.deleted = true;
                    target.touch();
                    removed.push(target.path.clone());
                    tx.put(target)?;
                }
                Ok(removed)
            })
            .await?;

        if !removed.is_empty() {
            info!("Deleted {} ({} records)", path, removed.len());
        }
        for path in removed {
            self.index.remove(path);
        }
        Ok(())
    }

    /// Forget everything known about the remote. The next sync does a full
    /// pull and re-uploads every record.
    pub async fn reset_sync_state(&self) -> Result<()> {
        let count = self
            .store
            .transaction(|tx| {
                tx.remove_setting(CHANGE_TOKEN_KEY);
                tx.remove_setting(ROOT_FOLDER_KEY);
                let records = tx.list_by_prefix("", Visibility::All);
                let count = records.len();
                for mut record in records {
                    record.remote_id = None;
                    record.dirty = true;
                    tx.put(record)?;
                }
                Ok(count)
            })
            .await?;

        info!("Reset sync state for {} records", count);
        Ok(())
    }

    /// Drop every record and setting and start over with the default folders.
    pub async fn factory_reset(&self) -> Result<()> {
        let folders = &self.default_folders;
        let previous = self
            .store
            .transaction(|tx| {
                let previous: Vec<String> = tx
                    .list_by_prefix("", Visibility::Live)
                    .into_iter()
                    .filter(|r| !r.is_folder())
                    .map(|r| r.path)
                    .collect();
                tx.clear();
                for folder in folders {
                    let mut record = FileRecord::folder(folder.as_str(), now_millis());
                    record.dirty = true;
                    tx.ensure_parent(folder)?;
                    tx.put(record)?;
                }
                Ok(previous)
            })
            .await?;

        info!("Factory reset, recreated {} default folders", folders.len());
        for path in previous {
            self.index.remove(path);
        }
        Ok(())
    }
}
