//! Push: send dirty records to the remote.
//!
//! Records are pushed shallowest first so a folder exists remotely before
//! anything inside it. A record is only marked clean if it did not change
//! while its push was in flight.

use crate::events::{PushOperation, SyncEvent};
use crate::path;
use crate::record::{Content, FileRecord, now_millis};
use crate::remote::{MetadataUpdate, Properties, Query, RemoteError, RemoteProvider, SyncMeta};
use crate::store::{StoreBackend, StoreError};
use crate::sync_engine::{Result, SyncEngine, SyncError};
use tracing::{debug, info, warn};

impl<R: RemoteProvider, B: StoreBackend> SyncEngine<R, B> {
    pub(crate) async fn sync_up(&self, root_id: &str) -> Result<()> {
        let mut pending = self.store.dirty_records().await;
        if pending.is_empty() {
            debug!("Nothing to push");
            return Ok(());
        }
        pending.sort_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.path.cmp(&b.path)));
        self.events
            .progress(format!("Pushing {} local changes...", pending.len()));

        let mut failed = 0usize;
        for queued in pending {
            // Earlier pushes (folder deletes, parent creation) may have
            // settled this record already.
            let Some(record) = self.store.get(&queued.path).await.filter(|r| r.dirty) else {
                continue;
            };

            match self.push_record(root_id, &record).await {
                Ok(operation) => {
                    debug!("Pushed {} ({:?})", record.path, operation);
                    self.events.emit(SyncEvent::RecordPushed {
                        path: record.path.clone(),
                        operation,
                        timestamp: now_millis(),
                    });
                }
                Err(e @ SyncError::Unauthorized(_)) => return Err(e),
                Err(e) => {
                    failed += 1;
                    warn!("Failed to push {}: {}", record.path, e);
                    self.events.emit(SyncEvent::RecordFailed {
                        path: record.path.clone(),
                        error: e.to_string(),
                        timestamp: now_millis(),
                    });
                    self.events
                        .progress(format!("Error syncing {}", record.name()));
                }
            }
        }

        if failed > 0 {
            info!("Push finished with {} failures; they retry next pass", failed);
        }
        Ok(())
    }

    async fn push_record(&self, root_id: &str, record: &FileRecord) -> Result<PushOperation> {
        if record.deleted {
            self.push_delete(record).await?;
            return Ok(PushOperation::Deleted);
        }
        match &record.remote_id {
            Some(remote_id) => self.push_update(root_id, record, remote_id).await,
            None => {
                self.push_create(root_id, record).await?;
                Ok(PushOperation::Created)
            }
        }
    }

    async fn push_delete(&self, record: &FileRecord) -> Result<()> {
        if let Some(remote_id) = &record.remote_id {
            match self.call(self.remote.delete(remote_id)).await {
                Ok(()) => info!("Deleted remote copy of {}", record.path),
                Err(e) if e.is_permission_denied() => {
                    warn!("Not allowed to delete {} remotely, forgetting it: {}", record.path, e)
                }
                Err(e) if e.is_not_found() => debug!("{} was already gone remotely", record.path),
                Err(e) => return Err(e.into()),
            }
        }

        self.store
            .transaction(|tx| {
                match tx.get(&record.path) {
                    Some(current) if current.deleted => tx.remove(&record.path),
                    // Recreated locally meanwhile: it needs a new remote object.
                    Some(mut current) if current.remote_id == record.remote_id => {
                        current.remote_id = None;
                        current.dirty = true;
                        tx.put(current)?;
                    }
                    _ => {}
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn push_update(
        &self,
        root_id: &str,
        record: &FileRecord,
        remote_id: &str,
    ) -> Result<PushOperation> {
        if let Some(content) = record.content.as_ref().filter(|_| !record.is_folder()) {
            match self.call(self.remote.update_content(remote_id, content)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return self.forget_remote(record, e).await,
                Err(e) => return Err(e.into()),
            }
        }

        let parent_id = self.resolve_parent_id(root_id, &record.path).await?;
        let current = match self.call(self.remote.get_metadata(remote_id)).await {
            Ok(entry) if entry.trashed => {
                let gone = RemoteError::NotFound(format!("{remote_id} is trashed"));
                return self.forget_remote(record, gone).await;
            }
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return self.forget_remote(record, e).await,
            Err(e) => return Err(e.into()),
        };

        let mut update = MetadataUpdate::default();
        if current.name != record.name() {
            update.name = Some(record.name().to_string());
        }
        let meta = SyncMeta::from_record(record);
        if current.sync_meta().ok().flatten().unwrap_or_default() != meta {
            update.properties = Some(meta.to_properties());
        }
        if current.parent_id() != Some(parent_id.as_str()) {
            update.add_parents.push(parent_id);
            update.remove_parents = current.parent_ids.clone();
        }

        if !update.is_empty() {
            debug!("Updating remote metadata of {}: {:?}", record.path, update);
            self.call(self.remote.update_metadata(remote_id, &update)).await?;
        }
        self.mark_clean(record, remote_id).await?;
        Ok(PushOperation::Updated)
    }

    /// The remote object behind `record` is gone. Unlink it so the next pass
    /// uploads it anew, and report the push as failed.
    async fn forget_remote(&self, record: &FileRecord, error: RemoteError) -> Result<PushOperation> {
        info!("Remote copy of {} is gone, it will be uploaded again", record.path);
        self.store
            .transaction(|tx| {
                if let Some(mut current) = tx.get(&record.path) {
                    if current.remote_id == record.remote_id {
                        current.remote_id = None;
                        current.dirty = true;
                        tx.put(current)?;
                    }
                }
                Ok(())
            })
            .await?;
        Err(error.into())
    }

    async fn push_create(&self, root_id: &str, record: &FileRecord) -> Result<()> {
        let parent_id = self.resolve_parent_id(root_id, &record.path).await?;
        let meta = SyncMeta::from_record(record);
        let properties = if meta.is_empty() {
            Properties::new()
        } else {
            meta.to_properties()
        };

        let remote_id = if record.is_folder() {
            let id = self.find_or_create_folder(record.name(), &parent_id).await?;
            if !properties.is_empty() {
                let update = MetadataUpdate {
                    properties: Some(properties),
                    ..MetadataUpdate::default()
                };
                self.call(self.remote.update_metadata(&id, &update)).await?;
            }
            id
        } else {
            let empty = Content::Text(String::new());
            let content = record.content.as_ref().unwrap_or(&empty);
            let created = self
                .call(
                    self.remote
                        .create_file(record.name(), &parent_id, content, &properties),
                )
                .await?;
            info!("Uploaded {} ({})", record.path, created.id);
            created.id
        };

        self.mark_clean(record, &remote_id).await
    }

    /// Link `pushed` to `remote_id` and clear its dirty flag, unless the
    /// record changed while the push was in flight.
    async fn mark_clean(&self, pushed: &FileRecord, remote_id: &str) -> Result<()> {
        let cleaned = self
            .store
            .transaction(|tx| {
                let Some(mut current) = tx.get(&pushed.path) else {
                    return Ok(false);
                };
                let unchanged = current == *pushed;
                current.remote_id = Some(remote_id.to_string());
                if unchanged {
                    current.dirty = false;
                    current.updated_at = now_millis();
                }
                tx.put(current)?;
                Ok(unchanged)
            })
            .await?;

        if !cleaned {
            debug!("{} changed during push, leaving it dirty", pushed.path);
        }
        Ok(())
    }

    /// Remote id of the folder `path` lives in, creating missing ancestors
    /// remotely and linking them locally.
    pub(crate) async fn resolve_parent_id(&self, root_id: &str, path: &str) -> Result<String> {
        let mut unlinked = Vec::new();
        let mut anchor = root_id.to_string();
        let mut cursor = path::parent(path);
        while let Some(folder) = cursor {
            let linked = self
                .store
                .get(folder)
                .await
                .filter(FileRecord::is_live)
                .and_then(|r| r.remote_id);
            if let Some(id) = linked {
                anchor = id;
                break;
            }
            unlinked.push(folder.to_string());
            cursor = path::parent(folder);
        }

        for folder in unlinked.into_iter().rev() {
            let id = self.find_or_create_folder(path::name(&folder), &anchor).await?;
            self.link_folder(&folder, &id).await?;
            anchor = id;
        }
        Ok(anchor)
    }

    async fn link_folder(&self, folder: &str, remote_id: &str) -> Result<()> {
        self.store
            .transaction(|tx| {
                let mut record = tx
                    .get(folder)
                    .unwrap_or_else(|| FileRecord::folder(folder, now_millis()));
                if !record.is_folder() {
                    return Err(StoreError::NotAFolder(folder.to_string()));
                }
                record.remote_id = Some(remote_id.to_string());
                record.deleted = false;
                // Tags and metadata still need their own push.
                record.dirty = record.dirty && !SyncMeta::from_record(&record).is_empty();
                tx.ensure_parent(folder)?;
                tx.put(record)
            })
            .await?;
        Ok(())
    }

    async fn find_or_create_folder(&self, name: &str, parent_id: &str) -> Result<String> {
        let existing = self
            .call(self.remote.list_files(&Query::FolderNamed {
                name: name.to_string(),
                parent_id: Some(parent_id.to_string()),
            }))
            .await?;
        if let Some(folder) = existing.into_iter().next() {
            debug!("Reusing remote folder {} ({})", name, folder.id);
            return Ok(folder.id);
        }

        let created = self
            .call(self.remote.create_folder(name, Some(parent_id)))
            .await?;
        info!("Created remote folder {} ({})", name, created.id);
        Ok(created.id)
    }
}
