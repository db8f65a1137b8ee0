//! Pull: bring remote changes into the record store.
//!
//! The first pull lists the whole remote tree from the root folder; later
//! pulls read the change feed from the persisted token. Each remote entry is
//! reconciled on its own: the entry is mapped to a local path through its
//! parent's remote id, the conflict rule picks a side, and the result is
//! written in one transaction together with any ancestor folders.

use crate::events::{PullAction, SyncEvent};
use crate::path;
use crate::record::{Content, FileRecord, IS_SOURCE_KEY, RecordKind, now_millis};
use crate::remote::{META_PROPERTY, Query, RemoteChange, RemoteEntry, RemoteProvider, SyncMeta};
use crate::shadow::{self, EntryClass};
use crate::store::{self, CHANGE_TOKEN_KEY, StoreBackend, StoreError, Transaction, Visibility};
use crate::sync_engine::{Result, SyncEngine, SyncError};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Which side of a conflict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    KeepLocal,
    AdoptRemote,
}

impl Resolution {
    /// Local edits always win; otherwise the remote wins only if it changed
    /// after the local record did.
    pub(crate) fn decide(local: Option<&FileRecord>, remote_modified: i64) -> Self {
        match local {
            None => Resolution::AdoptRemote,
            Some(local) if local.dirty => Resolution::KeepLocal,
            Some(local) if remote_modified <= local.updated_at => Resolution::KeepLocal,
            Some(_) => Resolution::AdoptRemote,
        }
    }
}

/// The local records a remote entry touches.
struct Counterpart {
    /// The record the entry reconciles with.
    local: Option<FileRecord>,
    /// Another record holding the entry's path. It is moved aside first.
    displaced: Option<FileRecord>,
}

impl Counterpart {
    fn find(tx: &Transaction<'_>, remote_id: &str, path: &str) -> Self {
        let linked = tx.find_by_remote_id(remote_id);
        let occupant = tx
            .get(path)
            .filter(|r| r.remote_id.as_deref() != Some(remote_id))
            // A never-synced tombstone is no counterpart of anything.
            .filter(|r| r.is_live() || r.remote_id.is_some());

        match (occupant, linked) {
            (None, local) => Counterpart {
                local,
                displaced: None,
            },
            // Same path, never synced: the local record takes the remote id.
            (Some(occupant), None) if occupant.remote_id.is_none() => Counterpart {
                local: Some(occupant),
                displaced: None,
            },
            (Some(occupant), local) => Counterpart {
                local,
                displaced: Some(occupant),
            },
        }
    }
}

/// Remote data fetched ahead of the write transaction.
enum Payload {
    Folder,
    Content(Content),
    Shadowed { bytes: Vec<u8>, text: String },
}

/// What a committed reconciliation changed, for notifications.
#[derive(Default)]
struct Applied {
    path: String,
    action: Option<PullAction>,
    moved: Vec<(String, String)>,
    indexed: Vec<(String, String)>,
}

impl<R: RemoteProvider, B: StoreBackend> SyncEngine<R, B> {
    pub(crate) async fn sync_down(&self, root_id: &str) -> Result<()> {
        self.events.progress("Checking remote changes...");
        match self.store.setting(CHANGE_TOKEN_KEY).await {
            Some(token) => self.incremental_pull(root_id, token).await,
            None => {
                self.full_pull(root_id).await?;
                let token = self.call(self.remote.start_page_token()).await?;
                self.store.set_setting(CHANGE_TOKEN_KEY, &token).await?;
                debug!("Stored start page token {}", token);
                Ok(())
            }
        }
    }

    async fn full_pull(&self, root_id: &str) -> Result<()> {
        info!("No change token, performing full pull");
        self.events.progress("Performing initial sync...");

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root_id.to_string()]);
        while let Some(folder_id) = queue.pop_front() {
            let children = self
                .call(self.remote.list_files(&Query::Children {
                    parent_id: folder_id.clone(),
                }))
                .await?;
            debug!("Listed {} entries under {}", children.len(), folder_id);

            for entry in children {
                if !seen.insert(entry.id.clone()) {
                    continue;
                }
                if entry.is_container() {
                    queue.push_back(entry.id.clone());
                }
                self.reconcile_entry(root_id, &entry).await?;
            }
        }

        let removed = self.remove_orphans(&seen).await?;
        info!(
            "Full pull saw {} remote entries, removed {} orphaned records",
            seen.len(),
            removed
        );
        Ok(())
    }

    async fn incremental_pull(&self, root_id: &str, mut token: String) -> Result<()> {
        for page_number in 1..=self.config.max_change_pages {
            let page = self.call(self.remote.list_changes(&token)).await?;
            debug!("Change page {}: {} changes", page_number, page.changes.len());

            for change in page.changes {
                match change {
                    RemoteChange::Removed { id } => self.apply_remote_delete(&id).await?,
                    RemoteChange::Changed(entry) if entry.trashed => {
                        self.apply_remote_delete(&entry.id).await?
                    }
                    RemoteChange::Changed(entry) => {
                        self.reconcile_entry(root_id, &entry).await?;
                    }
                }
            }

            if let Some(next) = page.next_page_token {
                token = next;
                continue;
            }
            match page.new_start_page_token {
                Some(new_start) => {
                    self.store.set_setting(CHANGE_TOKEN_KEY, &new_start).await?;
                    debug!("Stored new start page token {}", new_start);
                }
                None => warn!("Change page carried no continuation token; keeping {}", token),
            }
            return Ok(());
        }

        // Resume from the first unread page next pass.
        self.store.set_setting(CHANGE_TOKEN_KEY, &token).await?;
        warn!(
            "Stopped after {} change pages; the rest is picked up next pass",
            self.config.max_change_pages
        );
        Ok(())
    }

    /// Drop clean records whose remote object was not seen in a full listing.
    ///
    /// An orphaned folder that still holds unsynced records is kept and
    /// unlinked instead, so its contents keep a parent.
    async fn remove_orphans(&self, seen: &HashSet<String>) -> Result<usize> {
        let removed = self
            .store
            .transaction(|tx| {
                let (orphans, survivors): (Vec<FileRecord>, Vec<FileRecord>) = tx
                    .list_by_prefix("", Visibility::All)
                    .into_iter()
                    .partition(|r| {
                        !r.dirty && r.remote_id.as_ref().is_some_and(|id| !seen.contains(id))
                    });

                let mut removed = Vec::new();
                for mut orphan in orphans {
                    let occupied = orphan.is_folder()
                        && survivors
                            .iter()
                            .any(|s| path::is_descendant(&s.path, &orphan.path));
                    if occupied {
                        debug!("Unlinking orphaned folder {} that holds local changes", orphan.path);
                        orphan.remote_id = None;
                        tx.put(orphan)?;
                    } else {
                        tx.remove(&orphan.path);
                        removed.push(orphan.path);
                    }
                }
                Ok(removed)
            })
            .await?;

        for path in &removed {
            self.notify_removed(path);
        }
        Ok(removed.len())
    }

    /// Remove the local record of a deleted remote object, with its subtree.
    async fn apply_remote_delete(&self, remote_id: &str) -> Result<()> {
        let removed = self
            .store
            .transaction(|tx| {
                let Some(local) = tx.find_by_remote_id(remote_id) else {
                    return Ok(Vec::new());
                };
                let mut paths = vec![local.path.clone()];
                if local.is_folder() {
                    paths.extend(
                        tx.descendants(&local.path, Visibility::All)
                            .into_iter()
                            .map(|r| r.path),
                    );
                }
                for path in &paths {
                    tx.remove(path);
                }
                Ok(paths)
            })
            .await?;

        if !removed.is_empty() {
            info!("Remote object {} is gone, removed {} local records", remote_id, removed.len());
        }
        for path in &removed {
            self.notify_removed(path);
        }
        Ok(())
    }

    fn notify_removed(&self, path: &str) {
        self.index.remove(path);
        self.events.emit(SyncEvent::LocalRemoved {
            path: path.to_string(),
            timestamp: now_millis(),
        });
    }

    /// Apply one remote entry to the store.
    ///
    /// Entries that cannot be placed, downloaded or stored are skipped; only
    /// persistence failures and credential rejection are returned as errors.
    pub(crate) async fn reconcile_entry(&self, root_id: &str, entry: &RemoteEntry) -> Result<()> {
        let Some(path) = self.local_path_for(root_id, entry).await else {
            return Ok(());
        };

        let class = EntryClass::of(entry);
        let remote_modified = entry.modified_millis().unwrap_or_else(now_millis);
        let remote_meta = match entry.sync_meta() {
            Ok(meta) => Some(meta.unwrap_or_default()),
            Err(e) => {
                warn!("Ignoring unreadable {} on {} ({}): {}", META_PROPERTY, path, entry.id, e);
                None
            }
        };

        let counterpart = self
            .store
            .read(|tx| Counterpart::find(tx, &entry.id, &path))
            .await;

        let payload = match Resolution::decide(counterpart.local.as_ref(), remote_modified) {
            Resolution::KeepLocal => None,
            Resolution::AdoptRemote => match self.fetch_payload(class, entry).await {
                Ok(payload) => Some(payload),
                Err(e @ SyncError::Unauthorized(_)) => return Err(e),
                Err(e) => {
                    warn!("Failed to download {} ({}): {}", path, entry.id, e);
                    self.events.progress(format!("Error downloading {}", entry.name));
                    self.emit_pulled(&path, entry, PullAction::Skipped);
                    return Ok(());
                }
            },
        };

        let staged = self
            .store
            .transaction(|tx| {
                stage_entry(tx, entry, class, &path, remote_modified, remote_meta, payload)
            })
            .await;
        let applied = match staged {
            Ok(applied) => applied,
            // Entries the store cannot hold are skipped; the pull goes on.
            Err(
                e @ (StoreError::InvalidPath(_)
                | StoreError::NotAFolder(_)
                | StoreError::IsAFolder(_)),
            ) => {
                warn!("Skipping {} ({}): {}", path, entry.id, e);
                self.emit_pulled(&path, entry, PullAction::Skipped);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(applied) = applied else {
            return Ok(());
        };
        for (from, to) in applied.moved {
            info!("Remote move {} -> {}", from, to);
            self.index.rename(from, to);
        }
        for (path, text) in applied.indexed {
            self.index.index(path, text);
        }
        if let Some(action) = applied.action {
            self.emit_pulled(&applied.path, entry, action);
        }
        Ok(())
    }

    /// Local path for a remote entry, or `None` when it cannot be placed.
    async fn local_path_for(&self, root_id: &str, entry: &RemoteEntry) -> Option<String> {
        let Some(parent_id) = entry.parent_id() else {
            debug!("Skipping {} ({}): no parent", entry.name, entry.id);
            return None;
        };

        let parent_path = if parent_id == root_id {
            String::new()
        } else {
            match self.store.find_by_remote_id(parent_id).await {
                Some(parent) if parent.is_live() && parent.is_folder() => parent.path,
                _ => {
                    debug!(
                        "Skipping {} ({}): parent {} is not known locally",
                        entry.name, entry.id, parent_id
                    );
                    return None;
                }
            }
        };

        let path = path::join(&parent_path, &entry.name);
        match path::validate(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Skipping remote entry {} ({}): {}", entry.name, entry.id, e);
                None
            }
        }
    }

    async fn fetch_payload(&self, class: EntryClass, entry: &RemoteEntry) -> Result<Payload> {
        let payload = match class {
            EntryClass::Folder => Payload::Folder,
            EntryClass::Text => {
                let text = self.call(self.remote.download_text(&entry.id)).await?;
                Payload::Content(Content::Text(text))
            }
            EntryClass::Opaque => {
                let bytes = self.call(self.remote.download_binary(&entry.id)).await?;
                Payload::Content(Content::Binary(bytes))
            }
            EntryClass::Shadowed => {
                let bytes = self.call(self.remote.download_binary(&entry.id)).await?;
                self.events
                    .progress(format!("Extracting text from {}...", entry.name));
                let text = self.extractor.extract_text(&bytes).await?;
                Payload::Shadowed { bytes, text }
            }
        };
        Ok(payload)
    }

    fn emit_pulled(&self, path: &str, entry: &RemoteEntry, action: PullAction) {
        self.events.emit(SyncEvent::EntryPulled {
            path: path.to_string(),
            remote_id: entry.id.clone(),
            action,
            timestamp: now_millis(),
        });
    }
}

/// Write the outcome of reconciling `entry` at `path`.
///
/// The conflict rule is evaluated again against the transaction's view, so a
/// local edit that landed while the payload downloaded still wins.
fn stage_entry(
    tx: &mut Transaction<'_>,
    entry: &RemoteEntry,
    class: EntryClass,
    path: &str,
    remote_modified: i64,
    remote_meta: Option<SyncMeta>,
    payload: Option<Payload>,
) -> store::Result<Option<Applied>> {
    let Counterpart {
        mut local,
        displaced,
    } = Counterpart::find(tx, &entry.id, path);
    let resolution = Resolution::decide(local.as_ref(), remote_modified);

    let mut applied = Applied {
        path: path.to_string(),
        ..Applied::default()
    };

    tx.ensure_parent(path)?;
    if let Some(occupant) = displaced {
        applied.moved = displace(tx, occupant)?;
        // Moving the occupant may have moved the linked record with it.
        if let Some(id) = local.as_ref().and_then(|l| l.remote_id.clone()) {
            local = tx.find_by_remote_id(&id);
        }
    }
    if let Some(local) = &local {
        if local.path != path {
            applied.moved.extend(relocate(tx, local, path)?);
        }
    }

    match (resolution, payload) {
        (Resolution::AdoptRemote, Some(Payload::Shadowed { bytes, text })) => {
            let source = stage_source(tx, entry, path, &text)?;
            let mut binary = FileRecord::file(path, bytes, remote_modified);
            binary.remote_id = Some(entry.id.clone());
            match &local {
                Some(existing) => {
                    binary.tags = existing.tags.clone();
                    binary.metadata = existing.metadata.clone();
                }
                None => {
                    let meta = remote_meta.unwrap_or_default();
                    binary.tags = meta.tags;
                    binary.metadata = meta.metadata;
                }
            }
            tx.put(binary)?;
            applied.indexed.push(source);
            applied.action = Some(PullAction::Adopted);
        }
        (Resolution::AdoptRemote, Some(payload)) => {
            let content = match payload {
                Payload::Content(content) => Some(content),
                Payload::Folder | Payload::Shadowed { .. } => None,
            };
            let kind = match class {
                EntryClass::Folder => RecordKind::Folder,
                _ => RecordKind::for_file_path(path),
            };
            let meta = remote_meta
                .or_else(|| local.as_ref().map(SyncMeta::from_record))
                .unwrap_or_default();

            if let Some(Content::Text(text)) = &content {
                applied.indexed.push((path.to_string(), text.clone()));
            }
            tx.put(FileRecord {
                path: path.to_string(),
                content,
                kind,
                updated_at: remote_modified,
                remote_id: Some(entry.id.clone()),
                dirty: false,
                deleted: false,
                tags: meta.tags,
                metadata: meta.metadata,
            })?;
            applied.action = Some(PullAction::Adopted);
        }
        (_, _) => {
            // Local side stands. Only its location and link can change.
            let Some(mut record) = local else {
                return Ok((!applied.moved.is_empty()).then_some(applied));
            };
            let linked = record.remote_id.as_deref() == Some(entry.id.as_str());
            if linked && record.path == path {
                return Ok(None);
            }
            record.path = path.to_string();
            record.remote_id = Some(entry.id.clone());
            tx.put(record)?;
            applied.action = Some(PullAction::KeptLocal);
        }
    }
    Ok(Some(applied))
}

/// Move `local` (and its subtree) to `path`. The record itself is rewritten
/// by the caller.
fn relocate(
    tx: &mut Transaction<'_>,
    local: &FileRecord,
    path: &str,
) -> store::Result<Vec<(String, String)>> {
    let mut moved = vec![(local.path.clone(), path.to_string())];
    if local.is_folder() {
        moved.extend(tx.move_descendants(&local.path, path, |_| {})?);
    }
    tx.remove(&local.path);
    Ok(moved)
}

/// Park a record that holds a path another remote object now claims.
///
/// The record keeps its state and remote id under a name tagged with that
/// id (or `local` when unsynced). Its own remote change moves it back into
/// place later.
fn displace(
    tx: &mut Transaction<'_>,
    mut occupant: FileRecord,
) -> store::Result<Vec<(String, String)>> {
    let tag = occupant.remote_id.clone().unwrap_or_else(|| "local".to_string());
    let folder = occupant.is_folder();
    let mut target = path::tagged(&occupant.path, &tag, folder);
    let mut attempt = 1;
    while tx.get(&target).is_some() {
        attempt += 1;
        target = path::tagged(&occupant.path, &format!("{tag} {attempt}"), folder);
    }
    path::validate(&target)?;

    debug!("Moving {} aside to {}", occupant.path, target);
    let moved = relocate(tx, &occupant, &target)?;
    occupant.path = target;
    tx.put(occupant)?;
    Ok(moved)
}

/// Write the source document for a shadowed binary. Returns its path and text
/// for indexing.
fn stage_source(
    tx: &mut Transaction<'_>,
    entry: &RemoteEntry,
    binary_path: &str,
    text: &str,
) -> store::Result<(String, String)> {
    let source_path = shadow::source_path_for(binary_path);
    let body = shadow::source_document(&entry.name, text);

    let mut source = FileRecord::file(source_path.as_str(), body.as_str(), now_millis());
    if let Some(existing) = tx.get(&source_path) {
        source.remote_id = existing.remote_id;
        source.tags = existing.tags;
        source.metadata = existing.metadata;
    }
    source.kind = RecordKind::Source;
    source.metadata.insert(IS_SOURCE_KEY.into(), serde_json::Value::Bool(true));
    source.dirty = true;
    tx.put(source)?;
    Ok((source_path, body))
}
