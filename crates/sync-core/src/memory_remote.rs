//! In-memory drive for testing.
//!
//! Behaves like the real provider where the engine can tell the difference:
//! ids are opaque, every mutation lands in a paged change feed, deleting a
//! folder deletes its subtree, and `FolderNamed` queries ignore trashed
//! folders. Failures and latency can be scripted per operation.

use crate::record::Content;
use crate::remote::{
    ChangePage, FOLDER_MIME, MetadataUpdate, Properties, Query, RemoteChange, RemoteEntry,
    RemoteError, RemoteProvider, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Provider operation, for scripting failures and inspecting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    ListFiles,
    StartPageToken,
    ListChanges,
    DownloadText,
    DownloadBinary,
    GetMetadata,
    UpdateMetadata,
    UpdateContent,
    CreateFile,
    CreateFolder,
    Delete,
}

/// One provider call as seen by the remote. `target` is an id, a name, or a
/// page token depending on the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub target: String,
}

struct StoredObject {
    entry: RemoteEntry,
    content: Option<Content>,
    deletable: bool,
}

struct ScriptedFailure {
    op: RemoteOp,
    target: Option<String>,
    error: RemoteError,
}

struct DriveState {
    objects: BTreeMap<String, StoredObject>,
    next_id: u64,
    /// Ids in the order they changed. A page token is an index into this.
    feed: Vec<String>,
    page_size: usize,
    omit_page_tokens: bool,
    failures: Vec<ScriptedFailure>,
    calls: Vec<RemoteCall>,
    latency: Option<Duration>,
}

pub struct MemoryRemote {
    state: Mutex<DriveState>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DriveState {
                objects: BTreeMap::new(),
                next_id: 1,
                feed: Vec::new(),
                page_size: 100,
                omit_page_tokens: false,
                failures: Vec::new(),
                calls: Vec::new(),
                latency: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DriveState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Remote-side activity (another device editing the drive) ---

    pub fn add_folder(&self, name: &str, parent_id: Option<&str>) -> String {
        let mut state = self.lock();
        state.insert(name, FOLDER_MIME, parent_id, None, Properties::new())
    }

    pub fn add_file(
        &self,
        name: &str,
        parent_id: &str,
        mime_type: &str,
        content: impl Into<Content>,
    ) -> String {
        let mut state = self.lock();
        state.insert(
            name,
            mime_type,
            Some(parent_id),
            Some(content.into()),
            Properties::new(),
        )
    }

    pub fn set_properties(&self, id: &str, properties: Properties) {
        self.lock().mutate(id, |object| object.entry.properties = properties);
    }

    pub fn edit_content(&self, id: &str, content: impl Into<Content>) {
        let content = content.into();
        self.lock().mutate(id, |object| object.content = Some(content));
    }

    pub fn rename_entry(&self, id: &str, name: &str) {
        self.lock().mutate(id, |object| object.entry.name = name.to_string());
    }

    pub fn move_entry(&self, id: &str, new_parent_id: &str) {
        self.lock()
            .mutate(id, |object| object.entry.parent_ids = vec![new_parent_id.to_string()]);
    }

    pub fn trash_entry(&self, id: &str) {
        self.lock().mutate(id, |object| object.entry.trashed = true);
    }

    /// Delete an object and its subtree, as another device would.
    pub fn remove_entry(&self, id: &str) {
        self.lock().remove_tree(id);
    }

    /// Override the modified time without touching the change feed.
    pub fn set_modified(&self, id: &str, when: DateTime<Utc>) {
        if let Some(object) = self.lock().objects.get_mut(id) {
            object.entry.modified_time = Some(when);
        }
    }

    /// Deletes of `id` fail with `PermissionDenied`.
    pub fn deny_delete(&self, id: &str) {
        if let Some(object) = self.lock().objects.get_mut(id) {
            object.deletable = false;
        }
    }

    pub fn set_can_add_children(&self, id: &str, allowed: bool) {
        if let Some(object) = self.lock().objects.get_mut(id) {
            object.entry.can_add_children = allowed;
        }
    }

    // --- Scripting ---

    pub fn set_page_size(&self, page_size: usize) {
        self.lock().page_size = page_size.max(1);
    }

    /// Change pages come back with neither a next nor a new start token.
    pub fn omit_page_tokens(&self) {
        self.lock().omit_page_tokens = true;
    }

    /// Every call waits this long before doing anything.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Fail the next call of `op`, whatever its target.
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        self.lock().failures.push(ScriptedFailure {
            op,
            target: None,
            error,
        });
    }

    /// Fail the next call of `op` on `target`.
    pub fn fail_on(&self, op: RemoteOp, target: &str, error: RemoteError) {
        self.lock().failures.push(ScriptedFailure {
            op,
            target: Some(target.to_string()),
            error,
        });
    }

    // --- Inspection ---

    pub fn entry(&self, id: &str) -> Option<RemoteEntry> {
        self.lock().objects.get(id).map(|o| o.entry.clone())
    }

    pub fn content(&self, id: &str) -> Option<Content> {
        self.lock().objects.get(id).and_then(|o| o.content.clone())
    }

    /// Walk `path` down from `root_id` by name.
    pub fn lookup(&self, root_id: &str, path: &str) -> Option<RemoteEntry> {
        let state = self.lock();
        let mut current = root_id.to_string();
        let mut found = None;
        for segment in path.split('/') {
            let entry = state
                .objects
                .values()
                .map(|o| &o.entry)
                .find(|e| !e.trashed && e.name == segment && e.parent_id() == Some(current.as_str()))?;
            current = entry.id.clone();
            found = Some(entry.clone());
        }
        found
    }

    /// Live entries named `name`, anywhere.
    pub fn find_by_name(&self, name: &str) -> Vec<RemoteEntry> {
        self.lock()
            .objects
            .values()
            .filter(|o| !o.entry.trashed && o.entry.name == name)
            .map(|o| o.entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Record the call, apply latency and scripted failures.
    async fn enter(&self, op: RemoteOp, target: &str) -> Result<()> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.calls.push(RemoteCall {
            op,
            target: target.to_string(),
        });
        let scripted = state
            .failures
            .iter()
            .position(|f| f.op == op && f.target.as_deref().is_none_or(|t| t == target));
        match scripted {
            Some(index) => Err(state.failures.remove(index).error),
            None => Ok(()),
        }
    }
}

impl DriveState {
    fn insert(
        &mut self,
        name: &str,
        mime_type: &str,
        parent_id: Option<&str>,
        content: Option<Content>,
        properties: Properties,
    ) -> String {
        let id = format!("mem-{}", self.next_id);
        self.next_id += 1;
        let entry = RemoteEntry {
            id: id.clone(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            parent_ids: parent_id.map(|p| vec![p.to_string()]).unwrap_or_default(),
            modified_time: Some(Utc::now()),
            properties,
            trashed: false,
            can_add_children: mime_type == FOLDER_MIME,
        };
        self.objects.insert(
            id.clone(),
            StoredObject {
                entry,
                content,
                deletable: true,
            },
        );
        self.feed.push(id.clone());
        id
    }

    fn mutate(&mut self, id: &str, edit: impl FnOnce(&mut StoredObject)) -> bool {
        let Some(object) = self.objects.get_mut(id) else {
            return false;
        };
        edit(object);
        object.entry.modified_time = Some(Utc::now());
        self.feed.push(id.to_string());
        true
    }

    fn remove_tree(&mut self, id: &str) {
        let mut pending = vec![id.to_string()];
        while let Some(current) = pending.pop() {
            if self.objects.remove(&current).is_none() {
                continue;
            }
            pending.extend(
                self.objects
                    .values()
                    .filter(|o| o.entry.parent_id() == Some(current.as_str()))
                    .map(|o| o.entry.id.clone()),
            );
            self.feed.push(current);
        }
    }

    fn object(&self, id: &str) -> Result<&StoredObject> {
        self.objects
            .get(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    fn require_folder(&self, id: &str) -> Result<()> {
        if self.object(id)?.entry.is_container() {
            Ok(())
        } else {
            Err(RemoteError::Other(format!("{id} is not a folder")))
        }
    }
}

#[async_trait]
impl RemoteProvider for MemoryRemote {
    async fn list_files(&self, query: &Query) -> Result<Vec<RemoteEntry>> {
        let target = match query {
            Query::Children { parent_id } => parent_id.clone(),
            Query::FolderNamed { name, .. } => name.clone(),
        };
        self.enter(RemoteOp::ListFiles, &target).await?;

        let state = self.lock();
        let live = state.objects.values().map(|o| &o.entry).filter(|e| !e.trashed);
        let mut entries: Vec<RemoteEntry> = match query {
            Query::Children { parent_id } => live
                .filter(|e| e.parent_ids.iter().any(|p| p == parent_id))
                .cloned()
                .collect(),
            Query::FolderNamed { name, parent_id } => live
                .filter(|e| e.is_container() && &e.name == name)
                .filter(|e| {
                    parent_id
                        .as_ref()
                        .is_none_or(|p| e.parent_ids.iter().any(|q| q == p))
                })
                .cloned()
                .collect(),
        };
        entries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn start_page_token(&self) -> Result<String> {
        self.enter(RemoteOp::StartPageToken, "").await?;
        Ok(self.lock().feed.len().to_string())
    }

    async fn list_changes(&self, page_token: &str) -> Result<ChangePage> {
        self.enter(RemoteOp::ListChanges, page_token).await?;

        let state = self.lock();
        let start: usize = page_token
            .parse()
            .map_err(|_| RemoteError::Malformed(format!("bad page token {page_token:?}")))?;
        let end = (start + state.page_size).min(state.feed.len());
        let changes = state
            .feed
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|id| match state.objects.get(id) {
                Some(object) => RemoteChange::Changed(object.entry.clone()),
                None => RemoteChange::Removed { id: id.clone() },
            })
            .collect();

        let (next_page_token, new_start_page_token) = if state.omit_page_tokens {
            (None, None)
        } else if end < state.feed.len() {
            (Some(end.to_string()), None)
        } else {
            (None, Some(state.feed.len().to_string()))
        };
        Ok(ChangePage {
            changes,
            next_page_token,
            new_start_page_token,
        })
    }

    async fn download_text(&self, id: &str) -> Result<String> {
        self.enter(RemoteOp::DownloadText, id).await?;
        let state = self.lock();
        match &state.object(id)?.content {
            Some(Content::Text(text)) => Ok(text.clone()),
            Some(Content::Binary(bytes)) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            None => Err(RemoteError::Other(format!("{id} has no content"))),
        }
    }

    async fn download_binary(&self, id: &str) -> Result<Vec<u8>> {
        self.enter(RemoteOp::DownloadBinary, id).await?;
        let state = self.lock();
        state
            .object(id)?
            .content
            .as_ref()
            .map(|c| c.as_bytes().to_vec())
            .ok_or_else(|| RemoteError::Other(format!("{id} has no content")))
    }

    async fn get_metadata(&self, id: &str) -> Result<RemoteEntry> {
        self.enter(RemoteOp::GetMetadata, id).await?;
        Ok(self.lock().object(id)?.entry.clone())
    }

    async fn update_metadata(&self, id: &str, update: &MetadataUpdate) -> Result<()> {
        self.enter(RemoteOp::UpdateMetadata, id).await?;
        let mut state = self.lock();
        state.object(id)?;
        for parent in &update.add_parents {
            state.require_folder(parent)?;
        }
        state.mutate(id, |object| {
            if let Some(name) = &update.name {
                object.entry.name = name.clone();
            }
            let parents = &mut object.entry.parent_ids;
            parents.retain(|p| !update.remove_parents.contains(p));
            for parent in &update.add_parents {
                if !parents.contains(parent) {
                    parents.push(parent.clone());
                }
            }
            if let Some(properties) = &update.properties {
                object.entry.properties.extend(properties.clone());
            }
        });
        Ok(())
    }

    async fn update_content(&self, id: &str, content: &Content) -> Result<()> {
        self.enter(RemoteOp::UpdateContent, id).await?;
        let mut state = self.lock();
        state.object(id)?;
        state.mutate(id, |object| object.content = Some(content.clone()));
        Ok(())
    }

    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        content: &Content,
        properties: &Properties,
    ) -> Result<RemoteEntry> {
        self.enter(RemoteOp::CreateFile, name).await?;
        let mut state = self.lock();
        state.require_folder(parent_id)?;
        let mime = crate::shadow::mime_for_name(name);
        let id = state.insert(
            name,
            mime,
            Some(parent_id),
            Some(content.clone()),
            properties.clone(),
        );
        Ok(state.object(&id)?.entry.clone())
    }

    async fn create_folder(&self, name: &str, parent_id: Option<&str>) -> Result<RemoteEntry> {
        self.enter(RemoteOp::CreateFolder, name).await?;
        let mut state = self.lock();
        if let Some(parent) = parent_id {
            state.require_folder(parent)?;
        }
        let id = state.insert(name, FOLDER_MIME, parent_id, None, Properties::new());
        Ok(state.object(&id)?.entry.clone())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.enter(RemoteOp::Delete, id).await?;
        let mut state = self.lock();
        if !state.object(id)?.deletable {
            return Err(RemoteError::PermissionDenied(format!(
                "insufficient permissions to delete {id}"
            )));
        }
        state.remove_tree(id);
        Ok(())
    }
}
