//! RecordStore: the path-keyed table of FileRecords plus a small settings table.
//!
//! All writes go through [`RecordStore::transaction`]. A transaction stages
//! its writes over a read-only view of the committed tables, then commits
//! them in one step and hands the new snapshot to the [`StoreBackend`]. If
//! the backend fails, the in-memory tables are rolled back, so readers never
//! observe a partially applied transaction.
//!
//! Implementations of `StoreBackend`:
//! - `MemoryBackend` - Keeps nothing; for tests and ephemeral stores
//! - `JsonFileBackend` (in sync-daemon) - One JSON document on disk

use crate::path::{self, PathError};
use crate::record::{FileRecord, now_millis};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Setting key for the remote change-feed position.
pub const CHANGE_TOKEN_KEY: &str = "drive_start_page_token";

/// Setting key for the cached remote id of the sync root folder.
pub const ROOT_FOLDER_KEY: &str = "drive_root_folder_id";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("Not a folder: {0}")]
    NotAFolder(String),

    #[error("Is a folder: {0}")]
    IsAFolder(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Whether reads include tombstoned records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Live,
    All,
}

impl Visibility {
    fn admits(self, record: &FileRecord) -> bool {
        self == Visibility::All || record.is_live()
    }
}

/// Full persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub records: BTreeMap<String, FileRecord>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Durable home of a store's snapshot.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Load the last persisted snapshot, or an empty one.
    async fn load(&self) -> Result<Snapshot>;

    /// Persist a committed snapshot. Must be all-or-nothing.
    async fn persist(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Backend that keeps the last persisted snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    saved: Mutex<Snapshot>,
    fail_next: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            saved: Mutex::new(snapshot),
            fail_next: Mutex::new(None),
        }
    }

    /// Make the next `persist` fail with `message`.
    pub fn fail_next_persist(&self, message: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// What the last successful `persist` stored.
    pub fn saved(&self) -> Snapshot {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn load(&self) -> Result<Snapshot> {
        Ok(self.saved())
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(message) = self.fail_next.lock().unwrap_or_else(|e| e.into_inner()).take() {
            return Err(StoreError::Persistence(message));
        }
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        Ok(())
    }
}

/// Committed tables plus the remote id index.
#[derive(Debug, Default)]
struct Tables {
    snapshot: Snapshot,
    by_remote_id: HashMap<String, String>,
}

impl Tables {
    fn new(snapshot: Snapshot) -> Self {
        let mut tables = Self {
            snapshot,
            by_remote_id: HashMap::new(),
        };
        tables.rebuild_index();
        tables
    }

    fn rebuild_index(&mut self) {
        self.by_remote_id = self
            .snapshot
            .records
            .values()
            .filter_map(|r| r.remote_id.clone().map(|id| (id, r.path.clone())))
            .collect();
    }

    fn unindex(&mut self, record: &FileRecord) {
        if let Some(id) = &record.remote_id {
            if self.by_remote_id.get(id) == Some(&record.path) {
                self.by_remote_id.remove(id);
            }
        }
    }

    fn apply(&mut self, staged: Staged) -> Undo {
        let mut undo = Undo::default();
        if staged.cleared {
            undo.snapshot = Some(std::mem::take(&mut self.snapshot));
        }

        for (path, value) in staged.records {
            let previous = match value {
                Some(record) => {
                    if let Some(id) = &record.remote_id {
                        self.by_remote_id.insert(id.clone(), path.clone());
                    }
                    self.snapshot.records.insert(path.clone(), record)
                }
                None => self.snapshot.records.remove(&path),
            };
            if let Some(previous) = &previous {
                let still_indexed = self
                    .snapshot
                    .records
                    .get(&path)
                    .is_some_and(|r| r.remote_id == previous.remote_id);
                if !still_indexed {
                    self.unindex(previous);
                }
            }
            if undo.snapshot.is_none() {
                undo.records.push((path, previous));
            }
        }

        for (key, value) in staged.settings {
            let previous = match value {
                Some(value) => self.snapshot.settings.insert(key.clone(), value),
                None => self.snapshot.settings.remove(&key),
            };
            if undo.snapshot.is_none() {
                undo.settings.push((key, previous));
            }
        }

        if staged.cleared {
            self.rebuild_index();
        }
        undo
    }

    fn revert(&mut self, undo: Undo) {
        if let Some(snapshot) = undo.snapshot {
            self.snapshot = snapshot;
        } else {
            for (path, previous) in undo.records.into_iter().rev() {
                match previous {
                    Some(record) => self.snapshot.records.insert(path, record),
                    None => self.snapshot.records.remove(&path),
                };
            }
            for (key, previous) in undo.settings.into_iter().rev() {
                match previous {
                    Some(value) => self.snapshot.settings.insert(key, value),
                    None => self.snapshot.settings.remove(&key),
                };
            }
        }
        self.rebuild_index();
    }
}

#[derive(Debug, Default)]
struct Staged {
    cleared: bool,
    records: BTreeMap<String, Option<FileRecord>>,
    settings: BTreeMap<String, Option<String>>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        !self.cleared && self.records.is_empty() && self.settings.is_empty()
    }
}

#[derive(Debug, Default)]
struct Undo {
    snapshot: Option<Snapshot>,
    records: Vec<(String, Option<FileRecord>)>,
    settings: Vec<(String, Option<String>)>,
}

/// Staged writes over the committed tables.
///
/// Reads see the transaction's own writes.
pub struct Transaction<'a> {
    base: &'a Tables,
    staged: Staged,
}

impl<'a> Transaction<'a> {
    fn new(base: &'a Tables) -> Self {
        Self {
            base,
            staged: Staged::default(),
        }
    }

    fn committed(&self, path: &str) -> Option<&'a FileRecord> {
        if self.staged.cleared {
            None
        } else {
            self.base.snapshot.records.get(path)
        }
    }

    /// Record at `path`, tombstones included.
    pub fn get(&self, path: &str) -> Option<FileRecord> {
        match self.staged.records.get(path) {
            Some(staged) => staged.clone(),
            None => self.committed(path).cloned(),
        }
    }

    pub fn get_live(&self, path: &str) -> Option<FileRecord> {
        self.get(path).filter(FileRecord::is_live)
    }

    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<FileRecord> {
        let staged = self
            .staged
            .records
            .values()
            .flatten()
            .find(|r| r.remote_id.as_deref() == Some(remote_id));
        if let Some(record) = staged {
            return Some(record.clone());
        }
        let path = self.base.by_remote_id.get(remote_id)?;
        if self.staged.records.contains_key(path) {
            return None;
        }
        self.committed(path).cloned()
    }

    /// Records at `prefix` or below it, in path order.
    ///
    /// An empty prefix scans everything.
    pub fn list_by_prefix(&self, prefix: &str, visibility: Visibility) -> Vec<FileRecord> {
        let in_scope = |p: &str| path::is_within(p, prefix);

        let mut merged: BTreeMap<&str, &FileRecord> = BTreeMap::new();
        if !self.staged.cleared {
            merged.extend(
                self.base
                    .snapshot
                    .records
                    .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                    .take_while(|(p, _)| p.starts_with(prefix))
                    .filter(|(p, _)| in_scope(p.as_str()))
                    .map(|(p, r)| (p.as_str(), r)),
            );
        }
        for (p, staged) in &self.staged.records {
            if !in_scope(p.as_str()) {
                continue;
            }
            match staged {
                Some(record) => merged.insert(p.as_str(), record),
                None => merged.remove(p.as_str()),
            };
        }
        merged
            .into_values()
            .filter(|r| visibility.admits(r))
            .cloned()
            .collect()
    }

    /// Records strictly below `folder`.
    pub fn descendants(&self, folder: &str, visibility: Visibility) -> Vec<FileRecord> {
        self.list_by_prefix(folder, visibility)
            .into_iter()
            .filter(|r| r.path != folder)
            .collect()
    }

    pub fn dirty(&self) -> Vec<FileRecord> {
        self.list_by_prefix("", Visibility::All)
            .into_iter()
            .filter(|r| r.dirty)
            .collect()
    }

    pub fn setting(&self, key: &str) -> Option<String> {
        match self.staged.settings.get(key) {
            Some(staged) => staged.clone(),
            None if self.staged.cleared => None,
            None => self.base.snapshot.settings.get(key).cloned(),
        }
    }

    /// Insert or replace the record at `record.path`.
    pub fn put(&mut self, record: FileRecord) -> Result<()> {
        path::validate(&record.path)?;
        self.staged.records.insert(record.path.clone(), Some(record));
        Ok(())
    }

    /// Physically remove the record at `path`.
    pub fn remove(&mut self, path: &str) {
        self.staged.records.insert(path.to_string(), None);
    }

    pub fn set_setting(&mut self, key: &str, value: &str) {
        self.staged
            .settings
            .insert(key.to_string(), Some(value.to_string()));
    }

    pub fn remove_setting(&mut self, key: &str) {
        self.staged.settings.insert(key.to_string(), None);
    }

    /// Drop every record and setting.
    pub fn clear(&mut self) {
        self.staged = Staged {
            cleared: true,
            ..Staged::default()
        };
    }

    /// Make sure every ancestor folder of `path` exists and is live.
    ///
    /// Missing folders are created clean; tombstoned folders are revived in
    /// place so they keep their remote id.
    pub fn ensure_parent(&mut self, path: &str) -> Result<()> {
        let Some(parent) = path::parent(path) else {
            return Ok(());
        };
        let existing = self.get(parent);
        match &existing {
            Some(record) if !record.is_folder() => {
                return Err(StoreError::NotAFolder(parent.to_string()));
            }
            Some(record) if record.is_live() => return Ok(()),
            _ => {}
        }

        self.ensure_parent(parent)?;
        let folder = match existing {
            Some(mut tombstone) => {
                debug!("Reviving folder {}", parent);
                tombstone.deleted = false;
                tombstone
            }
            None => {
                debug!("Creating folder {}", parent);
                FileRecord::folder(parent, now_millis())
            }
        };
        self.put(folder)
    }

    /// Move every record below `from` to the same place below `to`.
    ///
    /// `edit` runs on each moved record. Returns `(old, new)` path pairs.
    pub fn move_descendants(
        &mut self,
        from: &str,
        to: &str,
        edit: impl Fn(&mut FileRecord),
    ) -> Result<Vec<(String, String)>> {
        let mut moved = Vec::new();
        for mut record in self.descendants(from, Visibility::All) {
            let Some(new_path) = path::rebase(&record.path, from, to) else {
                continue;
            };
            let old_path = std::mem::replace(&mut record.path, new_path.clone());
            edit(&mut record);
            self.remove(&old_path);
            self.put(record)?;
            moved.push((old_path, new_path));
        }
        Ok(moved)
    }
}

/// Path-keyed record table with transactional writes.
pub struct RecordStore<B: StoreBackend> {
    tables: RwLock<Tables>,
    backend: B,
}

impl RecordStore<MemoryBackend> {
    /// Empty store that persists nowhere.
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            backend: MemoryBackend::new(),
        }
    }
}

impl<B: StoreBackend> RecordStore<B> {
    /// Open a store from whatever the backend last persisted.
    pub async fn open(backend: B) -> Result<Self> {
        let snapshot = backend.load().await?;
        debug!(
            "Opened store with {} records, {} settings",
            snapshot.records.len(),
            snapshot.settings.len()
        );
        Ok(Self {
            tables: RwLock::new(Tables::new(snapshot)),
            backend,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run `f` against staged writes and commit them atomically.
    ///
    /// If `f` fails nothing is written. If persisting fails the committed
    /// tables are rolled back and the error is returned.
    pub async fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        self.try_transaction(f).await
    }

    /// [`transaction`](Self::transaction) for closures failing with their own
    /// error type.
    pub async fn try_transaction<T, E>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut tables = self.tables.write().await;
        let (output, staged) = {
            let mut tx = Transaction::new(&tables);
            let output = f(&mut tx)?;
            (output, tx.staged)
        };
        if staged.is_empty() {
            return Ok(output);
        }

        let undo = tables.apply(staged);
        if let Err(e) = self.backend.persist(&tables.snapshot).await {
            tables.revert(undo);
            return Err(e.into());
        }
        Ok(output)
    }

    /// Run `f` against a read-only view.
    pub async fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> T) -> T {
        let tables = self.tables.read().await;
        f(&Transaction::new(&tables))
    }

    pub async fn get(&self, path: &str) -> Option<FileRecord> {
        self.read(|tx| tx.get(path)).await
    }

    pub async fn find_by_remote_id(&self, remote_id: &str) -> Option<FileRecord> {
        self.read(|tx| tx.find_by_remote_id(remote_id)).await
    }

    pub async fn list_by_prefix(&self, prefix: &str, visibility: Visibility) -> Vec<FileRecord> {
        self.read(|tx| tx.list_by_prefix(prefix, visibility)).await
    }

    pub async fn dirty_records(&self) -> Vec<FileRecord> {
        self.read(|tx| tx.dirty()).await
    }

    pub async fn setting(&self, key: &str) -> Option<String> {
        self.read(|tx| tx.setting(key)).await
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.transaction(|tx| {
            tx.set_setting(key, value);
            Ok(())
        })
        .await
    }

    pub async fn remove_setting(&self, key: &str) -> Result<()> {
        self.transaction(|tx| {
            tx.remove_setting(key);
            Ok(())
        })
        .await
    }

    pub async fn put(&self, record: FileRecord) -> Result<()> {
        self.transaction(|tx| tx.put(record)).await
    }

    /// Number of records, tombstones included.
    pub async fn len(&self) -> usize {
        self.tables.read().await.snapshot.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.tables.read().await.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Content, RecordKind};

    fn file(path: &str) -> FileRecord {
        FileRecord::file(path, "body", 1)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = RecordStore::in_memory();
        store.put(file("a.md")).await.unwrap();

        let record = store.get("a.md").await.unwrap();
        assert_eq!(record.content, Some(Content::Text("body".into())));
        assert!(store.get("b.md").await.is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_path() {
        let store = RecordStore::in_memory();
        let err = store.put(file("../escape.md")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath(PathError::Traversal(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_closure_writes_nothing() {
        let store = RecordStore::in_memory();
        let result: Result<()> = store
            .transaction(|tx| {
                tx.put(file("a.md"))?;
                tx.put(file("bad//path.md"))
            })
            .await;
        assert!(result.is_err());
        assert!(store.get("a.md").await.is_none());
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back() {
        let store = RecordStore::open(MemoryBackend::new()).await.unwrap();
        let mut original = file("a.md");
        original.remote_id = Some("r1".into());
        store.put(original.clone()).await.unwrap();

        store.backend().fail_next_persist("disk full");
        let result = store
            .transaction(|tx| {
                tx.remove("a.md");
                tx.put(file("b.md"))?;
                tx.set_setting(CHANGE_TOKEN_KEY, "42");
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Persistence(_))));
        assert_eq!(store.get("a.md").await, Some(original));
        assert!(store.get("b.md").await.is_none());
        assert!(store.setting(CHANGE_TOKEN_KEY).await.is_none());
        assert!(store.find_by_remote_id("r1").await.is_some());
    }

    #[tokio::test]
    async fn test_transaction_reads_its_own_writes() {
        let store = RecordStore::in_memory();
        store.put(file("a.md")).await.unwrap();

        store
            .transaction(|tx| {
                tx.remove("a.md");
                assert!(tx.get("a.md").is_none());
                tx.put(file("b.md"))?;
                assert!(tx.get("b.md").is_some());
                assert_eq!(tx.list_by_prefix("", Visibility::All).len(), 1);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remote_id_index_follows_moves() {
        let store = RecordStore::in_memory();
        let mut record = file("a.md");
        record.remote_id = Some("r1".into());
        store.put(record.clone()).await.unwrap();

        store
            .transaction(|tx| {
                tx.remove("a.md");
                record.path = "b.md".into();
                tx.put(record)
            })
            .await
            .unwrap();

        assert_eq!(store.find_by_remote_id("r1").await.unwrap().path, "b.md");

        store
            .transaction(|tx| {
                tx.remove("b.md");
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.find_by_remote_id("r1").await.is_none());
    }

    #[tokio::test]
    async fn test_prefix_listing_is_segment_aware_and_filters_tombstones() {
        let store = RecordStore::in_memory();
        let mut gone = file("a/gone.md");
        gone.deleted = true;
        store
            .transaction(|tx| {
                tx.put(FileRecord::folder("a", 1))?;
                tx.put(file("a/x.md"))?;
                tx.put(gone)?;
                tx.put(file("a-b.md"))?;
                tx.put(file("ab/y.md"))
            })
            .await
            .unwrap();

        let live: Vec<_> = store
            .list_by_prefix("a", Visibility::Live)
            .await
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(live, vec!["a", "a/x.md"]);
        assert_eq!(store.list_by_prefix("a", Visibility::All).await.len(), 3);
        assert_eq!(store.list_by_prefix("", Visibility::All).await.len(), 5);
    }

    #[tokio::test]
    async fn test_ensure_parent_creates_clean_folders() {
        let store = RecordStore::in_memory();
        store
            .transaction(|tx| {
                tx.ensure_parent("a/b/c.md")?;
                tx.put(file("a/b/c.md"))
            })
            .await
            .unwrap();

        for folder in ["a", "a/b"] {
            let record = store.get(folder).await.unwrap();
            assert_eq!(record.kind, RecordKind::Folder);
            assert!(!record.dirty);
            assert!(!record.deleted);
        }
    }

    #[tokio::test]
    async fn test_ensure_parent_is_idempotent() {
        let store = RecordStore::in_memory();
        store
            .transaction(|tx| tx.ensure_parent("a/b/c.md"))
            .await
            .unwrap();
        let first = store.snapshot().await;

        store
            .transaction(|tx| {
                tx.ensure_parent("a/b/c.md")?;
                tx.ensure_parent("a/b/c.md")
            })
            .await
            .unwrap();

        assert_eq!(store.len().await, 2);
        assert_eq!(store.snapshot().await, first);
        let paths: Vec<_> = store
            .list_by_prefix("", Visibility::All)
            .await
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(paths, vec!["a", "a/b"]);
    }

    #[tokio::test]
    async fn test_ensure_parent_revives_tombstoned_folder() {
        let store = RecordStore::in_memory();
        let mut tombstone = FileRecord::folder("a", 1);
        tombstone.remote_id = Some("folder-a".into());
        tombstone.deleted = true;
        tombstone.dirty = true;
        store.put(tombstone).await.unwrap();

        store
            .transaction(|tx| tx.ensure_parent("a/c.md"))
            .await
            .unwrap();

        let folder = store.get("a").await.unwrap();
        assert!(folder.is_live());
        assert_eq!(folder.remote_id.as_deref(), Some("folder-a"));
    }

    #[tokio::test]
    async fn test_ensure_parent_rejects_file_ancestor() {
        let store = RecordStore::in_memory();
        store.put(file("a")).await.unwrap();

        let err = store
            .transaction(|tx| tx.ensure_parent("a/c.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotAFolder(p) if p == "a"));
    }

    #[tokio::test]
    async fn test_move_descendants() {
        let store = RecordStore::in_memory();
        store
            .transaction(|tx| {
                tx.put(FileRecord::folder("old", 1))?;
                tx.put(FileRecord::folder("old/sub", 1))?;
                tx.put(file("old/sub/x.md"))?;
                tx.put(file("older.md"))
            })
            .await
            .unwrap();

        let moved = store
            .transaction(|tx| tx.move_descendants("old", "new", |r| r.dirty = true))
            .await
            .unwrap();

        assert_eq!(moved.len(), 2);
        assert!(store.get("new/sub/x.md").await.unwrap().dirty);
        assert!(store.get("old/sub/x.md").await.is_none());
        assert!(store.get("older.md").await.is_some());
        // The root of the move is left to the caller.
        assert!(store.get("old").await.is_some());
    }

    #[tokio::test]
    async fn test_clear_then_write() {
        let store = RecordStore::in_memory();
        store.put(file("a.md")).await.unwrap();
        store.set_setting(ROOT_FOLDER_KEY, "root").await.unwrap();

        store
            .transaction(|tx| {
                tx.clear();
                tx.put(FileRecord::folder("misc", 1))
            })
            .await
            .unwrap();

        assert!(store.get("a.md").await.is_none());
        assert!(store.setting(ROOT_FOLDER_KEY).await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_reopen_from_backend() {
        let backend = MemoryBackend::new();
        let store = RecordStore::open(backend).await.unwrap();
        store.put(file("a.md")).await.unwrap();
        store.set_setting(CHANGE_TOKEN_KEY, "7").await.unwrap();

        let saved = store.backend().saved();
        let reopened = RecordStore::open(MemoryBackend::with_snapshot(saved))
            .await
            .unwrap();
        assert!(reopened.get("a.md").await.is_some());
        assert_eq!(reopened.setting(CHANGE_TOKEN_KEY).await.as_deref(), Some("7"));
    }
}
