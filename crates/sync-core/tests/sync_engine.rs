//! End-to-end sync passes against the in-memory drive.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sync_core::config::DEFAULT_ROOT_FOLDER;
use sync_core::memory_remote::{MemoryRemote, RemoteOp};
use sync_core::remote::{Properties, SyncMeta, META_PROPERTY};
use sync_core::store::{CHANGE_TOKEN_KEY, ROOT_FOLDER_KEY};
use sync_core::{
    Content, ExtractError, IndexError, Indexer, MemoryBackend, PullAction, RecordKind, RecordStore,
    RemoteError, SyncConfig, SyncEngine, SyncError, SyncEvent, SyncOutcome, SyncState, Tags,
    TextExtractor, Vault,
};

#[derive(Debug, Clone, PartialEq)]
enum IndexCall {
    Index(String),
    Remove(String),
    Rename(String, String),
}

#[derive(Default)]
struct RecordingIndexer {
    calls: Mutex<Vec<IndexCall>>,
}

impl RecordingIndexer {
    fn calls(&self) -> Vec<IndexCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Indexer for RecordingIndexer {
    async fn index(&self, path: &str, _text: &str) -> Result<(), IndexError> {
        self.calls.lock().unwrap().push(IndexCall::Index(path.into()));
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), IndexError> {
        self.calls.lock().unwrap().push(IndexCall::Remove(path.into()));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), IndexError> {
        self.calls
            .lock()
            .unwrap()
            .push(IndexCall::Rename(from.into(), to.into()));
        Ok(())
    }
}

#[derive(Default)]
struct StubExtractor {
    fail: bool,
}

#[async_trait]
impl TextExtractor for StubExtractor {
    async fn extract_text(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        if self.fail {
            return Err(ExtractError::Failed("corrupt document".into()));
        }
        Ok(format!("{} bytes of text", bytes.len()))
    }
}

type Engine = SyncEngine<Arc<MemoryRemote>, MemoryBackend>;

struct Harness {
    remote: Arc<MemoryRemote>,
    root: String,
    store: Arc<RecordStore<MemoryBackend>>,
    vault: Vault<MemoryBackend>,
    engine: Arc<Engine>,
    indexer: Arc<RecordingIndexer>,
    events: Arc<Mutex<Vec<SyncEvent>>>,
    _subscription: sync_core::Subscription,
}

impl Harness {
    fn new() -> Self {
        Self::build(SyncConfig::default(), StubExtractor::default())
    }

    fn build(config: SyncConfig, extractor: StubExtractor) -> Self {
        let remote = Arc::new(MemoryRemote::new());
        let root = remote.add_folder(DEFAULT_ROOT_FOLDER, None);
        let store = Arc::new(RecordStore::in_memory());
        let indexer = Arc::new(RecordingIndexer::default());
        let vault = Vault::new(Arc::clone(&store), indexer.clone());
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&remote),
            Arc::clone(&store),
            Arc::new(extractor),
            indexer.clone(),
            config,
        ));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = engine
            .events()
            .subscribe(move |event| sink.lock().unwrap().push(event));

        Self {
            remote,
            root,
            store,
            vault,
            engine,
            indexer,
            events,
            _subscription: subscription,
        }
    }

    async fn sync(&self) -> SyncOutcome {
        self.engine.sync().await.expect("sync pass failed")
    }

    fn progress_messages(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                SyncEvent::Progress { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Index notifications are dispatched on background tasks.
    async fn wait_for_index(&self, call: IndexCall) {
        for _ in 0..200 {
            if self.indexer.calls().contains(&call) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("indexer never saw {call:?}; saw {:?}", self.indexer.calls());
    }
}

fn in_an_hour() -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::hours(1)
}

fn an_hour_ago() -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(1)
}

#[tokio::test]
async fn test_first_sync_pulls_remote_tree() {
    let h = Harness::new();
    let misc = h.remote.add_folder("misc", Some(&h.root));
    let note = h.remote.add_file("a.md", &misc, "text/markdown", "hello");
    h.remote.add_file("logo.png", &h.root, "image/png", vec![0x89, 0x50]);

    let outcome = h.sync().await;

    assert_eq!(outcome, SyncOutcome::Completed { pull_failed: false });
    let folder = h.store.get("misc").await.unwrap();
    assert_eq!(folder.kind, RecordKind::Folder);
    assert_eq!(folder.remote_id.as_deref(), Some(misc.as_str()));

    let file = h.store.get("misc/a.md").await.unwrap();
    assert_eq!(file.text(), Some("hello"));
    assert_eq!(file.remote_id.as_deref(), Some(note.as_str()));
    assert!(!file.dirty);

    let image = h.store.get("logo.png").await.unwrap();
    assert_eq!(image.content, Some(Content::Binary(vec![0x89, 0x50])));
    assert!(!image.dirty);

    assert!(h.store.setting(CHANGE_TOKEN_KEY).await.is_some());
    assert_eq!(h.store.setting(ROOT_FOLDER_KEY).await, Some(h.root.clone()));
    h.wait_for_index(IndexCall::Index("misc/a.md".into())).await;
    assert_eq!(h.engine.state(), SyncState::Idle);
}

#[tokio::test]
async fn test_binary_is_shadowed_by_dirty_source() {
    let h = Harness::new();
    let pdf = h
        .remote
        .add_file("paper.pdf", &h.root, "application/pdf", vec![1u8; 12]);
    h.remote.fail_on(
        RemoteOp::CreateFile,
        "paper.pdf.source.md",
        RemoteError::Network("connection reset".into()),
    );

    h.sync().await;

    let records = h.store.list_by_prefix("", sync_core::Visibility::All).await;
    assert_eq!(records.len(), 2);

    let binary = h.store.get("paper.pdf").await.unwrap();
    assert!(!binary.dirty);
    assert_eq!(binary.remote_id.as_deref(), Some(pdf.as_str()));
    assert_eq!(binary.content, Some(Content::Binary(vec![1u8; 12])));

    let source = h.store.get("paper.pdf.source.md").await.unwrap();
    assert!(source.dirty);
    assert_eq!(source.kind, RecordKind::Source);
    assert_eq!(source.text(), Some("## Source: paper.pdf\n\n12 bytes of text"));
    assert_eq!(source.metadata.get("isSource"), Some(&serde_json::Value::Bool(true)));
}

#[tokio::test]
async fn test_shadow_source_is_uploaded_in_the_same_pass() {
    let h = Harness::new();
    h.remote
        .add_file("paper.pdf", &h.root, "application/pdf", vec![1u8; 3]);

    h.sync().await;

    let uploaded = h.remote.lookup(&h.root, "paper.pdf.source.md").unwrap();
    let source = h.store.get("paper.pdf.source.md").await.unwrap();
    assert!(!source.dirty);
    assert_eq!(source.remote_id.as_deref(), Some(uploaded.id.as_str()));
    assert_eq!(
        h.remote.content(&uploaded.id),
        Some(Content::Text("## Source: paper.pdf\n\n3 bytes of text".into()))
    );
}

#[tokio::test]
async fn test_extraction_failure_skips_entry() {
    let h = Harness::build(SyncConfig::default(), StubExtractor { fail: true });
    h.remote
        .add_file("paper.pdf", &h.root, "application/pdf", vec![1u8; 3]);

    h.sync().await;

    assert!(h.store.is_empty().await);
    assert!(h
        .progress_messages()
        .contains(&"Error downloading paper.pdf".to_string()));
}

#[tokio::test]
async fn test_entry_the_store_cannot_hold_is_skipped() {
    let h = Harness::new();
    // The binary path fits, its source document path does not.
    let long = "d".repeat(1010);
    let folder = h.remote.add_folder(&long, Some(&h.root));
    let pdf = h.remote.add_file("x.pdf", &folder, "application/pdf", vec![1u8; 3]);
    h.remote.add_file("ok.md", &h.root, "text/markdown", "fine");

    let outcome = h.sync().await;

    assert_eq!(outcome, SyncOutcome::Completed { pull_failed: false });
    assert!(h.store.setting(CHANGE_TOKEN_KEY).await.is_some());
    assert!(h.store.get(&long).await.is_some());
    assert!(h.store.get(&format!("{long}/x.pdf")).await.is_none());
    assert_eq!(h.store.get("ok.md").await.unwrap().text(), Some("fine"));
    assert!(h.events.lock().unwrap().iter().any(|e| matches!(
        e,
        SyncEvent::EntryPulled { remote_id, action: PullAction::Skipped, .. } if *remote_id == pdf
    )));
}

#[tokio::test]
async fn test_push_creates_missing_remote_folders() {
    let h = Harness::new();
    h.vault
        .save_file("misc/Notes/a.md", "# Notes", None, None)
        .await
        .unwrap();

    h.sync().await;

    let misc = h.remote.lookup(&h.root, "misc").unwrap();
    let notes = h.remote.lookup(&h.root, "misc/Notes").unwrap();
    let file = h.remote.lookup(&h.root, "misc/Notes/a.md").unwrap();
    assert!(misc.is_container() && notes.is_container());
    assert_eq!(h.remote.content(&file.id), Some(Content::Text("# Notes".into())));

    for (path, id) in [("misc", &misc.id), ("misc/Notes", &notes.id), ("misc/Notes/a.md", &file.id)] {
        let record = h.store.get(path).await.unwrap();
        assert!(!record.dirty, "{path} should be clean");
        assert_eq!(record.remote_id.as_deref(), Some(id.as_str()), "{path}");
    }
    assert_eq!(h.remote.call_count(RemoteOp::CreateFolder), 2);
}

#[tokio::test]
async fn test_push_reuses_same_named_remote_folder() {
    let h = Harness::new();
    h.sync().await;
    // Created by another device after our full pull.
    let misc = h.remote.add_folder("misc", Some(&h.root));
    let token = h.store.setting(CHANGE_TOKEN_KEY).await.unwrap();
    h.remote
        .fail_on(RemoteOp::ListChanges, &token, RemoteError::Network("offline".into()));
    h.vault.create_folder("misc").await.unwrap();

    h.sync().await;

    assert_eq!(h.store.get("misc").await.unwrap().remote_id, Some(misc));
    assert_eq!(h.remote.find_by_name("misc").len(), 1);
}

#[tokio::test]
async fn test_local_dirty_wins_over_newer_remote() {
    let h = Harness::new();
    let id = h.remote.add_file("a.md", &h.root, "text/markdown", "v1");
    h.sync().await;

    h.vault.update_file("a.md", "local edit").await.unwrap();
    h.remote.edit_content(&id, "remote edit");
    h.remote.set_modified(&id, in_an_hour());

    h.sync().await;

    let record = h.store.get("a.md").await.unwrap();
    assert_eq!(record.text(), Some("local edit"));
    assert!(!record.dirty);
    assert_eq!(h.remote.content(&id), Some(Content::Text("local edit".into())));
}

#[tokio::test]
async fn test_newer_remote_edit_is_adopted() {
    let h = Harness::new();
    let id = h.remote.add_file("a.md", &h.root, "text/markdown", "v1");
    h.sync().await;

    h.remote.edit_content(&id, "v2");
    h.remote.set_modified(&id, in_an_hour());
    h.sync().await;

    let record = h.store.get("a.md").await.unwrap();
    assert_eq!(record.text(), Some("v2"));
    assert!(!record.dirty);
    assert_eq!(record.updated_at, h.remote.entry(&id).unwrap().modified_millis().unwrap());
}

#[tokio::test]
async fn test_older_remote_edit_is_ignored() {
    let h = Harness::new();
    let id = h.remote.add_file("a.md", &h.root, "text/markdown", "v1");
    h.sync().await;
    h.vault.update_file("a.md", "mine").await.unwrap();
    h.sync().await;

    h.remote.edit_content(&id, "stale");
    h.remote.set_modified(&id, an_hour_ago());
    h.sync().await;

    assert_eq!(h.store.get("a.md").await.unwrap().text(), Some("mine"));
    assert_eq!(h.remote.call_count(RemoteOp::DownloadText), 1);
}

#[tokio::test]
async fn test_remote_removal_deletes_local_record() {
    let h = Harness::new();
    let id = h.remote.add_file("a.md", &h.root, "text/markdown", "v1");
    h.sync().await;

    h.remote.remove_entry(&id);
    h.sync().await;

    assert!(h.store.get("a.md").await.is_none());
    h.wait_for_index(IndexCall::Remove("a.md".into())).await;
    assert!(h
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SyncEvent::LocalRemoved { path, .. } if path == "a.md")));
}

#[tokio::test]
async fn test_trashed_folder_removes_subtree() {
    let h = Harness::new();
    let misc = h.remote.add_folder("misc", Some(&h.root));
    h.remote.add_file("a.md", &misc, "text/markdown", "a");
    h.remote.add_file("b.md", &misc, "text/markdown", "b");
    h.sync().await;
    assert_eq!(h.store.len().await, 3);

    h.remote.trash_entry(&misc);
    h.sync().await;

    assert!(h.store.is_empty().await);
    h.wait_for_index(IndexCall::Remove("misc/b.md".into())).await;
}

#[tokio::test]
async fn test_full_pull_removes_orphans_but_keeps_dirty_records() {
    let h = Harness::new();
    let mut stale = sync_core::FileRecord::file("stale.md", "old", 1);
    stale.remote_id = Some("vanished-1".into());
    let mut draft = sync_core::FileRecord::file("draft.md", "wip", 1);
    draft.remote_id = Some("vanished-2".into());
    draft.dirty = true;
    h.store.put(stale).await.unwrap();
    h.store.put(draft).await.unwrap();

    h.sync().await;

    assert!(h.store.get("stale.md").await.is_none());
    h.wait_for_index(IndexCall::Remove("stale.md".into())).await;

    // The draft's remote copy is gone too: it is unlinked, then re-created.
    let draft = h.store.get("draft.md").await.unwrap();
    assert!(draft.dirty && draft.remote_id.is_none());
    h.sync().await;
    let draft = h.store.get("draft.md").await.unwrap();
    assert!(!draft.dirty);
    let uploaded = h.remote.lookup(&h.root, "draft.md").unwrap();
    assert_eq!(draft.remote_id, Some(uploaded.id));
}

#[tokio::test]
async fn test_overlapping_sync_is_dropped() {
    let h = Harness::new();
    h.vault.save_file("a.md", "x", None, None).await.unwrap();
    h.remote.set_latency(Duration::from_millis(50));

    let first = h.engine.spawn_sync();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_ne!(h.engine.state(), SyncState::Idle);

    let second = h.engine.sync().await.unwrap();
    assert_eq!(second, SyncOutcome::AlreadyRunning);

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome, SyncOutcome::Completed { pull_failed: false });
    assert_eq!(h.engine.state(), SyncState::Idle);
    assert!(!h.store.get("a.md").await.unwrap().dirty);
}

#[tokio::test]
async fn test_failed_pull_still_pushes() {
    let h = Harness::new();
    h.vault.save_file("a.md", "x", None, None).await.unwrap();
    h.remote.fail_on(
        RemoteOp::ListFiles,
        &h.root,
        RemoteError::Server {
            status: 503,
            message: "backend error".into(),
        },
    );

    let outcome = h.sync().await;

    assert_eq!(outcome, SyncOutcome::Completed { pull_failed: true });
    assert!(h.remote.lookup(&h.root, "a.md").is_some());
    assert!(h.store.setting(CHANGE_TOKEN_KEY).await.is_none());
}

#[tokio::test]
async fn test_unauthorized_fails_the_pass() {
    let h = Harness::new();
    h.vault.save_file("a.md", "x", None, None).await.unwrap();
    h.remote.fail_on(
        RemoteOp::ListFiles,
        &h.root,
        RemoteError::Unauthorized("token expired".into()),
    );

    let err = h.engine.sync().await.unwrap_err();

    assert!(matches!(err, SyncError::Unauthorized(_)));
    assert!(h.store.get("a.md").await.unwrap().dirty);
    assert_eq!(h.remote.call_count(RemoteOp::CreateFile), 0);
    assert_eq!(h.engine.state(), SyncState::Idle);
}

#[tokio::test]
async fn test_missing_root_folder_is_created() {
    let remote = Arc::new(MemoryRemote::new());
    let read_only = remote.add_folder(DEFAULT_ROOT_FOLDER, None);
    remote.set_can_add_children(&read_only, false);
    let store = Arc::new(RecordStore::in_memory());
    let engine = SyncEngine::new(
        Arc::clone(&remote),
        Arc::clone(&store),
        Arc::new(StubExtractor::default()),
        Arc::new(sync_core::NoopIndexer),
        SyncConfig::default(),
    );

    engine.sync().await.unwrap();

    let root = store.setting(ROOT_FOLDER_KEY).await.unwrap();
    assert_ne!(root, read_only);
    assert_eq!(remote.find_by_name(DEFAULT_ROOT_FOLDER).len(), 2);
    assert_eq!(remote.call_count(RemoteOp::CreateFolder), 1);
}

#[tokio::test]
async fn test_permission_denied_delete_drops_local_record() {
    let h = Harness::new();
    let id = h.remote.add_file("shared.md", &h.root, "text/markdown", "x");
    h.sync().await;
    h.remote.deny_delete(&id);

    h.vault.delete("shared.md").await.unwrap();
    h.sync().await;

    assert!(h.store.get("shared.md").await.is_none());
    assert!(h.remote.entry(&id).is_some());
}

#[tokio::test]
async fn test_transient_delete_failure_keeps_tombstone() {
    let h = Harness::new();
    let id = h.remote.add_file("a.md", &h.root, "text/markdown", "x");
    h.sync().await;
    h.remote
        .fail_on(RemoteOp::Delete, &id, RemoteError::Timeout(Duration::from_secs(30)));

    h.vault.delete("a.md").await.unwrap();
    h.sync().await;

    let tombstone = h.store.get("a.md").await.unwrap();
    assert!(tombstone.deleted && tombstone.dirty);
    assert!(h
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, SyncEvent::RecordFailed { path, .. } if path == "a.md")));

    h.sync().await;
    assert!(h.store.get("a.md").await.is_none());
    assert!(h.remote.entry(&id).is_none());
}

#[tokio::test]
async fn test_folder_delete_pushes_and_clears_subtree() {
    let h = Harness::new();
    let a = h.remote.add_folder("a", Some(&h.root));
    h.remote.add_file("x.md", &a, "text/markdown", "x");
    let y = h.remote.add_folder("y", Some(&a));
    h.remote.add_file("z.md", &y, "text/markdown", "z");
    h.sync().await;

    h.vault.delete("a").await.unwrap();
    let tombstones = h.store.list_by_prefix("a", sync_core::Visibility::All).await;
    assert_eq!(tombstones.len(), 4);
    assert!(tombstones.iter().all(|r| r.deleted && r.dirty));

    h.sync().await;

    assert!(h.store.is_empty().await);
    assert!(h.remote.entry(&a).is_none());
    assert_eq!(h.remote.call_count(RemoteOp::Delete), 4);
}

#[tokio::test]
async fn test_malformed_change_page_keeps_token() {
    let h = Harness::new();
    h.sync().await;
    let token = h.store.setting(CHANGE_TOKEN_KEY).await;

    h.remote.omit_page_tokens();
    h.remote.add_file("new.md", &h.root, "text/markdown", "n");
    h.sync().await;

    assert!(h.store.get("new.md").await.is_some());
    assert_eq!(h.store.setting(CHANGE_TOKEN_KEY).await, token);
}

#[tokio::test]
async fn test_change_page_cap_resumes_next_pass() {
    let config = SyncConfig {
        max_change_pages: 2,
        ..SyncConfig::default()
    };
    let h = Harness::build(config, StubExtractor::default());
    h.sync().await;
    h.remote.set_page_size(1);
    for name in ["1.md", "2.md", "3.md"] {
        h.remote.add_file(name, &h.root, "text/markdown", name);
    }

    h.sync().await;
    assert!(h.store.get("2.md").await.is_some());
    assert!(h.store.get("3.md").await.is_none());
    assert_eq!(h.remote.call_count(RemoteOp::ListChanges), 2);

    h.sync().await;
    assert!(h.store.get("3.md").await.is_some());
}

#[tokio::test]
async fn test_remote_move_relocates_record() {
    let h = Harness::new();
    let misc = h.remote.add_folder("misc", Some(&h.root));
    let note = h.remote.add_file("a.md", &h.root, "text/markdown", "a");
    h.sync().await;

    h.remote.move_entry(&note, &misc);
    h.sync().await;

    assert!(h.store.get("a.md").await.is_none());
    let moved = h.store.get("misc/a.md").await.unwrap();
    assert_eq!(moved.remote_id, Some(note));
    assert_eq!(moved.text(), Some("a"));
    h.wait_for_index(IndexCall::Rename("a.md".into(), "misc/a.md".into()))
        .await;
}

#[tokio::test]
async fn test_remote_folder_rename_moves_descendants() {
    let h = Harness::new();
    let misc = h.remote.add_folder("misc", Some(&h.root));
    let deep = h.remote.add_folder("deep", Some(&misc));
    h.remote.add_file("a.md", &deep, "text/markdown", "a");
    h.sync().await;

    h.remote.rename_entry(&misc, "archive");
    h.sync().await;

    assert!(h.store.get("misc").await.is_none());
    assert!(h.store.get("misc/deep/a.md").await.is_none());
    assert_eq!(
        h.store.get("archive/deep").await.unwrap().remote_id,
        Some(deep)
    );
    assert_eq!(
        h.store.get("archive/deep/a.md").await.unwrap().text(),
        Some("a")
    );
}

#[tokio::test]
async fn test_remote_swap_rename_rebinds_both_records() {
    let h = Harness::new();
    let one = h.remote.add_file("a.md", &h.root, "text/markdown", "one");
    let two = h.remote.add_file("b.md", &h.root, "text/markdown", "two");
    h.sync().await;

    h.remote.rename_entry(&one, "tmp.md");
    h.remote.rename_entry(&two, "a.md");
    h.remote.rename_entry(&one, "b.md");
    h.sync().await;
    h.sync().await;

    let a = h.store.get("a.md").await.unwrap();
    assert_eq!(a.remote_id.as_deref(), Some(two.as_str()));
    assert_eq!(a.text(), Some("two"));
    let b = h.store.get("b.md").await.unwrap();
    assert_eq!(b.remote_id.as_deref(), Some(one.as_str()));
    assert_eq!(b.text(), Some("one"));

    assert_eq!(h.store.list_by_prefix("", sync_core::Visibility::All).await.len(), 2);
    assert!(h.store.dirty_records().await.is_empty());
    assert_eq!(h.remote.entry(&one).unwrap().name, "b.md");
    assert_eq!(h.remote.entry(&two).unwrap().name, "a.md");
}

#[tokio::test]
async fn test_remote_move_onto_edited_record_keeps_the_edit() {
    let h = Harness::new();
    let one = h.remote.add_file("a.md", &h.root, "text/markdown", "one");
    let two = h.remote.add_file("b.md", &h.root, "text/markdown", "two");
    h.sync().await;

    h.vault.update_file("b.md", "edited").await.unwrap();
    // `one` comes first in the feed and lands on the edited record's path.
    h.remote.rename_entry(&one, "b.md");
    h.remote.rename_entry(&two, "c.md");
    h.sync().await;

    let b = h.store.get("b.md").await.unwrap();
    assert_eq!(b.remote_id.as_deref(), Some(one.as_str()));
    assert_eq!(b.text(), Some("one"));
    let c = h.store.get("c.md").await.unwrap();
    assert_eq!(c.remote_id.as_deref(), Some(two.as_str()));
    assert_eq!(c.text(), Some("edited"));
    assert!(!c.dirty);
    assert_eq!(h.remote.content(&two), Some(Content::Text("edited".into())));
    assert_eq!(h.remote.entry(&two).unwrap().name, "c.md");
    assert_eq!(h.store.list_by_prefix("", sync_core::Visibility::All).await.len(), 2);
}

#[tokio::test]
async fn test_remote_move_onto_unsynced_record_keeps_both() {
    let h = Harness::new();
    let one = h.remote.add_file("a.md", &h.root, "text/markdown", "one");
    h.sync().await;

    h.vault.save_file("b.md", "draft", None, None).await.unwrap();
    h.remote.rename_entry(&one, "b.md");
    h.sync().await;

    let b = h.store.get("b.md").await.unwrap();
    assert_eq!(b.remote_id.as_deref(), Some(one.as_str()));
    assert_eq!(b.text(), Some("one"));
    let draft = h.store.get("b (local).md").await.unwrap();
    assert_eq!(draft.text(), Some("draft"));
    assert!(!draft.dirty);
    let uploaded = h.remote.lookup(&h.root, "b (local).md").unwrap();
    assert_eq!(draft.remote_id, Some(uploaded.id));
}

#[tokio::test]
async fn test_local_rename_moves_remote_object() {
    let h = Harness::new();
    h.remote.add_folder("misc", Some(&h.root));
    let note = h.remote.add_file("a.md", &h.root, "text/markdown", "a");
    h.sync().await;

    h.vault.rename("a.md", "misc/b.md").await.unwrap();
    h.sync().await;

    let moved = h.remote.lookup(&h.root, "misc/b.md").unwrap();
    assert_eq!(moved.id, note);
    assert_eq!(moved.parent_ids.len(), 1);
    assert!(!h.store.get("misc/b.md").await.unwrap().dirty);
}

#[tokio::test]
async fn test_tags_travel_in_meta_property() {
    let h = Harness::new();
    let tags: Tags = ["project".to_string()].into();
    h.vault
        .save_file("tagged.md", "x", Some(tags.clone()), None)
        .await
        .unwrap();
    let incoming = h.remote.add_file("incoming.md", &h.root, "text/markdown", "y");
    let meta = SyncMeta {
        tags: ["inbox".to_string()].into(),
        ..SyncMeta::default()
    };
    h.remote.set_properties(&incoming, meta.to_properties());

    h.sync().await;

    let uploaded = h.remote.lookup(&h.root, "tagged.md").unwrap();
    let remote_meta = SyncMeta::from_properties(&uploaded.properties)
        .unwrap()
        .unwrap();
    assert_eq!(remote_meta.tags, tags);
    assert!(h.store.get("incoming.md").await.unwrap().tags.contains("inbox"));
}

#[tokio::test]
async fn test_tags_already_on_the_drive_are_read() {
    let h = Harness::new();
    let id = h.remote.add_file("old.md", &h.root, "text/markdown", "x");
    h.remote.set_properties(
        &id,
        Properties::from([(
            "meechi_meta".to_string(),
            r#"{"tags":["legacy"],"metadata":{"source":"web"}}"#.to_string(),
        )]),
    );

    h.sync().await;

    let record = h.store.get("old.md").await.unwrap();
    assert!(record.tags.contains("legacy"));
    assert_eq!(record.metadata.get("source"), Some(&serde_json::json!("web")));

    h.vault
        .update_metadata(
            "old.md",
            sync_core::MetadataPatch {
                tags: Some(["legacy".to_string(), "kept".to_string()].into()),
                metadata: None,
            },
        )
        .await
        .unwrap();
    h.sync().await;

    let properties = h.remote.entry(&id).unwrap().properties;
    assert_eq!(properties.len(), 1);
    let meta: serde_json::Value = serde_json::from_str(&properties["meechi_meta"]).unwrap();
    assert_eq!(meta["tags"], serde_json::json!(["kept", "legacy"]));
    assert_eq!(meta["metadata"]["source"], "web");
}

#[tokio::test]
async fn test_unreadable_meta_keeps_local_tags() {
    let h = Harness::new();
    let id = h.remote.add_file("a.md", &h.root, "text/markdown", "v1");
    h.sync().await;
    h.vault
        .update_metadata(
            "a.md",
            sync_core::MetadataPatch {
                tags: Some(["keep".to_string()].into()),
                metadata: None,
            },
        )
        .await
        .unwrap();
    h.sync().await;

    h.remote.set_properties(
        &id,
        Properties::from([(META_PROPERTY.to_string(), "{not json".to_string())]),
    );
    h.remote.edit_content(&id, "v2");
    h.remote.set_modified(&id, in_an_hour());
    h.sync().await;

    let record = h.store.get("a.md").await.unwrap();
    assert_eq!(record.text(), Some("v2"));
    assert!(record.tags.contains("keep"));
}

#[tokio::test]
async fn test_pass_reports_finish_event() {
    let h = Harness::new();
    h.sync().await;

    let events = h.events.lock().unwrap();
    assert!(matches!(
        events.last(),
        Some(SyncEvent::PassFinished { success: true, .. })
    ));
}
