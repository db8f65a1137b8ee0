//! SyncEngine: reconciles the record store with a remote drive.
//!
//! One pass works as follows:
//!
//! 1. Resolve the remote root folder (cached id, else look it up, else create it)
//! 2. Pull: a full listing on first sync, the change feed afterwards
//!    (see `pull.rs`). A failed pull does not stop the pass.
//! 3. Push every dirty record, shallowest first (see `push.rs`)
//!
//! Only one pass runs at a time. A `sync()` call that finds a pass in
//! flight returns [`SyncOutcome::AlreadyRunning`] immediately.

use crate::config::SyncConfig;
use crate::events::{EventBus, SyncEvent};
use crate::indexer::{IndexNotifier, Indexer};
use crate::record::now_millis;
use crate::remote::{self, Query, RemoteError, RemoteProvider};
use crate::shadow::{ExtractError, TextExtractor};
use crate::store::{ROOT_FOLDER_KEY, RecordStore, StoreBackend, StoreError};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync root unavailable: {0}")]
    RootUnavailable(#[source] RemoteError),

    #[error("Remote rejected credentials: {0}")]
    Unauthorized(String),

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Unauthorized(message) => SyncError::Unauthorized(message),
            other => SyncError::Remote(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    Idle = 0,
    Pulling = 1,
    Pushing = 2,
}

impl SyncState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncState::Pulling,
            2 => SyncState::Pushing,
            _ => SyncState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The pass ran. `pull_failed` means only local changes were pushed.
    Completed { pull_failed: bool },
    /// Another pass was in flight; nothing was done.
    AlreadyRunning,
}

/// Holds the engine out of `Idle` for the lifetime of a pass.
struct PassGuard<'a> {
    state: &'a AtomicU8,
}

impl<'a> PassGuard<'a> {
    fn acquire(state: &'a AtomicU8) -> Option<Self> {
        state
            .compare_exchange(
                SyncState::Idle as u8,
                SyncState::Pulling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| Self { state })
    }

    fn enter(&self, next: SyncState) {
        self.state.store(next as u8, Ordering::Release);
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.state.store(SyncState::Idle as u8, Ordering::Release);
    }
}

pub struct SyncEngine<R: RemoteProvider, B: StoreBackend> {
    pub(crate) remote: R,
    pub(crate) store: Arc<RecordStore<B>>,
    pub(crate) extractor: Arc<dyn TextExtractor>,
    pub(crate) index: IndexNotifier,
    pub(crate) events: Arc<EventBus>,
    pub(crate) config: SyncConfig,
    state: AtomicU8,
}

impl<R: RemoteProvider, B: StoreBackend> SyncEngine<R, B> {
    pub fn new(
        remote: R,
        store: Arc<RecordStore<B>>,
        extractor: Arc<dyn TextExtractor>,
        indexer: Arc<dyn Indexer>,
        config: SyncConfig,
    ) -> Self {
        Self {
            remote,
            store,
            extractor,
            index: IndexNotifier::new(indexer),
            events: Arc::new(EventBus::new()),
            config,
            state: AtomicU8::new(SyncState::Idle as u8),
        }
    }

    /// Progress and per-record events of every pass.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<RecordStore<B>> {
        &self.store
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run one pass: pull, then push.
    ///
    /// Errors only when the root folder cannot be resolved or the remote
    /// rejects our credentials; everything else is logged and reported
    /// through [`events`](Self::events).
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let Some(guard) = PassGuard::acquire(&self.state) else {
            info!("Sync already in progress, skipping");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        self.events.progress("Starting sync...");
        let result = self.run_pass(&guard).await;
        match &result {
            Ok(outcome) => info!("Sync pass finished: {:?}", outcome),
            Err(e) => error!("Sync pass failed: {}", e),
        }
        self.events.emit(SyncEvent::PassFinished {
            success: result.is_ok(),
            timestamp: now_millis(),
        });
        result
    }

    async fn run_pass(&self, guard: &PassGuard<'_>) -> Result<SyncOutcome> {
        let root_id = self.root_folder_id().await?;

        let pull_failed = match self.sync_down(&root_id).await {
            Ok(()) => false,
            Err(e @ SyncError::Unauthorized(_)) => return Err(e),
            Err(e) => {
                warn!("Pull failed, pushing local changes only: {}", e);
                self.events.progress("Pull failed. Pushing local changes only...");
                true
            }
        };

        guard.enter(SyncState::Pushing);
        self.sync_up(&root_id).await?;

        self.events.progress("Sync complete");
        Ok(SyncOutcome::Completed { pull_failed })
    }

    /// Remote id of the root folder, resolving and caching it on first use.
    pub(crate) async fn root_folder_id(&self) -> Result<String> {
        if let Some(id) = self.store.setting(ROOT_FOLDER_KEY).await {
            return Ok(id);
        }

        self.events.progress("Locating sync folder...");
        let id = self.locate_root().await.map_err(|e| match e {
            RemoteError::Unauthorized(message) => SyncError::Unauthorized(message),
            other => SyncError::RootUnavailable(other),
        })?;
        self.store.set_setting(ROOT_FOLDER_KEY, &id).await?;
        Ok(id)
    }

    async fn locate_root(&self) -> remote::Result<String> {
        let name = &self.config.root_folder_name;
        let candidates = self
            .call(self.remote.list_files(&Query::FolderNamed {
                name: name.clone(),
                parent_id: None,
            }))
            .await?;

        if let Some(folder) = candidates.iter().find(|e| e.can_add_children) {
            info!("Found root folder {} ({})", name, folder.id);
            return Ok(folder.id.clone());
        }
        if !candidates.is_empty() {
            warn!(
                "Found {} folders named {} but none is writable; creating a new one",
                candidates.len(),
                name
            );
        }

        let created = self.call(self.remote.create_folder(name, None)).await?;
        info!("Created root folder {} ({})", name, created.id);
        Ok(created.id)
    }

    /// Await a remote call under the configured deadline.
    pub(crate) async fn call<T>(
        &self,
        request: impl Future<Output = remote::Result<T>>,
    ) -> remote::Result<T> {
        let limit = self.config.remote_timeout;
        tokio::time::timeout(limit, request)
            .await
            .unwrap_or(Err(RemoteError::Timeout(limit)))
    }
}

impl<R, B> SyncEngine<R, B>
where
    R: RemoteProvider + 'static,
    B: StoreBackend + 'static,
{
    /// Run a pass on a detached task. The pass completes even if the
    /// returned handle is dropped.
    pub fn spawn_sync(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<SyncOutcome>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.sync().await })
    }
}
