//! Event infrastructure for sync-core.
//!
//! `SyncEvent` carries progress and per-record outcomes of a sync pass;
//! `EventBus` fans them out to subscribers (a status line, the CLI log, tests).

use crate::record::now_millis;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// What a pull did with a remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PullAction {
    /// Remote content or metadata was adopted.
    Adopted,
    /// The local record won; only its location may have changed.
    KeptLocal,
    /// The entry could not be materialized.
    Skipped,
}

/// What a push did with a dirty record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PushOperation {
    Created,
    Updated,
    Deleted,
}

/// Events emitted during a sync pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Human-readable status line.
    Progress {
        message: String,
        /// Milliseconds since Unix epoch.
        timestamp: i64,
    },
    /// A remote entry was reconciled into the store.
    EntryPulled {
        path: String,
        #[serde(rename = "remoteId")]
        remote_id: String,
        action: PullAction,
        timestamp: i64,
    },
    /// A local record was removed because its remote counterpart is gone.
    LocalRemoved { path: String, timestamp: i64 },
    /// A dirty record reached the remote.
    RecordPushed {
        path: String,
        operation: PushOperation,
        timestamp: i64,
    },
    /// Pushing a record failed; it stays dirty.
    RecordFailed {
        path: String,
        error: String,
        timestamp: i64,
    },
    /// The pass ended.
    PassFinished { success: bool, timestamp: i64 },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock during unwinding.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot the list so callbacks may subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Emit a `Progress` event stamped with the current time.
    pub fn progress(&self, message: impl Into<String>) {
        self.emit(SyncEvent::Progress {
            message: message.into(),
            timestamp: now_millis(),
        });
    }
}
