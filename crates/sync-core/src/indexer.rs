//! Search index notifications.
//!
//! The store never waits on the index: every notification is dispatched on a
//! background task and failures are only logged.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Indexing failed: {0}")]
    Failed(String),
}

/// Full-text index kept in step with the store.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, path: &str, text: &str) -> Result<(), IndexError>;

    async fn remove(&self, path: &str) -> Result<(), IndexError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), IndexError>;
}

/// Indexer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndexer;

#[async_trait]
impl Indexer for NoopIndexer {
    async fn index(&self, _path: &str, _text: &str) -> Result<(), IndexError> {
        Ok(())
    }

    async fn remove(&self, _path: &str) -> Result<(), IndexError> {
        Ok(())
    }

    async fn rename(&self, _from: &str, _to: &str) -> Result<(), IndexError> {
        Ok(())
    }
}

enum Notice {
    Index { path: String, text: String },
    Remove { path: String },
    Rename { from: String, to: String },
}

/// Fire-and-forget front for an [`Indexer`].
#[derive(Clone)]
pub struct IndexNotifier {
    indexer: Arc<dyn Indexer>,
}

impl IndexNotifier {
    pub fn new(indexer: Arc<dyn Indexer>) -> Self {
        Self { indexer }
    }

    pub fn index(&self, path: impl Into<String>, text: impl Into<String>) {
        self.dispatch(Notice::Index {
            path: path.into(),
            text: text.into(),
        });
    }

    pub fn remove(&self, path: impl Into<String>) {
        self.dispatch(Notice::Remove { path: path.into() });
    }

    pub fn rename(&self, from: impl Into<String>, to: impl Into<String>) {
        self.dispatch(Notice::Rename {
            from: from.into(),
            to: to.into(),
        });
    }

    fn dispatch(&self, notice: Notice) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, dropping index notification");
            return;
        };
        let indexer = Arc::clone(&self.indexer);
        handle.spawn(async move {
            let (path, result) = match &notice {
                Notice::Index { path, text } => (path, indexer.index(path, text).await),
                Notice::Remove { path } => (path, indexer.remove(path).await),
                Notice::Rename { from, to } => (from, indexer.rename(from, to).await),
            };
            if let Err(e) = result {
                warn!("Index update for {} failed: {}", path, e);
            }
        });
    }
}

impl Default for IndexNotifier {
    fn default() -> Self {
        Self::new(Arc::new(NoopIndexer))
    }
}
