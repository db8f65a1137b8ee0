//! sync-core: local-first file store with two-way sync to a cloud drive.
//!
//! This crate provides:
//! - A path-keyed record store with transactional writes (`store`)
//! - The vault API applications edit files through (`vault`)
//! - The `RemoteProvider` abstraction and an in-memory drive (`remote`,
//!   `memory_remote`)
//! - The sync engine that pulls remote changes and pushes local ones
//!   (`sync_engine`, with the passes in `pull` and `push`)
//! - Text extraction and search-index hooks (`shadow`, `indexer`)

pub mod config;
pub mod events;
pub mod indexer;
pub mod memory_remote;
pub mod path;
mod pull;
mod push;
pub mod record;
pub mod remote;
pub mod shadow;
pub mod store;
pub mod sync_engine;
pub mod vault;

pub use config::SyncConfig;
pub use events::{EventBus, PullAction, PushOperation, Subscription, SyncEvent};
pub use indexer::{IndexError, Indexer, NoopIndexer};
pub use memory_remote::{MemoryRemote, RemoteOp};
pub use path::PathError;
pub use record::{Content, FileRecord, Metadata, RecordKind, Tags};
pub use remote::{RemoteEntry, RemoteError, RemoteProvider};
pub use shadow::{ExtractError, TextExtractor};
pub use store::{MemoryBackend, RecordStore, Snapshot, StoreBackend, StoreError, Visibility};
pub use sync_engine::{SyncEngine, SyncError, SyncOutcome, SyncState};
pub use vault::{MetadataPatch, Vault, VaultError};
