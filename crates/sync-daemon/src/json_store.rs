//! On-disk store backend.
//!
//! The whole snapshot lives in one JSON file (`store.json` in the data
//! directory). Every persist writes a temp file next to it and renames it
//! into place, so a crash leaves either the old or the new snapshot.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use sync_core::store::{Result, Snapshot, StoreBackend, StoreError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const STORE_FILE: &str = "store.json";

pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backend for `store.json` inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(STORE_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix = hex::encode(rand::random::<[u8; 8]>());
        self.path.with_file_name(format!(".{name}.{suffix}.tmp"))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Persistence(format!("{action} {}: {e}", path.display()))
}

#[async_trait]
impl StoreBackend for JsonFileBackend {
    async fn load(&self) -> Result<Snapshot> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No store at {}, starting empty", self.path.display());
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(io_error("reading", &self.path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Persistence(format!("decoding {}: {e}", self.path.display()))
        })
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StoreError::Persistence(format!("encoding snapshot: {e}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("creating", parent, e))?;
        }

        let temp = self.temp_path();
        let written = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&encoded).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error("writing", &temp, e));
        }

        if let Err(e) = fs::rename(&temp, &self.path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(io_error("replacing", &self.path, e));
        }
        debug!(
            "Persisted {} records to {}",
            snapshot.records.len(),
            self.path.display()
        );
        Ok(())
    }
}
