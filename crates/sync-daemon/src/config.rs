//! Daemon configuration from the environment.
//!
//! | Variable             | Meaning                                    |
//! |----------------------|--------------------------------------------|
//! | `DRIVE_ACCESS_TOKEN` | OAuth bearer token (needed to sync)        |
//! | `SYNC_DATA_DIR`      | Where `store.json` lives (`~` is expanded) |
//! | `DRIVE_API_BASE`     | Drive API base URL                         |
//! | `DRIVE_UPLOAD_BASE`  | Drive upload base URL                      |

use crate::drive::{DEFAULT_API_BASE, DEFAULT_TIMEOUT, DEFAULT_UPLOAD_BASE, DriveConfig};
use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};

pub const ACCESS_TOKEN_VAR: &str = "DRIVE_ACCESS_TOKEN";
pub const DATA_DIR_VAR: &str = "SYNC_DATA_DIR";
pub const API_BASE_VAR: &str = "DRIVE_API_BASE";
pub const UPLOAD_BASE_VAR: &str = "DRIVE_UPLOAD_BASE";

const APP_DIR: &str = "sync-daemon";

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub access_token: Option<String>,
    pub api_base: String,
    pub upload_base: String,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = match get(DATA_DIR_VAR) {
            Some(dir) => expand_tilde(&dir),
            None => default_data_dir()?,
        };

        Ok(Self {
            data_dir,
            access_token: get(ACCESS_TOKEN_VAR),
            api_base: get(API_BASE_VAR).unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            upload_base: get(UPLOAD_BASE_VAR).unwrap_or_else(|| DEFAULT_UPLOAD_BASE.to_string()),
        })
    }

    /// Use `dir` instead of the configured data directory.
    pub fn with_data_dir(mut self, dir: &Path) -> Self {
        self.data_dir = expand_tilde(&dir.to_string_lossy());
        self
    }

    /// Settings for the Drive client. Fails without an access token.
    pub fn drive(&self) -> Result<DriveConfig> {
        let Some(token) = &self.access_token else {
            bail!("{ACCESS_TOKEN_VAR} is not set; it is needed to talk to Google Drive");
        };
        Ok(DriveConfig {
            access_token: token.clone(),
            api_base: self.api_base.clone(),
            upload_base: self.upload_base.clone(),
            timeout: DEFAULT_TIMEOUT,
        })
    }
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .context("could not determine a data directory; set SYNC_DATA_DIR")
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some("") => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        Some(rest) if rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => home.join(&rest[1..]),
            None => PathBuf::from(path),
        },
        _ => PathBuf::from(path),
    }
}
