//! Sync engine settings.

use std::time::Duration;

/// Name of the remote folder the vault mirrors.
pub const DEFAULT_ROOT_FOLDER: &str = "Meechi-Core";

/// Folders a freshly reset vault starts with.
pub const DEFAULT_FOLDERS: [&str; 2] = ["misc", "history"];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Remote root folder name, looked up at the drive's top level.
    pub root_folder_name: String,
    /// Upper bound on change-feed pages read in one incremental pull.
    pub max_change_pages: usize,
    /// Deadline for each individual remote call.
    pub remote_timeout: Duration,
    /// Folders recreated by a factory reset.
    pub default_folders: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_folder_name: DEFAULT_ROOT_FOLDER.to_string(),
            max_change_pages: 100,
            remote_timeout: Duration::from_secs(30),
            default_folders: DEFAULT_FOLDERS.iter().map(|f| f.to_string()).collect(),
        }
    }
}
