//! sync-daemon library: the native pieces behind the CLI.
//!
//! Exposed as a library so integration tests can reach them.

pub mod config;
pub mod drive;
pub mod json_store;
pub mod pdf;

pub use config::DaemonConfig;
pub use drive::{DriveClient, DriveConfig};
pub use json_store::JsonFileBackend;
pub use pdf::PdfToTextExtractor;
