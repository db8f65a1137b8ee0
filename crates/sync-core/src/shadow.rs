//! Remote entry classification and source shadow documents.
//!
//! Binaries the vault can read (PDFs) get a companion "source" document at
//! `<path>.source.md` holding their extracted text. The naming rule and the
//! MIME/suffix rules that decide how a remote entry is materialized live here.

use crate::remote::RemoteEntry;
use async_trait::async_trait;
use thiserror::Error;

/// Suffix appended to a binary's path to name its source document.
pub const SOURCE_SUFFIX: &str = ".source.md";

pub const PDF_MIME: &str = "application/pdf";
const OCTET_STREAM: &str = "application/octet-stream";

pub fn is_source_path(path: &str) -> bool {
    path.ends_with(SOURCE_SUFFIX)
}

pub fn source_path_for(binary_path: &str) -> String {
    format!("{binary_path}{SOURCE_SUFFIX}")
}

/// Body of a source document for the binary named `name`.
pub fn source_document(name: &str, text: &str) -> String {
    format!("## Source: {name}\n\n{text}")
}

/// How a remote entry is materialized locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Folder,
    /// Downloaded as text.
    Text,
    /// Downloaded as bytes, with a source document extracted from it.
    Shadowed,
    /// Downloaded as bytes only.
    Opaque,
}

impl EntryClass {
    pub fn of(entry: &RemoteEntry) -> Self {
        if entry.is_container() {
            return EntryClass::Folder;
        }
        match entry.mime_type.as_str() {
            PDF_MIME => EntryClass::Shadowed,
            "application/json" | "application/javascript" => EntryClass::Text,
            mime if mime.starts_with("text/") => EntryClass::Text,
            "" | OCTET_STREAM => Self::by_suffix(&entry.name),
            _ => EntryClass::Opaque,
        }
    }

    /// Fallback when the remote reports no useful MIME type.
    fn by_suffix(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".pdf") {
            EntryClass::Shadowed
        } else if [".md", ".txt", ".json"].iter().any(|ext| lower.ends_with(ext)) {
            EntryClass::Text
        } else {
            EntryClass::Opaque
        }
    }
}

/// MIME type to upload a file named `name` with.
pub fn mime_for_name(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".md") {
        "text/markdown"
    } else if lower.ends_with(".txt") {
        "text/plain"
    } else if lower.ends_with(".json") {
        "application/json"
    } else if lower.ends_with(".pdf") {
        PDF_MIME
    } else {
        OCTET_STREAM
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Extractor unavailable: {0}")]
    Unavailable(String),

    #[error("Extraction failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Turns binary documents into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, bytes: &[u8]) -> Result<String, ExtractError>;
}
