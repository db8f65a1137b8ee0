//! PDF text extraction through poppler's `pdftotext`.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use sync_core::shadow::{ExtractError, TextExtractor};
use tokio::process::Command;
use tracing::debug;

pub struct PdfToTextExtractor {
    program: PathBuf,
}

impl Default for PdfToTextExtractor {
    fn default() -> Self {
        Self::new("pdftotext")
    }
}

impl PdfToTextExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl TextExtractor for PdfToTextExtractor {
    async fn extract_text(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let dir = tempfile::tempdir().map_err(|e| ExtractError::Io(e.to_string()))?;
        let input = dir.path().join("input.pdf");
        tokio::fs::write(&input, bytes)
            .await
            .map_err(|e| ExtractError::Io(e.to_string()))?;

        let output = Command::new(&self.program)
            .arg("-layout")
            .arg("-nopgbrk")
            .arg(&input)
            .arg("-")
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => ExtractError::Unavailable(format!(
                    "{} is not installed",
                    self.program.display()
                )),
                _ => ExtractError::Io(e.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Failed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        debug!("Extracted {} chars from {} byte PDF", text.len(), bytes.len());
        Ok(text)
    }
}
