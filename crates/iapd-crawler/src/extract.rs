use anyhow::{Context, Result};
use std::path::Path;

/// **Text Extraction Seam**
///
/// The classifier consumes brochure text through this interface only; how
/// the bytes become a string is a collaborator concern. Production uses
/// [`PdfTextExtractor`]; fixtures and pre-extracted corpora use
/// [`PlainTextExtractor`].
pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, path: &Path) -> Result<String>;
}

/// Extracts text from PDF bodies.
pub struct PdfTextExtractor;

impl TextExtractor for PdfTextExtractor {
    fn extract_text(&self, path: &Path) -> Result<String> {
        pdf_extract::extract_text(path)
            .with_context(|| format!("failed to extract text from {}", path.display()))
    }
}

/// Reads the file as UTF-8, replacing invalid sequences. Useful for text
/// fixtures and corpora that were extracted ahead of time.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract_text(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
