/// Ingestion: raw upload bytes to a titled, chunked document.
///
/// Extraction and segmentation only. Persisting the result (document, chunks
/// and the main conversation) is the document store's job.
pub mod chunking;
pub mod pdf;

use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("document too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("extraction failed: {0}")]
    Extraction(String),
}

/// Output of a successful ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedDocument {
    pub title: String,
    /// Chunk contents in sequence order.
    pub chunks: Vec<String>,
}

/// Trait for ingestion implementations.
///
/// Ingestion is CPU-bound; async callers run it on a blocking thread.
pub trait IngestionService: Send + Sync {
    fn ingest(&self, bytes: &[u8], filename: &str) -> Result<IngestedDocument, IngestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Pdf,
    Text,
}

/// Detects the format from magic bytes first, then the file extension.
fn detect_format(bytes: &[u8], filename: &str) -> Result<Format, IngestError> {
    if bytes.starts_with(b"%PDF-") {
        return Ok(Format::Pdf);
    }
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("pdf") => Ok(Format::Pdf),
        Some("txt" | "md" | "markdown" | "text") | None => Ok(Format::Text),
        Some(other) => Err(IngestError::UnsupportedFormat(format!(".{other}"))),
    }
}

fn title_from_filename(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Untitled")
        .to_string()
}

/// Plain text, markdown and PDF ingestion with paragraph-aware chunking.
#[derive(Debug, Clone)]
pub struct TextIngestor {
    pub chunk_size: usize,
    pub max_bytes: usize,
}

impl TextIngestor {
    #[must_use]
    pub fn new(chunk_size: usize, max_bytes: usize) -> Self {
        Self {
            chunk_size,
            max_bytes,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.chunk_size, config.max_document_bytes)
    }
}

impl IngestionService for TextIngestor {
    fn ingest(&self, bytes: &[u8], filename: &str) -> Result<IngestedDocument, IngestError> {
        if bytes.len() > self.max_bytes {
            return Err(IngestError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }

        let text = match detect_format(bytes, filename)? {
            Format::Pdf => pdf::extract_text(bytes)?,
            Format::Text => std::str::from_utf8(bytes)
                .map_err(|_| IngestError::UnsupportedFormat("binary or non-UTF-8 content".into()))?
                .replace("\r\n", "\n"),
        };

        let chunks = chunking::split_into_chunks(&text, self.chunk_size);
        if chunks.is_empty() {
            return Err(IngestError::Extraction("document contains no text".into()));
        }

        let title = title_from_filename(filename);
        info!("Ingested '{}': {} chunks", title, chunks.len());
        Ok(IngestedDocument { title, chunks })
    }
}
