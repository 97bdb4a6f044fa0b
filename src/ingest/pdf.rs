use lopdf::Document;
use tracing::{debug, warn};

use super::IngestError;

/// Extracts the text layer of a PDF, page by page, separated by blank lines.
///
/// Pages whose text cannot be decoded are skipped. A document that yields no
/// text at all is an extraction failure (scanned PDFs have no text layer).
pub fn extract_text(bytes: &[u8]) -> Result<String, IngestError> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| IngestError::Extraction(format!("cannot parse PDF: {e}")))?;

    let pages = doc.get_pages();
    debug!("extracting text from {} PDF pages", pages.len());

    let mut text = String::new();
    for page_num in pages.keys() {
        match doc.extract_text(&[*page_num]) {
            Ok(page) if !page.trim().is_empty() => {
                if !text.is_empty() {
                    text.push_str("\n\n");
                }
                text.push_str(page.trim());
            }
            Ok(_) => {}
            Err(e) => warn!("skipping PDF page {page_num}: {e}"),
        }
    }

    if text.trim().is_empty() {
        return Err(IngestError::Extraction("PDF has no extractable text".into()));
    }
    Ok(text)
}
