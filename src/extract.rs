//! Plain-text extraction for corpus documents.
//!
//! PDFs go through `pdf-extract`, Word documents are read from
//! `word/document.xml` inside the OOXML zip, everything else is treated as
//! UTF-8 text (lossily). Paragraph breaks are preserved as blank lines so the
//! chunker can align chunks to them.
//!
//! Extraction never panics the build: [`extract_file`] runs the parser on a
//! blocking thread and turns both errors and panics into an
//! [`ExtractError`]. [`extract_document`] wraps that as
//! [`EngineError::DocumentUnreadable`], which the builder records as a skip
//! reason.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

use crate::error::EngineError;
use crate::models::{DocKind, DocumentFile};

/// Maximum decompressed bytes read from a single zip entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("extractor crashed: {0}")]
    Crashed(String),
    #[error("no selectable text")]
    NoText,
}

/// Read and extract a file on a blocking thread.
///
/// Returns [`ExtractError::NoText`] when the document parses but contains no
/// visible characters (e.g. an image-only PDF).
pub async fn extract_file(path: &Path, kind: DocKind) -> Result<String, ExtractError> {
    let path = path.to_path_buf();
    let joined = tokio::task::spawn_blocking(move || -> Result<String, ExtractError> {
        let bytes = std::fs::read(&path)?;
        extract_bytes(&bytes, kind)
    })
    .await;

    let text = match joined {
        Ok(result) => result?,
        Err(e) => return Err(ExtractError::Crashed(e.to_string())),
    };
    if text.trim().is_empty() {
        return Err(ExtractError::NoText);
    }
    Ok(text)
}

/// [`extract_file`] for a corpus document; failures become
/// [`EngineError::DocumentUnreadable`] keyed by the document.
pub async fn extract_document(doc: &DocumentFile) -> Result<String, EngineError> {
    extract_file(&doc.path, doc.kind)
        .await
        .map_err(|e| EngineError::DocumentUnreadable {
            path: doc.key.clone(),
            reason: e.to_string(),
        })
}

/// Extract text from in-memory bytes.
pub fn extract_bytes(bytes: &[u8], kind: DocKind) -> Result<String, ExtractError> {
    match kind {
        DocKind::Pdf => extract_pdf(bytes),
        DocKind::Docx => extract_docx(bytes),
        DocKind::Text => Ok(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    // Page breaks come through as form feeds; make them paragraph breaks.
    Ok(text.replace('\u{c}', "\n\n"))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Docx(format!("word/document.xml: {}", e)))?;
    let mut xml = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut xml)?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_paragraphs(&xml)
}

/// Concatenate `<w:t>` runs, emitting a blank line at every `</w:p>`.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push_str("\n\n"),
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"tab" => out.push(' '),
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
