
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::crawler::extractor::extract_page;
use crate::{RagError, Result};

/// File formats the loader can turn into text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Pdf,
    Text,
    Markdown,
    Html,
}

impl FileFormat {
    #[inline]
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" | "text" => Some(Self::Text),
            "md" | "markdown" => Some(Self::Markdown),
            "html" | "htm" => Some(Self::Html),
            _ => None,
        }
    }
}

/// Text extracted from one file, with page start offsets for paged formats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileText {
    pub text: String,
    pub page_starts: Vec<usize>,
}

/// Read a supported file into text
#[inline]
pub fn read_file(path: &Path) -> Result<FileText> {
    let format = FileFormat::from_path(path)
        .ok_or_else(|| RagError::UnsupportedFormat(path.display().to_string()))?;

    let bytes = fs::read(path).map_err(|e| read_error(path, e))?;
    debug!("Read {} bytes from {} ({:?})", bytes.len(), path.display(), format);

    match format {
        FileFormat::Pdf => read_pdf(path, &bytes),
        FileFormat::Text => Ok(FileText {
            text: decode_utf8(path, bytes)?,
            page_starts: Vec::new(),
        }),
        FileFormat::Markdown => Ok(FileText {
            text: markdown_to_text(&decode_utf8(path, bytes)?),
            page_starts: Vec::new(),
        }),
        FileFormat::Html => {
            let html = decode_utf8(path, bytes)?;
            let page = extract_page(&html).map_err(|e| read_error(path, e))?;
            Ok(FileText {
                text: page.text,
                page_starts: Vec::new(),
            })
        }
    }
}

fn read_pdf(path: &Path, bytes: &[u8]) -> Result<FileText> {
    // pdf-extract panics on some malformed fonts
    let pages = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem_by_pages(bytes))
        .map_err(|_| read_error(path, "PDF parser panicked"))?
        .map_err(|e| read_error(path, e))?;

    let joined = join_pages(&pages);
    debug!("Extracted {} pages from {}", pages.len(), path.display());
    Ok(joined)
}

/// Concatenate page texts, separating pages with a `[page N]` marker.
/// Page starts point at the first byte of each page's text.
#[inline]
pub fn join_pages<S: AsRef<str>>(pages: &[S]) -> FileText {
    let mut text = String::new();
    let mut page_starts = Vec::with_capacity(pages.len());

    for (index, page) in pages.iter().enumerate() {
        if index > 0 {
            text.push_str(&format!("\n\n[page {}]\n\n", index + 1));
        }
        page_starts.push(text.len());
        text.push_str(page.as_ref().trim_end());
    }

    FileText { text, page_starts }
}

/// Render markdown as plain text, keeping paragraph breaks and code verbatim
#[inline]
pub fn markdown_to_text(markdown: &str) -> String {
    let mut text = String::new();

    for event in Parser::new(markdown) {
        match event {
            Event::Text(content) | Event::Code(content) => text.push_str(&content),
            Event::SoftBreak => text.push(' '),
            Event::HardBreak => text.push('\n'),
            Event::Start(Tag::Item) => text.push_str("- "),
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Heading(_)
                | TagEnd::CodeBlock
                | TagEnd::BlockQuote(_)
                | TagEnd::List(_)
                | TagEnd::Table,
            ) => end_block(&mut text),
            Event::End(TagEnd::Item | TagEnd::TableRow | TagEnd::TableHead) => {
                if !text.ends_with('\n') {
                    text.push('\n');
                }
            }
            Event::End(TagEnd::TableCell) => text.push('\t'),
            _ => {}
        }
    }

    text.trim_end().to_string()
}

fn end_block(text: &mut String) {
    while text.ends_with(' ') {
        text.pop();
    }
    if text.is_empty() || text.ends_with("\n\n") {
        return;
    }
    text.push_str(if text.ends_with('\n') { "\n" } else { "\n\n" });
}

fn decode_utf8(path: &Path, bytes: Vec<u8>) -> Result<String> {
    let text = String::from_utf8(bytes).map_err(|_| read_error(path, "not valid UTF-8"))?;
    if let Some(rest) = text.strip_prefix('\u{feff}') {
        return Ok(rest.to_string());
    }
    Ok(text)
}

fn read_error(path: &Path, error: impl std::fmt::Display) -> RagError {
    RagError::Read {
        source_uri: path.display().to_string(),
        message: error.to_string(),
    }
}
