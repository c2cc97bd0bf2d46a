
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::loader::Document;
use crate::{RagError, Result};

/// Unit in which chunk size and overlap are measured
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkUnit {
    #[default]
    Characters,
    /// A word together with the whitespace that follows it
    Words,
    /// A sentence together with the whitespace that follows it
    Sentences,
}

/// Configuration for content chunking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub unit: ChunkUnit,
    /// Window width, in `unit`s
    pub chunk_size: usize,
    /// Units shared between adjacent chunks, must be smaller than `chunk_size`
    pub chunk_overlap: usize,
    /// How far (in `unit`s) a chunk end may move back to reach a paragraph or
    /// sentence break. Ignored for `ChunkUnit::Sentences`.
    pub boundary_tolerance: usize,
}

impl Default for ChunkingConfig {
    #[inline]
    fn default() -> Self {
        Self {
            unit: ChunkUnit::Characters,
            chunk_size: 1000,
            chunk_overlap: 200,
            boundary_tolerance: 100,
        }
    }
}

impl ChunkingConfig {
    #[inline]
    pub fn new(unit: ChunkUnit, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            unit,
            chunk_size,
            chunk_overlap,
            boundary_tolerance: chunk_size / 10,
        }
    }

    #[inline]
    pub fn with_boundary_tolerance(mut self, tolerance: usize) -> Self {
        self.boundary_tolerance = tolerance;
        self
    }
}

/// Half-open byte range into the parent document's text
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CharSpan {
    pub start: usize,
    pub end: usize,
}

impl CharSpan {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A segment of one document, the unit of retrieval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ordinal: usize,
    pub text: String,
    pub char_span: CharSpan,
}

impl Chunk {
    /// Whether the chunk carries any retrievable content
    #[inline]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Deterministic chunk id derived from its position in the parent document
#[inline]
pub fn chunk_id(document_id: &str, ordinal: usize, span: CharSpan) -> String {
    let name = format!("{}:{}:{}-{}", document_id, ordinal, span.start, span.end);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
}

/// Split a document into overlapping chunks.
///
/// Chunks are exact slices of the document text; nothing is trimmed, so
/// [`stitch`] reproduces the original text.
#[inline]
pub fn chunk_document(document: &Document, config: &ChunkingConfig) -> Result<Vec<Chunk>> {
    let spans = chunk_spans(&document.raw_text, config)?;

    let chunks: Vec<Chunk> = spans
        .into_iter()
        .enumerate()
        .map(|(ordinal, span)| Chunk {
            id: chunk_id(&document.id, ordinal, span),
            document_id: document.id.clone(),
            ordinal,
            text: slice(&document.raw_text, span).to_string(),
            char_span: span,
        })
        .collect();

    debug!(
        "Chunked document {} ({}) into {} chunks",
        document.id,
        document.source_uri,
        chunks.len()
    );

    Ok(chunks)
}

/// Compute chunk spans over `text` with a sliding window of `chunk_size` units
/// advancing by `chunk_size - chunk_overlap`.
#[inline]
pub fn chunk_spans(text: &str, config: &ChunkingConfig) -> Result<Vec<CharSpan>> {
    if config.chunk_size == 0 {
        return Err(RagError::Validation(
            "chunk size must be greater than 0".to_string(),
        ));
    }
    if config.chunk_overlap >= config.chunk_size {
        return Err(RagError::Validation(format!(
            "chunk overlap ({}) must be smaller than chunk size ({})",
            config.chunk_overlap, config.chunk_size
        )));
    }

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let bounds = unit_boundaries(text, config.unit);
    let unit_count = bounds.len() - 1;
    let snap = config.unit != ChunkUnit::Sentences && config.boundary_tolerance > 0;

    let mut spans = Vec::new();
    let mut start = 0;

    loop {
        let target = (start + config.chunk_size).min(unit_count);
        let mut end = target;

        if snap && target < unit_count {
            // Never snap to or before the point the next chunk would start from
            let floor = (start + config.chunk_overlap + 1)
                .max(target.saturating_sub(config.boundary_tolerance));
            if let Some(snapped) = find_break(text, &bounds, floor, target) {
                end = snapped;
            }
        }

        spans.push(CharSpan {
            start: bounds[start],
            end: bounds[end],
        });

        if end == unit_count {
            break;
        }

        start = end - config.chunk_overlap;
    }

    Ok(spans)
}

/// Rebuild the document text from its chunks by dropping each chunk's overlap
/// with the one before it.
#[inline]
pub fn stitch(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|chunk| chunk.ordinal);

    let mut text = String::new();
    let mut covered: usize = 0;

    for chunk in ordered {
        let skip = covered.saturating_sub(chunk.char_span.start);
        if let Some(rest) = chunk.text.get(skip..) {
            text.push_str(rest);
        }
        covered = covered.max(chunk.char_span.end);
    }

    text
}

#[expect(
    clippy::string_slice,
    reason = "spans always fall on char boundaries computed from char_indices"
)]
fn slice(text: &str, span: CharSpan) -> &str {
    &text[span.start..span.end]
}

/// Byte offsets at which each unit starts, followed by `text.len()`.
/// Consecutive offsets partition the text with no gaps.
fn unit_boundaries(text: &str, unit: ChunkUnit) -> Vec<usize> {
    let mut bounds = vec![0];

    match unit {
        ChunkUnit::Characters => {
            bounds.extend(text.char_indices().skip(1).map(|(i, _)| i));
        }
        ChunkUnit::Words => {
            bounds.extend(
                text.char_indices()
                    .filter(|&(i, _)| i > 0 && is_word_start(text, i))
                    .map(|(i, _)| i),
            );
        }
        ChunkUnit::Sentences => {
            bounds.extend(
                text.char_indices()
                    .filter(|&(i, _)| {
                        i > 0 && is_word_start(text, i) && break_rank(text, i) > 0
                    })
                    .map(|(i, _)| i),
            );
        }
    }

    bounds.push(text.len());
    bounds
}

/// A non-whitespace character preceded by whitespace
fn is_word_start(text: &str, index: usize) -> bool {
    let current = text.get(index..).and_then(|rest| rest.chars().next());
    let previous = text.get(..index).and_then(|head| head.chars().next_back());

    matches!(
        (previous, current),
        (Some(p), Some(c)) if p.is_whitespace() && !c.is_whitespace()
    )
}

/// Strength of the natural break right before `index`: 2 for a paragraph
/// break, 1 for a sentence end, 0 otherwise.
fn break_rank(text: &str, index: usize) -> u8 {
    let Some(head) = text.get(..index) else {
        return 0;
    };

    let trimmed = head.trim_end();
    let gap = head.len() - trimmed.len();
    if gap == 0 || trimmed.is_empty() {
        return 0;
    }

    let newlines = head
        .chars()
        .rev()
        .take_while(|c| c.is_whitespace())
        .filter(|&c| c == '\n')
        .count();
    if newlines >= 2 {
        return 2;
    }

    match trimmed.chars().next_back() {
        Some('.' | '!' | '?') => 1,
        _ => 0,
    }
}

/// Nearest unit boundary in `floor..=target` that sits on a paragraph break,
/// else on a sentence end.
fn find_break(text: &str, bounds: &[usize], floor: usize, target: usize) -> Option<usize> {
    if floor > target {
        return None;
    }

    for rank in [2, 1] {
        let found = (floor..=target).rev().find(|&unit| {
            let offset = bounds[unit];
            is_word_start(text, offset) && break_rank(text, offset) >= rank
        });
        if found.is_some() {
            return found;
        }
    }

    None
}
