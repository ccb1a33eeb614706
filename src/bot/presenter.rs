//! Incremental delivery of a streamed answer.
//!
//! Edits are throttled so the transport sees roughly one update per
//! paragraph of generation instead of one per token. The terminal answer
//! is always pushed, split over multiple messages when it exceeds the
//! configured limit.

use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::bot::telegram::{MessageHandle, OutputFormat, Transport, TransportError};

/// Minimum growth (chars) between intermediate edits.
const EDIT_THRESHOLD: usize = 100;

/// Hard cap on any single displayed chunk (transport message-size ceiling).
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Horizontal-rule style delimiter line: `---`, `***` or `___`.
static HR_DELIMITER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:-{3,}|\*{3,}|_{3,})[ \t]*$").unwrap());

/// Whether a partial answer has grown enough to be worth an edit.
/// The terminal update is always pushed.
fn should_push(prev_len: usize, new_len: usize, is_final: bool) -> bool {
    is_final || prev_len.abs_diff(new_len) >= EDIT_THRESHOLD
}

/// Char-safe prefix of at most `max_chars` characters.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Split an oversized answer into deliverable chunks, preferring semantic
/// boundaries: delimiter lines, then blank-line paragraphs, then lines,
/// hard-cutting only when a single line exceeds the limit. The sequence is
/// finite and single-use.
pub fn split_message(text: &str, limit: usize) -> impl Iterator<Item = String> {
    split_top(text, limit).into_iter()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn split_top(text: &str, limit: usize) -> Vec<String> {
    if char_len(text) <= limit {
        return vec![text.to_string()];
    }
    if HR_DELIMITER.is_match(text) {
        let parts: Vec<String> = HR_DELIMITER
            .split(text)
            .map(|p| p.trim_matches('\n'))
            .filter(|p| !p.is_empty())
            .flat_map(|p| split_paragraphs(p, limit))
            .collect();
        return pack(parts, "\n\n", limit);
    }
    split_paragraphs(text, limit)
}

fn split_paragraphs(text: &str, limit: usize) -> Vec<String> {
    if char_len(text) <= limit {
        return vec![text.to_string()];
    }
    let parts: Vec<String> = text
        .split("\n\n")
        .flat_map(|p| split_lines(p, limit))
        .collect();
    pack(parts, "\n\n", limit)
}

fn split_lines(text: &str, limit: usize) -> Vec<String> {
    if char_len(text) <= limit {
        return vec![text.to_string()];
    }
    let parts: Vec<String> = text.split('\n').flat_map(|l| hard_cut(l, limit)).collect();
    pack(parts, "\n", limit)
}

fn hard_cut(text: &str, limit: usize) -> Vec<String> {
    if char_len(text) <= limit {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(limit)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Greedily accumulate pieces (each already within the limit) into chunks,
/// re-joining with `sep` while the limit allows.
fn pack(pieces: Vec<String>, sep: &str, limit: usize) -> Vec<String> {
    let sep_len = char_len(sep);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if current.is_empty() {
            current = piece;
        } else if char_len(&current) + sep_len + char_len(&piece) <= limit {
            current.push_str(sep);
            current.push_str(&piece);
        } else {
            chunks.push(std::mem::take(&mut current));
            current = piece;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Single-use presenter for one generation: edits a placeholder message as
/// the answer grows, then delivers the final answer.
pub struct StreamPresenter {
    transport: Arc<dyn Transport>,
    placeholder: MessageHandle,
    format: OutputFormat,
    chunk_limit: usize,
    prev_pushed_len: usize,
}

impl StreamPresenter {
    pub fn new(
        transport: Arc<dyn Transport>,
        placeholder: MessageHandle,
        format: OutputFormat,
        chunk_limit: usize,
    ) -> Self {
        Self {
            transport,
            placeholder,
            format,
            chunk_limit: chunk_limit.min(MAX_MESSAGE_LEN),
            prev_pushed_len: 0,
        }
    }

    /// Maybe push a partial answer. Transport failures are swallowed; the
    /// next pushed update carries the fuller text anyway.
    pub async fn push_partial(&mut self, answer: &str) {
        let display = truncate_chars(answer, MAX_MESSAGE_LEN);
        let len = char_len(&display);
        if !should_push(self.prev_pushed_len, len, false) {
            return;
        }

        match self
            .transport
            .edit(self.placeholder, &display, self.format)
            .await
        {
            Ok(()) | Err(TransportError::NotModified) => {
                self.prev_pushed_len = len;
            }
            Err(e) => {
                debug!("Partial edit failed, retrying on next push: {e}");
            }
        }
    }

    /// Push the final answer, chunking when oversized. The first chunk
    /// edits the placeholder; `NotModified` counts as success and any
    /// other failure falls back to unformatted delivery.
    pub async fn finish(&mut self, answer: &str) -> Result<(), TransportError> {
        let mut chunks = split_message(answer, self.chunk_limit);
        let first = chunks.next().unwrap_or_default();

        match self
            .transport
            .edit(self.placeholder, &first, self.format)
            .await
        {
            Ok(()) | Err(TransportError::NotModified) => {}
            Err(e) => {
                warn!("Formatted delivery failed, falling back to plain text: {e}");
                match self
                    .transport
                    .edit(self.placeholder, &first, OutputFormat::Plain)
                    .await
                {
                    Ok(()) | Err(TransportError::NotModified) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        for chunk in chunks {
            if let Err(e) = self
                .transport
                .deliver(self.placeholder.chat_id, &chunk, self.format)
                .await
            {
                warn!("Formatted delivery failed, falling back to plain text: {e}");
                self.transport
                    .deliver(self.placeholder.chat_id, &chunk, OutputFormat::Plain)
                    .await?;
            }
        }
        Ok(())
    }
}
