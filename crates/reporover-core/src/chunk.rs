//! Sliding-window documentation chunker.
//!
//! Documentation files are split into overlapping windows so a passage that
//! straddles a boundary is still retrievable from either side.
//!
//! # Algorithm
//!
//! 1. Take a window of at most `max_chars` bytes from the current start,
//!    snapped to a UTF-8 character boundary.
//! 2. Prefer to end the window at a paragraph break (`\n\n`), then a line
//!    break, then a space, as long as the break falls in the second half of
//!    the window. Otherwise split hard at the window end.
//! 3. Start the next window `overlap_chars` before the previous end, moved
//!    forward to the start of the next word. Every window starts strictly
//!    after the previous one, so the loop always terminates.
//!
//! Chunk offsets are byte offsets into the original text. Since entity ids of
//! doc chunks are keyed by `path#offset`, re-chunking unchanged text yields
//! the same ids.
//!
//! # Example
//!
//! ```rust
//! use reporover_core::chunk::{chunk_text, ChunkPolicy};
//!
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", &ChunkPolicy::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].offset, 0);
//! ```

use serde::{Deserialize, Serialize};

/// Window size and overlap, both in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPolicy {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap_chars: 100,
        }
    }
}

/// One window of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Contiguous index starting at 0.
    pub index: usize,
    /// Byte offset of `text` within the source document.
    pub offset: usize,
    pub text: String,
}

/// Split `text` into overlapping chunks.
///
/// Returns an empty vector for empty or whitespace-only input. Chunk text
/// never starts or ends with whitespace and is never longer than
/// `policy.max_chars` bytes.
pub fn chunk_text(text: &str, policy: &ChunkPolicy) -> Vec<TextChunk> {
    let max = policy.max_chars.max(1);
    let overlap = policy.overlap_chars.min(max / 2);
    let len = text.len();

    let mut chunks = Vec::new();
    let mut start = skip_whitespace(text, 0);

    while start < len {
        let hard_end = snap_to_char_boundary(text, (start + max).min(len));
        let end = if hard_end >= len {
            len
        } else {
            find_break(text, start, hard_end, max)
        };
        let end = if end <= start {
            next_char_boundary(text, start)
        } else {
            end
        };

        let piece = text[start..end].trim_end();
        if !piece.is_empty() {
            chunks.push(TextChunk {
                index: chunks.len(),
                offset: start,
                text: piece.to_string(),
            });
        }

        if end >= len {
            break;
        }

        let mut next = snap_to_char_boundary(text, end.saturating_sub(overlap));
        if next <= start {
            next = end;
        } else if overlap > 0 {
            next = align_to_word(text, next, end);
        }
        start = skip_whitespace(text, next);
    }

    chunks
}

/// Choose where a window ending at `hard_end` should actually end.
fn find_break(text: &str, start: usize, hard_end: usize, max: usize) -> usize {
    let window = &text[start..hard_end];
    let min = max / 2;

    if let Some(pos) = window.rfind("\n\n").filter(|&p| p >= min) {
        return start + pos + 2;
    }
    if let Some(pos) = window.rfind('\n').filter(|&p| p >= min) {
        return start + pos + 1;
    }
    if let Some(pos) = window.rfind(' ').filter(|&p| p >= min) {
        return start + pos + 1;
    }
    hard_end
}

/// Move `pos` forward to the next whitespace if it sits inside a word.
fn align_to_word(text: &str, pos: usize, limit: usize) -> usize {
    let prev_is_space = text[..pos]
        .chars()
        .next_back()
        .map_or(true, char::is_whitespace);
    if prev_is_space {
        return pos;
    }
    text[pos..limit]
        .find(char::is_whitespace)
        .map(|i| pos + i)
        .unwrap_or(pos)
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    text[from..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

fn next_char_boundary(text: &str, pos: usize) -> usize {
    text[pos..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| pos + i)
        .unwrap_or(text.len())
}

/// Snap a byte index down to the nearest UTF-8 character boundary.
fn snap_to_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
