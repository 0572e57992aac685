//! Overlapping, boundary-aware text chunker.
//!
//! Splits a document body into [`TextChunk`]s of at most `chunk_size`
//! characters, where each chunk after the first repeats the last `overlap`
//! characters of its predecessor. Lengths are counted in Unicode scalar
//! values, never bytes, so multi-byte text is never cut mid-character.
//!
//! # Algorithm
//!
//! 1. If the remaining text fits in `chunk_size`, emit it and stop.
//! 2. Otherwise look for a cut point inside the window
//!    `[start + overlap + 1, start + chunk_size]`, preferring the end of a
//!    paragraph break (`\n\n`), then a line break, then any whitespace.
//! 3. With no boundary in the window, hard-cut at `start + chunk_size`.
//! 4. The next chunk starts `overlap` characters before the cut.
//!
//! The lower bound `overlap + 1` is the smallest cut that still moves the
//! next chunk's start forward.
//!
//! Chunks are never trimmed, which makes the split lossless:
//!
//! ```rust
//! use kbstore_core::chunk::{chunk_text, reassemble};
//!
//! let text = "alpha beta gamma delta epsilon zeta eta theta";
//! let chunks = chunk_text(text, 16, 4).unwrap();
//! assert!(chunks.len() > 1);
//! assert_eq!(reassemble(&chunks, 4), text);
//! ```

use crate::error::{KbError, Result};

/// A slice of a larger text, addressed by character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    /// Inclusive start, in characters.
    pub start_char: usize,
    /// Exclusive end, in characters.
    pub end_char: usize,
}

impl TextChunk {
    pub fn char_len(&self) -> usize {
        self.end_char - self.start_char
    }
}

/// Split `text` into overlapping chunks.
///
/// Always returns at least one chunk; for empty input that chunk is empty.
///
/// # Errors
///
/// `Validation` when `chunk_size` is zero or `overlap >= chunk_size`.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<TextChunk>> {
    validate_params(chunk_size, overlap)?;

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let min_advance = overlap + 1;

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        if total - start <= chunk_size {
            chunks.push(make_chunk(&chars, chunks.len(), start, total));
            break;
        }

        let window_end = start + chunk_size;
        let end = find_boundary(&chars, start + min_advance, window_end).unwrap_or(window_end);
        chunks.push(make_chunk(&chars, chunks.len(), start, end));
        start = end - overlap;
    }

    Ok(chunks)
}

/// Check chunking parameters without splitting anything.
pub fn validate_params(chunk_size: usize, overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(KbError::validation("chunk_size must be > 0"));
    }
    if overlap >= chunk_size {
        return Err(KbError::validation(format!(
            "overlap ({}) must be smaller than chunk_size ({})",
            overlap, chunk_size
        )));
    }
    Ok(())
}

/// Rebuild the original text from chunks produced with the same `overlap`.
pub fn reassemble(chunks: &[TextChunk], overlap: usize) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            out.push_str(&chunk.text);
        } else {
            out.extend(chunk.text.chars().skip(overlap));
        }
    }
    out
}

/// Latest cut position in `[lo, hi]` that sits right after a boundary,
/// trying paragraph, line, then word boundaries in that order.
fn find_boundary(chars: &[char], lo: usize, hi: usize) -> Option<usize> {
    let paragraph = |p: usize| p >= 2 && chars[p - 2] == '\n' && chars[p - 1] == '\n';
    let line = |p: usize| p >= 1 && chars[p - 1] == '\n';
    let word = |p: usize| p >= 1 && chars[p - 1].is_whitespace();

    let rules: [&dyn Fn(usize) -> bool; 3] = [&paragraph, &line, &word];
    rules
        .iter()
        .find_map(|is_cut| (lo..=hi).rev().find(|&p| is_cut(p)))
}

fn make_chunk(chars: &[char], index: usize, start: usize, end: usize) -> TextChunk {
    TextChunk {
        index,
        text: chars[start..end].iter().collect(),
        start_char: start,
        end_char: end,
    }
}
