//! Overlapping text splitter.
//!
//! Partitions normalized document text into bounded-size segments with a
//! fixed overlap, preferring paragraph (`\n\n`), newline, then space break
//! points so chunks stay locally coherent. Byte offsets are always snapped
//! to UTF-8 char boundaries.
//!
//! Chunk indices are assigned once here, sequential and gapless from 0,
//! and are never reordered downstream.

use crate::models::{Chunk, DocumentMeta};

/// Split text into segments of at most `max_chars` bytes, each overlapping
/// the previous by roughly `overlap` bytes.
///
/// Guarantees:
/// - Empty or whitespace-only input yields no segments.
/// - Every segment is trimmed and non-empty.
/// - Splitting is deterministic for identical input.
pub fn split_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let body = text.trim();
    if body.is_empty() {
        return Vec::new();
    }
    if body.len() <= max_chars {
        return vec![body.to_string()];
    }

    let mut pieces = Vec::new();
    let mut start = 0usize;

    while start < body.len() {
        if body.len() - start <= max_chars {
            let tail = body[start..].trim();
            if !tail.is_empty() {
                pieces.push(tail.to_string());
            }
            break;
        }

        let hard_end = snap_to_char_boundary(body, start + max_chars);
        let mut end = find_break(body, start, hard_end);
        if end <= start {
            // Pathologically small max_chars against a multibyte char:
            // advance by one char so the loop always makes progress.
            end = next_char_boundary(body, start + 1);
        }

        let piece = body[start..end].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }

        let mut next = snap_to_char_boundary(body, end.saturating_sub(overlap));
        if next <= start {
            next = end;
        }
        start = next;
    }

    pieces
}

/// Split a document and attach sequential chunk indices carrying the
/// document's metadata.
pub fn chunk_document(
    meta: &DocumentMeta,
    text: &str,
    max_chars: usize,
    overlap: usize,
) -> Vec<Chunk> {
    split_text(text, max_chars, overlap)
        .into_iter()
        .enumerate()
        .map(|(idx, piece)| Chunk {
            source_id: meta.source_id.clone(),
            chunk_index: idx as i64,
            text: piece,
            meta: meta.clone(),
        })
        .collect()
}

/// Pick a natural break point in `body[start..limit]`: the last paragraph
/// break, else the last newline, else the last space, provided it falls in
/// the back half of the window. Otherwise split hard at `limit`.
fn find_break(body: &str, start: usize, limit: usize) -> usize {
    let window = &body[start..limit];
    let floor = window.len() / 2;

    for pattern in ["\n\n", "\n", " "] {
        if let Some(pos) = window.rfind(pattern) {
            if pos > floor {
                return start + pos;
            }
        }
    }
    limit
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Snap a byte index forward to the nearest valid UTF-8 char boundary.
fn next_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
