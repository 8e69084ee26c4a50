//! Passage assembly for extraction prompts.
//!
//! Retrieved chunks are grouped per source document, wrapped in a
//! provenance header and explicit text fences, and greedily packed into
//! passages bounded by a character budget. The fences give the extraction
//! model an unambiguous boundary between document text and instructions.

use crate::models::{Chunk, NOT_SPECIFIED};

const TEXT_START: &str = "--- TEXT START ---";
const TEXT_END: &str = "--- TEXT END ---";

/// Pack sorted chunks into prompt passages of at most `max_chars` each.
///
/// Input must already be ordered by `(source_id, chunk_index)` — the
/// retrieval layer guarantees this. Consecutive chunks of one source form
/// a single fenced block; blocks are packed greedily, and a block that
/// alone exceeds the budget is split across passages with its header
/// repeated.
pub fn build_passages(chunks: &[Chunk], max_chars: usize) -> Vec<String> {
    let blocks = source_blocks(chunks, max_chars);

    let mut passages = Vec::new();
    let mut current = String::new();
    for block in blocks {
        let needed = if current.is_empty() {
            block.len()
        } else {
            current.len() + 2 + block.len()
        };
        if !current.is_empty() && needed > max_chars {
            passages.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&block);
    }
    if !current.is_empty() {
        passages.push(current);
    }
    passages
}

/// One fenced block per source document, split if the block alone would
/// blow the passage budget.
fn source_blocks(chunks: &[Chunk], max_chars: usize) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < chunks.len() {
        let source_id = &chunks[i].source_id;
        let mut j = i;
        while j < chunks.len() && chunks[j].source_id == *source_id {
            j += 1;
        }
        let group = &chunks[i..j];
        let header = header_for(&group[0]);

        // Budget for text inside the fences, leaving room for the frame.
        let frame = header.len() + TEXT_START.len() + TEXT_END.len() + 3;
        let text_budget = max_chars.saturating_sub(frame).max(1);

        let mut text = String::new();
        for chunk in group {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&chunk.text);
        }

        for piece in split_by_chars(&text, text_budget) {
            blocks.push(format!(
                "{header}{TEXT_START}\n{piece}\n{TEXT_END}"
            ));
        }
        i = j;
    }
    blocks
}

fn header_for(chunk: &Chunk) -> String {
    let meta = &chunk.meta;
    format!(
        "Company: {}\nForm Type: {}\nFiling Date: {}\nAccession Number: {}\n",
        meta.field("company").unwrap_or(NOT_SPECIFIED),
        meta.field("form_type").unwrap_or(NOT_SPECIFIED),
        meta.timestamp,
        chunk.source_id,
    )
}

fn split_by_chars(text: &str, budget: usize) -> Vec<String> {
    if text.len() <= budget {
        return vec![text.to_string()];
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + budget).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + 1;
            while end < text.len() && !text.is_char_boundary(end) {
                end += 1;
            }
        }
        pieces.push(text[start..end].to_string());
        start = end;
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMeta;
    use std::collections::BTreeMap;

    fn chunk(source_id: &str, index: i64, text: &str) -> Chunk {
        let mut fields = BTreeMap::new();
        fields.insert("company".to_string(), "Praxis Precision".to_string());
        fields.insert("form_type".to_string(), "10-Q".to_string());
        Chunk {
            source_id: source_id.to_string(),
            chunk_index: index,
            text: text.to_string(),
            meta: DocumentMeta {
                source_id: source_id.to_string(),
                timestamp: "2025-03-01".to_string(),
                fields,
            },
        }
    }

    #[test]
    fn test_block_carries_header_and_fences() {
        let passages = build_passages(&[chunk("ACC-1", 0, "trial enrollment update")], 9000);
        assert_eq!(passages.len(), 1);
        let p = &passages[0];
        assert!(p.contains("Company: Praxis Precision"));
        assert!(p.contains("Form Type: 10-Q"));
        assert!(p.contains("Filing Date: 2025-03-01"));
        assert!(p.contains("Accession Number: ACC-1"));
        assert!(p.contains("--- TEXT START ---\ntrial enrollment update\n--- TEXT END ---"));
    }

    #[test]
    fn test_consecutive_chunks_of_one_source_share_a_block() {
        let passages = build_passages(
            &[chunk("ACC-1", 0, "first part"), chunk("ACC-1", 1, "second part")],
            9000,
        );
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].matches(TEXT_START).count(), 1);
        assert!(passages[0].contains("first part\nsecond part"));
    }

    #[test]
    fn test_sources_split_across_passages_when_budget_exceeded() {
        let chunks = vec![
            chunk("ACC-1", 0, &"a".repeat(300)),
            chunk("ACC-2", 0, &"b".repeat(300)),
        ];
        let passages = build_passages(&chunks, 450);
        assert_eq!(passages.len(), 2);
        assert!(passages[0].contains("ACC-1"));
        assert!(passages[1].contains("ACC-2"));
        assert!(passages.iter().all(|p| p.len() <= 450));
    }

    #[test]
    fn test_oversized_source_is_hard_split_with_repeated_header() {
        let chunks = vec![chunk("ACC-1", 0, &"x".repeat(700))];
        let passages = build_passages(&chunks, 400);
        assert!(passages.len() >= 2);
        for p in &passages {
            assert!(p.len() <= 400);
            assert!(p.contains("Accession Number: ACC-1"));
            assert!(p.contains(TEXT_START));
            assert!(p.contains(TEXT_END));
        }
    }

    #[test]
    fn test_missing_metadata_falls_back_to_sentinel() {
        let c = Chunk {
            source_id: "ACC-9".to_string(),
            chunk_index: 0,
            text: "body".to_string(),
            meta: DocumentMeta {
                source_id: "ACC-9".to_string(),
                timestamp: "2025-01-01".to_string(),
                fields: BTreeMap::new(),
            },
        };
        let passages = build_passages(&[c], 9000);
        assert!(passages[0].contains("Company: not specified"));
        assert!(passages[0].contains("Form Type: not specified"));
    }

    #[test]
    fn test_empty_input_yields_no_passages() {
        assert!(build_passages(&[], 9000).is_empty());
    }
}
