//! Window expansion of retrieval hits.
//!
//! A single retrieved chunk truncates context at an arbitrary boundary;
//! expanding each hit into its contiguous neighborhood within the same
//! source document trades extra token volume for coherence. The window is
//! caller-controlled and the output ordering is deterministic so prompt
//! construction is reproducible across runs.

use std::collections::BTreeMap;

use crate::models::Chunk;

/// Expand top-k `hits` into ±`window` neighborhoods drawn from `corpus`
/// (all chunks currently in the entity's index).
///
/// Neighbor indices that fall outside a document are skipped, never
/// synthesized. Chunks pulled in by more than one hit appear once. The
/// result is sorted ascending by `(source_id, chunk_index)`.
pub fn expand_windows(hits: &[Chunk], corpus: &[Chunk], window: usize) -> Vec<Chunk> {
    // source_id -> chunk_index -> chunk, ordered on both levels
    let mut by_source: BTreeMap<&str, BTreeMap<i64, &Chunk>> = BTreeMap::new();
    for chunk in corpus {
        by_source
            .entry(chunk.source_id.as_str())
            .or_default()
            .insert(chunk.chunk_index, chunk);
    }

    let window = window as i64;
    let mut expanded: BTreeMap<(&str, i64), &Chunk> = BTreeMap::new();

    for hit in hits {
        let Some(doc_chunks) = by_source.get(hit.source_id.as_str()) else {
            continue;
        };
        for offset in -window..=window {
            let neighbor_index = hit.chunk_index + offset;
            if let Some(neighbor) = doc_chunks.get(&neighbor_index) {
                expanded.insert((neighbor.source_id.as_str(), neighbor_index), neighbor);
            }
        }
    }

    expanded.into_values().cloned().collect()
}
