//! Identity-key deduplication of extracted events.
//!
//! Extraction runs the same overlapping passages through the model more
//! than once, so the same real-world event surfaces repeatedly with
//! cosmetic wording differences. Identity is chosen deliberately narrow:
//! the source document plus the drug, study, and phase. Free-text fields
//! like the explanation never participate, so reworded duplicates
//! collapse to one record.

use sha2::{Digest, Sha256};

use crate::models::EventRecord;

/// Stable identity key for an event: hex SHA-256 over the lowercased
/// `accession|drug|study|phase` tuple. Sentinel values participate
/// as-is, so two events that are both unspecified on a component still
/// compare equal on it.
pub fn identity_key(event: &EventRecord) -> String {
    let material = format!(
        "{}|{}|{}|{}",
        event.accession_number, event.drug, event.study, event.phase
    )
    .to_lowercase();
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Collapse events sharing an identity key, keeping the first occurrence
/// in input order. Order of survivors follows the input.
pub fn deduplicate(events: Vec<EventRecord>) -> Vec<EventRecord> {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::with_capacity(events.len());
    for event in events {
        if seen.insert(identity_key(&event)) {
            unique.push(event);
        }
    }
    unique
}
