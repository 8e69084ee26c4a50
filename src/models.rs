//! Core data models used throughout trialscope.
//!
//! These types represent the documents, chunks, and extracted event records
//! that flow through the ingestion and retrieval pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sentinel written into every [`EventRecord`] field the extraction service
/// could not populate. This is a first-class value, not a missing-value
/// marker: it must survive deduplication and serialization verbatim.
pub const NOT_SPECIFIED: &str = "not specified";

fn not_specified() -> String {
    NOT_SPECIFIED.to_string()
}

/// Metadata attached to a source document and inherited by its chunks.
///
/// `source_id` is the opaque key identifying the originating document
/// (an SEC accession number, or ticker+date for a press release).
/// `timestamp` is the filing or publication date as supplied by the
/// document source. Everything else (company, form_type, ticker, ...)
/// rides in the free-form `fields` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub source_id: String,
    pub timestamp: String,
    #[serde(flatten, default)]
    pub fields: BTreeMap<String, String>,
}

impl DocumentMeta {
    /// Look up a free-form metadata field.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Raw item supplied by a document source (filing fetcher, press-release
/// scraper) before normalization and splitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub text: String,
    pub meta: DocumentMeta,
}

/// A bounded slice of a source document's normalized text.
///
/// `(source_id, chunk_index)` uniquely identifies a chunk within an
/// entity's index; `chunk_index` is sequential and gapless per source and
/// reflects original document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub source_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub meta: DocumentMeta,
}

/// A structured clinical-trial catalyst event extracted by the LLM.
///
/// Every field is a `String` defaulting to [`NOT_SPECIFIED`]: the
/// extraction contract forbids nulls and omissions, so a missing key in
/// the service response deserializes to the sentinel rather than failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default = "not_specified")]
    pub company: String,
    #[serde(default = "not_specified")]
    pub accession_number: String,
    #[serde(default = "not_specified")]
    pub drug: String,
    #[serde(default = "not_specified")]
    pub program: String,
    #[serde(default = "not_specified")]
    pub phase: String,
    #[serde(default = "not_specified")]
    pub study: String,
    #[serde(default = "not_specified")]
    pub size: String,
    #[serde(default = "not_specified")]
    pub status_announce: String,
    #[serde(default = "not_specified")]
    pub time_period_expected: String,
    #[serde(default = "not_specified")]
    pub explanation: String,
    #[serde(default = "not_specified")]
    pub primary_endpoint_result: String,
    #[serde(default = "not_specified")]
    pub adverse_events_summary: String,
    #[serde(default = "not_specified")]
    pub regulatory_milestone: String,
    #[serde(default = "not_specified")]
    pub secondary_endpoint_notes: String,
    #[serde(default = "not_specified")]
    pub trial_design: String,
    #[serde(default = "not_specified")]
    pub biomarkers_used: String,
    #[serde(default = "not_specified")]
    pub comparator_used: String,
    #[serde(default = "not_specified")]
    pub geography: String,
    #[serde(default = "not_specified")]
    pub submission_type: String,
    #[serde(default = "not_specified")]
    pub regulatory_track: String,
    #[serde(default = "not_specified")]
    pub milestone_trigger: String,
    #[serde(default = "not_specified")]
    pub clinical_benefit_summary: String,
    #[serde(default = "not_specified")]
    pub readout_type: String,
    #[serde(default = "not_specified")]
    pub trial_status: String,
}

impl Default for EventRecord {
    /// Every field carries the sentinel until the extractor fills it.
    fn default() -> Self {
        Self {
            company: not_specified(),
            accession_number: not_specified(),
            drug: not_specified(),
            program: not_specified(),
            phase: not_specified(),
            study: not_specified(),
            size: not_specified(),
            status_announce: not_specified(),
            time_period_expected: not_specified(),
            explanation: not_specified(),
            primary_endpoint_result: not_specified(),
            adverse_events_summary: not_specified(),
            regulatory_milestone: not_specified(),
            secondary_endpoint_notes: not_specified(),
            trial_design: not_specified(),
            biomarkers_used: not_specified(),
            comparator_used: not_specified(),
            geography: not_specified(),
            submission_type: not_specified(),
            regulatory_track: not_specified(),
            milestone_trigger: not_specified(),
            clinical_benefit_summary: not_specified(),
            readout_type: not_specified(),
            trial_status: not_specified(),
        }
    }
}

/// Response contract of the optional validation pass.
///
/// When `is_accurate` is false the validator supplies a full corrected
/// batch in `corrected_events`; the corrected batch replaces the original
/// wholesale, never merged field-by-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFeedback {
    pub is_accurate: bool,
    #[serde(default)]
    pub corrected_events: Option<Vec<EventRecord>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_record_defaults_to_sentinel() {
        let event = EventRecord::default();
        assert_eq!(event.company, NOT_SPECIFIED);
        assert_eq!(event.drug, NOT_SPECIFIED);
        assert_eq!(event.trial_status, NOT_SPECIFIED);
    }

    #[test]
    fn test_event_record_missing_keys_fill_sentinel() {
        let event: EventRecord =
            serde_json::from_str(r#"{"drug": "ulixacaltamide", "phase": "Phase 2a"}"#).unwrap();
        assert_eq!(event.drug, "ulixacaltamide");
        assert_eq!(event.phase, "Phase 2a");
        assert_eq!(event.study, NOT_SPECIFIED);
        assert_eq!(event.geography, NOT_SPECIFIED);
    }

    #[test]
    fn test_sentinel_roundtrips_through_serialization() {
        let event = EventRecord::default();
        let json = serde_json::to_string(&event).unwrap();
        let back: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(json.contains("not specified"));
    }

    #[test]
    fn test_document_meta_flattens_free_form_fields() {
        let meta: DocumentMeta = serde_json::from_str(
            r#"{"source_id": "0001689548-23-000044", "timestamp": "2023-05-09",
                "ticker": "PRAX", "form_type": "10-Q"}"#,
        )
        .unwrap();
        assert_eq!(meta.source_id, "0001689548-23-000044");
        assert_eq!(meta.field("ticker"), Some("PRAX"));
        assert_eq!(meta.field("missing"), None);
    }
}
