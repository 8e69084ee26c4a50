//! Catalyst event extraction over retrieved passages.
//!
//! [`Extractor`] and [`Validator`] are the service boundaries between the
//! pipeline and the LLM. [`ExtractionRun`] drives sequential passage
//! batches through extraction, optional validation, and deduplication.
//!
//! The pipeline never lets one bad batch kill a run: a service call is
//! retried exactly once after a fixed backoff and then the batch yields
//! zero events; a response that does not parse into the schema is also
//! zero events. Batches pass through a small state machine —
//! raw-extracted, then validating, then either accepted (possibly with a
//! wholesale-corrected set) or fallback to the unvalidated set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::ExtractionConfig;
use crate::dedup::deduplicate;
use crate::models::{EventRecord, ValidationFeedback};

/// Extracts structured catalyst events from one passage of document text.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, topic: &str, passage: &str) -> Result<Vec<EventRecord>>;
}

/// Reviews an extracted batch against the passage it came from.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(
        &self,
        passage: &str,
        events: &[EventRecord],
    ) -> Result<ValidationFeedback>;
}

pub fn create_extractor(config: &ExtractionConfig) -> Result<Arc<dyn Extractor>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiExtractor::new(config)?)),
        "disabled" => bail!("Extraction provider is disabled"),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

pub fn create_validator(config: &ExtractionConfig) -> Result<Arc<dyn Validator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiValidator::new(config)?)),
        "disabled" => bail!("Extraction provider is disabled"),
        other => bail!("Unknown extraction provider: {}", other),
    }
}

// ============ Pipeline ============

/// Outcome of the per-batch validation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    /// Validator confirmed the batch, or supplied a corrected set.
    Accepted,
    /// Validator failed or returned nothing usable; raw batch kept.
    Fallback,
}

/// Sequential extraction driver: one service call per passage, a minimum
/// cooldown between outbound calls, retry-once-then-skip on failure, and
/// identity-key dedup over everything that survived.
pub struct ExtractionRun {
    extractor: Arc<dyn Extractor>,
    validator: Option<Arc<dyn Validator>>,
    cooldown: Duration,
    retry_backoff: Duration,
}

impl ExtractionRun {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        validator: Option<Arc<dyn Validator>>,
        config: &ExtractionConfig,
    ) -> Self {
        Self {
            extractor,
            validator,
            cooldown: Duration::from_secs(config.cooldown_secs),
            retry_backoff: Duration::from_secs(config.retry_backoff_secs),
        }
    }

    /// Run extraction over the passages in order and return the
    /// deduplicated event set.
    pub async fn run(&self, topic: &str, passages: &[String]) -> Result<Vec<EventRecord>> {
        let mut last_call: Option<Instant> = None;
        let mut collected = Vec::new();

        for (batch, passage) in passages.iter().enumerate() {
            self.respect_cooldown(&mut last_call).await;
            let raw = self
                .extract_with_retry(batch, topic, passage, &mut last_call)
                .await;
            if raw.is_empty() {
                tracing::info!(batch, "no events extracted from passage");
                continue;
            }

            let (events, outcome) = match &self.validator {
                Some(validator) => {
                    self.respect_cooldown(&mut last_call).await;
                    self.validate_batch(validator.as_ref(), batch, passage, raw)
                        .await
                }
                None => (raw, BatchOutcome::Accepted),
            };

            tracing::info!(batch, events = events.len(), ?outcome, "batch finished");
            collected.extend(events);
        }

        let before = collected.len();
        let unique = deduplicate(collected);
        tracing::info!(
            extracted = before,
            unique = unique.len(),
            "extraction run complete"
        );
        Ok(unique)
    }

    async fn respect_cooldown(&self, last_call: &mut Option<Instant>) {
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.cooldown {
                tokio::time::sleep(self.cooldown - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }

    /// One retry after a fixed backoff; a second failure skips the batch.
    /// The retry is itself a service call, so the cooldown baseline moves
    /// to it — the minimum inter-call interval holds across retries.
    async fn extract_with_retry(
        &self,
        batch: usize,
        topic: &str,
        passage: &str,
        last_call: &mut Option<Instant>,
    ) -> Vec<EventRecord> {
        match self.extractor.extract(topic, passage).await {
            Ok(events) => events,
            Err(first) => {
                tracing::warn!(batch, error = %first, "extraction call failed, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                *last_call = Some(Instant::now());
                match self.extractor.extract(topic, passage).await {
                    Ok(events) => events,
                    Err(second) => {
                        tracing::warn!(batch, error = %second, "retry failed, skipping batch");
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Validation accepts the raw batch, replaces it wholesale with a
    /// corrected set, or falls back to the raw batch on any failure.
    async fn validate_batch(
        &self,
        validator: &dyn Validator,
        batch: usize,
        passage: &str,
        raw: Vec<EventRecord>,
    ) -> (Vec<EventRecord>, BatchOutcome) {
        match validator.validate(passage, &raw).await {
            Ok(feedback) => {
                if feedback.is_accurate {
                    return (raw, BatchOutcome::Accepted);
                }
                match feedback.corrected_events {
                    Some(corrected) => {
                        tracing::info!(
                            batch,
                            original = raw.len(),
                            corrected = corrected.len(),
                            "validator replaced batch"
                        );
                        (corrected, BatchOutcome::Accepted)
                    }
                    None => {
                        tracing::warn!(batch, "validator rejected batch without corrections");
                        (raw, BatchOutcome::Fallback)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(batch, error = %e, "validation failed, keeping raw batch");
                (raw, BatchOutcome::Fallback)
            }
        }
    }
}

// ============ OpenAI providers ============

const EXTRACT_SYSTEM_PROMPT: &str = "You are a biotech analyst extracting clinical-trial \
catalyst events from SEC filings and press releases. Respond with a JSON object of the form \
{\"events\": [...]} where each event carries the fields: company, accession_number, drug, \
program, phase, study, size, status_announce, time_period_expected, explanation, \
primary_endpoint_result, adverse_events_summary, regulatory_milestone, \
secondary_endpoint_notes, trial_design, biomarkers_used, comparator_used, geography, \
submission_type, regulatory_track, milestone_trigger, clinical_benefit_summary, \
readout_type, trial_status. Every field must be a string; use \"not specified\" for anything \
the text does not state. Never invent values.";

const VALIDATE_SYSTEM_PROMPT: &str = "You are reviewing catalyst events extracted from the \
document text below. Respond with a JSON object {\"is_accurate\": bool, \
\"corrected_events\": [...] or null}. If any event misstates the text, set is_accurate to \
false and supply the full corrected list; corrections replace the originals entirely.";

/// Event extraction through the OpenAI chat-completions API.
///
/// The call itself is single-shot — retry policy belongs to
/// [`ExtractionRun`], not the client.
pub struct OpenAiExtractor {
    client: ChatClient,
}

impl OpenAiExtractor {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        Ok(Self {
            client: ChatClient::new(config)?,
        })
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(&self, topic: &str, passage: &str) -> Result<Vec<EventRecord>> {
        let user = format!(
            "Topic of interest: {topic}\n\nExtract every catalyst event related to the topic \
             from the documents below.\n\n{passage}"
        );
        let content = self.client.chat(EXTRACT_SYSTEM_PROMPT, &user).await?;
        match parse_events(&content) {
            Some(events) => Ok(events),
            None => {
                tracing::warn!("extraction response did not match the event schema");
                Ok(Vec::new())
            }
        }
    }
}

/// Batch validation through the OpenAI chat-completions API.
pub struct OpenAiValidator {
    client: ChatClient,
}

impl OpenAiValidator {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        Ok(Self {
            client: ChatClient::new(config)?,
        })
    }
}

#[async_trait]
impl Validator for OpenAiValidator {
    async fn validate(
        &self,
        passage: &str,
        events: &[EventRecord],
    ) -> Result<ValidationFeedback> {
        let user = format!(
            "Extracted events:\n{}\n\nSource documents:\n{}",
            serde_json::to_string_pretty(events)?,
            passage
        );
        let content = self.client.chat(VALIDATE_SYSTEM_PROMPT, &user).await?;
        serde_json::from_str(&strip_code_fences(&content))
            .map_err(|e| anyhow::anyhow!("validation response did not parse: {}", e))
    }
}

/// Minimal chat-completions client shared by the extractor and validator.
struct ChatClient {
    model: String,
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl ChatClient {
    fn new(config: &ExtractionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("extraction.model required for OpenAI provider"))?;
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("extraction.api_key required for OpenAI provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            model,
            api_key,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_base);
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("chat API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing message content"))
    }
}

/// Parse an extraction response into events. Accepts either a bare JSON
/// array or an object with an `events` array, with or without markdown
/// code fences. Returns `None` for anything else.
fn parse_events(content: &str) -> Option<Vec<EventRecord>> {
    let cleaned = strip_code_fences(content);
    let value: serde_json::Value = serde_json::from_str(&cleaned).ok()?;
    let items = match &value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(obj) => obj.get("events")?.as_array()?.clone(),
        _ => return None,
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).ok())
        .collect()
}

fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end_matches('`').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn event(accession: &str, drug: &str) -> EventRecord {
        EventRecord {
            accession_number: accession.to_string(),
            drug: drug.to_string(),
            ..EventRecord::default()
        }
    }

    fn fast_config() -> ExtractionConfig {
        ExtractionConfig {
            cooldown_secs: 0,
            retry_backoff_secs: 0,
            ..ExtractionConfig::default()
        }
    }

    /// Scripted extractor: pops one response per call.
    struct ScriptedExtractor {
        responses: Mutex<Vec<Result<Vec<EventRecord>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedExtractor {
        fn new(responses: Vec<Result<Vec<EventRecord>>>) -> Arc<Self> {
            let mut reversed = responses;
            reversed.reverse();
            Arc::new(Self {
                responses: Mutex::new(reversed),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn extract(&self, _topic: &str, _passage: &str) -> Result<Vec<EventRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct FixedValidator {
        feedback: Result<ValidationFeedback>,
    }

    #[async_trait]
    impl Validator for FixedValidator {
        async fn validate(
            &self,
            _passage: &str,
            _events: &[EventRecord],
        ) -> Result<ValidationFeedback> {
            match &self.feedback {
                Ok(f) => Ok(f.clone()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    #[tokio::test]
    async fn test_run_collects_and_dedups_across_passages() {
        let extractor = ScriptedExtractor::new(vec![
            Ok(vec![event("ACC-1", "relutrigine"), event("ACC-2", "relutrigine")]),
            Ok(vec![event("ACC-1", "relutrigine"), event("ACC-3", "ulixacaltamide")]),
        ]);
        let run = ExtractionRun::new(extractor.clone(), None, &fast_config());
        let events = run
            .run("readouts", &["p1".to_string(), "p2".to_string()])
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_retries_once_then_skips() {
        let extractor = ScriptedExtractor::new(vec![
            Err(anyhow::anyhow!("timeout")),
            Err(anyhow::anyhow!("timeout")),
            Ok(vec![event("ACC-2", "relutrigine")]),
        ]);
        let run = ExtractionRun::new(extractor.clone(), None, &fast_config());
        let events = run
            .run("readouts", &["p1".to_string(), "p2".to_string()])
            .await
            .unwrap();
        // Batch one consumed two calls and produced nothing; batch two
        // succeeded on its first call.
        assert_eq!(events, vec![event("ACC-2", "relutrigine")]);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 3);
    }

    /// Records when each service call happens.
    struct TimedExtractor {
        responses: Mutex<Vec<Result<Vec<EventRecord>>>>,
        times: Mutex<Vec<Instant>>,
    }

    impl TimedExtractor {
        fn new(responses: Vec<Result<Vec<EventRecord>>>) -> Arc<Self> {
            let mut reversed = responses;
            reversed.reverse();
            Arc::new(Self {
                responses: Mutex::new(reversed),
                times: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Extractor for TimedExtractor {
        async fn extract(&self, _topic: &str, _passage: &str) -> Result<Vec<EventRecord>> {
            self.times.lock().unwrap().push(Instant::now());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_holds_across_retry() {
        let extractor = TimedExtractor::new(vec![
            Err(anyhow::anyhow!("timeout")),
            Ok(vec![event("ACC-1", "relutrigine")]),
            Ok(vec![event("ACC-2", "relutrigine")]),
        ]);
        let config = ExtractionConfig {
            cooldown_secs: 60,
            retry_backoff_secs: 10,
            ..ExtractionConfig::default()
        };
        let run = ExtractionRun::new(extractor.clone(), None, &config);
        run.run("readouts", &["p1".to_string(), "p2".to_string()])
            .await
            .unwrap();

        // Batch one failed once and succeeded on its retry; the gap to
        // batch two is measured from the retry call, not the first.
        let times = extractor.times.lock().unwrap();
        assert_eq!(times.len(), 3);
        assert!(times[2].duration_since(times[1]) >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_retry() {
        let extractor = ScriptedExtractor::new(vec![
            Err(anyhow::anyhow!("rate limited")),
            Ok(vec![event("ACC-1", "relutrigine")]),
        ]);
        let run = ExtractionRun::new(extractor, None, &fast_config());
        let events = run.run("readouts", &["p1".to_string()]).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_corrected_batch_replaces_original_wholesale() {
        let extractor = ScriptedExtractor::new(vec![Ok(vec![
            event("ACC-1", "relutrigine"),
            event("ACC-1", "ulixacaltamide"),
        ])]);
        let validator = Arc::new(FixedValidator {
            feedback: Ok(ValidationFeedback {
                is_accurate: false,
                corrected_events: Some(vec![event("ACC-1", "vormatrigine")]),
            }),
        });
        let run = ExtractionRun::new(extractor, Some(validator), &fast_config());
        let events = run.run("readouts", &["p1".to_string()]).await.unwrap();
        assert_eq!(events, vec![event("ACC-1", "vormatrigine")]);
    }

    #[tokio::test]
    async fn test_validator_failure_falls_back_to_raw_batch() {
        let raw = vec![event("ACC-1", "relutrigine")];
        let extractor = ScriptedExtractor::new(vec![Ok(raw.clone())]);
        let validator = Arc::new(FixedValidator {
            feedback: Err(anyhow::anyhow!("service unavailable")),
        });
        let run = ExtractionRun::new(extractor, Some(validator), &fast_config());
        let events = run.run("readouts", &["p1".to_string()]).await.unwrap();
        assert_eq!(events, raw);
    }

    #[tokio::test]
    async fn test_accurate_batch_is_kept_unchanged() {
        let raw = vec![event("ACC-1", "relutrigine")];
        let extractor = ScriptedExtractor::new(vec![Ok(raw.clone())]);
        let validator = Arc::new(FixedValidator {
            feedback: Ok(ValidationFeedback {
                is_accurate: true,
                corrected_events: None,
            }),
        });
        let run = ExtractionRun::new(extractor, Some(validator), &fast_config());
        let events = run.run("readouts", &["p1".to_string()]).await.unwrap();
        assert_eq!(events, raw);
    }

    #[test]
    fn test_parse_events_accepts_object_and_array() {
        let obj = r#"{"events": [{"drug": "relutrigine"}]}"#;
        let arr = r#"[{"drug": "relutrigine"}]"#;
        assert_eq!(parse_events(obj).unwrap().len(), 1);
        assert_eq!(parse_events(arr).unwrap().len(), 1);
        assert_eq!(parse_events(obj).unwrap()[0].study, "not specified");
    }

    #[test]
    fn test_parse_events_strips_code_fences() {
        let fenced = "```json\n{\"events\": [{\"drug\": \"relutrigine\"}]}\n```";
        assert_eq!(parse_events(fenced).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_events_rejects_garbage() {
        assert!(parse_events("I found no events in the text.").is_none());
        assert!(parse_events("{\"foo\": 1}").is_none());
        assert!(parse_events("42").is_none());
    }

    fn openai_config(base: String) -> ExtractionConfig {
        ExtractionConfig {
            provider: "openai".to_string(),
            model: Some("gpt-4o".to_string()),
            api_key: Some("test-key".to_string()),
            api_base: base,
            timeout_secs: 5,
            ..ExtractionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_openai_extractor_parses_chat_response() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("Authorization", "Bearer test-key");
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"content":
                    "{\"events\": [{\"drug\": \"relutrigine\", \"phase\": \"Phase 2\"}]}"
                }}]
            }));
        });

        let extractor = OpenAiExtractor::new(&openai_config(server.base_url())).unwrap();
        let events = extractor.extract("readouts", "passage text").await.unwrap();

        mock.assert();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].drug, "relutrigine");
        assert_eq!(events[0].company, "not specified");
    }

    #[tokio::test]
    async fn test_openai_extractor_treats_malformed_content_as_empty() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"content": "no structured data here"}}]
            }));
        });

        let extractor = OpenAiExtractor::new(&openai_config(server.base_url())).unwrap();
        let events = extractor.extract("readouts", "passage text").await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_openai_extractor_surfaces_http_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(429).body("slow down");
        });

        let extractor = OpenAiExtractor::new(&openai_config(server.base_url())).unwrap();
        assert!(extractor.extract("readouts", "passage").await.is_err());
    }

    #[tokio::test]
    async fn test_openai_validator_parses_feedback() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(serde_json::json!({
                "choices": [{"message": {"content":
                    "{\"is_accurate\": false, \"corrected_events\": [{\"drug\": \"relutrigine\"}]}"
                }}]
            }));
        });

        let validator = OpenAiValidator::new(&openai_config(server.base_url())).unwrap();
        let feedback = validator.validate("passage", &[]).await.unwrap();
        assert!(!feedback.is_accurate);
        assert_eq!(feedback.corrected_events.unwrap().len(), 1);
    }
}
