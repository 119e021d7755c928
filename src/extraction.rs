//! Document extraction service
//!
//! Seam to the external OCR/extraction vendor. Submission returns a job
//! handle; results arrive by polling. The engine never parses documents
//! itself, it only consumes extraction output and audits it afterward.

use crate::config::Settings;
use crate::error::UnderwritingError;
use crate::models::{amounts_equal_cents, StatementSummary, Transaction};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// One completed extraction: claimed summary plus line items, with the
/// vendor's per-field confidence where reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedStatement {
    pub summary: StatementSummary,
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub field_confidence: HashMap<String, f64>,
}

/// Poll result for an extraction job. Oversized documents come back as
/// overlapping chunks that merge into one statement.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Pending,
    Complete(ExtractedStatement),
    Chunked(Vec<ExtractedStatement>),
    Failed(String),
}

#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Submit a document, optionally with a correction message from a
    /// failed verification pass. Returns a job handle.
    async fn submit(&self, document: &[u8], correction: Option<&str>) -> Result<String>;

    async fn poll(&self, job: &str) -> Result<PollOutcome>;
}

/// Drive a job to completion under the configured poll interval and
/// ceiling. Expiry is a retryable timeout, not a fatal error.
pub async fn poll_to_completion(
    service: &dyn ExtractionService,
    job: &str,
    settings: &Settings,
) -> Result<ExtractedStatement> {
    let started = Instant::now();
    let ceiling = settings.poll_ceiling();

    loop {
        match service.poll(job).await? {
            PollOutcome::Complete(statement) => return Ok(statement),
            PollOutcome::Chunked(chunks) => {
                return merge_chunks(chunks).ok_or_else(|| {
                    UnderwritingError::ExtractionParseError(
                        "chunked job carried no chunks".to_string(),
                    )
                })
            }
            PollOutcome::Failed(reason) => {
                return Err(UnderwritingError::ExtractionParseError(reason))
            }
            PollOutcome::Pending => {}
        }

        if started.elapsed() >= ceiling {
            return Err(UnderwritingError::ExtractionTimeout(
                settings.extraction_poll_ceiling_secs,
            ));
        }
        tokio::time::sleep(settings.poll_interval()).await;
    }
}

/// Merge extraction chunks from an oversized document. Line items are
/// deduplicated on (account, date, amount, description); the summary comes
/// from the chunk reporting the most complete summary section.
pub fn merge_chunks(chunks: Vec<ExtractedStatement>) -> Option<ExtractedStatement> {
    let mut iter = chunks.into_iter();
    let mut merged = iter.next()?;

    for chunk in iter {
        for txn in chunk.transactions {
            let duplicate = merged.transactions.iter().any(|existing| {
                existing.account == txn.account
                    && existing.date == txn.date
                    && amounts_equal_cents(existing.amount, txn.amount)
                    && existing.description == txn.description
            });
            if !duplicate {
                merged.transactions.push(txn);
            }
        }
        if summary_completeness(&chunk.summary) > summary_completeness(&merged.summary) {
            merged.summary = chunk.summary;
        }
        for (field, confidence) in chunk.field_confidence {
            merged
                .field_confidence
                .entry(field)
                .and_modify(|c| *c = c.min(confidence))
                .or_insert(confidence);
        }
    }

    merged
        .transactions
        .sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.source_line.cmp(&b.source_line)));
    Some(merged)
}

fn summary_completeness(summary: &StatementSummary) -> u32 {
    let mut score = 0;
    score += (summary.total_deposits != 0.0) as u32;
    score += (summary.total_withdrawals != 0.0) as u32;
    score += (summary.total_checks != 0.0) as u32;
    score += (summary.total_fees != 0.0) as u32;
    score += summary.beginning_balance.is_some() as u32;
    score += summary.ending_balance.is_some() as u32;
    score += summary.account_number.is_some() as u32;
    score
}

//
// ================= HTTP Implementation =================
//

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    document_hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correction: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
    #[serde(default)]
    statement: Option<ExtractedStatement>,
    #[serde(default)]
    chunks: Vec<ExtractedStatement>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the hosted extraction API (connection-pooled).
pub struct HttpExtractionService {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpExtractionService {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl ExtractionService for HttpExtractionService {
    async fn submit(&self, document: &[u8], correction: Option<&str>) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(UnderwritingError::ServiceUnavailable(
                "EXTRACTION_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}/v1/statements", self.base_url);
        let request = SubmitRequest {
            document_hex: hex::encode(document),
            correction,
        };

        info!(correction = correction.is_some(), "Submitting extraction job");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Extraction submit failed: {}", e);
                UnderwritingError::ServiceUnavailable(format!("extraction submit: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Extraction API error response: {}", error_text);
            return Err(UnderwritingError::ServiceUnavailable(format!(
                "extraction submit: {}",
                error_text
            )));
        }

        let submitted: SubmitResponse = response.json().await.map_err(|e| {
            UnderwritingError::ExtractionParseError(format!("submit response: {}", e))
        })?;

        Ok(submitted.job_id)
    }

    async fn poll(&self, job: &str) -> Result<PollOutcome> {
        let url = format!("{}/v1/statements/{}", self.base_url, job);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| UnderwritingError::ServiceUnavailable(format!("extraction poll: {}", e)))?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(UnderwritingError::ServiceUnavailable(format!(
                "extraction poll: {}",
                error_text
            )));
        }

        let job_response: JobResponse = response.json().await.map_err(|e| {
            UnderwritingError::ExtractionParseError(format!("poll response: {}", e))
        })?;

        match job_response.status.as_str() {
            "pending" | "processing" => Ok(PollOutcome::Pending),
            "complete" => {
                if let Some(statement) = job_response.statement {
                    Ok(PollOutcome::Complete(statement))
                } else if !job_response.chunks.is_empty() {
                    Ok(PollOutcome::Chunked(job_response.chunks))
                } else {
                    Err(UnderwritingError::ExtractionParseError(
                        "complete job carried no statement".to_string(),
                    ))
                }
            }
            "failed" => Ok(PollOutcome::Failed(
                job_response.error.unwrap_or_else(|| "unspecified".to_string()),
            )),
            other => Err(UnderwritingError::ExtractionParseError(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

//
// ================= Scripted Implementation =================
//

/// Deterministic extraction double. Each submitted job consumes the next
/// scripted outcome in order; correction messages are captured for
/// assertion.
pub struct ScriptedExtraction {
    outcomes: Mutex<VecDeque<PollOutcome>>,
    corrections: Mutex<Vec<Option<String>>>,
}

impl ScriptedExtraction {
    pub fn new(outcomes: Vec<PollOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            corrections: Mutex::new(Vec::new()),
        }
    }

    /// Correction text passed with each submit call, in order.
    pub fn corrections(&self) -> Vec<Option<String>> {
        self.corrections.lock().unwrap().clone()
    }

    pub fn submit_count(&self) -> usize {
        self.corrections.lock().unwrap().len()
    }
}

#[async_trait]
impl ExtractionService for ScriptedExtraction {
    async fn submit(&self, _document: &[u8], correction: Option<&str>) -> Result<String> {
        let mut corrections = self.corrections.lock().unwrap();
        corrections.push(correction.map(str::to_string));
        Ok(format!("scripted-{}", corrections.len()))
    }

    async fn poll(&self, _job: &str) -> Result<PollOutcome> {
        let mut outcomes = self.outcomes.lock().unwrap();
        Ok(outcomes
            .pop_front()
            .unwrap_or(PollOutcome::Failed("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn statement(lines: Vec<(u32, f64, &str)>) -> ExtractedStatement {
        ExtractedStatement {
            summary: StatementSummary::default(),
            transactions: lines
                .into_iter()
                .map(|(day, amount, description)| Transaction {
                    id: Uuid::new_v4(),
                    account: "1111".to_string(),
                    date: NaiveDate::from_ymd_opt(2025, 4, day).unwrap(),
                    amount,
                    description: description.to_string(),
                    category: None,
                    is_internal_transfer: false,
                    matched_transfer_id: None,
                    source_line: day,
                })
                .collect(),
            field_confidence: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn scripted_jobs_consume_outcomes_in_order() {
        let scripted = ScriptedExtraction::new(vec![
            PollOutcome::Pending,
            PollOutcome::Complete(statement(vec![(1, 100.0, "DEPOSIT")])),
        ]);

        let job = scripted.submit(b"doc", None).await.unwrap();
        assert!(matches!(scripted.poll(&job).await.unwrap(), PollOutcome::Pending));
        assert!(matches!(
            scripted.poll(&job).await.unwrap(),
            PollOutcome::Complete(_)
        ));
    }

    #[tokio::test]
    async fn poll_to_completion_surfaces_failures_as_parse_errors() {
        let scripted =
            ScriptedExtraction::new(vec![PollOutcome::Failed("unreadable scan".to_string())]);
        let settings = Settings::default();

        let job = scripted.submit(b"doc", None).await.unwrap();
        let err = poll_to_completion(&scripted, &job, &settings).await.unwrap_err();
        assert!(matches!(err, UnderwritingError::ExtractionParseError(_)));
    }

    #[tokio::test]
    async fn chunked_jobs_merge_before_returning() {
        let first = statement(vec![(1, 100.0, "DEPOSIT A"), (2, -50.0, "DEBIT B")]);
        let mut second = statement(vec![(2, -50.0, "DEBIT B"), (3, 75.0, "DEPOSIT C")]);
        second.summary.ending_balance = Some(125.0);

        let scripted =
            ScriptedExtraction::new(vec![PollOutcome::Chunked(vec![first, second])]);
        let settings = Settings::default();

        let job = scripted.submit(b"big doc", None).await.unwrap();
        let merged = poll_to_completion(&scripted, &job, &settings).await.unwrap();
        assert_eq!(merged.transactions.len(), 3);
        assert_eq!(merged.summary.ending_balance, Some(125.0));
    }

    #[tokio::test]
    async fn empty_chunk_set_is_a_parse_error() {
        let scripted = ScriptedExtraction::new(vec![PollOutcome::Chunked(Vec::new())]);
        let settings = Settings::default();

        let job = scripted.submit(b"big doc", None).await.unwrap();
        let err = poll_to_completion(&scripted, &job, &settings).await.unwrap_err();
        assert!(matches!(err, UnderwritingError::ExtractionParseError(_)));
    }

    #[test]
    fn chunk_merge_deduplicates_overlap_rows() {
        let mut first = statement(vec![(1, 100.0, "DEPOSIT A"), (2, -50.0, "DEBIT B")]);
        first.summary.total_deposits = 100.0;

        // Overlapping page boundary repeats the day-2 row.
        let mut second = statement(vec![(2, -50.0, "DEBIT B"), (3, 75.0, "DEPOSIT C")]);
        second.summary.total_deposits = 175.0;
        second.summary.ending_balance = Some(125.0);

        let merged = merge_chunks(vec![first, second]).unwrap();
        assert_eq!(merged.transactions.len(), 3);
        // The more complete summary section wins.
        assert_eq!(merged.summary.ending_balance, Some(125.0));
    }

    #[test]
    fn merging_nothing_yields_nothing() {
        assert!(merge_chunks(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn corrections_are_recorded_per_submission() {
        let scripted = ScriptedExtraction::new(vec![]);
        scripted.submit(b"doc", None).await.unwrap();
        scripted.submit(b"doc", Some("deposits off by $1,500")).await.unwrap();

        let corrections = scripted.corrections();
        assert_eq!(corrections.len(), 2);
        assert!(corrections[0].is_none());
        assert_eq!(corrections[1].as_deref(), Some("deposits off by $1,500"));
    }
}
