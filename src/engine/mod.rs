//! Underwriting engine
//!
//! Orchestrates one deal from submission through extraction, arithmetic
//! verification with bounded retries, transfer and pattern analysis, and
//! the final reviewer-facing package. The engine never approves or
//! rejects; terminal machine states hand off to a human.

use crate::advisor::AdvisorService;
use crate::analysis::DealAnalyzer;
use crate::audit::{content_hash, AuditTrail};
use crate::classifier::{Classification, PositionClassifier};
use crate::config::Settings;
use crate::extraction::{poll_to_completion, ExtractedStatement, ExtractionService};
use crate::memory::PatternMemory;
use crate::models::{
    Deal, DealStatus, GoldStandardRule, Submission, SubmissionReceipt, UNKNOWN_SOURCE,
};
use crate::patterns::{PatternRecognizer, RecurringCluster};
use crate::state::DealStore;
use crate::transfers::TransferHunter;
use crate::vendors::VendorRegistry;
use crate::verification::StatementVerifier;
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct UnderwritingEngine {
    settings: Settings,
    extraction: Arc<dyn ExtractionService>,
    advisor: Arc<dyn AdvisorService>,
    vendors: Arc<VendorRegistry>,
    memory: Arc<PatternMemory>,
    deals: Arc<dyn DealStore>,
    audit: Arc<AuditTrail>,
    verifier: StatementVerifier,
    hunter: TransferHunter,
    recognizer: PatternRecognizer,
    classifier: PositionClassifier,
    analyzer: DealAnalyzer,
}

impl UnderwritingEngine {
    pub fn new(
        settings: Settings,
        extraction: Arc<dyn ExtractionService>,
        advisor: Arc<dyn AdvisorService>,
        vendors: Arc<VendorRegistry>,
        memory: Arc<PatternMemory>,
        deals: Arc<dyn DealStore>,
        audit: Arc<AuditTrail>,
    ) -> Self {
        let verifier = StatementVerifier::new(&settings);
        let hunter = TransferHunter::new(&settings);
        let recognizer = PatternRecognizer::new(&settings);
        let analyzer = DealAnalyzer::new(&settings);

        Self {
            settings,
            extraction,
            advisor,
            vendors,
            memory,
            deals,
            audit,
            verifier,
            hunter,
            recognizer,
            classifier: PositionClassifier::new(),
            analyzer,
        }
    }

    pub fn deals(&self) -> Arc<dyn DealStore> {
        self.deals.clone()
    }

    pub fn vendors(&self) -> Arc<VendorRegistry> {
        self.vendors.clone()
    }

    pub fn audit(&self) -> Arc<AuditTrail> {
        self.audit.clone()
    }

    /// Process one submission end to end.
    pub async fn process(&self, submission: Submission) -> Result<SubmissionReceipt> {
        let hash = if submission.content_hash.is_empty() {
            content_hash(&submission.document)
        } else {
            submission.content_hash.clone()
        };

        // Duplicate documents never consume an extraction budget.
        if let Some(original) = self.deals.find_by_hash(&hash).await? {
            let mut deal = Deal::new(submission.sender.clone(), hash);
            deal.status = DealStatus::Duplicate;
            deal.duplicate_of = Some(original.id);
            deal.log(format!(
                "[FINAL] duplicate of deal {} submitted {}",
                original.id, original.created_at
            ));
            self.deals.insert(deal.clone()).await?;
            self.audit
                .record(&deal, "duplicate", format!("duplicate of {}", original.id))
                .await?;
            info!(deal_id = %deal.id, original = %original.id, "duplicate submission");

            return Ok(SubmissionReceipt {
                deal_id: deal.id,
                status: DealStatus::Duplicate,
                retry_count: 0,
                account_number: None,
            });
        }

        let mut deal = Deal::new(submission.sender.clone(), hash);
        self.deals.insert(deal.clone()).await?;
        info!(deal_id = %deal.id, sender = %submission.sender, "deal opened");

        let max_attempts = self.settings.max_retry_attempts + 1;
        let mut correction: Option<String> = None;
        let mut verified: Option<ExtractedStatement> = None;

        while deal.retry.attempts < max_attempts {
            deal.retry.attempts += 1;
            let attempt = deal.retry.attempts;

            deal.status = DealStatus::Extracting;
            self.deals.update(&deal).await?;
            self.audit
                .record(&deal, "extraction", format!("attempt {}", attempt))
                .await?;

            let statement = match self.extract_once(&submission, correction.as_deref()).await {
                Ok(statement) => statement,
                Err(error) if error.is_retryable() => {
                    warn!(deal_id = %deal.id, attempt, "extraction failed: {}", error);
                    deal.retry.last_discrepancy = Some(error.to_string());
                    if deal.retry.attempts < max_attempts {
                        deal.status = DealStatus::RetryPending;
                        deal.log(format!("[RETRY {}] extraction failed: {}", attempt, error));
                        self.deals.update(&deal).await?;
                        correction = None;
                        // Transport and vendor hiccups get a growing pause
                        // before the resubmission.
                        tokio::time::sleep(self.settings.retry_backoff() * attempt).await;
                        continue;
                    }
                    deal.status = DealStatus::NeedsHumanReview;
                    deal.log(format!(
                        "[FINAL] extraction failed after {} attempts: {}",
                        attempt, error
                    ));
                    self.deals.update(&deal).await?;
                    self.audit
                        .record(&deal, "final", "extraction budget exhausted")
                        .await?;
                    return Ok(self.receipt(&deal));
                }
                Err(error) => return Err(error),
            };

            deal.status = DealStatus::Verifying;
            deal.summary = Some(statement.summary.clone());
            deal.transactions = statement.transactions.clone();
            self.deals.update(&deal).await?;

            let report = self.verifier.verify(&statement.summary, &statement.transactions);
            deal.confidence = report.confidence;
            self.audit
                .record(
                    &deal,
                    "verification",
                    format!(
                        "attempt {}: {} discrepancies, confidence {:.2}",
                        attempt,
                        report.discrepancies.len(),
                        report.confidence
                    ),
                )
                .await?;

            if let Some(mismatch) = report.retry_error() {
                self.audit
                    .record(&deal, "verification", mismatch.to_string())
                    .await?;
                let message = report
                    .correction_message()
                    .unwrap_or_else(|| mismatch.to_string());
                deal.retry.last_discrepancy = Some(message.clone());

                if deal.retry.attempts < max_attempts {
                    deal.status = DealStatus::RetryPending;
                    deal.log(format!("[RETRY {}] {}", attempt, message));
                    self.deals.update(&deal).await?;
                    correction = Some(message);
                    continue;
                }

                deal.status = DealStatus::NeedsHumanReview;
                deal.log(format!(
                    "[FINAL] verification still failing after {} attempts: {}",
                    attempt, message
                ));
                self.deals.update(&deal).await?;
                self.audit
                    .record(&deal, "final", "verification budget exhausted")
                    .await?;
                return Ok(self.receipt(&deal));
            }

            if let Some(warning) = &report.balance_warning {
                deal.log(format!("[WARN] {}", warning));
            }
            verified = Some(statement);
            break;
        }

        let statement = verified.ok_or_else(|| {
            crate::error::UnderwritingError::StateError(
                "verification loop ended without a statement".to_string(),
            )
        })?;

        self.finish(&mut deal, statement).await?;
        Ok(self.receipt(&deal))
    }

    async fn extract_once(
        &self,
        submission: &Submission,
        correction: Option<&str>,
    ) -> Result<ExtractedStatement> {
        let job = self
            .extraction
            .submit(&submission.document, correction)
            .await?;
        poll_to_completion(self.extraction.as_ref(), &job, &self.settings).await
    }

    /// Post-verification pipeline: transfers, vendor categories, recurring
    /// patterns, classification, metrics, narrative.
    async fn finish(&self, deal: &mut Deal, statement: ExtractedStatement) -> Result<()> {
        let mut transactions = statement.transactions;

        let pairs = self.hunter.mark_transfers(&mut transactions);
        if !pairs.is_empty() {
            deal.log(format!(
                "excluded {} internal transfer pair(s) from revenue",
                pairs.len()
            ));
        }

        for txn in transactions.iter_mut() {
            if txn.is_internal_transfer {
                txn.category = Some("Internal Transfer".to_string());
                continue;
            }
            if let Some(hit) = self.vendors.match_description(&txn.description).await? {
                txn.category = Some(hit.vendor.category.clone());
                self.vendors.record_match(hit.vendor.id).await?;
            }
        }

        let period_end = transactions
            .iter()
            .map(|t| t.date)
            .max()
            .unwrap_or_else(|| chrono::Utc::now().date_naive());
        let clusters = self.recognizer.clusters(&transactions, period_end);

        let mut classified: Vec<(RecurringCluster, Classification)> = Vec::new();
        for cluster in clusters {
            let classification = self
                .classifier
                .classify_with_rules(&cluster, &self.memory)
                .await?;
            classified.push((cluster, classification));
        }

        let analysis = self.analyzer.analyze(&transactions, &classified);
        if analysis.income.is_none() {
            // Not computable, not an error; the reviewer decides.
            let gap = crate::error::UnderwritingError::InsufficientData(
                "no non-transfer credits in the statement period".to_string(),
            );
            deal.log(format!("[WARN] {}", gap));
        }
        for warning in &analysis.warnings {
            deal.log(format!("[WARN] {}", warning));
        }

        deal.transactions = transactions;
        deal.analysis = Some(serde_json::to_value(&analysis)?);

        // Narrative is best effort; the arithmetic package stands alone.
        match self
            .advisor
            .narrative_summary(deal.analysis.as_ref().unwrap_or(&serde_json::Value::Null))
            .await
        {
            Ok(narrative) => deal.narrative = Some(narrative),
            Err(error) => {
                warn!(deal_id = %deal.id, "narrative generation failed: {}", error);
                deal.log(format!("[WARN] narrative unavailable: {}", error));
            }
        }

        deal.status = DealStatus::PendingApproval;
        deal.log(format!(
            "[FINAL] analysis complete after {} extraction attempt(s); recommendation: {}",
            deal.retry.attempts, analysis.recommendation
        ));
        self.deals.update(deal).await?;
        self.audit
            .record(
                deal,
                "final",
                format!("pending approval; recommendation {}", analysis.recommendation),
            )
            .await?;

        info!(deal_id = %deal.id, recommendation = %analysis.recommendation, "deal ready for review");
        Ok(())
    }

    fn receipt(&self, deal: &Deal) -> SubmissionReceipt {
        SubmissionReceipt {
            deal_id: deal.id,
            status: deal.status,
            retry_count: deal.retry.attempts.saturating_sub(1),
            account_number: deal
                .summary
                .as_ref()
                .and_then(|s| s.account_number.clone())
                .filter(|a| a != UNKNOWN_SOURCE),
        }
    }

    /// Learning flow for a human correction: record the example, ask the
    /// advisor to generalize it, and store the resulting rule at full
    /// confidence.
    pub async fn record_correction(
        &self,
        deal_id: Uuid,
        field: &str,
        original_value: &str,
        corrected_value: &str,
    ) -> Result<GoldStandardRule> {
        self.memory
            .add_example(field, original_value, corrected_value, Some(deal_id))
            .await?;

        let examples = self.memory.examples_for(field, 3).await?;
        let proposal = self
            .advisor
            .propose_rule(field, original_value, corrected_value, &examples)
            .await?;

        let rule = self
            .memory
            .add_rule(
                &proposal.pattern,
                &proposal.rule_type,
                Some(original_value),
                &proposal.correct_classification,
                1.0,
            )
            .await?;

        if let Some(deal) = self.deals.get(deal_id).await? {
            self.audit
                .record(
                    &deal,
                    "correction",
                    format!("rule '{}' learned from correction on {}", rule.pattern, field),
                )
                .await?;
        }

        info!(deal_id = %deal_id, pattern = %rule.pattern, "correction generalized into rule");
        Ok(rule)
    }
}
