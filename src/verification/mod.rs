//! Statement verification
//!
//! Audits a statement's own claimed summary totals against the extracted
//! line items. Deterministic arithmetic enforcement; no advisory component
//! is allowed to waive a failed check.

use crate::config::Settings;
use crate::error::{Severity, UnderwritingError};
use crate::models::{StatementSummary, Transaction};
use crate::normalize::contains_keyword;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

const FEE_KEYWORDS: &[&str] = &[
    "FEE",
    "SERVICE CHARGE",
    "NSF",
    "OVERDRAFT",
    "MAINTENANCE",
    "ANALYSIS CHARGE",
];
const CHECK_KEYWORDS: &[&str] = &["CHECK", "CHK"];

/// Summary sections audited independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryCategory {
    Deposits,
    Withdrawals,
    Checks,
    Fees,
}

impl fmt::Display for SummaryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SummaryCategory::Deposits => "total_deposits",
            SummaryCategory::Withdrawals => "total_withdrawals",
            SummaryCategory::Checks => "total_checks",
            SummaryCategory::Fees => "total_fees",
        };
        write!(f, "{}", s)
    }
}

/// One claimed-vs-computed comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryTotals {
    pub category: SummaryCategory,
    pub claimed: f64,
    pub computed: f64,
    pub claimed_count: u32,
    pub computed_count: u32,
}

/// A comparison that fell outside tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discrepancy {
    pub category: SummaryCategory,
    pub claimed: f64,
    pub computed: f64,
    pub gap: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub totals: Vec<CategoryTotals>,
    pub discrepancies: Vec<Discrepancy>,
    /// Balance-equation failures warn; they never fail verification on
    /// their own because beginning/ending balances are often cropped out
    /// of scanned statements.
    pub balance_warning: Option<String>,
    pub confidence: f64,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.discrepancies.is_empty()
    }

    /// High-severity gaps drive the extraction retry loop.
    pub fn requires_retry(&self) -> bool {
        self.discrepancies
            .iter()
            .any(|d| d.severity == Severity::High)
    }

    /// The widest high-severity gap as the typed pipeline error; `None`
    /// when nothing is severe enough to drive a retry.
    pub fn retry_error(&self) -> Option<UnderwritingError> {
        self.discrepancies
            .iter()
            .filter(|d| d.severity == Severity::High)
            .max_by(|a, b| a.gap.partial_cmp(&b.gap).unwrap_or(std::cmp::Ordering::Equal))
            .map(|d| UnderwritingError::VerificationMismatch {
                category: d.category.to_string(),
                gap: d.gap,
                severity: d.severity,
            })
    }

    /// Targeted correction text for resubmission, naming each failing
    /// category and its dollar gap.
    pub fn correction_message(&self) -> Option<String> {
        if self.discrepancies.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .discrepancies
            .iter()
            .map(|d| {
                format!(
                    "{}: statement claims ${:.2} but line items sum to ${:.2} (gap ${:.2})",
                    d.category, d.claimed, d.computed, d.gap
                )
            })
            .collect();
        Some(format!(
            "The previous extraction failed arithmetic verification. Re-extract with attention to: {}",
            lines.join("; ")
        ))
    }
}

pub struct StatementVerifier {
    tolerance_pct: f64,
    tolerance_abs: f64,
    high_severity_threshold: f64,
}

impl StatementVerifier {
    pub fn new(settings: &Settings) -> Self {
        Self {
            tolerance_pct: settings.summary_tolerance_pct,
            tolerance_abs: settings.summary_tolerance_abs,
            high_severity_threshold: settings.high_severity_threshold,
        }
    }

    pub fn verify(
        &self,
        summary: &StatementSummary,
        transactions: &[Transaction],
    ) -> VerificationReport {
        let computed = compute_totals(transactions);

        let totals = vec![
            CategoryTotals {
                category: SummaryCategory::Deposits,
                claimed: summary.total_deposits,
                computed: computed.deposits,
                claimed_count: summary.deposits_count,
                computed_count: computed.deposits_count,
            },
            CategoryTotals {
                category: SummaryCategory::Withdrawals,
                claimed: summary.total_withdrawals,
                computed: computed.withdrawals,
                claimed_count: summary.withdrawals_count,
                computed_count: computed.withdrawals_count,
            },
            CategoryTotals {
                category: SummaryCategory::Checks,
                claimed: summary.total_checks,
                computed: computed.checks,
                claimed_count: summary.checks_count,
                computed_count: computed.checks_count,
            },
            CategoryTotals {
                category: SummaryCategory::Fees,
                claimed: summary.total_fees,
                computed: computed.fees,
                claimed_count: summary.fees_count,
                computed_count: computed.fees_count,
            },
        ];

        let mut discrepancies = Vec::new();
        for comparison in &totals {
            let gap = (comparison.claimed - comparison.computed).abs();
            let tolerance = (comparison.claimed.abs() * self.tolerance_pct).max(self.tolerance_abs);
            if gap > tolerance {
                let severity = if gap > self.high_severity_threshold {
                    Severity::High
                } else {
                    Severity::Medium
                };
                discrepancies.push(Discrepancy {
                    category: comparison.category,
                    claimed: comparison.claimed,
                    computed: comparison.computed,
                    gap,
                    severity,
                });
            }
        }

        let balance_warning = self.check_balance_equation(summary, &computed);
        let confidence = confidence_for(&discrepancies);

        info!(
            discrepancies = discrepancies.len(),
            confidence, "statement verification complete"
        );

        VerificationReport {
            totals,
            discrepancies,
            balance_warning,
            confidence,
        }
    }

    fn check_balance_equation(
        &self,
        summary: &StatementSummary,
        computed: &ComputedTotals,
    ) -> Option<String> {
        let beginning = summary.beginning_balance?;
        let ending = summary.ending_balance?;

        let expected = beginning + computed.deposits
            - computed.withdrawals
            - computed.checks
            - computed.fees;
        let gap = (expected - ending).abs();
        let tolerance = (ending.abs() * self.tolerance_pct).max(self.tolerance_abs);

        if gap > tolerance {
            Some(format!(
                "balance equation off by ${:.2}: beginning ${:.2} + activity implies ending ${:.2}, statement claims ${:.2}",
                gap, beginning, expected, ending
            ))
        } else {
            None
        }
    }
}

/// Confidence policy keyed to the worst discrepancy severity. High gaps
/// cost 0.15 each off a 0.5 cap; mediums only count when no high gap
/// exists, costing 0.1 each off a 0.9 cap.
fn confidence_for(discrepancies: &[Discrepancy]) -> f64 {
    if discrepancies.is_empty() {
        return 1.0;
    }
    let high_count = discrepancies
        .iter()
        .filter(|d| d.severity == Severity::High)
        .count() as f64;
    if high_count > 0.0 {
        (0.5 - 0.15 * high_count).max(0.0)
    } else {
        (0.9 - 0.1 * discrepancies.len() as f64).max(0.5)
    }
}

struct ComputedTotals {
    deposits: f64,
    deposits_count: u32,
    withdrawals: f64,
    withdrawals_count: u32,
    checks: f64,
    checks_count: u32,
    fees: f64,
    fees_count: u32,
}

/// Bucket line items the way bank summary sections do: credits are
/// deposits; debits split into fees, checks, and other withdrawals by
/// description. Internal transfers stay included because the statement's
/// own totals include them.
fn compute_totals(transactions: &[Transaction]) -> ComputedTotals {
    let mut totals = ComputedTotals {
        deposits: 0.0,
        deposits_count: 0,
        withdrawals: 0.0,
        withdrawals_count: 0,
        checks: 0.0,
        checks_count: 0,
        fees: 0.0,
        fees_count: 0,
    };

    for txn in transactions {
        if txn.is_credit() {
            totals.deposits += txn.amount;
            totals.deposits_count += 1;
        } else if contains_keyword(&txn.description, FEE_KEYWORDS) {
            totals.fees += txn.abs_amount();
            totals.fees_count += 1;
        } else if contains_keyword(&txn.description, CHECK_KEYWORDS) {
            totals.checks += txn.abs_amount();
            totals.checks_count += 1;
        } else {
            totals.withdrawals += txn.abs_amount();
            totals.withdrawals_count += 1;
        }
    }

    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn txn(amount: f64, description: &str) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            account: "1111".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 5, 10).unwrap(),
            amount,
            description: description.to_string(),
            category: None,
            is_internal_transfer: false,
            matched_transfer_id: None,
            source_line: 0,
        }
    }

    fn verifier() -> StatementVerifier {
        StatementVerifier::new(&Settings::default())
    }

    #[test]
    fn clean_statement_scores_full_confidence() {
        let summary = StatementSummary {
            total_deposits: 1500.0,
            total_withdrawals: 400.0,
            total_fees: 35.0,
            ..Default::default()
        };
        let txns = vec![
            txn(1000.0, "REMOTE DEPOSIT"),
            txn(500.0, "ACH CREDIT CUSTOMER"),
            txn(-400.0, "ACH DEBIT SUPPLIER"),
            txn(-35.0, "MONTHLY SERVICE FEE"),
        ];

        let report = verifier().verify(&summary, &txns);
        assert!(report.passed());
        assert!(!report.requires_retry());
        assert_eq!(report.confidence, 1.0);
        assert!(report.correction_message().is_none());
    }

    #[test]
    fn large_deposit_gap_is_high_severity_and_drives_retry() {
        // Statement claims $45,000 in deposits; lines only sum to $43,500.
        let summary = StatementSummary {
            total_deposits: 45_000.0,
            ..Default::default()
        };
        let txns = vec![txn(43_500.0, "REMOTE DEPOSIT")];

        let report = verifier().verify(&summary, &txns);
        assert!(!report.passed());
        assert!(report.requires_retry());
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].severity, Severity::High);
        assert!((report.discrepancies[0].gap - 1500.0).abs() < 0.01);
        assert!((report.confidence - 0.35).abs() < 1e-9);

        let message = report.correction_message().unwrap();
        assert!(message.contains("total_deposits"));
        assert!(message.contains("$1500.00"));
    }

    #[test]
    fn small_gap_is_medium_severity_and_does_not_retry() {
        let summary = StatementSummary {
            total_fees: 100.0,
            ..Default::default()
        };
        let txns = vec![txn(-60.0, "NSF FEE")];

        let report = verifier().verify(&summary, &txns);
        assert!(!report.passed());
        assert!(!report.requires_retry());
        assert_eq!(report.discrepancies[0].severity, Severity::Medium);
        assert!((report.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn transfer_debits_are_withdrawals_not_fees() {
        // "TRANSFER" must not trip the NSF keyword.
        let summary = StatementSummary {
            total_deposits: 5000.0,
            total_withdrawals: 5000.0,
            ..Default::default()
        };
        let txns = vec![
            txn(5000.0, "ONLINE TRANSFER IN"),
            txn(-5000.0, "ONLINE TRANSFER OUT"),
        ];

        let report = verifier().verify(&summary, &txns);
        assert!(report.passed());
        assert_eq!(report.confidence, 1.0);
    }

    #[test]
    fn mixed_severities_count_only_high_gaps_in_confidence() {
        // One $1,500 high gap plus one $40 medium gap scores as a single
        // high discrepancy.
        let summary = StatementSummary {
            total_deposits: 45_000.0,
            total_fees: 75.0,
            ..Default::default()
        };
        let txns = vec![
            txn(43_500.0, "REMOTE DEPOSIT"),
            txn(-35.0, "MONTHLY SERVICE FEE"),
        ];

        let report = verifier().verify(&summary, &txns);
        assert_eq!(report.discrepancies.len(), 2);
        assert!(report.requires_retry());
        assert!((report.confidence - 0.35).abs() < 1e-9);
    }

    #[test]
    fn high_gap_surfaces_as_a_typed_mismatch_error() {
        let summary = StatementSummary {
            total_deposits: 45_000.0,
            ..Default::default()
        };
        let txns = vec![txn(43_500.0, "REMOTE DEPOSIT")];

        let report = verifier().verify(&summary, &txns);
        let err = report.retry_error().expect("mismatch expected");
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            UnderwritingError::VerificationMismatch { .. }
        ));
        assert!(err.to_string().contains("total_deposits"));

        let clean = verifier().verify(
            &StatementSummary {
                total_deposits: 100.0,
                ..Default::default()
            },
            &[txn(100.0, "REMOTE DEPOSIT")],
        );
        assert!(clean.retry_error().is_none());
    }

    #[test]
    fn gaps_within_tolerance_pass() {
        // 1% of $45,000 is $450; a $200 gap is within tolerance.
        let summary = StatementSummary {
            total_deposits: 45_000.0,
            ..Default::default()
        };
        let txns = vec![txn(44_800.0, "REMOTE DEPOSIT")];
        assert!(verifier().verify(&summary, &txns).passed());
    }

    #[test]
    fn debits_split_into_fees_checks_and_withdrawals() {
        let summary = StatementSummary {
            total_withdrawals: 700.0,
            total_checks: 250.0,
            total_fees: 35.0,
            ..Default::default()
        };
        let txns = vec![
            txn(-700.0, "ACH DEBIT SUPPLIER"),
            txn(-250.0, "CHECK 1042"),
            txn(-35.0, "OVERDRAFT FEE"),
        ];
        assert!(verifier().verify(&summary, &txns).passed());
    }

    #[test]
    fn balance_equation_mismatch_warns_without_failing() {
        let summary = StatementSummary {
            total_deposits: 1000.0,
            beginning_balance: Some(5000.0),
            ending_balance: Some(9000.0),
            ..Default::default()
        };
        let txns = vec![txn(1000.0, "REMOTE DEPOSIT")];

        let report = verifier().verify(&summary, &txns);
        assert!(report.passed());
        assert!(report.balance_warning.is_some());
        assert_eq!(report.confidence, 1.0);
    }

    #[test]
    fn missing_balances_skip_the_equation_check() {
        let summary = StatementSummary {
            total_deposits: 1000.0,
            ..Default::default()
        };
        let txns = vec![txn(1000.0, "REMOTE DEPOSIT")];
        assert!(verifier().verify(&summary, &txns).balance_warning.is_none());
    }
}
