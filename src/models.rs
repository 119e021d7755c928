//! Core data models for the deal underwriting engine

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Account sentinel used when extraction could not identify an account number.
pub const UNKNOWN_SOURCE: &str = "UNKNOWN SOURCE";

//
// ================= Enums =================
//

/// Deal lifecycle states. `Approved` and `Rejected` are set by human action,
/// never by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    Extracting,
    Verifying,
    RetryPending,
    PendingApproval,
    NeedsHumanReview,
    Duplicate,
    Approved,
    Rejected,
}

impl DealStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DealStatus::PendingApproval
                | DealStatus::NeedsHumanReview
                | DealStatus::Duplicate
                | DealStatus::Approved
                | DealStatus::Rejected
        )
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DealStatus::Extracting => "Extracting",
            DealStatus::Verifying => "Verifying",
            DealStatus::RetryPending => "Retry Pending",
            DealStatus::PendingApproval => "Pending Approval",
            DealStatus::NeedsHumanReview => "Needs Human Review",
            DealStatus::Duplicate => "Duplicate",
            DealStatus::Approved => "Approved",
            DealStatus::Rejected => "Rejected",
        };
        write!(f, "{}", s)
    }
}

/// Payment cadence for recurring obligations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Irregular,
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Irregular => "irregular",
        };
        write!(f, "{}", s)
    }
}

/// How a vendor entry matches descriptions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Contains,
    Fuzzy,
}

//
// ================= Transaction =================
//

/// One extracted statement line. Immutable once persisted except for the
/// classification fields (`category`, `is_internal_transfer`,
/// `matched_transfer_id`), which only the analysis components mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    /// Extracted account number, or [`UNKNOWN_SOURCE`].
    pub account: String,
    pub date: NaiveDate,
    /// Signed amount: credits positive, debits negative.
    pub amount: f64,
    pub description: String,
    pub category: Option<String>,
    pub is_internal_transfer: bool,
    pub matched_transfer_id: Option<Uuid>,
    /// Line index in the extraction output this row came from.
    pub source_line: u32,
}

impl Transaction {
    pub fn is_credit(&self) -> bool {
        self.amount > 0.0
    }

    pub fn is_debit(&self) -> bool {
        self.amount < 0.0
    }

    pub fn abs_amount(&self) -> f64 {
        self.amount.abs()
    }
}

/// Accounts are a grouping view over a deal's transactions, keyed by the
/// extracted account number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub number: String,
    pub transactions: Vec<Transaction>,
}

/// Partition transactions by account, preserving input order within each.
pub fn partition_accounts(transactions: &[Transaction]) -> Vec<Account> {
    let mut accounts: Vec<Account> = Vec::new();
    for txn in transactions {
        match accounts.iter_mut().find(|a| a.number == txn.account) {
            Some(account) => account.transactions.push(txn.clone()),
            None => accounts.push(Account {
                number: txn.account.clone(),
                transactions: vec![txn.clone()],
            }),
        }
    }
    accounts
}

//
// ================= Statement Summary =================
//

/// Claimed totals from the statement's own summary section, as extracted.
/// These are audited against the line items, never trusted directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatementSummary {
    pub total_deposits: f64,
    pub deposits_count: u32,
    pub total_withdrawals: f64,
    pub withdrawals_count: u32,
    pub total_checks: f64,
    pub checks_count: u32,
    pub total_fees: f64,
    pub fees_count: u32,
    pub beginning_balance: Option<f64>,
    pub ending_balance: Option<f64>,
    pub account_number: Option<String>,
}

//
// ================= Deal =================
//

/// Persisted retry-loop state. Invariant: `attempts` never exceeds
/// `max_retry_attempts + 1` (the first extraction plus the retry budget).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryState {
    /// Extraction attempts made so far (first attempt included).
    pub attempts: u32,
    pub last_discrepancy: Option<String>,
}

/// Aggregate root for one underwriting submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub id: Uuid,
    pub sender: String,
    pub content_hash: String,
    pub status: DealStatus,
    pub summary: Option<StatementSummary>,
    pub transactions: Vec<Transaction>,
    pub retry: RetryState,
    /// Verification confidence in [0, 1]; 1.0 means a clean arithmetic pass.
    pub confidence: f64,
    /// Final computed underwriting metrics, once analysis has run.
    pub analysis: Option<serde_json::Value>,
    pub narrative: Option<String>,
    /// Append-only trail of engine decisions (`[RETRY n] …`, `[FINAL] …`).
    pub reasoning_log: Vec<String>,
    pub duplicate_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn new(sender: String, content_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sender,
            content_hash,
            status: DealStatus::Extracting,
            summary: None,
            transactions: Vec::new(),
            retry: RetryState::default(),
            confidence: 0.0,
            analysis: None,
            narrative: None,
            reasoning_log: Vec::new(),
            duplicate_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn log(&mut self, entry: impl Into<String>) {
        self.reasoning_log.push(entry.into());
        self.updated_at = Utc::now();
    }
}

//
// ================= Submission Contract =================
//

/// Inbound shape delivered by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub sender: String,
    pub document: Vec<u8>,
    pub content_hash: String,
}

/// Outbound shape returned to the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub deal_id: Uuid,
    pub status: DealStatus,
    pub retry_count: u32,
    pub account_number: Option<String>,
}

//
// ================= Learned State =================
//

/// A payee the system recognizes, shared read/write across all deals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownVendor {
    pub id: Uuid,
    /// Canonical name, stored normalized (uppercase, noise stripped).
    pub name: String,
    pub category: String,
    pub match_kind: MatchKind,
    pub is_mca_lender: bool,
    pub default_frequency: Option<Frequency>,
    /// Prior successful matches; used as the tie-break between equal scores.
    pub match_count: u64,
    pub created_at: DateTime<Utc>,
}

/// A generalized classification rule learned from a human correction.
/// Confidence is adjusted only through recorded applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldStandardRule {
    pub id: Uuid,
    /// Normalized merchant signature fragment this rule matches on.
    pub pattern: String,
    pub rule_type: String,
    pub original_classification: Option<String>,
    pub correct_classification: String,
    pub confidence: f64,
    pub times_applied: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An (original AI value, human-corrected value) pair scoped to a field.
/// Read-only once written; consumed as few-shot context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub id: Uuid,
    pub field: String,
    pub original_value: String,
    pub corrected_value: String,
    pub deal_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

//
// ================= Amount Parsing =================
//

/// Parse an extracted amount string. Accepts currency symbols, thousands
/// separators, and parenthesized or minus-prefixed negatives.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return None;
    }

    let parenthesized = trimmed.starts_with('(') && trimmed.ends_with(')');

    let mut cleaned = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        match ch {
            '0'..='9' | '.' => cleaned.push(ch),
            '-' if cleaned.is_empty() => cleaned.push(ch),
            '$' | ',' | ' ' | '(' | ')' | '+' => {}
            _ => return None,
        }
    }

    let value: f64 = cleaned.parse().ok()?;
    if parenthesized {
        Some(-value.abs())
    } else {
        Some(value)
    }
}

/// Cent-exact equality for dollar amounts.
pub fn amounts_equal_cents(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.005
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_amount_accepts_currency_formats() {
        assert_eq!(parse_amount("$1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("(1,234.56)"), Some(-1234.56));
        assert_eq!(parse_amount("-500"), Some(-500.0));
        assert_eq!(parse_amount("  $ 42 "), Some(42.0));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("-"), None);
        assert_eq!(parse_amount("N/A"), None);
    }

    #[test]
    fn cent_equality_tolerates_float_noise() {
        assert!(amounts_equal_cents(0.1 + 0.2, 0.3));
        assert!(!amounts_equal_cents(100.00, 100.01));
    }

    #[test]
    fn terminal_states_are_recognized() {
        assert!(DealStatus::PendingApproval.is_terminal());
        assert!(DealStatus::Duplicate.is_terminal());
        assert!(!DealStatus::Extracting.is_terminal());
        assert!(!DealStatus::RetryPending.is_terminal());
    }

    #[test]
    fn partition_groups_by_account() {
        let txn = |account: &str, amount: f64| Transaction {
            id: Uuid::new_v4(),
            account: account.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            amount,
            description: "TEST".to_string(),
            category: None,
            is_internal_transfer: false,
            matched_transfer_id: None,
            source_line: 0,
        };

        let accounts = partition_accounts(&[txn("1111", 10.0), txn("2222", -5.0), txn("1111", 3.0)]);
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].number, "1111");
        assert_eq!(accounts[0].transactions.len(), 2);
    }
}
