//! Pattern Recognizer
//!
//! Clusters non-transfer debits by normalized merchant signature, classifies
//! each cluster's payment cadence, and annotates stop/start behavior.
//! Absence of a later payment cannot be proven from a bounded statement
//! period, so a cluster that goes quiet is "possibly ended", never "ended".

use crate::config::Settings;
use crate::models::{Frequency, Transaction};
use crate::normalize::merchant_key;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Cluster lifecycle within the observed statement period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Active,
    ResumedAfterPause,
    PossiblyEnded,
}

/// A gap in an otherwise regular payment stream, with payments resuming
/// afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseWindow {
    pub last_before: NaiveDate,
    pub first_after: NaiveDate,
    pub gap_days: i64,
}

/// Amount shift across a pause larger than the tolerance band: the
/// obligation was likely refinanced rather than replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinanceNote {
    pub old_amount: f64,
    pub new_amount: f64,
    pub change_pct: f64,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterPayment {
    pub date: NaiveDate,
    pub amount: f64,
}

/// One recurring-obligation cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringCluster {
    pub merchant: String,
    pub sample_description: String,
    pub payments: Vec<ClusterPayment>,
    pub mean_amount: f64,
    /// Largest relative deviation of any payment from the cluster mean.
    pub max_deviation_pct: f64,
    pub frequency: Frequency,
    pub modal_interval_days: i64,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub pauses: Vec<PauseWindow>,
    pub status: ClusterStatus,
    pub refinance: Option<RefinanceNote>,
}

impl RecurringCluster {
    pub fn occurrence_count(&self) -> usize {
        self.payments.len()
    }
}

pub struct PatternRecognizer {
    tolerance_pct: f64,
    min_occurrences: usize,
}

impl PatternRecognizer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            tolerance_pct: settings.amount_tolerance_pct,
            min_occurrences: settings.min_pattern_occurrences,
        }
    }

    /// Build recurring clusters from non-transfer debits. `period_end` is
    /// the last observed date in the statement period; it bounds the
    /// possibly-ended check.
    pub fn clusters(
        &self,
        transactions: &[Transaction],
        period_end: NaiveDate,
    ) -> Vec<RecurringCluster> {
        let mut groups: BTreeMap<String, Vec<&Transaction>> = BTreeMap::new();
        for txn in transactions {
            if txn.is_internal_transfer || !txn.is_debit() {
                continue;
            }
            let key = merchant_key(&txn.description);
            if key.is_empty() {
                continue;
            }
            groups.entry(key).or_default().push(txn);
        }

        let mut clusters = Vec::new();
        for (merchant, mut rows) in groups {
            if rows.len() < self.min_occurrences {
                continue;
            }
            rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
            clusters.push(self.build_cluster(merchant, &rows, period_end));
        }

        debug!(cluster_count = clusters.len(), "recurring clustering complete");
        clusters
    }

    fn build_cluster(
        &self,
        merchant: String,
        rows: &[&Transaction],
        period_end: NaiveDate,
    ) -> RecurringCluster {
        let payments: Vec<ClusterPayment> = rows
            .iter()
            .map(|t| ClusterPayment {
                date: t.date,
                amount: t.abs_amount(),
            })
            .collect();

        let mean_amount = payments.iter().map(|p| p.amount).sum::<f64>() / payments.len() as f64;
        let max_deviation_pct = if mean_amount > 0.0 {
            payments
                .iter()
                .map(|p| (p.amount - mean_amount).abs() / mean_amount)
                .fold(0.0, f64::max)
        } else {
            0.0
        };

        let gaps: Vec<i64> = payments
            .windows(2)
            .map(|w| (w[1].date - w[0].date).num_days())
            .filter(|g| *g > 0)
            .collect();
        let modal_interval = modal_gap(&gaps).unwrap_or(0);
        let frequency = classify_frequency(&gaps);

        let pause_threshold = (modal_interval.max(1)) * 2;
        let mut pauses = Vec::new();
        let mut refinance = None;
        for pair in payments.windows(2) {
            let gap = (pair[1].date - pair[0].date).num_days();
            if modal_interval > 0 && gap > pause_threshold {
                pauses.push(PauseWindow {
                    last_before: pair[0].date,
                    first_after: pair[1].date,
                    gap_days: gap,
                });

                // Amount shift across the pause beyond the tolerance band.
                if pair[0].amount > 0.0 {
                    let change = (pair[1].amount - pair[0].amount).abs() / pair[0].amount;
                    if change > self.tolerance_pct {
                        refinance = Some(RefinanceNote {
                            old_amount: pair[0].amount,
                            new_amount: pair[1].amount,
                            change_pct: change,
                            date: pair[1].date,
                        });
                    }
                }
            }
        }

        let first_seen = payments[0].date;
        let last_seen = payments[payments.len() - 1].date;

        let quiet_days = (period_end - last_seen).num_days();
        let status = if modal_interval > 0 && quiet_days > pause_threshold {
            ClusterStatus::PossiblyEnded
        } else if !pauses.is_empty() {
            ClusterStatus::ResumedAfterPause
        } else {
            ClusterStatus::Active
        };

        RecurringCluster {
            merchant,
            sample_description: rows[0].description.clone(),
            payments,
            mean_amount,
            max_deviation_pct,
            frequency,
            modal_interval_days: modal_interval,
            first_seen,
            last_seen,
            pauses,
            status,
            refinance,
        }
    }
}

/// Most common positive day gap between consecutive payments.
fn modal_gap(gaps: &[i64]) -> Option<i64> {
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for gap in gaps {
        *counts.entry(*gap).or_insert(0) += 1;
    }
    // Ties resolve to the smaller gap (BTreeMap iteration order).
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(gap, _)| gap)
}

fn classify_frequency(gaps: &[i64]) -> Frequency {
    if gaps.is_empty() {
        return Frequency::Irregular;
    }
    let mean = gaps.iter().sum::<i64>() as f64 / gaps.len() as f64;
    if mean <= 2.0 {
        Frequency::Daily
    } else if mean <= 10.0 {
        Frequency::Weekly
    } else if mean <= 35.0 {
        Frequency::Monthly
    } else {
        Frequency::Irregular
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn debit(day_offset: i64, amount: f64, description: &str) -> Transaction {
        let base = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        Transaction {
            id: Uuid::new_v4(),
            account: "1111".to_string(),
            date: base + chrono::Duration::days(day_offset),
            amount: -amount,
            description: description.to_string(),
            category: None,
            is_internal_transfer: false,
            matched_transfer_id: None,
            source_line: 0,
        }
    }

    fn recognizer() -> PatternRecognizer {
        PatternRecognizer::new(&Settings::default())
    }

    fn period_end(txns: &[Transaction]) -> NaiveDate {
        txns.iter().map(|t| t.date).max().unwrap()
    }

    #[test]
    fn weekly_debits_form_a_weekly_cluster() {
        let txns: Vec<Transaction> = (0..6)
            .map(|i| debit(i * 7, 1200.0, "ACH DEBIT XYZ CAPITAL FUNDING LLC"))
            .collect();

        let clusters = recognizer().clusters(&txns, period_end(&txns));
        assert_eq!(clusters.len(), 1);
        let cluster = &clusters[0];
        assert_eq!(cluster.merchant, "XYZ CAPITAL FUNDING");
        assert_eq!(cluster.frequency, Frequency::Weekly);
        assert_eq!(cluster.modal_interval_days, 7);
        assert_eq!(cluster.status, ClusterStatus::Active);
    }

    #[test]
    fn below_min_occurrences_is_not_recurring() {
        let txns: Vec<Transaction> = (0..3)
            .map(|i| debit(i * 7, 500.0, "SMALL LENDER LLC"))
            .collect();
        assert!(recognizer().clusters(&txns, period_end(&txns)).is_empty());
    }

    #[test]
    fn transfers_are_excluded_from_clustering() {
        let mut txns: Vec<Transaction> = (0..5)
            .map(|i| debit(i * 7, 800.0, "DAILY ACH LENDER"))
            .collect();
        for txn in &mut txns {
            txn.is_internal_transfer = true;
        }
        assert!(recognizer().clusters(&txns, period_end(&txns)).is_empty());
    }

    #[test]
    fn gap_with_resumption_is_a_pause_not_termination() {
        // Weekly payments, a 28-day hole, then the same signature resumes.
        let mut offsets: Vec<i64> = vec![0, 7, 14, 21];
        offsets.extend([49, 56, 63]);
        let txns: Vec<Transaction> = offsets
            .iter()
            .map(|d| debit(*d, 950.0, "FORWARD FINANCING ACH"))
            .collect();

        let clusters = recognizer().clusters(&txns, period_end(&txns));
        let cluster = &clusters[0];
        assert_eq!(cluster.status, ClusterStatus::ResumedAfterPause);
        assert_eq!(cluster.pauses.len(), 1);
        assert_eq!(cluster.pauses[0].gap_days, 28);
        assert!(cluster.refinance.is_none());
    }

    #[test]
    fn quiet_tail_is_possibly_ended() {
        // Payments stop four weeks before the statement period closes.
        let txns: Vec<Transaction> = (0..5)
            .map(|i| debit(i * 7, 700.0, "CREDIBLY PAYMENT"))
            .collect();
        let end = txns.iter().map(|t| t.date).max().unwrap() + chrono::Duration::days(28);

        let clusters = recognizer().clusters(&txns, end);
        assert_eq!(clusters[0].status, ClusterStatus::PossiblyEnded);
    }

    #[test]
    fn amount_shift_across_pause_is_annotated_as_refinance() {
        let mut txns: Vec<Transaction> = (0..4)
            .map(|i| debit(i * 7, 1000.0, "LIBERTAS FUNDING ACH"))
            .collect();
        // Resumes after a long gap at a 30% higher amount.
        txns.extend((0..3).map(|i| debit(42 + i * 7, 1300.0, "LIBERTAS FUNDING ACH")));

        let clusters = recognizer().clusters(&txns, period_end(&txns));
        let cluster = &clusters[0];
        let refinance = cluster.refinance.as_ref().expect("refinance note");
        assert!((refinance.change_pct - 0.30).abs() < 0.01);
        assert_eq!(cluster.status, ClusterStatus::ResumedAfterPause);
    }

    #[test]
    fn max_deviation_reflects_amount_spread() {
        let txns: Vec<Transaction> = vec![
            debit(0, 1000.0, "RAPID FINANCE"),
            debit(7, 1100.0, "RAPID FINANCE"),
            debit(14, 900.0, "RAPID FINANCE"),
            debit(21, 1000.0, "RAPID FINANCE"),
        ];
        let clusters = recognizer().clusters(&txns, period_end(&txns));
        assert!((clusters[0].max_deviation_pct - 0.10).abs() < 1e-9);
    }
}
