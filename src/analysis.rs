//! Deal analysis
//!
//! Turns verified transactions and classified recurring clusters into the
//! underwriting metrics a reviewer acts on: income, existing advance
//! burden, affordability ratios, warnings, and the machine recommendation.
//! Every number here is deterministic arithmetic over the line items.

use crate::classifier::{Classification, PositionClass};
use crate::config::Settings;
use crate::models::{Frequency, Transaction};
use crate::normalize::{contains_keyword, merchant_key};
use crate::patterns::{ClusterStatus, RecurringCluster};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

/// Debits carrying these markers are bank costs netted out of income.
const DEDUCTION_KEYWORDS: &[&str] = &[
    "FEE",
    "CHARGE",
    "NSF",
    "OVERDRAFT",
    "RETURN",
    "REVERSAL",
];
const FUEL_KEYWORDS: &[&str] = &["DIESEL", "FUEL"];

/// Working days assumed per month for daily-remit advances.
const DAILY_PAYMENTS_PER_MONTH: f64 = 22.0;
const WEEKLY_PAYMENTS_PER_MONTH: f64 = 4.33;

/// Occurrences before an unmatched payee is worth a labeling prompt.
const MIN_CANDIDATE_OCCURRENCES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomeMetrics {
    /// Gross non-transfer credits.
    pub gross_income: f64,
    /// Fee, NSF, and reversal debits netted out of gross.
    pub deductions: f64,
    pub net_income: f64,
    pub months_observed: u32,
    pub monthly_average: f64,
    pub annualized: f64,
    pub nsf_count: u32,
}

/// Net revenue per observed calendar month.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthRevenue {
    pub year: i32,
    pub month: u32,
    pub revenue: f64,
}

/// One confirmed or suspected advance position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McaPosition {
    pub merchant: String,
    pub frequency: Frequency,
    pub payment_amount: f64,
    pub monthly_burden: f64,
    pub status: ClusterStatus,
    pub classification: PositionClass,
    pub confidence: f64,
    pub classified_by: String,
}

/// An unmatched payee recurring often enough to be worth labeling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelingCandidate {
    pub merchant: String,
    pub occurrences: u32,
    pub total_volume: f64,
}

/// Monthly fuel spend, reported when it marks a fuel-heavy operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuelProfile {
    pub monthly_spend: f64,
    pub heavy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderwritingRatios {
    /// Confirmed monthly advance payments as a percentage of income.
    pub payment_to_income_pct: f64,
    pub total_monthly_payments: f64,
    /// Income available before payments reach half of revenue.
    pub headroom: f64,
    /// Largest supportable new monthly payment.
    pub max_new_payment: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approve,
    Conditional,
    NeedsHumanReview,
    Decline,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Recommendation::Approve => "approve",
            Recommendation::Conditional => "conditional",
            Recommendation::NeedsHumanReview => "needs_human_review",
            Recommendation::Decline => "decline",
        };
        write!(f, "{}", s)
    }
}

/// Full analysis output attached to the deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderwritingAnalysis {
    /// `None` when the period contains no revenue to measure.
    pub income: Option<IncomeMetrics>,
    pub monthly_revenue: Vec<MonthRevenue>,
    pub positions: Vec<McaPosition>,
    pub ratios: Option<UnderwritingRatios>,
    pub fuel: Option<FuelProfile>,
    /// Recurring debits no vendor matched, worth a human label.
    pub labeling_candidates: Vec<LabelingCandidate>,
    pub warnings: Vec<String>,
    pub recommendation: Recommendation,
}

pub struct DealAnalyzer {
    settings: Settings,
}

impl DealAnalyzer {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    pub fn analyze(
        &self,
        transactions: &[Transaction],
        classified: &[(RecurringCluster, Classification)],
    ) -> UnderwritingAnalysis {
        let income = income_metrics(transactions);
        let monthly_revenue = monthly_revenue(transactions);
        let positions = build_positions(classified);
        let fuel = fuel_profile(transactions, &self.settings);
        let labeling_candidates = labeling_candidates(transactions);

        let confirmed_payments: f64 = positions
            .iter()
            .filter(|p| p.classification == PositionClass::ConfirmedMca)
            .map(|p| p.monthly_burden)
            .sum();

        let ratios = income.as_ref().map(|metrics| {
            let monthly = metrics.monthly_average;
            let ratio = if monthly > 0.0 {
                confirmed_payments / monthly * 100.0
            } else {
                0.0
            };
            let headroom = (monthly * 0.5 - confirmed_payments).max(0.0);
            UnderwritingRatios {
                payment_to_income_pct: ratio,
                total_monthly_payments: confirmed_payments,
                headroom,
                max_new_payment: headroom.min(monthly * 0.25),
            }
        });

        let warnings = self.collect_warnings(&income, &positions, &ratios, &fuel);
        let recommendation = recommend(&income, &ratios);

        info!(
            positions = positions.len(),
            warnings = warnings.len(),
            recommendation = %recommendation,
            "deal analysis complete"
        );

        UnderwritingAnalysis {
            income,
            monthly_revenue,
            positions,
            ratios,
            fuel,
            labeling_candidates,
            warnings,
            recommendation,
        }
    }

    fn collect_warnings(
        &self,
        income: &Option<IncomeMetrics>,
        positions: &[McaPosition],
        ratios: &Option<UnderwritingRatios>,
        fuel: &Option<FuelProfile>,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        let Some(metrics) = income else {
            warnings.push("no revenue observed in the statement period".to_string());
            if !positions.is_empty() {
                warnings.push(format!(
                    "{} advance positions found with no measurable income",
                    positions.len()
                ));
            }
            return warnings;
        };

        if let Some(r) = ratios {
            if r.payment_to_income_pct > 80.0 {
                warnings.push(format!(
                    "CRITICAL: advance payments consume {:.1}% of monthly income",
                    r.payment_to_income_pct
                ));
            } else if r.payment_to_income_pct > 50.0 {
                warnings.push(format!(
                    "advance payments consume {:.1}% of monthly income",
                    r.payment_to_income_pct
                ));
            }
        }

        if metrics.months_observed < 3 {
            warnings.push(format!(
                "only {} month(s) of statements observed; 3+ required for a confident read",
                metrics.months_observed
            ));
        }
        if metrics.monthly_average < self.settings.min_monthly_revenue {
            warnings.push(format!(
                "average monthly revenue ${:.2} is below the ${:.2} floor",
                metrics.monthly_average, self.settings.min_monthly_revenue
            ));
        }
        if metrics.annualized < self.settings.min_annual_income {
            warnings.push(format!(
                "annualized income ${:.2} is below the ${:.2} floor",
                metrics.annualized, self.settings.min_annual_income
            ));
        }
        if metrics.nsf_count > self.settings.max_nsf_count {
            warnings.push(format!(
                "{} NSF events exceed the tolerated {}",
                metrics.nsf_count, self.settings.max_nsf_count
            ));
        }

        let confirmed = positions
            .iter()
            .filter(|p| p.classification == PositionClass::ConfirmedMca)
            .count();
        if confirmed > 5 {
            warnings.push(format!("{} stacked advance positions", confirmed));
        }
        for position in positions {
            if position.classification == PositionClass::ConfirmedMca
                && position.status == ClusterStatus::PossiblyEnded
            {
                warnings.push(format!(
                    "position '{}' may have been paid off during the period",
                    position.merchant
                ));
            }
        }

        if let Some(profile) = fuel {
            if profile.heavy {
                warnings.push(format!(
                    "fuel-heavy operation: ${:.2}/month in diesel and fuel spend",
                    profile.monthly_spend
                ));
            }
        }

        warnings
    }
}

/// Income over non-transfer credits, net of fee and reversal debits.
/// `None` when the period shows no credits at all, which is a review
/// case rather than a zero.
pub fn income_metrics(transactions: &[Transaction]) -> Option<IncomeMetrics> {
    let gross: f64 = transactions
        .iter()
        .filter(|t| t.is_credit() && !t.is_internal_transfer)
        .map(|t| t.amount)
        .sum();
    if gross == 0.0 {
        return None;
    }

    let deductions: f64 = transactions
        .iter()
        .filter(|t| t.is_debit() && !t.is_internal_transfer)
        .filter(|t| contains_keyword(&t.description, DEDUCTION_KEYWORDS))
        .map(|t| t.abs_amount())
        .sum();

    let months: std::collections::BTreeSet<(i32, u32)> = transactions
        .iter()
        .map(|t| {
            use chrono::Datelike;
            (t.date.year(), t.date.month())
        })
        .collect();
    let months_observed = months.len().max(1) as u32;

    let net = gross - deductions;
    let monthly_average = net / months_observed as f64;

    let nsf_count = transactions
        .iter()
        .filter(|t| contains_keyword(&t.description, &["NSF"]))
        .count() as u32;

    Some(IncomeMetrics {
        gross_income: gross,
        deductions,
        net_income: net,
        months_observed,
        monthly_average,
        annualized: monthly_average * 12.0,
        nsf_count,
    })
}

/// Net revenue per calendar month, oldest first.
pub fn monthly_revenue(transactions: &[Transaction]) -> Vec<MonthRevenue> {
    use chrono::Datelike;

    let mut by_month: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for txn in transactions {
        if !txn.is_credit() || txn.is_internal_transfer {
            continue;
        }
        *by_month
            .entry((txn.date.year(), txn.date.month()))
            .or_insert(0.0) += txn.amount;
    }

    by_month
        .into_iter()
        .map(|((year, month), revenue)| MonthRevenue {
            year,
            month,
            revenue,
        })
        .collect()
}

/// Combine per-month revenue figures from overlapping statement chunks;
/// the larger figure for a shared month wins because a chunk can only
/// undercount a month it saw partially.
pub fn merge_monthly_revenue(sets: Vec<Vec<MonthRevenue>>) -> Vec<MonthRevenue> {
    let mut by_month: BTreeMap<(i32, u32), f64> = BTreeMap::new();
    for set in sets {
        for entry in set {
            let slot = by_month.entry((entry.year, entry.month)).or_insert(0.0);
            if entry.revenue > *slot {
                *slot = entry.revenue;
            }
        }
    }
    by_month
        .into_iter()
        .map(|((year, month), revenue)| MonthRevenue {
            year,
            month,
            revenue,
        })
        .collect()
}

fn build_positions(classified: &[(RecurringCluster, Classification)]) -> Vec<McaPosition> {
    classified
        .iter()
        .filter(|(_, c)| c.class != PositionClass::ConfirmedNotMca)
        .filter(|(_, c)| c.class != PositionClass::Unclassified)
        .map(|(cluster, classification)| McaPosition {
            merchant: cluster.merchant.clone(),
            frequency: cluster.frequency,
            payment_amount: cluster.mean_amount,
            monthly_burden: monthly_burden(cluster),
            status: cluster.status,
            classification: classification.class,
            confidence: classification.confidence,
            classified_by: classification.layer.to_string(),
        })
        .collect()
}

/// Monthly cash burden of one recurring obligation.
fn monthly_burden(cluster: &RecurringCluster) -> f64 {
    match cluster.frequency {
        Frequency::Daily => cluster.mean_amount * DAILY_PAYMENTS_PER_MONTH,
        Frequency::Weekly => cluster.mean_amount * WEEKLY_PAYMENTS_PER_MONTH,
        Frequency::Monthly => cluster.mean_amount,
        Frequency::Irregular => {
            // No cadence to project; spread the observed total over the
            // observed span.
            let days = (cluster.last_seen - cluster.first_seen).num_days().max(1) as f64;
            let total: f64 = cluster.payments.iter().map(|p| p.amount).sum();
            total / days * 30.0
        }
    }
}

/// Recurring debit payees with no vendor match, ordered by total dollar
/// volume so the costliest unknowns get labeled first.
pub fn labeling_candidates(transactions: &[Transaction]) -> Vec<LabelingCandidate> {
    let mut groups: BTreeMap<String, (u32, f64)> = BTreeMap::new();
    for txn in transactions {
        if !txn.is_debit() || txn.is_internal_transfer || txn.category.is_some() {
            continue;
        }
        let key = merchant_key(&txn.description);
        if key.is_empty() {
            continue;
        }
        let entry = groups.entry(key).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += txn.abs_amount();
    }

    let mut candidates: Vec<LabelingCandidate> = groups
        .into_iter()
        .filter(|(_, (occurrences, _))| *occurrences >= MIN_CANDIDATE_OCCURRENCES)
        .map(|(merchant, (occurrences, total_volume))| LabelingCandidate {
            merchant,
            occurrences,
            total_volume,
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.total_volume
            .partial_cmp(&a.total_volume)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
}

fn fuel_profile(transactions: &[Transaction], settings: &Settings) -> Option<FuelProfile> {
    use chrono::Datelike;

    let fuel_debits: Vec<&Transaction> = transactions
        .iter()
        .filter(|t| t.is_debit() && !t.is_internal_transfer)
        .filter(|t| contains_keyword(&t.description, FUEL_KEYWORDS))
        .collect();
    if fuel_debits.is_empty() {
        return None;
    }

    let months: std::collections::BTreeSet<(i32, u32)> = transactions
        .iter()
        .map(|t| (t.date.year(), t.date.month()))
        .collect();
    let total: f64 = fuel_debits.iter().map(|t| t.abs_amount()).sum();
    let monthly_spend = total / months.len().max(1) as f64;

    Some(FuelProfile {
        monthly_spend,
        heavy: monthly_spend > settings.diesel_monthly_threshold,
    })
}

/// Recommendation ladder, most severe first. Advisory only; a human sets
/// the final deal status.
fn recommend(
    income: &Option<IncomeMetrics>,
    ratios: &Option<UnderwritingRatios>,
) -> Recommendation {
    let Some(metrics) = income else {
        return Recommendation::NeedsHumanReview;
    };
    let ratio = ratios
        .as_ref()
        .map(|r| r.payment_to_income_pct)
        .unwrap_or(0.0);

    if ratio > 80.0 {
        Recommendation::Decline
    } else if metrics.months_observed < 3 {
        Recommendation::NeedsHumanReview
    } else if ratio > 50.0 {
        Recommendation::Conditional
    } else {
        Recommendation::Approve
    }
}
